use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Connection-level credentials. The admin login has its own password;
/// every other login name shares the regular one.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub password: String,
    pub admin_user: String,
    pub admin_password: String,
}

impl Credentials {
    pub fn is_admin(&self, user: Option<&str>) -> bool {
        user == Some(self.admin_user.as_str())
    }

    pub fn password_for(&self, user: Option<&str>) -> &str {
        if self.is_admin(user) {
            &self.admin_password
        } else {
            &self.password
        }
    }
}

#[derive(Debug)]
pub struct FutbolflexAuthSource {
    credentials: Credentials,
}

impl FutbolflexAuthSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for FutbolflexAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user();
        let user = user.as_deref();
        let password = self.credentials.password_for(user);
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            password: "cancha".into(),
            admin_user: "admin".into(),
            admin_password: "arbitro".into(),
        }
    }

    #[test]
    fn admin_login_uses_admin_password() {
        let c = credentials();
        assert!(c.is_admin(Some("admin")));
        assert_eq!(c.password_for(Some("admin")), "arbitro");
    }

    #[test]
    fn other_logins_share_regular_password() {
        let c = credentials();
        assert!(!c.is_admin(Some("ana")));
        assert!(!c.is_admin(None));
        assert_eq!(c.password_for(Some("ana")), "cancha");
        assert_eq!(c.password_for(None), "cancha");
    }
}
