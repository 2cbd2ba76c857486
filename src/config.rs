use std::path::PathBuf;

const PREFIX: &str = "FUTBOLFLEX_";

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: String, value: String, reason: String },
    Incomplete(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => write!(f, "invalid {var}={value:?}: {reason}"),
            ConfigError::Incomplete(msg) => write!(f, "incomplete configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Admin account created at startup when it does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Connection password for regular (non-admin) logins.
    pub password: String,
    pub admin_user: String,
    pub admin_password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any `FUTBOLFLEX_*` lookup. Unset and empty values take the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(&format!("{PREFIX}{key}")).filter(|v| !v.trim().is_empty());

        let password = get("PASSWORD").unwrap_or_else(|| "futbolflex".into());
        let admin_password = get("ADMIN_PASSWORD").ok_or_else(|| {
            ConfigError::Incomplete(format!("{PREFIX}ADMIN_PASSWORD must be set"))
        })?;
        if admin_password == password {
            return Err(invalid(
                "ADMIN_PASSWORD",
                "<redacted>",
                format!("must differ from {PREFIX}PASSWORD"),
            ));
        }

        let tls_cert = get("TLS_CERT");
        let tls_key = get("TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::Incomplete(format!(
                "both {PREFIX}TLS_CERT and {PREFIX}TLS_KEY must be set, or neither"
            )));
        }

        let bootstrap_admin = match (get("BOOTSTRAP_ADMIN_EMAIL"), get("BOOTSTRAP_ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(BootstrapAdmin { email, password }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Incomplete(format!(
                    "both {PREFIX}BOOTSTRAP_ADMIN_EMAIL and {PREFIX}BOOTSTRAP_ADMIN_PASSWORD must be set, or neither"
                )));
            }
        };

        let max_connections: usize = parse_or(&get, "MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(invalid("MAX_CONNECTIONS", "0", "must be at least 1"));
        }

        Ok(Self {
            port: parse_or(&get, "PORT", 5433)?,
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password,
            admin_user: get("ADMIN_USER").unwrap_or_else(|| "admin".into()),
            admin_password,
            max_connections,
            compact_threshold: parse_or(&get, "COMPACT_THRESHOLD", 1000)?,
            tls_cert,
            tls_key,
            metrics_port: get("METRICS_PORT")
                .map(|v| parse_value("METRICS_PORT", &v))
                .transpose()?,
            bootstrap_admin,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("futbolflex.wal")
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var: format!("{PREFIX}{key}"),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| invalid(key, value, e.to_string()))
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(v) => parse_value(key, &v),
        None => Ok(default),
    }
}
