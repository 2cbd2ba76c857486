use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::password::verify_password;

use super::availability::availability;
use super::conflict::{local_now, normalize_email};
use super::{Engine, EngineError};

/// Listed in place of the field name once a field has been deleted.
pub const DELETED_FIELD_NAME: &str = "(deleted field)";

impl Engine {
    // ── Users ────────────────────────────────────────────

    /// Unknown email and wrong password fail identically.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<UserInfo, EngineError> {
        let email = normalize_email(email).map_err(|_| EngineError::InvalidCredentials)?;
        let user = self
            .emails
            .get(&email)
            .and_then(|id| self.users.get(id.value()).map(|u| u.value().clone()))
            .ok_or(EngineError::InvalidCredentials)?;

        let candidate = password.to_string();
        let stored = user.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || verify_password(&candidate, &stored))
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?
            .map_err(|e| EngineError::Internal(format!("stored password hash unreadable: {e}")))?;
        if !verified {
            return Err(EngineError::InvalidCredentials);
        }
        Ok(UserInfo::from(&user))
    }

    // ── Field catalog ────────────────────────────────────

    pub async fn get_field(&self, id: Ulid) -> Result<Field, EngineError> {
        let fs = self
            .get_field_state(&id)
            .ok_or(EngineError::NotFound("field", id))?;
        let guard = fs.read().await;
        Ok(guard.field.clone())
    }

    /// All fields, ordered by name.
    pub async fn list_fields(&self) -> Vec<Field> {
        let states: Vec<_> = self.fields.iter().map(|e| e.value().clone()).collect();
        let mut fields = Vec::with_capacity(states.len());
        for fs in states {
            fields.push(fs.read().await.field.clone());
        }
        fields.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        fields
    }

    async fn field_name(&self, id: &Ulid) -> String {
        match self.get_field_state(id) {
            Some(fs) => fs.read().await.field.name.clone(),
            None => DELETED_FIELD_NAME.to_string(),
        }
    }

    // ── Availability ─────────────────────────────────────

    /// Seven-day grid of one field starting at `anchor` (today when `None`).
    pub async fn field_availability(
        &self,
        field_id: Ulid,
        anchor: Option<NaiveDate>,
    ) -> Result<FieldAvailability, EngineError> {
        let anchor = anchor.unwrap_or_else(|| local_now().date());
        let fs = self
            .get_field_state(&field_id)
            .ok_or(EngineError::NotFound("field", field_id))?;
        let guard = fs.read().await;
        Ok(FieldAvailability {
            field_id,
            field_name: guard.field.name.clone(),
            days: availability(&guard, anchor),
        })
    }

    /// Grids for every field, ordered by field name.
    pub async fn catalog_availability(&self, anchor: Option<NaiveDate>) -> Vec<FieldAvailability> {
        let anchor = anchor.unwrap_or_else(|| local_now().date());
        let states: Vec<_> = self.fields.iter().map(|e| e.value().clone()).collect();
        let mut grids = Vec::with_capacity(states.len());
        for fs in states {
            let guard = fs.read().await;
            grids.push(FieldAvailability {
                field_id: guard.field.id,
                field_name: guard.field.name.clone(),
                days: availability(&guard, anchor),
            });
        }
        grids.sort_by(|a, b| a.field_name.cmp(&b.field_name).then(a.field_id.cmp(&b.field_id)));
        grids
    }

    // ── Reservations ─────────────────────────────────────

    pub fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|r| r.value().clone())
    }

    /// A user's reservations, newest date first.
    pub async fn user_reservations(&self, user_id: Ulid) -> Vec<ReservationInfo> {
        let mine: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.value().clone())
            .collect();
        self.with_field_names(mine).await
    }

    pub async fn all_reservations(&self) -> Vec<ReservationInfo> {
        let all: Vec<Reservation> = self.reservations.iter().map(|r| r.value().clone()).collect();
        self.with_field_names(all).await
    }

    async fn with_field_names(&self, mut reservations: Vec<Reservation>) -> Vec<ReservationInfo> {
        reservations.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then(b.start_time.cmp(&a.start_time))
                .then(b.created_at.cmp(&a.created_at))
        });
        let mut out = Vec::with_capacity(reservations.len());
        for reservation in reservations {
            let field_name = self.field_name(&reservation.field_id).await;
            out.push(ReservationInfo {
                reservation,
                field_name,
            });
        }
        out
    }

    // ── Messages ─────────────────────────────────────────

    /// Newest first.
    pub fn list_messages(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.messages.iter().map(|m| m.value().clone()).collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        messages
    }
}
