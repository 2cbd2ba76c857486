use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::dispatch::Confirmation;
use crate::limits::*;
use crate::model::*;
use crate::notify::FIELDS_CHANNEL;
use crate::password::hash_password;

use super::conflict::{check_slot_free, local_now, normalize_email, now_ms, optional_text, required_text};
use super::policy::{check_booking_hour, check_cancellation_window, check_not_past};
use super::{Engine, EngineError, WalCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub password: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewField {
    pub id: Ulid,
    pub name: String,
    pub surface_type: String,
    pub price: i64,
    pub available_hours: Vec<HourWindow>,
    pub image: String,
    pub location: String,
}

/// A booking request. Contact details are copied onto the reservation as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub field_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    /// Defaults to `start_time`.
    pub end_time: Option<NaiveTime>,
    pub user_name: String,
    pub user_email: String,
    pub user_phone: String,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub subject: String,
    pub body: String,
    pub user_id: Option<Ulid>,
}

fn validate_hours(hours: &[HourWindow]) -> Result<(), EngineError> {
    if hours.len() > MAX_HOUR_WINDOWS {
        return Err(EngineError::LimitExceeded("too many available-hour windows"));
    }
    Ok(())
}

fn validate_price(price: i64) -> Result<(), EngineError> {
    if price < 0 {
        return Err(EngineError::Validation("price must not be negative".into()));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), EngineError> {
    if password.is_empty() {
        return Err(EngineError::missing("password"));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(EngineError::LimitExceeded("password too long"));
    }
    Ok(())
}

impl Engine {
    // ── Users ────────────────────────────────────────────

    pub async fn register_user(&self, req: NewUser) -> Result<UserInfo, EngineError> {
        let name = required_text(&req.name, "name", MAX_NAME_LEN)?;
        let email = normalize_email(&req.email)?;
        let phone = required_text(&req.phone, "phone", MAX_PHONE_LEN)?;
        validate_password(&req.password)?;
        self.insert_user(req.id, name, email, req.password, phone, Role::User)
            .await
    }

    /// Create the admin account unless the email is already registered.
    pub async fn ensure_admin(&self, email: &str, password: &str, name: &str) -> Result<UserInfo, EngineError> {
        let email = normalize_email(email)?;
        if let Some(id) = self.emails.get(&email).map(|e| *e.value())
            && let Some(user) = self.users.get(&id)
        {
            if user.role != Role::Admin {
                warn!(email = %email, "bootstrap admin email belongs to a regular user");
            }
            return Ok(UserInfo::from(user.value()));
        }
        let name = required_text(name, "name", MAX_NAME_LEN)?;
        validate_password(password)?;
        let info = self
            .insert_user(Ulid::new(), name, email, password.to_string(), String::new(), Role::Admin)
            .await?;
        info!(email = %info.email, "admin account created");
        Ok(info)
    }

    async fn insert_user(
        &self,
        id: Ulid,
        name: String,
        email: String,
        password: String,
        phone: String,
        role: Role,
    ) -> Result<UserInfo, EngineError> {
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?
            .map_err(|e| EngineError::Internal(format!("password hashing failed: {e}")))?;

        let _gate = self.commit_gate.read().await;
        let _registration = self.registration_lock.lock().await;
        if self.emails.contains_key(&email) {
            return Err(EngineError::EmailTaken(email));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let user = User {
            id,
            name,
            email,
            password_hash,
            phone,
            role,
        };
        let info = UserInfo::from(&user);
        self.persist_and_apply(None, &Event::UserRegistered { user })
            .await?;
        Ok(info)
    }

    // ── Field catalog ────────────────────────────────────

    pub async fn create_field(&self, req: NewField) -> Result<Field, EngineError> {
        let name = required_text(&req.name, "name", MAX_NAME_LEN)?;
        let surface_type = required_text(&req.surface_type, "surface_type", MAX_TEXT_LEN)?;
        validate_price(req.price)?;
        validate_hours(&req.available_hours)?;
        let image = optional_text(&req.image, "image", MAX_TEXT_LEN)?;
        let location = optional_text(&req.location, "location", MAX_TEXT_LEN)?;

        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.fields.len() >= MAX_FIELDS {
            return Err(EngineError::LimitExceeded("too many fields"));
        }
        if self.fields.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let field = Field {
            id: req.id,
            name,
            surface_type,
            price: req.price,
            available_hours: req.available_hours,
            image,
            location,
        };
        self.wal_append(&Event::FieldCreated { field: field.clone() })
            .await?;
        self.fields
            .insert(field.id, Arc::new(RwLock::new(FieldState::new(field.clone()))));

        self.publish(CatalogEventKind::Created, &field);
        info!(field = %field.id, name = %field.name, "field created");
        Ok(field)
    }

    pub async fn update_field(&self, id: Ulid, patch: FieldPatch) -> Result<Field, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::Validation("nothing to update".into()));
        }
        let mut patch = patch;
        if let Some(name) = &patch.name {
            patch.name = Some(required_text(name, "name", MAX_NAME_LEN)?);
        }
        if let Some(surface_type) = &patch.surface_type {
            patch.surface_type = Some(required_text(surface_type, "surface_type", MAX_TEXT_LEN)?);
        }
        if let Some(price) = patch.price {
            validate_price(price)?;
        }
        if let Some(hours) = &patch.available_hours {
            validate_hours(hours)?;
        }
        if let Some(image) = &patch.image {
            patch.image = Some(optional_text(image, "image", MAX_TEXT_LEN)?);
        }
        if let Some(location) = &patch.location {
            patch.location = Some(optional_text(location, "location", MAX_TEXT_LEN)?);
        }

        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_field(id).await?;
        let mut field = guard.field.clone();
        patch.apply_to(&mut field);

        self.persist_and_apply(Some(&mut *guard), &Event::FieldUpdated { field: field.clone() })
            .await?;
        drop(guard);

        self.publish(CatalogEventKind::Updated, &field);
        info!(field = %field.id, "field updated");
        Ok(field)
    }

    /// Remove a field from the catalog. Its reservations are kept as history.
    pub async fn delete_field(&self, id: Ulid) -> Result<Field, EngineError> {
        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let guard = self.lock_field(id).await?;

        self.wal_append(&Event::FieldDeleted { id }).await?;
        self.fields.remove(&id);
        let field = guard.field.clone();
        drop(guard);

        self.publish(CatalogEventKind::Deleted, &field);
        info!(field = %id, name = %field.name, "field deleted");
        Ok(field)
    }

    fn publish(&self, kind: CatalogEventKind, field: &Field) {
        self.notify
            .send(FIELDS_CHANNEL, &CatalogEvent::field(kind, field, now_ms()));
    }

    // ── Reservations ─────────────────────────────────────

    pub async fn create_reservation(&self, req: NewReservation) -> Result<Reservation, EngineError> {
        self.create_reservation_at(req, local_now()).await
    }

    /// Book a slot as of `now`. The slot check and the insert happen under the
    /// field's write lock, so concurrent requests for one slot have one winner.
    pub async fn create_reservation_at(
        &self,
        req: NewReservation,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let contact = ContactSnapshot {
            name: required_text(&req.user_name, "user_name", MAX_NAME_LEN)?,
            email: required_text(&req.user_email, "user_email", MAX_EMAIL_LEN)?,
            phone: required_text(&req.user_phone, "user_phone", MAX_PHONE_LEN)?,
        };
        if !self.users.contains_key(&req.user_id) {
            return Err(EngineError::NotFound("user", req.user_id));
        }
        if self.get_field_state(&req.field_id).is_none() {
            return Err(EngineError::NotFound("field", req.field_id));
        }
        let slot = Slot::new(req.date, req.start_time);
        check_booking_hour(slot.start_time)?;
        check_not_past(&slot, now)?;

        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_field(req.field_id).await?;
        if let Err(e) = check_slot_free(&guard, &slot) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }
        if self.reservations.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let reservation = Reservation {
            id: req.id,
            user_id: req.user_id,
            field_id: req.field_id,
            date: slot.date,
            start_time: slot.start_time,
            end_time: req.end_time.unwrap_or(slot.start_time),
            contact,
            status: ReservationStatus::Confirmed,
            payment_method: req.payment_method,
            qr_code: Some(format!("QR-{}-{}", Ulid::new(), req.user_id)),
            created_at: now_ms(),
        };
        self.persist_and_apply(
            Some(&mut *guard),
            &Event::ReservationCreated {
                reservation: reservation.clone(),
            },
        )
        .await?;
        let field_name = guard.field.name.clone();
        drop(guard);

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(reservation = %reservation.id, field = %reservation.field_id, slot = %slot, "reservation confirmed");

        self.spawn_confirmation(Confirmation {
            reservation: reservation.clone(),
            field_name,
        });
        Ok(reservation)
    }

    /// Hand the confirmation to the dispatcher without waiting on it.
    fn spawn_confirmation(&self, confirmation: Confirmation) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch(&confirmation).await {
                metrics::counter!(crate::observability::CONFIRMATION_FAILURES_TOTAL).increment(1);
                warn!(reservation = %confirmation.reservation.id, error = %e, "confirmation dispatch failed");
            }
        });
    }

    pub async fn cancel_reservation(&self, id: Ulid, caller: Ulid) -> Result<Reservation, EngineError> {
        self.cancel_reservation_at(id, caller, local_now()).await
    }

    pub async fn cancel_reservation_at(
        &self,
        id: Ulid,
        caller: Ulid,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let field_id = self
            .reservations
            .get(&id)
            .map(|r| r.field_id)
            .ok_or(EngineError::NotFound("reservation", id))?;

        let _gate = self.commit_gate.read().await;
        let mut field_guard = match self.lock_field(field_id).await {
            Ok(guard) => Some(guard),
            Err(EngineError::NotFound(..)) => None,
            Err(e) => return Err(e),
        };
        let _orphan = match field_guard {
            Some(_) => None,
            None => Some(self.orphan_lock.lock().await),
        };

        // Re-read under the lock: a concurrent cancel may have won.
        let current = self
            .reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound("reservation", id))?;
        if current.user_id != caller {
            return Err(EngineError::Forbidden("only the owner can cancel a reservation"));
        }
        match current.status {
            ReservationStatus::Confirmed => {}
            ReservationStatus::Cancelled => return Err(EngineError::AlreadyCancelled(id)),
            ReservationStatus::Pending => {
                return Err(EngineError::Validation(format!("reservation {id} is not confirmed")));
            }
        }
        check_cancellation_window(current.starts_at(), now)?;

        self.persist_and_apply(
            field_guard.as_deref_mut(),
            &Event::ReservationCancelled { id, field_id },
        )
        .await?;

        metrics::counter!(crate::observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        info!(reservation = %id, field = %field_id, "reservation cancelled");
        self.reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound("reservation", id))
    }

    // ── Messages ─────────────────────────────────────────

    pub async fn post_message(&self, req: NewMessage) -> Result<Message, EngineError> {
        let name = required_text(&req.name, "name", MAX_NAME_LEN)?;
        let email = normalize_email(&req.email)?;
        let phone = optional_text(&req.phone, "phone", MAX_PHONE_LEN)?;
        let subject = required_text(&req.subject, "subject", MAX_TEXT_LEN)?;
        let body = required_text(&req.body, "body", MAX_MESSAGE_BODY_LEN)?;
        if let Some(user_id) = req.user_id
            && !self.users.contains_key(&user_id)
        {
            return Err(EngineError::NotFound("user", user_id));
        }
        if self.messages.len() >= MAX_MESSAGES {
            return Err(EngineError::LimitExceeded("too many messages"));
        }
        if self.messages.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let message = Message {
            id: req.id,
            name,
            email,
            phone,
            subject,
            body,
            user_id: req.user_id,
            created_at: now_ms(),
        };
        let _gate = self.commit_gate.read().await;
        self.persist_and_apply(None, &Event::MessagePosted { message: message.clone() })
            .await?;
        info!(message = %message.id, "contact message received");
        Ok(message)
    }

    pub async fn delete_message(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.messages.contains_key(&id) {
            return Err(EngineError::NotFound("message", id));
        }
        let _gate = self.commit_gate.read().await;
        self.persist_and_apply(None, &Event::MessageDeleted { id })
            .await
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|user| Event::UserRegistered { user }));

        let states: Vec<_> = self.fields.iter().map(|e| e.value().clone()).collect();
        let mut fields = Vec::with_capacity(states.len());
        for fs in states {
            fields.push(fs.read().await.field.clone());
        }
        fields.sort_by_key(|f| f.id);
        events.extend(fields.into_iter().map(|field| Event::FieldCreated { field }));

        let mut reservations: Vec<Reservation> = self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationCreated { reservation }),
        );

        let mut messages: Vec<Message> = self.messages.iter().map(|e| e.value().clone()).collect();
        messages.sort_by_key(|m| m.id);
        events.extend(messages.into_iter().map(|message| Event::MessagePosted { message }));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
