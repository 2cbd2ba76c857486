use ulid::Ulid;

use crate::model::Slot;

/// Broad failure class, used to pick the SQLSTATE a client sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    NotFound,
    Conflict,
    Authorization,
    Policy,
    Internal,
}

#[derive(Debug)]
pub enum EngineError {
    Validation(String),
    NotFound(&'static str, Ulid),
    AlreadyExists(Ulid),
    EmailTaken(String),
    SlotTaken {
        field_id: Ulid,
        slot: Slot,
    },
    Forbidden(&'static str),
    InvalidCredentials,
    OutsideBookingHours(u32),
    InThePast(Slot),
    AlreadyCancelled(Ulid),
    CancellationWindowClosed {
        hours_left: i64,
    },
    LimitExceeded(&'static str),
    WalError(String),
    Internal(String),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorClass::Validation,
            EngineError::NotFound(..) => ErrorClass::NotFound,
            EngineError::AlreadyExists(_)
            | EngineError::EmailTaken(_)
            | EngineError::SlotTaken { .. } => ErrorClass::Conflict,
            EngineError::Forbidden(_) | EngineError::InvalidCredentials => ErrorClass::Authorization,
            EngineError::OutsideBookingHours(_)
            | EngineError::InThePast(_)
            | EngineError::AlreadyCancelled(_)
            | EngineError::CancellationWindowClosed { .. } => ErrorClass::Policy,
            EngineError::WalError(_) | EngineError::Internal(_) => ErrorClass::Internal,
        }
    }

    pub(crate) fn missing(what: &str) -> Self {
        EngineError::Validation(format!("missing required value: {what}"))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(kind, id) => write!(f, "{kind} not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::EmailTaken(email) => write!(f, "email already registered: {email}"),
            EngineError::SlotTaken { field_id, slot } => write!(
                f,
                "field {field_id} is already booked for {slot}; please choose another time"
            ),
            EngineError::Forbidden(msg) => write!(f, "permission denied: {msg}"),
            EngineError::InvalidCredentials => write!(f, "invalid credentials"),
            EngineError::OutsideBookingHours(hour) => write!(
                f,
                "hour {hour} is outside the booking window: fields can only be booked between 17:00 and 23:00"
            ),
            EngineError::InThePast(slot) => {
                write!(f, "cannot book {slot}: that date and time has already passed")
            }
            EngineError::AlreadyCancelled(id) => write!(f, "reservation {id} is already cancelled"),
            EngineError::CancellationWindowClosed { hours_left } => write!(
                f,
                "cannot cancel: cancellations require at least 24 hours notice, only {hours_left} hour(s) left"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
