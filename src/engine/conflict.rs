use chrono::NaiveDateTime;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Server wall-clock time. Booking dates and hours are local to the venue.
pub(crate) fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// The unique-slot check. Caller must hold the field's write lock between
/// this check and the insert.
pub(crate) fn check_slot_free(fs: &FieldState, slot: &Slot) -> Result<(), EngineError> {
    if fs.holder_of(slot).is_some() {
        return Err(EngineError::SlotTaken {
            field_id: fs.field.id,
            slot: *slot,
        });
    }
    Ok(())
}

/// Trim and require a non-empty value no longer than `max`.
pub(crate) fn required_text(value: &str, what: &str, max: usize) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::missing(what));
    }
    if trimmed.len() > max {
        return Err(EngineError::Validation(format!("{what} is too long (max {max})")));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn optional_text(value: &str, what: &str, max: usize) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.len() > max {
        return Err(EngineError::Validation(format!("{what} is too long (max {max})")));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn normalize_email(email: &str) -> Result<String, EngineError> {
    let email = required_text(email, "email", crate::limits::MAX_EMAIL_LEN)?.to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(EngineError::Validation(format!("malformed email: {email}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn slot_free_then_taken() {
        let mut fs = FieldState::new(Field {
            id: Ulid::new(),
            name: "Sur".into(),
            surface_type: "synthetic".into(),
            price: 0,
            available_hours: vec![],
            image: String::new(),
            location: String::new(),
        });
        let slot = Slot::new(parse_date("2025-06-10").unwrap(), parse_clock("20:00").unwrap());
        assert!(check_slot_free(&fs, &slot).is_ok());
        fs.claim(slot, Ulid::new());
        assert!(matches!(
            check_slot_free(&fs, &slot),
            Err(EngineError::SlotTaken { .. })
        ));
    }

    #[test]
    fn required_text_trims_and_rejects_blank() {
        assert_eq!(required_text("  Ana  ", "name", 10).unwrap(), "Ana");
        assert!(matches!(required_text("   ", "name", 10), Err(EngineError::Validation(_))));
        assert!(required_text("abcdefghijk", "name", 10).is_err());
        assert_eq!(optional_text("", "phone", 10).unwrap(), "");
    }

    #[test]
    fn email_normalized() {
        assert_eq!(normalize_email(" Ana@Example.COM ").unwrap(), "ana@example.com");
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("").is_err());
    }
}
