//! Booking-window and cancellation rules. Pure functions of their inputs.

use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};

use crate::model::Slot;

use super::EngineError;

pub const FIRST_BOOKABLE_HOUR: u32 = 17;
pub const LAST_BOOKABLE_HOUR: u32 = 23;

/// Days covered by an availability query, anchor included.
pub const AVAILABILITY_DAYS: u64 = 7;

pub const CANCELLATION_NOTICE_HOURS: i64 = 24;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// The hour labels offered for booking: 17:00 through 23:00.
pub fn booking_hours() -> impl Iterator<Item = NaiveTime> {
    (FIRST_BOOKABLE_HOUR..=LAST_BOOKABLE_HOUR).filter_map(|h| NaiveTime::from_hms_opt(h, 0, 0))
}

/// Slots are whole hours; `18:30` is not a label.
pub fn check_booking_hour(start_time: NaiveTime) -> Result<(), EngineError> {
    if start_time.minute() != 0 || start_time.second() != 0 {
        return Err(EngineError::Validation(format!(
            "start_time must be on the hour, got {}",
            start_time.format("%H:%M")
        )));
    }
    let hour = start_time.hour();
    if !(FIRST_BOOKABLE_HOUR..=LAST_BOOKABLE_HOUR).contains(&hour) {
        return Err(EngineError::OutsideBookingHours(hour));
    }
    Ok(())
}

/// A slot starting exactly now is still bookable.
pub fn check_not_past(slot: &Slot, now: NaiveDateTime) -> Result<(), EngineError> {
    if slot.starts_at() < now {
        return Err(EngineError::InThePast(*slot));
    }
    Ok(())
}

pub fn cancellation_cutoff(starts_at: NaiveDateTime) -> NaiveDateTime {
    starts_at - Duration::hours(CANCELLATION_NOTICE_HOURS)
}

/// Hours until `starts_at`, rounded half up (2.5 → 3, -2.5 → -2).
pub fn hours_left(starts_at: NaiveDateTime, now: NaiveDateTime) -> i64 {
    let ms = (starts_at - now).num_milliseconds() as f64;
    (ms / MS_PER_HOUR + 0.5).floor() as i64
}

pub fn check_cancellation_window(starts_at: NaiveDateTime, now: NaiveDateTime) -> Result<(), EngineError> {
    if now >= cancellation_cutoff(starts_at) {
        return Err(EngineError::CancellationWindowClosed {
            hours_left: hours_left(starts_at, now),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{parse_clock, parse_date};

    fn at(date: &str, time: &str) -> NaiveDateTime {
        parse_date(date).unwrap().and_time(parse_clock(time).unwrap())
    }

    #[test]
    fn booking_hours_are_seventeen_to_twentythree() {
        let labels: Vec<String> = booking_hours().map(|t| t.format("%H:%M").to_string()).collect();
        assert_eq!(
            labels,
            vec!["17:00", "18:00", "19:00", "20:00", "21:00", "22:00", "23:00"]
        );
    }

    #[test]
    fn booking_hour_bounds() {
        assert!(check_booking_hour(parse_clock("17:00").unwrap()).is_ok());
        assert!(check_booking_hour(parse_clock("23:00").unwrap()).is_ok());
        assert!(matches!(
            check_booking_hour(parse_clock("16:00").unwrap()),
            Err(EngineError::OutsideBookingHours(16))
        ));
        assert!(matches!(
            check_booking_hour(parse_clock("00:00").unwrap()),
            Err(EngineError::OutsideBookingHours(0))
        ));
    }

    #[test]
    fn booking_hour_must_be_whole() {
        for time in ["18:30", "19:45", "23:01"] {
            assert!(
                matches!(check_booking_hour(parse_clock(time).unwrap()), Err(EngineError::Validation(_))),
                "{time} should be rejected"
            );
        }
        // Still validation, not a policy error, when also out of range.
        assert!(matches!(
            check_booking_hour(parse_clock("16:30").unwrap()),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn past_slot_rejected() {
        let slot = Slot::new(parse_date("2025-06-10").unwrap(), parse_clock("18:00").unwrap());
        assert!(check_not_past(&slot, at("2025-06-10", "17:59")).is_ok());
        assert!(check_not_past(&slot, at("2025-06-10", "18:00")).is_ok());
        assert!(matches!(
            check_not_past(&slot, at("2025-06-10", "18:01")),
            Err(EngineError::InThePast(_))
        ));
    }

    #[test]
    fn cutoff_is_24_hours_before() {
        assert_eq!(
            cancellation_cutoff(at("2099-01-01", "20:00")),
            at("2098-12-31", "20:00")
        );
    }

    #[test]
    fn cancellation_allowed_well_before() {
        assert!(check_cancellation_window(at("2099-01-01", "20:00"), at("2098-12-30", "00:00")).is_ok());
    }

    #[test]
    fn cancellation_rejected_inside_window() {
        let err = check_cancellation_window(at("2099-01-01", "20:00"), at("2098-12-31", "23:30")).unwrap_err();
        match err {
            EngineError::CancellationWindowClosed { hours_left } => assert_eq!(hours_left, 21),
            other => panic!("expected CancellationWindowClosed, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_rejected_exactly_at_cutoff() {
        let err = check_cancellation_window(at("2099-01-01", "20:00"), at("2098-12-31", "20:00")).unwrap_err();
        assert!(matches!(err, EngineError::CancellationWindowClosed { hours_left: 24 }));
    }

    #[test]
    fn cancellation_allowed_one_minute_before_cutoff() {
        assert!(check_cancellation_window(at("2099-01-01", "20:00"), at("2098-12-31", "19:59")).is_ok());
    }

    #[test]
    fn hours_left_rounds_half_up() {
        let start = at("2025-06-10", "20:00");
        assert_eq!(hours_left(start, at("2025-06-10", "17:30")), 3); // 2.5
        assert_eq!(hours_left(start, at("2025-06-10", "17:45")), 2); // 2.25
        assert_eq!(hours_left(start, at("2025-06-10", "22:30")), -2); // -2.5
        assert_eq!(hours_left(start, start), 0);
    }
}
