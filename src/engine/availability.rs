use std::collections::HashSet;
use std::ops::RangeInclusive;

use chrono::{Days, NaiveDate};

use crate::model::*;

use super::policy::{booking_hours, AVAILABILITY_DAYS};

/// The dates of the rolling window starting at `anchor`.
pub fn window_days(anchor: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    (0..AVAILABILITY_DAYS).filter_map(move |i| anchor.checked_add_days(Days::new(i)))
}

pub fn window_range(anchor: NaiveDate) -> RangeInclusive<NaiveDate> {
    let last = window_days(anchor).last().unwrap_or(anchor);
    anchor..=last
}

/// Per-day, per-hour availability of one field over the window starting at `anchor`.
///
/// A slot is free iff no confirmed reservation holds `(date, hour label)`.
/// Reservations starting off the hour (e.g. 18:30) never match a label.
pub fn availability(field: &FieldState, anchor: NaiveDate) -> Vec<DayAvailability> {
    let booked: HashSet<&Slot> = field.confirmed_between(window_range(anchor)).collect();

    window_days(anchor)
        .map(|date| {
            let slots: Vec<SlotAvailability> = booking_hours()
                .map(|start_time| SlotAvailability {
                    start_time,
                    available: !booked.contains(&Slot::new(date, start_time)),
                })
                .collect();
            let available_count = slots.iter().filter(|s| s.available).count();
            DayAvailability {
                date,
                available_count,
                slots,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn field_state() -> FieldState {
        FieldState::new(Field {
            id: Ulid::new(),
            name: "Norte".into(),
            surface_type: "grass".into(),
            price: 20_000,
            available_hours: vec![],
            image: String::new(),
            location: String::new(),
        })
    }

    fn book(fs: &mut FieldState, d: &str, t: &str) {
        assert!(fs.claim(Slot::new(date(d), parse_clock(t).unwrap()), Ulid::new()));
    }

    #[test]
    fn window_is_seven_consecutive_days() {
        let days: Vec<_> = window_days(date("2025-06-28")).collect();
        assert_eq!(days.len(), 7);
        assert_eq!(days[0], date("2025-06-28"));
        assert_eq!(days[3], date("2025-07-01"));
        assert_eq!(days[6], date("2025-07-04"));
        assert_eq!(window_range(date("2025-06-28")), date("2025-06-28")..=date("2025-07-04"));
    }

    #[test]
    fn empty_field_is_fully_available() {
        let fs = field_state();
        let days = availability(&fs, date("2025-06-10"));
        assert_eq!(days.len(), 7);
        for day in &days {
            assert_eq!(day.slots.len(), 7);
            assert_eq!(day.available_count, 7);
            assert!(day.slots.iter().all(|s| s.available));
        }
    }

    #[test]
    fn single_booking_blocks_one_slot() {
        let mut fs = field_state();
        book(&mut fs, "2025-06-10", "18:00");
        let days = availability(&fs, date("2025-06-10"));

        let first = &days[0];
        assert_eq!(first.date, date("2025-06-10"));
        assert_eq!(first.is_available(parse_clock("18:00").unwrap()), Some(false));
        assert_eq!(first.available_count, 6);
        for label in ["17:00", "19:00", "20:00", "21:00", "22:00", "23:00"] {
            assert_eq!(first.is_available(parse_clock(label).unwrap()), Some(true), "{label}");
        }
        assert!(days[1..].iter().all(|d| d.available_count == 7));
    }

    #[test]
    fn bookings_outside_window_ignored() {
        let mut fs = field_state();
        book(&mut fs, "2025-06-09", "18:00"); // day before anchor
        book(&mut fs, "2025-06-17", "18:00"); // anchor + 7
        let days = availability(&fs, date("2025-06-10"));
        assert!(days.iter().all(|d| d.available_count == 7));
    }

    #[test]
    fn last_day_of_window_counted() {
        let mut fs = field_state();
        book(&mut fs, "2025-06-16", "23:00");
        book(&mut fs, "2025-06-16", "17:00");
        let days = availability(&fs, date("2025-06-10"));
        assert_eq!(days[6].available_count, 5);
        assert_eq!(days[6].is_available(parse_clock("23:00").unwrap()), Some(false));
    }

    #[test]
    fn off_hour_booking_does_not_match_label() {
        let mut fs = field_state();
        book(&mut fs, "2025-06-10", "18:30");
        let days = availability(&fs, date("2025-06-10"));
        assert_eq!(days[0].available_count, 7);
    }

    #[test]
    fn fully_booked_day() {
        let mut fs = field_state();
        for label in ["17:00", "18:00", "19:00", "20:00", "21:00", "22:00", "23:00"] {
            book(&mut fs, "2025-06-12", label);
        }
        let days = availability(&fs, date("2025-06-10"));
        assert_eq!(days[2].available_count, 0);
        assert!(days[2].slots.iter().all(|s| !s.available));
    }
}
