use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for creation timestamps and event times.
pub type Ms = i64;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const CLOCK_FORMAT: &str = "%H:%M";

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

/// Parse an `HH:MM` wall-clock time.
pub fn parse_clock(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), CLOCK_FORMAT).ok()
}

pub fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

pub fn format_clock(t: NaiveTime) -> String {
    t.format(CLOCK_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Never produced by the writer; kept so stored records can carry it.
    Pending,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PaymentMethod {
    #[default]
    Transfer,
    Card,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::Card => "card",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "transfer" => Some(PaymentMethod::Transfer),
            "card" => Some(PaymentMethod::Card),
            _ => None,
        }
    }
}

/// An opening window advertised on a field, e.g. `17:00-23:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl HourWindow {
    pub fn parse(s: &str) -> Option<Self> {
        let (start, end) = s.split_once('-')?;
        let start = parse_clock(start)?;
        let end = parse_clock(end)?;
        (start < end).then_some(Self { start, end })
    }

    /// Parse a comma-separated list. Empty input is an empty list.
    pub fn parse_list(s: &str) -> Option<Vec<Self>> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn format_list(windows: &[HourWindow]) -> String {
        windows
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for HourWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_clock(self.start), format_clock(self.end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub id: Ulid,
    pub name: String,
    pub surface_type: String,
    /// Hourly price in whole currency units.
    pub price: i64,
    pub available_hours: Vec<HourWindow>,
    /// Image reference. File name only; images live elsewhere.
    pub image: String,
    pub location: String,
}

/// Partial update of a field. `None` leaves the attribute untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPatch {
    pub name: Option<String>,
    pub surface_type: Option<String>,
    pub price: Option<i64>,
    pub available_hours: Option<Vec<HourWindow>>,
    pub image: Option<String>,
    pub location: Option<String>,
}

impl FieldPatch {
    pub fn is_empty(&self) -> bool {
        *self == FieldPatch::default()
    }

    pub fn apply_to(&self, field: &mut Field) {
        if let Some(name) = &self.name {
            field.name = name.clone();
        }
        if let Some(surface_type) = &self.surface_type {
            field.surface_type = surface_type.clone();
        }
        if let Some(price) = self.price {
            field.price = price;
        }
        if let Some(hours) = &self.available_hours {
            field.available_hours = hours.clone();
        }
        if let Some(image) = &self.image {
            field.image = image.clone();
        }
        if let Some(location) = &self.location {
            field.location = location.clone();
        }
    }
}

/// Who booked, as they were at booking time. Never re-synced with the user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// One bookable hour on a field: the unique key for confirmed reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
}

impl Slot {
    pub fn new(date: NaiveDate, start_time: NaiveTime) -> Self {
        Self { date, start_time }
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", format_date(self.date), format_clock(self.start_time))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub field_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub contact: ContactSnapshot,
    pub status: ReservationStatus,
    pub payment_method: PaymentMethod,
    /// Cleared on cancellation.
    pub qr_code: Option<String>,
    pub created_at: Ms,
}

impl Reservation {
    pub fn slot(&self) -> Slot {
        Slot::new(self.date, self.start_time)
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.slot().starts_at()
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    /// Normalized: trimmed and lowercased.
    pub email: String,
    /// Argon2id PHC string.
    pub password_hash: String,
    pub phone: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub subject: String,
    pub body: String,
    pub user_id: Option<Ulid>,
    pub created_at: Ms,
}

/// A field plus the unique index of its confirmed slots.
#[derive(Debug, Clone)]
pub struct FieldState {
    pub field: Field,
    /// Confirmed slot → reservation id. At most one entry per slot.
    pub confirmed: BTreeMap<Slot, Ulid>,
}

impl FieldState {
    pub fn new(field: Field) -> Self {
        Self {
            field,
            confirmed: BTreeMap::new(),
        }
    }

    pub fn holder_of(&self, slot: &Slot) -> Option<Ulid> {
        self.confirmed.get(slot).copied()
    }

    /// Claim a slot. Returns false (and changes nothing) when it is already held.
    pub fn claim(&mut self, slot: Slot, reservation_id: Ulid) -> bool {
        match self.confirmed.entry(slot) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(reservation_id);
                true
            }
        }
    }

    /// Release a slot, but only if `reservation_id` is the one holding it.
    pub fn release(&mut self, slot: &Slot, reservation_id: Ulid) -> bool {
        if self.confirmed.get(slot) == Some(&reservation_id) {
            self.confirmed.remove(slot);
            true
        } else {
            false
        }
    }

    /// Confirmed slots whose date falls inside `dates`.
    pub fn confirmed_between(&self, dates: RangeInclusive<NaiveDate>) -> impl Iterator<Item = &Slot> {
        let lo = Slot::new(*dates.start(), NaiveTime::MIN);
        let hi_date = *dates.end();
        self.confirmed
            .range(lo..)
            .map(|(slot, _)| slot)
            .take_while(move |slot| slot.date <= hi_date)
    }
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        user: User,
    },
    FieldCreated {
        field: Field,
    },
    FieldUpdated {
        field: Field,
    },
    FieldDeleted {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationCancelled {
        id: Ulid,
        field_id: Ulid,
    },
    MessagePosted {
        message: Message,
    },
    MessageDeleted {
        id: Ulid,
    },
}

// ── Catalog notifications ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogEventKind {
    Created,
    Updated,
    Deleted,
    Ping,
}

/// What listeners on the `fields` channel receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEvent {
    pub kind: CatalogEventKind,
    pub field_id: Option<Ulid>,
    pub name: Option<String>,
    pub at: Ms,
}

impl CatalogEvent {
    pub fn field(kind: CatalogEventKind, field: &Field, at: Ms) -> Self {
        Self {
            kind,
            field_id: Some(field.id),
            name: Some(field.name.clone()),
            at,
        }
    }

    pub fn ping(at: Ms) -> Self {
        Self {
            kind: CatalogEventKind::Ping,
            field_id: None,
            name: None,
            at,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self.kind {
            CatalogEventKind::Created => "field.created",
            CatalogEventKind::Updated => "field.updated",
            CatalogEventKind::Deleted => "field.deleted",
            CatalogEventKind::Ping => "ping",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "type": self.event_type(),
            "id": self.field_id.map(|id| id.to_string()),
            "name": self.name,
            "at": self.at,
        })
        .to_string()
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub role: Role,
}

impl From<&User> for UserInfo {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            phone: user.phone.clone(),
            role: user.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAvailability {
    pub start_time: NaiveTime,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub available_count: usize,
    pub slots: Vec<SlotAvailability>,
}

impl DayAvailability {
    pub fn is_available(&self, start_time: NaiveTime) -> Option<bool> {
        self.slots
            .iter()
            .find(|s| s.start_time == start_time)
            .map(|s| s.available)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAvailability {
    pub field_id: Ulid,
    pub field_name: String,
    pub days: Vec<DayAvailability>,
}

/// A reservation joined with its field's name for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub reservation: Reservation,
    pub field_name: String,
}
