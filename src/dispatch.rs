//! Booking confirmations.
//!
//! The engine hands every new reservation to a [`ConfirmationDispatcher`] on a
//! spawned task. Delivery is best effort: a failure is logged and counted but
//! never undoes the booking.

use std::io::Cursor;

use async_trait::async_trait;
use image::{ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};
use tracing::info;

use crate::model::*;

#[derive(Debug)]
pub enum DispatchError {
    Rejected(String),
    Unavailable(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Rejected(msg) => write!(f, "confirmation rejected: {msg}"),
            DispatchError::Unavailable(msg) => write!(f, "dispatcher unavailable: {msg}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Minimum edge of the rendered QR image, in pixels.
pub const QR_IMAGE_PX: u32 = 300;

/// A confirmed reservation plus the name of the field it is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub reservation: Reservation,
    pub field_name: String,
}

impl Confirmation {
    pub fn recipient(&self) -> &str {
        &self.reservation.contact.email
    }

    /// Content encoded into the QR image shown at the venue.
    pub fn qr_payload(&self) -> String {
        let r = &self.reservation;
        serde_json::json!({
            "id": r.id.to_string(),
            "field": self.field_name,
            "date": format_date(r.date),
            "time": format_clock(r.start_time),
            "code": r.qr_code,
        })
        .to_string()
    }

    /// The QR payload rendered as a PNG, medium error correction.
    pub fn qr_png(&self) -> Result<Vec<u8>, DispatchError> {
        let code = QrCode::with_error_correction_level(self.qr_payload().as_bytes(), EcLevel::M)
            .map_err(|e| DispatchError::Rejected(format!("QR encoding failed: {e}")))?;
        let image = code
            .render::<Luma<u8>>()
            .min_dimensions(QR_IMAGE_PX, QR_IMAGE_PX)
            .build();
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| DispatchError::Rejected(format!("PNG encoding failed: {e}")))?;
        Ok(png)
    }

    pub fn subject(&self) -> String {
        format!(
            "Reservation confirmed: {} on {} at {}",
            self.field_name,
            format_date(self.reservation.date),
            format_clock(self.reservation.start_time)
        )
    }

    pub fn body(&self) -> String {
        let r = &self.reservation;
        format!(
            "Hi {name},\n\n\
             Your reservation is confirmed.\n\n\
             Field: {field}\n\
             Date: {date}\n\
             Time: {start} - {end}\n\
             Payment: {payment}\n\
             Code: {code}\n\n\
             Show this code at the entrance. Cancellations are accepted up to 24 hours before the start time.\n",
            name = r.contact.name,
            field = self.field_name,
            date = format_date(r.date),
            start = format_clock(r.start_time),
            end = format_clock(r.end_time),
            payment = r.payment_method.as_str(),
            code = r.qr_code.as_deref().unwrap_or("-"),
        )
    }
}

#[async_trait]
pub trait ConfirmationDispatcher: Send + Sync {
    async fn dispatch(&self, confirmation: &Confirmation) -> Result<(), DispatchError>;
}

/// Writes the rendered confirmation to the log. The default when no
/// delivery channel is wired in.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl ConfirmationDispatcher for LogDispatcher {
    async fn dispatch(&self, confirmation: &Confirmation) -> Result<(), DispatchError> {
        let png = confirmation.qr_png()?;
        info!(
            to = confirmation.recipient(),
            reservation = %confirmation.reservation.id,
            subject = %confirmation.subject(),
            qr = %confirmation.qr_payload(),
            qr_png_bytes = png.len(),
            "booking confirmation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn confirmation() -> Confirmation {
        Confirmation {
            reservation: Reservation {
                id: Ulid::new(),
                user_id: Ulid::new(),
                field_id: Ulid::new(),
                date: parse_date("2099-01-01").unwrap(),
                start_time: parse_clock("20:00").unwrap(),
                end_time: parse_clock("21:00").unwrap(),
                contact: ContactSnapshot {
                    name: "Ana".into(),
                    email: "ana@example.com".into(),
                    phone: "+56 9 1234 5678".into(),
                },
                status: ReservationStatus::Confirmed,
                payment_method: PaymentMethod::Card,
                qr_code: Some("QR-123".into()),
                created_at: 0,
            },
            field_name: "Cancha Central".into(),
        }
    }

    #[test]
    fn qr_payload_fields() {
        let c = confirmation();
        let parsed: serde_json::Value = serde_json::from_str(&c.qr_payload()).unwrap();
        assert_eq!(parsed["id"], c.reservation.id.to_string());
        assert_eq!(parsed["field"], "Cancha Central");
        assert_eq!(parsed["date"], "2099-01-01");
        assert_eq!(parsed["time"], "20:00");
        assert_eq!(parsed["code"], "QR-123");
    }

    #[test]
    fn subject_and_body_render() {
        let c = confirmation();
        assert_eq!(c.subject(), "Reservation confirmed: Cancha Central on 2099-01-01 at 20:00");
        let body = c.body();
        assert!(body.starts_with("Hi Ana,"));
        assert!(body.contains("Time: 20:00 - 21:00"));
        assert!(body.contains("Payment: card"));
        assert!(body.contains("Code: QR-123"));
        assert_eq!(c.recipient(), "ana@example.com");
    }

    #[test]
    fn qr_png_is_a_readable_image() {
        let png = confirmation().qr_png().unwrap();
        assert!(png.starts_with(b"\x89PNG\r\n\x1a\n"));

        let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
        assert!(decoded.width() >= QR_IMAGE_PX);
        assert_eq!(decoded.width(), decoded.height());
    }

    #[test]
    fn qr_png_differs_per_reservation() {
        let a = confirmation();
        let mut b = confirmation();
        b.reservation.qr_code = Some("QR-456".into());
        assert_ne!(a.qr_png().unwrap(), b.qr_png().unwrap());
    }

    #[tokio::test]
    async fn log_dispatcher_succeeds() {
        assert!(LogDispatcher.dispatch(&confirmation()).await.is_ok());
    }
}
