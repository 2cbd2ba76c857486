use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "futbolflex_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "futbolflex_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "futbolflex_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "futbolflex_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "futbolflex_connections_rejected_total";

/// Counter: failed logins and admin-only statements run by regular logins.
pub const AUTH_FAILURES_TOTAL: &str = "futbolflex_auth_failures_total";

/// Gauge: open LISTEN subscriptions across all connections.
pub const CATALOG_LISTENERS: &str = "futbolflex_catalog_listeners";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "futbolflex_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "futbolflex_wal_flush_batch_size";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: reservations confirmed.
pub const RESERVATIONS_CREATED_TOTAL: &str = "futbolflex_reservations_created_total";

/// Counter: reservations cancelled.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "futbolflex_reservations_cancelled_total";

/// Counter: bookings rejected because the slot was already held.
pub const BOOKING_CONFLICTS_TOTAL: &str = "futbolflex_booking_conflicts_total";

/// Counter: confirmation messages that could not be handed off.
pub const CONFIRMATION_FAILURES_TOTAL: &str = "futbolflex_confirmation_failures_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterUser(_) => "register_user",
        Command::Authenticate { .. } => "authenticate",
        Command::InsertField(_) => "insert_field",
        Command::UpdateField { .. } => "update_field",
        Command::DeleteField { .. } => "delete_field",
        Command::SelectFields { .. } => "select_fields",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectAvailabilitySummary { .. } => "select_availability_summary",
        Command::InsertReservation(_) => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectReservations { user_id: Some(_) } => "select_user_reservations",
        Command::SelectReservations { user_id: None } => "select_all_reservations",
        Command::InsertMessage(_) => "insert_message",
        Command::SelectMessages => "select_messages",
        Command::DeleteMessage { .. } => "delete_message",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
        Command::Ping => "ping",
    }
}
