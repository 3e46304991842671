use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotd_query_duration_seconds";

/// Counter: requests refused by the rate limiter. Labels: class.
pub const RATE_LIMITED_TOTAL: &str = "slotd_rate_limited_total";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: bookings created. Labels: source.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotd_bookings_created_total";

pub const BOOKINGS_RESCHEDULED_TOTAL: &str = "slotd_bookings_rescheduled_total";

pub const BOOKINGS_CANCELED_TOTAL: &str = "slotd_bookings_canceled_total";

/// Counter: creates and reschedules refused because the interval was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "slotd_slot_conflicts_total";

// ── Collaborators ───────────────────────────────────────────────

/// Counter: calendar reads that failed or timed out and were treated as free.
pub const CALENDAR_DEGRADED_TOTAL: &str = "slotd_calendar_degraded_total";

/// Counter: calendar writes (insert, move, delete) that failed.
pub const MIRROR_FAILURES_TOTAL: &str = "slotd_mirror_failures_total";

pub const DISPATCH_FAILURES_TOTAL: &str = "slotd_dispatch_failures_total";

/// Counter: rate-limit store errors (the request was let through).
pub const RATE_LIMIT_STORE_FAILURES_TOTAL: &str = "slotd_rate_limit_store_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Counter: WAL compactions run by the reaper.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotd_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertProfile(_) => "upsert_profile",
        Command::InsertEventType(_) => "insert_event_type",
        Command::UpdateEventType(_) => "update_event_type",
        Command::InsertBooking { .. } => "insert_booking",
        Command::Reschedule { .. } => "reschedule",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::SelectAvailability(_) => "select_availability",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectEventTypes { .. } => "select_event_types",
        Command::SelectProfile { .. } => "select_profile",
        Command::SelectRateLimit { .. } => "select_rate_limit",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
        Command::Ping => "ping",
    }
}
