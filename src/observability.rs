use std::net::SocketAddr;

use crate::sql::Command;

// ── Allocation outcomes ─────────────────────────────────────────

/// Counter: bookings committed (new and rescheduled). Labels: kind.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "parkking_bookings_committed_total";

/// Counter: allocation attempts rejected. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "parkking_bookings_rejected_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "parkking_bookings_cancelled_total";

/// Histogram: allocation latency in seconds, lock wait included.
pub const ALLOCATION_DURATION_SECONDS: &str = "parkking_allocation_duration_seconds";

// ── Outbox ──────────────────────────────────────────────────────

/// Counter: mails handed to the notifier successfully.
pub const MAIL_SENT_TOTAL: &str = "parkking_mail_sent_total";

/// Counter: mails the notifier failed to deliver.
pub const MAIL_FAILED_TOTAL: &str = "parkking_mail_failed_total";

/// Counter: mails dropped because the outbox was full or closed.
pub const MAIL_DROPPED_TOTAL: &str = "parkking_mail_dropped_total";

// ── List cache ──────────────────────────────────────────────────

/// Counter: cache lookups served from memory. Labels: cache.
pub const CACHE_HITS_TOTAL: &str = "parkking_cache_hits_total";

/// Counter: cache lookups that went to the engine. Labels: cache.
pub const CACHE_MISSES_TOTAL: &str = "parkking_cache_misses_total";

// ── Staff console ───────────────────────────────────────────────

/// Counter: console statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "parkking_console_queries_total";

/// Histogram: console statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "parkking_console_query_duration_seconds";

/// Gauge: open console connections.
pub const CONNECTIONS_ACTIVE: &str = "parkking_console_connections_active";

/// Counter: console connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkking_console_connections_total";

/// Counter: console connections refused at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkking_console_connections_rejected_total";

// ── WAL ─────────────────────────────────────────────────────────

/// Histogram: group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkking_wal_flush_duration_seconds";

/// Histogram: records per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkking_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a console command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertTable { .. } => "insert_table",
        Command::DeleteTable { .. } => "delete_table",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::InsertCoverImage { .. } => "insert_cover_image",
        Command::DeleteCoverImage { .. } => "delete_cover_image",
        Command::SelectTables => "select_tables",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectCoverImages => "select_cover_images",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
