use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "shareit_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "shareit_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservations created (WAITING).
pub const RESERVATIONS_CREATED_TOTAL: &str = "shareit_reservations_created_total";

/// Counter: owner decisions. Labels: outcome (approved, rejected).
pub const RESERVATION_DECISIONS_TOTAL: &str = "shareit_reservation_decisions_total";

/// Counter: comments recorded.
pub const COMMENTS_TOTAL: &str = "shareit_comments_total";

/// Counter: booker/item lookups that failed while enriching a listing.
pub const ENRICHMENT_FAILURES_TOTAL: &str = "shareit_enrichment_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "shareit_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "shareit_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "shareit_connections_rejected_total";

/// Counter: sessions whose login is not a user id.
pub const AUTH_FAILURES_TOTAL: &str = "shareit_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "shareit_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "shareit_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "shareit_wal_compactions_total";

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::InsertUser { .. } => "insert_user",
        Command::InsertItem { .. } => "insert_item",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::InsertDecision { .. } => "insert_decision",
        Command::InsertComment { .. } => "insert_comment",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectItemBookings { .. } => "select_item_bookings",
        Command::SelectCommentEligibility { .. } => "select_comment_eligibility",
        Command::SelectComments { .. } => "select_comments",
    }
}
