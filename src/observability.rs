use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "wigwam_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "wigwam_query_duration_seconds";

/// Counter: listing and rental admission decisions. Labels: kind, outcome.
pub const ADMISSIONS_TOTAL: &str = "wigwam_admissions_total";

/// Counter: social provider calls. Labels: provider, status (ok, error, dropped).
pub const SOCIAL_CALLS_TOTAL: &str = "wigwam_social_calls_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "wigwam_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "wigwam_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "wigwam_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "wigwam_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "wigwam_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "wigwam_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "wigwam_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
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
        Command::InsertUser { .. } => "insert_user",
        Command::InsertConnection { .. } => "insert_connection",
        Command::DeleteConnection { .. } => "delete_connection",
        Command::InsertWigwam { .. } => "insert_wigwam",
        Command::DeleteWigwam { .. } => "delete_wigwam",
        Command::InsertListing { .. } => "insert_listing",
        Command::DeleteListing { .. } => "delete_listing",
        Command::InsertRental { .. } => "insert_rental",
        Command::DeleteRental { .. } => "delete_rental",
        Command::InsertParty { .. } => "insert_party",
        Command::InsertShare { .. } => "insert_share",
        Command::SelectWigwams(_) => "select_wigwams",
        Command::SelectListings { .. } => "select_listings",
        Command::SelectRentals(_) => "select_rentals",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectUser { .. } => "select_user",
        Command::SelectConnections { .. } => "select_connections",
    }
}
