use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "valet_queries_total";

/// Histogram: command latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "valet_query_duration_seconds";

/// Counter: bookings opened.
pub const BOOKINGS_OPENED_TOTAL: &str = "valet_bookings_opened_total";

/// Counter: bookings closed (releases).
pub const BOOKINGS_CLOSED_TOTAL: &str = "valet_bookings_closed_total";

/// Counter: Book attempts rejected on an unavailable spot or a claim
/// conflict.
pub const BOOKING_CONFLICTS_TOTAL: &str = "valet_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "valet_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "valet_connections_total";

/// Counter: connections rejected due to the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "valet_connections_rejected_total";

/// Gauge: facilities with a loaded engine.
pub const FACILITIES_ACTIVE: &str = "valet_facilities_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "valet_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "valet_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Short label for a parsed command, used as the metrics `command` label.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::CreateLot { .. } => "create_lot",
        Command::CreateSpot { .. } => "create_spot",
        Command::DeleteSpot { .. } => "delete_spot",
        Command::RegisterVehicle { .. } => "register_vehicle",
        Command::Book { .. } => "book",
        Command::Release { .. } => "release",
        Command::SelectHistory => "select_history",
        Command::SelectOccupancy => "select_occupancy",
        Command::SelectSpots { .. } => "select_spots",
        Command::SelectMe => "select_me",
        Command::Listen { .. } => "listen",
    }
}
