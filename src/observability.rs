use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fleetd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fleetd_query_duration_seconds";

/// Counter: admission attempts. Labels: op, outcome.
pub const ADMISSIONS_TOTAL: &str = "fleetd_admissions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: time spent waiting for the allocator lock, in seconds.
pub const ALLOCATOR_WAIT_SECONDS: &str = "fleetd_allocator_wait_seconds";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fleetd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fleetd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fleetd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "fleetd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom { .. } => "insert_room",
        Command::InsertUser { .. } => "insert_user",
        Command::InsertApplication { .. } => "insert_application",
        Command::InsertWorkstation { .. } => "insert_workstation",
        Command::InsertHeartbeat { .. } => "insert_heartbeat",
        Command::InsertWorkgroup(_) => "insert_workgroup",
        Command::InsertMember { .. } => "insert_member",
        Command::DeleteMember { .. } => "delete_member",
        Command::SetSharing { workstation_id: Some(_), .. } => "set_member_sharing",
        Command::SetSharing { workstation_id: None, .. } => "set_group_sharing",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectMembers { .. } => "select_members",
        Command::SelectHistory { .. } => "select_history",
        Command::SelectWorkgroup { .. } => "select_workgroup",
        Command::Listen { .. } => "listen",
    }
}
