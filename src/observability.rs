use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: bookings attempted. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "trimline_bookings_total";

/// Counter: bookings rejected by a conflict (blocks, time-off,
/// existing appointments, hours).
pub const BOOKING_CONFLICTS_TOTAL: &str = "trimline_booking_conflicts_total";

/// Counter: compensating rollbacks performed after a failed
/// service-attachment write.
pub const BOOKING_ROLLBACKS_TOTAL: &str = "trimline_booking_rollbacks_total";

/// Counter: rollbacks whose own tombstone append failed — the WAL may
/// replay an orphaned appointment and needs reconciliation.
pub const ROLLBACK_FAILURES_TOTAL: &str = "trimline_rollback_failures_total";

/// Counter: confirmation-code collisions absorbed by retry.
pub const CODE_COLLISIONS_TOTAL: &str = "trimline_code_collisions_total";

/// Counter: time-off transitions. Labels: transition.
pub const TIME_OFF_TRANSITIONS_TOTAL: &str = "trimline_time_off_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: salons loaded in the engine.
pub const SALONS_ACTIVE: &str = "trimline_salons_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "trimline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "trimline_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if `port`
/// is `None`; called once by the embedding application.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
