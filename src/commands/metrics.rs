use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use tracing::info;

static TOTAL_COMMANDS: AtomicU64 = AtomicU64::new(0);
static TOTAL_ERRORS: AtomicU64 = AtomicU64::new(0);
static GENERATIONS_STARTED: AtomicU64 = AtomicU64::new(0);
static CANCELLED_STREAMS: AtomicU64 = AtomicU64::new(0);

fn metrics_start() -> &'static Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetricsSnapshot {
    pub uptime_s: u64,
    pub total_commands: u64,
    pub total_errors: u64,
    pub generations_started: u64,
    pub cancelled_streams: u64,
}

pub(crate) fn record_command(success: bool) {
    metrics_start();
    TOTAL_COMMANDS.fetch_add(1, Ordering::Relaxed);
    if !success {
        TOTAL_ERRORS.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn inc_generations_started() {
    GENERATIONS_STARTED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn inc_cancelled_streams() {
    CANCELLED_STREAMS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn snapshot_metrics() -> MetricsSnapshot {
    MetricsSnapshot {
        uptime_s: metrics_start().elapsed().as_secs(),
        total_commands: TOTAL_COMMANDS.load(Ordering::Relaxed),
        total_errors: TOTAL_ERRORS.load(Ordering::Relaxed),
        generations_started: GENERATIONS_STARTED.load(Ordering::Relaxed),
        cancelled_streams: CANCELLED_STREAMS.load(Ordering::Relaxed),
    }
}

pub(crate) fn log_event(event: &str, client_id: usize, tag: Option<&str>, detail: &str) {
    info!(
        event,
        client_id,
        tag = tag.unwrap_or("-"),
        detail = %detail.replace('"', "'"),
        "client event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_grow() {
        let before = snapshot_metrics();
        record_command(true);
        record_command(false);
        inc_generations_started();
        let after = snapshot_metrics();

        assert!(after.total_commands >= before.total_commands + 2);
        assert!(after.total_errors > before.total_errors);
        assert!(after.generations_started > before.generations_started);
    }
}
