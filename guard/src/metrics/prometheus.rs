use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use std::sync::OnceLock;

static PASSES: OnceLock<IntCounter> = OnceLock::new();
static WORKERS_VISITED: OnceLock<IntCounter> = OnceLock::new();
static SIGNAL_LOSS: OnceLock<IntCounter> = OnceLock::new();
static DEVIATIONS: OnceLock<IntCounter> = OnceLock::new();
static BLACKLIST_INSERTS: OnceLock<IntCounter> = OnceLock::new();
static OPERATOR_BANS: OnceLock<IntCounter> = OnceLock::new();
static DEALS_TERMINATED: OnceLock<IntCounter> = OnceLock::new();
static PASS_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static TRACKED_WORKERS: OnceLock<IntGauge> = OnceLock::new();
static REDIS_UP: OnceLock<IntGauge> = OnceLock::new();

fn passes() -> &'static IntCounter {
    PASSES.get_or_init(|| IntCounter::new("tracking_passes_total", "Total tracking passes started").unwrap())
}

fn workers_visited() -> &'static IntCounter {
    WORKERS_VISITED.get_or_init(|| {
        IntCounter::new(
            "workers_visited_total",
            "Total workers evaluated across all passes",
        )
        .unwrap()
    })
}

fn signal_loss() -> &'static IntCounter {
    SIGNAL_LOSS.get_or_init(|| {
        IntCounter::new(
            "signal_loss_total",
            "Workers observed with zero hashrate under a live deal",
        )
        .unwrap()
    })
}

fn deviations() -> &'static IntCounter {
    DEVIATIONS.get_or_init(|| {
        IntCounter::new("deviations_total", "Under-performance deviations detected").unwrap()
    })
}

fn blacklist_inserts() -> &'static IntCounter {
    BLACKLIST_INSERTS.get_or_init(|| {
        IntCounter::new("blacklist_inserts_total", "New blacklist records written").unwrap()
    })
}

fn operator_bans() -> &'static IntCounter {
    OPERATOR_BANS.get_or_init(|| {
        IntCounter::new("operator_bans_total", "Operators escalated to a full ban").unwrap()
    })
}

fn deals_terminated() -> &'static IntCounter {
    DEALS_TERMINATED.get_or_init(|| {
        IntCounter::new("deals_terminated_total", "Deals torn down by enforcement").unwrap()
    })
}

fn pass_errors() -> &'static IntCounter {
    PASS_ERRORS.get_or_init(|| {
        IntCounter::new("pass_errors_total", "Tracking passes that ended in error").unwrap()
    })
}

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS
        .get_or_init(|| IntCounter::new("rpc_requests_total", "Total market RPC requests").unwrap())
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| IntCounter::new("rpc_errors_total", "Total market RPC errors").unwrap())
}

fn tracked_workers() -> &'static IntGauge {
    TRACKED_WORKERS.get_or_init(|| {
        IntGauge::new("tracked_workers", "Workers currently under monitoring").unwrap()
    })
}

fn redis_up() -> &'static IntGauge {
    REDIS_UP.get_or_init(|| IntGauge::new("redis_up", "Redis reachable (1/0)").unwrap())
}

pub fn inc_passes() {
    passes().inc();
}

pub fn inc_workers_visited() {
    workers_visited().inc();
}

pub fn inc_signal_loss() {
    signal_loss().inc();
}

pub fn inc_deviations() {
    deviations().inc();
}

pub fn inc_blacklist_inserts() {
    blacklist_inserts().inc();
}

pub fn inc_operator_bans() {
    operator_bans().inc();
}

pub fn inc_deals_terminated() {
    deals_terminated().inc();
}

pub fn inc_pass_errors() {
    pass_errors().inc();
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn set_tracked_workers(count: usize) {
    tracked_workers().set(count as i64);
}

pub fn set_redis_up(up: bool) {
    redis_up().set(if up { 1 } else { 0 });
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(passes().collect());
    mfs.extend(workers_visited().collect());
    mfs.extend(signal_loss().collect());
    mfs.extend(deviations().collect());
    mfs.extend(blacklist_inserts().collect());
    mfs.extend(operator_bans().collect());
    mfs.extend(deals_terminated().collect());
    mfs.extend(pass_errors().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(tracked_workers().collect());
    mfs.extend(redis_up().collect());

    let mut buf = Vec::new();
    if enc.encode(&mfs, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_every_metric_family() {
        inc_passes();
        set_redis_up(true);
        let text = render();
        assert!(text.contains("tracking_passes_total"));
        assert!(text.contains("redis_up 1"));
        assert!(text.contains("deals_terminated_total"));
    }
}
