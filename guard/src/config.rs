use serde::Deserialize;

/// Detection thresholds, tunable per deployment.
///
/// Deviations at or above `worker_limit_change_percent` put a worker on the
/// blacklist; the hard 20% termination ceiling is not configurable (see
/// `classifier::SEVERE_DEVIATION_PERCENT`).
#[derive(Deserialize, Clone, Copy, Debug)]
pub struct Sensitivity {
    /// Deviation percentage that flags a single worker.
    #[serde(default = "default_worker_limit_change_percent")]
    pub worker_limit_change_percent: f64,
    /// Failed-worker ratio (percent) above which the whole operator is banned.
    #[serde(default = "default_bad_workers_percent")]
    pub bad_workers_percent: f64,
    /// Passes after which sampling switches from instantaneous to averaged data.
    #[serde(default = "default_steady_phase_iterations")]
    pub steady_phase_iterations: u64,
}

fn default_worker_limit_change_percent() -> f64 { 10.0 }
fn default_bad_workers_percent() -> f64 { 50.0 }
fn default_steady_phase_iterations() -> u64 { 4 }

impl Default for Sensitivity {
    fn default() -> Self {
        Self {
            worker_limit_change_percent: default_worker_limit_change_percent(),
            bad_workers_percent: default_bad_workers_percent(),
            steady_phase_iterations: default_steady_phase_iterations(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct Config {
    pub redis_url: String,
    pub market_rpc_url: String,
    /// Base URL of the pool stats API the watcher polls.
    pub pool_stats_url: String,
    /// Pool address whose observed hashrate is compared against deal bids.
    pub pool_address: String,
    pub api_listen: String,
    pub track_interval_secs: u64,
    /// Hard deadline for one tracking pass; a pass cut off here resumes
    /// cleanly next time because iteration counters are persisted before
    /// each evaluation.
    #[serde(default = "default_pass_deadline_secs")]
    pub pass_deadline_secs: u64,
    #[serde(default)]
    pub sensitivity: Sensitivity,
}

fn default_pass_deadline_secs() -> u64 { 120 }

impl Config {
    pub fn load() -> Self {
        let mut cfg = Self {
            redis_url: "redis://127.0.0.1/".to_string(),
            market_rpc_url: "http://127.0.0.1:15030/jsonrpc".to_string(),
            pool_stats_url: "http://dwarfpool.com/eth/api".to_string(),
            pool_address: String::new(),
            api_listen: "0.0.0.0:8090".to_string(),
            track_interval_secs: 300,
            pass_deadline_secs: default_pass_deadline_secs(),
            sensitivity: Sensitivity::default(),
        };

        if let Ok(r) = std::env::var("VIGIL_REDIS_URL") {
            cfg.redis_url = r;
        } else if let Ok(r) = std::env::var("REDIS_URL") {
            // legacy
            cfg.redis_url = r;
        }
        if let Ok(m) = std::env::var("VIGIL_MARKET_RPC") { cfg.market_rpc_url = m; }
        if let Ok(p) = std::env::var("VIGIL_POOL_STATS_URL") { cfg.pool_stats_url = p; }
        if let Ok(a) = std::env::var("VIGIL_POOL_ADDRESS") { cfg.pool_address = a; }
        if let Ok(a) = std::env::var("VIGIL_API_LISTEN") { cfg.api_listen = a; }
        if let Ok(t) = std::env::var("VIGIL_TRACK_INTERVAL") {
            cfg.track_interval_secs = t.parse().unwrap_or(300);
        }
        if let Ok(t) = std::env::var("VIGIL_PASS_DEADLINE") {
            cfg.pass_deadline_secs = t.parse().unwrap_or_else(|_| default_pass_deadline_secs());
        }
        if let Ok(p) = std::env::var("VIGIL_WORKER_LIMIT_CHANGE_PERCENT") {
            cfg.sensitivity.worker_limit_change_percent =
                p.parse().unwrap_or_else(|_| default_worker_limit_change_percent());
        }
        if let Ok(p) = std::env::var("VIGIL_BAD_WORKERS_PERCENT") {
            cfg.sensitivity.bad_workers_percent =
                p.parse().unwrap_or_else(|_| default_bad_workers_percent());
        }
        if let Ok(n) = std::env::var("VIGIL_STEADY_PHASE_ITERATIONS") {
            cfg.sensitivity.steady_phase_iterations =
                n.parse().unwrap_or_else(|_| default_steady_phase_iterations());
        }

        // File config overrides env-assembled defaults
        if let Ok(txt) = std::fs::read_to_string("guard_config.json") {
            match serde_json::from_str::<Config>(&txt) {
                Ok(file_cfg) => {
                    let fallback_address = cfg.pool_address.clone();
                    cfg = file_cfg;
                    if cfg.pool_address.is_empty() {
                        cfg.pool_address = fallback_address;
                    }
                }
                Err(e) => eprintln!("Failed to parse guard_config.json: {}", e),
            }
        }

        if cfg.track_interval_secs == 0 {
            cfg.track_interval_secs = 300;
        }
        if cfg.pass_deadline_secs == 0 {
            cfg.pass_deadline_secs = default_pass_deadline_secs();
        }
        if cfg.sensitivity.steady_phase_iterations == 0 {
            cfg.sensitivity.steady_phase_iterations = default_steady_phase_iterations();
        }
        if cfg.sensitivity.worker_limit_change_percent < 0.0 {
            cfg.sensitivity.worker_limit_change_percent = default_worker_limit_change_percent();
        }
        if cfg.sensitivity.worker_limit_change_percent >= crate::classifier::SEVERE_DEVIATION_PERCENT {
            eprintln!(
                "⚠️  worker_limit_change_percent={} is at or above the {}% termination ceiling — soft blacklisting will never trigger",
                cfg.sensitivity.worker_limit_change_percent,
                crate::classifier::SEVERE_DEVIATION_PERCENT,
            );
        }
        if cfg.sensitivity.bad_workers_percent <= 0.0 || cfg.sensitivity.bad_workers_percent > 100.0 {
            cfg.sensitivity.bad_workers_percent = default_bad_workers_percent();
        }
        if cfg.pool_address.is_empty() {
            eprintln!("⚠️  VIGIL_POOL_ADDRESS not set — pool observation will fail until configured");
        }

        cfg
    }
}
