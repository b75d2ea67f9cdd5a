//! Pool observation - reported and averaged hashrate samples
//!
//! Early passes read the pool's instantaneous reported hashrate, which
//! reacts fast but is noisy. Once a worker has been through enough passes,
//! sampling switches to the pool's rolling average, fetched from the same
//! address with the averaging-window suffix appended.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Pool APIs report megahashes per second; deal bids are in H/s.
const HASHES_PER_MEGAHASH: f64 = 1_000_000.0;

/// Address suffix selecting the pool's averaging window.
pub const AVG_WINDOW_SUFFIX: &str = "/1";

/// Which sample class a worker's pass evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplePhase {
    /// Instantaneous reported hashrate - responsiveness over smoothing.
    Early,
    /// Rolling-average hashrate - stability over noise.
    Steady,
}

impl SamplePhase {
    pub fn for_iteration(iterations: u64, steady_after: u64) -> Self {
        if iterations < steady_after {
            SamplePhase::Early
        } else {
            SamplePhase::Steady
        }
    }
}

/// Supplies observed hashrate (H/s) for a pool address.
#[async_trait]
pub trait SampleProvider: Send + Sync {
    async fn reported(&self, address: &str) -> Result<f64>;
    async fn average(&self, address: &str) -> Result<f64>;
}

#[derive(Debug, Clone, Deserialize)]
struct PoolStatsResponse {
    #[serde(default)]
    hashrate: f64,
    #[serde(default)]
    hashrate_avg: Option<f64>,
}

/// HTTP watcher against the pool's stats API.
pub struct PoolStatsWatcher {
    client: reqwest::Client,
    base_url: String,
}

impl PoolStatsWatcher {
    pub fn new(base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { client, base_url })
    }

    async fn fetch(&self, address: &str) -> Result<PoolStatsResponse> {
        let url = stats_url(&self.base_url, address);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            anyhow::bail!("pool stats API error for {}: {}", address, resp.status());
        }

        let stats: PoolStatsResponse = resp.json().await?;
        Ok(stats)
    }
}

fn stats_url(base: &str, address: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), address)
}

#[async_trait]
impl SampleProvider for PoolStatsWatcher {
    async fn reported(&self, address: &str) -> Result<f64> {
        let stats = self.fetch(address).await?;
        Ok(stats.hashrate * HASHES_PER_MEGAHASH)
    }

    async fn average(&self, address: &str) -> Result<f64> {
        let stats = self.fetch(address).await?;
        Ok(stats.hashrate_avg.unwrap_or(stats.hashrate) * HASHES_PER_MEGAHASH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_switches_at_boundary() {
        assert_eq!(SamplePhase::for_iteration(1, 4), SamplePhase::Early);
        assert_eq!(SamplePhase::for_iteration(3, 4), SamplePhase::Early);
        assert_eq!(SamplePhase::for_iteration(4, 4), SamplePhase::Steady);
        assert_eq!(SamplePhase::for_iteration(100, 4), SamplePhase::Steady);
    }

    #[test]
    fn stats_url_handles_trailing_slash() {
        assert_eq!(
            stats_url("http://pool.example/api/", "0xabc"),
            "http://pool.example/api/0xabc"
        );
        assert_eq!(
            stats_url("http://pool.example/api", "0xabc/1"),
            "http://pool.example/api/0xabc/1"
        );
    }
}
