/// Redis-backed monitoring state - tracked workers and the blacklist
///
/// Handles:
/// - Per-worker monitoring rows (worker:{deal_id} - iterations, strikes,
///   last observed hashrates, ban flag)
/// - The tracked-worker set (workers:tracked)
/// - Blacklist records per operator (blacklist:{operator}:workers,
///   blacklist:{operator}:record:{worker})
///
/// Uses redis::aio::ConnectionManager for async operations.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Workers with more soft-ban strikes than this are frozen: kept in the
/// store but never visited by the tracker again.
pub const MAX_BAN_STRIKES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanStatus {
    /// Worker is on the per-worker blacklist.
    Banned,
    /// The whole operator was banned after too many of its workers failed.
    OperatorBanned,
    /// The worker's own monitoring row is flagged; its deal was terminated.
    WorkerInPool,
}

impl BanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BanStatus::Banned => "banned",
            BanStatus::OperatorBanned => "operator_banned",
            BanStatus::WorkerInPool => "worker_in_pool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "banned" => Some(BanStatus::Banned),
            "operator_banned" => Some(BanStatus::OperatorBanned),
            "worker_in_pool" => Some(BanStatus::WorkerInPool),
            _ => None,
        }
    }
}

/// One monitored deal. `iterations` only ever moves forward; it is reset
/// solely by re-registering the deal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedWorker {
    pub deal_id: i64,
    pub iterations: u64,
    pub ban_strikes: u32,
    pub last_reported_hashrate: f64,
    pub last_average_hashrate: f64,
    #[serde(default)]
    pub ban_status: Option<BanStatus>,
    #[serde(default)]
    pub banned_at: Option<DateTime<Utc>>,
}

impl TrackedWorker {
    /// Frozen workers are skipped by the tracker but kept in the store.
    pub fn is_frozen(&self) -> bool {
        self.ban_strikes > MAX_BAN_STRIKES || self.ban_status.is_some()
    }
}

/// One blacklist row per (operator, failed worker) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistRecord {
    pub operator_id: String,
    pub failed_worker_id: String,
    pub ban_status: BanStatus,
    pub deal_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Durable table of per-worker monitoring state.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn list_tracked(&self) -> Result<Vec<TrackedWorker>>;
    /// Enter a deal under monitoring. Re-registering resets its counters.
    async fn register_worker(&self, deal_id: i64) -> Result<()>;
    async fn set_iterations(&self, deal_id: i64, iterations: u64) -> Result<()>;
    /// Overwrite the worker's last observed hashrates (H/s).
    async fn set_observed(&self, deal_id: i64, reported: f64, average: f64) -> Result<()>;
    async fn add_ban_strike(&self, deal_id: i64) -> Result<()>;
    async fn set_banned(&self, deal_id: i64, status: BanStatus, at: DateTime<Utc>) -> Result<()>;
}

/// Durable table of banned-worker records.
#[async_trait]
pub trait BlacklistStore: Send + Sync {
    async fn contains(&self, operator_id: &str, worker_id: &str) -> Result<bool>;
    /// Insert a record; returns false if the (operator, worker) pair was
    /// already present. Re-insertion never duplicates a row.
    async fn insert(&self, record: &BlacklistRecord) -> Result<bool>;
    async fn count_by_operator(&self, operator_id: &str) -> Result<i64>;
    async fn set_operator_status(&self, operator_id: &str, status: BanStatus) -> Result<()>;
    async fn records_by_operator(&self, operator_id: &str) -> Result<Vec<BlacklistRecord>>;
}

fn worker_key(deal_id: i64) -> String {
    format!("worker:{}", deal_id)
}

fn operator_workers_key(operator_id: &str) -> String {
    format!("blacklist:{}:workers", operator_id)
}

fn blacklist_record_key(operator_id: &str, worker_id: &str) -> String {
    format!("blacklist:{}:record:{}", operator_id, worker_id)
}

const TRACKED_SET_KEY: &str = "workers:tracked";

/// Redis storage manager for both store tables.
pub struct RedisGuardStore {
    client: redis::Client,
    connection: Arc<RwLock<Option<redis::aio::ConnectionManager>>>,
}

impl RedisGuardStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
        })
    }

    /// Get async connection (lazy initialization)
    async fn get_connection(&self) -> Result<redis::aio::ConnectionManager> {
        let mut conn_guard = self.connection.write().await;

        if conn_guard.is_none() {
            let manager = self
                .client
                .get_connection_manager()
                .await
                .map_err(|e| anyhow!("Failed to get connection manager: {}", e))?;
            *conn_guard = Some(manager);
        }

        Ok(conn_guard.clone().unwrap())
    }

    pub async fn get_worker(&self, deal_id: i64) -> Result<Option<TrackedWorker>> {
        let mut conn = self.get_connection().await?;
        let map: HashMap<String, String> = conn
            .hgetall(worker_key(deal_id))
            .await
            .map_err(|e| anyhow!("Failed to read worker {}: {}", deal_id, e))?;

        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(worker_from_map(deal_id, &map)))
    }

    /// Health check
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Redis PING failed: {}", e))?;

        if pong != "PONG" {
            return Err(anyhow!("Redis health check failed: got {}", pong));
        }

        Ok(())
    }
}

fn worker_from_map(deal_id: i64, map: &HashMap<String, String>) -> TrackedWorker {
    TrackedWorker {
        deal_id,
        iterations: map
            .get("iterations")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0),
        ban_strikes: map
            .get("ban_strikes")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0),
        last_reported_hashrate: map
            .get("reported")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0),
        last_average_hashrate: map
            .get("average")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0),
        ban_status: map.get("ban_status").and_then(|v| BanStatus::parse(v)),
        banned_at: map
            .get("banned_at")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

#[async_trait]
impl WorkerStore for RedisGuardStore {
    async fn list_tracked(&self) -> Result<Vec<TrackedWorker>> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<i64> = conn
            .smembers(TRACKED_SET_KEY)
            .await
            .map_err(|e| anyhow!("Failed to read tracked worker set: {}", e))?;

        let mut workers = Vec::with_capacity(ids.len());
        for deal_id in ids {
            let map: HashMap<String, String> = conn
                .hgetall(worker_key(deal_id))
                .await
                .map_err(|e| anyhow!("Failed to read worker {}: {}", deal_id, e))?;

            if map.is_empty() {
                tracing::warn!("tracked worker {} has no state row, skipping", deal_id);
                continue;
            }
            workers.push(worker_from_map(deal_id, &map));
        }

        Ok(workers)
    }

    async fn register_worker(&self, deal_id: i64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.sadd::<_, _, ()>(TRACKED_SET_KEY, deal_id)
            .await
            .map_err(|e| anyhow!("Failed to add worker {} to tracked set: {}", deal_id, e))?;

        // Re-registration resets the monitoring row, ban flag included.
        conn.del::<_, ()>(worker_key(deal_id))
            .await
            .map_err(|e| anyhow!("Failed to reset worker {}: {}", deal_id, e))?;
        conn.hset_multiple::<_, _, _, ()>(
            worker_key(deal_id),
            &[("iterations", "0"), ("ban_strikes", "0")],
        )
        .await
        .map_err(|e| anyhow!("Failed to initialize worker {}: {}", deal_id, e))?;

        Ok(())
    }

    async fn set_iterations(&self, deal_id: i64, iterations: u64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.hset::<_, _, _, ()>(worker_key(deal_id), "iterations", iterations)
            .await
            .map_err(|e| anyhow!("Failed to persist iteration for worker {}: {}", deal_id, e))?;
        Ok(())
    }

    async fn set_observed(&self, deal_id: i64, reported: f64, average: f64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.hset_multiple::<_, _, _, ()>(
            worker_key(deal_id),
            &[
                ("reported", reported.to_string()),
                ("average", average.to_string()),
            ],
        )
        .await
        .map_err(|e| anyhow!("Failed to persist observed hashrate for worker {}: {}", deal_id, e))?;
        Ok(())
    }

    async fn add_ban_strike(&self, deal_id: i64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.hincr::<_, _, _, ()>(worker_key(deal_id), "ban_strikes", 1)
            .await
            .map_err(|e| anyhow!("Failed to add ban strike for worker {}: {}", deal_id, e))?;
        Ok(())
    }

    async fn set_banned(&self, deal_id: i64, status: BanStatus, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.hset_multiple::<_, _, _, ()>(
            worker_key(deal_id),
            &[
                ("ban_status", status.as_str().to_string()),
                ("banned_at", at.to_rfc3339()),
            ],
        )
        .await
        .map_err(|e| anyhow!("Failed to ban worker {}: {}", deal_id, e))?;
        Ok(())
    }
}

#[async_trait]
impl BlacklistStore for RedisGuardStore {
    async fn contains(&self, operator_id: &str, worker_id: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let present: bool = conn
            .sismember(operator_workers_key(operator_id), worker_id)
            .await
            .map_err(|e| anyhow!("Failed to check blacklist membership: {}", e))?;
        Ok(present)
    }

    async fn insert(&self, record: &BlacklistRecord) -> Result<bool> {
        let mut conn = self.get_connection().await?;

        // SADD returns 0 when the member already exists, which gives us the
        // idempotency guarantee without a read-check race.
        let added: i64 = conn
            .sadd(
                operator_workers_key(&record.operator_id),
                &record.failed_worker_id,
            )
            .await
            .map_err(|e| anyhow!("Failed to insert blacklist member: {}", e))?;

        if added == 0 {
            return Ok(false);
        }

        let json = serde_json::to_string(record)
            .map_err(|e| anyhow!("Failed to serialize blacklist record: {}", e))?;
        conn.set::<_, _, ()>(
            blacklist_record_key(&record.operator_id, &record.failed_worker_id),
            json,
        )
        .await
        .map_err(|e| anyhow!("Failed to store blacklist record: {}", e))?;

        Ok(true)
    }

    async fn count_by_operator(&self, operator_id: &str) -> Result<i64> {
        let mut conn = self.get_connection().await?;
        let count: i64 = conn
            .scard(operator_workers_key(operator_id))
            .await
            .map_err(|e| anyhow!("Failed to count blacklisted workers: {}", e))?;
        Ok(count)
    }

    async fn set_operator_status(&self, operator_id: &str, status: BanStatus) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let members: Vec<String> = conn
            .smembers(operator_workers_key(operator_id))
            .await
            .map_err(|e| anyhow!("Failed to read operator blacklist: {}", e))?;

        for worker_id in members {
            let key = blacklist_record_key(operator_id, &worker_id);
            let json: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| anyhow!("Failed to read blacklist record: {}", e))?;

            let Some(json) = json else { continue };
            let Ok(mut record) = serde_json::from_str::<BlacklistRecord>(&json) else {
                tracing::warn!("unreadable blacklist record at {}, skipping", key);
                continue;
            };

            record.ban_status = status;
            let updated = serde_json::to_string(&record)
                .map_err(|e| anyhow!("Failed to serialize blacklist record: {}", e))?;
            conn.set::<_, _, ()>(&key, updated)
                .await
                .map_err(|e| anyhow!("Failed to update blacklist record: {}", e))?;
        }

        Ok(())
    }

    async fn records_by_operator(&self, operator_id: &str) -> Result<Vec<BlacklistRecord>> {
        let mut conn = self.get_connection().await?;
        let members: Vec<String> = conn
            .smembers(operator_workers_key(operator_id))
            .await
            .map_err(|e| anyhow!("Failed to read operator blacklist: {}", e))?;

        let mut records = Vec::with_capacity(members.len());
        for worker_id in members {
            let json: Option<String> = conn
                .get(blacklist_record_key(operator_id, &worker_id))
                .await
                .map_err(|e| anyhow!("Failed to read blacklist record: {}", e))?;
            if let Some(json) = json {
                if let Ok(record) = serde_json::from_str::<BlacklistRecord>(&json) {
                    records.push(record);
                }
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_creation() {
        // Client creation succeeds even for unreachable hosts; connection
        // establishment fails later.
        let result = RedisGuardStore::new("redis://invalid");
        assert!(result.is_ok());
    }

    #[test]
    fn test_worker_from_sparse_map() {
        let mut map = HashMap::new();
        map.insert("iterations".to_string(), "3".to_string());

        let worker = worker_from_map(42, &map);
        assert_eq!(worker.deal_id, 42);
        assert_eq!(worker.iterations, 3);
        assert_eq!(worker.ban_strikes, 0);
        assert!(worker.ban_status.is_none());
        assert!(!worker.is_frozen());
    }

    #[test]
    fn test_frozen_predicate() {
        let mut worker = worker_from_map(7, &HashMap::new());
        assert!(!worker.is_frozen());

        worker.ban_strikes = MAX_BAN_STRIKES;
        assert!(!worker.is_frozen());

        worker.ban_strikes = MAX_BAN_STRIKES + 1;
        assert!(worker.is_frozen());

        worker.ban_strikes = 0;
        worker.ban_status = Some(BanStatus::WorkerInPool);
        assert!(worker.is_frozen());
    }

    #[test]
    fn test_ban_status_round_trip() {
        for status in [BanStatus::Banned, BanStatus::OperatorBanned, BanStatus::WorkerInPool] {
            assert_eq!(BanStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BanStatus::parse("unknown"), None);
    }
}
