//! In-memory collaborators for exercising the tracking and enforcement
//! logic without Redis or a market node.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::market::{ContractRegistry, ContractSnapshot, OperatorRegistry, WorkerIdentity};
use crate::sampling::SampleProvider;
use crate::store::{BanStatus, BlacklistRecord, BlacklistStore, TrackedWorker, WorkerStore};

#[derive(Default)]
struct HubState {
    workers: HashMap<i64, TrackedWorker>,
    deals: HashMap<i64, ContractSnapshot>,
    rosters: HashMap<String, Vec<WorkerIdentity>>,
    blacklist: HashMap<String, Vec<BlacklistRecord>>,
    terminated: Vec<i64>,
    reported: f64,
    average: f64,
    sample_calls: u32,
    last_sample_address: Option<String>,
}

/// One object implementing every collaborator seam.
pub struct TestHub {
    state: Mutex<HubState>,
}

impl TestHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState::default()),
        }
    }

    pub fn seed_worker(&self, deal_id: i64, iterations: u64, ban_strikes: u32) {
        self.state.lock().unwrap().workers.insert(
            deal_id,
            TrackedWorker {
                deal_id,
                iterations,
                ban_strikes,
                last_reported_hashrate: 0.0,
                last_average_hashrate: 0.0,
                ban_status: None,
                banned_at: None,
            },
        );
    }

    pub fn seed_deal(&self, deal_id: i64, operator: &str, worker: &str, bid_hashrate: u64) {
        self.state.lock().unwrap().deals.insert(
            deal_id,
            ContractSnapshot {
                deal_id,
                operator_id: operator.to_string(),
                worker_id: worker.to_string(),
                bid_hashrate,
            },
        );
    }

    pub fn add_operator_workers(&self, operator: &str, count: usize) {
        let roster = (0..count)
            .map(|i| WorkerIdentity {
                worker_id: format!("{}-w{}", operator, i),
                operator_id: operator.to_string(),
            })
            .collect();
        self.state
            .lock()
            .unwrap()
            .rosters
            .insert(operator.to_string(), roster);
    }

    pub fn seed_blacklist(&self, operator: &str, worker: &str, deal_id: i64) {
        self.state
            .lock()
            .unwrap()
            .blacklist
            .entry(operator.to_string())
            .or_default()
            .push(BlacklistRecord {
                operator_id: operator.to_string(),
                failed_worker_id: worker.to_string(),
                ban_status: BanStatus::Banned,
                deal_id,
                created_at: Utc::now(),
            });
    }

    pub fn set_reported(&self, hashrate: f64) {
        self.state.lock().unwrap().reported = hashrate;
    }

    pub fn set_average(&self, hashrate: f64) {
        self.state.lock().unwrap().average = hashrate;
    }

    pub fn worker(&self, deal_id: i64) -> TrackedWorker {
        self.state.lock().unwrap().workers[&deal_id].clone()
    }

    pub fn blacklist_count(&self, operator: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .blacklist
            .get(operator)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn blacklist_records(&self, operator: &str) -> Vec<BlacklistRecord> {
        self.state
            .lock()
            .unwrap()
            .blacklist
            .get(operator)
            .cloned()
            .unwrap_or_default()
    }

    pub fn terminated_deals(&self) -> Vec<i64> {
        self.state.lock().unwrap().terminated.clone()
    }

    pub fn sample_calls(&self) -> u32 {
        self.state.lock().unwrap().sample_calls
    }

    pub fn last_sample_address(&self) -> Option<String> {
        self.state.lock().unwrap().last_sample_address.clone()
    }
}

#[async_trait]
impl WorkerStore for TestHub {
    async fn list_tracked(&self) -> Result<Vec<TrackedWorker>> {
        let state = self.state.lock().unwrap();
        let mut workers: Vec<TrackedWorker> = state.workers.values().cloned().collect();
        workers.sort_by_key(|w| w.deal_id);
        Ok(workers)
    }

    async fn register_worker(&self, deal_id: i64) -> Result<()> {
        self.seed_worker(deal_id, 0, 0);
        Ok(())
    }

    async fn set_iterations(&self, deal_id: i64, iterations: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let worker = state
            .workers
            .get_mut(&deal_id)
            .ok_or_else(|| anyhow!("unknown worker {}", deal_id))?;
        worker.iterations = iterations;
        Ok(())
    }

    async fn set_observed(&self, deal_id: i64, reported: f64, average: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let worker = state
            .workers
            .get_mut(&deal_id)
            .ok_or_else(|| anyhow!("unknown worker {}", deal_id))?;
        worker.last_reported_hashrate = reported;
        worker.last_average_hashrate = average;
        Ok(())
    }

    async fn add_ban_strike(&self, deal_id: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let worker = state
            .workers
            .get_mut(&deal_id)
            .ok_or_else(|| anyhow!("unknown worker {}", deal_id))?;
        worker.ban_strikes += 1;
        Ok(())
    }

    async fn set_banned(&self, deal_id: i64, status: BanStatus, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let worker = state
            .workers
            .get_mut(&deal_id)
            .ok_or_else(|| anyhow!("unknown worker {}", deal_id))?;
        worker.ban_status = Some(status);
        worker.banned_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl BlacklistStore for TestHub {
    async fn contains(&self, operator_id: &str, worker_id: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .blacklist
            .get(operator_id)
            .map(|v| v.iter().any(|r| r.failed_worker_id == worker_id))
            .unwrap_or(false))
    }

    async fn insert(&self, record: &BlacklistRecord) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let records = state
            .blacklist
            .entry(record.operator_id.clone())
            .or_default();
        if records
            .iter()
            .any(|r| r.failed_worker_id == record.failed_worker_id)
        {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }

    async fn count_by_operator(&self, operator_id: &str) -> Result<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .blacklist
            .get(operator_id)
            .map(|v| v.len() as i64)
            .unwrap_or(0))
    }

    async fn set_operator_status(&self, operator_id: &str, status: BanStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(records) = state.blacklist.get_mut(operator_id) {
            for record in records.iter_mut() {
                record.ban_status = status;
            }
        }
        Ok(())
    }

    async fn records_by_operator(&self, operator_id: &str) -> Result<Vec<BlacklistRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state.blacklist.get(operator_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ContractRegistry for TestHub {
    async fn resolve(&self, deal_id: i64) -> Result<ContractSnapshot> {
        let state = self.state.lock().unwrap();
        state
            .deals
            .get(&deal_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown deal {}", deal_id))
    }

    async fn terminate(&self, deal_id: i64) -> Result<()> {
        self.state.lock().unwrap().terminated.push(deal_id);
        Ok(())
    }
}

#[async_trait]
impl OperatorRegistry for TestHub {
    async fn list_workers(&self, operator_id: &str) -> Result<Vec<WorkerIdentity>> {
        let state = self.state.lock().unwrap();
        Ok(state.rosters.get(operator_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl SampleProvider for TestHub {
    async fn reported(&self, address: &str) -> Result<f64> {
        let mut state = self.state.lock().unwrap();
        state.sample_calls += 1;
        state.last_sample_address = Some(address.to_string());
        Ok(state.reported)
    }

    async fn average(&self, address: &str) -> Result<f64> {
        let mut state = self.state.lock().unwrap();
        state.sample_calls += 1;
        state.last_sample_address = Some(address.to_string());
        Ok(state.average)
    }
}
