//! Blacklist enforcement - per-worker bans and operator-wide escalation
//!
//! Flow on a flagged deal:
//! 1. Enumerate the operator's workers
//! 2. Record the failing worker on the blacklist (idempotent)
//! 3. Recompute the operator's failed-worker ratio
//! 4. Past the ratio threshold: terminate the deal, ban the operator,
//!    flag the worker's own monitoring row

use chrono::Utc;
use std::sync::Arc;

use crate::config::Sensitivity;
use crate::error::TrackingError;
use crate::market::{ContractRegistry, ContractSnapshot, OperatorRegistry};
use crate::metrics::prometheus as metrics;
use crate::store::{BanStatus, BlacklistRecord, BlacklistStore, WorkerStore};

pub struct BlacklistEnforcer {
    operators: Arc<dyn OperatorRegistry>,
    contracts: Arc<dyn ContractRegistry>,
    workers: Arc<dyn WorkerStore>,
    blacklist: Arc<dyn BlacklistStore>,
    policy: Sensitivity,
}

impl BlacklistEnforcer {
    pub fn new(
        operators: Arc<dyn OperatorRegistry>,
        contracts: Arc<dyn ContractRegistry>,
        workers: Arc<dyn WorkerStore>,
        blacklist: Arc<dyn BlacklistStore>,
        policy: Sensitivity,
    ) -> Self {
        Self {
            operators,
            contracts,
            workers,
            blacklist,
            policy,
        }
    }

    /// Record a failing deal's worker on the blacklist and escalate to an
    /// operator-wide ban when too many of its workers have failed.
    pub async fn flag(&self, failing: &ContractSnapshot) -> Result<(), TrackingError> {
        let roster = self
            .operators
            .list_workers(&failing.operator_id)
            .await
            .map_err(TrackingError::lookup)?;

        let already = self
            .blacklist
            .contains(&failing.operator_id, &failing.worker_id)
            .await
            .map_err(TrackingError::lookup)?;

        if !already {
            let record = BlacklistRecord {
                operator_id: failing.operator_id.clone(),
                failed_worker_id: failing.worker_id.clone(),
                ban_status: BanStatus::Banned,
                deal_id: failing.deal_id,
                created_at: Utc::now(),
            };
            if self
                .blacklist
                .insert(&record)
                .await
                .map_err(TrackingError::enforcement)?
            {
                metrics::inc_blacklist_inserts();
                tracing::info!(
                    "worker {} of operator {} added to blacklist (deal {})",
                    failing.worker_id,
                    failing.operator_id,
                    failing.deal_id
                );
            }
        }

        // Each blacklist event is a strike against the worker's row; past the
        // ceiling the tracker freezes it.
        self.workers
            .add_ban_strike(failing.deal_id)
            .await
            .map_err(TrackingError::enforcement)?;

        let failed_count = self
            .blacklist
            .count_by_operator(&failing.operator_id)
            .await
            .map_err(TrackingError::lookup)?;
        let total_count = roster.len() as i64;

        // An operator that reached this path has at least one failing worker
        // and at least one worker in its list; zero here means the stores
        // disagree with each other.
        if failed_count == 0 {
            return Err(TrackingError::DataConsistency(format!(
                "operator {} triggered enforcement but has no blacklist rows",
                failing.operator_id
            )));
        }
        if total_count == 0 {
            return Err(TrackingError::DataConsistency(format!(
                "operator {} has an empty worker list",
                failing.operator_id
            )));
        }

        let clean_count = total_count - failed_count;
        let fail_ratio = failed_count as f64 * 100.0 / total_count as f64;

        tracing::info!(
            "operator {} failure ratio: {:.2}% ({} failed, {} clean, deal {})",
            failing.operator_id,
            fail_ratio,
            failed_count,
            clean_count,
            failing.deal_id
        );

        if fail_ratio > self.policy.bad_workers_percent {
            tracing::warn!(
                "terminating deal {}: operator {} exceeded failed-worker ratio ({:.2}% > {}%)",
                failing.deal_id,
                failing.operator_id,
                fail_ratio,
                self.policy.bad_workers_percent
            );
            self.contracts
                .terminate(failing.deal_id)
                .await
                .map_err(TrackingError::enforcement)?;
            self.blacklist
                .set_operator_status(&failing.operator_id, BanStatus::OperatorBanned)
                .await
                .map_err(TrackingError::enforcement)?;
            self.workers
                .set_banned(failing.deal_id, BanStatus::WorkerInPool, Utc::now())
                .await
                .map_err(TrackingError::enforcement)?;
            metrics::inc_operator_bans();
            metrics::inc_deals_terminated();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestHub;

    fn snapshot(deal_id: i64, operator: &str, worker: &str) -> ContractSnapshot {
        ContractSnapshot {
            deal_id,
            operator_id: operator.to_string(),
            worker_id: worker.to_string(),
            bid_hashrate: 1_000,
        }
    }

    fn policy(bad_workers_percent: f64) -> Sensitivity {
        Sensitivity {
            bad_workers_percent,
            ..Sensitivity::default()
        }
    }

    fn enforcer(hub: &Arc<TestHub>, policy: Sensitivity) -> BlacklistEnforcer {
        BlacklistEnforcer::new(
            hub.clone(),
            hub.clone(),
            hub.clone(),
            hub.clone(),
            policy,
        )
    }

    #[tokio::test]
    async fn flag_below_ratio_only_blacklists() {
        let hub = Arc::new(TestHub::new());
        hub.add_operator_workers("op1", 10);
        hub.seed_worker(1, 2, 0);

        // ratio after this flag: 1/10 = 10%, threshold 25 -> no escalation
        let enforcer = enforcer(&hub, policy(25.0));
        enforcer.flag(&snapshot(1, "op1", "op1-w0")).await.unwrap();

        assert_eq!(hub.blacklist_count("op1"), 1);
        assert!(hub.terminated_deals().is_empty());
        assert_eq!(hub.worker(1).ban_strikes, 1);
        assert!(hub.worker(1).ban_status.is_none());
    }

    #[tokio::test]
    async fn flag_is_idempotent_per_worker() {
        let hub = Arc::new(TestHub::new());
        hub.add_operator_workers("op1", 10);
        hub.seed_worker(1, 2, 0);

        let enforcer = enforcer(&hub, policy(25.0));
        enforcer.flag(&snapshot(1, "op1", "op1-w0")).await.unwrap();
        enforcer.flag(&snapshot(1, "op1", "op1-w0")).await.unwrap();

        assert_eq!(hub.blacklist_count("op1"), 1);
    }

    #[tokio::test]
    async fn ratio_above_threshold_escalates_to_operator_ban() {
        let hub = Arc::new(TestHub::new());
        hub.add_operator_workers("op1", 10);
        hub.seed_worker(1, 2, 0);
        // one worker already failed before this pass
        hub.seed_blacklist("op1", "op1-w9", 99);

        // 2/10 = 20% > 15 -> escalate
        let enforcer = enforcer(&hub, policy(15.0));
        enforcer.flag(&snapshot(1, "op1", "op1-w0")).await.unwrap();

        assert_eq!(hub.terminated_deals(), vec![1]);
        assert_eq!(hub.worker(1).ban_status, Some(BanStatus::WorkerInPool));
        assert!(hub
            .blacklist_records("op1")
            .iter()
            .all(|r| r.ban_status == BanStatus::OperatorBanned));
    }

    #[tokio::test]
    async fn boundary_ratio_does_not_escalate() {
        let hub = Arc::new(TestHub::new());
        hub.add_operator_workers("op1", 10);
        hub.seed_worker(1, 2, 0);
        hub.seed_blacklist("op1", "op1-w9", 99);

        // 2/10 = 20%, threshold exactly 20 -> strict comparison, no ban
        let enforcer = enforcer(&hub, policy(20.0));
        enforcer.flag(&snapshot(1, "op1", "op1-w0")).await.unwrap();

        assert!(hub.terminated_deals().is_empty());
        assert!(hub.worker(1).ban_status.is_none());
    }

    #[tokio::test]
    async fn empty_worker_list_is_a_consistency_failure() {
        let hub = Arc::new(TestHub::new());
        hub.seed_worker(1, 2, 0);

        let enforcer = enforcer(&hub, policy(25.0));
        let err = enforcer
            .flag(&snapshot(1, "op-empty", "w0"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackingError::DataConsistency(_)));
    }
}
