//! Hashrate deviation tracking - one pass over every monitored worker
//!
//! Each pass advances a worker's iteration counter (persisted before any
//! evaluation, so a crash cannot re-run an iteration), pulls the sample
//! class its phase calls for, compares against the deal's bid hashrate and
//! hands the resulting deviation to the classifier. Zero observed output
//! skips the percentage math and goes straight to enforcement.

use chrono::Utc;
use std::sync::Arc;

use crate::classifier::{classify, deviation_percent, Action, SEVERE_DEVIATION_PERCENT};
use crate::config::Sensitivity;
use crate::enforcer::BlacklistEnforcer;
use crate::error::{TrackingError, WorkerFailure};
use crate::market::{ContractRegistry, ContractSnapshot};
use crate::metrics::prometheus as metrics;
use crate::sampling::{SamplePhase, SampleProvider, AVG_WINDOW_SUFFIX};
use crate::store::{BanStatus, TrackedWorker, WorkerStore};

pub struct DeviationTracker {
    workers: Arc<dyn WorkerStore>,
    contracts: Arc<dyn ContractRegistry>,
    samples: Arc<dyn SampleProvider>,
    enforcer: BlacklistEnforcer,
    policy: Sensitivity,
    pool_address: String,
}

impl DeviationTracker {
    pub fn new(
        workers: Arc<dyn WorkerStore>,
        contracts: Arc<dyn ContractRegistry>,
        samples: Arc<dyn SampleProvider>,
        enforcer: BlacklistEnforcer,
        policy: Sensitivity,
        pool_address: String,
    ) -> Self {
        Self {
            workers,
            contracts,
            samples,
            enforcer,
            policy,
            pool_address,
        }
    }

    /// Run one tracking pass over every monitored worker.
    ///
    /// Per-worker sampling and enforcement failures are collected and the
    /// pass keeps going; registry and worker-list failures abort it.
    pub async fn run(&self) -> Result<(), TrackingError> {
        let workers = self
            .workers
            .list_tracked()
            .await
            .map_err(TrackingError::lookup)?;
        metrics::set_tracked_workers(workers.len());

        let mut failures: Vec<WorkerFailure> = Vec::new();

        for w in workers {
            if w.is_frozen() {
                continue;
            }

            if w.iterations == 0 {
                // Cold start: no pool data collected yet, just open the
                // grace period and evaluate from the next pass on.
                if let Err(e) = self.workers.set_iterations(w.deal_id, 1).await {
                    tracing::error!("worker {} cold-start persist failed: {:#}", w.deal_id, e);
                    failures.push(WorkerFailure { deal_id: w.deal_id, error: e });
                }
                continue;
            }

            // Persisted before evaluation so a crash mid-pass does not
            // re-run the same iteration.
            if let Err(e) = self.workers.set_iterations(w.deal_id, w.iterations + 1).await {
                tracing::error!("worker {} iteration persist failed, skipping evaluation: {:#}", w.deal_id, e);
                failures.push(WorkerFailure { deal_id: w.deal_id, error: e });
                continue;
            }

            // A broken deal lookup is systemic, not per-worker.
            let deal = self
                .contracts
                .resolve(w.deal_id)
                .await
                .map_err(TrackingError::lookup)?;
            if deal.bid_hashrate == 0 {
                return Err(TrackingError::DataConsistency(format!(
                    "deal {} has zero bid hashrate",
                    w.deal_id
                )));
            }

            metrics::inc_workers_visited();
            if let Err(e) = self.evaluate(&w, &deal).await {
                tracing::error!("worker {} evaluation failed: {:#}", w.deal_id, e);
                failures.push(WorkerFailure { deal_id: w.deal_id, error: e });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TrackingError::Pass(failures))
        }
    }

    async fn evaluate(&self, w: &TrackedWorker, deal: &ContractSnapshot) -> anyhow::Result<()> {
        let phase = SamplePhase::for_iteration(w.iterations, self.policy.steady_phase_iterations);
        let observed = match phase {
            SamplePhase::Early => {
                let hr = self.samples.reported(&self.pool_address).await?;
                self.workers
                    .set_observed(w.deal_id, hr, w.last_average_hashrate)
                    .await?;
                tracing::info!(
                    "worker {} reported hashrate: {} H/s (iteration {})",
                    w.deal_id,
                    hr,
                    w.iterations
                );
                hr
            }
            SamplePhase::Steady => {
                let address = format!("{}{}", self.pool_address, AVG_WINDOW_SUFFIX);
                let hr = self.samples.average(&address).await?;
                self.workers
                    .set_observed(w.deal_id, w.last_reported_hashrate, hr)
                    .await?;
                tracing::info!(
                    "worker {} average hashrate: {} H/s (iteration {})",
                    w.deal_id,
                    hr,
                    w.iterations
                );
                hr
            }
        };

        if observed == 0.0 {
            // Total signal loss under a live commitment: no percentage
            // needed, straight to enforcement.
            tracing::info!("worker {} observed hashrate is 0, sending to blacklist", w.deal_id);
            metrics::inc_signal_loss();
            self.enforcer.flag(deal).await?;
            return Ok(());
        }

        let deviation = deviation_percent(observed, deal.bid_hashrate);
        if deviation <= 0.0 {
            tracing::info!(
                "worker {} meets its commitment ({:.2}% over bid)",
                w.deal_id,
                -deviation
            );
            return Ok(());
        }

        tracing::info!(
            "worker {} deviation: {:.2}% (iteration {}, observed {} H/s, bid {} H/s)",
            w.deal_id,
            deviation,
            w.iterations,
            observed,
            deal.bid_hashrate
        );
        metrics::inc_deviations();

        match classify(deviation, &self.policy) {
            Action::Terminate => {
                tracing::warn!(
                    "worker {} deviates {:.2}% (>= {}%), terminating deal",
                    w.deal_id,
                    deviation,
                    SEVERE_DEVIATION_PERCENT
                );
                self.contracts.terminate(deal.deal_id).await?;
                self.workers
                    .set_banned(deal.deal_id, BanStatus::WorkerInPool, Utc::now())
                    .await?;
                metrics::inc_deals_terminated();
            }
            Action::Blacklist => {
                self.enforcer.flag(deal).await?;
            }
            Action::Tolerate => {
                tracing::debug!(
                    "worker {} deviation {:.2}% below sensitivity",
                    w.deal_id,
                    deviation
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestHub;

    fn policy(soft: f64, bad_workers: f64) -> Sensitivity {
        Sensitivity {
            worker_limit_change_percent: soft,
            bad_workers_percent: bad_workers,
            steady_phase_iterations: 4,
        }
    }

    fn tracker(hub: &Arc<TestHub>, policy: Sensitivity) -> DeviationTracker {
        let enforcer = BlacklistEnforcer::new(
            hub.clone(),
            hub.clone(),
            hub.clone(),
            hub.clone(),
            policy,
        );
        DeviationTracker::new(
            hub.clone(),
            hub.clone(),
            hub.clone(),
            enforcer,
            policy,
            "0xpool".to_string(),
        )
    }

    #[tokio::test]
    async fn cold_start_advances_counter_without_sampling() {
        let hub = Arc::new(TestHub::new());
        hub.seed_worker(1, 0, 0);
        hub.seed_deal(1, "op1", "op1-w0", 1_000);

        tracker(&hub, policy(4.0, 50.0)).run().await.unwrap();

        assert_eq!(hub.worker(1).iterations, 1);
        assert_eq!(hub.sample_calls(), 0);
        assert!(hub.terminated_deals().is_empty());
    }

    #[tokio::test]
    async fn frozen_workers_are_never_visited() {
        let hub = Arc::new(TestHub::new());
        hub.seed_worker(1, 3, 6);
        hub.seed_deal(1, "op1", "op1-w0", 1_000);
        hub.set_reported(100.0); // would be a severe deviation if visited

        let t = tracker(&hub, policy(4.0, 50.0));
        for _ in 0..5 {
            t.run().await.unwrap();
        }

        assert_eq!(hub.worker(1).iterations, 3);
        assert_eq!(hub.sample_calls(), 0);
    }

    #[tokio::test]
    async fn severe_deviation_terminates_and_bans_worker_row() {
        let hub = Arc::new(TestHub::new());
        hub.add_operator_workers("op1", 10);
        hub.seed_worker(1, 1, 0);
        hub.seed_deal(1, "op1", "op1-w0", 1_000);
        hub.set_reported(800.0); // deviation exactly 20%

        tracker(&hub, policy(4.0, 50.0)).run().await.unwrap();

        assert_eq!(hub.terminated_deals(), vec![1]);
        assert_eq!(hub.worker(1).ban_status, Some(BanStatus::WorkerInPool));
        // severe path bypasses the blacklist entirely
        assert_eq!(hub.blacklist_count("op1"), 0);
    }

    #[tokio::test]
    async fn soft_deviation_goes_through_blacklist_without_termination() {
        let hub = Arc::new(TestHub::new());
        hub.add_operator_workers("op1", 10);
        hub.seed_worker(1, 1, 0);
        hub.seed_deal(1, "op1", "op1-w0", 1_000);
        hub.set_reported(950.0); // deviation 5%

        tracker(&hub, policy(4.0, 25.0)).run().await.unwrap();

        assert_eq!(hub.blacklist_count("op1"), 1);
        assert!(hub.terminated_deals().is_empty());
        assert_eq!(hub.worker(1).iterations, 2);
    }

    #[tokio::test]
    async fn zero_hashrate_routes_to_enforcement_in_any_phase() {
        for iterations in [1u64, 10] {
            let hub = Arc::new(TestHub::new());
            hub.add_operator_workers("op1", 10);
            hub.seed_worker(1, iterations, 0);
            hub.seed_deal(1, "op1", "op1-w0", 1_000);
            hub.set_reported(0.0);
            hub.set_average(0.0);

            tracker(&hub, policy(4.0, 50.0)).run().await.unwrap();

            assert_eq!(hub.blacklist_count("op1"), 1, "iterations={}", iterations);
            assert!(hub.terminated_deals().is_empty());
        }
    }

    #[tokio::test]
    async fn meeting_the_commitment_takes_no_action() {
        let hub = Arc::new(TestHub::new());
        hub.add_operator_workers("op1", 10);
        hub.seed_worker(1, 1, 0);
        hub.seed_deal(1, "op1", "op1-w0", 1_000);
        hub.set_reported(1_100.0);

        tracker(&hub, policy(4.0, 50.0)).run().await.unwrap();

        assert_eq!(hub.blacklist_count("op1"), 0);
        assert!(hub.terminated_deals().is_empty());
        assert_eq!(hub.worker(1).ban_strikes, 0);
    }

    #[tokio::test]
    async fn steady_phase_reads_the_averaging_window() {
        let hub = Arc::new(TestHub::new());
        hub.add_operator_workers("op1", 10);
        hub.seed_worker(1, 4, 0);
        hub.seed_deal(1, "op1", "op1-w0", 1_000);
        hub.set_reported(500.0); // must not be used in steady phase
        hub.set_average(990.0); // deviation 1% -> tolerated

        tracker(&hub, policy(4.0, 50.0)).run().await.unwrap();

        assert_eq!(hub.blacklist_count("op1"), 0);
        assert!(hub.terminated_deals().is_empty());
        assert_eq!(hub.last_sample_address().as_deref(), Some("0xpool/1"));
        assert_eq!(hub.worker(1).last_average_hashrate, 990.0);
    }

    #[tokio::test]
    async fn early_phase_reads_the_reported_address() {
        let hub = Arc::new(TestHub::new());
        hub.add_operator_workers("op1", 10);
        hub.seed_worker(1, 3, 0);
        hub.seed_deal(1, "op1", "op1-w0", 1_000);
        hub.set_reported(990.0);

        tracker(&hub, policy(4.0, 50.0)).run().await.unwrap();

        assert_eq!(hub.last_sample_address().as_deref(), Some("0xpool"));
        assert_eq!(hub.worker(1).last_reported_hashrate, 990.0);
    }

    #[tokio::test]
    async fn one_failing_worker_does_not_starve_the_batch() {
        let hub = Arc::new(TestHub::new());
        // worker 1's operator has no roster -> enforcement fails for it
        hub.seed_worker(1, 1, 0);
        hub.seed_deal(1, "op-empty", "w0", 1_000);
        // worker 2 is healthy under a populated operator
        hub.add_operator_workers("op2", 10);
        hub.seed_worker(2, 1, 0);
        hub.seed_deal(2, "op2", "op2-w0", 1_000);
        hub.set_reported(950.0); // deviation 5% -> both flag

        let err = tracker(&hub, policy(4.0, 50.0)).run().await.unwrap_err();

        let TrackingError::Pass(failures) = err else {
            panic!("expected aggregate pass error");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].deal_id, 1);
        // worker 2 was still evaluated and blacklisted
        assert_eq!(hub.blacklist_count("op2"), 1);
        assert_eq!(hub.worker(2).iterations, 2);
    }

    #[tokio::test]
    async fn missing_deal_aborts_the_pass() {
        let hub = Arc::new(TestHub::new());
        hub.seed_worker(1, 1, 0);
        // no deal seeded for 1

        let err = tracker(&hub, policy(4.0, 50.0)).run().await.unwrap_err();
        assert!(matches!(err, TrackingError::Lookup(_)));
        // the iteration advance had already been persisted
        assert_eq!(hub.worker(1).iterations, 2);
    }

    #[tokio::test]
    async fn zero_bid_hashrate_is_a_data_error_not_a_deviation() {
        let hub = Arc::new(TestHub::new());
        hub.add_operator_workers("op1", 10);
        hub.seed_worker(1, 1, 0);
        hub.seed_deal(1, "op1", "op1-w0", 0);
        hub.set_reported(950.0);

        let err = tracker(&hub, policy(4.0, 50.0)).run().await.unwrap_err();
        assert!(matches!(err, TrackingError::DataConsistency(_)));
        assert_eq!(hub.blacklist_count("op1"), 0);
    }
}
