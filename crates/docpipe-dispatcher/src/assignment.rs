//! Assignment manager: crash-recovery reassignment, queue rebalancing, and
//! the shutdown hand-off.
//!
//! Runs a short control loop against the store. Tick errors are logged and
//! swallowed so a transient store hiccup never kills the pipeline; only a
//! persistently unreachable store surfaces as fatal.

use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use docpipe_store::{SharedStore, TaskStore as _};

/// Consecutive failed ticks tolerated before the store is declared gone.
const MAX_CONSECUTIVE_FAILURES: u32 = 25;

/// Smallest queue length worth rebalancing.
const REBALANCE_FLOOR: i64 = 5;

/// Fraction of the imbalance moved per transfer, as a ratio.
const TRANSFER_NUMERATOR: i64 = 4;
const TRANSFER_DENOMINATOR: i64 = 5;

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Transfer {
    pub from: i64,
    pub to: i64,
    pub count: usize,
}

/// Pair the longest queue with the shortest (second-longest with
/// second-shortest, and so on) and move ~80% of each pair's imbalance when a
/// queue is oversized or a worker is starving. `counts` must be sorted by
/// count descending, worker id ascending on ties; equal-count pairs are left
/// alone.
pub(crate) fn plan_transfers(counts: &[(i64, i64)]) -> Vec<Transfer> {
    if counts.len() < 2 {
        return Vec::new();
    }
    let total: i64 = counts.iter().map(|(_, count)| count).sum();
    let average = total as f64 / counts.len() as f64;
    let threshold = (1.5 * average).max(REBALANCE_FLOOR as f64);

    let mut transfers = Vec::new();
    for i in 0..counts.len() / 2 {
        let (long_id, long_count) = counts[i];
        let (short_id, short_count) = counts[counts.len() - 1 - i];
        if long_count <= short_count {
            continue;
        }

        let oversized = long_count as f64 > threshold;
        let starving = short_count < REBALANCE_FLOOR && long_count > REBALANCE_FLOOR;
        if !(oversized || starving) {
            continue;
        }

        let count = (long_count - short_count) * TRANSFER_NUMERATOR / TRANSFER_DENOMINATOR;
        if count > 0 {
            transfers.push(Transfer {
                from: long_id,
                to: short_id,
                count: count as usize,
            });
        }
    }
    transfers
}

/// Pick `count` ids uniformly at random (partial Fisher-Yates).
fn sample_ids(rng: &mut StdRng, mut ids: Vec<i64>, count: usize) -> Vec<i64> {
    let count = count.min(ids.len());
    for i in 0..count {
        let j = rng.random_range(i..ids.len());
        ids.swap(i, j);
    }
    ids.truncate(count);
    ids
}

pub struct AssignmentManager {
    store: SharedStore,
    enqueuer_completed: watch::Receiver<bool>,
    rng: StdRng,
    tick: Duration,
}

impl AssignmentManager {
    pub fn new(
        store: SharedStore,
        enqueuer_completed: watch::Receiver<bool>,
        rng: StdRng,
        tick: Duration,
    ) -> Self {
        Self {
            store,
            enqueuer_completed,
            rng,
            tick,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(tick_ms = self.tick.as_millis() as u64, "assignment manager started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }

            match self.tick_once().await {
                Ok(true) => {
                    tracing::info!("all work drained, workers signalled to shut down");
                    return Ok(());
                }
                Ok(false) => consecutive_failures = 0,
                Err(err) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        consecutive_failures,
                        error = %err,
                        "assignment tick failed"
                    );
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(err.context("task store unreachable"));
                    }
                }
            }
        }
    }

    /// One control tick. Returns true once shutdown has been signalled.
    async fn tick_once(&mut self) -> Result<bool> {
        self.recover_missing_workers().await?;
        self.rebalance().await?;

        let producer_done = *self.enqueuer_completed.borrow();
        if producer_done && self.store.count_available().await? == 0 {
            self.store.set_active_workers_should_shutdown().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Hand the queues of vanished workers to live ones. In-flight rows of a
    /// vanished worker look exactly like a crash and are reset the same way.
    async fn recover_missing_workers(&mut self) -> Result<()> {
        let orphans = self.store.reset_orphaned_in_process().await?;
        if orphans > 0 {
            tracing::warn!(orphans, "reset in-flight rows of vanished workers");
        }

        let missing = self.store.find_missing_workers().await?;
        if missing.is_empty() {
            return Ok(());
        }
        let active = self.store.list_active_workers().await?;
        if active.is_empty() {
            // Nothing to hand the queue to yet; retry next tick.
            return Ok(());
        }
        for missing_id in missing {
            let target = active[self.rng.random_range(0..active.len())];
            let moved = self.store.reassign_available(missing_id, target).await?;
            tracing::warn!(
                missing_worker = missing_id,
                target_worker = target,
                moved,
                "recovered queue of missing worker"
            );
        }
        Ok(())
    }

    async fn rebalance(&mut self) -> Result<()> {
        let active = self.store.list_active_workers().await?;
        if active.len() < 2 {
            return Ok(());
        }

        let owned: HashMap<i64, i64> = self.store.available_counts().await?.into_iter().collect();
        let mut counts: Vec<(i64, i64)> = active
            .iter()
            .map(|id| (*id, owned.get(id).copied().unwrap_or(0)))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        for transfer in plan_transfers(&counts) {
            let ids = self
                .store
                .list_available_ids_for_worker(transfer.from)
                .await?;
            let sample = sample_ids(&mut self.rng, ids, transfer.count);
            let moved = self
                .store
                .reassign_tasks(&sample, transfer.to)
                .await
                .context("rebalance transfer failed")?;
            tracing::debug!(
                from_worker = transfer.from,
                to_worker = transfer.to,
                moved,
                "rebalanced queue"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_core::models::{TaskStatus, WorkerStatus};
    use docpipe_store::{MemoryTaskStore, TaskStore};
    use rand::SeedableRng;
    use std::sync::Arc;

    fn sorted(mut counts: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        counts
    }

    #[test]
    fn one_sided_load_moves_eighty_percent() {
        let plan = plan_transfers(&sorted(vec![(1, 50), (2, 0)]));
        assert_eq!(
            plan,
            vec![Transfer {
                from: 1,
                to: 2,
                count: 40
            }]
        );
    }

    #[test]
    fn balanced_queues_are_left_alone() {
        assert!(plan_transfers(&sorted(vec![(1, 20), (2, 20), (3, 20)])).is_empty());
        assert!(plan_transfers(&sorted(vec![(1, 10), (2, 8)])).is_empty());
    }

    #[test]
    fn starving_worker_is_fed_even_below_threshold() {
        // 8 is under 1.5x the average (9), but worker 2 is starving.
        let plan = plan_transfers(&sorted(vec![(1, 8), (2, 4)]));
        assert_eq!(
            plan,
            vec![Transfer {
                from: 1,
                to: 2,
                count: 3
            }]
        );
    }

    #[test]
    fn tiny_queues_are_not_shuffled() {
        assert!(plan_transfers(&sorted(vec![(1, 4), (2, 0)])).is_empty());
    }

    #[test]
    fn single_worker_has_nothing_to_do() {
        assert!(plan_transfers(&[(1, 100)]).is_empty());
    }

    #[test]
    fn pairs_are_longest_with_shortest() {
        let plan = plan_transfers(&sorted(vec![(1, 100), (2, 40), (3, 10), (4, 0)]));
        assert_eq!(plan.len(), 2);
        assert_eq!((plan[0].from, plan[0].to), (1, 4));
        assert_eq!((plan[1].from, plan[1].to), (2, 3));
    }

    #[test]
    fn rebalance_converges_within_log_ticks() {
        for initial in [
            vec![(1i64, 50i64), (2, 0)],
            vec![(1, 100), (2, 0), (3, 0), (4, 0)],
            vec![(1, 1000), (2, 0), (3, 0), (4, 0), (5, 0), (6, 0), (7, 0), (8, 0), (9, 0), (10, 0)],
        ] {
            let total: i64 = initial.iter().map(|(_, c)| c).sum();
            let workers = initial.len() as i64;
            let ticks = (total as f64).log2().ceil() as usize;

            let mut counts = sorted(initial);
            for _ in 0..ticks {
                let plan = plan_transfers(&counts);
                for transfer in plan {
                    let moved = transfer.count as i64;
                    for entry in counts.iter_mut() {
                        if entry.0 == transfer.from {
                            entry.1 -= moved;
                        } else if entry.0 == transfer.to {
                            entry.1 += moved;
                        }
                    }
                }
                counts = sorted(counts);
            }

            let max = counts.iter().map(|(_, c)| *c).max().unwrap();
            let min = counts.iter().map(|(_, c)| *c).min().unwrap();
            let average = total as f64 / workers as f64;
            let bound = (1.5 * average).max(5.0);
            assert!(
                (max - min) as f64 <= bound,
                "did not converge: spread {} > bound {bound}",
                max - min
            );
        }
    }

    #[test]
    fn sampling_is_deterministic_with_a_seed() {
        let ids: Vec<i64> = (1..=20).collect();
        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);
        assert_eq!(
            sample_ids(&mut rng_a, ids.clone(), 5),
            sample_ids(&mut rng_b, ids, 5)
        );
    }

    fn manager(
        store: SharedStore,
        completed: bool,
    ) -> (AssignmentManager, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(completed);
        (
            AssignmentManager::new(
                store,
                rx,
                StdRng::seed_from_u64(11),
                Duration::from_millis(10),
            ),
            tx,
        )
    }

    #[tokio::test]
    async fn dead_worker_queue_is_reassigned_within_a_tick() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        store.upsert_worker(2, WorkerStatus::Active).await.unwrap();
        // Worker 1 died and was deregistered; it still owns rows.
        for _ in 0..5 {
            store.insert_task("{}", 1).await.unwrap();
        }
        store.insert_task("{}", 1).await.unwrap();
        let in_flight = store.claim_next_task_for_worker(1).await.unwrap().unwrap();

        let (mut manager, _tx) = manager(store.clone(), false);
        manager.tick_once().await.unwrap();

        assert_eq!(
            store.list_available_ids_for_worker(2).await.unwrap().len(),
            6
        );
        // The in-flight row came back with its retry bumped.
        let recovered = store
            .list_available_ids_for_worker(2)
            .await
            .unwrap()
            .contains(&in_flight.id);
        assert!(recovered);
        assert_eq!(store.count_available().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn completion_flips_workers_and_ends_the_loop() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        store.upsert_worker(1, WorkerStatus::Active).await.unwrap();
        store.upsert_worker(2, WorkerStatus::Active).await.unwrap();

        let (mut manager, _tx) = manager(store.clone(), true);
        assert!(manager.tick_once().await.unwrap());
        assert!(store.list_active_workers().await.unwrap().is_empty());
        assert_eq!(
            store.get_worker(1).await.unwrap().unwrap().status,
            WorkerStatus::ShouldShutdown
        );
    }

    #[tokio::test]
    async fn completion_waits_for_pending_tasks() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        store.upsert_worker(1, WorkerStatus::Active).await.unwrap();
        store.insert_task("{}", 1).await.unwrap();

        let (mut manager, _tx) = manager(store.clone(), true);
        assert!(!manager.tick_once().await.unwrap());
        assert_eq!(
            store.get_worker(1).await.unwrap().unwrap().status,
            WorkerStatus::Active
        );
    }

    #[tokio::test]
    async fn rebalance_moves_rows_between_live_workers() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        store.upsert_worker(1, WorkerStatus::Active).await.unwrap();
        store.upsert_worker(2, WorkerStatus::Active).await.unwrap();
        for _ in 0..50 {
            store.insert_task("{}", 1).await.unwrap();
        }

        let (mut manager, _tx) = manager(store.clone(), false);
        manager.tick_once().await.unwrap();

        assert_eq!(
            store.list_available_ids_for_worker(1).await.unwrap().len(),
            10
        );
        assert_eq!(
            store.list_available_ids_for_worker(2).await.unwrap().len(),
            40
        );
        let claimed = store.claim_next_task_for_worker(2).await.unwrap().unwrap();
        // Moved rows keep their payload and retry count.
        assert_eq!(claimed.retry_count, 0);
    }

    #[tokio::test]
    async fn loop_survives_a_transient_store_outage() {
        let store = Arc::new(MemoryTaskStore::new());
        let shared: SharedStore = store.clone();
        shared.upsert_worker(1, WorkerStatus::Active).await.unwrap();

        let (mut manager, _tx) = manager(shared.clone(), false);
        store.set_unreachable(true);
        assert!(manager.tick_once().await.is_err());
        store.set_unreachable(false);
        assert!(!manager.tick_once().await.unwrap());
    }

    #[tokio::test]
    async fn in_process_rows_of_live_workers_are_untouched() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        store.upsert_worker(1, WorkerStatus::Active).await.unwrap();
        store.insert_task("{}", 1).await.unwrap();
        store.claim_next_task_for_worker(1).await.unwrap().unwrap();

        let (mut manager, _tx) = manager(store.clone(), false);
        manager.tick_once().await.unwrap();

        let rows = store.list_in_process_for_worker(1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TaskStatus::InProcess);
    }
}
