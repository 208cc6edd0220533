//! Batched emitter: aggregates worker output into windowed flushes.
//!
//! Pulls emit payload rows in small claimed batches, groups them by emitter
//! id, and flushes a group cache on two triggers: estimated size about to
//! exceed the configured cap, or age of the oldest buffered payload passing
//! the time window. Row deletion is the delivery acknowledgement; hooks see
//! success strictly after it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use docpipe_core::models::{EmitData, ErrorCode};
use docpipe_plugins::EmitterRegistry;
use docpipe_store::{SharedStore, TaskStore as _};
use docpipe_worker::decode_emit_payload;

use crate::hooks::EmitHook;

/// Rows pulled per claim.
const CLAIM_BATCH: i64 = 10;

/// Idle sleep between claims when the payload table is empty.
const EMPTY_POLL: Duration = Duration::from_millis(100);

/// Consecutive store failures tolerated before the emitter gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 25;

struct PendingEmit {
    emit_id: i64,
    size: usize,
    data: EmitData,
}

/// Per-emitter-id buffer. Insertion order within a group is claim order,
/// which preserves each worker's output order within a flush.
#[derive(Default)]
struct EmitCache {
    groups: BTreeMap<String, Vec<PendingEmit>>,
    estimated_bytes: usize,
}

impl EmitCache {
    fn insert(&mut self, pending: PendingEmit) {
        self.estimated_bytes += pending.size;
        self.groups
            .entry(pending.data.emit_key.emitter_id.clone())
            .or_default()
            .push(pending);
    }

    fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn take(&mut self) -> BTreeMap<String, Vec<PendingEmit>> {
        self.estimated_bytes = 0;
        std::mem::take(&mut self.groups)
    }
}

pub struct BatchEmitter {
    emitter_worker_id: i64,
    store: SharedStore,
    emitters: EmitterRegistry,
    hooks: Vec<Arc<dyn EmitHook>>,
    emit_within: Duration,
    emit_max_bytes: usize,
    retry_on_failure: bool,
    drain: watch::Receiver<bool>,
}

impl BatchEmitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        emitter_worker_id: i64,
        store: SharedStore,
        emitters: EmitterRegistry,
        hooks: Vec<Arc<dyn EmitHook>>,
        emit_within: Duration,
        emit_max_bytes: usize,
        retry_on_failure: bool,
        drain: watch::Receiver<bool>,
    ) -> Self {
        Self {
            emitter_worker_id,
            store,
            emitters,
            hooks,
            emit_within,
            emit_max_bytes,
            retry_on_failure,
            drain,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(emitter_worker_id = self.emitter_worker_id, "batch emitter started");
        let mut cache = EmitCache::default();
        let mut last_flush = Instant::now();
        let mut consecutive_failures = 0u32;

        loop {
            let step = self.step(&mut cache, &mut last_flush).await;
            let claimed_any = match step {
                Ok(claimed_any) => {
                    consecutive_failures = 0;
                    claimed_any
                }
                Err(err) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        consecutive_failures,
                        error = %err,
                        "emitter step failed"
                    );
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(err.context("task store unreachable"));
                    }
                    false
                }
            };

            if !claimed_any {
                let draining = *self.drain.borrow();
                if draining && cache.is_empty() && self.store.count_emits().await? == 0 {
                    tracing::info!(
                        emitter_worker_id = self.emitter_worker_id,
                        "emit payloads drained"
                    );
                    return Ok(());
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // Best effort: do not strand claimed rows.
                        self.release(&mut cache).await;
                        return Ok(());
                    }
                    _ = sleep(EMPTY_POLL) => {}
                }
            }
        }
    }

    /// Claim and buffer one batch, flushing on either trigger. Returns
    /// whether any rows were claimed.
    async fn step(&mut self, cache: &mut EmitCache, last_flush: &mut Instant) -> Result<bool> {
        let batch = self
            .store
            .claim_emit_batch(self.emitter_worker_id, CLAIM_BATCH)
            .await?;
        let claimed_any = !batch.is_empty();

        for row in batch {
            match decode_emit_payload(&row.bytes, row.uncompressed_size) {
                Ok(data) => {
                    let size = row.uncompressed_size.max(0) as usize;
                    // Flush ahead of the cap so no single flush carries more
                    // than emit_max_bytes.
                    if !cache.is_empty() && cache.estimated_bytes + size > self.emit_max_bytes {
                        self.flush(cache).await?;
                        *last_flush = Instant::now();
                    }
                    cache.insert(PendingEmit {
                        emit_id: row.id,
                        size,
                        data,
                    });
                }
                Err(err) => {
                    // A payload that cannot be decoded will never deliver;
                    // keeping it would wedge the drain.
                    tracing::error!(emit_id = row.id, error = %err, "dropping undecodable emit payload");
                    self.store
                        .insert_error_log(
                            row.id,
                            &format!("<emit:{}>", row.id),
                            0,
                            ErrorCode::UnreachableEmit,
                        )
                        .await?;
                    self.store.delete_emit(row.id).await?;
                }
            }
        }

        if cache.estimated_bytes > self.emit_max_bytes
            || (!cache.is_empty() && last_flush.elapsed() >= self.emit_within)
        {
            self.flush(cache).await?;
            *last_flush = Instant::now();
        }
        Ok(claimed_any)
    }

    /// Emit every buffered group. Rows of delivered groups are deleted; rows
    /// of failed groups are logged and either returned for retry or dropped,
    /// per configuration.
    async fn flush(&self, cache: &mut EmitCache) -> Result<()> {
        for (emitter_id, items) in cache.take() {
            let Some(emitter) = self.emitters.get(&emitter_id) else {
                tracing::error!(%emitter_id, "no emitter registered for id, dropping batch");
                self.fail_group(&items, false).await?;
                continue;
            };

            let batch: Vec<EmitData> = items.iter().map(|item| item.data.clone()).collect();
            match emitter.emit(&batch).await {
                Ok(()) => {
                    tracing::debug!(%emitter_id, batch = items.len(), "batch emitted");
                    for item in &items {
                        self.store.delete_emit(item.emit_id).await?;
                        for hook in &self.hooks {
                            hook.on_success(&item.data.emit_key).await;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(%emitter_id, error = %err, "emit failed");
                    self.fail_group(&items, self.retry_on_failure).await?;
                }
            }
        }
        Ok(())
    }

    async fn fail_group(&self, items: &[PendingEmit], retry: bool) -> Result<()> {
        for item in items {
            self.store
                .insert_error_log(
                    item.emit_id,
                    &item.data.emit_key.to_string(),
                    0,
                    ErrorCode::UnreachableEmit,
                )
                .await?;
            for hook in &self.hooks {
                hook.on_fail(&item.data.emit_key).await;
            }
        }
        let ids: Vec<i64> = items.iter().map(|item| item.emit_id).collect();
        if retry {
            self.store.reset_emits(&ids).await?;
        } else {
            for id in ids {
                self.store.delete_emit(id).await?;
            }
        }
        Ok(())
    }

    /// Return claimed-but-unflushed rows to READY on the way out.
    async fn release(&self, cache: &mut EmitCache) {
        let ids: Vec<i64> = cache
            .take()
            .values()
            .flatten()
            .map(|item| item.emit_id)
            .collect();
        if !ids.is_empty() {
            if let Err(err) = self.store.reset_emits(&ids).await {
                tracing::warn!(error = %err, "failed to release claimed emit rows");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docpipe_core::models::{EmitKey, Metadata};
    use docpipe_plugins::{EmitError, Emitter};
    use docpipe_store::{MemoryTaskStore, TaskStore};
    use docpipe_worker::encode_emit_payload;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEmitter {
        id: String,
        batches: Mutex<Vec<Vec<EmitData>>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingEmitter {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                ..Default::default()
            })
        }

        fn batches(&self) -> Vec<Vec<EmitData>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Emitter for RecordingEmitter {
        fn id(&self) -> &str {
            &self.id
        }

        async fn emit(&self, batch: &[EmitData]) -> Result<(), EmitError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(EmitError::Unreachable("sink down".to_string()));
            }
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    fn record(key: &str, content: &str) -> EmitData {
        let mut metadata = Metadata::new();
        metadata.insert("content".to_string(), content.to_string());
        EmitData::new(EmitKey::new("sink", key), vec![metadata])
    }

    async fn buffer(store: &SharedStore, data: &EmitData) {
        let (size, bytes) = encode_emit_payload(data).unwrap();
        store.insert_emit_payload(1, size, &bytes).await.unwrap();
    }

    fn emitter(
        store: SharedStore,
        sink: Arc<RecordingEmitter>,
        emit_max_bytes: usize,
        retry: bool,
    ) -> (BatchEmitter, watch::Sender<bool>) {
        let mut emitters = EmitterRegistry::new();
        emitters.register(sink);
        let (drain_tx, drain_rx) = watch::channel(false);
        (
            BatchEmitter::new(
                1000,
                store,
                emitters,
                Vec::new(),
                Duration::from_millis(50),
                emit_max_bytes,
                retry,
                drain_rx,
            ),
            drain_tx,
        )
    }

    #[tokio::test]
    async fn flushes_grouped_by_emitter_in_claim_order() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        let sink = RecordingEmitter::new("sink");
        buffer(&store, &record("a.txt", "first")).await;
        buffer(&store, &record("b.txt", "second")).await;

        let (mut emitter, _drain) = emitter(store.clone(), sink.clone(), 1_000_000, true);
        let mut cache = EmitCache::default();
        let mut last_flush = Instant::now() - Duration::from_secs(1);
        emitter.step(&mut cache, &mut last_flush).await.unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][0].emit_key.key, "a.txt");
        assert_eq!(batches[0][1].emit_key.key, "b.txt");
        assert_eq!(store.count_emits().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn size_trigger_keeps_every_flush_under_the_cap() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        let sink = RecordingEmitter::new("sink");
        let payload = "x".repeat(400);
        let mut sizes = Vec::new();
        for n in 0..6 {
            let data = record(&format!("{n}.txt"), &payload);
            let (size, _) = encode_emit_payload(&data).unwrap();
            sizes.push(size as usize);
            buffer(&store, &data).await;
        }
        let cap = sizes[0] * 2 + 1;

        let (mut emitter, _drain) = emitter(store.clone(), sink.clone(), cap, true);
        let mut cache = EmitCache::default();
        let mut last_flush = Instant::now() - Duration::from_secs(1);
        emitter.step(&mut cache, &mut last_flush).await.unwrap();
        // The tail below the cap flushes on the time trigger.
        sleep(Duration::from_millis(60)).await;
        emitter.step(&mut cache, &mut last_flush).await.unwrap();

        let batches = sink.batches();
        assert!(batches.len() >= 2, "expected multiple flushes");
        for batch in &batches {
            let estimated: usize = batch
                .iter()
                .map(|data| encode_emit_payload(data).unwrap().0 as usize)
                .sum();
            assert!(estimated <= cap);
        }
        assert_eq!(store.count_emits().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn time_trigger_flushes_a_small_batch() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        let sink = RecordingEmitter::new("sink");
        buffer(&store, &record("a.txt", "only")).await;

        let (mut emitter, _drain) = emitter(store.clone(), sink.clone(), 1_000_000, true);
        let mut cache = EmitCache::default();

        // First step buffers without flushing (window not elapsed).
        let mut last_flush = Instant::now();
        emitter.step(&mut cache, &mut last_flush).await.unwrap();
        assert!(sink.batches().is_empty());

        sleep(Duration::from_millis(60)).await;
        emitter.step(&mut cache, &mut last_flush).await.unwrap();
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(store.count_emits().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_flush_logs_and_returns_rows_for_retry() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        let sink = RecordingEmitter::new("sink");
        sink.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        buffer(&store, &record("a.txt", "doomed")).await;

        let (mut emitter, _drain) = emitter(store.clone(), sink.clone(), 1_000_000, true);
        let mut cache = EmitCache::default();
        let mut last_flush = Instant::now() - Duration::from_secs(1);
        emitter.step(&mut cache, &mut last_flush).await.unwrap();

        let errors = store.list_error_log().await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_code, ErrorCode::UnreachableEmit);
        assert_eq!(errors[0].fetch_key, "sink:a.txt");
        // The row is READY again for the next attempt.
        assert_eq!(store.count_emits().await.unwrap(), 1);
        assert_eq!(store.claim_emit_batch(2000, 10).await.unwrap().len(), 1);
        // The cache was cleared.
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failed_flush_without_retry_drops_rows() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        let sink = RecordingEmitter::new("sink");
        sink.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        buffer(&store, &record("a.txt", "doomed")).await;

        let (mut emitter, _drain) = emitter(store.clone(), sink.clone(), 1_000_000, false);
        let mut cache = EmitCache::default();
        let mut last_flush = Instant::now() - Duration::from_secs(1);
        emitter.step(&mut cache, &mut last_flush).await.unwrap();

        assert_eq!(store.count_emits().await.unwrap(), 0);
        assert_eq!(store.list_error_log().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_emitter_id_drops_the_group() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        let sink = RecordingEmitter::new("other");
        buffer(&store, &record("a.txt", "lost")).await;

        let (mut emitter, _drain) = emitter(store.clone(), sink, 1_000_000, true);
        let mut cache = EmitCache::default();
        let mut last_flush = Instant::now() - Duration::from_secs(1);
        emitter.step(&mut cache, &mut last_flush).await.unwrap();

        assert_eq!(store.count_emits().await.unwrap(), 0);
        let errors = store.list_error_log().await.unwrap();
        assert_eq!(errors[0].error_code, ErrorCode::UnreachableEmit);
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped_not_wedged() {
        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        store.insert_emit_payload(1, 99, b"garbage").await.unwrap();
        let sink = RecordingEmitter::new("sink");

        let (mut emitter, _drain) = emitter(store.clone(), sink.clone(), 1_000_000, true);
        let mut cache = EmitCache::default();
        let mut last_flush = Instant::now();
        emitter.step(&mut cache, &mut last_flush).await.unwrap();

        assert_eq!(store.count_emits().await.unwrap(), 0);
        assert!(sink.batches().is_empty());
        assert_eq!(store.list_error_log().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hooks_fire_after_row_deletion() {
        struct CountingHook {
            store: SharedStore,
            observed_counts: Mutex<Vec<i64>>,
        }

        #[async_trait]
        impl EmitHook for CountingHook {
            async fn on_success(&self, _emit_key: &EmitKey) {
                // Row deletion precedes the callback, so the table no longer
                // holds the delivered row.
                let count = self.store.count_emits().await.unwrap();
                self.observed_counts.lock().unwrap().push(count);
            }
            async fn on_fail(&self, _emit_key: &EmitKey) {}
        }

        let store: SharedStore = Arc::new(MemoryTaskStore::new());
        let sink = RecordingEmitter::new("sink");
        buffer(&store, &record("a.txt", "ok")).await;

        let hook = Arc::new(CountingHook {
            store: store.clone(),
            observed_counts: Mutex::new(Vec::new()),
        });
        let mut emitters = EmitterRegistry::new();
        emitters.register(sink);
        let (_drain_tx, drain_rx) = watch::channel(false);
        let mut emitter = BatchEmitter::new(
            1000,
            store.clone(),
            emitters,
            vec![hook.clone()],
            Duration::from_millis(50),
            1_000_000,
            true,
            drain_rx,
        );

        let mut cache = EmitCache::default();
        let mut last_flush = Instant::now() - Duration::from_secs(1);
        emitter.step(&mut cache, &mut last_flush).await.unwrap();

        assert_eq!(*hook.observed_counts.lock().unwrap(), vec![0]);
    }
}
