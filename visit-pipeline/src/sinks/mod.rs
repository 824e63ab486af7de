use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, gauge, histogram};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStore, ProcessorCheckpoint};
use crate::error::{CheckpointError, PipelineError, SinkError, StoreError};
use crate::event::{RecordBatch, SourceRecord};
use crate::metrics_consts::{
    CAS_CONFLICTS, CHECKPOINT_COMMIT_DURATION, CHECKPOINT_FAILURES, RECORDS_REPUBLISHED,
    SINK_COMMIT_DURATION, SINK_ERRORS, SINK_FAILURES, SINK_PENDING, SINK_RECORDS_DROPPED,
    SINK_RECORDS_PROCESSED, SINK_RECORDS_SKIPPED, SINK_RETRIES,
};
use crate::retry::RetryPolicy;
use crate::stores::kv::KvStore;
use crate::stores::stream::{OutputMessage, OutputStream};

pub mod abandoned_cart;
pub mod long_duration;
pub mod running_aggregate;
pub mod windowed;

// Idle processors still report to the liveness check this often
const IDLE_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// One independent consumer of the normalized stream.
///
/// Each processor runs on its own task and owns its sink state exclusively.
/// `process` errors are reported and counted, then the processor moves on to
/// the next batch: they never stop the pipeline. `SinkError::Overflow` stops
/// the processor itself until the process is restarted.
#[async_trait]
pub trait SinkProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rebuilds in-memory state from the last checkpointed state.
    fn restore(&mut self, _state: Option<serde_json::Value>) -> Result<(), SinkError> {
        Ok(())
    }

    async fn process(&mut self, records: &[SourceRecord]) -> Result<(), SinkError>;

    /// Last chance to write held-back work before shutdown.
    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// State committed along with the offsets.
    fn checkpoint_state(&self) -> Result<Option<serde_json::Value>, SinkError> {
        Ok(None)
    }

    /// False while records consumed so far are not durable in the sink nor
    /// in `checkpoint_state`. The checkpoint is held back until then.
    fn can_advance(&self) -> bool {
        true
    }
}

/// Counters of one processor's run, returned when its task ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkSummary {
    pub name: &'static str,
    pub batches: u64,
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub offsets: BTreeMap<i32, i64>,
}

/// Loads the checkpoint of `processor` and hands its state back to it.
/// Returns the offsets to resume from, empty if it never committed.
pub async fn restore_processor(
    processor: &mut dyn SinkProcessor,
    checkpoints: &dyn CheckpointStore,
) -> Result<BTreeMap<i32, i64>, PipelineError> {
    let name = processor.name();
    let Some(checkpoint) = checkpoints.load(name).await? else {
        info!(processor = name, "no checkpoint, starting fresh");
        return Ok(BTreeMap::new());
    };

    info!(processor = name, offsets = ?checkpoint.offsets, "restoring from checkpoint");
    processor
        .restore(checkpoint.state)
        .map_err(|e| PipelineError::Restore(name, e))?;
    Ok(checkpoint.offsets)
}

/// Body of a processor task: apply every batch received until the channel
/// closes, committing the checkpoint after each one.
///
/// Sink errors leave the processor live: it keeps consuming, holding its
/// checkpoint back as needed. An `Overflow` ends the task and marks it
/// unhealthy, so a restart replays what it shed from its last checkpoint.
/// Checkpoint failures also end the task, they are fatal for the pipeline.
pub async fn run_sink(
    mut processor: Box<dyn SinkProcessor>,
    mut offsets: BTreeMap<i32, i64>,
    checkpoints: Arc<dyn CheckpointStore>,
    mut batches: mpsc::Receiver<Arc<RecordBatch>>,
    liveness: HealthHandle,
) -> Result<SinkSummary, CheckpointError> {
    let name = processor.name();
    let mut summary = SinkSummary {
        name,
        ..Default::default()
    };
    let mut committed = offsets.clone();
    liveness.report_healthy();

    loop {
        let batch = match tokio::time::timeout(IDLE_REPORT_INTERVAL, batches.recv()).await {
            Ok(Some(batch)) => batch,
            Ok(None) => break,
            Err(_idle) => {
                liveness.report_healthy();
                continue;
            }
        };
        summary.batches += 1;

        // Records below our own checkpoint were applied before a restart
        let fresh: Vec<SourceRecord> = batch
            .records
            .iter()
            .filter(|record| {
                offsets
                    .get(&record.partition)
                    .map_or(true, |&next| record.offset >= next)
            })
            .cloned()
            .collect();
        let skipped = (batch.records.len() - fresh.len()) as u64;
        if skipped > 0 {
            debug!(processor = name, skipped, "skipping already applied records");
            counter!(SINK_RECORDS_SKIPPED, "sink" => name).increment(skipped);
        }
        summary.skipped += skipped;

        let start = Instant::now();
        match processor.process(&fresh).await {
            Ok(()) => {
                histogram!(SINK_COMMIT_DURATION, "sink" => name)
                    .record(start.elapsed().as_secs_f64());
            }
            Err(e @ SinkError::Overflow { .. }) => {
                error!(processor = name, "stopping until restarted: {e}");
                counter!(SINK_FAILURES, "sink" => name).increment(1);
                liveness.report_unhealthy(e.to_string());
                summary.errors += 1;
                summary.offsets = committed;
                return Ok(summary);
            }
            Err(e) => {
                error!(processor = name, "sink error: {e:#}");
                counter!(SINK_ERRORS, "sink" => name).increment(1);
                summary.errors += 1;
            }
        }
        // The store may be down, this loop is still making progress
        liveness.report_healthy();
        counter!(SINK_RECORDS_PROCESSED, "sink" => name).increment(fresh.len() as u64);
        summary.processed += fresh.len() as u64;

        for (&partition, &next) in &batch.next_offsets {
            let entry = offsets.entry(partition).or_insert(next);
            *entry = (*entry).max(next);
        }

        if processor.can_advance() {
            commit_checkpoint(processor.as_ref(), &offsets, &mut committed, checkpoints.as_ref())
                .await
                .inspect_err(|_| liveness.report_unhealthy("checkpoint medium unavailable"))?;
        } else {
            debug!(processor = name, "holding checkpoint back until pending work is written");
        }
    }

    info!(processor = name, "input closed, flushing");
    if let Err(e) = processor.flush().await {
        warn!(processor = name, "flush on shutdown failed: {e:#}");
        counter!(SINK_ERRORS, "sink" => name).increment(1);
        summary.errors += 1;
    }
    if processor.can_advance() {
        commit_checkpoint(processor.as_ref(), &offsets, &mut committed, checkpoints.as_ref())
            .await?;
    }

    summary.offsets = committed;
    info!(processor = name, ?summary, "processor stopped");
    Ok(summary)
}

async fn commit_checkpoint(
    processor: &dyn SinkProcessor,
    offsets: &BTreeMap<i32, i64>,
    committed: &mut BTreeMap<i32, i64>,
    checkpoints: &dyn CheckpointStore,
) -> Result<(), CheckpointError> {
    let name = processor.name();
    let state = match processor.checkpoint_state() {
        Ok(state) => state,
        Err(e) => {
            // Keep the previous checkpoint, the records will be replayed
            error!(processor = name, "cannot serialize processor state: {e:#}");
            counter!(SINK_ERRORS, "sink" => name).increment(1);
            return Ok(());
        }
    };
    if offsets == committed && state.is_none() {
        return Ok(());
    }

    let checkpoint = ProcessorCheckpoint {
        offsets: offsets.clone(),
        state,
    };
    let start = Instant::now();
    match checkpoints.commit(name, &checkpoint).await {
        Ok(()) => {
            histogram!(CHECKPOINT_COMMIT_DURATION, "sink" => name)
                .record(start.elapsed().as_secs_f64());
            *committed = checkpoint.offsets;
            Ok(())
        }
        Err(e) => {
            error!(processor = name, "checkpoint commit failed: {e:#}");
            counter!(CHECKPOINT_FAILURES, "sink" => name).increment(1);
            Err(e)
        }
    }
}

/// Next offset already folded into a stored aggregate, per partition.
///
/// Stored next to the aggregate itself so that a record replayed after a
/// crash is recognized and ignored, whatever the processor's checkpoint says.
pub type AppliedOffsets = BTreeMap<i32, i64>;

/// Marks `offset` as applied. Returns false if it was already.
pub fn mark_applied(applied: &mut AppliedOffsets, partition: i32, offset: i64) -> bool {
    let next = applied.entry(partition).or_insert(0);
    if offset < *next {
        return false;
    }
    *next = offset + 1;
    true
}

/// A record's position and the one value a keyed aggregate needs from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingVisit<T> {
    pub partition: i32,
    pub offset: i64,
    pub value: T,
}

/// Read-modify-write of one JSON value through compare-and-set.
///
/// `apply` folds the pending records into the current value and returns how
/// many of them were new. Store calls are retried with `policy`, conflicts
/// with other writers up to `max_cas_attempts` times. `register` is a
/// `(set, member)` pair added to a set before the key is first created, so
/// the set always lists every key that may exist.
pub struct CasUpdate<'a> {
    pub sink: &'static str,
    pub kv: &'a dyn KvStore,
    pub policy: &'a RetryPolicy,
    pub max_cas_attempts: u32,
    pub register: Option<(&'a str, &'a str)>,
}

impl CasUpdate<'_> {
    pub async fn run<T, F>(&self, key: &str, init: T, apply: F) -> Result<(T, usize), SinkError>
    where
        T: Serialize + DeserializeOwned + Clone + Send,
        F: Fn(&mut T) -> usize + Send + Sync,
    {
        let kv = self.kv;
        let unavailable = |(source, attempts): (StoreError, u32)| SinkError::Unavailable {
            sink: self.sink,
            attempts,
            source,
        };

        for attempt in 1..=self.max_cas_attempts {
            let current = self
                .policy
                .retry(self.sink, move || kv.get(key))
                .await
                .map_err(unavailable)?;

            let mut value = match &current {
                Some(raw) => serde_json::from_str(raw).map_err(|e| SinkError::Unavailable {
                    sink: self.sink,
                    attempts: 1,
                    source: StoreError::Corrupt(e),
                })?,
                None => init.clone(),
            };
            let applied = apply(&mut value);
            if applied == 0 {
                return Ok((value, 0));
            }

            let serialized = serde_json::to_string(&value).map_err(|source| {
                SinkError::Serialization {
                    sink: self.sink,
                    source,
                }
            })?;

            if let (None, Some((set, member))) = (&current, self.register) {
                self.policy
                    .retry(self.sink, move || kv.add_to_set(set, member))
                    .await
                    .map_err(unavailable)?;
            }

            let expected = current.as_deref();
            let new = serialized.as_str();
            let written = self
                .policy
                .retry(self.sink, move || kv.compare_and_set(key, expected, new))
                .await
                .map_err(unavailable)?;
            if written {
                return Ok((value, applied));
            }

            debug!(sink = self.sink, key, attempt, "compare-and-set conflict");
            counter!(CAS_CONFLICTS, "sink" => self.sink).increment(1);
        }

        Err(SinkError::CasExhausted {
            key: key.to_owned(),
            attempts: self.max_cas_attempts,
        })
    }
}

/// Publishes everything in `pending`, retrying the failed messages with
/// `policy`.
///
/// Messages still failing once attempts run out stay in `pending` for the
/// next call and are surfaced as `Unavailable`. Messages the broker rejects
/// outright are dropped at once.
pub async fn publish_with_retry(
    sink: &'static str,
    stream: &dyn OutputStream,
    policy: &RetryPolicy,
    pending: &mut Vec<OutputMessage>,
) -> Result<(), SinkError> {
    let mut outcome = Ok(());
    let mut rejected = 0;
    let mut attempt = 0;

    while !pending.is_empty() {
        let results = stream.publish_batch(pending.as_slice()).await;
        attempt += 1;

        let mut failed = Vec::new();
        let mut last_error = None;
        let mut published = 0;
        for (message, result) in std::mem::take(pending).into_iter().zip(results) {
            match result {
                Ok(()) => published += 1,
                Err(e) if e.is_retryable() => {
                    failed.push(message);
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(sink, key = %message.key, "message rejected, dropping it: {e}");
                    rejected += 1;
                }
            }
        }
        counter!(RECORDS_REPUBLISHED, "sink" => sink, "topic" => stream.topic().to_owned())
            .increment(published);
        *pending = failed;

        let Some(source) = last_error else {
            break;
        };
        if attempt >= policy.max_attempts() {
            outcome = Err(SinkError::Unavailable {
                sink,
                attempts: attempt,
                source,
            });
            break;
        }

        let backoff = policy.time_until_next_retry(attempt - 1);
        warn!(
            sink,
            attempt,
            failed = pending.len(),
            backoff_ms = backoff.as_millis() as u64,
            "publish failed, retrying: {source}"
        );
        counter!(SINK_RETRIES, "sink" => sink).increment(1);
        tokio::time::sleep(backoff).await;
    }

    if rejected > 0 {
        counter!(SINK_RECORDS_DROPPED, "sink" => sink).increment(rejected as u64);
        outcome = outcome.and(Err(SinkError::Dropped {
            sink,
            dropped: rejected,
        }));
    }
    outcome
}

/// Reports how many entries `sink` holds back for a retry, failing with
/// `Overflow` past `limit`.
pub(crate) fn check_backlog(
    sink: &'static str,
    pending: usize,
    limit: usize,
) -> Result<(), SinkError> {
    gauge!(SINK_PENDING, "sink" => sink).set(pending as f64);
    if pending > limit {
        return Err(SinkError::Overflow {
            sink,
            pending,
            limit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::DateTime;
    use health::HealthRegistry;
    use serde::Deserialize;

    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::event::{LastAction, VisitEvent};
    use crate::stores::kv::MemoryKvStore;
    use crate::stores::stream::MemoryOutputStream;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        total: u64,
        applied: AppliedOffsets,
    }

    fn visits(partition: i32, offsets: std::ops::Range<i64>) -> Vec<PendingVisit<u64>> {
        offsets
            .map(|offset| PendingVisit {
                partition,
                offset,
                value: 1,
            })
            .collect()
    }

    fn fold(visits: &[PendingVisit<u64>]) -> impl Fn(&mut Counter) -> usize + Send + Sync + '_ {
        move |counter: &mut Counter| {
            let mut applied = 0;
            for visit in visits {
                if mark_applied(&mut counter.applied, visit.partition, visit.offset) {
                    counter.total += visit.value;
                    applied += 1;
                }
            }
            applied
        }
    }

    #[test]
    fn mark_applied_is_monotonic() {
        let mut applied = AppliedOffsets::new();
        assert!(mark_applied(&mut applied, 0, 0));
        assert!(mark_applied(&mut applied, 0, 3));
        assert!(!mark_applied(&mut applied, 0, 2));
        assert!(!mark_applied(&mut applied, 0, 3));
        assert!(mark_applied(&mut applied, 1, 0));
        assert_eq!(applied, [(0, 4), (1, 1)].into_iter().collect());
    }

    #[tokio::test]
    async fn cas_update_ignores_replays_and_retries_conflicts() {
        let kv = MemoryKvStore::new();
        let policy = RetryPolicy::immediate(3);
        let update = CasUpdate {
            sink: "test",
            kv: &kv,
            policy: &policy,
            max_cas_attempts: 3,
            register: Some(("keys", "counter")),
        };

        let first = visits(0, 0..3);
        let (counter, applied) = update
            .run("counter", Counter::default(), fold(&first))
            .await
            .unwrap();
        assert_eq!((counter.total, applied), (3, 3));

        kv.conflict_next(2);
        let replay = visits(0, 1..5);
        let (counter, applied) = update
            .run("counter", Counter::default(), fold(&replay))
            .await
            .unwrap();
        assert_eq!((counter.total, applied), (5, 2));
        assert_eq!(kv.set_members("keys").await.unwrap(), vec!["counter"]);

        kv.conflict_next(3);
        assert!(matches!(
            update
                .run("counter", Counter::default(), fold(&visits(0, 5..6)))
                .await,
            Err(SinkError::CasExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn publish_retries_only_failed_messages() {
        let stream = MemoryOutputStream::new("out");
        let message = |country: &str| OutputMessage {
            key: country.to_string(),
            payload: format!("{{\"country\":\"{country}\"}}"),
        };

        let policy = RetryPolicy::immediate(2);
        stream.fail_next(1);
        let mut pending = vec![message("USA"), message("India")];
        publish_with_retry("test", &stream, &policy, &mut pending)
            .await
            .unwrap();
        assert!(pending.is_empty());
        let keys: Vec<_> = stream.messages().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["India", "USA"]);

        // Whatever is still failing is handed back for the next attempt
        stream.set_unavailable(true);
        let mut pending = vec![message("Brazil")];
        let err = publish_with_retry("test", &stream, &policy, &mut pending)
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Unavailable { attempts: 2, .. }));
        assert_eq!(pending, vec![message("Brazil")]);

        stream.set_unavailable(false);
        publish_with_retry("test", &stream, &policy, &mut pending)
            .await
            .unwrap();
        assert!(pending.is_empty());
        assert_eq!(stream.messages().len(), 3);
    }

    #[test]
    fn backlog_over_limit_overflows() {
        assert!(check_backlog("test", 3, 3).is_ok());
        assert!(matches!(
            check_backlog("test", 4, 3),
            Err(SinkError::Overflow {
                sink: "test",
                pending: 4,
                limit: 3
            })
        ));
    }

    struct Flaky {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl SinkProcessor for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn process(&mut self, _records: &[SourceRecord]) -> Result<(), SinkError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(SinkError::Dropped {
                    sink: "flaky",
                    dropped: 1,
                });
            }
            Ok(())
        }
    }

    fn record(partition: i32, offset: i64) -> SourceRecord {
        let event = VisitEvent {
            country: "USA".to_string(),
            last_action: LastAction::Order,
            visit_date: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            duration: 3,
        };
        SourceRecord::from_event(partition, offset, event).unwrap()
    }

    fn batch(offsets: std::ops::Range<i64>) -> Arc<RecordBatch> {
        Arc::new(RecordBatch {
            records: offsets.clone().map(|offset| record(0, offset)).collect(),
            next_offsets: [(0, offsets.end)].into_iter().collect(),
        })
    }

    /// Holds on to everything it gets while its store is down.
    struct Backlogged {
        held: usize,
        limit: usize,
    }

    #[async_trait]
    impl SinkProcessor for Backlogged {
        fn name(&self) -> &'static str {
            "backlogged"
        }

        async fn process(&mut self, records: &[SourceRecord]) -> Result<(), SinkError> {
            self.held += records.len();
            check_backlog("backlogged", self.held, self.limit)?;
            Err(SinkError::Unavailable {
                sink: "backlogged",
                attempts: 1,
                source: StoreError::Unavailable("down".to_string()),
            })
        }

        fn can_advance(&self) -> bool {
            self.held == 0
        }
    }

    #[tokio::test]
    async fn runner_skips_applied_records_and_survives_errors() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let registry = HealthRegistry::new("liveness");
        let calls = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::channel(4);

        let task = tokio::spawn(run_sink(
            Box::new(Flaky {
                calls: calls.clone(),
            }),
            [(0, 2)].into_iter().collect(),
            checkpoints.clone(),
            rx,
            registry.register("flaky", std::time::Duration::from_secs(30)),
        ));

        for range in [0..3, 3..5] {
            tx.send(batch(range)).await.unwrap();
        }
        drop(tx);

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.offsets, [(0, 5)].into_iter().collect());
        assert_eq!(
            checkpoints.snapshot()["flaky"].offsets,
            [(0, 5)].into_iter().collect()
        );
        assert!(registry.get_status().healthy);
    }

    #[tokio::test]
    async fn runner_stops_when_checkpoint_medium_is_gone() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        checkpoints.set_unavailable(true);
        let registry = HealthRegistry::new("liveness");
        let (tx, rx) = mpsc::channel(4);

        let task = tokio::spawn(run_sink(
            Box::new(Flaky {
                calls: Arc::new(AtomicU32::new(1)),
            }),
            BTreeMap::new(),
            checkpoints,
            rx,
            registry.register("flaky", std::time::Duration::from_secs(30)),
        ));
        tx.send(batch(0..1)).await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(CheckpointError::Medium { .. })
        ));
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn store_outage_keeps_runner_live_until_backlog_overflows() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let registry = HealthRegistry::new("liveness");
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(run_sink(
            Box::new(Backlogged { held: 0, limit: 5 }),
            BTreeMap::new(),
            checkpoints.clone(),
            rx,
            registry.register("backlogged", std::time::Duration::from_secs(30)),
        ));

        // Every batch fails, the runner keeps taking them until it holds
        // more than it may
        for range in [0..2, 2..4, 4..5, 5..7] {
            tx.send(batch(range)).await.unwrap();
        }
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.batches, 4);
        assert_eq!(summary.errors, 4);
        assert!(summary.offsets.is_empty());
        assert!(checkpoints.snapshot().is_empty());
        assert!(!registry.get_status().healthy);
        assert!(tx.send(batch(7..8)).await.is_err());
    }

    #[tokio::test]
    async fn failing_sink_stays_live() {
        let registry = HealthRegistry::new("liveness");
        let (tx, rx) = mpsc::channel(4);

        let task = tokio::spawn(run_sink(
            Box::new(Backlogged {
                held: 0,
                limit: usize::MAX,
            }),
            BTreeMap::new(),
            Arc::new(MemoryCheckpointStore::new()),
            rx,
            registry.register("backlogged", std::time::Duration::from_secs(30)),
        ));
        for start in 0..3 {
            tx.send(batch(start..start + 1)).await.unwrap();
        }
        drop(tx);

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.errors, 3);
        assert!(registry.get_status().healthy);
    }
}
