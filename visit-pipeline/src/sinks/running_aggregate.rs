use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{check_backlog, mark_applied, AppliedOffsets, CasUpdate, PendingVisit, SinkProcessor};
use crate::error::{SinkError, StoreError};
use crate::event::SourceRecord;
use crate::metrics_consts::REPLAYED_RECORDS_IGNORED;
use crate::retry::RetryPolicy;
use crate::sinks::long_duration::{LongDurationCounts, LONG_DURATION_KEY};
use crate::stores::kv::KvStore;

pub const NAME: &str = "running_aggregate";
pub const COUNTRIES_KEY: &str = "visit_aggregate_countries";

pub fn aggregate_key(country: &str) -> String {
    format!("visit_aggregate:{country}")
}

/// Visit duration statistics of one country, stored as JSON under
/// `visit_aggregate:<country>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryDurationAggregate {
    pub country: String,
    pub count: u64,
    pub sum_duration: u64,
    pub min_duration: u32,
    pub max_duration: u32,
    #[serde(default)]
    pub applied: AppliedOffsets,
}

impl CountryDurationAggregate {
    pub fn new(country: &str) -> Self {
        Self {
            country: country.to_owned(),
            ..Default::default()
        }
    }

    /// Folds one visit in, unless its offset was applied already.
    pub fn apply(&mut self, visit: &PendingVisit<u32>) -> bool {
        if !mark_applied(&mut self.applied, visit.partition, visit.offset) {
            return false;
        }

        let duration = visit.value;
        if self.count == 0 {
            self.min_duration = duration;
            self.max_duration = duration;
        } else {
            self.min_duration = self.min_duration.min(duration);
            self.max_duration = self.max_duration.max(duration);
        }
        self.count += 1;
        self.sum_duration += u64::from(duration);
        true
    }

    pub fn mean_duration(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum_duration as f64 / self.count as f64)
    }
}

/// Keeps `CountryDurationAggregate`s up to date in the KV store.
///
/// Countries are sharded over `parallelism` concurrent writers, a country
/// always lands on the same shard so a key has a single writer inside this
/// process. Other writers are handled with compare-and-set.
///
/// Visits whose write failed stay pending and are retried with the next
/// batch. The checkpoint is held back while anything is pending, the
/// aggregates' applied offsets make the retry safe. Visits are never shed
/// while the tracker keeps running: a later visit of the same country would
/// mark the shed ones as applied. Past `max_pending` the tracker overflows
/// instead and a restart replays them.
pub struct RunningAggregateTracker {
    kv: Arc<dyn KvStore>,
    retry_policy: RetryPolicy,
    max_cas_attempts: u32,
    parallelism: usize,
    max_pending: usize,
    pending: BTreeMap<String, Vec<PendingVisit<u32>>>,
}

impl RunningAggregateTracker {
    pub fn new(
        kv: Arc<dyn KvStore>,
        retry_policy: RetryPolicy,
        max_cas_attempts: u32,
        parallelism: usize,
        max_pending: usize,
    ) -> Self {
        Self {
            kv,
            retry_policy,
            max_cas_attempts,
            parallelism: parallelism.max(1),
            max_pending,
            pending: BTreeMap::new(),
        }
    }

    fn pending_visits(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    fn shard(&self, country: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        country.hash(&mut hasher);
        (hasher.finish() % self.parallelism as u64) as usize
    }

    async fn write_pending(&mut self) -> Result<(), SinkError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut shards: Vec<Vec<(String, Vec<PendingVisit<u32>>)>> =
            (0..self.parallelism).map(|_| Vec::new()).collect();
        for (country, visits) in std::mem::take(&mut self.pending) {
            let shard = self.shard(&country);
            shards[shard].push((country, visits));
        }

        let update = CasUpdate {
            sink: NAME,
            kv: self.kv.as_ref(),
            policy: &self.retry_policy,
            max_cas_attempts: self.max_cas_attempts,
            register: None,
        };
        let update = &update;

        let results = join_all(shards.into_iter().map(|shard| async move {
            let mut results = Vec::with_capacity(shard.len());
            for (country, visits) in shard {
                let result = write_country(update, &country, &visits).await;
                results.push((country, visits, result));
            }
            results
        }))
        .await;

        let mut first_error = None;
        for (country, visits, result) in results.into_iter().flatten() {
            match result {
                Ok(aggregate) => {
                    debug!(country, count = aggregate.count, "aggregate updated");
                }
                Err(e) => {
                    warn!(country, "aggregate update failed, keeping it pending: {e}");
                    self.pending.insert(country, visits);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn write_country(
    update: &CasUpdate<'_>,
    country: &str,
    visits: &[PendingVisit<u32>],
) -> Result<CountryDurationAggregate, SinkError> {
    let key = aggregate_key(country);
    let update = CasUpdate {
        register: Some((COUNTRIES_KEY, country)),
        ..*update
    };

    let (aggregate, applied) = update
        .run(&key, CountryDurationAggregate::new(country), |aggregate| {
            visits.iter().filter(|visit| aggregate.apply(visit)).count()
        })
        .await?;

    let ignored = visits.len() - applied;
    if ignored > 0 {
        counter!(REPLAYED_RECORDS_IGNORED, "sink" => NAME).increment(ignored as u64);
    }
    Ok(aggregate)
}

#[async_trait]
impl SinkProcessor for RunningAggregateTracker {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn process(&mut self, records: &[SourceRecord]) -> Result<(), SinkError> {
        for record in records {
            self.pending
                .entry(record.event.country.clone())
                .or_default()
                .push(PendingVisit {
                    partition: record.partition,
                    offset: record.offset,
                    value: record.event.duration,
                });
        }
        let written = self.write_pending().await;
        check_backlog(NAME, self.pending_visits(), self.max_pending)?;
        written
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.write_pending().await
    }

    fn can_advance(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Everything a dashboard shows: per-country statistics and the
/// long-duration counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateSnapshot {
    pub countries: BTreeMap<String, CountryDurationAggregate>,
    pub long_duration: LongDurationCounts,
}

/// Read side of the running aggregates. Reads are not coordinated with
/// writers and may trail them slightly.
#[derive(Clone)]
pub struct AggregateReader {
    kv: Arc<dyn KvStore>,
}

impl AggregateReader {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn country(
        &self,
        country: &str,
    ) -> Result<Option<CountryDurationAggregate>, StoreError> {
        match self.kv.get(&aggregate_key(country)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn snapshot(&self) -> Result<AggregateSnapshot, StoreError> {
        let mut snapshot = AggregateSnapshot::default();
        for country in self.kv.set_members(COUNTRIES_KEY).await? {
            // Listed before its first write, may not exist yet
            if let Some(aggregate) = self.country(&country).await? {
                snapshot.countries.insert(country, aggregate);
            }
        }

        if let Some(raw) = self.kv.get(LONG_DURATION_KEY).await? {
            snapshot.long_duration = serde_json::from_str(&raw)?;
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::event::{LastAction, VisitEvent};
    use crate::stores::kv::MemoryKvStore;

    fn record(partition: i32, offset: i64, country: &str, duration: u32) -> SourceRecord {
        let event = VisitEvent {
            country: country.to_string(),
            last_action: LastAction::Catalog,
            visit_date: DateTime::from_timestamp(1_700_000_000 + offset, 0).unwrap(),
            duration,
        };
        SourceRecord::from_event(partition, offset, event).unwrap()
    }

    fn tracker(kv: Arc<MemoryKvStore>) -> RunningAggregateTracker {
        RunningAggregateTracker::new(kv, RetryPolicy::immediate(2), 5, 4, 1_000)
    }

    #[test]
    fn aggregate_tracks_min_max() {
        let mut aggregate = CountryDurationAggregate::new("USA");
        assert_eq!(aggregate.mean_duration(), None);

        for (offset, duration) in [(0, 11), (1, 5), (2, 20)] {
            assert!(aggregate.apply(&PendingVisit {
                partition: 0,
                offset,
                value: duration,
            }));
        }
        assert!(!aggregate.apply(&PendingVisit {
            partition: 0,
            offset: 1,
            value: 100,
        }));

        assert_eq!(aggregate.count, 3);
        assert_eq!(aggregate.sum_duration, 36);
        assert_eq!(aggregate.min_duration, 5);
        assert_eq!(aggregate.max_duration, 20);
        assert_eq!(aggregate.mean_duration(), Some(12.0));
    }

    #[tokio::test]
    async fn replayed_batches_are_not_double_counted() {
        let kv = Arc::new(MemoryKvStore::new());
        let records = vec![
            record(0, 0, "USA", 11),
            record(0, 1, "USA", 5),
            record(1, 0, "India", 20),
        ];

        let mut first = tracker(kv.clone());
        first.process(&records).await.unwrap();

        // A restarted tracker sees the same records again
        let mut second = tracker(kv.clone());
        second.process(&records).await.unwrap();
        second.process(&records[1..]).await.unwrap();

        let reader = AggregateReader::new(kv);
        let usa = reader.country("USA").await.unwrap().unwrap();
        assert_eq!((usa.count, usa.sum_duration), (2, 16));
        let india = reader.country("India").await.unwrap().unwrap();
        assert_eq!((india.count, india.sum_duration), (1, 20));

        let snapshot = reader.snapshot().await.unwrap();
        assert_eq!(
            snapshot.countries.keys().collect::<Vec<_>>(),
            vec!["India", "USA"]
        );
    }

    #[tokio::test]
    async fn failed_writes_stay_pending() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut tracker = tracker(kv.clone());

        kv.set_unavailable(true);
        let err = tracker
            .process(&[record(0, 0, "USA", 11)])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Unavailable { sink: NAME, .. }));
        assert!(!tracker.can_advance());

        kv.set_unavailable(false);
        tracker.process(&[record(0, 1, "USA", 5)]).await.unwrap();
        assert!(tracker.can_advance());

        let usa = AggregateReader::new(kv)
            .country("USA")
            .await
            .unwrap()
            .unwrap();
        assert_eq!((usa.count, usa.sum_duration), (2, 16));
        assert_eq!(usa.applied, [(0, 2)].into_iter().collect());
    }

    #[tokio::test]
    async fn conflicting_writers_are_retried() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut tracker = tracker(kv.clone());
        kv.conflict_next(2);

        tracker
            .process(&[record(0, 0, "USA", 11), record(0, 1, "USA", 5)])
            .await
            .unwrap();

        let usa = AggregateReader::new(kv.clone())
            .country("USA")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(usa.count, 2);
        assert_eq!(kv.writes(), 1);
    }

    #[tokio::test]
    async fn outage_backlog_is_bounded() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set_unavailable(true);
        let mut tracker = tracker(kv.clone());

        let countries = ["USA", "India", "Brazil"];
        let mut overflow = None;
        for offset in 0..10_000 {
            let country = countries[offset as usize % countries.len()];
            match tracker.process(&[record(0, offset, country, 3)]).await {
                Err(SinkError::Unavailable { .. }) => {}
                Err(SinkError::Overflow { pending, .. }) => {
                    overflow = Some((offset, pending));
                    break;
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(overflow, Some((1_000, 1_001)));
        assert!(!tracker.can_advance());
        assert!(kv.values().is_empty());
    }
}
