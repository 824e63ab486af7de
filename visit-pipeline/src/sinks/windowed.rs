use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{check_backlog, SinkProcessor};
use crate::error::SinkError;
use crate::event::{LastAction, SourceRecord};
use crate::metrics_consts::{LATE_RECORDS_DROPPED, WATERMARK, WINDOWS_COMMITTED, WINDOWS_OPEN};
use crate::retry::RetryPolicy;
use crate::stores::table::{WindowCount, WindowTable};
use crate::watermark::{TumblingWindows, WatermarkTracker};

pub const NAME: &str = "windowed";

/// Lifecycle of a bucket. A committed bucket is evicted right away, so only
/// `Open` and `Closed` buckets are ever held or checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketState {
    Open,
    Closed,
    Committed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBucket {
    pub window_start: i64,
    pub window_end: i64,
    pub last_action: LastAction,
    pub event_count: i64,
    pub state: BucketState,
}

impl WindowBucket {
    fn to_count(&self) -> WindowCount {
        WindowCount {
            window_start: to_datetime(self.window_start),
            window_end: to_datetime(self.window_end),
            last_action: self.last_action,
            event_count: self.event_count,
        }
    }
}

fn to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WindowedState {
    max_event_time: Option<i64>,
    buckets: Vec<WindowBucket>,
}

/// Counts visits per `last_action` in tumbling event-time windows and writes
/// each window to the durable table once the watermark has passed it.
///
/// Windows only ever close on watermark progress, which only depends on the
/// event times seen. Shutdown leaves open windows open: they travel in the
/// checkpointed state instead, so a restarted aggregator commits exactly
/// what an uninterrupted one would have.
///
/// Closed buckets pile up while the table is down. Past `max_pending`
/// buckets the aggregator overflows and stops.
pub struct WindowedAggregator {
    table: Arc<dyn WindowTable>,
    retry_policy: RetryPolicy,
    windows: TumblingWindows,
    watermark: WatermarkTracker,
    watermark_delay: Duration,
    allowed_lateness_ms: i64,
    max_pending: usize,
    buckets: BTreeMap<(i64, LastAction), WindowBucket>,
}

impl WindowedAggregator {
    pub fn new(
        table: Arc<dyn WindowTable>,
        retry_policy: RetryPolicy,
        window_size: Duration,
        watermark_delay: Duration,
        allowed_lateness: Duration,
        max_pending: usize,
    ) -> Self {
        Self {
            table,
            retry_policy,
            windows: TumblingWindows::new(window_size),
            watermark: WatermarkTracker::new(watermark_delay),
            watermark_delay,
            allowed_lateness_ms: i64::try_from(allowed_lateness.as_millis()).unwrap_or(i64::MAX),
            max_pending,
            buckets: BTreeMap::new(),
        }
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark.current()
    }

    pub fn buckets(&self) -> impl Iterator<Item = &WindowBucket> {
        self.buckets.values()
    }

    /// A window is closed for good once the watermark reaches its end plus
    /// the allowed lateness.
    fn is_closed(&self, window_end: i64, watermark: Option<i64>) -> bool {
        watermark.is_some_and(|watermark| {
            watermark >= window_end.saturating_add(self.allowed_lateness_ms)
        })
    }

    /// Returns false if the event is late and was dropped.
    fn add(&mut self, record: &SourceRecord) -> bool {
        let event_time = record.event.event_time_ms();
        let window_start = self.windows.window_start(event_time);
        let window_end = self.windows.window_end(window_start);

        if self.is_closed(window_end, self.watermark.current()) {
            debug!(
                partition = record.partition,
                offset = record.offset,
                window_start,
                "dropping late record"
            );
            counter!(LATE_RECORDS_DROPPED).increment(1);
            return false;
        }

        let last_action = record.event.last_action;
        self.buckets
            .entry((window_start, last_action))
            .or_insert(WindowBucket {
                window_start,
                window_end,
                last_action,
                event_count: 0,
                state: BucketState::Open,
            })
            .event_count += 1;

        let before = self.watermark.current();
        let after = self.watermark.observe(event_time);
        if after != before {
            self.close_windows(after);
        }
        true
    }

    fn close_windows(&mut self, watermark: Option<i64>) {
        let allowed_lateness_ms = self.allowed_lateness_ms;
        for bucket in self.buckets.values_mut() {
            let closed = watermark.is_some_and(|watermark| {
                watermark >= bucket.window_end.saturating_add(allowed_lateness_ms)
            });
            if bucket.state == BucketState::Open && closed {
                bucket.state = BucketState::Closed;
            }
        }
    }

    /// Writes every closed bucket, then evicts them. On failure they stay
    /// closed and are written with the next batch.
    async fn commit_closed(&mut self) -> Result<(), SinkError> {
        let closed: Vec<WindowCount> = self
            .buckets
            .values()
            .filter(|bucket| bucket.state == BucketState::Closed)
            .map(WindowBucket::to_count)
            .collect();
        if closed.is_empty() {
            return Ok(());
        }

        let table = self.table.as_ref();
        let rows = closed.as_slice();
        self.retry_policy
            .retry(NAME, move || table.upsert(rows))
            .await
            .map_err(|(source, attempts)| SinkError::Unavailable {
                sink: NAME,
                attempts,
                source,
            })?;

        for bucket in self.buckets.values_mut() {
            if bucket.state == BucketState::Closed {
                bucket.state = BucketState::Committed;
            }
        }
        self.buckets
            .retain(|_, bucket| bucket.state != BucketState::Committed);

        info!(windows = closed.len(), "committed closed windows");
        counter!(WINDOWS_COMMITTED).increment(closed.len() as u64);
        Ok(())
    }

    fn report(&self) {
        gauge!(WINDOWS_OPEN).set(self.buckets.len() as f64);
        if let Some(watermark) = self.watermark.current() {
            gauge!(WATERMARK).set(watermark as f64);
        }
    }
}

#[async_trait]
impl SinkProcessor for WindowedAggregator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn restore(&mut self, state: Option<serde_json::Value>) -> Result<(), SinkError> {
        let Some(state) = state else {
            return Ok(());
        };
        let state: WindowedState = serde_json::from_value(state)
            .map_err(|source| SinkError::InvalidState { sink: NAME, source })?;

        self.watermark = WatermarkTracker::resume(self.watermark_delay, state.max_event_time);
        self.buckets = state
            .buckets
            .into_iter()
            .map(|bucket| ((bucket.window_start, bucket.last_action), bucket))
            .collect();
        info!(
            watermark = ?self.watermark.current(),
            buckets = self.buckets.len(),
            "restored windows"
        );
        Ok(())
    }

    async fn process(&mut self, records: &[SourceRecord]) -> Result<(), SinkError> {
        for record in records {
            self.add(record);
        }
        let result = self.commit_closed().await;
        self.report();
        check_backlog(NAME, self.buckets.len(), self.max_pending)?;
        result
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.commit_closed().await
    }

    fn checkpoint_state(&self) -> Result<Option<serde_json::Value>, SinkError> {
        let state = WindowedState {
            max_event_time: self.watermark.max_event_time(),
            buckets: self.buckets.values().cloned().collect(),
        };
        serde_json::to_value(state)
            .map(Some)
            .map_err(|source| SinkError::Serialization { sink: NAME, source })
    }
}
