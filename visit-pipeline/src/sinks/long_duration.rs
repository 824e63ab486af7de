use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{
    check_backlog, mark_applied, publish_with_retry, AppliedOffsets, CasUpdate, PendingVisit,
    SinkProcessor,
};
use crate::error::SinkError;
use crate::event::{LastAction, SourceRecord, VisitEvent};
use crate::metrics_consts::REPLAYED_RECORDS_IGNORED;
use crate::retry::RetryPolicy;
use crate::stores::kv::KvStore;
use crate::stores::stream::{OutputMessage, OutputStream};

pub const NAME: &str = "long_duration";
pub const LONG_DURATION_KEY: &str = "long_duration_counts";

pub fn is_long(event: &VisitEvent, threshold_secs: u32) -> bool {
    event.duration > threshold_secs
}

/// Number of long visits per last action, all under one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongDurationCounts {
    pub counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub applied: AppliedOffsets,
}

impl LongDurationCounts {
    pub fn apply(&mut self, visit: &PendingVisit<LastAction>) -> bool {
        if !mark_applied(&mut self.applied, visit.partition, visit.offset) {
            return false;
        }
        *self
            .counts
            .entry(visit.value.as_str().to_owned())
            .or_default() += 1;
        true
    }

    pub fn get(&self, action: LastAction) -> u64 {
        self.counts.get(action.as_str()).copied().unwrap_or_default()
    }
}

/// Bridges visits longer than a threshold to their own topic and keeps a
/// per-action count of them in the KV store.
///
/// Unpublished messages and uncounted visits are both kept and retried with
/// the next batch, the checkpoint waits for both.
pub struct LongDurationBridge {
    stream: Arc<dyn OutputStream>,
    kv: Arc<dyn KvStore>,
    retry_policy: RetryPolicy,
    max_cas_attempts: u32,
    threshold_secs: u32,
    max_pending: usize,
    unpublished: Vec<OutputMessage>,
    uncounted: Vec<PendingVisit<LastAction>>,
}

/// How a `LongDurationBridge` is tuned.
#[derive(Debug, Clone, Copy)]
pub struct LongDurationSettings {
    pub threshold_secs: u32,
    pub max_cas_attempts: u32,
    pub max_pending: usize,
}

impl LongDurationBridge {
    pub fn new(
        stream: Arc<dyn OutputStream>,
        kv: Arc<dyn KvStore>,
        retry_policy: RetryPolicy,
        settings: LongDurationSettings,
    ) -> Self {
        Self {
            stream,
            kv,
            retry_policy,
            max_cas_attempts: settings.max_cas_attempts,
            threshold_secs: settings.threshold_secs,
            max_pending: settings.max_pending,
            unpublished: Vec::new(),
            uncounted: Vec::new(),
        }
    }

    async fn publish(&mut self) -> Result<(), SinkError> {
        publish_with_retry(
            NAME,
            self.stream.as_ref(),
            &self.retry_policy,
            &mut self.unpublished,
        )
        .await
    }

    async fn write_counts(&mut self) -> Result<(), SinkError> {
        if self.uncounted.is_empty() {
            return Ok(());
        }

        let update = CasUpdate {
            sink: NAME,
            kv: self.kv.as_ref(),
            policy: &self.retry_policy,
            max_cas_attempts: self.max_cas_attempts,
            register: None,
        };
        let uncounted = &self.uncounted;
        let result = update
            .run(LONG_DURATION_KEY, LongDurationCounts::default(), |counts| {
                uncounted.iter().filter(|visit| counts.apply(visit)).count()
            })
            .await;

        match result {
            Ok((_, applied)) => {
                let ignored = self.uncounted.len() - applied;
                if ignored > 0 {
                    counter!(REPLAYED_RECORDS_IGNORED, "sink" => NAME).increment(ignored as u64);
                }
                self.uncounted.clear();
                Ok(())
            }
            Err(e) => {
                warn!(
                    uncounted = self.uncounted.len(),
                    "long duration counts not updated: {e}"
                );
                Err(e)
            }
        }
    }
}

#[async_trait]
impl SinkProcessor for LongDurationBridge {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn process(&mut self, records: &[SourceRecord]) -> Result<(), SinkError> {
        let threshold_secs = self.threshold_secs;
        for record in records
            .iter()
            .filter(|record| is_long(&record.event, threshold_secs))
        {
            self.unpublished.push(OutputMessage::from_record(record));
            self.uncounted.push(PendingVisit {
                partition: record.partition,
                offset: record.offset,
                value: record.event.last_action,
            });
        }
        if self.can_advance() {
            return Ok(());
        }

        let published = self.publish().await;
        let counted = self.write_counts().await;
        check_backlog(
            NAME,
            self.unpublished.len() + self.uncounted.len(),
            self.max_pending,
        )?;
        published.and(counted)
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        let published = self.publish().await;
        let counted = self.write_counts().await;
        published.and(counted)
    }

    fn can_advance(&self) -> bool {
        self.unpublished.is_empty() && self.uncounted.is_empty()
    }
}
