use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::error::SourceError;
use crate::event::{RawRecord, VisitEvent};
use crate::metrics_consts::SOURCE_ERRORS;

/// An ordered, partitioned log of serialized visits.
#[async_trait]
pub trait EventSource: Send {
    /// Positions every partition at its resume offset. Partitions missing
    /// from `resume` start according to the source's reset policy.
    async fn seek(&mut self, resume: &BTreeMap<i32, i64>) -> Result<(), SourceError>;

    /// Up to `max` records, waiting at most `timeout` for them. May be empty.
    async fn next_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<RawRecord>, SourceError>;

    /// Records consumption progress with the source, for lag monitoring.
    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<(), SourceError>;

    /// Bounded sources report when they have nothing left to give.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Reads the visits topic with manual partition assignment.
///
/// Progress is owned by the checkpoint store, so the consumer never
/// auto-commits and is positioned explicitly with `seek`.
pub struct KafkaEventSource {
    consumer: StreamConsumer,
    topic: String,
    reset: Offset,
}

impl KafkaEventSource {
    pub fn new(config: &KafkaConfig) -> Result<Self, SourceError> {
        let consumer: StreamConsumer = config.consumer_client_config().create()?;
        let reset = match config.kafka_consumer_offset_reset.as_str() {
            "latest" | "end" => Offset::End,
            _ => Offset::Beginning,
        };

        Ok(Self {
            consumer,
            topic: config.kafka_consumer_topic.clone(),
            reset,
        })
    }

    fn partitions(&self) -> Result<Vec<i32>, SourceError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.topic), Duration::from_secs(10))?;

        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .filter(|topic| topic.name() == self.topic)
            .flat_map(|topic| topic.partitions().iter().map(|p| p.id()))
            .collect();

        if partitions.is_empty() {
            return Err(SourceError::NoPartitions(self.topic.clone()));
        }
        Ok(partitions)
    }
}

#[async_trait]
impl EventSource for KafkaEventSource {
    async fn seek(&mut self, resume: &BTreeMap<i32, i64>) -> Result<(), SourceError> {
        let mut assignment = TopicPartitionList::new();
        for partition in self.partitions()? {
            let offset = match resume.get(&partition) {
                Some(&next) => Offset::Offset(next),
                None => self.reset,
            };
            info!(topic = %self.topic, partition, ?offset, "assigning partition");
            assignment.add_partition_offset(&self.topic, partition, offset)?;
        }

        self.consumer.assign(&assignment)?;
        Ok(())
    }

    async fn next_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut batch = Vec::with_capacity(max);

        while batch.len() < max {
            let message = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_elapsed) => break,
                Ok(Ok(message)) => message,
                Ok(Err(e)) => {
                    counter!(SOURCE_ERRORS).increment(1);
                    if batch.is_empty() {
                        return Err(e.into());
                    }
                    warn!("kafka receive failed, returning partial batch: {e}");
                    break;
                }
            };

            batch.push(RawRecord {
                partition: message.partition(),
                offset: message.offset(),
                payload: message.payload().map(<[u8]>::to_vec),
            });
        }

        Ok(batch)
    }

    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<(), SourceError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for (&partition, &next) in offsets {
            list.add_partition_offset(&self.topic, partition, Offset::Offset(next))?;
        }
        self.consumer.commit(&list, CommitMode::Async)?;
        debug!(topic = %self.topic, ?offsets, "committed consumer offsets");
        Ok(())
    }
}

/// Replayable in-memory log, for tests and local runs.
///
/// Records are handed out in log order. `stop_after` makes the source report
/// exhaustion early, which is how tests simulate a crash in the middle of
/// the log.
pub struct MemoryEventSource {
    log: Vec<RawRecord>,
    cursor: usize,
    start: BTreeMap<i32, i64>,
    remaining: Option<usize>,
    commits: Arc<Mutex<Vec<BTreeMap<i32, i64>>>>,
}

impl MemoryEventSource {
    pub fn new(log: Vec<RawRecord>) -> Self {
        Self {
            log,
            cursor: 0,
            start: BTreeMap::new(),
            remaining: None,
            commits: Default::default(),
        }
    }

    /// Serializes events into the log, assigning consecutive offsets within
    /// each partition.
    pub fn from_events(events: impl IntoIterator<Item = (i32, VisitEvent)>) -> Self {
        let mut next_offsets: BTreeMap<i32, i64> = BTreeMap::new();
        let log = events
            .into_iter()
            .map(|(partition, event)| {
                let next = next_offsets.entry(partition).or_insert(0);
                let offset = *next;
                *next += 1;
                RawRecord {
                    partition,
                    offset,
                    payload: serde_json::to_vec(&event).ok(),
                }
            })
            .collect();
        Self::new(log)
    }

    pub fn stop_after(mut self, records: usize) -> Self {
        self.remaining = Some(records);
        self
    }

    pub fn log(&self) -> &[RawRecord] {
        &self.log
    }

    /// Every offset map committed so far, shared so it can be inspected after
    /// the source was moved into a pipeline.
    pub fn commits(&self) -> Arc<Mutex<Vec<BTreeMap<i32, i64>>>> {
        self.commits.clone()
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn seek(&mut self, resume: &BTreeMap<i32, i64>) -> Result<(), SourceError> {
        self.cursor = 0;
        self.start = resume.clone();
        Ok(())
    }

    async fn next_batch(
        &mut self,
        max: usize,
        _timeout: Duration,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let mut batch = Vec::new();
        while batch.len() < max && self.cursor < self.log.len() {
            if self.remaining == Some(0) {
                break;
            }

            let record = &self.log[self.cursor];
            self.cursor += 1;
            if self
                .start
                .get(&record.partition)
                .is_some_and(|&start| record.offset < start)
            {
                continue;
            }

            batch.push(record.clone());
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }
        }
        Ok(batch)
    }

    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<(), SourceError> {
        if let Ok(mut commits) = self.commits.lock() {
            commits.push(offsets.clone());
        }
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.remaining == Some(0) || self.cursor >= self.log.len()
    }
}
