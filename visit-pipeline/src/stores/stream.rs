use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, info};

use crate::config::KafkaConfig;
use crate::error::StoreError;
use crate::event::{SourceRecord, VisitEvent};

/// A keyed record bound for an output topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMessage {
    pub key: String,
    pub payload: String,
}

impl OutputMessage {
    /// The record's original payload, keyed by country.
    pub fn from_record(record: &SourceRecord) -> Self {
        Self {
            key: record.event.key().to_owned(),
            payload: record.payload.to_string(),
        }
    }
}

/// A partitioned output stream, keyed so that records of one country keep
/// their relative order.
#[async_trait]
pub trait OutputStream: Send + Sync {
    fn topic(&self) -> &str;

    /// Enqueues every message in order, then waits for all acks. Returns one
    /// result per message, in the same order.
    async fn publish_batch(&self, messages: &[OutputMessage]) -> Vec<Result<(), StoreError>>;
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("visit_pipeline_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("visit_pipeline_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("visit_pipeline_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("visit_pipeline_kafka_producer_queue_bytes").set(stats.msg_size as f64);

        for (topic, stats) in stats.topics {
            gauge!(
                "visit_pipeline_kafka_produce_avg_batch_size_events",
                "topic" => topic
            )
            .set(stats.batchcnt.avg as f64);
        }

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!(
                "visit_pipeline_kafka_broker_requests_pending",
                "broker" => id_string.clone()
            )
            .set(stats.outbuf_cnt as f64);
            counter!(
                "visit_pipeline_kafka_broker_tx_errors_total",
                "broker" => id_string
            )
            .absolute(stats.txerrs);
        }
    }
}

/// One producer is shared by every output topic.
pub fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

    let client_config = config.producer_client_config();
    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(KafkaContext { liveness })?;

    // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
    drop(producer.client().fetch_metadata(
        Some("__consumer_offsets"),
        Timeout::After(Duration::new(10, 0)),
    )?);
    info!("connected to Kafka brokers");

    Ok(producer)
}

#[derive(Clone)]
pub struct KafkaOutputStream {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaOutputStream {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        Self { producer, topic }
    }

    fn enqueue(&self, message: &OutputMessage) -> Result<DeliveryFuture, StoreError> {
        let record = FutureRecord::to(&self.topic)
            .key(&message.key)
            .payload(&message.payload);

        self.producer
            .send_result(record)
            .map_err(|(e, _)| match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => StoreError::Rejected(e),
                _ => StoreError::Kafka(e),
            })
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), StoreError> {
        match delivery.await {
            // Cancelled due to timeout while retrying
            Err(_) => Err(StoreError::Canceled),
            Ok(Err((
                e @ KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge),
                _,
            ))) => Err(StoreError::Rejected(e)),
            Ok(Err((e, _))) => Err(StoreError::Kafka(e)),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[async_trait]
impl OutputStream for KafkaOutputStream {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish_batch(&self, messages: &[OutputMessage]) -> Vec<Result<(), StoreError>> {
        // Enqueue sequentially to keep the order, then wait for the acks concurrently
        let enqueued: Vec<_> = messages.iter().map(|m| self.enqueue(m)).collect();

        join_all(enqueued.into_iter().map(|enqueued| async move {
            match enqueued {
                Ok(ack) => Self::process_ack(ack).await,
                Err(e) => Err(e),
            }
        }))
        .await
    }
}

/// Collects published messages in memory, for tests.
#[derive(Default)]
pub struct MemoryOutputStream {
    topic: String,
    published: Mutex<Vec<OutputMessage>>,
    unavailable: AtomicBool,
    failures: AtomicU32,
}

impl MemoryOutputStream {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_owned(),
            ..Default::default()
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `count` messages fail to publish.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<OutputMessage> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<VisitEvent> {
        self.messages()
            .iter()
            .filter_map(|m| serde_json::from_str(&m.payload).ok())
            .collect()
    }
}

#[async_trait]
impl OutputStream for MemoryOutputStream {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish_batch(&self, messages: &[OutputMessage]) -> Vec<Result<(), StoreError>> {
        messages
            .iter()
            .map(|message| {
                let injected = self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if injected || self.unavailable.load(Ordering::SeqCst) {
                    return Err(StoreError::Unavailable(format!("{} is down", self.topic)));
                }

                self.published
                    .lock()
                    .map_err(|_| StoreError::Unavailable("stream lock poisoned".to_string()))?
                    .push(message.clone());
                Ok(())
            })
            .collect()
    }
}
