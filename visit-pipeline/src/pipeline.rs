use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use health::{HealthHandle, HealthRegistry};
use metrics::{counter, histogram};
use tracing::{error, info, warn};

use crate::checkpoint::{resume_offsets, CheckpointStore};
use crate::config::PipelineSettings;
use crate::dispatcher::FanOutDispatcher;
use crate::error::PipelineError;
use crate::metrics_consts::{BATCH_SIZE, SOURCE_ERRORS};
use crate::normalizer::Normalizer;
use crate::sinks::abandoned_cart::AbandonedCartFilter;
use crate::sinks::long_duration::{LongDurationBridge, LongDurationSettings};
use crate::sinks::running_aggregate::RunningAggregateTracker;
use crate::sinks::windowed::WindowedAggregator;
use crate::sinks::{SinkProcessor, SinkSummary};
use crate::source::EventSource;
use crate::stores::kv::KvStore;
use crate::stores::stream::OutputStream;
use crate::stores::table::WindowTable;

pub const INGEST_COMPONENT: &str = "ingest";
pub const LIVENESS_DEADLINE: Duration = Duration::from_secs(30);

// Consumer offsets are for lag monitoring only, no need to commit every batch
const SOURCE_COMMIT_INTERVAL: Duration = Duration::from_secs(5);
const SOURCE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// External systems the sinks write to.
#[derive(Clone)]
pub struct SinkStores {
    pub abandoned_carts: Arc<dyn OutputStream>,
    pub long_durations: Arc<dyn OutputStream>,
    pub kv: Arc<dyn KvStore>,
    pub window_table: Arc<dyn WindowTable>,
}

/// The four processors every visit is fanned out to.
pub fn build_processors(
    settings: &PipelineSettings,
    stores: &SinkStores,
) -> Vec<Box<dyn SinkProcessor>> {
    vec![
        Box::new(AbandonedCartFilter::new(
            stores.abandoned_carts.clone(),
            settings.retry_policy,
            settings.max_pending,
        )),
        Box::new(RunningAggregateTracker::new(
            stores.kv.clone(),
            settings.retry_policy,
            settings.max_cas_attempts,
            settings.parallelism,
            settings.max_pending,
        )),
        Box::new(WindowedAggregator::new(
            stores.window_table.clone(),
            settings.retry_policy,
            settings.window_size,
            settings.watermark_delay,
            settings.allowed_lateness,
            settings.max_pending,
        )),
        Box::new(LongDurationBridge::new(
            stores.long_durations.clone(),
            stores.kv.clone(),
            settings.retry_policy,
            LongDurationSettings {
                threshold_secs: settings.long_duration_threshold_secs,
                max_cas_attempts: settings.max_cas_attempts,
                max_pending: settings.max_pending,
            },
        )),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub batches: u64,
    pub received: u64,
    pub valid: u64,
    pub sinks: Vec<SinkSummary>,
    pub resume_offsets: BTreeMap<i32, i64>,
}

/// Pulls batches from the source, normalizes them and hands them to the
/// dispatcher until the source runs dry or shutdown is requested.
pub struct Pipeline {
    source: Box<dyn EventSource>,
    normalizer: Normalizer,
    dispatcher: FanOutDispatcher,
    checkpoints: Arc<dyn CheckpointStore>,
    settings: PipelineSettings,
    liveness: HealthHandle,
}

impl Pipeline {
    /// Restores the processors and positions the source at the lowest offset
    /// any of them still needs.
    pub async fn start(
        mut source: Box<dyn EventSource>,
        processors: Vec<Box<dyn SinkProcessor>>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: PipelineSettings,
        registry: &HealthRegistry,
    ) -> Result<Self, PipelineError> {
        let liveness = registry.register(INGEST_COMPONENT, LIVENESS_DEADLINE);
        let dispatcher = FanOutDispatcher::start(
            processors,
            checkpoints.clone(),
            settings.sink_channel_capacity,
            registry,
            LIVENESS_DEADLINE,
        )
        .await?;

        let resume = resume_offsets(checkpoints.as_ref(), &dispatcher.names()).await?;
        info!(?resume, "seeking source");
        source.seek(&resume).await?;

        Ok(Self {
            source,
            normalizer: Normalizer,
            dispatcher,
            checkpoints,
            settings,
            liveness,
        })
    }

    pub async fn run(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<PipelineSummary, PipelineError> {
        let Pipeline {
            mut source,
            normalizer,
            mut dispatcher,
            checkpoints,
            settings,
            liveness,
        } = self;
        let names = dispatcher.names();
        let mut summary = PipelineSummary::default();
        let mut fatal = None;
        let mut last_source_commit = Instant::now();
        tokio::pin!(shutdown);

        liveness.report_healthy();
        loop {
            if source.is_exhausted() {
                info!("source exhausted");
                break;
            }

            let pulled = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested, draining processors");
                    break;
                }
                pulled = source.next_batch(settings.max_batch_size, settings.batch_timeout) => {
                    pulled
                }
            };

            let raw = match pulled {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("failed to pull from source: {e:#}");
                    counter!(SOURCE_ERRORS).increment(1);
                    tokio::time::sleep(SOURCE_ERROR_BACKOFF).await;
                    continue;
                }
            };
            liveness.report_healthy();
            if raw.is_empty() {
                continue;
            }

            histogram!(BATCH_SIZE).record(raw.len() as f64);
            summary.received += raw.len() as u64;
            let batch = normalizer.normalize_batch(raw);
            summary.batches += 1;
            summary.valid += batch.records.len() as u64;

            if let Err(e) = dispatcher.dispatch(batch).await {
                fatal = Some(e);
                break;
            }

            if last_source_commit.elapsed() >= SOURCE_COMMIT_INTERVAL {
                last_source_commit = Instant::now();
                if let Err(e) = commit_source(source.as_mut(), checkpoints.as_ref(), &names).await {
                    fatal = Some(e);
                    break;
                }
            }
        }

        // Processors get to drain and checkpoint even when another one failed
        let drained = tokio::time::timeout(settings.shutdown_timeout, dispatcher.shutdown())
            .await
            .unwrap_or(Err(PipelineError::ShutdownTimeout(settings.shutdown_timeout)));
        if let Some(e) = fatal {
            error!("pipeline halted: {e:#}");
            liveness.report_unhealthy(e.to_string());
            return Err(e);
        }
        summary.sinks = drained?;

        summary.resume_offsets =
            commit_source(source.as_mut(), checkpoints.as_ref(), &names).await?;
        info!(
            batches = summary.batches,
            received = summary.received,
            valid = summary.valid,
            "pipeline stopped"
        );
        Ok(summary)
    }
}

/// Commits the current resume point to the source. Failing to do so only
/// affects lag monitoring, so it is logged and not retried.
async fn commit_source(
    source: &mut dyn EventSource,
    checkpoints: &dyn CheckpointStore,
    names: &[&str],
) -> Result<BTreeMap<i32, i64>, PipelineError> {
    let resume = resume_offsets(checkpoints, names).await?;
    if resume.is_empty() {
        return Ok(resume);
    }
    if let Err(e) = source.commit(&resume).await {
        warn!("failed to commit source offsets: {e:#}");
        counter!(SOURCE_ERRORS).increment(1);
    }
    Ok(resume)
}
