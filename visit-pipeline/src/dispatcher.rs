use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use health::{HealthHandle, HealthRegistry};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::{CheckpointError, PipelineError};
use crate::event::RecordBatch;
use crate::metrics_consts::SINK_FAILURES;
use crate::sinks::{restore_processor, run_sink, SinkProcessor, SinkSummary};

type SinkTask = JoinHandle<Result<SinkSummary, CheckpointError>>;

struct RegisteredSink {
    name: &'static str,
    sender: Option<mpsc::Sender<Arc<RecordBatch>>>,
    task: Option<SinkTask>,
    liveness: HealthHandle,
    summary: Option<SinkSummary>,
}

/// Broadcasts every batch to every registered processor.
///
/// Each processor runs on its own task behind a bounded channel, so a slow
/// processor only holds the others back once its channel is full. A
/// processor whose task died is reported and skipped from then on. A dead
/// task that failed on its checkpoint stops the whole pipeline.
pub struct FanOutDispatcher {
    sinks: Vec<RegisteredSink>,
}

impl FanOutDispatcher {
    /// Restores every processor from its checkpoint and spawns its task.
    pub async fn start(
        processors: Vec<Box<dyn SinkProcessor>>,
        checkpoints: Arc<dyn CheckpointStore>,
        channel_capacity: usize,
        registry: &HealthRegistry,
        liveness_deadline: Duration,
    ) -> Result<Self, PipelineError> {
        let mut sinks = Vec::with_capacity(processors.len());

        for mut processor in processors {
            let name = processor.name();
            let offsets = restore_processor(processor.as_mut(), checkpoints.as_ref()).await?;

            let (sender, receiver) = mpsc::channel(channel_capacity.max(1));
            let liveness = registry.register(name, liveness_deadline);
            let task = tokio::spawn(run_sink(
                processor,
                offsets,
                checkpoints.clone(),
                receiver,
                liveness.clone(),
            ));
            info!(processor = name, "processor started");

            sinks.push(RegisteredSink {
                name,
                sender: Some(sender),
                task: Some(task),
                liveness,
                summary: None,
            });
        }

        Ok(Self { sinks })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|sink| sink.name).collect()
    }

    pub fn live(&self) -> usize {
        self.sinks.iter().filter(|sink| sink.sender.is_some()).count()
    }

    /// Hands `batch` to every live processor, waiting for room in each
    /// channel concurrently.
    pub async fn dispatch(&mut self, batch: RecordBatch) -> Result<(), PipelineError> {
        let batch = Arc::new(batch);

        let sends = self.sinks.iter().enumerate().filter_map(|(index, sink)| {
            let sender = sink.sender.clone()?;
            let batch = batch.clone();
            Some(async move { (index, sender.send(batch).await.is_ok()) })
        });
        let failed: Vec<usize> = join_all(sends)
            .await
            .into_iter()
            .filter_map(|(index, delivered)| (!delivered).then_some(index))
            .collect();

        for index in failed {
            self.reap(index).await?;
        }
        Ok(())
    }

    /// Collects a processor task that stopped receiving.
    async fn reap(&mut self, index: usize) -> Result<(), PipelineError> {
        let sink = &mut self.sinks[index];
        sink.sender = None;
        let Some(task) = sink.task.take() else {
            return Ok(());
        };

        match task.await {
            Ok(Ok(summary)) => {
                warn!(processor = sink.name, "processor stopped early");
                sink.summary = Some(summary);
                Ok(())
            }
            Ok(Err(e)) => {
                error!(processor = sink.name, "processor halted on checkpoint failure: {e:#}");
                Err(e.into())
            }
            Err(e) => {
                error!(processor = sink.name, "processor task failed, skipping it: {e}");
                counter!(SINK_FAILURES, "sink" => sink.name).increment(1);
                sink.liveness.report_unhealthy(format!("task failed: {e}"));
                Ok(())
            }
        }
    }

    /// Closes every channel and waits for the processors to drain their
    /// in-flight batches and flush their checkpoints.
    pub async fn shutdown(mut self) -> Result<Vec<SinkSummary>, PipelineError> {
        for sink in &mut self.sinks {
            sink.sender = None;
        }

        let mut first_error = None;
        for index in 0..self.sinks.len() {
            if let Err(e) = self.reap(index).await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(self
            .sinks
            .into_iter()
            .filter_map(|sink| sink.summary)
            .collect())
    }
}
