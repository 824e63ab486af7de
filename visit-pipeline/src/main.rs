use std::sync::Arc;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use visit_pipeline::checkpoint::FileCheckpointStore;
use visit_pipeline::config::Config;
use visit_pipeline::pipeline::{build_processors, Pipeline, SinkStores, LIVENESS_DEADLINE};
use visit_pipeline::server::{router, serve, setup_metrics_recorder};
use visit_pipeline::sinks::running_aggregate::AggregateReader;
use visit_pipeline::source::KafkaEventSource;
use visit_pipeline::stores::kv::RedisKvStore;
use visit_pipeline::stores::stream::{create_kafka_producer, KafkaOutputStream};
use visit_pipeline::stores::table::PgWindowTable;

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().context("invalid configuration")?;
    let settings = config.pipeline_settings();
    info!(?settings, "starting visit pipeline");

    let liveness = HealthRegistry::new("liveness");
    let recorder_handle = setup_metrics_recorder().context("failed to install metrics recorder")?;

    let producer = create_kafka_producer(
        &config.kafka,
        liveness.register("rdkafka", LIVENESS_DEADLINE),
    )
    .context("failed to create kafka producer")?;
    let kv = Arc::new(
        RedisKvStore::new(&config.redis_url)
            .await
            .context("failed to connect to redis")?,
    );
    let stores = SinkStores {
        abandoned_carts: Arc::new(KafkaOutputStream::new(
            producer.clone(),
            config.kafka.abandoned_cart_topic.clone(),
        )),
        long_durations: Arc::new(KafkaOutputStream::new(
            producer,
            config.kafka.long_duration_topic.clone(),
        )),
        kv: kv.clone(),
        window_table: Arc::new(
            PgWindowTable::new(&config.database_url, config.max_pg_connections)
                .await
                .context("failed to set up the window table")?,
        ),
    };
    let checkpoints = Arc::new(
        FileCheckpointStore::open(&config.checkpoint_location)
            .await
            .context("failed to open checkpoint location")?,
    );
    let source = KafkaEventSource::new(&config.kafka).context("failed to create kafka consumer")?;

    let app = router(
        liveness.clone(),
        Some(recorder_handle),
        AggregateReader::new(kv),
    );
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(app, &bind).await {
            error!("failed to serve http endpoints on {bind}: {e}");
        }
    });

    let mut term = signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = term.recv() => {},
            _ = interrupt.recv() => {},
        };
        info!("shutting down gracefully...");
    };

    let pipeline = Pipeline::start(
        Box::new(source),
        build_processors(&settings, &stores),
        checkpoints,
        settings,
        &liveness,
    )
    .await
    .context("failed to start pipeline")?;

    let summary = pipeline.run(shutdown).await.context("pipeline halted")?;
    info!(?summary, "visit pipeline stopped");

    Ok(())
}
