//! Publishes random visits to the input topic, to exercise a local pipeline.
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use envconfig::Envconfig;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::{info, warn};

use visit_pipeline::event::{LastAction, VisitEvent};

const COUNTRIES: &[&str] = &[
    "USA", "India", "Brazil", "Germany", "France", "Japan", "Kenya", "Mexico",
];

#[derive(Envconfig)]
struct Config {
    #[envconfig(default = "localhost:9092")]
    kafka_hosts: String,

    #[envconfig(default = "visits")]
    kafka_topic: String,

    // Zero keeps going until interrupted
    #[envconfig(default = "1000")]
    event_count: u64,

    #[envconfig(default = "100")]
    events_per_second: u32,

    // Visit dates are spread up to this far behind now, some land late
    #[envconfig(default = "15000")]
    max_skew_ms: i64,

    #[envconfig(default = "60")]
    max_duration_secs: u32,

    seed: Option<u64>,
}

fn random_visit(rng: &mut impl Rng, config: &Config) -> VisitEvent {
    let skew = rng.gen_range(0..=config.max_skew_ms.max(0));
    VisitEvent {
        country: COUNTRIES
            .choose(rng)
            .copied()
            .unwrap_or("USA")
            .to_owned(),
        last_action: LastAction::ALL[rng.gen_range(0..LastAction::ALL.len())],
        visit_date: Utc::now() - chrono::Duration::milliseconds(skew),
        duration: rng.gen_range(0..=config.max_duration_secs),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().context("invalid configuration")?;
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("linger.ms", "20")
        .create()
        .context("failed to create kafka producer")?;

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let period = Duration::from_secs(1) / config.events_per_second.max(1);
    let mut ticker = tokio::time::interval(period);

    let mut sent = 0u64;
    while config.event_count == 0 || sent < config.event_count {
        ticker.tick().await;

        let visit = random_visit(&mut rng, &config);
        let payload = serde_json::to_string(&visit)?;
        let record = FutureRecord::to(&config.kafka_topic)
            .key(&visit.country)
            .payload(&payload);

        match producer.send(record, Duration::from_secs(5)).await {
            Ok(_) => {
                sent += 1;
                if sent % 1000 == 0 {
                    info!(sent, "visits published");
                }
            }
            Err((e, _)) => warn!("failed to publish visit: {e}"),
        }
    }

    info!(sent, topic = %config.kafka_topic, "done");
    Ok(())
}
