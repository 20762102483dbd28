//! Correlator demo.
//!
//! Splits N sequences into messages, shuffles them, feeds them to an
//! aggregating or resequencing engine from concurrent producers, and logs
//! what comes out. A share of messages can be dropped so the reaper has
//! incomplete groups to expire.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use correlator_core::{Message, MessageBuilder};
use correlator_engine::{
    AcceptOutcome, AggregatingGroupProcessor, ChannelSink, CorrelationEngine, EngineConfig,
    GroupProcessor, InMemoryGroupStore, MessageGroupStore, QueueSink, ResequencingGroupProcessor,
};
use futures_util::future::join_all;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Concatenate each sequence into one message.
    Aggregate,
    /// Re-emit each sequence's messages in order.
    Resequence,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "correlator-demo", about = "Run interleaved sequences through a correlation engine")]
struct Args {
    #[arg(long, value_enum, default_value = "aggregate", env = "CORRELATOR_MODE")]
    mode: Mode,

    /// Number of sequences (correlation keys).
    #[arg(long, default_value_t = 20, env = "CORRELATOR_SEQUENCES")]
    sequences: u32,

    /// Messages per sequence.
    #[arg(long, default_value_t = 5, env = "CORRELATOR_SEQUENCE_SIZE")]
    size: u32,

    /// Concurrent producer tasks.
    #[arg(long, default_value_t = 4, env = "CORRELATOR_PRODUCERS")]
    producers: usize,

    /// Probability of dropping each message before it reaches the engine.
    #[arg(long, default_value_t = 0.0, env = "CORRELATOR_DROP_RATE")]
    drop_rate: f64,

    /// Engine configuration as JSON.
    #[arg(long, env = "CORRELATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Keep groups in a redb file instead of memory.
    #[arg(long, env = "CORRELATOR_STORE_PATH")]
    store_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "pretty", env = "CORRELATOR_LOG_FORMAT")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,correlator_engine=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig {
            release_timeout_ms: 500,
            reaper_interval_ms: 100,
            ..EngineConfig::default()
        });
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    EngineConfig::from_json(&json).with_context(|| format!("parsing config {}", path.display()))
}

fn open_store(args: &Args, config: &EngineConfig) -> anyhow::Result<Arc<dyn MessageGroupStore>> {
    match &args.store_path {
        #[cfg(feature = "redb")]
        Some(path) => {
            let store = correlator_engine::RedbGroupStore::open(path, config.max_groups)
                .with_context(|| format!("opening store {}", path.display()))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redb"))]
        Some(_) => anyhow::bail!("--store-path needs the `redb` feature"),
        None => Ok(Arc::new(InMemoryGroupStore::with_capacity(config.max_groups))),
    }
}

/// Every message of every sequence, shuffled, minus the dropped ones.
fn generate(args: &Args) -> Vec<Message> {
    let mut rng = rand::rng();
    let mut messages: Vec<Message> = (1..=args.sequences)
        .flat_map(|sequence| {
            (1..=args.size).map(move |number| {
                MessageBuilder::with_payload(format!("s{sequence}-m{number};"))
                    .correlation_id(format!("sequence-{sequence}"))
                    .sequence_number(number)
                    .sequence_size(args.size)
                    .build()
            })
        })
        .filter(|_| !rng.random_bool(args.drop_rate.clamp(0.0, 1.0)))
        .collect();
    messages.shuffle(&mut rng);
    messages
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config = load_config(args.config.as_ref())?;
    if matches!(args.mode, Mode::Resequence) {
        config.release_partial_sequences = true;
    }

    let processor: Arc<dyn GroupProcessor> = match args.mode {
        Mode::Aggregate => Arc::new(AggregatingGroupProcessor::concatenating()),
        Mode::Resequence => Arc::new(ResequencingGroupProcessor),
    };
    let (output, mut released) = ChannelSink::channel(1_024, config.send_timeout());
    let discarded = Arc::new(QueueSink::new());

    let engine = Arc::new(
        CorrelationEngine::builder(processor)
            .store(open_store(&args, &config)?)
            .output(Arc::new(output))
            .discard(discarded.clone())
            .config(config.clone())
            .build()?,
    );
    engine.start_reaper().await;

    let consumer = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(message) = released.recv().await {
            count += 1;
            info!(
                key = ?message.headers().correlation_key(),
                payload = ?message.payload(),
                "released"
            );
        }
        count
    });

    let messages = generate(&args);
    info!(messages = messages.len(), mode = ?args.mode, "producing");
    let chunk = messages.len().div_ceil(args.producers.max(1)).max(1);
    let producers = messages.chunks(chunk).map(|batch| {
        let engine = Arc::clone(&engine);
        let batch = batch.to_vec();
        tokio::spawn(async move {
            for message in batch {
                match engine.accept(message).await {
                    Ok(AcceptOutcome::DeliveryFailed { delivered, total }) => {
                        warn!(delivered, total, "output refused a release");
                    }
                    Ok(outcome) => debug!(?outcome, "accepted"),
                    Err(err) => warn!(error = %err, "message rejected"),
                }
            }
        })
    });
    for result in join_all(producers).await {
        result.context("producer task panicked")?;
    }

    // Give the reaper one timeout plus a sweep to expire incomplete groups.
    let grace = config.release_timeout() + config.reaper_interval() * 2;
    tokio::select! {
        () = tokio::time::sleep(grace) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!("interrupted");
        }
    }

    let remaining = engine.store().group_count().await?;
    let drained = engine.shutdown().await?;
    drop(engine);
    let released = consumer.await.context("consumer task panicked")?;

    info!(
        released,
        discarded = discarded.len(),
        remaining,
        drained,
        "demo finished"
    );
    if remaining > 0 {
        warn!(remaining, "groups still held at shutdown");
    }
    Ok(())
}
