use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use streamscribe::{
    config::{LatencyMode, TranscriptionConfig},
    engine::StreamEngine,
    inference::{SubprocessLoader, WorkerCommand},
    model::{ModelCache, ModelTier},
    queue::{PriorityStore, QueueConfig, TranscriptionQueue},
    switcher::{SourceSwitcher, SwitcherConfig},
};
use tokio::signal;
use tokio::time::interval;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "streamscribe")]
#[command(about = "Real-time multi-stream transcription service")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Queue database directory
    #[arg(long, default_value = "/tmp/streamscribe/queue")]
    pub queue_dir: PathBuf,

    /// Number of queue worker tasks
    #[arg(long, default_value = "2")]
    pub workers: usize,

    /// Inference worker executable
    #[arg(long, default_value = "streamscribe-worker")]
    pub worker_cmd: String,

    /// Extra arguments passed to the inference worker
    #[arg(long, default_value = "")]
    pub worker_args: String,

    /// Working directory for inference workers
    #[arg(long)]
    pub worker_workdir: Option<PathBuf>,

    /// Baseline model tier
    #[arg(long, value_enum, default_value = "base")]
    pub model_tier: TierArg,

    /// Latency/accuracy trade-off
    #[arg(long, value_enum, default_value = "balanced")]
    pub latency_mode: ModeArg,

    /// Maximum concurrent inference calls
    #[arg(long, default_value = "4")]
    pub max_concurrent_streams: usize,

    /// Worker response timeout in seconds
    #[arg(long, default_value = "30")]
    pub response_timeout: u64,

    /// Maximum restart attempts per inference worker
    #[arg(long, default_value = "10")]
    pub max_restarts: u32,

    /// Statistics reporting interval in seconds
    #[arg(long, default_value = "60")]
    pub stats_interval: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum TierArg {
    Tiny,
    Base,
    Small,
    Medium,
    #[value(name = "large-v3")]
    LargeV3,
}

impl From<TierArg> for ModelTier {
    fn from(tier: TierArg) -> Self {
        match tier {
            TierArg::Tiny => ModelTier::Tiny,
            TierArg::Base => ModelTier::Base,
            TierArg::Small => ModelTier::Small,
            TierArg::Medium => ModelTier::Medium,
            TierArg::LargeV3 => ModelTier::LargeV3,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum ModeArg {
    LowLatency,
    Balanced,
    HighAccuracy,
}

impl From<ModeArg> for LatencyMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::LowLatency => LatencyMode::LowLatency,
            ModeArg::Balanced => LatencyMode::Balanced,
            ModeArg::HighAccuracy => LatencyMode::HighAccuracy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting streamscribe v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Queue dir: {}", args.queue_dir.display());
    info!("  Workers: {}", args.workers);
    info!("  Worker command: {}", args.worker_cmd);
    info!("  Model tier: {:?}", args.model_tier);
    info!("  Latency mode: {:?}", args.latency_mode);

    if let Some(parent) = args.queue_dir.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create queue directory")?;
    }

    let transcription_config = TranscriptionConfig {
        model_tier: args.model_tier.into(),
        latency_mode: args.latency_mode.into(),
        max_concurrent_streams: args.max_concurrent_streams,
        ..Default::default()
    };
    transcription_config
        .validate()
        .context("Invalid transcription configuration")?;

    let worker_command = WorkerCommand {
        program: args.worker_cmd.clone(),
        args: args
            .worker_args
            .split_whitespace()
            .map(|s| s.to_string())
            .collect(),
        working_dir: args
            .worker_workdir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string()),
        max_restarts: args.max_restarts,
        response_timeout: Duration::from_secs(args.response_timeout),
        ..Default::default()
    };

    let models = Arc::new(ModelCache::new(
        Arc::new(SubprocessLoader::new(worker_command)),
        transcription_config.clone(),
    ));

    // Stream engine: segments go to the log until a sink is attached.
    let (engine, mut segments) = StreamEngine::new(transcription_config, Arc::clone(&models));
    engine
        .start()
        .await
        .context("Failed to start stream engine")?;

    let segment_logger = tokio::spawn(async move {
        while let Some(segment) = segments.recv().await {
            info!(
                "Transcription [{}] {:.1}-{:.1}s ({}): {}",
                segment.stream_id,
                segment.start_time,
                segment.end_time,
                segment.model_used,
                segment.text
            );
        }
    });

    // Priority queue over a durable store.
    let store = PriorityStore::new(&args.queue_dir).context("Failed to open queue store")?;
    let queue = Arc::new(TranscriptionQueue::new(
        store,
        Arc::clone(&models),
        QueueConfig {
            max_workers: args.workers,
            ..Default::default()
        },
    ));
    queue.start();

    // Source switcher with automatic failover.
    let (switcher, mut switch_events) = SourceSwitcher::new(SwitcherConfig::default());
    switcher.start().await;

    let switch_logger = tokio::spawn(async move {
        while let Some(event) = switch_events.recv().await {
            info!(
                "Source switch: {} -> {} ({:?}, quality {:.2})",
                event.from_source.as_deref().unwrap_or("none"),
                event.to_source,
                event.reason,
                event.quality_score
            );
        }
    });

    // Periodic statistics report.
    let stats_task = {
        let engine = Arc::clone(&engine);
        let queue = Arc::clone(&queue);
        let switcher = Arc::clone(&switcher);
        let mut ticker = interval(Duration::from_secs(args.stats_interval));

        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                match serde_json::to_string(&engine.global_stats()) {
                    Ok(stats) => info!("Engine stats: {}", stats),
                    Err(e) => error!("Failed to serialize engine stats: {}", e),
                }
                match queue.stats().await {
                    Ok(stats) => match serde_json::to_string(&stats) {
                        Ok(stats) => info!("Queue stats: {}", stats),
                        Err(e) => error!("Failed to serialize queue stats: {}", e),
                    },
                    Err(e) => error!("Failed to gather queue stats: {}", e),
                }
                match serde_json::to_string(&switcher.stats().await) {
                    Ok(stats) => info!("Switcher stats: {}", stats),
                    Err(e) => error!("Failed to serialize switcher stats: {}", e),
                }
            }
        })
    };

    info!("Streamscribe service started");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C signal");
        }
        _ = wait_for_term_signal() => {
            info!("Received TERM signal");
        }
    }

    info!("Shutting down");
    stats_task.abort();
    switcher.stop().await;
    queue.stop().await;
    engine.stop().await;
    segment_logger.abort();
    switch_logger.abort();

    if engine.global_stats().total_segments == 0 {
        warn!("No segments were produced this run");
    }

    info!("Streamscribe service stopped");
    Ok(())
}

/// Wait for TERM signal (Unix only)
#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    futures::future::pending::<()>().await;
}
