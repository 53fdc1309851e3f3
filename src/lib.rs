//! Streamscribe - a real-time multi-stream transcription core
//!
//! This crate provides the transcription heart of a meeting-capture system:
//!
//! - Per-stream audio buffering with packet-gap repair and overlapped chunking
//! - Quality-adaptive model selection with a lazily loaded tier cache
//! - Concurrent per-stream transcription loops with bounded inference
//! - A sled-backed priority work queue with retrying workers and dead-lettering
//! - Automatic audio-source switching with hysteresis and cooldown
//!
//! # Example
//!
//! ```rust,no_run
//! use streamscribe::{
//!     config::TranscriptionConfig,
//!     engine::StreamEngine,
//!     inference::MockLoader,
//!     model::ModelCache,
//!     protocol::{AudioQualityMetrics, NetworkAudioChunk},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> streamscribe::Result<()> {
//!     let config = TranscriptionConfig::default();
//!     let models = Arc::new(ModelCache::new(Arc::new(MockLoader::default()), config.clone()));
//!
//!     let (engine, mut segments) = StreamEngine::new(config, models);
//!     engine.start().await?;
//!     engine.create_stream("mic-0", None)?;
//!
//!     let chunk = NetworkAudioChunk::new(
//!         "mic-0",
//!         vec![0.0; 16_000],
//!         0.0,
//!         16_000,
//!         AudioQualityMetrics::nominal(16_000),
//!         0,
//!     );
//!     engine.process_audio_chunk(chunk)?;
//!
//!     if let Some(segment) = segments.recv().await {
//!         println!("[{}] {}", segment.stream_id, segment.text);
//!     }
//!
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod engine;
pub mod inference;
pub mod model;
pub mod protocol;
pub mod queue;
pub mod switcher;

// Re-export commonly used types for convenience
pub use config::{LatencyMode, TranscriptionConfig};
pub use engine::{EngineStats, StreamEngine};
pub use model::{ModelCache, ModelTier};
pub use protocol::{AudioQualityMetrics, NetworkAudioChunk, TranscriptionSegment};
pub use queue::{ChunkStatus, QueuePriority, QueuedAudioChunk, TranscriptionQueue};
pub use switcher::{AudioSourceInfo, SourceState, SourceSwitcher, SourceType, SwitcherConfig};

use thiserror::Error;

/// Errors that can occur in the streamscribe system
#[derive(Error, Debug)]
pub enum Error {
    /// No usable model tier could be loaded; the smallest tier is the
    /// baseline dependency, so this is fatal for the service.
    #[error("no usable model: {0}")]
    ModelUnavailable(String),

    /// A specific model tier failed to load (recoverable by fallback)
    #[error("failed to load model tier {tier}: {message}")]
    ModelLoad { tier: crate::model::ModelTier, message: String },

    /// Inference call failed
    #[error("inference error: {message}")]
    Inference { message: String, transient: bool },

    /// Invalid or unsupported configuration; never retried
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation referenced a stream that does not exist
    #[error("unknown stream: {0}")]
    UnknownStream(String),

    /// Queue storage operation failed
    #[error("queue error: {0}")]
    Queue(#[from] anyhow::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Inference { transient, .. } => *transient,
            Error::Io(_) | Error::Queue(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for streamscribe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Sample rate every buffer normalizes to before inference.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constants() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "streamscribe");
    }

    #[test]
    fn test_transient_classification() {
        let err = Error::Config("bad beam size".to_string());
        assert!(!err.is_transient());

        let err = Error::Inference {
            message: "decoder timeout".to_string(),
            transient: true,
        };
        assert!(err.is_transient());

        let err = Error::Inference {
            message: "unsupported language".to_string(),
            transient: false,
        };
        assert!(!err.is_transient());
    }
}
