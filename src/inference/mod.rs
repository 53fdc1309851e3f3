//! Inference backend seams.
//!
//! The engine and queue never talk to a speech model directly; they go
//! through [`SpeechModel`], and models are constructed through
//! [`ModelLoader`]. A backend can be an in-process model wrapper or the
//! subprocess worker in [`subprocess`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::model::ModelTier;
use crate::protocol::RawTranscription;

pub mod subprocess;

pub use subprocess::{SubprocessLoader, SubprocessModel, WorkerCommand};

/// Decode-time options for one inference call.
///
/// A snapshot of the transcription config that queue items can persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeOptions {
    /// Language hint; auto-detect when None
    pub language: Option<String>,
    /// Decoder beam size
    pub beam_size: u32,
    /// Decoder sampling temperature
    pub temperature: f32,
}

impl DecodeOptions {
    pub fn from_config(config: &crate::config::TranscriptionConfig) -> Self {
        Self {
            language: config.language.clone(),
            beam_size: config.beam_size,
            temperature: config.temperature,
        }
    }
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            language: None,
            beam_size: 5,
            temperature: 0.0,
        }
    }
}

/// A loaded speech-recognition model.
///
/// Implementations must be safe to share across stream loops and queue
/// workers; `transcribe` is expected to run its heavy work off the async
/// threads (`spawn_blocking` or subprocess I/O).
#[async_trait]
pub trait SpeechModel: Send + Sync {
    /// The tier this model instance was loaded as
    fn tier(&self) -> ModelTier;

    /// Transcribe mono 16 kHz samples
    async fn transcribe(
        &self,
        samples: &[f32],
        options: &DecodeOptions,
    ) -> crate::Result<RawTranscription>;
}

/// Constructs model instances by tier.
pub trait ModelLoader: Send + Sync {
    fn load(&self, tier: ModelTier) -> crate::Result<Arc<dyn SpeechModel>>;
}

/// In-memory model backend for tests and wiring examples.
///
/// Produces a deterministic placeholder transcription whose text records
/// the tier and window length; `fail_tiers` simulates load failures for
/// fallback testing.
#[derive(Default)]
pub struct MockLoader {
    /// Tiers whose load should fail
    pub fail_tiers: Vec<ModelTier>,
}

impl ModelLoader for MockLoader {
    fn load(&self, tier: ModelTier) -> crate::Result<Arc<dyn SpeechModel>> {
        if self.fail_tiers.contains(&tier) {
            return Err(crate::Error::ModelLoad {
                tier,
                message: "mock load failure".to_string(),
            });
        }
        Ok(Arc::new(MockModel { tier }))
    }
}

/// Model produced by [`MockLoader`].
pub struct MockModel {
    tier: ModelTier,
}

#[async_trait]
impl SpeechModel for MockModel {
    fn tier(&self) -> ModelTier {
        self.tier
    }

    async fn transcribe(
        &self,
        samples: &[f32],
        options: &DecodeOptions,
    ) -> crate::Result<RawTranscription> {
        let duration = samples.len() as f64 / crate::TARGET_SAMPLE_RATE as f64;
        Ok(RawTranscription {
            text: format!("[{} {:.1}s]", self.tier.as_str(), duration),
            language: options.language.clone().unwrap_or_else(|| "en".to_string()),
            confidence: 0.9,
            segments: vec![(0.0, duration, format!("[{} {:.1}s]", self.tier.as_str(), duration))],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_model_reports_tier_and_duration() {
        let loader = MockLoader::default();
        let model = loader.load(ModelTier::Small).unwrap();
        assert_eq!(model.tier(), ModelTier::Small);

        let result = model
            .transcribe(&vec![0.0; 32_000], &DecodeOptions::default())
            .await
            .unwrap();
        assert_eq!(result.text, "[small 2.0s]");
        assert_eq!(result.language, "en");
    }

    #[test]
    fn test_mock_loader_can_simulate_failures() {
        let loader = MockLoader {
            fail_tiers: vec![ModelTier::LargeV3],
        };
        assert!(loader.load(ModelTier::LargeV3).is_err());
        assert!(loader.load(ModelTier::Tiny).is_ok());
    }
}
