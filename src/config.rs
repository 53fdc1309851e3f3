use serde::{Deserialize, Serialize};

use crate::model::ModelTier;

/// Latency/accuracy trade-off for model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LatencyMode {
    /// Smallest models, fastest turnaround
    LowLatency,
    /// Default three-tier mapping
    #[default]
    Balanced,
    /// Full tier range, favors accuracy
    HighAccuracy,
}

/// Configuration for stream transcription.
///
/// Durations are plain seconds so the struct round-trips through JSON
/// config files without custom serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Model tier used when adaptive selection is disabled
    pub model_tier: ModelTier,
    /// Optional filesystem path for custom model weights
    pub model_path: Option<String>,
    /// Inference device hint ("auto", "cpu", "cuda")
    pub device: String,
    /// Transcription language; auto-detect when None
    pub language: Option<String>,
    /// Decoder beam size
    pub beam_size: u32,
    /// Decoder sampling temperature
    pub temperature: f32,

    /// Duration of each transcription window in seconds
    pub chunk_duration_s: f64,
    /// Overlap retained between consecutive windows in seconds
    pub overlap_duration_s: f64,
    /// Maximum buffered audio per stream in seconds
    pub max_buffer_duration_s: f64,
    /// Windows shorter than this are skipped
    pub min_audio_duration_s: f64,

    /// Enable quality-based model selection
    pub adaptive_model_selection: bool,
    /// Quality at or above this uses the large tiers
    pub quality_threshold_high: f64,
    /// Quality at or above this uses the middle tiers
    pub quality_threshold_medium: f64,

    /// Latency/accuracy trade-off
    pub latency_mode: LatencyMode,
    /// Processing beyond this logs a warning; results are still emitted
    pub max_processing_latency_ms: f64,

    /// Bound on simultaneously running inference calls
    pub max_concurrent_streams: usize,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model_tier: ModelTier::Base,
            model_path: None,
            device: "auto".to_string(),
            language: None,
            beam_size: 5,
            temperature: 0.0,
            chunk_duration_s: 30.0,
            overlap_duration_s: 5.0,
            max_buffer_duration_s: 120.0,
            min_audio_duration_s: 1.0,
            adaptive_model_selection: true,
            quality_threshold_high: 0.8,
            quality_threshold_medium: 0.5,
            latency_mode: LatencyMode::Balanced,
            max_processing_latency_ms: 5000.0,
            max_concurrent_streams: 4,
        }
    }
}

impl TranscriptionConfig {
    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> crate::Result<()> {
        if self.chunk_duration_s <= 0.0 {
            return Err(crate::Error::Config(
                "chunk_duration_s must be positive".to_string(),
            ));
        }
        if self.overlap_duration_s < 0.0 || self.overlap_duration_s >= self.chunk_duration_s {
            return Err(crate::Error::Config(format!(
                "overlap_duration_s must be in [0, chunk_duration_s); got {}",
                self.overlap_duration_s
            )));
        }
        if self.max_buffer_duration_s < self.chunk_duration_s {
            return Err(crate::Error::Config(
                "max_buffer_duration_s must hold at least one chunk".to_string(),
            ));
        }
        if self.max_concurrent_streams == 0 {
            return Err(crate::Error::Config(
                "max_concurrent_streams must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold_medium)
            || !(0.0..=1.0).contains(&self.quality_threshold_high)
            || self.quality_threshold_medium > self.quality_threshold_high
        {
            return Err(crate::Error::Config(
                "quality thresholds must satisfy 0 <= medium <= high <= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TranscriptionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.latency_mode, LatencyMode::Balanced);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let config = TranscriptionConfig {
            overlap_duration_s: 30.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_must_hold_a_chunk() {
        let config = TranscriptionConfig {
            max_buffer_duration_s: 10.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = TranscriptionConfig {
            latency_mode: LatencyMode::HighAccuracy,
            language: Some("de".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: TranscriptionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.latency_mode, LatencyMode::HighAccuracy);
        assert_eq!(back.language.as_deref(), Some("de"));
    }
}
