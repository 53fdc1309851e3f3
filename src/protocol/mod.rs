use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ModelTier;

/// Audio quality snapshot for one chunk or monitoring tick.
///
/// Compared by value; a new snapshot is produced per measurement rather
/// than mutating an old one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioQualityMetrics {
    /// Signal-to-noise ratio in dB
    pub snr_db: f64,
    /// Total harmonic distortion estimate in percent
    pub thd_percent: f64,
    /// Network packet loss in percent
    pub packet_loss_percent: f64,
    /// Network jitter in milliseconds
    pub jitter_ms: f64,
    /// Audio bitrate in kbit/s
    pub bitrate_kbps: f64,
    /// Sample rate of the measured audio
    pub sample_rate: u32,
    /// Combined quality score in [0, 1]
    pub overall_quality: f64,
}

impl AudioQualityMetrics {
    /// A neutral "clean link" snapshot, useful as a default for sources
    /// that have not reported telemetry yet.
    pub fn nominal(sample_rate: u32) -> Self {
        Self {
            snr_db: 20.0,
            thd_percent: 1.0,
            packet_loss_percent: 0.0,
            jitter_ms: 10.0,
            bitrate_kbps: 128.0,
            sample_rate,
            overall_quality: 0.5,
        }
    }
}

/// Compute quality metrics for a chunk of mono samples plus network telemetry.
///
/// SNR is estimated in the time domain: the quietest decile of samples is
/// taken as the noise floor. Distortion is approximated by the fraction of
/// samples at the clipping rail. The overall score blends signal, distortion,
/// network, and bitrate terms with fixed weights.
pub fn compute_quality_metrics(
    samples: &[f32],
    sample_rate: u32,
    packet_loss_percent: f64,
    jitter_ms: f64,
    bitrate_kbps: f64,
) -> AudioQualityMetrics {
    let signal_power = mean_power(samples);

    let snr_db = if signal_power > 0.0 && !samples.is_empty() {
        let mut magnitudes: Vec<f32> = samples.iter().map(|s| s.abs()).collect();
        magnitudes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let noise_threshold = magnitudes[magnitudes.len() / 10];

        let noise: Vec<f32> = samples
            .iter()
            .copied()
            .filter(|s| s.abs() <= noise_threshold)
            .collect();
        let noise_power = mean_power(&noise);

        if noise_power > 0.0 {
            10.0 * (signal_power / noise_power).log10()
        } else {
            60.0 // effectively noiseless
        }
    } else {
        0.0
    };

    let clipped = samples.iter().filter(|s| s.abs() >= 0.99).count();
    let thd_percent = if samples.is_empty() {
        0.0
    } else {
        (clipped as f64 / samples.len() as f64) * 100.0
    };

    let snr_score = (snr_db / 40.0).clamp(0.0, 1.0);
    let thd_score = (1.0 - thd_percent / 10.0).max(0.0);
    let network_score = (1.0 - packet_loss_percent / 10.0 - jitter_ms / 100.0).max(0.0);
    let bitrate_score = (bitrate_kbps / 128.0).min(1.0);

    let overall_quality =
        snr_score * 0.4 + thd_score * 0.3 + network_score * 0.2 + bitrate_score * 0.1;

    AudioQualityMetrics {
        snr_db,
        thd_percent,
        packet_loss_percent,
        jitter_ms,
        bitrate_kbps,
        sample_rate,
        overall_quality,
    }
}

fn mean_power(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| (*s as f64) * (*s as f64)).sum::<f64>() / samples.len() as f64
}

/// One chunk of network audio delivered by the ingestion layer.
///
/// Consumed exactly once by the stream buffer; samples are mono f32 PCM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAudioChunk {
    /// Stream this chunk belongs to
    pub stream_id: String,
    /// Mono PCM samples
    pub samples: Vec<f32>,
    /// Capture timestamp of the first sample, seconds since stream epoch
    pub timestamp: f64,
    /// Sample rate of `samples` as delivered
    pub sample_rate: u32,
    /// Link quality measured for this chunk
    pub quality: AudioQualityMetrics,
    /// Monotonic packet sequence number
    pub sequence_number: u64,
    /// Marks the last chunk of a stream
    pub is_final: bool,
}

impl NetworkAudioChunk {
    pub fn new(
        stream_id: impl Into<String>,
        samples: Vec<f32>,
        timestamp: f64,
        sample_rate: u32,
        quality: AudioQualityMetrics,
        sequence_number: u64,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            samples,
            timestamp,
            sample_rate,
            quality,
            sequence_number,
            is_final: false,
        }
    }

    /// Duration of this chunk in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Raw output of one inference call, before stream metadata is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTranscription {
    /// Transcribed text
    pub text: String,
    /// Detected or configured language (ISO 639-1)
    pub language: String,
    /// Confidence score (0.0 to 1.0)
    pub confidence: f64,
    /// Per-segment timing within the window: (start_s, end_s, text)
    pub segments: Vec<(f64, f64, String)>,
}

/// Transcription result for one stream window, with link telemetry attached.
///
/// Immutable once constructed; ordering within a stream follows
/// `start_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    /// Unique identifier (`<stream_id>_<start_ms>`)
    pub id: String,
    /// Transcribed text
    pub text: String,
    /// Window start, seconds since stream epoch
    pub start_time: f64,
    /// Window end, seconds since stream epoch
    pub end_time: f64,
    /// Confidence score (0.0 to 1.0)
    pub confidence: f64,
    /// Language of the text
    pub language: String,
    /// Originating stream
    pub stream_id: String,
    /// Average link quality over the window
    pub audio_quality: f64,
    /// Model tier that produced the text
    pub model_used: ModelTier,
    /// Wall-clock processing time in milliseconds
    pub processing_latency_ms: f64,
    /// When the segment was produced
    pub timestamp: DateTime<Utc>,

    // Network link telemetry
    pub packet_loss: f64,
    pub jitter_ms: f64,
    pub bitrate_kbps: f64,
    pub resync_count: u64,
}

impl TranscriptionSegment {
    /// Serialize to MessagePack format
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize from MessagePack format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, seconds: f32, rate: u32, amplitude: f32) -> Vec<f32> {
        let n = (seconds * rate as f32) as usize;
        (0..n)
            .map(|i| (i as f32 / rate as f32 * freq * 2.0 * std::f32::consts::PI).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_chunk_duration() {
        let quality = AudioQualityMetrics::nominal(16_000);
        let chunk = NetworkAudioChunk::new("s1", vec![0.0; 16_000], 0.0, 16_000, quality, 0);
        assert_eq!(chunk.duration(), 1.0);
    }

    #[test]
    fn test_clean_signal_scores_higher_than_lossy_signal() {
        let samples = sine(440.0, 1.0, 16_000, 0.5);

        let clean = compute_quality_metrics(&samples, 16_000, 0.0, 5.0, 128.0);
        let lossy = compute_quality_metrics(&samples, 16_000, 8.0, 60.0, 48.0);

        assert!(clean.overall_quality > lossy.overall_quality);
        assert!(clean.overall_quality <= 1.0);
        assert!(lossy.overall_quality >= 0.0);
    }

    #[test]
    fn test_silence_has_zero_snr() {
        let metrics = compute_quality_metrics(&[0.0; 1600], 16_000, 0.0, 0.0, 128.0);
        assert_eq!(metrics.snr_db, 0.0);
    }

    #[test]
    fn test_clipping_raises_distortion() {
        let clean = sine(440.0, 0.5, 16_000, 0.5);
        let clipped: Vec<f32> = sine(440.0, 0.5, 16_000, 2.0)
            .into_iter()
            .map(|s| s.clamp(-1.0, 1.0))
            .collect();

        let clean_metrics = compute_quality_metrics(&clean, 16_000, 0.0, 0.0, 128.0);
        let clipped_metrics = compute_quality_metrics(&clipped, 16_000, 0.0, 0.0, 128.0);

        assert!(clipped_metrics.thd_percent > clean_metrics.thd_percent);
    }

    #[test]
    fn test_segment_serialization() {
        let segment = TranscriptionSegment {
            id: "s1_0".to_string(),
            text: "hello world".to_string(),
            start_time: 0.0,
            end_time: 30.0,
            confidence: 0.95,
            language: "en".to_string(),
            stream_id: "s1".to_string(),
            audio_quality: 0.8,
            model_used: ModelTier::Base,
            processing_latency_ms: 420.0,
            timestamp: Utc::now(),
            packet_loss: 0.0,
            jitter_ms: 10.0,
            bitrate_kbps: 128.0,
            resync_count: 0,
        };

        let bytes = segment.to_bytes().unwrap();
        let back = TranscriptionSegment::from_bytes(&bytes).unwrap();
        assert_eq!(back.text, segment.text);
        assert_eq!(back.model_used, ModelTier::Base);
    }
}
