//! Per-stream transcription buffering.
//!
//! Each network stream owns one [`StreamBuffer`]: a pair of sample and
//! timestamp deques that absorb resampled audio, repair small
//! packet-sequence gaps with silence, evict oldest audio past the
//! configured bound, and hand out fixed-size overlapping windows for
//! inference.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;

use crate::config::TranscriptionConfig;
use crate::protocol::{AudioQualityMetrics, NetworkAudioChunk};
use crate::TARGET_SAMPLE_RATE;

pub mod resample;

pub use resample::LinearResampler;

/// Nominal packet duration assumed when converting a sequence gap into
/// missing audio time.
const PACKET_DURATION_S: f64 = 0.02;

/// Gaps shorter than this are filled with silence; longer gaps stay
/// unfilled so downstream consumers see real loss instead of fabricated
/// audio.
const MAX_FILLABLE_GAP_S: f64 = 0.5;

const QUALITY_HISTORY_LEN: usize = 100;
const PACKET_LOSS_HISTORY_LEN: usize = 50;

/// One extraction-ready window of audio.
#[derive(Debug, Clone)]
pub struct TranscriptionWindow {
    /// Exactly `chunk_duration_s` worth of 16 kHz mono samples
    pub samples: Vec<f32>,
    /// Timestamp of the first sample
    pub start_time: f64,
    /// Timestamp of the last sample
    pub end_time: f64,
    /// Average link quality over the buffered history
    pub quality: AudioQualityMetrics,
}

/// Buffer statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub stream_id: String,
    pub buffer_duration_s: f64,
    pub buffer_fill_percent: f64,
    pub resync_count: u64,
    pub average_quality: f64,
    pub average_packet_loss: f64,
    pub last_extraction_age_s: f64,
}

struct BufferState {
    samples: VecDeque<f32>,
    timestamps: VecDeque<f64>,
    last_sequence: Option<u64>,
    resync_count: u64,
    quality_history: VecDeque<f64>,
    packet_loss_history: VecDeque<f64>,
    last_extraction: Option<Instant>,
}

/// Per-stream audio buffer with gap repair and overlapped chunk extraction.
///
/// Designed for one producer (network ingestion) and one consumer (the
/// stream's processing loop); a single mutex guards every
/// read-modify-write.
pub struct StreamBuffer {
    stream_id: String,
    config: TranscriptionConfig,
    sample_rate: u32,
    inner: Mutex<BufferState>,
}

impl StreamBuffer {
    pub fn new(stream_id: impl Into<String>, config: TranscriptionConfig) -> Self {
        Self {
            stream_id: stream_id.into(),
            config,
            sample_rate: TARGET_SAMPLE_RATE,
            inner: Mutex::new(BufferState {
                samples: VecDeque::new(),
                timestamps: VecDeque::new(),
                last_sequence: None,
                resync_count: 0,
                quality_history: VecDeque::with_capacity(QUALITY_HISTORY_LEN),
                packet_loss_history: VecDeque::with_capacity(PACKET_LOSS_HISTORY_LEN),
                last_extraction: None,
            }),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Append a chunk, repairing sequence gaps and evicting old audio.
    ///
    /// The chunk is resampled to 16 kHz before insertion. Detecting a
    /// sequence gap increments the resync counter; gaps implying less than
    /// 500 ms of lost audio are filled with silence whose timestamps are
    /// interpolated backward from the chunk's timestamp.
    pub fn push_chunk(&self, chunk: NetworkAudioChunk) -> crate::Result<()> {
        let resampler = LinearResampler::new(chunk.sample_rate, self.sample_rate)?;
        let resampled = resampler.resample(&chunk.samples);

        let mut state = self.inner.lock().unwrap();

        if let Some(last) = state.last_sequence {
            if chunk.sequence_number > last + 1 {
                let gap_packets = chunk.sequence_number - last - 1;
                let gap_duration = gap_packets as f64 * PACKET_DURATION_S;
                state.resync_count += 1;
                warn!(
                    "Stream {}: {} packets lost ({:.0} ms gap)",
                    self.stream_id,
                    gap_packets,
                    gap_duration * 1000.0
                );

                if gap_duration < MAX_FILLABLE_GAP_S {
                    let silence_samples = (gap_duration * self.sample_rate as f64) as usize;
                    for i in 0..silence_samples {
                        state.samples.push_back(0.0);
                        state.timestamps.push_back(
                            chunk.timestamp - gap_duration + i as f64 / self.sample_rate as f64,
                        );
                    }
                }
            }
        }

        for (i, sample) in resampled.iter().enumerate() {
            state.samples.push_back(*sample);
            state
                .timestamps
                .push_back(chunk.timestamp + i as f64 / self.sample_rate as f64);
        }

        push_bounded(&mut state.quality_history, chunk.quality.overall_quality, QUALITY_HISTORY_LEN);
        push_bounded(
            &mut state.packet_loss_history,
            chunk.quality.packet_loss_percent,
            PACKET_LOSS_HISTORY_LEN,
        );

        state.last_sequence = Some(chunk.sequence_number);

        let max_samples = (self.config.max_buffer_duration_s * self.sample_rate as f64) as usize;
        while state.samples.len() > max_samples {
            state.samples.pop_front();
            state.timestamps.pop_front();
        }

        debug_assert_eq!(state.samples.len(), state.timestamps.len());
        Ok(())
    }

    /// Take the next transcription window if enough audio is buffered.
    ///
    /// Removes `chunk_duration_s - overlap_duration_s` worth of leading
    /// samples so consecutive windows overlap by `overlap_duration_s`,
    /// compensating for word-boundary clipping in streaming recognition.
    /// Returns `None` until a full window is available; calling again
    /// without new data yields a window only while the retained audio
    /// still covers one.
    pub fn next_window(&self) -> Option<TranscriptionWindow> {
        let mut state = self.inner.lock().unwrap();

        let chunk_samples = (self.config.chunk_duration_s * self.sample_rate as f64) as usize;
        if state.samples.len() < chunk_samples || chunk_samples == 0 {
            return None;
        }

        let samples: Vec<f32> = state.samples.iter().take(chunk_samples).copied().collect();
        let start_time = state.timestamps[0];
        let end_time = state.timestamps[chunk_samples - 1];

        let average_quality = mean_or(&state.quality_history, 0.5);
        let average_packet_loss = mean_or(&state.packet_loss_history, 0.0);

        let quality = AudioQualityMetrics {
            packet_loss_percent: average_packet_loss,
            overall_quality: average_quality,
            ..AudioQualityMetrics::nominal(self.sample_rate)
        };

        let overlap_samples = (self.config.overlap_duration_s * self.sample_rate as f64) as usize;
        let remove_samples = chunk_samples.saturating_sub(overlap_samples);
        for _ in 0..remove_samples {
            state.samples.pop_front();
            state.timestamps.pop_front();
        }

        state.last_extraction = Some(Instant::now());

        debug_assert_eq!(state.samples.len(), state.timestamps.len());
        Some(TranscriptionWindow {
            samples,
            start_time,
            end_time,
            quality,
        })
    }

    /// Current resync (gap) count.
    pub fn resync_count(&self) -> u64 {
        self.inner.lock().unwrap().resync_count
    }

    /// Buffered audio duration in seconds.
    pub fn buffered_duration(&self) -> f64 {
        self.inner.lock().unwrap().samples.len() as f64 / self.sample_rate as f64
    }

    /// Statistics snapshot for monitoring.
    pub fn stats(&self) -> BufferStats {
        let state = self.inner.lock().unwrap();
        let max_samples = self.config.max_buffer_duration_s * self.sample_rate as f64;

        BufferStats {
            stream_id: self.stream_id.clone(),
            buffer_duration_s: state.samples.len() as f64 / self.sample_rate as f64,
            buffer_fill_percent: if max_samples > 0.0 {
                state.samples.len() as f64 / max_samples * 100.0
            } else {
                0.0
            },
            resync_count: state.resync_count,
            average_quality: mean_or(&state.quality_history, 0.0),
            average_packet_loss: mean_or(&state.packet_loss_history, 0.0),
            last_extraction_age_s: state
                .last_extraction
                .map(|at| at.elapsed().as_secs_f64())
                .unwrap_or(0.0),
        }
    }
}

fn push_bounded(history: &mut VecDeque<f64>, value: f64, limit: usize) {
    if history.len() == limit {
        history.pop_front();
    }
    history.push_back(value);
}

fn mean_or(values: &VecDeque<f64>, default: f64) -> f64 {
    if values.is_empty() {
        default
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TranscriptionConfig {
        TranscriptionConfig {
            chunk_duration_s: 1.0,
            overlap_duration_s: 0.25,
            max_buffer_duration_s: 3.0,
            min_audio_duration_s: 0.1,
            ..Default::default()
        }
    }

    fn chunk(seq: u64, timestamp: f64, samples: usize) -> NetworkAudioChunk {
        NetworkAudioChunk::new(
            "s1",
            vec![0.1; samples],
            timestamp,
            TARGET_SAMPLE_RATE,
            AudioQualityMetrics::nominal(TARGET_SAMPLE_RATE),
            seq,
        )
    }

    #[test]
    fn test_sample_and_timestamp_buffers_stay_paired() {
        let buffer = StreamBuffer::new("s1", test_config());

        for seq in 0..10 {
            // 20 ms packets, contiguous sequence
            buffer
                .push_chunk(chunk(seq, seq as f64 * 0.02, 320))
                .unwrap();
            let state = buffer.inner.lock().unwrap();
            assert_eq!(state.samples.len(), state.timestamps.len());
        }
        assert_eq!(buffer.resync_count(), 0);
    }

    #[test]
    fn test_small_gap_filled_with_exact_silence() {
        let buffer = StreamBuffer::new("s1", test_config());
        buffer.push_chunk(chunk(0, 0.0, 320)).unwrap();

        // Skip 5 packets: 5 * 20 ms = 100 ms < 500 ms, filled.
        buffer.push_chunk(chunk(6, 0.12, 320)).unwrap();

        let expected_silence = (5.0 * 0.02 * TARGET_SAMPLE_RATE as f64) as usize;
        let state = buffer.inner.lock().unwrap();
        assert_eq!(state.samples.len(), 320 * 2 + expected_silence);
        assert_eq!(state.resync_count, 1);
    }

    #[test]
    fn test_large_gap_left_unfilled() {
        let buffer = StreamBuffer::new("s1", test_config());
        buffer.push_chunk(chunk(0, 0.0, 320)).unwrap();

        // Skip 30 packets: 600 ms >= 500 ms, not filled.
        buffer.push_chunk(chunk(31, 0.62, 320)).unwrap();

        let state = buffer.inner.lock().unwrap();
        assert_eq!(state.samples.len(), 640);
        assert_eq!(state.resync_count, 1);
    }

    #[test]
    fn test_buffer_duration_never_exceeds_limit() {
        let buffer = StreamBuffer::new("s1", test_config());

        for seq in 0..20 {
            // 0.5 s per chunk, 10 s total against a 3 s cap.
            buffer
                .push_chunk(chunk(seq, seq as f64 * 0.5, 8_000))
                .unwrap();
            assert!(buffer.buffered_duration() <= 3.0 + f64::EPSILON);
        }
    }

    #[test]
    fn test_window_not_ready_until_full_chunk() {
        let buffer = StreamBuffer::new("s1", test_config());
        buffer.push_chunk(chunk(0, 0.0, 8_000)).unwrap();
        assert!(buffer.next_window().is_none());

        buffer.push_chunk(chunk(1, 0.5, 8_000)).unwrap();
        let window = buffer.next_window().expect("one full second buffered");
        assert_eq!(window.samples.len(), 16_000);
        assert_eq!(window.start_time, 0.0);
    }

    #[test]
    fn test_extraction_retains_overlap() {
        let buffer = StreamBuffer::new("s1", test_config());
        buffer.push_chunk(chunk(0, 0.0, 16_000)).unwrap();

        assert!(buffer.next_window().is_some());
        // 1.0 s window minus 0.25 s overlap removed: 0.25 s remains.
        assert!((buffer.buffered_duration() - 0.25).abs() < 1e-9);

        // Not enough retained audio for another window without new data.
        assert!(buffer.next_window().is_none());
    }

    #[test]
    fn test_consecutive_windows_overlap() {
        let buffer = StreamBuffer::new("s1", test_config());
        buffer.push_chunk(chunk(0, 0.0, 32_000)).unwrap();

        let first = buffer.next_window().unwrap();
        let second = buffer.next_window().unwrap();

        // Second window starts where the overlap begins, 0.75 s in.
        assert!((second.start_time - (first.end_time - 0.25)).abs() < 1e-3);
    }

    #[test]
    fn test_incoming_audio_is_resampled() {
        let buffer = StreamBuffer::new("s1", test_config());
        let chunk = NetworkAudioChunk::new(
            "s1",
            vec![0.1; 48_000],
            0.0,
            48_000,
            AudioQualityMetrics::nominal(48_000),
            0,
        );
        buffer.push_chunk(chunk).unwrap();
        assert!((buffer.buffered_duration() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_window_quality_averages_history() {
        let buffer = StreamBuffer::new("s1", test_config());
        let mut quality = AudioQualityMetrics::nominal(TARGET_SAMPLE_RATE);
        quality.overall_quality = 0.4;
        quality.packet_loss_percent = 2.0;

        let chunk = NetworkAudioChunk::new(
            "s1",
            vec![0.1; 16_000],
            0.0,
            TARGET_SAMPLE_RATE,
            quality,
            0,
        );
        buffer.push_chunk(chunk).unwrap();

        let window = buffer.next_window().unwrap();
        assert!((window.quality.overall_quality - 0.4).abs() < 1e-9);
        assert!((window.quality.packet_loss_percent - 2.0).abs() < 1e-9);
    }
}
