//! Multi-stream transcription engine.
//!
//! One asynchronous processing loop per stream pulls windows from that
//! stream's buffer, selects a model tier for the measured link quality,
//! runs inference bounded by a shared permit pool, and emits
//! [`TranscriptionSegment`]s over an mpsc channel. Per-stream emission is
//! chronological; streams progress independently of each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::buffer::{BufferStats, StreamBuffer, TranscriptionWindow};
use crate::config::TranscriptionConfig;
use crate::inference::DecodeOptions;
use crate::model::{ModelCache, ModelTier};
use crate::protocol::TranscriptionSegment;
use crate::TARGET_SAMPLE_RATE;

/// Sleep between polls when a stream has no full window buffered.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Back-off after a failed iteration so one bad chunk cannot spin the loop.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Capacity of the emitted-segment channel.
const SEGMENT_CHANNEL_CAPACITY: usize = 100;

struct StreamEntry {
    buffer: Arc<StreamBuffer>,
    config: TranscriptionConfig,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct StatsInner {
    total_segments: u64,
    total_processing_ms: f64,
    quality_high: u64,
    quality_medium: u64,
    quality_low: u64,
    model_usage: HashMap<ModelTier, u64>,
}

/// Global engine statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_segments: u64,
    pub average_latency_ms: f64,
    pub quality_distribution: QualityDistribution,
    pub model_usage: std::collections::BTreeMap<String, u64>,
    pub active_streams: usize,
    pub loaded_models: Vec<ModelTier>,
    pub is_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityDistribution {
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

/// Orchestrates per-stream buffers and processing loops.
pub struct StreamEngine {
    config: TranscriptionConfig,
    models: Arc<ModelCache>,
    streams: Mutex<HashMap<String, StreamEntry>>,
    inference_permits: Arc<Semaphore>,
    segment_tx: mpsc::Sender<TranscriptionSegment>,
    stats: Arc<Mutex<StatsInner>>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl StreamEngine {
    /// Create an engine and the receiving end of its segment stream.
    ///
    /// Segments are fully populated before they are sent; persistence and
    /// broadcast are the receiver's concern.
    pub fn new(
        config: TranscriptionConfig,
        models: Arc<ModelCache>,
    ) -> (Arc<Self>, mpsc::Receiver<TranscriptionSegment>) {
        let (segment_tx, segment_rx) = mpsc::channel(SEGMENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        let engine = Arc::new(Self {
            inference_permits: Arc::new(Semaphore::new(config.max_concurrent_streams)),
            config,
            models,
            streams: Mutex::new(HashMap::new()),
            segment_tx,
            stats: Arc::new(Mutex::new(StatsInner::default())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        });

        (engine, segment_rx)
    }

    /// Start the engine: verify the baseline model loads and spawn loops
    /// for streams registered before startup.
    pub async fn start(self: &Arc<Self>) -> crate::Result<()> {
        if self.running.load(Ordering::Relaxed) {
            warn!("Stream engine is already running");
            return Ok(());
        }

        // A missing baseline model must surface here, not on the first chunk.
        self.config.validate()?;
        self.models.preload_baseline()?;

        self.running.store(true, Ordering::Relaxed);

        let stream_ids: Vec<String> = {
            let streams = self.streams.lock().unwrap();
            streams.keys().cloned().collect()
        };
        for stream_id in stream_ids {
            self.spawn_stream_loop(&stream_id);
        }

        info!("Stream engine started");
        Ok(())
    }

    /// Stop all processing loops. In-flight inference is abandoned on a
    /// best-effort basis, not guaranteed instant.
    pub async fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }

        let _ = self.shutdown_tx.send(());

        let mut streams = self.streams.lock().unwrap();
        for entry in streams.values_mut() {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
        drop(streams);

        info!("Stream engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Register a stream. A per-stream config overrides the engine default.
    pub fn create_stream(
        self: &Arc<Self>,
        stream_id: &str,
        config: Option<TranscriptionConfig>,
    ) -> crate::Result<()> {
        {
            let mut streams = self.streams.lock().unwrap();
            if streams.contains_key(stream_id) {
                return Err(crate::Error::Config(format!(
                    "stream {} already exists",
                    stream_id
                )));
            }

            let stream_config = config.unwrap_or_else(|| self.config.clone());
            stream_config.validate()?;

            streams.insert(
                stream_id.to_string(),
                StreamEntry {
                    buffer: Arc::new(StreamBuffer::new(stream_id, stream_config.clone())),
                    config: stream_config,
                    task: None,
                },
            );
        }

        if self.is_running() {
            self.spawn_stream_loop(stream_id);
        }

        info!("Created transcription stream: {}", stream_id);
        Ok(())
    }

    /// Remove a stream and cancel its processing loop.
    pub fn remove_stream(&self, stream_id: &str) -> crate::Result<()> {
        let mut streams = self.streams.lock().unwrap();
        let entry = streams
            .remove(stream_id)
            .ok_or_else(|| crate::Error::UnknownStream(stream_id.to_string()))?;

        if let Some(task) = entry.task {
            task.abort();
        }

        info!("Removed transcription stream: {}", stream_id);
        Ok(())
    }

    /// Route an incoming chunk to its stream's buffer.
    pub fn process_audio_chunk(&self, chunk: crate::protocol::NetworkAudioChunk) -> crate::Result<()> {
        let buffer = {
            let streams = self.streams.lock().unwrap();
            streams
                .get(&chunk.stream_id)
                .map(|entry| Arc::clone(&entry.buffer))
                .ok_or_else(|| crate::Error::UnknownStream(chunk.stream_id.clone()))?
        };
        buffer.push_chunk(chunk)
    }

    /// Buffer statistics for one stream.
    pub fn stream_stats(&self, stream_id: &str) -> crate::Result<BufferStats> {
        let streams = self.streams.lock().unwrap();
        streams
            .get(stream_id)
            .map(|entry| entry.buffer.stats())
            .ok_or_else(|| crate::Error::UnknownStream(stream_id.to_string()))
    }

    /// Global statistics snapshot.
    pub fn global_stats(&self) -> EngineStats {
        let stats = self.stats.lock().unwrap();
        let streams = self.streams.lock().unwrap();

        EngineStats {
            total_segments: stats.total_segments,
            average_latency_ms: if stats.total_segments > 0 {
                stats.total_processing_ms / stats.total_segments as f64
            } else {
                0.0
            },
            quality_distribution: QualityDistribution {
                high: stats.quality_high,
                medium: stats.quality_medium,
                low: stats.quality_low,
            },
            model_usage: stats
                .model_usage
                .iter()
                .map(|(tier, count)| (tier.as_str().to_string(), *count))
                .collect(),
            active_streams: streams.len(),
            loaded_models: self.models.loaded_tiers(),
            is_running: self.is_running(),
        }
    }

    fn spawn_stream_loop(self: &Arc<Self>, stream_id: &str) {
        let mut streams = self.streams.lock().unwrap();
        let Some(entry) = streams.get_mut(stream_id) else {
            return;
        };

        let engine = Arc::clone(self);
        let buffer = Arc::clone(&entry.buffer);
        let config = entry.config.clone();
        let stream_id = stream_id.to_string();
        let shutdown_rx = self.shutdown_tx.subscribe();

        entry.task = Some(tokio::spawn(async move {
            engine
                .run_stream_loop(stream_id, buffer, config, shutdown_rx)
                .await;
        }));
    }

    async fn run_stream_loop(
        self: Arc<Self>,
        stream_id: String,
        buffer: Arc<StreamBuffer>,
        config: TranscriptionConfig,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("Started processing stream: {}", stream_id);

        let min_samples = (config.min_audio_duration_s * TARGET_SAMPLE_RATE as f64) as usize;

        while self.running.load(Ordering::Relaxed) {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            let Some(window) = buffer.next_window() else {
                sleep(POLL_INTERVAL).await;
                continue;
            };

            if window.samples.len() < min_samples {
                continue;
            }

            match self
                .transcribe_window(&stream_id, &buffer, &config, window)
                .await
            {
                Ok(Some(segment)) => {
                    if self.segment_tx.send(segment).await.is_err() {
                        warn!(
                            "Segment receiver dropped; stopping stream {}",
                            stream_id
                        );
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // One failed window never terminates the stream.
                    error!("Error processing stream {}: {}", stream_id, e);
                    sleep(ERROR_BACKOFF).await;
                }
            }
        }

        info!("Stopped processing stream: {}", stream_id);
    }

    async fn transcribe_window(
        &self,
        stream_id: &str,
        buffer: &StreamBuffer,
        config: &TranscriptionConfig,
        window: TranscriptionWindow,
    ) -> crate::Result<Option<TranscriptionSegment>> {
        let processing_start = Instant::now();

        let _permit = self
            .inference_permits
            .acquire()
            .await
            .map_err(|_| crate::Error::Inference {
                message: "inference permit pool closed".to_string(),
                transient: false,
            })?;

        let (model, tier) = self
            .models
            .model_for_quality(window.quality.overall_quality)?;
        let options = DecodeOptions::from_config(config);

        let raw = model.transcribe(&window.samples, &options).await?;

        let processing_ms = processing_start.elapsed().as_secs_f64() * 1000.0;
        if processing_ms > config.max_processing_latency_ms {
            // Late results are still emitted; downstream orders by timestamp.
            warn!(
                "Stream {}: transcription latency exceeded: {:.1} ms",
                stream_id, processing_ms
            );
        }

        if raw.text.trim().is_empty() {
            return Ok(None);
        }

        let segment = TranscriptionSegment {
            id: format!("{}_{}", stream_id, (window.start_time * 1000.0) as i64),
            text: raw.text,
            start_time: window.start_time,
            end_time: window.end_time,
            confidence: raw.confidence,
            language: raw.language,
            stream_id: stream_id.to_string(),
            audio_quality: window.quality.overall_quality,
            model_used: tier,
            processing_latency_ms: processing_ms,
            timestamp: Utc::now(),
            packet_loss: window.quality.packet_loss_percent,
            jitter_ms: window.quality.jitter_ms,
            bitrate_kbps: window.quality.bitrate_kbps,
            resync_count: buffer.resync_count(),
        };

        self.record_segment(&segment, tier);
        Ok(Some(segment))
    }

    fn record_segment(&self, segment: &TranscriptionSegment, tier: ModelTier) {
        let mut stats = self.stats.lock().unwrap();
        stats.total_segments += 1;
        stats.total_processing_ms += segment.processing_latency_ms;

        if segment.audio_quality >= 0.7 {
            stats.quality_high += 1;
        } else if segment.audio_quality >= 0.4 {
            stats.quality_medium += 1;
        } else {
            stats.quality_low += 1;
        }

        *stats.model_usage.entry(tier).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::MockLoader;
    use crate::protocol::{AudioQualityMetrics, NetworkAudioChunk};
    use tokio::time::timeout;

    fn test_config() -> TranscriptionConfig {
        TranscriptionConfig {
            chunk_duration_s: 1.0,
            overlap_duration_s: 0.25,
            max_buffer_duration_s: 10.0,
            min_audio_duration_s: 0.1,
            ..Default::default()
        }
    }

    fn engine_with_mock() -> (Arc<StreamEngine>, mpsc::Receiver<TranscriptionSegment>) {
        let config = test_config();
        let models = Arc::new(ModelCache::new(
            Arc::new(MockLoader::default()),
            config.clone(),
        ));
        StreamEngine::new(config, models)
    }

    fn chunk(stream_id: &str, seq: u64, timestamp: f64, seconds: f64) -> NetworkAudioChunk {
        let samples = (seconds * TARGET_SAMPLE_RATE as f64) as usize;
        NetworkAudioChunk::new(
            stream_id,
            vec![0.1; samples],
            timestamp,
            TARGET_SAMPLE_RATE,
            AudioQualityMetrics::nominal(TARGET_SAMPLE_RATE),
            seq,
        )
    }

    #[tokio::test]
    async fn test_unknown_stream_is_an_error() {
        let (engine, _rx) = engine_with_mock();
        let result = engine.process_audio_chunk(chunk("ghost", 0, 0.0, 0.1));
        assert!(matches!(result, Err(crate::Error::UnknownStream(_))));
        assert!(engine.remove_stream("ghost").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_stream_rejected() {
        let (engine, _rx) = engine_with_mock();
        engine.create_stream("s1", None).unwrap();
        assert!(engine.create_stream("s1", None).is_err());
    }

    #[tokio::test]
    async fn test_segments_are_emitted_in_order() {
        let (engine, mut segments) = engine_with_mock();
        engine.start().await.unwrap();
        engine.create_stream("s1", None).unwrap();

        // Three seconds of audio yields multiple overlapping windows.
        for i in 0..3 {
            engine
                .process_audio_chunk(chunk("s1", i, i as f64, 1.0))
                .unwrap();
        }

        let first = timeout(Duration::from_secs(5), segments.recv())
            .await
            .expect("segment within deadline")
            .expect("channel open");
        let second = timeout(Duration::from_secs(5), segments.recv())
            .await
            .expect("segment within deadline")
            .expect("channel open");

        assert_eq!(first.stream_id, "s1");
        assert!(second.start_time > first.start_time);
        assert!(first.text.starts_with("[base"));

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_statistics_track_segments() {
        let (engine, mut segments) = engine_with_mock();
        engine.start().await.unwrap();
        engine.create_stream("s1", None).unwrap();
        engine
            .process_audio_chunk(chunk("s1", 0, 0.0, 1.0))
            .unwrap();

        let segment = timeout(Duration::from_secs(5), segments.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(segment.model_used, ModelTier::Base);

        let stats = engine.global_stats();
        assert!(stats.total_segments >= 1);
        assert!(stats.average_latency_ms >= 0.0);
        assert_eq!(stats.active_streams, 1);
        assert!(stats.is_running);

        engine.stop().await;
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_stream_created_before_start_gets_a_loop() {
        let (engine, mut segments) = engine_with_mock();
        engine.create_stream("early", None).unwrap();
        engine
            .process_audio_chunk(chunk("early", 0, 0.0, 1.0))
            .unwrap();

        engine.start().await.unwrap();

        let segment = timeout(Duration::from_secs(5), segments.recv())
            .await
            .expect("segment within deadline")
            .unwrap();
        assert_eq!(segment.stream_id, "early");

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_remove_stream_stops_emission() {
        let (engine, _segments) = engine_with_mock();
        engine.start().await.unwrap();
        engine.create_stream("s1", None).unwrap();
        engine.remove_stream("s1").unwrap();

        assert!(engine.stream_stats("s1").is_err());
        assert_eq!(engine.global_stats().active_streams, 0);

        engine.stop().await;
    }
}
