//! Worker pool draining the priority store.
//!
//! Each worker pops the highest-priority pending chunk, runs inference
//! through the shared model cache, and writes the terminal result back to
//! the store. Transient failures retry with exponential backoff one
//! priority tier lower; configuration failures dead-letter immediately. A
//! monitor task prunes terminal stores and feeds the backpressure monitor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::LinearResampler;
use crate::inference::DecodeOptions;
use crate::model::{ModelCache, ModelTier};
use crate::queue::monitor::QueueMonitor;
use crate::queue::{ChunkLookup, ChunkStatus, PriorityStore, QueuePriority, QueuedAudioChunk};
use crate::TARGET_SAMPLE_RATE;

/// Queue manager configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of worker tasks
    pub max_workers: usize,
    /// Default retry budget for enqueued chunks
    pub default_max_retries: u32,
    /// Terminal items kept per store before pruning
    pub retention: usize,
    /// Monitor task tick
    pub monitor_interval: Duration,
    /// Fallback poll interval when the wakeup notification is missed
    pub idle_poll_interval: Duration,
    /// Window for ingress/egress rate calculation
    pub rate_window: Duration,
    /// Rolling performance samples kept for estimates
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            default_max_retries: 3,
            retention: 1000,
            monitor_interval: Duration::from_secs(30),
            idle_poll_interval: Duration::from_secs(1),
            rate_window: Duration::from_secs(60),
            history_limit: 1000,
        }
    }
}

/// Aggregate queue statistics for dashboards.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatsSnapshot {
    pub total_queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending_by_priority: std::collections::BTreeMap<String, usize>,
    pub average_processing_time_s: f64,
    pub average_queue_wait_time_s: f64,
    pub busy_workers: usize,
    pub max_workers: usize,
    pub system_load: f64,
    pub estimated_wait_time_s: f64,
    pub has_backpressure: bool,
}

struct WorkerContext {
    store: PriorityStore,
    models: Arc<ModelCache>,
    config: QueueConfig,
    monitor: QueueMonitor,
    notify: Notify,
    processing_times: Mutex<VecDeque<f64>>,
    wait_times: Mutex<VecDeque<f64>>,
    busy_workers: AtomicUsize,
    running: AtomicBool,
}

/// Priority transcription queue with a pull-based worker pool.
pub struct TranscriptionQueue {
    ctx: Arc<WorkerContext>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TranscriptionQueue {
    pub fn new(store: PriorityStore, models: Arc<ModelCache>, config: QueueConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let monitor = QueueMonitor::new(config.rate_window);

        Self {
            ctx: Arc::new(WorkerContext {
                store,
                models,
                monitor,
                config,
                notify: Notify::new(),
                processing_times: Mutex::new(VecDeque::new()),
                wait_times: Mutex::new(VecDeque::new()),
                busy_workers: AtomicUsize::new(0),
                running: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Spawn the worker pool and the pruning monitor.
    pub fn start(&self) {
        if self.ctx.running.swap(true, Ordering::Relaxed) {
            warn!("Transcription queue is already running");
            return;
        }

        let mut tasks = self.tasks.lock().unwrap();
        for i in 0..self.ctx.config.max_workers {
            let worker_id = format!("worker_{}", i);
            let ctx = Arc::clone(&self.ctx);
            let shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(worker_loop(worker_id, ctx, shutdown_rx)));
        }

        let ctx = Arc::clone(&self.ctx);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(monitor_loop(ctx, shutdown_rx)));

        info!(
            "Transcription queue started with {} workers",
            self.ctx.config.max_workers
        );
    }

    /// Stop workers. Items mid-inference are abandoned best-effort; they
    /// remain in the processing set and are not re-queued automatically.
    pub async fn stop(&self) {
        if !self.ctx.running.swap(false, Ordering::Relaxed) {
            return;
        }

        let _ = self.shutdown_tx.send(());
        self.ctx.notify.notify_waiters();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap();
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        info!("Transcription queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.ctx.running.load(Ordering::Relaxed)
    }

    /// Queue an audio chunk for transcription; returns its tracking id.
    pub async fn enqueue(
        &self,
        session_id: &str,
        samples: Vec<f32>,
        sample_rate: u32,
        tier: ModelTier,
        options: DecodeOptions,
        priority: QueuePriority,
    ) -> crate::Result<Uuid> {
        if sample_rate == 0 {
            return Err(crate::Error::Config("sample_rate must be nonzero".to_string()));
        }

        let chunk = QueuedAudioChunk::new(
            session_id,
            samples,
            sample_rate,
            tier,
            options,
            priority,
            self.ctx.config.default_max_retries,
        );
        let id = chunk.id;

        self.ctx.store.push(&chunk)?;
        self.ctx.monitor.record_ingress().await;
        self.ctx.notify.notify_one();

        info!(
            "Audio chunk queued - id: {}, session: {}, priority: {}",
            id, session_id, priority
        );
        Ok(id)
    }

    /// Cancel a pending chunk. Chunks already picked up by a worker cannot
    /// be cancelled.
    pub fn cancel(&self, id: &Uuid) -> crate::Result<bool> {
        Ok(self.ctx.store.cancel(id)?)
    }

    /// Look up a chunk across pending/processing/terminal stores.
    pub fn lookup(&self, id: &Uuid) -> crate::Result<Option<ChunkLookup>> {
        Ok(self.ctx.store.lookup(id)?)
    }

    /// Aggregate statistics snapshot.
    pub async fn stats(&self) -> crate::Result<QueueStatsSnapshot> {
        let pending = self.ctx.store.pending_len();
        let processing = self.ctx.store.processing_len();
        let busy = self.ctx.busy_workers.load(Ordering::Relaxed);
        let max_workers = self.ctx.config.max_workers;

        let average_processing = mean(&self.ctx.processing_times.lock().unwrap());
        let average_wait = mean(&self.ctx.wait_times.lock().unwrap());

        let recent_processing = {
            let times = self.ctx.processing_times.lock().unwrap();
            let recent: Vec<f64> = times.iter().rev().take(50).copied().collect();
            if recent.is_empty() {
                10.0
            } else {
                recent.iter().sum::<f64>() / recent.len() as f64
            }
        };
        let estimated_wait = pending as f64 * recent_processing / busy.max(1) as f64;

        Ok(QueueStatsSnapshot {
            total_queued: pending,
            processing,
            completed: self.ctx.store.completed_len(),
            failed: self.ctx.store.failed_len(),
            pending_by_priority: self.ctx.store.pending_by_priority()?,
            average_processing_time_s: average_processing,
            average_queue_wait_time_s: average_wait,
            busy_workers: busy,
            max_workers,
            system_load: if max_workers > 0 {
                (processing as f64 / max_workers as f64).min(1.0)
            } else {
                0.0
            },
            estimated_wait_time_s: estimated_wait,
            has_backpressure: self.ctx.monitor.health().await.has_backpressure,
        })
    }

    /// Wait until `id` reaches a terminal state, up to `deadline`.
    ///
    /// Convenience for callers (and tests) that need synchronous-style
    /// completion; returns the terminal lookup or None on timeout.
    pub async fn wait_terminal(
        &self,
        id: &Uuid,
        deadline: Duration,
    ) -> crate::Result<Option<ChunkLookup>> {
        let poll = async {
            loop {
                if let Some(lookup) = self.ctx.store.lookup(id).map_err(crate::Error::Queue)? {
                    match lookup.status {
                        ChunkStatus::Completed | ChunkStatus::Failed | ChunkStatus::Cancelled => {
                            return Ok::<_, crate::Error>(Some(lookup));
                        }
                        _ => {}
                    }
                }
                sleep(Duration::from_millis(50)).await;
            }
        };

        match timeout(deadline, poll).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }
}

async fn worker_loop(
    worker_id: String,
    ctx: Arc<WorkerContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Worker {} started", worker_id);

    while ctx.running.load(Ordering::Relaxed) {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match ctx.store.pop() {
            Ok(Some(chunk)) => {
                ctx.busy_workers.fetch_add(1, Ordering::Relaxed);
                ctx.monitor.record_egress().await;
                ctx.monitor
                    .update_workers(ctx.busy_workers.load(Ordering::Relaxed))
                    .await;

                process_chunk(&worker_id, &ctx, chunk).await;

                ctx.busy_workers.fetch_sub(1, Ordering::Relaxed);
                ctx.monitor
                    .update_workers(ctx.busy_workers.load(Ordering::Relaxed))
                    .await;
            }
            Ok(None) => {
                // Idle: wait for an enqueue wakeup, with a timed fallback in
                // case the notification raced past us.
                tokio::select! {
                    _ = ctx.notify.notified() => {}
                    _ = sleep(ctx.config.idle_poll_interval) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
            Err(e) => {
                error!("Worker {} queue error: {}", worker_id, e);
                sleep(Duration::from_secs(5)).await;
            }
        }
    }

    info!("Worker {} stopped", worker_id);
}

async fn process_chunk(worker_id: &str, ctx: &Arc<WorkerContext>, mut chunk: QueuedAudioChunk) {
    let started_at = chrono::Utc::now();
    chunk.status = ChunkStatus::Processing;
    chunk.started_at = Some(started_at);

    if let Err(e) = ctx.store.mark_processing(&chunk) {
        error!("Worker {}: failed to record processing state: {}", worker_id, e);
    }

    let wait_s = (started_at - chunk.created_at).num_milliseconds().max(0) as f64 / 1000.0;
    push_history(&ctx.wait_times, wait_s, ctx.config.history_limit);

    let started = Instant::now();
    let outcome = transcribe_chunk(ctx, &chunk).await;
    let elapsed_s = started.elapsed().as_secs_f64();
    push_history(&ctx.processing_times, elapsed_s, ctx.config.history_limit);

    match outcome {
        Ok(raw) => {
            chunk.status = ChunkStatus::Completed;
            chunk.completed_at = Some(chrono::Utc::now());
            chunk.result = Some(raw);
            chunk.error_message = None;

            if let Err(e) = ctx.store.store_terminal(&chunk) {
                error!("Worker {}: failed to store result: {}", worker_id, e);
            }
            info!(
                "Worker {} completed chunk {} in {:.2}s",
                worker_id, chunk.id, elapsed_s
            );
        }
        Err(e) if !e.is_transient() => {
            // Configuration and other permanent errors skip the retry path.
            chunk.status = ChunkStatus::Failed;
            chunk.completed_at = Some(chrono::Utc::now());
            chunk.error_message = Some(e.to_string());

            if let Err(e) = ctx.store.store_terminal(&chunk) {
                error!("Worker {}: failed to dead-letter chunk: {}", worker_id, e);
            }
            error!(
                "Worker {} failed chunk {} permanently: {}",
                worker_id, chunk.id, e
            );
        }
        Err(e) => {
            chunk.retry_count += 1;
            chunk.error_message = Some(e.to_string());

            if chunk.retry_count < chunk.max_retries {
                let delay = Duration::from_secs(1u64 << chunk.retry_count.min(6));
                sleep(delay).await;

                chunk.priority = chunk.priority.demoted();
                chunk.status = ChunkStatus::Pending;
                chunk.started_at = None;

                match ctx.store.push(&chunk) {
                    Ok(()) => {
                        ctx.monitor.record_ingress().await;
                        ctx.notify.notify_one();
                        warn!(
                            "Worker {} retrying chunk {} (attempt {}/{}, priority {})",
                            worker_id, chunk.id, chunk.retry_count, chunk.max_retries, chunk.priority
                        );
                    }
                    Err(e) => {
                        error!("Worker {}: failed to re-queue chunk: {}", worker_id, e);
                    }
                }
            } else {
                chunk.status = ChunkStatus::Failed;
                chunk.completed_at = Some(chrono::Utc::now());

                if let Err(e) = ctx.store.store_terminal(&chunk) {
                    error!("Worker {}: failed to dead-letter chunk: {}", worker_id, e);
                }
                error!(
                    "Worker {} failed chunk {} after {} retries: {}",
                    worker_id, chunk.id, chunk.max_retries, e
                );
            }
        }
    }

    if let Err(e) = ctx.store.clear_processing(&chunk.id) {
        error!("Worker {}: failed to clear processing state: {}", worker_id, e);
    }
}

async fn transcribe_chunk(
    ctx: &Arc<WorkerContext>,
    chunk: &QueuedAudioChunk,
) -> crate::Result<crate::protocol::RawTranscription> {
    let resampler = LinearResampler::new(chunk.sample_rate, TARGET_SAMPLE_RATE)?;
    let samples = resampler.resample(&chunk.samples);

    let (model, tier) = ctx.models.get(chunk.tier)?;
    if tier != chunk.tier {
        debug!("Chunk {} served by fallback tier {}", chunk.id, tier);
    }
    model.transcribe(&samples, &chunk.options).await
}

async fn monitor_loop(ctx: Arc<WorkerContext>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = interval(ctx.config.monitor_interval);

    while ctx.running.load(Ordering::Relaxed) {
        ticker.tick().await;

        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        if let Err(e) = ctx.store.prune_terminal(ctx.config.retention) {
            error!("Queue monitor prune error: {}", e);
        }

        let pending = ctx.store.pending_len();
        let processing = ctx.store.processing_len();
        ctx.monitor.update_depth(pending).await;

        if pending > 0 || processing > 0 {
            info!(
                "Queue status - pending: {}, processing: {}, {}",
                pending,
                processing,
                ctx.monitor.summary().await
            );
        }
    }

    info!("Queue monitor stopped");
}

fn push_history(history: &Mutex<VecDeque<f64>>, value: f64, limit: usize) {
    let mut guard = history.lock().unwrap();
    if guard.len() == limit {
        guard.pop_front();
    }
    guard.push_back(value);
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TranscriptionConfig;
    use crate::inference::{MockLoader, ModelLoader, SpeechModel};
    use crate::protocol::RawTranscription;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` transcriptions transiently, then succeeds.
    struct FlakyModel {
        tier: ModelTier,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl SpeechModel for FlakyModel {
        fn tier(&self) -> ModelTier {
            self.tier
        }

        async fn transcribe(
            &self,
            _samples: &[f32],
            _options: &DecodeOptions,
        ) -> crate::Result<RawTranscription> {
            let remaining = self.failures_left.load(Ordering::Relaxed);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::Relaxed);
                return Err(crate::Error::Inference {
                    message: "simulated decoder timeout".to_string(),
                    transient: true,
                });
            }
            Ok(RawTranscription {
                text: "recovered".to_string(),
                language: "en".to_string(),
                confidence: 0.9,
                segments: vec![],
            })
        }
    }

    struct FlakyLoader {
        failures: u32,
    }

    impl ModelLoader for FlakyLoader {
        fn load(&self, tier: ModelTier) -> crate::Result<Arc<dyn SpeechModel>> {
            Ok(Arc::new(FlakyModel {
                tier,
                failures_left: AtomicU32::new(self.failures),
            }))
        }
    }

    /// Rejects every request with a non-retryable configuration error.
    struct RejectingModel {
        tier: ModelTier,
    }

    #[async_trait]
    impl SpeechModel for RejectingModel {
        fn tier(&self) -> ModelTier {
            self.tier
        }

        async fn transcribe(
            &self,
            _samples: &[f32],
            _options: &DecodeOptions,
        ) -> crate::Result<RawTranscription> {
            Err(crate::Error::Config(
                "unsupported language/model combination".to_string(),
            ))
        }
    }

    struct RejectingLoader;

    impl ModelLoader for RejectingLoader {
        fn load(&self, tier: ModelTier) -> crate::Result<Arc<dyn SpeechModel>> {
            Ok(Arc::new(RejectingModel { tier }))
        }
    }

    fn queue_with(loader: Arc<dyn ModelLoader>, workers: usize) -> TranscriptionQueue {
        let store = PriorityStore::new_temp().unwrap();
        let models = Arc::new(ModelCache::new(loader, TranscriptionConfig::default()));
        let config = QueueConfig {
            max_workers: workers,
            idle_poll_interval: Duration::from_millis(50),
            monitor_interval: Duration::from_millis(200),
            ..Default::default()
        };
        TranscriptionQueue::new(store, models, config)
    }

    async fn enqueue_default(queue: &TranscriptionQueue, priority: QueuePriority) -> Uuid {
        queue
            .enqueue(
                "session-1",
                vec![0.1; 1600],
                16_000,
                ModelTier::Base,
                DecodeOptions::default(),
                priority,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_chunk_completes_end_to_end() {
        let queue = queue_with(Arc::new(MockLoader::default()), 1);
        queue.start();

        let id = enqueue_default(&queue, QueuePriority::Normal).await;
        let lookup = queue
            .wait_terminal(&id, Duration::from_secs(5))
            .await
            .unwrap()
            .expect("terminal within deadline");

        assert_eq!(lookup.status, ChunkStatus::Completed);
        assert_eq!(lookup.chunk.retry_count, 0);
        assert!(lookup.chunk.result.is_some());
        assert!(lookup.chunk.completed_at.is_some());

        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_failure_retries_then_completes() {
        let queue = queue_with(Arc::new(FlakyLoader { failures: 1 }), 1);
        queue.start();

        let id = enqueue_default(&queue, QueuePriority::High).await;
        let lookup = queue
            .wait_terminal(&id, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("terminal within deadline");

        assert_eq!(lookup.status, ChunkStatus::Completed);
        assert_eq!(lookup.chunk.retry_count, 1);
        // Demoted one tier on the retry.
        assert_eq!(lookup.chunk.priority, QueuePriority::Normal);

        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_dead_letters() {
        let queue = queue_with(Arc::new(FlakyLoader { failures: u32::MAX }), 1);
        queue.start();

        let id = enqueue_default(&queue, QueuePriority::Urgent).await;
        let lookup = queue
            .wait_terminal(&id, Duration::from_secs(120))
            .await
            .unwrap()
            .expect("terminal within deadline");

        assert_eq!(lookup.status, ChunkStatus::Failed);
        assert_eq!(lookup.chunk.retry_count, lookup.chunk.max_retries);
        assert!(lookup.chunk.error_message.is_some());

        // Dead-lettered items are never retried again.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let lookup = queue.lookup(&id).unwrap().unwrap();
        assert_eq!(lookup.status, ChunkStatus::Failed);

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_config_error_fails_without_retry() {
        let queue = queue_with(Arc::new(RejectingLoader), 1);
        queue.start();

        let id = enqueue_default(&queue, QueuePriority::Normal).await;
        let lookup = queue
            .wait_terminal(&id, Duration::from_secs(5))
            .await
            .unwrap()
            .expect("terminal within deadline");

        assert_eq!(lookup.status, ChunkStatus::Failed);
        assert_eq!(lookup.chunk.retry_count, 0);

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_before_pickup() {
        // Queue not started: nothing will pick the item up.
        let queue = queue_with(Arc::new(MockLoader::default()), 1);

        let id = enqueue_default(&queue, QueuePriority::Low).await;
        assert!(queue.cancel(&id).unwrap());

        let lookup = queue.lookup(&id).unwrap().unwrap();
        assert_eq!(lookup.status, ChunkStatus::Cancelled);

        // Second cancel is a no-op.
        assert!(!queue.cancel(&id).unwrap());
    }

    #[tokio::test]
    async fn test_stats_reflect_queue_contents() {
        let queue = queue_with(Arc::new(MockLoader::default()), 2);

        enqueue_default(&queue, QueuePriority::Urgent).await;
        enqueue_default(&queue, QueuePriority::Low).await;

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total_queued, 2);
        assert_eq!(stats.pending_by_priority.get("urgent"), Some(&1));
        assert_eq!(stats.max_workers, 2);
        assert!(stats.estimated_wait_time_s > 0.0);

        queue.start();
        let mut drained = false;
        for _ in 0..100 {
            if queue.stats().await.unwrap().completed == 2 {
                drained = true;
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        assert!(drained, "both chunks should complete");

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_zero_sample_rate_rejected() {
        let queue = queue_with(Arc::new(MockLoader::default()), 1);
        let result = queue
            .enqueue(
                "s",
                vec![0.0; 10],
                0,
                ModelTier::Base,
                DecodeOptions::default(),
                QueuePriority::Normal,
            )
            .await;
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }
}
