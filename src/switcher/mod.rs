//! Automatic audio-source switching.
//!
//! Tracks every registered input (microphone, RTMP, SRT, network audio,
//! file playback), scores link quality from telemetry updates, and keeps
//! exactly one source active. Switching applies hysteresis (a minimum
//! improvement margin), a cooldown after every switch, and staleness
//! failover when the active source stops reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant};
use tracing::{error, info, warn};

/// Kind of audio input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Microphone,
    RtmpStream,
    SrtStream,
    NetworkAudio,
    FilePlayback,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Microphone => "microphone",
            SourceType::RtmpStream => "rtmp_stream",
            SourceType::SrtStream => "srt_stream",
            SourceType::NetworkAudio => "network_audio",
            SourceType::FilePlayback => "file_playback",
        }
    }
}

/// Lifecycle state of a source. Exactly one source is `Active` at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Available,
    Active,
    Unavailable,
    Error,
    Switching,
}

/// How the switcher chooses among available sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwitchingMode {
    /// Combined priority/quality/type-weight ranking
    #[default]
    Automatic,
    /// Never switch without an explicit request
    Manual,
    /// Lowest priority number wins
    PriorityBased,
    /// Highest quality score wins
    QualityBased,
}

/// Information about one registered audio source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSourceInfo {
    pub source_id: String,
    pub source_type: SourceType,
    pub name: String,
    pub state: SourceState,
    /// Lower number = higher priority
    pub priority: u32,
    /// Recomputed on every metrics update, in [0, 1]
    pub quality_score: f64,
    pub last_activity: DateTime<Utc>,
    pub bytes_received: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate_kbps: f64,
    pub latency_ms: f64,
    pub packet_loss_rate: f64,
    pub signal_to_noise_ratio: f64,
}

impl AudioSourceInfo {
    /// A source in the `Available` state with neutral telemetry.
    pub fn new(source_id: impl Into<String>, source_type: SourceType, priority: u32) -> Self {
        let source_id = source_id.into();
        Self {
            name: source_id.clone(),
            source_id,
            source_type,
            state: SourceState::Available,
            priority,
            quality_score: 0.5,
            last_activity: Utc::now(),
            bytes_received: 0,
            sample_rate: 48_000,
            channels: 1,
            bitrate_kbps: 128.0,
            latency_ms: 50.0,
            packet_loss_rate: 0.0,
            signal_to_noise_ratio: 20.0,
        }
    }
}

/// Telemetry update for a source; unset fields keep their previous value.
#[derive(Debug, Clone, Default)]
pub struct SourceMetrics {
    pub bytes_received: Option<u64>,
    pub bitrate_kbps: Option<f64>,
    pub latency_ms: Option<f64>,
    pub packet_loss_rate: Option<f64>,
    pub signal_to_noise_ratio: Option<f64>,
}

/// Switching policy configuration.
///
/// The score weights are tuning parameters, not a calibrated contract;
/// operators adjust them to bias source classes against each other.
#[derive(Debug, Clone)]
pub struct SwitcherConfig {
    pub switching_mode: SwitchingMode,
    pub auto_switch_enabled: bool,
    /// Sources silent for longer than this are marked unavailable
    pub fallback_timeout_seconds: u64,
    /// Minimum quality for a switch target
    pub quality_threshold: f64,
    pub max_latency_ms: f64,
    pub max_packet_loss_rate: f64,
    pub min_signal_to_noise_ratio: f64,
    /// Per-type multiplier applied to the combined score
    pub type_weights: HashMap<SourceType, f64>,
    pub blacklisted_sources: Vec<String>,
    /// Sources never switched away from while they meet the threshold
    pub preferred_sources: Vec<String>,
    /// Require a larger improvement before switching away
    pub sticky_switching: bool,
    /// Improvement required with sticky switching on
    pub sticky_improvement_margin: f64,
    /// Improvement required with sticky switching off
    pub improvement_margin: f64,
    pub switch_cooldown_seconds: u64,
    /// Weight of normalized priority in the combined score
    pub priority_weight: f64,
    /// Weight of quality in the combined score
    pub quality_weight: f64,
    /// Monitoring tick period
    pub monitor_interval: Duration,
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        let mut type_weights = HashMap::new();
        type_weights.insert(SourceType::Microphone, 1.0);
        type_weights.insert(SourceType::SrtStream, 0.9);
        type_weights.insert(SourceType::RtmpStream, 0.8);
        type_weights.insert(SourceType::NetworkAudio, 0.7);
        type_weights.insert(SourceType::FilePlayback, 0.3);

        Self {
            switching_mode: SwitchingMode::Automatic,
            auto_switch_enabled: true,
            fallback_timeout_seconds: 5,
            quality_threshold: 0.7,
            max_latency_ms: 500.0,
            max_packet_loss_rate: 0.05,
            min_signal_to_noise_ratio: 10.0,
            type_weights,
            blacklisted_sources: Vec::new(),
            preferred_sources: Vec::new(),
            sticky_switching: true,
            sticky_improvement_margin: 0.2,
            improvement_margin: 0.1,
            switch_cooldown_seconds: 3,
            priority_weight: 0.3,
            quality_weight: 0.7,
            monitor_interval: Duration::from_secs(1),
        }
    }
}

/// Why a switch happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    Manual,
    Automatic,
    Failover,
}

/// Emitted on every successful switch.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchEvent {
    pub from_source: Option<String>,
    pub to_source: String,
    pub reason: SwitchReason,
    pub quality_score: f64,
    pub timestamp: DateTime<Utc>,
}

/// Switching statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SwitcherStats {
    pub total_switches: u64,
    pub automatic_switches: u64,
    pub manual_switches: u64,
    pub failed_switches: u64,
    pub switch_history: Vec<SwitchEvent>,
    pub uptime_seconds: f64,
    pub active_source_id: Option<String>,
    pub total_sources: usize,
    pub available_sources: usize,
}

const SWITCH_HISTORY_LEN: usize = 100;

struct Registry {
    sources: HashMap<String, AudioSourceInfo>,
    active_source_id: Option<String>,
    last_switch: Option<Instant>,
}

#[derive(Default)]
struct StatsInner {
    total_switches: u64,
    automatic_switches: u64,
    manual_switches: u64,
    failed_switches: u64,
    history: VecDeque<SwitchEvent>,
}

/// Automatic source switching engine.
///
/// The registry is guarded by a single mutex; the monitoring loop and the
/// explicit register/update/switch calls are its only writers, preserving
/// the one-active-source invariant.
pub struct SourceSwitcher {
    config: Mutex<SwitcherConfig>,
    registry: Mutex<Registry>,
    stats: Mutex<StatsInner>,
    event_tx: mpsc::Sender<SwitchEvent>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    start_time: Instant,
}

impl SourceSwitcher {
    /// Create a switcher and the receiving end of its switch-event stream.
    pub fn new(config: SwitcherConfig) -> (Arc<Self>, mpsc::Receiver<SwitchEvent>) {
        let (event_tx, event_rx) = mpsc::channel(100);
        let (shutdown_tx, _) = broadcast::channel(1);

        let switcher = Arc::new(Self {
            config: Mutex::new(config),
            registry: Mutex::new(Registry {
                sources: HashMap::new(),
                active_source_id: None,
                last_switch: None,
            }),
            stats: Mutex::new(StatsInner::default()),
            event_tx,
            monitor_task: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            start_time: Instant::now(),
        });

        (switcher, event_rx)
    }

    /// Start the monitoring loop.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("Source switcher is already running");
            return;
        }

        let switcher = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let tick = self.config.lock().await.monitor_interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(tick);
            while switcher.running.load(Ordering::Relaxed) {
                ticker.tick().await;
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                switcher.tick().await;
            }
            info!("Source monitor stopped");
        });

        *self.monitor_task.lock().await = Some(task);
        info!("Source switcher started");
    }

    /// Stop monitoring and deactivate the current source.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }

        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.monitor_task.lock().await.take() {
            task.abort();
        }

        let mut registry = self.registry.lock().await;
        if let Some(active_id) = registry.active_source_id.take() {
            if let Some(source) = registry.sources.get_mut(&active_id) {
                source.state = SourceState::Available;
            }
        }

        info!("Source switcher stopped");
    }

    /// Register a new audio source. Its quality score is computed from the
    /// initial telemetry before any switching decision sees it.
    pub async fn register_source(&self, mut info: AudioSourceInfo) {
        let config = self.config.lock().await.clone();
        info.quality_score = quality_score(&info, &config);

        {
            let mut registry = self.registry.lock().await;
            info!(
                "Registered source: {} ({})",
                info.name,
                info.source_type.as_str()
            );
            registry.sources.insert(info.source_id.clone(), info);
        }

        if config.auto_switch_enabled {
            self.evaluate_sources().await;
        }
    }

    /// Remove a source; if it was active, fail over to the next-best one.
    pub async fn unregister_source(&self, source_id: &str) -> bool {
        let was_active = {
            let mut registry = self.registry.lock().await;
            let Some(source) = registry.sources.remove(source_id) else {
                return false;
            };
            info!("Unregistered source: {}", source.name);

            if registry.active_source_id.as_deref() == Some(source_id) {
                registry.active_source_id = None;
                true
            } else {
                false
            }
        };

        if was_active {
            self.failover_to_best().await;
        }
        true
    }

    /// Apply a telemetry update and recompute the source's quality score.
    pub async fn update_source_metrics(&self, source_id: &str, metrics: SourceMetrics) -> bool {
        let config = self.config.lock().await.clone();
        let degraded_active = {
            let mut registry = self.registry.lock().await;
            let Some(source) = registry.sources.get_mut(source_id) else {
                return false;
            };

            if let Some(v) = metrics.bytes_received {
                source.bytes_received = v;
            }
            if let Some(v) = metrics.bitrate_kbps {
                source.bitrate_kbps = v;
            }
            if let Some(v) = metrics.latency_ms {
                source.latency_ms = v;
            }
            if let Some(v) = metrics.packet_loss_rate {
                source.packet_loss_rate = v;
            }
            if let Some(v) = metrics.signal_to_noise_ratio {
                source.signal_to_noise_ratio = v;
            }

            source.last_activity = Utc::now();
            // A fresh report revives a source the staleness check benched.
            if source.state == SourceState::Unavailable {
                source.state = SourceState::Available;
            }
            source.quality_score = quality_score(source, &config);
            let quality_score = source.quality_score;

            registry.active_source_id.as_deref() == Some(source_id)
                && quality_score < config.quality_threshold
        };

        if config.auto_switch_enabled && degraded_active {
            self.evaluate_sources().await;
        }
        true
    }

    /// Switch to a specific source, subject to state and cooldown checks.
    ///
    /// Returns false when the switch was refused (unknown source, source
    /// not available, or cooldown active).
    pub async fn switch_to_source(&self, source_id: &str, manual: bool) -> bool {
        self.switch_internal(
            source_id,
            if manual {
                SwitchReason::Manual
            } else {
                SwitchReason::Automatic
            },
        )
        .await
    }

    async fn switch_internal(&self, source_id: &str, reason: SwitchReason) -> bool {
        let config = self.config.lock().await.clone();
        let switchable = {
            let mut registry = self.registry.lock().await;

            let Some(source) = registry.sources.get(source_id) else {
                error!("Source {} not found", source_id);
                return false;
            };
            if registry.active_source_id.as_deref() == Some(source_id) {
                return true; // already active
            }

            if !matches!(source.state, SourceState::Available | SourceState::Active) {
                error!("Source {} is not available for switching", source_id);
                None
            } else if registry
                .last_switch
                .map(|last| last.elapsed() < Duration::from_secs(config.switch_cooldown_seconds))
                .unwrap_or(false)
            {
                warn!("Switch cooldown active, ignoring switch to {}", source_id);
                return false;
            } else {
                let from_source = registry.active_source_id.clone();
                if let Some(ref previous) = from_source {
                    if let Some(previous_source) = registry.sources.get_mut(previous) {
                        previous_source.state = SourceState::Available;
                        info!("Deactivated source: {}", previous_source.name);
                    }
                }

                let source = registry.sources.get_mut(source_id).unwrap();
                source.state = SourceState::Active;
                info!("Activated source: {}", source.name);
                let quality = source.quality_score;

                registry.active_source_id = Some(source_id.to_string());
                registry.last_switch = Some(Instant::now());

                Some(SwitchEvent {
                    from_source,
                    to_source: source_id.to_string(),
                    reason,
                    quality_score: quality,
                    timestamp: Utc::now(),
                })
            }
        };

        let Some(event) = switchable else {
            self.stats.lock().await.failed_switches += 1;
            return false;
        };

        {
            let mut stats = self.stats.lock().await;
            stats.total_switches += 1;
            match reason {
                SwitchReason::Manual => stats.manual_switches += 1,
                SwitchReason::Automatic | SwitchReason::Failover => {
                    stats.automatic_switches += 1
                }
            }
            if stats.history.len() == SWITCH_HISTORY_LEN {
                stats.history.pop_front();
            }
            stats.history.push_back(event.clone());
        }

        let _ = self.event_tx.send(event).await;
        true
    }

    /// One monitoring pass: mark stale sources, fail over a stale active
    /// source, then re-evaluate for a quality-driven switch.
    pub async fn tick(&self) {
        let config = self.config.lock().await.clone();

        let active_went_stale = {
            let mut registry = self.registry.lock().await;
            let now = Utc::now();
            let mut active_stale = false;

            for source in registry.sources.values_mut() {
                let silent_for = (now - source.last_activity).num_seconds();
                if silent_for >= config.fallback_timeout_seconds as i64
                    && matches!(source.state, SourceState::Available | SourceState::Active)
                {
                    warn!(
                        "Source {} appears stale, marking as unavailable",
                        source.name
                    );
                    source.state = SourceState::Unavailable;
                }
            }

            if let Some(active_id) = registry.active_source_id.clone() {
                if registry
                    .sources
                    .get(&active_id)
                    .map(|s| s.state == SourceState::Unavailable)
                    .unwrap_or(true)
                {
                    registry.active_source_id = None;
                    active_stale = true;
                }
            }
            active_stale
        };

        if active_went_stale {
            self.failover_to_best().await;
        }

        if config.auto_switch_enabled {
            self.evaluate_sources().await;
        }
    }

    async fn evaluate_sources(&self) {
        let config = self.config.lock().await.clone();
        if !config.auto_switch_enabled || config.switching_mode == SwitchingMode::Manual {
            return;
        }

        let candidate = {
            let registry = self.registry.lock().await;
            let Some(best_id) = find_best_source(&registry.sources, &config) else {
                return;
            };
            if registry.active_source_id.as_deref() == Some(best_id.as_str()) {
                return;
            }
            if !should_switch(&registry, &best_id, &config) {
                return;
            }
            best_id
        };

        self.switch_internal(&candidate, SwitchReason::Automatic).await;
    }

    /// Switch to the best available source unconditionally (failover path,
    /// no improvement-margin check).
    async fn failover_to_best(&self) {
        let config = self.config.lock().await.clone();
        let best = {
            let registry = self.registry.lock().await;
            find_best_source(&registry.sources, &config)
        };

        match best {
            Some(best_id) => {
                self.switch_internal(&best_id, SwitchReason::Failover).await;
            }
            None => {
                warn!("No suitable source found for failover");
            }
        }
    }

    /// The currently active source, if any.
    pub async fn get_active_source(&self) -> Option<AudioSourceInfo> {
        let registry = self.registry.lock().await;
        registry
            .active_source_id
            .as_ref()
            .and_then(|id| registry.sources.get(id))
            .cloned()
    }

    /// All registered sources.
    pub async fn get_all_sources(&self) -> HashMap<String, AudioSourceInfo> {
        self.registry.lock().await.sources.clone()
    }

    /// Sources currently in the `Available` state.
    pub async fn get_available_sources(&self) -> HashMap<String, AudioSourceInfo> {
        self.registry
            .lock()
            .await
            .sources
            .iter()
            .filter(|(_, s)| s.state == SourceState::Available)
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect()
    }

    /// Switching statistics snapshot.
    pub async fn stats(&self) -> SwitcherStats {
        let stats = self.stats.lock().await;
        let registry = self.registry.lock().await;

        SwitcherStats {
            total_switches: stats.total_switches,
            automatic_switches: stats.automatic_switches,
            manual_switches: stats.manual_switches,
            failed_switches: stats.failed_switches,
            switch_history: stats.history.iter().cloned().collect(),
            uptime_seconds: self.start_time.elapsed().as_secs_f64(),
            active_source_id: registry.active_source_id.clone(),
            total_sources: registry.sources.len(),
            available_sources: registry
                .sources
                .values()
                .filter(|s| s.state == SourceState::Available)
                .count(),
        }
    }

    /// Adjust switching policy at runtime.
    pub async fn update_config(&self, apply: impl FnOnce(&mut SwitcherConfig)) {
        let mut config = self.config.lock().await;
        apply(&mut config);
        info!("Source switcher configuration updated");
    }
}

/// Quality score in [0, 1] with multiplicative penalties, so one severely
/// degraded metric dominates the score instead of averaging away.
fn quality_score(source: &AudioSourceInfo, config: &SwitcherConfig) -> f64 {
    let mut score: f64 = 1.0;

    if source.latency_ms > config.max_latency_ms {
        score *= 0.5;
    } else if source.latency_ms > config.max_latency_ms / 2.0 {
        score *= 0.8;
    }

    if source.packet_loss_rate > config.max_packet_loss_rate {
        score *= 0.3;
    } else if source.packet_loss_rate > config.max_packet_loss_rate / 2.0 {
        score *= 0.7;
    }

    if source.signal_to_noise_ratio >= config.min_signal_to_noise_ratio {
        score *= 1.1;
    } else if source.signal_to_noise_ratio < config.min_signal_to_noise_ratio / 2.0 {
        score *= 0.6;
    }

    let silent_for = (Utc::now() - source.last_activity).num_seconds();
    if silent_for < 1 {
        score *= 1.05;
    } else if silent_for > 5 {
        score *= 0.9;
    }

    score.min(1.0)
}

fn find_best_source(
    sources: &HashMap<String, AudioSourceInfo>,
    config: &SwitcherConfig,
) -> Option<String> {
    let available: Vec<&AudioSourceInfo> = sources
        .values()
        .filter(|s| {
            s.state == SourceState::Available
                && !config.blacklisted_sources.contains(&s.source_id)
        })
        .collect();

    if available.is_empty() {
        return None;
    }

    let best = match config.switching_mode {
        SwitchingMode::PriorityBased => available.iter().min_by_key(|s| s.priority),
        SwitchingMode::QualityBased => available
            .iter()
            .max_by(|a, b| a.quality_score.total_cmp(&b.quality_score)),
        _ => available.iter().max_by(|a, b| {
            combined_score(a, config).total_cmp(&combined_score(b, config))
        }),
    };

    best.map(|s| s.source_id.clone())
}

/// Combined ranking: normalized priority and quality with configured
/// weights, scaled by the per-type weight so operators can bias source
/// classes against each other.
fn combined_score(source: &AudioSourceInfo, config: &SwitcherConfig) -> f64 {
    let priority_score = 1.0 / (source.priority as f64 + 1.0);
    let type_weight = config
        .type_weights
        .get(&source.source_type)
        .copied()
        .unwrap_or(0.5);

    (priority_score * config.priority_weight + source.quality_score * config.quality_weight)
        * type_weight
}

fn should_switch(registry: &Registry, candidate_id: &str, config: &SwitcherConfig) -> bool {
    let Some(active_id) = registry.active_source_id.as_ref() else {
        return true; // nothing active, switch immediately
    };
    let (Some(active), Some(candidate)) = (
        registry.sources.get(active_id),
        registry.sources.get(candidate_id),
    ) else {
        return false;
    };

    // A preferred source keeps the slot while it still meets the bar.
    if config.preferred_sources.contains(active_id)
        && active.quality_score >= config.quality_threshold
    {
        return false;
    }

    if candidate.quality_score < config.quality_threshold {
        return false;
    }

    if config.sticky_switching
        && candidate.quality_score < active.quality_score + config.sticky_improvement_margin
    {
        return false;
    }

    if active.quality_score < config.quality_threshold {
        return true;
    }

    candidate.quality_score > active.quality_score + config.improvement_margin
}
