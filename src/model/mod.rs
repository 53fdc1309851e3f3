//! Model tiers, quality-based tier selection, and the lazy model cache.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::{LatencyMode, TranscriptionConfig};
use crate::inference::{ModelLoader, SpeechModel};

/// Discrete model size classes, smallest to largest.
///
/// Larger tiers trade latency for accuracy; `Tiny` is the baseline every
/// deployment must be able to load.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ModelTier {
    Tiny,
    Base,
    Small,
    Medium,
    LargeV3,
}

impl ModelTier {
    /// Canonical name, matching model file naming conventions.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Tiny => "tiny",
            ModelTier::Base => "base",
            ModelTier::Small => "small",
            ModelTier::Medium => "medium",
            ModelTier::LargeV3 => "large-v3",
        }
    }

    /// Weight file name for this tier.
    pub fn weights_filename(&self) -> &'static str {
        match self {
            ModelTier::Tiny => "ggml-tiny.bin",
            ModelTier::Base => "ggml-base.bin",
            ModelTier::Small => "ggml-small.bin",
            ModelTier::Medium => "ggml-medium.bin",
            ModelTier::LargeV3 => "ggml-large-v3.bin",
        }
    }

    /// Approximate resident memory in MB once loaded.
    pub fn estimated_memory_mb(&self) -> u64 {
        match self {
            ModelTier::Tiny => 39,
            ModelTier::Base => 74,
            ModelTier::Small => 244,
            ModelTier::Medium => 769,
            ModelTier::LargeV3 => 1550,
        }
    }

    pub const ALL: [ModelTier; 5] = [
        ModelTier::Tiny,
        ModelTier::Base,
        ModelTier::Small,
        ModelTier::Medium,
        ModelTier::LargeV3,
    ];
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick a model tier for the measured quality and configured latency mode.
///
/// Pure table lookup; repeated calls with the same inputs always return
/// the same tier. When adaptive selection is disabled the configured tier
/// is used unconditionally.
pub fn select_tier(config: &TranscriptionConfig, quality: f64) -> ModelTier {
    if !config.adaptive_model_selection {
        return config.model_tier;
    }

    match config.latency_mode {
        LatencyMode::LowLatency => {
            if quality >= config.quality_threshold_medium {
                ModelTier::Base
            } else {
                ModelTier::Tiny
            }
        }
        LatencyMode::HighAccuracy => {
            if quality >= config.quality_threshold_high {
                ModelTier::LargeV3
            } else if quality >= config.quality_threshold_medium {
                ModelTier::Medium
            } else {
                ModelTier::Base
            }
        }
        LatencyMode::Balanced => {
            if quality >= config.quality_threshold_high {
                ModelTier::Medium
            } else if quality >= config.quality_threshold_medium {
                ModelTier::Base
            } else {
                ModelTier::Small
            }
        }
    }
}

/// Lazily loads and caches one model instance per tier.
///
/// The lock is held only around map access; loads run unlocked so a slow
/// large-tier load does not stall streams using other tiers. If a
/// requested tier fails to load the cache falls back to `Tiny`; if `Tiny`
/// itself fails there is nothing smaller to fall back to and the error is
/// fatal.
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    models: Mutex<HashMap<ModelTier, Arc<dyn SpeechModel>>>,
    config: TranscriptionConfig,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>, config: TranscriptionConfig) -> Self {
        Self {
            loader,
            models: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Load the configured baseline tier, surfacing model availability
    /// problems at startup instead of on the first chunk.
    pub fn preload_baseline(&self) -> crate::Result<()> {
        let (_, tier) = self.get(self.config.model_tier)?;
        info!("Baseline model ready: {}", tier);
        Ok(())
    }

    /// Get the model for `tier`, loading it on first use.
    ///
    /// Returns the model together with the tier actually served, which
    /// differs from the request after a fallback.
    pub fn get(&self, tier: ModelTier) -> crate::Result<(Arc<dyn SpeechModel>, ModelTier)> {
        if let Some(model) = self.lookup(tier) {
            return Ok((model, tier));
        }

        match self.load_and_insert(tier) {
            Ok(model) => Ok((model, tier)),
            Err(e) if tier != ModelTier::Tiny => {
                warn!("Failed to load model tier {}: {}; falling back to tiny", tier, e);
                if let Some(model) = self.lookup(ModelTier::Tiny) {
                    return Ok((model, ModelTier::Tiny));
                }
                let model = self.load_and_insert(ModelTier::Tiny).map_err(|e| {
                    crate::Error::ModelUnavailable(format!(
                        "tiny tier failed to load after fallback: {}",
                        e
                    ))
                })?;
                Ok((model, ModelTier::Tiny))
            }
            Err(e) => Err(crate::Error::ModelUnavailable(format!(
                "tiny tier failed to load: {}",
                e
            ))),
        }
    }

    /// Select a tier for `quality` and return its (possibly fallen-back) model.
    pub fn model_for_quality(
        &self,
        quality: f64,
    ) -> crate::Result<(Arc<dyn SpeechModel>, ModelTier)> {
        self.get(select_tier(&self.config, quality))
    }

    /// Tiers currently resident in the cache.
    pub fn loaded_tiers(&self) -> Vec<ModelTier> {
        let models = self.models.lock().unwrap();
        let mut tiers: Vec<ModelTier> = models.keys().copied().collect();
        tiers.sort();
        tiers
    }

    fn lookup(&self, tier: ModelTier) -> Option<Arc<dyn SpeechModel>> {
        self.models.lock().unwrap().get(&tier).cloned()
    }

    fn load_and_insert(&self, tier: ModelTier) -> crate::Result<Arc<dyn SpeechModel>> {
        let model = self.loader.load(tier)?;

        let mut models = self.models.lock().unwrap();
        // Another task may have loaded the same tier while we were
        // unlocked; keep the first instance.
        let entry = models.entry(tier).or_insert_with(|| {
            info!(
                "Loaded model tier {} (~{} MB)",
                tier,
                tier.estimated_memory_mb()
            );
            model
        });
        Ok(Arc::clone(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::MockLoader;

    fn config(mode: LatencyMode) -> TranscriptionConfig {
        TranscriptionConfig {
            latency_mode: mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_selection_is_deterministic() {
        let high_accuracy = config(LatencyMode::HighAccuracy);
        let low_latency = config(LatencyMode::LowLatency);

        for _ in 0..10 {
            assert_eq!(select_tier(&high_accuracy, 0.9), ModelTier::LargeV3);
            assert_eq!(select_tier(&low_latency, 0.1), ModelTier::Tiny);
        }
    }

    #[test]
    fn test_selection_tables() {
        let balanced = config(LatencyMode::Balanced);
        assert_eq!(select_tier(&balanced, 0.9), ModelTier::Medium);
        assert_eq!(select_tier(&balanced, 0.6), ModelTier::Base);
        assert_eq!(select_tier(&balanced, 0.2), ModelTier::Small);

        let high_accuracy = config(LatencyMode::HighAccuracy);
        assert_eq!(select_tier(&high_accuracy, 0.6), ModelTier::Medium);
        assert_eq!(select_tier(&high_accuracy, 0.2), ModelTier::Base);

        let low_latency = config(LatencyMode::LowLatency);
        assert_eq!(select_tier(&low_latency, 0.6), ModelTier::Base);
    }

    #[test]
    fn test_non_adaptive_selection_pins_configured_tier() {
        let mut config = config(LatencyMode::HighAccuracy);
        config.adaptive_model_selection = false;
        config.model_tier = ModelTier::Small;
        assert_eq!(select_tier(&config, 0.95), ModelTier::Small);
        assert_eq!(select_tier(&config, 0.05), ModelTier::Small);
    }

    #[test]
    fn test_cache_loads_once_per_tier() {
        let cache = ModelCache::new(
            Arc::new(MockLoader::default()),
            TranscriptionConfig::default(),
        );

        let (first, tier) = cache.get(ModelTier::Base).unwrap();
        let (second, _) = cache.get(ModelTier::Base).unwrap();
        assert_eq!(tier, ModelTier::Base);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.loaded_tiers(), vec![ModelTier::Base]);
    }

    #[test]
    fn test_failed_tier_falls_back_to_tiny() {
        let cache = ModelCache::new(
            Arc::new(MockLoader {
                fail_tiers: vec![ModelTier::LargeV3],
            }),
            TranscriptionConfig::default(),
        );

        let (model, tier) = cache.get(ModelTier::LargeV3).unwrap();
        assert_eq!(tier, ModelTier::Tiny);
        assert_eq!(model.tier(), ModelTier::Tiny);
    }

    #[test]
    fn test_tiny_failure_is_fatal() {
        let cache = ModelCache::new(
            Arc::new(MockLoader {
                fail_tiers: vec![ModelTier::Tiny, ModelTier::Base],
            }),
            TranscriptionConfig::default(),
        );

        let err = cache.get(ModelTier::Base).err().unwrap();
        assert!(matches!(err, crate::Error::ModelUnavailable(_)));

        let err = cache.get(ModelTier::Tiny).err().unwrap();
        assert!(matches!(err, crate::Error::ModelUnavailable(_)));
    }

    #[test]
    fn test_tier_ordering_and_names() {
        assert!(ModelTier::Tiny < ModelTier::LargeV3);
        assert_eq!(ModelTier::LargeV3.as_str(), "large-v3");
        assert_eq!(ModelTier::ALL.len(), 5);
    }
}
