//! Queue health monitoring without consuming items.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Depth above which the queue is considered backed up regardless of rates.
const BACKPRESSURE_DEPTH: usize = 1000;

/// Ingress/egress ratio above which the queue is considered backed up.
const BACKPRESSURE_PRESSURE: f64 = 0.9;

/// Queue health metrics
#[derive(Debug, Clone)]
pub struct QueueHealth {
    /// Queue depth (items waiting)
    pub queue_depth: usize,
    /// Items enqueued per second
    pub ingress_rate: f64,
    /// Items dequeued per second
    pub egress_rate: f64,
    /// Queue is experiencing backpressure
    pub has_backpressure: bool,
    /// Number of busy workers
    pub active_workers: usize,
    /// Last update time
    pub last_updated: Instant,
}

impl Default for QueueHealth {
    fn default() -> Self {
        Self {
            queue_depth: 0,
            ingress_rate: 0.0,
            egress_rate: 0.0,
            has_backpressure: false,
            active_workers: 0,
            last_updated: Instant::now(),
        }
    }
}

impl QueueHealth {
    /// Queue pressure (0.0 = empty, 1.0+ = filling faster than draining)
    pub fn pressure(&self) -> f64 {
        if self.egress_rate == 0.0 {
            if self.ingress_rate > 0.0 {
                return 1.0; // filling with no processing
            }
            return 0.0;
        }
        self.ingress_rate / self.egress_rate
    }
}

/// Tracks enqueue/dequeue rates over a sliding window and flags
/// backpressure on edge transitions.
pub struct QueueMonitor {
    health: Arc<RwLock<QueueHealth>>,
    window_size: Duration,
    ingress_count: Arc<RwLock<(u64, Instant)>>,
    egress_count: Arc<RwLock<(u64, Instant)>>,
}

impl QueueMonitor {
    pub fn new(window_size: Duration) -> Self {
        let now = Instant::now();
        Self {
            health: Arc::new(RwLock::new(QueueHealth::default())),
            window_size,
            ingress_count: Arc::new(RwLock::new((0, now))),
            egress_count: Arc::new(RwLock::new((0, now))),
        }
    }

    /// Record an item entering the queue
    pub async fn record_ingress(&self) {
        {
            let mut count = self.ingress_count.write().await;
            count.0 += 1;
        }
        self.update_rates().await;
    }

    /// Record an item leaving the queue
    pub async fn record_egress(&self) {
        {
            let mut count = self.egress_count.write().await;
            count.0 += 1;
        }
        self.update_rates().await;
    }

    /// Update the busy-worker count
    pub async fn update_workers(&self, active: usize) {
        let mut health = self.health.write().await;
        health.active_workers = active;
        health.last_updated = Instant::now();
    }

    /// Update the queue depth and re-evaluate backpressure
    pub async fn update_depth(&self, depth: usize) {
        let mut health = self.health.write().await;
        health.queue_depth = depth;

        let old_backpressure = health.has_backpressure;
        health.has_backpressure =
            depth > BACKPRESSURE_DEPTH || health.pressure() > BACKPRESSURE_PRESSURE;

        if health.has_backpressure && !old_backpressure {
            warn!(
                "Queue experiencing backpressure (depth: {}, pressure: {:.2})",
                depth,
                health.pressure()
            );
        } else if !health.has_backpressure && old_backpressure {
            info!("Queue backpressure resolved");
        }

        health.last_updated = Instant::now();
    }

    async fn update_rates(&self) {
        let now = Instant::now();

        let ingress = {
            let count = self.ingress_count.read().await;
            let elapsed = now.duration_since(count.1).as_secs_f64();
            if elapsed > 0.0 {
                count.0 as f64 / elapsed
            } else {
                0.0
            }
        };

        let egress = {
            let count = self.egress_count.read().await;
            let elapsed = now.duration_since(count.1).as_secs_f64();
            if elapsed > 0.0 {
                count.0 as f64 / elapsed
            } else {
                0.0
            }
        };

        {
            let mut health = self.health.write().await;
            health.ingress_rate = ingress;
            health.egress_rate = egress;
            health.last_updated = now;
        }

        // Reset counters once the window is exceeded.
        if now.duration_since(self.ingress_count.read().await.1) > self.window_size {
            *self.ingress_count.write().await = (0, now);
        }
        if now.duration_since(self.egress_count.read().await.1) > self.window_size {
            *self.egress_count.write().await = (0, now);
        }
    }

    /// Current health snapshot
    pub async fn health(&self) -> QueueHealth {
        self.health.read().await.clone()
    }

    /// One-line health summary for periodic logging
    pub async fn summary(&self) -> String {
        let health = self.health.read().await;
        format!(
            "depth={}, in={:.1}/s, out={:.1}/s, pressure={:.2}, workers={}",
            health.queue_depth,
            health.ingress_rate,
            health.egress_rate,
            health.pressure(),
            health.active_workers,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_depth_over_limit_sets_backpressure() {
        let monitor = QueueMonitor::new(Duration::from_secs(60));
        monitor.update_depth(BACKPRESSURE_DEPTH + 1).await;
        assert!(monitor.health().await.has_backpressure);

        monitor.update_depth(0).await;
        assert!(!monitor.health().await.has_backpressure);
    }

    #[tokio::test]
    async fn test_pressure_with_no_processing() {
        let monitor = QueueMonitor::new(Duration::from_secs(60));
        monitor.record_ingress().await;
        let health = monitor.health().await;
        assert_eq!(health.pressure(), 1.0);
    }

    #[tokio::test]
    async fn test_worker_count_updates() {
        let monitor = QueueMonitor::new(Duration::from_secs(60));
        monitor.update_workers(3).await;
        assert_eq!(monitor.health().await.active_workers, 3);
    }
}
