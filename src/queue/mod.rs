//! Durable priority queue for ad-hoc transcription requests.
//!
//! Storage is a sled database with four trees: `pending` (ordered so the
//! first key is the next item to dequeue), `processing`, `completed`, and
//! `failed` (the dead-letter store, which also holds cancelled items).
//! Items are MessagePack-encoded; pending keys put the priority in the
//! high byte and a monotonic sequence in the low bits, so within a
//! priority tier dequeue order is FIFO and a higher tier always wins.

use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::inference::DecodeOptions;
use crate::model::ModelTier;
use crate::protocol::RawTranscription;

pub mod monitor;
pub mod worker;

pub use monitor::{QueueHealth, QueueMonitor};
pub use worker::{QueueConfig, QueueStatsSnapshot, TranscriptionQueue};

/// Priority tiers for queued work. Higher tiers dequeue first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl QueuePriority {
    fn rank(self) -> u8 {
        match self {
            QueuePriority::Low => 1,
            QueuePriority::Normal => 2,
            QueuePriority::High => 3,
            QueuePriority::Urgent => 4,
        }
    }

    /// One tier lower, saturating at `Low`. Retried items are demoted so a
    /// poison item cannot starve fresh work at its original tier.
    pub fn demoted(self) -> Self {
        match self {
            QueuePriority::Urgent => QueuePriority::High,
            QueuePriority::High => QueuePriority::Normal,
            QueuePriority::Normal | QueuePriority::Low => QueuePriority::Low,
        }
    }

    pub const ALL: [QueuePriority; 4] = [
        QueuePriority::Low,
        QueuePriority::Normal,
        QueuePriority::High,
        QueuePriority::Urgent,
    ];
}

impl std::fmt::Display for QueuePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueuePriority::Low => "low",
            QueuePriority::Normal => "normal",
            QueuePriority::High => "high",
            QueuePriority::Urgent => "urgent",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a queued item. `Completed`, `Failed`, and
/// `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// One audio chunk queued for transcription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedAudioChunk {
    pub id: Uuid,
    /// Free-form correlation key supplied by the caller
    pub session_id: String,
    /// Mono PCM samples as delivered
    pub samples: Vec<f32>,
    /// Sample rate of `samples`
    pub sample_rate: u32,
    /// Requested model tier
    pub tier: ModelTier,
    /// Decode options snapshot
    pub options: DecodeOptions,
    pub priority: QueuePriority,
    pub status: ChunkStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<RawTranscription>,
    pub error_message: Option<String>,
}

/// Where a chunk was found when queried.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkLookup {
    pub status: ChunkStatus,
    /// 1-based position in the pending queue, when pending
    pub position: Option<usize>,
    pub chunk: QueuedAudioChunk,
}

/// Sled-backed priority store.
///
/// Pending and dead-letter contents survive process restart; items that
/// were mid-flight in `processing` at crash time are not re-queued
/// automatically.
#[derive(Clone)]
pub struct PriorityStore {
    db: Db,
    pending: Tree,
    pending_index: Tree,
    processing: Tree,
    completed: Tree,
    failed: Tree,
    counter: Arc<AtomicU64>,
}

/// Low 56 bits of a pending key carry the enqueue sequence.
const SEQUENCE_BITS: u32 = 56;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

fn pending_key(priority: QueuePriority, sequence: u64) -> [u8; 8] {
    // Invert the rank so Urgent sorts first under Tree::first().
    let inverted = (4 - priority.rank()) as u64;
    ((inverted << SEQUENCE_BITS) | (sequence & SEQUENCE_MASK)).to_be_bytes()
}

impl PriorityStore {
    /// Open (or create) a store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> AnyResult<Self> {
        let db = sled::open(&path).with_context(|| {
            format!("Failed to open queue database at {}", path.as_ref().display())
        })?;
        Self::with_db(db)
    }

    /// Create an in-memory store (useful for testing).
    pub fn new_temp() -> AnyResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("Failed to create temporary queue database")?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> AnyResult<Self> {
        let pending = db.open_tree("pending").context("Failed to open pending tree")?;
        let pending_index = db
            .open_tree("pending_index")
            .context("Failed to open pending index tree")?;
        let processing = db
            .open_tree("processing")
            .context("Failed to open processing tree")?;
        let completed = db
            .open_tree("completed")
            .context("Failed to open completed tree")?;
        let failed = db.open_tree("failed").context("Failed to open failed tree")?;

        // Restore the sequence counter past every existing pending key.
        let mut max_sequence = 0u64;
        for entry in pending.iter() {
            let (key, _) = entry?;
            let raw = u64::from_be_bytes(
                key.as_ref()
                    .try_into()
                    .context("Invalid pending key length")?,
            );
            max_sequence = max_sequence.max((raw & SEQUENCE_MASK) + 1);
        }
        let counter = Arc::new(AtomicU64::new(max_sequence));

        Ok(Self {
            db,
            pending,
            pending_index,
            processing,
            completed,
            failed,
            counter,
        })
    }

    /// Insert a chunk into the pending queue.
    pub fn push(&self, chunk: &QueuedAudioChunk) -> AnyResult<()> {
        let data = rmp_serde::to_vec(chunk).context("Failed to serialize chunk")?;
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst);
        let key = pending_key(chunk.priority, sequence);

        self.pending
            .insert(key, data.as_slice())
            .with_context(|| format!("Failed to insert chunk {}", chunk.id))?;
        self.pending_index
            .insert(chunk.id.as_bytes(), &key[..])
            .context("Failed to index chunk")?;

        debug!(
            "Queued chunk {} priority={} sequence={}",
            chunk.id, chunk.priority, sequence
        );
        Ok(())
    }

    /// Pop the highest-priority pending chunk (FIFO within a tier).
    pub fn pop(&self) -> AnyResult<Option<QueuedAudioChunk>> {
        if let Some((key, data)) = self.pending.first()? {
            self.pending.remove(&key)?;
            let chunk: QueuedAudioChunk =
                rmp_serde::from_slice(&data).context("Failed to deserialize popped chunk")?;
            self.pending_index.remove(chunk.id.as_bytes())?;
            return Ok(Some(chunk));
        }
        Ok(None)
    }

    /// Record a chunk as currently processing.
    pub fn mark_processing(&self, chunk: &QueuedAudioChunk) -> AnyResult<()> {
        let data = rmp_serde::to_vec(chunk).context("Failed to serialize chunk")?;
        self.processing.insert(chunk.id.as_bytes(), data)?;
        Ok(())
    }

    /// Drop a chunk from the processing set.
    pub fn clear_processing(&self, id: &Uuid) -> AnyResult<()> {
        self.processing.remove(id.as_bytes())?;
        Ok(())
    }

    /// Store a terminal chunk in `completed` or `failed` by its status.
    pub fn store_terminal(&self, chunk: &QueuedAudioChunk) -> AnyResult<()> {
        let data = rmp_serde::to_vec(chunk).context("Failed to serialize chunk")?;
        match chunk.status {
            ChunkStatus::Completed => {
                self.completed.insert(chunk.id.as_bytes(), data)?;
            }
            ChunkStatus::Failed | ChunkStatus::Cancelled => {
                self.failed.insert(chunk.id.as_bytes(), data)?;
            }
            other => {
                anyhow::bail!("chunk {} is not terminal (status {:?})", chunk.id, other);
            }
        }
        Ok(())
    }

    /// Cancel a pending chunk.
    ///
    /// Returns false when the chunk is unknown or already picked up by a
    /// worker; items in flight cannot be cancelled.
    pub fn cancel(&self, id: &Uuid) -> AnyResult<bool> {
        if let Some(key) = self.pending_index.remove(id.as_bytes())? {
            if let Some(data) = self.pending.remove(&key)? {
                let mut chunk: QueuedAudioChunk =
                    rmp_serde::from_slice(&data).context("Failed to deserialize chunk")?;
                chunk.status = ChunkStatus::Cancelled;
                chunk.completed_at = Some(Utc::now());
                self.store_terminal(&chunk)?;
                info!("Chunk {} cancelled", id);
                return Ok(true);
            }
        }

        if self.processing.contains_key(id.as_bytes())? {
            warn!("Chunk {} is currently processing, cannot cancel", id);
        }
        Ok(false)
    }

    /// Look a chunk up across all four stores.
    pub fn lookup(&self, id: &Uuid) -> AnyResult<Option<ChunkLookup>> {
        if let Some(key) = self.pending_index.get(id.as_bytes())? {
            if let Some(data) = self.pending.get(&key)? {
                let chunk: QueuedAudioChunk = rmp_serde::from_slice(&data)?;
                return Ok(Some(ChunkLookup {
                    status: ChunkStatus::Pending,
                    position: self.position(id)?,
                    chunk,
                }));
            }
        }

        for (tree, status) in [
            (&self.processing, ChunkStatus::Processing),
            (&self.completed, ChunkStatus::Completed),
            (&self.failed, ChunkStatus::Failed),
        ] {
            if let Some(data) = tree.get(id.as_bytes())? {
                let chunk: QueuedAudioChunk = rmp_serde::from_slice(&data)?;
                // The failed tree also holds cancellations; trust the
                // chunk's own status over the tree it lives in.
                let status = if chunk.status == ChunkStatus::Cancelled {
                    ChunkStatus::Cancelled
                } else {
                    status
                };
                return Ok(Some(ChunkLookup {
                    status,
                    position: None,
                    chunk,
                }));
            }
        }

        Ok(None)
    }

    /// 1-based dequeue position of a pending chunk.
    pub fn position(&self, id: &Uuid) -> AnyResult<Option<usize>> {
        let Some(target) = self.pending_index.get(id.as_bytes())? else {
            return Ok(None);
        };
        let mut position = 1;
        for entry in self.pending.iter() {
            let (key, _) = entry?;
            if key == target {
                return Ok(Some(position));
            }
            position += 1;
        }
        Ok(None)
    }

    /// Pending items per priority tier.
    pub fn pending_by_priority(&self) -> AnyResult<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for entry in self.pending.iter() {
            let (_, data) = entry?;
            let chunk: QueuedAudioChunk = rmp_serde::from_slice(&data)?;
            *counts.entry(chunk.priority.to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn processing_len(&self) -> usize {
        self.processing.len()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn failed_len(&self) -> usize {
        self.failed.len()
    }

    /// Trim the completed and failed stores down to `retention` items,
    /// dropping the oldest by completion time.
    pub fn prune_terminal(&self, retention: usize) -> AnyResult<usize> {
        let mut removed = 0;
        for tree in [&self.completed, &self.failed] {
            if tree.len() <= retention {
                continue;
            }

            let mut items: Vec<(Vec<u8>, DateTime<Utc>)> = Vec::with_capacity(tree.len());
            for entry in tree.iter() {
                let (key, data) = entry?;
                let chunk: QueuedAudioChunk = rmp_serde::from_slice(&data)?;
                items.push((
                    key.to_vec(),
                    chunk.completed_at.unwrap_or(chunk.created_at),
                ));
            }

            items.sort_by_key(|(_, at)| *at);
            let excess = items.len().saturating_sub(retention);
            for (key, _) in items.into_iter().take(excess) {
                tree.remove(key)?;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Pruned {} terminal queue items", removed);
        }
        Ok(removed)
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> AnyResult<()> {
        self.db
            .flush_async()
            .await
            .context("Failed to flush queue database")?;
        Ok(())
    }
}

impl QueuedAudioChunk {
    /// Build a fresh pending chunk.
    pub fn new(
        session_id: impl Into<String>,
        samples: Vec<f32>,
        sample_rate: u32,
        tier: ModelTier,
        options: DecodeOptions,
        priority: QueuePriority,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            samples,
            sample_rate,
            tier,
            options,
            priority,
            status: ChunkStatus::Pending,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error_message: None,
        }
    }
}
