//! Background compaction driver for the engine.
//!
//! The engine only records how far history has been trimmed; deciding what to remove is
//! left to a caller. `Compactor` is that caller. A pass walks every version written since
//! the recorded floor up to a target revision and deletes:
//! - the previous version of every row that superseded one, and
//! - tombstones themselves.
//!
//! History is read in pages of `COMPACT_BATCH` versions, so a pass over a large backlog
//! holds at most one page in memory. The pass then records the target as the new floor. The
//! latest version of every live key is never touched. Run one compactor per table; the
//! floor bookkeeping is not safe against concurrent writers of the floor.
//!
//! Compaction modes:
//! - Periodic: compact to `current - retention` every interval
//! - Revision: compact once to a specific revision

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::storage::{Context, Generic, StorageError, StorageResult};

/// Versions read per page during a compaction pass.
pub const COMPACT_BATCH: i64 = 1000;

/// Compaction strategy.
#[derive(Clone, Debug)]
pub enum CompactionMode {
    /// Periodically compact at a fixed interval
    Periodic(Duration),

    /// Compact to a specific revision (one-shot)
    Revision(i64),
}

/// Compactor that trims superseded revisions through the engine's public operations.
pub struct Compactor {
    /// The engine being compacted
    store: Arc<Generic>,

    /// Compaction mode
    mode: CompactionMode,

    /// For periodic mode: number of most recent revisions left untouched
    retention: i64,
}

impl Compactor {
    pub fn new(store: Arc<Generic>, mode: CompactionMode, retention: i64) -> Self {
        Self {
            store,
            mode,
            retention: retention.max(0),
        }
    }

    /// Spawns a background tokio task that performs compaction.
    ///
    /// Returns a JoinHandle that can be awaited or aborted.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match self.mode {
                CompactionMode::Periodic(interval_duration) => {
                    self.run_periodic(interval_duration).await;
                }
                CompactionMode::Revision(target_revision) => {
                    self.run_once(target_revision).await;
                }
            }
        })
    }

    async fn run_periodic(&self, interval_duration: Duration) {
        let mut ticker = interval(interval_duration);

        info!(
            "Starting periodic compactor with interval {:?}, retention {} revisions",
            interval_duration, self.retention
        );

        loop {
            ticker.tick().await;

            let store = Arc::clone(&self.store);
            let retention = self.retention;
            let target = tokio::task::spawn_blocking(move || {
                let ctx = Context::background();
                let current = store.current_revision(&ctx)?;
                let floor = store.get_compact_revision(&ctx)?;
                Ok::<_, StorageError>((current - retention, floor))
            })
            .await;

            let target = match target {
                Ok(Ok((target, floor))) if target > floor => target,
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    warn!("Periodic compaction could not read revisions: {}", e);
                    continue;
                }
                Err(e) => {
                    warn!("Periodic compaction task failed: {}", e);
                    continue;
                }
            };

            match self.compact_to(target).await {
                Ok(removed) => {
                    info!(
                        "Periodic compaction to revision {} removed {} revisions",
                        target, removed
                    );
                }
                Err(e) => {
                    warn!("Periodic compaction to revision {} failed: {}", target, e);
                }
            }
        }
    }

    async fn run_once(&self, target_revision: i64) {
        debug!(
            "Starting one-time compaction to revision {}",
            target_revision
        );

        match self.compact_to(target_revision).await {
            Ok(removed) => {
                info!(
                    "One-time compaction to revision {} removed {} revisions",
                    target_revision, removed
                );
            }
            Err(e) => {
                warn!("One-time compaction to revision {} failed: {}", target_revision, e);
            }
        }
    }

    /// Compacts to `revision` (clamped to the current revision) on the blocking pool.
    ///
    /// Returns the number of delete statements issued.
    pub async fn compact_to(&self, revision: i64) -> StorageResult<u64> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || compact(&store, &Context::background(), revision))
            .await
            .map_err(|e| StorageError::Compaction(format!("compaction task failed: {}", e)))?
    }
}

/// One compaction pass, synchronously.
pub fn compact(store: &Generic, ctx: &Context, revision: i64) -> StorageResult<u64> {
    compact_in_batches(store, ctx, revision, COMPACT_BATCH)
}

fn compact_in_batches(
    store: &Generic,
    ctx: &Context,
    revision: i64,
    batch: i64,
) -> StorageResult<u64> {
    let floor = store.get_compact_revision(ctx)?;
    let target = revision.min(store.current_revision(ctx)?);
    if target <= floor {
        debug!(
            "Compaction to {} skipped, floor already at {}",
            target, floor
        );
        return Ok(0);
    }

    let mut cursor = floor;
    let mut removed = 0u64;

    'pages: loop {
        let page = store.after(ctx, "", cursor, batch)?;
        let full = page.len() as i64 >= batch;

        for record in &page.records {
            if record.id > target {
                break 'pages;
            }
            cursor = record.id;

            if record.is_compaction_sentinel() {
                continue;
            }
            if record.prev_revision != 0 {
                store.delete_revision(ctx, record.prev_revision)?;
                removed += 1;
            }
            if record.deleted {
                store.delete_revision(ctx, record.id)?;
                removed += 1;
            }
        }

        if !full {
            break;
        }
    }

    store.set_compact_revision(ctx, target)?;
    Ok(removed)
}
