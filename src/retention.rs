//! Retention: disk-pressure purging, orphan scavenging, and hot-to-cold
//! tiering.
//!
//! Purging is strictly oldest-first across all cameras and deletes the disk
//! file before the index entry. If a disk delete fails the index entry stays,
//! so the segment remains visible and the next cycle retries it. Deleting
//! metadata for a file that still exists would leak the space forever.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{RetentionPolicy, StorageLayout};
use crate::index::TimeIndex;
use crate::segment::{now_ms, StorageTier};

/// Headroom multiplier over the computed purge budget, so one cycle lands
/// safely under the target instead of oscillating around it.
const PURGE_OVERSHOOT: f64 = 1.2;

/// Filesystem occupancy snapshot.
#[derive(Debug, Clone, Copy)]
pub struct DiskUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl DiskUsage {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Source of disk occupancy. Seamed as a trait so retention tests can dial in
/// exact pressure instead of filling a real filesystem.
#[async_trait]
pub trait DiskGauge: Send + Sync {
    async fn usage(&self) -> Result<DiskUsage>;
}

/// Real gauge: statvfs on the storage root.
pub struct StatvfsGauge {
    pub path: PathBuf,
}

#[async_trait]
impl DiskGauge for StatvfsGauge {
    async fn usage(&self) -> Result<DiskUsage> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
                .context("storage path contains a nul byte")?;
            let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("statvfs failed for {:?}", path));
            }
            let frsize = stat.f_frsize as u64;
            Ok(DiskUsage {
                used_bytes: (stat.f_blocks as u64 - stat.f_bfree as u64) * frsize,
                total_bytes: stat.f_blocks as u64 * frsize,
            })
        })
        .await?
    }
}

/// Outcome of one purge cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct PurgeReport {
    pub freed_bytes: u64,
    pub deleted: usize,
    pub skipped_protected: usize,
    pub failed: usize,
    pub orphans_removed: usize,
}

/// Disk-pressure driven deleter. One instance owns the purge cycle; ticks
/// arriving while a cycle runs are dropped, not queued.
pub struct RetentionEngine {
    policy: RetentionPolicy,
    layout: StorageLayout,
    index: Arc<TimeIndex>,
    gauge: Arc<dyn DiskGauge>,
    purging: AtomicBool,
}

impl RetentionEngine {
    pub fn new(
        policy: RetentionPolicy,
        layout: StorageLayout,
        index: Arc<TimeIndex>,
        gauge: Arc<dyn DiskGauge>,
    ) -> Self {
        Self {
            policy,
            layout,
            index,
            gauge,
            purging: AtomicBool::new(false),
        }
    }

    /// One retention tick: read the gauge and purge down to the target if
    /// usage is at or past the trigger. Returns `None` when no purge ran.
    ///
    /// A gauge error skips the tick; retention must never delete on a guess.
    pub async fn check_and_purge(&self) -> Option<PurgeReport> {
        if self
            .purging
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("purge cycle already running, tick dropped");
            return None;
        }

        let report = self.run_cycle().await;
        self.purging.store(false, Ordering::SeqCst);
        report
    }

    async fn run_cycle(&self) -> Option<PurgeReport> {
        let usage = match self.gauge.usage().await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "disk gauge failed, skipping retention tick");
                return None;
            }
        };
        if usage.percent() < self.policy.trigger_percent {
            return None;
        }

        let target_bytes = (self.policy.target_percent / 100.0 * usage.total_bytes as f64) as u64;
        let bytes_to_free = usage.used_bytes.saturating_sub(target_bytes);
        info!(
            usage_percent = usage.percent(),
            bytes_to_free, "disk pressure, purging oldest footage"
        );
        Some(self.purge(bytes_to_free).await)
    }

    /// Delete oldest footage until roughly `bytes_to_free` (plus headroom) is
    /// reclaimed or only protected segments remain.
    pub async fn purge(&self, bytes_to_free: u64) -> PurgeReport {
        let mut report = PurgeReport {
            orphans_removed: self.scavenge().await,
            ..Default::default()
        };

        let budget = (bytes_to_free as f64 * PURGE_OVERSHOOT) as u64;
        let protect_after = now_ms() - self.policy.protection_window.as_millis() as i64;

        let victims = self.index.oldest_first(usize::MAX).await;
        for segment in victims {
            if report.freed_bytes >= budget {
                break;
            }
            if segment.start_ts >= protect_after {
                // ascending order: everything after this is younger still
                report.skipped_protected += 1;
                break;
            }

            match std::fs::remove_file(&segment.path) {
                Ok(()) => {}
                // already gone on disk; dropping the entry reconciles
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(segment = %segment.id, error = %e, "purge delete failed, keeping entry");
                    report.failed += 1;
                    continue;
                }
            }
            self.index.remove(&segment.camera_id, segment.start_ts).await;
            report.freed_bytes += segment.size_bytes;
            report.deleted += 1;
        }

        info!(
            deleted = report.deleted,
            freed_bytes = report.freed_bytes,
            failed = report.failed,
            orphans = report.orphans_removed,
            "purge cycle complete"
        );
        report
    }

    /// Delete media files on disk that the index does not know about.
    ///
    /// Orphans appear when a crash loses journal entries or a purge deleted
    /// the entry but a retried file delete later succeeded elsewhere. Files
    /// younger than the protection window are left alone; they may be
    /// mid-confirmation.
    pub async fn scavenge(&self) -> usize {
        let known = self.index.known_paths().await;
        let mut removed = 0;
        for root in [&self.layout.hot_root, &self.layout.cold_root] {
            let mut media = Vec::new();
            collect_media(root, &mut media);
            for path in media {
                if known.contains(&path) {
                    continue;
                }
                if !older_than(&path, self.policy.protection_window) {
                    continue;
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(path = ?path, "removed orphaned media file");
                        removed += 1;
                        prune_empty_dirs(&path, root);
                    }
                    Err(e) => warn!(path = ?path, error = %e, "failed to remove orphan"),
                }
            }
        }
        if removed > 0 {
            info!(removed, "scavenged orphaned media files");
        }
        removed
    }

    /// Move hot segments older than the cold-age threshold to the cold root,
    /// preserving their relative layout. A failed move is skipped and retried
    /// next cycle; the index is only re-pointed after the rename succeeds.
    pub async fn run_tiering(&self) -> usize {
        let cutoff = now_ms() - self.policy.cold_age.as_millis() as i64;
        let mut moved = 0;

        for segment in self.index.oldest_first(usize::MAX).await {
            if segment.start_ts >= cutoff {
                break;
            }
            if segment.tier != StorageTier::Hot {
                continue;
            }
            let Ok(rel) = segment.path.strip_prefix(&self.layout.hot_root) else {
                warn!(segment = %segment.id, path = ?segment.path, "hot segment outside hot root");
                continue;
            };
            let dest = self.layout.cold_root.join(rel);

            let result = dest
                .parent()
                .map(std::fs::create_dir_all)
                .transpose()
                .and_then(|_| std::fs::rename(&segment.path, &dest));
            if let Err(e) = result {
                warn!(segment = %segment.id, error = %e, "cold move failed, will retry");
                continue;
            }

            self.index
                .set_tier(&segment.camera_id, segment.start_ts, StorageTier::Cold, dest)
                .await;
            moved += 1;
        }

        if moved > 0 {
            info!(moved, "segments moved to cold storage");
        }
        moved
    }
}

fn collect_media(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_media(&path, out);
        } else if path.extension().is_some_and(|e| e == "mp4") {
            out.push(path);
        }
    }
}

fn older_than(path: &Path, window: Duration) -> bool {
    let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map_or(false, |age| age > window)
}

// Remove now-empty parent directories up to (not including) the root.
fn prune_empty_dirs(deleted: &Path, root: &Path) {
    let mut dir = deleted.parent();
    while let Some(d) = dir {
        if d == root || std::fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}
