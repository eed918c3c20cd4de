//! Time index: per-camera, time-ordered mapping from ranges to segments.
//!
//! The index is the single shared mutable structure between the capture
//! supervisor (writer), the retention engine (deleter) and the playback
//! resolver (reader). All mutations are per-segment; readers never observe a
//! half-built index. Durability lives in the journal; the index is rebuilt
//! from the journal's completed archive at startup.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::ops::Bound;
use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::segment::{now_ms, utc_parts, Segment, SegmentKind, SegmentStatus, StorageTier};

/// Distance between one segment's end and the next one's start at or beyond
/// which a gap is recorded.
pub const GAP_TOLERANCE_MS: i64 = 10_000;

/// A start timestamp further than this ahead of "now" indicates clock skew;
/// such segments are never presented to callers as valid history.
pub const MAX_FUTURE_SKEW_MS: i64 = 60_000;

/// Near-contiguous spans closer than this are merged in the day timeline.
const TIMELINE_MERGE_MS: i64 = 2_000;

/// A recorded interval with no segment coverage. Gaps are index metadata;
/// they make missing footage explicit rather than silently absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub camera_id: String,
    pub start_ts: i64,
    pub end_ts: i64,
}

#[derive(Default)]
struct CameraIndex {
    /// Complete segments keyed by start timestamp.
    segments: BTreeMap<i64, Segment>,
    gaps: Vec<Gap>,
    /// End of the most recently indexed segment, for gap detection.
    last_end: Option<i64>,
}

/// Queryable mapping from (camera, time range) to segment metadata.
pub struct TimeIndex {
    cameras: RwLock<HashMap<String, CameraIndex>>,
}

impl TimeIndex {
    pub fn new() -> Self {
        Self {
            cameras: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a completed segment and run gap detection against the
    /// previously indexed segment for the same camera.
    ///
    /// Only `Complete` segments with a verified non-zero size are accepted;
    /// a `Pending` segment is a promise, not a fact.
    pub async fn insert(&self, segment: Segment) -> Result<()> {
        if segment.status != SegmentStatus::Complete {
            bail!("refusing to index non-complete segment {}", segment.id);
        }
        if segment.size_bytes == 0 {
            bail!("refusing to index zero-length segment {}", segment.id);
        }

        let mut cameras = self.cameras.write().await;
        let entry = cameras.entry(segment.camera_id.clone()).or_default();

        let effective_end = if segment.end_ts > 0 {
            segment.end_ts
        } else {
            segment.start_ts
        };

        if let Some(last_end) = entry.last_end {
            let distance = segment.start_ts - last_end;
            if distance >= GAP_TOLERANCE_MS {
                debug!(
                    camera = %segment.camera_id,
                    gap_ms = distance,
                    "coverage gap recorded"
                );
                entry.gaps.push(Gap {
                    camera_id: segment.camera_id.clone(),
                    start_ts: last_end,
                    end_ts: segment.start_ts,
                });
            }
            entry.last_end = Some(last_end.max(effective_end));
        } else {
            entry.last_end = Some(effective_end);
        }

        entry.segments.insert(segment.start_ts, segment);
        Ok(())
    }

    /// All complete segments overlapping `[start, end)`, ascending by start.
    ///
    /// Overlap semantics: `end_ts > start && start_ts < end`. A segment with
    /// `end_ts == 0` (still open) is treated as ending "now". Segments with
    /// corrupt timestamps are filtered out, never propagated to playback.
    pub async fn query_range(&self, camera_id: &str, start: i64, end: i64) -> Vec<Segment> {
        let now = now_ms();
        let cameras = self.cameras.read().await;
        let Some(cam) = cameras.get(camera_id) else {
            return Vec::new();
        };
        // segments are sequential per camera, so nothing before the last
        // start at-or-before `start` can still overlap the range
        let from = cam
            .segments
            .range(..=start)
            .next_back()
            .map_or(i64::MIN, |(k, _)| *k);
        cam.segments
            .range(from..end)
            .map(|(_, s)| s)
            .filter(|s| plausible(s, now) && effective_end(s, now) > start)
            .cloned()
            .collect()
    }

    /// The last segment with `start_ts <= t`, used to start playback
    /// mid-segment.
    pub async fn anchor(&self, camera_id: &str, t: i64) -> Option<Segment> {
        let now = now_ms();
        let cameras = self.cameras.read().await;
        let cam = cameras.get(camera_id)?;
        cam.segments
            .range(..=t)
            .rev()
            .map(|(_, s)| s)
            .find(|s| plausible(s, now))
            .cloned()
    }

    /// The first segment with `start_ts > t` (resolver fallback when the
    /// request lands before any footage).
    pub async fn next_after(&self, camera_id: &str, t: i64) -> Option<Segment> {
        let now = now_ms();
        let cameras = self.cameras.read().await;
        let cam = cameras.get(camera_id)?;
        cam.segments
            .range((Bound::Excluded(t), Bound::Unbounded))
            .map(|(_, s)| s)
            .find(|s| plausible(s, now))
            .cloned()
    }

    /// Gap records overlapping `[start, end)`.
    pub async fn gaps(&self, camera_id: &str, start: i64, end: i64) -> Vec<Gap> {
        let cameras = self.cameras.read().await;
        let Some(cam) = cameras.get(camera_id) else {
            return Vec::new();
        };
        cam.gaps
            .iter()
            .filter(|g| g.end_ts > start && g.start_ts < end)
            .cloned()
            .collect()
    }

    /// Remove one segment from the index. Returns the removed entry.
    ///
    /// Gap records that no longer overlap any surviving footage are dropped
    /// with it, so retention does not leave the gap list growing forever.
    pub async fn remove(&self, camera_id: &str, start_ts: i64) -> Option<Segment> {
        let mut cameras = self.cameras.write().await;
        let cam = cameras.get_mut(camera_id)?;
        let removed = cam.segments.remove(&start_ts);
        if removed.is_some() {
            match cam.segments.keys().next().copied() {
                Some(oldest) => cam.gaps.retain(|g| g.end_ts > oldest),
                None => cam.gaps.clear(),
            }
        }
        removed
    }

    /// Re-point a segment at its new tier and location after a cold move.
    pub async fn set_tier(
        &self,
        camera_id: &str,
        start_ts: i64,
        tier: StorageTier,
        new_path: PathBuf,
    ) -> bool {
        let mut cameras = self.cameras.write().await;
        let Some(seg) = cameras
            .get_mut(camera_id)
            .and_then(|c| c.segments.get_mut(&start_ts))
        else {
            return false;
        };
        seg.tier = tier;
        seg.path = new_path;
        true
    }

    /// Mark segments overlapping `[start, end)` as motion-relevant. Does not
    /// change indexing or retention behavior. Returns the count tagged.
    pub async fn tag_motion(&self, camera_id: &str, start: i64, end: i64) -> usize {
        let mut cameras = self.cameras.write().await;
        let Some(cam) = cameras.get_mut(camera_id) else {
            return 0;
        };
        let from = cam
            .segments
            .range(..=start)
            .next_back()
            .map_or(i64::MIN, |(k, _)| *k);
        let mut tagged = 0;
        for (_, seg) in cam.segments.range_mut(from..end) {
            if seg.end_ts > start && seg.start_ts < end {
                seg.kind = SegmentKind::Motion;
                tagged += 1;
            }
        }
        tagged
    }

    /// Drop segments whose start is implausibly in the future relative to
    /// `now` (artifacts of a previous unclean shutdown). Returns the removed
    /// entries so the caller can delete the files.
    pub async fn purge_future(&self, camera_id: &str, now: i64) -> Vec<Segment> {
        let mut cameras = self.cameras.write().await;
        let Some(cam) = cameras.get_mut(camera_id) else {
            return Vec::new();
        };
        let stale = cam.segments.split_off(&(now + MAX_FUTURE_SKEW_MS + 1));
        if stale.is_empty() {
            return Vec::new();
        }
        cam.last_end = cam
            .segments
            .values()
            .map(|s| effective_end(s, now))
            .max();
        // gaps recorded against future-dated segments go with them
        cam.gaps.retain(|g| g.end_ts <= now + MAX_FUTURE_SKEW_MS);
        warn!(
            camera = %camera_id,
            count = stale.len(),
            "purged future-dated segments from index"
        );
        stale.into_values().collect()
    }

    /// Globally oldest complete segments across all cameras, ascending by
    /// start. `limit` bounds the scan for callers that stop early.
    pub async fn oldest_first(&self, limit: usize) -> Vec<Segment> {
        let cameras = self.cameras.read().await;
        let mut iters: Vec<_> = cameras
            .values()
            .map(|c| c.segments.values().peekable())
            .collect();

        // k-way merge on start_ts across cameras
        let mut heap = BinaryHeap::new();
        for (i, it) in iters.iter_mut().enumerate() {
            if let Some(seg) = it.peek() {
                heap.push(Reverse((seg.start_ts, i)));
            }
        }

        let mut out = Vec::new();
        while out.len() < limit {
            let Some(Reverse((_, i))) = heap.pop() else {
                break;
            };
            let it = &mut iters[i];
            if let Some(seg) = it.next() {
                out.push(seg.clone());
            }
            if let Some(next) = it.peek() {
                heap.push(Reverse((next.start_ts, i)));
            }
        }
        out
    }

    /// Every file path the index currently knows about (orphan sweep input).
    pub async fn known_paths(&self) -> HashSet<PathBuf> {
        let cameras = self.cameras.read().await;
        cameras
            .values()
            .flat_map(|c| c.segments.values().map(|s| s.path.clone()))
            .collect()
    }

    /// Merged coverage spans for one UTC day, for timeline display.
    pub async fn day_timeline(&self, camera_id: &str, day_start: i64) -> Vec<(i64, i64)> {
        let segments = self
            .query_range(camera_id, day_start, day_start + 86_400_000)
            .await;
        let now = now_ms();
        let mut spans: Vec<(i64, i64)> = Vec::new();
        for seg in &segments {
            let end = effective_end(seg, now);
            match spans.last_mut() {
                Some(last) if seg.start_ts - last.1 <= TIMELINE_MERGE_MS => {
                    last.1 = last.1.max(end);
                }
                _ => spans.push((seg.start_ts, end)),
            }
        }
        spans
    }

    /// Bounds of available footage, clamped to "now".
    pub async fn first_last(&self, camera_id: &str) -> Option<(i64, i64)> {
        let now = now_ms();
        let cameras = self.cameras.read().await;
        let cam = cameras.get(camera_id)?;
        let first = cam
            .segments
            .values()
            .find(|s| plausible(s, now))
            .map(|s| s.start_ts)?;
        let last = cam
            .segments
            .values()
            .rev()
            .find(|s| plausible(s, now))
            .map(|s| effective_end(s, now).min(now))?;
        Some((first, last))
    }

    /// Days of the given month that have any footage.
    pub async fn calendar_days(&self, camera_id: &str, year: i32, month: u32) -> Vec<u32> {
        let now = now_ms();
        let cameras = self.cameras.read().await;
        let Some(cam) = cameras.get(camera_id) else {
            return Vec::new();
        };
        let mut days: Vec<u32> = cam
            .segments
            .values()
            .filter(|s| plausible(s, now))
            .filter_map(|s| {
                let (y, m, d, ..) = utc_parts(s.start_ts);
                (y == year && m == month).then_some(d)
            })
            .collect();
        days.dedup();
        days
    }

    /// Total indexed segments for a camera (health/test helper).
    pub async fn segment_count(&self, camera_id: &str) -> usize {
        let cameras = self.cameras.read().await;
        cameras.get(camera_id).map_or(0, |c| c.segments.len())
    }
}

impl Default for TimeIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn plausible(seg: &Segment, now: i64) -> bool {
    seg.start_ts > 0 && seg.start_ts <= now + MAX_FUTURE_SKEW_MS
}

fn effective_end(seg: &Segment, now: i64) -> i64 {
    if seg.end_ts > 0 {
        seg.end_ts
    } else {
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use std::path::PathBuf;

    fn complete(camera: &str, start: i64, end: i64) -> Segment {
        Segment {
            id: Segment::make_id(camera, start),
            camera_id: camera.to_string(),
            start_ts: start,
            end_ts: end,
            path: PathBuf::from(format!("/tmp/{}/{}.mp4", camera, start)),
            size_bytes: 1024,
            checksum: Some("ab".repeat(32)),
            status: SegmentStatus::Complete,
            kind: SegmentKind::Continuous,
            tier: StorageTier::Hot,
        }
    }

    // Test timestamps are anchored near "now" so the clock-skew filter sees
    // them as plausible history.
    fn base() -> i64 {
        now_ms() - 3_600_000
    }

    #[tokio::test]
    async fn overlap_query_includes_touching_segments() {
        let idx = TimeIndex::new();
        let b = base();
        idx.insert(complete("x", b, b + 10_000)).await.unwrap();
        idx.insert(complete("x", b + 10_000, b + 20_000)).await.unwrap();
        idx.insert(complete("x", b + 30_000, b + 40_000)).await.unwrap();

        let hits = idx.query_range("x", b + 5_000, b + 35_000).await;
        let starts: Vec<i64> = hits.iter().map(|s| s.start_ts - b).collect();
        assert_eq!(starts, vec![0, 10_000, 30_000]);
    }

    #[tokio::test]
    async fn pure_gap_range_returns_nothing_but_a_gap_record() {
        let idx = TimeIndex::new();
        let b = base();
        idx.insert(complete("x", b, b + 10_000)).await.unwrap();
        idx.insert(complete("x", b + 10_000, b + 20_000)).await.unwrap();
        idx.insert(complete("x", b + 30_000, b + 40_000)).await.unwrap();

        assert!(idx.query_range("x", b + 20_000, b + 30_000).await.is_empty());

        let gaps = idx.gaps("x", b + 20_000, b + 30_000).await;
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_ts, b + 20_000);
        assert_eq!(gaps[0].end_ts, b + 30_000);
    }

    #[tokio::test]
    async fn gap_within_tolerance_is_not_recorded() {
        let idx = TimeIndex::new();
        let b = base();
        idx.insert(complete("x", b, b + 5_000)).await.unwrap();
        // 8s hole, under the 10s tolerance
        idx.insert(complete("x", b + 13_000, b + 18_000)).await.unwrap();
        assert!(idx.gaps("x", b, b + 20_000).await.is_empty());
    }

    #[tokio::test]
    async fn rejects_pending_and_empty_segments() {
        let idx = TimeIndex::new();
        let b = base();
        let mut pending = complete("x", b, b + 5_000);
        pending.status = SegmentStatus::Pending;
        assert!(idx.insert(pending).await.is_err());

        let mut empty = complete("x", b, b + 5_000);
        empty.size_bytes = 0;
        assert!(idx.insert(empty).await.is_err());
        assert_eq!(idx.segment_count("x").await, 0);
    }

    #[tokio::test]
    async fn open_ended_segment_overlaps_until_now() {
        let idx = TimeIndex::new();
        let b = base();
        idx.insert(complete("x", b, 0)).await.unwrap();
        // well past the segment start, but the segment has no end yet
        let hits = idx.query_range("x", b + 50_000, b + 60_000).await;
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_timestamps_are_filtered_at_query_time() {
        let idx = TimeIndex::new();
        let far_future = now_ms() + 3_600_000;
        idx.insert(complete("x", far_future, far_future + 5_000))
            .await
            .unwrap();
        assert!(idx.query_range("x", 1, i64::MAX).await.is_empty());
        assert!(idx.anchor("x", i64::MAX).await.is_none());
    }

    #[tokio::test]
    async fn anchor_and_next_after() {
        let idx = TimeIndex::new();
        let b = base();
        idx.insert(complete("x", b + 100_000, b + 110_000)).await.unwrap();
        idx.insert(complete("x", b + 110_000, b + 120_000)).await.unwrap();

        let a = idx.anchor("x", b + 104_000).await.unwrap();
        assert_eq!(a.start_ts, b + 100_000);

        assert!(idx.anchor("x", b + 99_999).await.is_none());
        let n = idx.next_after("x", b + 99_999).await.unwrap();
        assert_eq!(n.start_ts, b + 100_000);
    }

    #[tokio::test]
    async fn empty_index_queries_return_empty_not_error() {
        let idx = TimeIndex::new();
        assert!(idx.query_range("nope", 0, i64::MAX).await.is_empty());
        assert!(idx.gaps("nope", 0, i64::MAX).await.is_empty());
        assert!(idx.first_last("nope").await.is_none());
    }

    #[tokio::test]
    async fn oldest_first_merges_across_cameras() {
        let idx = TimeIndex::new();
        let b = base();
        idx.insert(complete("a", b + 20_000, b + 25_000)).await.unwrap();
        idx.insert(complete("b", b + 10_000, b + 15_000)).await.unwrap();
        idx.insert(complete("a", b, b + 5_000)).await.unwrap();

        let all = idx.oldest_first(usize::MAX).await;
        let order: Vec<(String, i64)> = all
            .iter()
            .map(|s| (s.camera_id.clone(), s.start_ts - b))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), 0),
                ("b".to_string(), 10_000),
                ("a".to_string(), 20_000)
            ]
        );

        assert_eq!(idx.oldest_first(2).await.len(), 2);
    }

    #[tokio::test]
    async fn purge_future_removes_only_future_entries() {
        let idx = TimeIndex::new();
        let b = base();
        let now = now_ms();
        idx.insert(complete("x", b, b + 5_000)).await.unwrap();
        idx.insert(complete("x", now + 600_000, now + 605_000))
            .await
            .unwrap();

        let removed = idx.purge_future("x", now).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].start_ts, now + 600_000);
        assert_eq!(idx.segment_count("x").await, 1);

        // the gap recorded against the future-dated segment went with it
        assert!(idx.gaps("x", b, i64::MAX).await.is_empty());
    }

    #[tokio::test]
    async fn removing_oldest_footage_prunes_stale_gap_records() {
        let idx = TimeIndex::new();
        let b = base();
        idx.insert(complete("x", b, b + 5_000)).await.unwrap();
        idx.insert(complete("x", b + 30_000, b + 35_000)).await.unwrap();
        assert_eq!(idx.gaps("x", b, b + 40_000).await.len(), 1);

        // oldest segment purged: the gap no longer overlaps surviving footage
        idx.remove("x", b).await.unwrap();
        assert!(idx.gaps("x", b, b + 40_000).await.is_empty());

        // removing the last segment clears the list entirely
        idx.remove("x", b + 30_000).await.unwrap();
        assert!(idx.gaps("x", b, b + 40_000).await.is_empty());
    }

    #[tokio::test]
    async fn window_query_seeks_to_the_anchor_not_older_footage() {
        let idx = TimeIndex::new();
        let b = base();
        idx.insert(complete("x", b, b + 5_000)).await.unwrap();
        idx.insert(complete("x", b + 100_000, b + 110_000)).await.unwrap();

        let hits = idx.query_range("x", b + 104_000, b + 106_000).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start_ts, b + 100_000);
    }

    #[tokio::test]
    async fn motion_tagging_is_scoped_to_the_range() {
        let idx = TimeIndex::new();
        let b = base();
        idx.insert(complete("x", b, b + 5_000)).await.unwrap();
        idx.insert(complete("x", b + 5_000, b + 10_000)).await.unwrap();

        assert_eq!(idx.tag_motion("x", b + 6_000, b + 7_000).await, 1);
        let hits = idx.query_range("x", b, b + 10_000).await;
        assert_eq!(hits[0].kind, SegmentKind::Continuous);
        assert_eq!(hits[1].kind, SegmentKind::Motion);
    }

    #[tokio::test]
    async fn day_timeline_merges_contiguous_spans() {
        let idx = TimeIndex::new();
        let day = crate::segment::day_start_ms(base());
        let b = day + 3_600_000;
        idx.insert(complete("x", b, b + 5_000)).await.unwrap();
        idx.insert(complete("x", b + 5_000, b + 10_000)).await.unwrap();
        idx.insert(complete("x", b + 60_000, b + 65_000)).await.unwrap();

        let spans = idx.day_timeline("x", day).await;
        assert_eq!(spans, vec![(b, b + 10_000), (b + 60_000, b + 65_000)]);
    }

    #[tokio::test]
    async fn calendar_and_first_last() {
        let idx = TimeIndex::new();
        let b = base();
        idx.insert(complete("x", b, b + 5_000)).await.unwrap();

        let (y, m, d, ..) = utc_parts(b);
        assert_eq!(idx.calendar_days("x", y, m).await, vec![d]);
        assert!(idx.calendar_days("x", y + 1, m).await.is_empty());

        let (first, last) = idx.first_last("x").await.unwrap();
        assert_eq!(first, b);
        assert_eq!(last, b + 5_000);
    }
}
