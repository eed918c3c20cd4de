//! Request-time resolution from (camera, timestamp) to playable segments.
//!
//! Playback starts at the segment covering the requested instant, with a seek
//! offset into it, and runs forward through a bounded window. "Nothing
//! recorded there" is a normal answer, not an error.

use std::sync::Arc;

use crate::index::TimeIndex;
use crate::segment::Segment;

/// Hard cap on segments in one resolved window, independent of the requested
/// duration.
pub const MAX_SEGMENTS_PER_REQUEST: usize = 200;

/// An ordered run of segments plus the seek offset into the first one.
#[derive(Debug, Clone)]
pub struct ResolvedWindow {
    pub segments: Vec<Segment>,
    pub seek_offset_secs: f64,
}

#[derive(Debug, Clone)]
pub enum Resolution {
    /// No footage at or after the requested time.
    NoFootage,
    Playable(ResolvedWindow),
}

pub struct PlaybackResolver {
    index: Arc<TimeIndex>,
}

impl PlaybackResolver {
    pub fn new(index: Arc<TimeIndex>) -> Self {
        Self { index }
    }

    /// Resolve `window_ms` of playback starting at `start_ts`.
    ///
    /// Anchor is the last segment starting at or before the requested time.
    /// With no anchor (request predates all footage) playback snaps forward
    /// to the first segment after it, at offset zero.
    pub async fn resolve(&self, camera_id: &str, start_ts: i64, window_ms: i64) -> Resolution {
        let anchor = match self.index.anchor(camera_id, start_ts).await {
            Some(anchor) => anchor,
            None => match self.index.next_after(camera_id, start_ts).await {
                Some(next) => next,
                None => return Resolution::NoFootage,
            },
        };

        // for a snapped-forward anchor the window runs from the footage, not
        // from the empty requested instant
        let window_end = start_ts.max(anchor.start_ts) + window_ms;
        let mut segments = self
            .index
            .query_range(camera_id, anchor.start_ts, window_end)
            .await;
        segments.truncate(MAX_SEGMENTS_PER_REQUEST);

        let Some(first) = segments.first() else {
            return Resolution::NoFootage;
        };
        let seek_offset_secs = (start_ts - first.start_ts).max(0) as f64 / 1_000.0;
        Resolution::Playable(ResolvedWindow {
            segments,
            seek_offset_secs,
        })
    }
}
