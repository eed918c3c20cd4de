//! Segment model and on-disk layout.
//!
//! A segment is one bounded video file covering a fixed time range for one
//! camera. Files live under a hierarchical wall-clock path:
//!
//! `<root>/<cameraId>/<YYYY>/<MM>/<DD>/<HH>/<mm-ss>.mp4`
//!
//! All timestamps are epoch milliseconds.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Lifecycle state of a segment.
///
/// A segment is visible to readers only once it is `Complete` with a verified
/// non-zero size. `Pending` is a promise, not a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Pending,
    Complete,
    Failed,
}

/// Why a segment was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    Continuous,
    Motion,
}

/// Which storage root currently holds the segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageTier {
    Hot,
    Cold,
}

/// The atomic recorded unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub camera_id: String,
    pub start_ts: i64,
    /// End timestamp; 0 means still open / unknown.
    pub end_ts: i64,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// SHA-256 of the file contents, set when the segment completes.
    pub checksum: Option<String>,
    pub status: SegmentStatus,
    pub kind: SegmentKind,
    pub tier: StorageTier,
}

impl Segment {
    /// Canonical segment id: `<cameraId>_<startTs>`.
    pub fn make_id(camera_id: &str, start_ts: i64) -> String {
        format!("{}_{}", camera_id, start_ts)
    }

    /// A freshly announced segment, not yet verified.
    pub fn pending(
        camera_id: &str,
        start_ts: i64,
        end_ts: i64,
        path: PathBuf,
        kind: SegmentKind,
    ) -> Self {
        Self {
            id: Self::make_id(camera_id, start_ts),
            camera_id: camera_id.to_string(),
            start_ts,
            end_ts,
            path,
            size_bytes: 0,
            checksum: None,
            status: SegmentStatus::Pending,
            kind,
            tier: StorageTier::Hot,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_ts - self.start_ts).max(0)
    }
}

/// Relative path for a segment starting at `start_ts`, under a camera root.
pub fn segment_rel_path(start_ts: i64) -> PathBuf {
    let (y, mo, d, h, mi, s) = utc_parts(start_ts);
    PathBuf::from(format!(
        "{:04}/{:02}/{:02}/{:02}/{:02}-{:02}.mp4",
        y, mo, d, h, mi, s
    ))
}

/// Absolute path for a camera's segment under a storage root.
pub fn segment_path(root: &Path, camera_id: &str, start_ts: i64) -> PathBuf {
    root.join(camera_id).join(segment_rel_path(start_ts))
}

/// Epoch millisecond timestamp of the UTC midnight containing `ts`.
pub fn day_start_ms(ts: i64) -> i64 {
    ts - ts.rem_euclid(86_400_000)
}

/// Split an epoch-ms timestamp into UTC (year, month, day, hour, minute, second).
pub fn utc_parts(ms: i64) -> (i32, u32, u32, u32, u32, u32) {
    let secs = ms.div_euclid(1000);
    let days = secs.div_euclid(86_400);
    let tod = secs.rem_euclid(86_400);
    let (y, m, d) = civil_from_days(days);
    (
        y,
        m,
        d,
        (tod / 3600) as u32,
        ((tod % 3600) / 60) as u32,
        (tod % 60) as u32,
    )
}

// Days-since-epoch to proleptic Gregorian calendar date.
fn civil_from_days(z: i64) -> (i32, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y as i32, m, d)
}
