//! Capture process management.
//!
//! One OS process per camera writes fixed-duration segment files into the
//! hierarchical layout and reports each segment boundary on a line-oriented
//! status stream. A dedicated reader task per process parses those lines into
//! discrete [`SegmentClosed`] events on a channel, decoupling subprocess I/O
//! timing from journal and index mutation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::config::CameraDescriptor;
use crate::segment::now_ms;

/// A segment boundary reported by a capture process as it closes a file.
#[derive(Debug, Clone)]
pub struct SegmentClosed {
    pub camera_id: String,
    pub path: PathBuf,
    pub start_ts: i64,
    pub end_ts: i64,
}

/// A running capture process, as the supervisor sees it.
#[async_trait]
pub trait CaptureProcess: Send + Sync {
    /// Hard kill. Safe to call on an already-dead process.
    async fn kill(&self);
    /// True while the underlying process is alive.
    async fn is_running(&self) -> bool;
}

/// Spawns capture processes. Seamed as a trait so tests can drive the
/// supervisor with scripted fakes instead of real encoders.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn spawn(
        &self,
        camera: &CameraDescriptor,
        camera_root: &Path,
        events: mpsc::Sender<SegmentClosed>,
    ) -> Result<Arc<dyn CaptureProcess>>;
}

/// Translates the capture process's segment-list lines into epoch-ms
/// boundaries.
///
/// Lines are `<relative-path>,<start-secs>,<end-secs>` with stream-relative
/// times. The offset between stream time and the wall clock is captured from
/// the first line (wall clock minus reported end) and applied to every
/// boundary after it, the same sync the list format forces on any consumer.
#[derive(Debug, Default)]
pub struct BoundaryParser {
    epoch_offset_ms: Option<i64>,
}

impl BoundaryParser {
    pub fn parse(&mut self, line: &str, wall_now_ms: i64) -> Option<(String, i64, i64)> {
        let mut parts = line.trim().splitn(3, ',');
        let file = parts.next()?.trim();
        let start_secs: f64 = parts.next()?.trim().parse().ok()?;
        let end_secs: f64 = parts.next()?.trim().parse().ok()?;
        if file.is_empty() || end_secs < start_secs {
            return None;
        }

        let offset = *self
            .epoch_offset_ms
            .get_or_insert_with(|| wall_now_ms - (end_secs * 1000.0) as i64);

        let start_ts = offset + (start_secs * 1000.0) as i64;
        let end_ts = offset + (end_secs * 1000.0) as i64;
        Some((file.to_string(), start_ts, end_ts))
    }
}

/// Real capture backend: an ffmpeg segmenter per camera.
pub struct FfmpegCapture {
    pub segment_secs: u32,
}

struct FfmpegProcess {
    camera_id: String,
    child: Mutex<Child>,
}

#[async_trait]
impl CaptureProcess for FfmpegProcess {
    async fn kill(&self) {
        let mut child = self.child.lock().await;
        // SIGKILL, not graceful: a silent writer holds the camera's capacity
        if let Err(e) = child.start_kill() {
            debug!(camera = %self.camera_id, error = %e, "kill on exited capture process");
        }
        let _ = child.wait().await;
    }

    async fn is_running(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }
}

impl FfmpegCapture {
    fn args(&self, source: &str, camera_root: &Path) -> Vec<String> {
        let pattern = camera_root.join("%Y/%m/%d/%H/%M-%S.mp4");
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-nostdin".into(),
            "-rtsp_transport".into(),
            "tcp".into(),
            "-i".into(),
            source.into(),
            "-an".into(),
            "-c:v".into(),
            "copy".into(),
            "-map".into(),
            "0:v:0".into(),
            "-f".into(),
            "segment".into(),
            "-segment_time".into(),
            self.segment_secs.to_string(),
            "-segment_atclocktime".into(),
            "1".into(),
            "-reset_timestamps".into(),
            "1".into(),
            "-strftime".into(),
            "1".into(),
            "-segment_format".into(),
            "mp4".into(),
            "-movflags".into(),
            "+faststart+frag_keyframe+empty_moov".into(),
            "-segment_list".into(),
            "pipe:1".into(),
            "-segment_list_type".into(),
            "csv".into(),
            "-segment_list_flags".into(),
            "+live".into(),
            pattern.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl CaptureBackend for FfmpegCapture {
    async fn spawn(
        &self,
        camera: &CameraDescriptor,
        camera_root: &Path,
        events: mpsc::Sender<SegmentClosed>,
    ) -> Result<Arc<dyn CaptureProcess>> {
        // pre-create the current hour's directory so the segmenter never
        // races directory creation on its first file
        let (y, mo, d, h, ..) = crate::segment::utc_parts(now_ms());
        std::fs::create_dir_all(camera_root.join(format!("{:04}/{:02}/{:02}/{:02}", y, mo, d, h)))
            .with_context(|| format!("failed to create capture directory for {}", camera.id))?;

        let mut child = Command::new("ffmpeg")
            .args(self.args(&camera.source, camera_root))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn capture for {}", camera.id))?;

        let stdout = child
            .stdout
            .take()
            .context("capture process has no stdout")?;

        // boundary reader: one task per process, feeding the shared channel
        let camera_id = camera.id.clone();
        let root = camera_root.to_path_buf();
        tokio::spawn(async move {
            let mut parser = BoundaryParser::default();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some((file, start_ts, end_ts)) = parser.parse(&line, now_ms()) else {
                    debug!(camera = %camera_id, line = %line, "unparseable boundary line");
                    continue;
                };
                let event = SegmentClosed {
                    camera_id: camera_id.clone(),
                    path: root.join(file),
                    start_ts,
                    end_ts,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            info!(camera = %camera_id, "capture status stream closed");
        });

        info!(camera = %camera.id, "capture process started");
        Ok(Arc::new(FfmpegProcess {
            camera_id: camera.id.clone(),
            child: Mutex::new(child),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_parser_syncs_to_wall_clock_on_first_line() {
        let mut parser = BoundaryParser::default();
        let wall = 1_700_000_100_000;

        // first boundary: stream time 0..5s closed at wall time
        let (file, start, end) = parser.parse("2024/01/15/10/00-00.mp4,0.0,5.0", wall).unwrap();
        assert_eq!(file, "2024/01/15/10/00-00.mp4");
        assert_eq!(end, wall);
        assert_eq!(start, wall - 5_000);

        // later boundaries reuse the captured offset, ignoring current wall time
        let (_, start, end) = parser
            .parse("2024/01/15/10/00-05.mp4,5.0,10.0", wall + 99_999)
            .unwrap();
        assert_eq!(start, wall);
        assert_eq!(end, wall + 5_000);
    }

    #[test]
    fn boundary_parser_rejects_malformed_lines() {
        let mut parser = BoundaryParser::default();
        assert!(parser.parse("", 0).is_none());
        assert!(parser.parse("only-a-file.mp4", 0).is_none());
        assert!(parser.parse("f.mp4,notanumber,5.0", 0).is_none());
        assert!(parser.parse("f.mp4,9.0,5.0", 0).is_none());
        assert!(parser.parse(",0.0,5.0", 0).is_none());
    }

    #[test]
    fn ffmpeg_args_carry_segmenter_contract() {
        let backend = FfmpegCapture { segment_secs: 5 };
        let args = backend.args("rtsp://10.0.0.5/main", Path::new("/store/cam1"));
        let joined = args.join(" ");
        assert!(joined.contains("-segment_time 5"));
        assert!(joined.contains("-segment_list pipe:1"));
        assert!(joined.contains("/store/cam1/%Y/%m/%d/%H/%M-%S.mp4"));
        assert!(joined.contains("-c:v copy"));
    }
}
