//! Playback streaming sessions.
//!
//! A session concatenates resolved segments through one transcoder process
//! and throttles its output to the stream's nominal bitrate. The transcoder
//! only exists while its session does: stopping the session kills the
//! process, and a reaper sweep catches any process whose consumer vanished
//! without a stop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PlaybackConfig;
use crate::segment::Segment;

use super::bucket;
use super::resolve::{PlaybackResolver, Resolution};

/// Output container for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// Low-rate MJPEG multipart stream for scrubbing previews.
    Preview,
    /// MPEG-TS stream for continuous viewing.
    Continuous,
}

#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    pub camera_id: String,
    pub start_ts: i64,
    /// Window length; the configured default when absent.
    pub window_ms: Option<i64>,
    pub speed: f64,
    pub format: StreamFormat,
}

/// Result of a session start. No footage is an answer, not an error, and
/// costs no transcoder.
pub enum SessionStart {
    NoFootage,
    Streaming {
        session_id: String,
        data: mpsc::Receiver<Bytes>,
    },
}

struct SessionHandle {
    cancel: CancellationToken,
    done: Arc<AtomicBool>,
}

/// Session registry and transcoder lifecycle owner.
pub struct PlaybackPipeline {
    config: PlaybackConfig,
    resolver: PlaybackResolver,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl PlaybackPipeline {
    pub fn new(config: PlaybackConfig, resolver: PlaybackResolver) -> Self {
        Self {
            config,
            resolver,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the request and, if footage exists, start a transcoder session
    /// streaming throttled bytes on the returned channel.
    pub async fn start_session(&self, request: PlaybackRequest) -> Result<SessionStart> {
        let window_ms = request.window_ms.unwrap_or(self.config.default_window_ms);
        let window = match self
            .resolver
            .resolve(&request.camera_id, request.start_ts, window_ms)
            .await
        {
            Resolution::NoFootage => return Ok(SessionStart::NoFootage),
            Resolution::Playable(window) => window,
        };

        let session_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();

        let manifest = std::env::temp_dir().join(format!("vigil_concat_{}.txt", session_id));
        std::fs::write(&manifest, manifest_body(&window.segments))
            .with_context(|| format!("failed to write concat manifest {:?}", manifest))?;

        let args = transcode_args(
            &manifest,
            window.seek_offset_secs,
            request.speed,
            request.format,
        );
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn playback transcoder")?;
        let mut stdout = child.stdout.take().context("transcoder has no stdout")?;

        let cancel = CancellationToken::new();
        let done = Arc::new(AtomicBool::new(false));
        let (raw_tx, raw_rx) = mpsc::channel::<Bytes>(64);
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(64);

        // transcoder stdout -> raw channel
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(32 * 1024);
            loop {
                match stdout.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if raw_tx.send(buf.split().freeze()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // raw -> throttled output; when the pump ends (EOF or client gone)
        // the session is over either way
        {
            let cancel = cancel.clone();
            // faster-than-realtime playback needs proportionally more bytes
            let rate =
                (self.config.nominal_bitrate_bps as f64 / 8.0 * request.speed.max(0.1)) as u64;
            tokio::spawn(async move {
                bucket::pump(raw_rx, out_tx, rate).await;
                cancel.cancel();
            });
        }

        // process reaper: kill on cancel, clean up the manifest either way
        {
            let cancel = cancel.clone();
            let done = done.clone();
            let manifest = manifest.clone();
            let id = session_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = child.start_kill() {
                            debug!(session = %id, error = %e, "kill on exited transcoder");
                        }
                        let _ = child.wait().await;
                    }
                    _ = child.wait() => {}
                }
                if let Err(e) = std::fs::remove_file(&manifest) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(session = %id, error = %e, "failed to remove concat manifest");
                    }
                }
                done.store(true, Ordering::SeqCst);
                debug!(session = %id, "playback session finished");
            });
        }

        self.sessions.lock().await.insert(
            session_id.clone(),
            SessionHandle {
                cancel,
                done,
            },
        );
        info!(
            session = %session_id,
            camera = %request.camera_id,
            segments = window.segments.len(),
            seek = window.seek_offset_secs,
            "playback session started"
        );
        Ok(SessionStart::Streaming {
            session_id,
            data: out_rx,
        })
    }

    /// Stop a session and kill its transcoder. Unknown ids are a no-op, so
    /// double-stops are safe.
    pub async fn stop_session(&self, session_id: &str) {
        if let Some(handle) = self.sessions.lock().await.remove(session_id) {
            handle.cancel.cancel();
            info!(session = %session_id, "playback session stopped");
        }
    }

    /// Drop registry entries for sessions that ended on their own. Returns
    /// the number reaped.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, handle| !handle.done.load(Ordering::SeqCst));
        before - sessions.len()
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Cancel every session (shutdown path).
    pub async fn stop_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, handle) in sessions.drain() {
            handle.cancel.cancel();
        }
    }
}

/// Concat demuxer manifest body, one line per segment in playback order.
fn manifest_body(segments: &[Segment]) -> String {
    let mut body = String::new();
    for segment in segments {
        body.push_str(&format!("file '{}'\n", segment.path.display()));
    }
    body
}

fn transcode_args(
    manifest: &PathBuf,
    seek_offset_secs: f64,
    speed: f64,
    format: StreamFormat,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-nostdin".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-ss".into(),
        format!("{:.3}", seek_offset_secs),
        "-i".into(),
        manifest.to_string_lossy().into_owned(),
    ];
    if (speed - 1.0).abs() > f64::EPSILON {
        args.push("-vf".into());
        args.push(format!("setpts=PTS/{}", speed));
    }
    match format {
        StreamFormat::Preview => args.extend([
            "-an".into(),
            "-c:v".into(),
            "mjpeg".into(),
            "-q:v".into(),
            "7".into(),
            "-f".into(),
            "mpjpeg".into(),
            "pipe:1".into(),
        ]),
        StreamFormat::Continuous => args.extend([
            "-an".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-f".into(),
            "mpegts".into(),
            "pipe:1".into(),
        ]),
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TimeIndex;
    use crate::segment::{now_ms, SegmentKind, SegmentStatus, StorageTier};

    fn pipeline_with_empty_index() -> PlaybackPipeline {
        let resolver = PlaybackResolver::new(Arc::new(TimeIndex::new()));
        PlaybackPipeline::new(PlaybackConfig::default(), resolver)
    }

    #[tokio::test]
    async fn no_footage_starts_no_session() {
        let pipeline = pipeline_with_empty_index();
        let outcome = pipeline
            .start_session(PlaybackRequest {
                camera_id: "cam1".to_string(),
                start_ts: now_ms() - 3_600_000,
                window_ms: None,
                speed: 1.0,
                format: StreamFormat::Continuous,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, SessionStart::NoFootage));
        assert_eq!(pipeline.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn stop_unknown_session_is_a_no_op() {
        let pipeline = pipeline_with_empty_index();
        pipeline.stop_session("nope").await;
        pipeline.stop_session("nope").await;
        assert_eq!(pipeline.active_sessions().await, 0);
    }

    #[test]
    fn manifest_lists_segments_in_order() {
        let seg = |start: i64| Segment {
            id: Segment::make_id("cam1", start),
            camera_id: "cam1".to_string(),
            start_ts: start,
            end_ts: start + 5_000,
            path: PathBuf::from(format!("/store/cam1/{}.mp4", start)),
            size_bytes: 1,
            checksum: None,
            status: SegmentStatus::Complete,
            kind: SegmentKind::Continuous,
            tier: StorageTier::Hot,
        };
        let body = manifest_body(&[seg(1_000), seg(6_000)]);
        assert_eq!(
            body,
            "file '/store/cam1/1000.mp4'\nfile '/store/cam1/6000.mp4'\n"
        );
    }

    #[test]
    fn transcode_args_carry_seek_and_format() {
        let manifest = PathBuf::from("/tmp/m.txt");
        let args = transcode_args(&manifest, 4.0, 1.0, StreamFormat::Continuous);
        let joined = args.join(" ");
        assert!(joined.contains("-f concat -safe 0 -ss 4.000 -i /tmp/m.txt"));
        assert!(joined.contains("-f mpegts pipe:1"));
        assert!(!joined.contains("setpts"));

        let preview = transcode_args(&manifest, 0.0, 4.0, StreamFormat::Preview).join(" ");
        assert!(preview.contains("setpts=PTS/4"));
        assert!(preview.contains("-c:v mjpeg"));
        assert!(preview.contains("-f mpjpeg pipe:1"));
    }
}
