//! Capture supervision.
//!
//! For every enabled camera the supervisor keeps exactly one capture process
//! running, but only after the connectivity gate proves the source reachable,
//! and kills it fast if it stops producing confirmed writes. Cameras are
//! fully independent: one camera's probe, spawn or death never touches
//! another's process.

pub mod capture;
pub mod probe;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CameraDescriptor, RecordingMode, SupervisorConfig};
use crate::index::TimeIndex;
use crate::journal::SegmentJournal;
use crate::segment::{now_ms, Segment, SegmentKind};

pub use capture::{
    BoundaryParser, CaptureBackend, CaptureProcess, FfmpegCapture, SegmentClosed,
};
pub use probe::{CachedProbe, ConnectivityProbe, TcpProbe};

/// Periodic functional-proof record for external health consumers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthSnapshot {
    pub active_writers: usize,
    pub suspended_cameras: usize,
    pub total_cameras: usize,
    pub timestamp: i64,
}

/// In-memory per-camera recording state. Rebuilt from config on restart,
/// never persisted.
struct CameraState {
    descriptor: CameraDescriptor,
    process: Option<Arc<dyn CaptureProcess>>,
    last_confirmed_write: Instant,
    suspended: bool,
}

/// Per-camera reconciliation loop: gates spawns behind the connectivity
/// probe, registers confirmed segments with the journal, and watchdogs
/// running processes for real-write silence.
pub struct CaptureSupervisor {
    config: SupervisorConfig,
    hot_root: PathBuf,
    probe: Arc<CachedProbe>,
    backend: Arc<dyn CaptureBackend>,
    journal: Arc<SegmentJournal>,
    index: Arc<TimeIndex>,
    states: Mutex<HashMap<String, CameraState>>,
    events_tx: mpsc::Sender<SegmentClosed>,
    spawns: AtomicU64,
}

impl CaptureSupervisor {
    /// Returns the supervisor and the boundary-event receiver that must be
    /// fed to [`CaptureSupervisor::run_ingest`].
    pub fn new(
        config: SupervisorConfig,
        hot_root: PathBuf,
        probe: Arc<dyn ConnectivityProbe>,
        backend: Arc<dyn CaptureBackend>,
        journal: Arc<SegmentJournal>,
        index: Arc<TimeIndex>,
    ) -> (Arc<Self>, mpsc::Receiver<SegmentClosed>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let cached = Arc::new(CachedProbe::new(probe, config.probe_cache_ttl));
        let supervisor = Arc::new(Self {
            config,
            hot_root,
            probe: cached,
            backend,
            journal,
            index,
            states: Mutex::new(HashMap::new()),
            events_tx,
            spawns: AtomicU64::new(0),
        });
        (supervisor, events_rx)
    }

    /// One reconciliation pass against the desired camera list.
    ///
    /// Never fails: probe failures suspend the camera for the next tick,
    /// spawn failures are logged, and nothing here can crash the supervisor.
    pub async fn reconcile(&self, cameras: &[CameraDescriptor]) {
        let desired: HashMap<&str, &CameraDescriptor> = cameras
            .iter()
            .filter(|c| c.enabled)
            .map(|c| (c.id.as_str(), c))
            .collect();

        // stop cameras no longer desired
        let dropped: Vec<(String, CameraState)> = {
            let mut states = self.states.lock().await;
            let ids: Vec<String> = states
                .keys()
                .filter(|id| !desired.contains_key(id.as_str()))
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| states.remove(&id).map(|st| (id, st)))
                .collect()
        };
        for (id, state) in dropped {
            if let Some(process) = state.process {
                info!(camera = %id, "camera disabled, stopping capture");
                process.kill().await;
            }
            self.probe.forget(&id).await;
        }

        // clear exited processes and collect cameras that need the gate
        let mut candidates: Vec<CameraDescriptor> = Vec::new();
        {
            let mut states = self.states.lock().await;
            for (&id, &camera) in &desired {
                match states.get_mut(id) {
                    Some(state) => {
                        state.descriptor = camera.clone();
                        if let Some(process) = &state.process {
                            if !process.is_running().await {
                                info!(camera = %id, "capture process exited");
                                state.process = None;
                            }
                        }
                        if state.process.is_none() {
                            candidates.push(camera.clone());
                        }
                    }
                    None => {
                        states.insert(
                            id.to_string(),
                            CameraState {
                                descriptor: camera.clone(),
                                process: None,
                                last_confirmed_write: Instant::now(),
                                suspended: false,
                            },
                        );
                        candidates.push(camera.clone());
                    }
                }
            }
        }

        // probe candidates concurrently; one slow camera must not block the rest
        let mut probes = JoinSet::new();
        for camera in candidates {
            let probe = self.probe.clone();
            probes.spawn(async move {
                let ready = probe.check(&camera).await;
                (camera, ready)
            });
        }

        while let Some(result) = probes.join_next().await {
            let Ok((camera, ready)) = result else {
                continue;
            };
            if ready {
                self.spawn_camera(&camera).await;
            } else {
                debug!(camera = %camera.id, "connectivity gate failed, camera suspended");
                let mut states = self.states.lock().await;
                if let Some(state) = states.get_mut(&camera.id) {
                    state.suspended = true;
                }
            }
        }
    }

    async fn spawn_camera(&self, camera: &CameraDescriptor) {
        // unclean-shutdown artifacts would produce duplicate or out-of-order
        // entries once the new process starts writing
        let stale = self.index.purge_future(&camera.id, now_ms()).await;
        for segment in stale {
            if let Err(e) = std::fs::remove_file(&segment.path) {
                warn!(camera = %camera.id, path = ?segment.path, error = %e,
                    "failed to delete future-dated segment file");
            }
        }

        let camera_root = self.hot_root.join(&camera.id);
        match self
            .backend
            .spawn(camera, &camera_root, self.events_tx.clone())
            .await
        {
            Ok(process) => {
                self.spawns.fetch_add(1, Ordering::Relaxed);
                let mut states = self.states.lock().await;
                if let Some(state) = states.get_mut(&camera.id) {
                    state.process = Some(process);
                    state.suspended = false;
                    state.last_confirmed_write = Instant::now();
                }
                info!(camera = %camera.id, "capture started");
            }
            Err(e) => {
                warn!(camera = %camera.id, error = %e, "capture spawn failed");
                let mut states = self.states.lock().await;
                if let Some(state) = states.get_mut(&camera.id) {
                    state.suspended = true;
                }
            }
        }
    }

    /// Fail-fast watchdog pass: hard-kill any running capture that has not
    /// confirmed a write within the silence limit. Returns the kill count.
    ///
    /// A process that already exited on its own is cleared without a second
    /// kill.
    pub async fn watchdog_tick(&self) -> usize {
        let mut victims: Vec<(String, Arc<dyn CaptureProcess>)> = Vec::new();
        {
            let mut states = self.states.lock().await;
            for (id, state) in states.iter_mut() {
                if state.last_confirmed_write.elapsed() > self.config.silence_limit {
                    if let Some(process) = state.process.take() {
                        state.suspended = true;
                        victims.push((id.clone(), process));
                    }
                }
            }
        }

        let mut killed = 0;
        for (id, process) in victims {
            if process.is_running().await {
                warn!(camera = %id, "no confirmed writes within silence limit, killing capture");
                process.kill().await;
                killed += 1;
            } else {
                info!(camera = %id, "silent capture already exited");
            }
        }
        killed
    }

    /// Consume boundary events: confirm the write, then run the journal's
    /// pre/post-write so the segment becomes a durable, queryable fact.
    pub async fn run_ingest(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SegmentClosed>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Some(event) => self.ingest(event).await,
                        None => break,
                    }
                }
            }
        }
        info!("segment ingest stopped");
    }

    async fn ingest(&self, event: SegmentClosed) {
        let kind = {
            let mut states = self.states.lock().await;
            match states.get_mut(&event.camera_id) {
                Some(state) => {
                    state.last_confirmed_write = Instant::now();
                    match state.descriptor.mode {
                        RecordingMode::Motion => SegmentKind::Motion,
                        RecordingMode::Continuous => SegmentKind::Continuous,
                    }
                }
                // late event from a camera already removed; still record it
                None => SegmentKind::Continuous,
            }
        };

        let segment = Segment::pending(
            &event.camera_id,
            event.start_ts,
            event.end_ts,
            event.path,
            kind,
        );
        if let Err(e) = self.journal.pre_write(&segment) {
            // the one loud failure: an unwritable journal voids crash recovery
            error!(segment = %segment.id, error = %e, "journal store unwritable");
            return;
        }
        match self.journal.post_write(&segment.id, &self.index).await {
            Ok(Some(_)) => {}
            Ok(None) => warn!(segment = %segment.id, "segment failed verification"),
            Err(e) => warn!(segment = %segment.id, error = %e, "segment verification deferred"),
        }
    }

    pub async fn health(&self) -> HealthSnapshot {
        let states = self.states.lock().await;
        HealthSnapshot {
            active_writers: states.values().filter(|s| s.process.is_some()).count(),
            suspended_cameras: states.values().filter(|s| s.suspended).count(),
            total_cameras: states.len(),
            timestamp: now_ms(),
        }
    }

    /// Total capture spawns since startup (gate-enforcement observable).
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    /// Kill every running capture. Called once at shutdown.
    pub async fn shutdown(&self) {
        let processes: Vec<Arc<dyn CaptureProcess>> = {
            let mut states = self.states.lock().await;
            states.values_mut().filter_map(|s| s.process.take()).collect()
        };
        for process in processes {
            process.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tempfile::tempdir;

    struct FakeProcess {
        alive: AtomicBool,
        kills: AtomicUsize,
    }

    #[async_trait]
    impl CaptureProcess for Arc<FakeProcess> {
        async fn kill(&self) {
            self.alive.store(false, Ordering::SeqCst);
            self.kills.fetch_add(1, Ordering::SeqCst);
        }

        async fn is_running(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        spawned: Mutex<Vec<Arc<FakeProcess>>>,
    }

    #[async_trait]
    impl CaptureBackend for FakeBackend {
        async fn spawn(
            &self,
            _camera: &CameraDescriptor,
            _camera_root: &Path,
            _events: mpsc::Sender<SegmentClosed>,
        ) -> anyhow::Result<Arc<dyn CaptureProcess>> {
            let process = Arc::new(FakeProcess {
                alive: AtomicBool::new(true),
                kills: AtomicUsize::new(0),
            });
            self.spawned.lock().await.push(process.clone());
            Ok(Arc::new(process))
        }
    }

    struct FixedProbe(bool);

    #[async_trait]
    impl ConnectivityProbe for FixedProbe {
        async fn probe(&self, _camera: &CameraDescriptor) -> bool {
            self.0
        }
    }

    fn camera(id: &str) -> CameraDescriptor {
        CameraDescriptor {
            id: id.to_string(),
            enabled: true,
            source: format!("rtsp://10.0.0.5/{}", id),
            mode: RecordingMode::Continuous,
        }
    }

    fn supervisor(
        probe_ok: bool,
        silence_limit: std::time::Duration,
    ) -> (Arc<CaptureSupervisor>, Arc<FakeBackend>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let journal = Arc::new(SegmentJournal::new(dir.path().join("journal")).unwrap());
        let index = Arc::new(TimeIndex::new());
        let config = SupervisorConfig {
            silence_limit,
            probe_cache_ttl: std::time::Duration::from_millis(0),
            ..Default::default()
        };
        let (sup, _events) = CaptureSupervisor::new(
            config,
            dir.path().join("storage"),
            Arc::new(FixedProbe(probe_ok)),
            backend.clone(),
            journal,
            index,
        );
        (sup, backend, dir)
    }

    // ========== Gate enforcement ==========

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_probe_never_spawns_and_stays_suspended() {
        let (sup, backend, _dir) = supervisor(false, std::time::Duration::from_secs(10));
        let cams = vec![camera("c1"), camera("c2")];

        for _ in 0..5 {
            sup.reconcile(&cams).await;
        }

        assert_eq!(sup.spawn_count(), 0);
        assert!(backend.spawned.lock().await.is_empty());
        let health = sup.health().await;
        assert_eq!(health.active_writers, 0);
        assert_eq!(health.suspended_cameras, 2);
        assert_eq!(health.total_cameras, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn passing_probe_spawns_exactly_one_process() {
        let (sup, backend, _dir) = supervisor(true, std::time::Duration::from_secs(10));
        let cams = vec![camera("c1")];

        sup.reconcile(&cams).await;
        sup.reconcile(&cams).await;

        // second tick sees a running process and does not respawn
        assert_eq!(sup.spawn_count(), 1);
        assert_eq!(backend.spawned.lock().await.len(), 1);
        assert_eq!(sup.health().await.active_writers, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_camera_is_stopped_and_cleared() {
        let (sup, backend, _dir) = supervisor(true, std::time::Duration::from_secs(10));

        sup.reconcile(&[camera("c1")]).await;
        assert_eq!(sup.health().await.active_writers, 1);

        let mut disabled = camera("c1");
        disabled.enabled = false;
        sup.reconcile(&[disabled]).await;

        let health = sup.health().await;
        assert_eq!(health.total_cameras, 0);
        let procs = backend.spawned.lock().await;
        assert!(!procs[0].alive.load(Ordering::SeqCst));
    }

    // ========== Fail-fast watchdog ==========

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_writer_is_killed_exactly_once() {
        let (sup, backend, _dir) = supervisor(true, std::time::Duration::from_millis(0));

        sup.reconcile(&[camera("c1")]).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert_eq!(sup.watchdog_tick().await, 1);
        // handle already taken; a second tick must not double-kill
        assert_eq!(sup.watchdog_tick().await, 0);

        let procs = backend.spawned.lock().await;
        assert_eq!(procs[0].kills.load(Ordering::SeqCst), 1);
        drop(procs);

        let health = sup.health().await;
        assert_eq!(health.active_writers, 0);
        assert_eq!(health.suspended_cameras, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn already_dead_process_is_cleared_without_kill() {
        let (sup, backend, _dir) = supervisor(true, std::time::Duration::from_millis(0));

        sup.reconcile(&[camera("c1")]).await;
        backend.spawned.lock().await[0]
            .alive
            .store(false, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert_eq!(sup.watchdog_tick().await, 0);
        assert_eq!(
            backend.spawned.lock().await[0].kills.load(Ordering::SeqCst),
            0
        );
        assert_eq!(sup.health().await.suspended_cameras, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exited_process_reenters_gating_on_next_tick() {
        let (sup, backend, _dir) = supervisor(true, std::time::Duration::from_secs(10));
        let cams = vec![camera("c1")];

        sup.reconcile(&cams).await;
        backend.spawned.lock().await[0]
            .alive
            .store(false, Ordering::SeqCst);

        sup.reconcile(&cams).await;
        assert_eq!(sup.spawn_count(), 2);
        assert_eq!(sup.health().await.active_writers, 1);
    }
}
