//! Vigil Server — headless NVR storage core
//!
//! Records every enabled camera into journaled segment files, ages footage
//! out under disk pressure, and keeps a playback session registry for
//! whatever serving layer sits on top.
//!
//! ## Usage
//!
//! ```bash
//! # Record cameras listed in cameras.json under /var/lib/vigil
//! VIGIL_BASE_PATH=/var/lib/vigil VIGIL_CAMERAS=./cameras.json vigil-server
//!
//! # Shorter segments
//! VIGIL_SEGMENT_SECS=2 vigil-server
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use vigil::retention::StatvfsGauge;
use vigil::supervisor::{FfmpegCapture, TcpProbe};
use vigil::{
    load_cameras, CaptureSupervisor, PlaybackConfig, PlaybackPipeline, PlaybackResolver,
    RetentionEngine, RetentionPolicy, SegmentJournal, StorageLayout, SupervisorConfig, TimeIndex,
};

/// Server configuration from environment
struct Config {
    base_path: PathBuf,
    cameras_path: PathBuf,
    segment_secs: u32,
    trigger_percent: f64,
    target_percent: f64,
}

impl Config {
    fn from_env() -> Self {
        let base_path = std::env::var("VIGIL_BASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./vigil-data"));

        let cameras_path = std::env::var("VIGIL_CAMERAS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./cameras.json"));

        let segment_secs: u32 = std::env::var("VIGIL_SEGMENT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let trigger_percent: f64 = std::env::var("VIGIL_PURGE_TRIGGER_PERCENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(85.0);

        let target_percent: f64 = std::env::var("VIGIL_PURGE_TARGET_PERCENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(75.0);

        Self {
            base_path,
            cameras_path,
            segment_secs,
            trigger_percent,
            target_percent,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();
    let layout = StorageLayout::under(&config.base_path);
    let retention_policy = RetentionPolicy {
        trigger_percent: config.trigger_percent,
        target_percent: config.target_percent,
        ..Default::default()
    };
    let supervisor_config = SupervisorConfig {
        segment_duration: Duration::from_secs(config.segment_secs as u64),
        ..Default::default()
    };
    let playback_config = PlaybackConfig::default();

    info!("Vigil Server starting");
    info!("  Base path: {:?}", config.base_path);
    info!("  Camera config: {:?}", config.cameras_path);
    info!("  Segment duration: {}s", config.segment_secs);
    info!(
        "  Purge: trigger {}%, target {}%",
        config.trigger_percent, config.target_percent
    );

    std::fs::create_dir_all(&layout.hot_root).context("failed to create storage root")?;
    std::fs::create_dir_all(&layout.cold_root).context("failed to create cold storage root")?;

    // Durable state first: replay the archive, then reconcile unconfirmed
    // segments. The index is queryable before any capture starts.
    let index = Arc::new(TimeIndex::new());
    let journal = Arc::new(SegmentJournal::new(&layout.journal_path)?);
    let restored = journal.rebuild_index(&index).await?;
    let recovery = journal.recover(&index).await?;
    info!(
        restored,
        recovered = recovery.recovered,
        failed = recovery.failed,
        deferred = recovery.deferred,
        "startup recovery complete"
    );

    let probe = Arc::new(TcpProbe {
        timeout: supervisor_config.probe_timeout,
    });
    let backend = Arc::new(FfmpegCapture {
        segment_secs: config.segment_secs,
    });
    let (supervisor, events) = CaptureSupervisor::new(
        supervisor_config.clone(),
        layout.hot_root.clone(),
        probe,
        backend,
        journal.clone(),
        index.clone(),
    );

    let retention = Arc::new(RetentionEngine::new(
        retention_policy.clone(),
        layout.clone(),
        index.clone(),
        Arc::new(StatvfsGauge {
            path: layout.hot_root.clone(),
        }),
    ));

    let playback = Arc::new(PlaybackPipeline::new(
        playback_config.clone(),
        PlaybackResolver::new(index.clone()),
    ));

    // Graceful shutdown
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Segment ingest
    tracker.spawn(supervisor.clone().run_ingest(events, cancel.clone()));

    // Reconciliation: re-read the camera list every tick so edits apply
    // without a restart
    {
        let supervisor = supervisor.clone();
        let cancel = cancel.clone();
        let cameras_path = config.cameras_path.clone();
        let mut tick = interval(supervisor_config.reconcile_interval);
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        match load_cameras(&cameras_path) {
                            Ok(cameras) => supervisor.reconcile(&cameras).await,
                            Err(e) => warn!(error = %e, "camera config unreadable, keeping last state"),
                        }
                    }
                }
            }
            info!("Reconcile loop: shutting down");
        });
    }

    // Watchdog
    {
        let supervisor = supervisor.clone();
        let cancel = cancel.clone();
        let mut tick = interval(supervisor_config.watchdog_interval);
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => { supervisor.watchdog_tick().await; }
                }
            }
            info!("Watchdog: shutting down");
        });
    }

    // Retention purge
    {
        let retention = retention.clone();
        let cancel = cancel.clone();
        let mut tick = interval(retention_policy.purge_interval);
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => { retention.check_and_purge().await; }
                }
            }
            info!("Retention loop: shutting down");
        });
    }

    // Hot-to-cold tiering
    {
        let retention = retention.clone();
        let cancel = cancel.clone();
        let mut tick = interval(retention_policy.tiering_interval);
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => { retention.run_tiering().await; }
                }
            }
            info!("Tiering loop: shutting down");
        });
    }

    // Playback session sweep
    {
        let playback = playback.clone();
        let cancel = cancel.clone();
        let mut tick = interval(playback_config.sweep_interval);
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => { playback.sweep().await; }
                }
            }
            info!("Playback sweep: shutting down");
        });
    }

    tracker.close();

    run_headless(supervisor, playback, cancel, tracker).await
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vigil=info".parse().unwrap()),
        )
        .init();
}

/// Headless mode: log health periodically, shut down on SIGINT
async fn run_headless(
    supervisor: Arc<CaptureSupervisor>,
    playback: Arc<PlaybackPipeline>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> Result<()> {
    info!("Recording");
    let mut health_interval = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                cancel.cancel();
                break;
            }
            _ = health_interval.tick() => {
                let health = supervisor.health().await;
                info!(
                    "Health: {}/{} writers active, {} suspended, {} playback sessions",
                    health.active_writers, health.total_cameras,
                    health.suspended_cameras, playback.active_sessions().await
                );
            }
        }
    }

    playback.stop_all().await;
    supervisor.shutdown().await;
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .is_err()
    {
        warn!("Shutdown timed out after 5s");
    }
    Ok(())
}
