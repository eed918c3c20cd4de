//! Storage core for a network video recorder.
//!
//! Continuous streams become bounded segment files through a write-ahead
//! journal, are tracked in a time index, aged out under disk pressure, and
//! served back as seekable playback streams. Everything here assumes cameras
//! disappear, processes wedge, disks fill, and the host loses power; the
//! recording loop keeps going anyway.

pub mod config;
pub mod index;
pub mod journal;
pub mod playback;
pub mod retention;
pub mod segment;
pub mod supervisor;

pub use config::{
    load_cameras, CameraDescriptor, PlaybackConfig, RecordingMode, RetentionPolicy,
    StorageLayout, SupervisorConfig,
};
pub use index::{Gap, TimeIndex};
pub use journal::{RecoveryReport, SegmentJournal};
pub use playback::{
    PlaybackPipeline, PlaybackRequest, PlaybackResolver, Resolution, SessionStart, StreamFormat,
};
pub use retention::{DiskGauge, PurgeReport, RetentionEngine, StatvfsGauge};
pub use segment::{Segment, SegmentKind, SegmentStatus, StorageTier};
pub use supervisor::{
    CaptureBackend, CaptureProcess, CaptureSupervisor, ConnectivityProbe, FfmpegCapture,
    HealthSnapshot, SegmentClosed, TcpProbe,
};
