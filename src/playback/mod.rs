//! Playback: resolve a (camera, time) request to segments, stream them
//! through a transcoder, and throttle the bytes to the stream's bitrate.

pub mod bucket;
pub mod pipeline;
pub mod resolve;

pub use bucket::LeakyBucket;
pub use pipeline::{PlaybackPipeline, PlaybackRequest, SessionStart, StreamFormat};
pub use resolve::{PlaybackResolver, Resolution, ResolvedWindow, MAX_SEGMENTS_PER_REQUEST};
