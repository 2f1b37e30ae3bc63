//! RTSP frame grabber
//!
//! A small engine that keeps one decode thread per open video stream and exposes the
//! latest decoded frame of each stream through an integer handle.
//!
//! # Architecture
//!
//! - A fixed-capacity session table hands out the lowest free handle.
//! - Each session runs a worker that connects, selects the first video stream,
//!   decodes it and converts every picture to packed RGB24.
//! - The worker and the control thread share one mutex-guarded frame record per
//!   session holding the status, the dimensions and the latest pixels together.
//! - Closing sets a cancel flag that the backend also sees inside blocking calls, then
//!   waits a bounded time for the worker. Workers that miss the deadline are drained
//!   later instead of being killed.
//!
//! # Module Structure
//!
//! - `engine`: `StreamEngine`, the public handle-based API
//! - `session`: handles, sessions and the session table
//! - `frame`: `FrameRecord`, status and error kinds
//! - `decode`: backend traits, the decode worker, synthetic and FFmpeg backends
//! - `republish`: post-processing and publishing used by the `stream_grabber` binary
//! - `config`: engine limits and grabber settings

pub mod cancel;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod frame;
pub mod republish;
pub mod session;

pub use cancel::CancelToken;
pub use config::{EngineConfig, GrabberConfig};
#[cfg(feature = "rtsp-ffmpeg")]
pub use decode::FfmpegBackend;
pub use decode::{MediaBackend, SyntheticBackend};
pub use engine::{SessionStats, StreamEngine};
pub use error::EngineError;
pub use frame::{Dimensions, ErrorKind, Frame, FrameRecord, StreamStatus};
pub use session::table::CloseOutcome;
pub use session::Handle;
