//! Decode backends and the per-session decode worker.
//!
//! The demuxing, decoding and pixel conversion themselves come from an external
//! library. This module describes that library as a small set of traits, from the
//! transport down to the scaler:
//!
//! - `MediaBackend` opens a transport by URI (process-wide, shared by all sessions);
//! - `MediaInput` lists elementary streams, opens a decoder, reads packets;
//! - `VideoDecoder` turns packets into pictures and builds scalers;
//! - `PixelScaler` converts a picture into packed RGB24 at the output size.
//!
//! Everything below `MediaBackend` is created and dropped on the worker thread, so
//! library handles need not be `Send`. Backends must consult the `CancelToken` they
//! are given inside every call that can block; that is the only way a close can
//! interrupt a stalled transport.
//!
//! Backends:
//! - `SyntheticBackend` for `stub://` URIs (tests, demos)
//! - `FfmpegBackend` (feature: rtsp-ffmpeg)

#[cfg(feature = "rtsp-ffmpeg")]
pub mod ffmpeg;
pub mod synthetic;
pub(crate) mod worker;

use anyhow::Result;

use crate::cancel::CancelToken;
use crate::frame::Dimensions;

#[cfg(feature = "rtsp-ffmpeg")]
pub use self::ffmpeg::FfmpegBackend;
pub use synthetic::SyntheticBackend;

/// Kind of an elementary stream inside a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    Data,
    Other,
}

/// One elementary stream of an opened transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    /// Index used to tag the stream's packets.
    pub index: usize,
    pub kind: MediaKind,
    /// Codec name as reported by the backend (for logs only).
    pub codec: String,
}

/// Process-wide entry point of a decoding library.
pub trait MediaBackend: Send + Sync + 'static {
    type Input: MediaInput;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Open the transport at `uri` and probe its streams.
    ///
    /// May block on the network; must give up promptly once `cancel` is set. The
    /// token may be retained by the input for its later blocking calls.
    fn open_input(&self, uri: &str, cancel: &CancelToken) -> Result<Self::Input>;
}

/// An opened transport.
pub trait MediaInput {
    type Packet;
    type Decoder: VideoDecoder<Packet = Self::Packet>;

    /// Elementary streams in transport order.
    fn streams(&self) -> Vec<StreamInfo>;

    /// Resolve and open a decoder for `stream`.
    fn open_decoder(&mut self, stream: &StreamInfo) -> Result<Self::Decoder>;

    /// Read the next demuxed packet with its stream index. `Ok(None)` at end of stream.
    fn read_packet(&mut self) -> Result<Option<(usize, Self::Packet)>>;
}

/// Decoder for one video stream.
pub trait VideoDecoder {
    type Packet;
    type Picture: Picture;
    type Scaler: PixelScaler<Picture = Self::Picture>;

    fn send_packet(&mut self, packet: &Self::Packet) -> Result<()>;

    /// Next complete picture. `Ok(None)` when the decoder needs more input.
    fn receive_picture(&mut self) -> Result<Option<Self::Picture>>;

    /// Build a scaler from pictures shaped like `source` to packed RGB24 at `target`.
    fn scaler(&self, source: &Self::Picture, target: Dimensions) -> Result<Self::Scaler>;
}

/// A decoded picture in the library's native pixel format.
pub trait Picture {
    fn dimensions(&self) -> Dimensions;
}

/// Converts decoded pictures to the fixed output layout.
pub trait PixelScaler {
    type Picture;

    /// Write `picture` as packed RGB24 into `out`, which is exactly
    /// `target.byte_len()` bytes, rows top to bottom without padding.
    fn scale(&mut self, picture: &Self::Picture, out: &mut [u8]) -> Result<()>;
}

/// Strip credentials from a stream URI before it is logged.
///
/// Camera URIs commonly embed `user:password@`; anything unparsable is returned
/// unchanged.
pub fn redact_uri(uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("***")).is_err() {
                return uri.to_string();
            }
            parsed.to_string()
        }
        _ => uri.to_string(),
    }
}
