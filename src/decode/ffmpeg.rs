//! FFmpeg backend (feature: rtsp-ffmpeg).
//!
//! Opens any transport libavformat understands (RTSP, HTTP, files), decodes the first
//! video stream with libavcodec and converts pictures to RGB24 with libswscale.
//! The session's `CancelToken` is installed as the format context's interrupt
//! callback, so a close aborts a blocking connect or read from inside FFmpeg.

use anyhow::{anyhow, bail, Context, Result};
use ffmpeg_next as ffmpeg;

use super::{MediaBackend, MediaInput, MediaKind, Picture, PixelScaler, StreamInfo, VideoDecoder};
use crate::cancel::CancelToken;
use crate::frame::{Dimensions, CHANNELS};

/// Backend over the system FFmpeg libraries.
///
/// Creating it performs the process-wide FFmpeg and network initialization; dropping
/// the last instance releases the network layer again.
#[derive(Debug)]
pub struct FfmpegBackend {
    _network: (),
}

impl FfmpegBackend {
    pub fn new() -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        ffmpeg::format::network::init();
        Ok(Self { _network: () })
    }

    /// Set FFmpeg's own log verbosity by name (`quiet`, `error`, `warning`, `info`,
    /// `debug`, ...).
    pub fn set_log_level(&self, level: &str) -> Result<()> {
        use ffmpeg::util::log::Level;
        let level = match level.to_ascii_lowercase().as_str() {
            "quiet" => Level::Quiet,
            "panic" => Level::Panic,
            "fatal" => Level::Fatal,
            "error" => Level::Error,
            "warning" | "warn" => Level::Warning,
            "info" => Level::Info,
            "verbose" => Level::Verbose,
            "debug" => Level::Debug,
            "trace" => Level::Trace,
            other => bail!("unknown ffmpeg log level '{}'", other),
        };
        ffmpeg::util::log::set_level(level);
        Ok(())
    }
}

impl Drop for FfmpegBackend {
    fn drop(&mut self) {
        ffmpeg::format::network::deinit();
    }
}

impl MediaBackend for FfmpegBackend {
    type Input = FfmpegInput;

    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open_input(&self, uri: &str, cancel: &CancelToken) -> Result<FfmpegInput> {
        let interrupt = cancel.clone();
        let input = ffmpeg::format::input_with_interrupt(&uri, move || interrupt.is_cancelled())
            .with_context(|| format!("failed to open '{}' with ffmpeg", super::redact_uri(uri)))?;
        Ok(FfmpegInput { input })
    }
}

/// An opened libavformat input.
pub struct FfmpegInput {
    input: ffmpeg::format::context::Input,
}

impl MediaInput for FfmpegInput {
    type Packet = ffmpeg::Packet;
    type Decoder = FfmpegDecoder;

    fn streams(&self) -> Vec<StreamInfo> {
        self.input
            .streams()
            .map(|stream| {
                let parameters = stream.parameters();
                let kind = match parameters.medium() {
                    ffmpeg::media::Type::Video => MediaKind::Video,
                    ffmpeg::media::Type::Audio => MediaKind::Audio,
                    ffmpeg::media::Type::Data => MediaKind::Data,
                    _ => MediaKind::Other,
                };
                StreamInfo {
                    index: stream.index(),
                    kind,
                    codec: parameters.id().name().to_string(),
                }
            })
            .collect()
    }

    fn open_decoder(&mut self, stream: &StreamInfo) -> Result<FfmpegDecoder> {
        let input_stream = self
            .input
            .stream(stream.index)
            .ok_or_else(|| anyhow!("stream #{} disappeared", stream.index))?;
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .with_context(|| format!("open ffmpeg decoder for codec '{}'", stream.codec))?;
        Ok(FfmpegDecoder { decoder })
    }

    fn read_packet(&mut self) -> Result<Option<(usize, ffmpeg::Packet)>> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => Ok(Some((packet.stream(), packet))),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(err) => Err(anyhow::Error::new(err).context("read packet from transport")),
        }
    }
}

/// libavcodec video decoder.
pub struct FfmpegDecoder {
    decoder: ffmpeg::codec::decoder::Video,
}

impl VideoDecoder for FfmpegDecoder {
    type Packet = ffmpeg::Packet;
    type Picture = ffmpeg::frame::Video;
    type Scaler = FfmpegScaler;

    fn send_packet(&mut self, packet: &ffmpeg::Packet) -> Result<()> {
        self.decoder
            .send_packet(packet)
            .context("send packet to ffmpeg decoder")
    }

    fn receive_picture(&mut self) -> Result<Option<ffmpeg::frame::Video>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        match self.decoder.receive_frame(&mut decoded) {
            Ok(()) => Ok(Some(decoded)),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => Ok(None),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(err) => Err(anyhow::Error::new(err).context("receive frame from ffmpeg decoder")),
        }
    }

    fn scaler(&self, source: &ffmpeg::frame::Video, target: Dimensions) -> Result<FfmpegScaler> {
        use ffmpeg::software::scaling::flag::Flags;
        let context = ffmpeg::software::scaling::context::Context::get(
            source.format(),
            source.width(),
            source.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            target.width,
            target.height,
            Flags::FAST_BILINEAR | Flags::FULL_CHR_H_INT | Flags::ACCURATE_RND,
        )
        .context("create ffmpeg scaler")?;
        Ok(FfmpegScaler {
            context,
            target,
            rgb: ffmpeg::frame::Video::empty(),
        })
    }
}

impl Picture for ffmpeg::frame::Video {
    fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width(), self.height())
    }
}

/// libswscale conversion into a reusable RGB24 frame.
pub struct FfmpegScaler {
    context: ffmpeg::software::scaling::context::Context,
    target: Dimensions,
    rgb: ffmpeg::frame::Video,
}

impl PixelScaler for FfmpegScaler {
    type Picture = ffmpeg::frame::Video;

    fn scale(&mut self, picture: &ffmpeg::frame::Video, out: &mut [u8]) -> Result<()> {
        self.context
            .run(picture, &mut self.rgb)
            .context("scale frame to RGB")?;
        copy_packed_rows(&self.rgb, self.target, out)
    }
}

/// Copy an RGB24 frame into a packed buffer, dropping per-row padding.
fn copy_packed_rows(frame: &ffmpeg::frame::Video, target: Dimensions, out: &mut [u8]) -> Result<()> {
    let row_bytes = target.width as usize * CHANNELS;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if out.len() != target.byte_len() {
        bail!(
            "output buffer is {} bytes, expected {}",
            out.len(),
            target.byte_len()
        );
    }
    if stride == row_bytes {
        let plane = data
            .get(..out.len())
            .context("ffmpeg frame is smaller than its dimensions")?;
        out.copy_from_slice(plane);
        return Ok(());
    }

    for (row, dst) in out.chunks_exact_mut(row_bytes).enumerate() {
        let start = row * stride;
        let src = data
            .get(start..start + row_bytes)
            .context("ffmpeg frame row is out of bounds")?;
        dst.copy_from_slice(src);
    }
    Ok(())
}
