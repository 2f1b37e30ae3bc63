//! Per-session decode worker.
//!
//! Runs on its own thread for the whole life of a session:
//! 1. Open the transport
//! 2. Select the first video stream
//! 3. Open a decoder for it
//! 4. Prepare the conversion output (now, or on the first picture in native mode)
//! 5. Read, decode, convert and publish until end of stream, failure or close
//! 6. Drop every library handle, then mark the record `Error`
//!
//! The worker never waits for the consumer. Each converted frame overwrites the
//! record's single slot.

use anyhow::anyhow;
use std::sync::Arc;

use super::{redact_uri, MediaBackend, MediaInput, MediaKind, Picture, PixelScaler, VideoDecoder};
use crate::cancel::{CancelToken, Cancelled};
use crate::frame::{Dimensions, ErrorKind, FrameRecord};
use crate::session::Handle;

/// Everything a worker thread owns or shares with its session.
pub(crate) struct WorkerContext<B> {
    pub backend: Arc<B>,
    pub handle: Handle,
    pub uri: String,
    pub requested: Dimensions,
    pub record: Arc<FrameRecord>,
    pub cancel: CancelToken,
    /// Consecutive decode failures tolerated before the session fails.
    pub decode_error_budget: u32,
}

/// Why the worker loop ended.
struct Stop {
    kind: ErrorKind,
    cause: Option<anyhow::Error>,
}

impl Stop {
    fn new(kind: ErrorKind, cause: anyhow::Error) -> Self {
        Self {
            kind,
            cause: Some(cause),
        }
    }

    fn bare(kind: ErrorKind) -> Self {
        Self { kind, cause: None }
    }
}

impl From<Cancelled> for Stop {
    fn from(_: Cancelled) -> Self {
        Stop::bare(ErrorKind::Cancelled)
    }
}

/// Marks the record failed if the worker unwinds.
struct PanicGuard<'a> {
    record: &'a FrameRecord,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.record.fail(ErrorKind::WorkerPanicked);
        }
    }
}

/// Worker thread body.
pub(crate) fn run<B: MediaBackend>(ctx: WorkerContext<B>) {
    let _guard = PanicGuard {
        record: &ctx.record,
    };
    log::debug!(
        "DecodeWorker[{}]: connecting to {} ({})",
        ctx.handle,
        redact_uri(&ctx.uri),
        ctx.backend.name()
    );

    let stop = match decode_stream(&ctx) {
        Ok(()) => Stop::bare(ErrorKind::EndOfStream),
        Err(stop) => stop,
    };
    // A close interrupts blocking calls, which then fail with library errors.
    let kind = if ctx.cancel.is_cancelled() {
        ErrorKind::Cancelled
    } else {
        stop.kind
    };
    ctx.record.fail(kind);

    match (kind, stop.cause) {
        (ErrorKind::Cancelled, _) => {
            log::debug!("DecodeWorker[{}]: stopped on close", ctx.handle)
        }
        (kind, Some(cause)) => {
            log::warn!("DecodeWorker[{}]: stopped ({}): {:#}", ctx.handle, kind, cause)
        }
        (kind, None) => log::info!("DecodeWorker[{}]: stopped ({})", ctx.handle, kind),
    }
}

/// Steps 1-5. Returns `Ok(())` at end of stream. All library handles are locals and
/// are dropped on every return path.
fn decode_stream<B: MediaBackend>(ctx: &WorkerContext<B>) -> Result<(), Stop> {
    ctx.cancel.check()?;
    let mut input = ctx
        .backend
        .open_input(&ctx.uri, &ctx.cancel)
        .map_err(|e| Stop::new(ErrorKind::TransportFailure, e))?;

    ctx.cancel.check()?;
    let video = input
        .streams()
        .into_iter()
        .find(|stream| stream.kind == MediaKind::Video)
        .ok_or_else(|| Stop::bare(ErrorKind::StreamNotFound))?;

    ctx.cancel.check()?;
    let mut decoder = input
        .open_decoder(&video)
        .map_err(|e| Stop::new(ErrorKind::DecodeInitFailure, e))?;

    let mut conversion = Conversion::new(ctx.requested);

    ctx.cancel.check()?;
    if !ctx.record.mark_ready() {
        return Err(Stop::bare(ErrorKind::Cancelled));
    }
    log::info!(
        "DecodeWorker[{}]: streaming {} (stream #{}, codec {}, output {})",
        ctx.handle,
        redact_uri(&ctx.uri),
        video.index,
        video.codec,
        if ctx.requested.is_resolved() {
            ctx.requested.to_string()
        } else {
            "native".to_string()
        }
    );

    let mut failures = 0u32;
    loop {
        ctx.cancel.check()?;
        let Some((index, packet)) = input
            .read_packet()
            .map_err(|e| Stop::new(ErrorKind::TransportFailure, e))?
        else {
            return Ok(());
        };
        if index != video.index {
            continue;
        }

        match feed(&mut decoder, &packet, &mut conversion, &ctx.record) {
            Ok(()) => failures = 0,
            Err(err) if failures < ctx.decode_error_budget => {
                failures += 1;
                log::warn!(
                    "DecodeWorker[{}]: skipped packet ({}/{}): {:#}",
                    ctx.handle,
                    failures,
                    ctx.decode_error_budget,
                    err
                );
            }
            Err(err) => return Err(Stop::new(ErrorKind::DecodeFailure, err)),
        }
    }
}

/// Decode one packet and publish every picture it completes.
fn feed<D: VideoDecoder>(
    decoder: &mut D,
    packet: &D::Packet,
    conversion: &mut Conversion<D>,
    record: &FrameRecord,
) -> anyhow::Result<()> {
    decoder.send_packet(packet)?;
    while let Some(picture) = decoder.receive_picture()? {
        let pixels = conversion.convert(decoder, &picture, record)?;
        if !record.publish(pixels) {
            break;
        }
    }
    Ok(())
}

/// Output side of the pipeline: the fixed output size, the staging buffer the
/// scaler writes into, and the scaler itself.
///
/// The scaler is built on the first picture because it needs the source format; it
/// is rebuilt if the source size changes mid-stream. The output size never changes
/// once known.
struct Conversion<D: VideoDecoder> {
    target: Dimensions,
    staging: Vec<u8>,
    scaler: Option<(Dimensions, D::Scaler)>,
}

impl<D: VideoDecoder> Conversion<D> {
    fn new(requested: Dimensions) -> Self {
        if requested.is_resolved() {
            Self {
                target: requested,
                staging: vec![0u8; requested.byte_len()],
                scaler: None,
            }
        } else {
            Self {
                target: Dimensions::NATIVE,
                staging: Vec::new(),
                scaler: None,
            }
        }
    }

    fn convert(
        &mut self,
        decoder: &D,
        picture: &D::Picture,
        record: &FrameRecord,
    ) -> anyhow::Result<&[u8]> {
        let source = picture.dimensions();
        if !source.is_resolved() || source.checked_byte_len().is_none() {
            return Err(anyhow!("decoder produced a picture of size {}", source));
        }
        if !self.target.is_resolved() {
            self.target = record.resolve_dimensions(source);
            self.staging = vec![0u8; self.target.byte_len()];
        }

        let stale = match &self.scaler {
            Some((built_for, _)) => *built_for != source,
            None => true,
        };
        if stale {
            self.scaler = Some((source, decoder.scaler(picture, self.target)?));
        }
        if let Some((_, scaler)) = self.scaler.as_mut() {
            scaler.scale(picture, &mut self.staging)?;
        }
        Ok(&self.staging)
    }
}
