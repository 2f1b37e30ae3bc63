//! Single-slot frame handoff.
//!
//! A `FrameRecord` holds the most recent decoded frame of one session together with
//! its status and dimensions. The decode worker writes it, the polling consumer reads
//! it, and both go through the same mutex:
//!
//! - status, dimensions and pixel buffer are read and written as one unit, so a
//!   consumer can never observe a buffer whose size disagrees with the dimensions;
//! - there is exactly one slot. A frame that is not grabbed before the next one is
//!   ready gets overwritten (and counted as dropped). Nothing queues.

use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Bytes per pixel of the output layout (packed RGB24).
pub const CHANNELS: usize = 3;

/// Session status as seen by the polling consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum StreamStatus {
    /// Worker is still opening the transport and decoder.
    Connecting,
    /// Terminal: the worker stopped (see `ErrorKind`) or the handle is unknown.
    Error,
    /// Decoding; the last frame (if any) has already been grabbed.
    Ok,
    /// A frame was published and not grabbed yet.
    NewFrame,
}

impl StreamStatus {
    /// Stable numeric code for callers that poll with plain integers.
    pub fn code(self) -> i32 {
        match self {
            StreamStatus::Connecting => 0,
            StreamStatus::Error => 1,
            StreamStatus::Ok => 2,
            StreamStatus::NewFrame => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(StreamStatus::Connecting),
            1 => Some(StreamStatus::Error),
            2 => Some(StreamStatus::Ok),
            3 => Some(StreamStatus::NewFrame),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == StreamStatus::Error
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamStatus::Connecting => "connecting",
            StreamStatus::Error => "error",
            StreamStatus::Ok => "ok",
            StreamStatus::NewFrame => "new_frame",
        };
        f.write_str(name)
    }
}

/// Why a session ended up in `StreamStatus::Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// The transport could not be opened, or a read from it failed.
    TransportFailure,
    /// The transport carries no video stream.
    StreamNotFound,
    /// No decoder could be resolved or opened for the video stream.
    DecodeInitFailure,
    /// Decoding or pixel conversion failed mid-stream.
    DecodeFailure,
    /// The transport ended.
    EndOfStream,
    /// The session was closed while the worker was running.
    Cancelled,
    /// The worker thread panicked.
    WorkerPanicked,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TransportFailure => "transport_failure",
            ErrorKind::StreamNotFound => "stream_not_found",
            ErrorKind::DecodeInitFailure => "decode_init_failure",
            ErrorKind::DecodeFailure => "decode_failure",
            ErrorKind::EndOfStream => "end_of_stream",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::WorkerPanicked => "worker_panicked",
        };
        f.write_str(name)
    }
}

/// Frame size in pixels. A zero side means "not known yet" (native mode).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    /// Request for the stream's native resolution.
    pub const NATIVE: Dimensions = Dimensions {
        width: 0,
        height: 0,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both sides are known (non-zero).
    pub fn is_resolved(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Size of a packed RGB24 buffer of these dimensions.
    ///
    /// Only meaningful for dimensions that passed `checked_byte_len`.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * CHANNELS
    }

    /// `byte_len`, or `None` if the buffer could not be addressed.
    pub fn checked_byte_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(CHANNELS)
            .filter(|&len| len <= isize::MAX as usize)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An owned copy of one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB24, `width * height * 3` bytes, rows top to bottom.
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }
}

/// Frame counters of one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrameCounters {
    /// Frames the worker wrote into the record.
    pub published: u64,
    /// Frames the consumer retrieved while they were new.
    pub grabbed: u64,
    /// Frames overwritten before the consumer retrieved them.
    pub dropped: u64,
}

/// Consistent view of a record's metadata, taken under one lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub status: StreamStatus,
    pub error: Option<ErrorKind>,
    pub dimensions: Dimensions,
    pub counters: FrameCounters,
    pub buffer_len: usize,
}

struct FrameSlot {
    status: StreamStatus,
    error: Option<ErrorKind>,
    dimensions: Dimensions,
    pixels: Vec<u8>,
    counters: FrameCounters,
}

/// Mutex-guarded latest-frame cell shared by a session and its worker.
pub struct FrameRecord {
    slot: Mutex<FrameSlot>,
}

impl FrameRecord {
    /// Create a record in `Connecting`.
    ///
    /// With resolved dimensions the pixel buffer is allocated immediately; otherwise
    /// it stays empty until `resolve_dimensions` is called for the first frame.
    pub fn new(requested: Dimensions) -> Self {
        let (dimensions, pixels) = if requested.is_resolved() {
            (requested, vec![0u8; requested.byte_len()])
        } else {
            (Dimensions::NATIVE, Vec::new())
        };
        Self {
            slot: Mutex::new(FrameSlot {
                status: StreamStatus::Connecting,
                error: None,
                dimensions,
                pixels,
                counters: FrameCounters::default(),
            }),
        }
    }

    // Critical sections only copy bytes and flip fields, so a poisoned lock still
    // holds a consistent slot.
    fn lock(&self) -> MutexGuard<'_, FrameSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> StreamStatus {
        self.lock().status
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.lock().error
    }

    pub fn dimensions(&self) -> Dimensions {
        self.lock().dimensions
    }

    pub fn counters(&self) -> FrameCounters {
        self.lock().counters
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        let slot = self.lock();
        RecordSnapshot {
            status: slot.status,
            error: slot.error,
            dimensions: slot.dimensions,
            counters: slot.counters,
            buffer_len: slot.pixels.len(),
        }
    }

    /// `Connecting -> Ok`. Returns false when the record is already terminal.
    pub(crate) fn mark_ready(&self) -> bool {
        let mut slot = self.lock();
        match slot.status {
            StreamStatus::Error => false,
            StreamStatus::Connecting => {
                slot.status = StreamStatus::Ok;
                true
            }
            StreamStatus::Ok | StreamStatus::NewFrame => true,
        }
    }

    /// Fix the record's dimensions from the first decoded picture.
    ///
    /// Only the first call with unresolved record dimensions has an effect: it records
    /// `native` and allocates the pixel buffer. Returns the record's dimensions,
    /// which never change afterwards.
    pub(crate) fn resolve_dimensions(&self, native: Dimensions) -> Dimensions {
        let mut slot = self.lock();
        if !slot.dimensions.is_resolved() && native.is_resolved() {
            slot.dimensions = native;
            slot.pixels = vec![0u8; native.byte_len()];
        }
        slot.dimensions
    }

    /// Overwrite the slot with a converted frame and flag it as new.
    ///
    /// `pixels` must be exactly `dimensions().byte_len()` bytes. Returns false (and
    /// writes nothing) once the record is terminal.
    pub(crate) fn publish(&self, pixels: &[u8]) -> bool {
        let mut slot = self.lock();
        if slot.status == StreamStatus::Error {
            return false;
        }
        slot.pixels.copy_from_slice(pixels);
        if slot.status == StreamStatus::NewFrame {
            slot.counters.dropped += 1;
        }
        slot.counters.published += 1;
        slot.status = StreamStatus::NewFrame;
        true
    }

    /// Enter the terminal `Error` state. The first recorded kind wins.
    pub(crate) fn fail(&self, kind: ErrorKind) {
        let mut slot = self.lock();
        if slot.status != StreamStatus::Error {
            slot.status = StreamStatus::Error;
            slot.error = Some(kind);
        }
    }

    /// Copy the current pixels into `out` and clear the new-frame flag.
    ///
    /// Returns the number of bytes written: `width * height * 3`, or 0 while no
    /// buffer exists yet (native mode before the first frame).
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than `width * height * 3`. Sizing the buffer from
    /// `dimensions()` is the caller's job.
    pub fn grab_into(&self, out: &mut [u8]) -> usize {
        let mut slot = self.lock();
        let len = slot.pixels.len();
        if len == 0 {
            return 0;
        }
        out[..len].copy_from_slice(&slot.pixels);
        if slot.status == StreamStatus::NewFrame {
            slot.status = StreamStatus::Ok;
            slot.counters.grabbed += 1;
        }
        len
    }

    /// Swap-on-read: an owned copy of the frame if it is new, marking it grabbed.
    pub fn take(&self) -> Option<Frame> {
        let mut slot = self.lock();
        if slot.status != StreamStatus::NewFrame {
            return None;
        }
        slot.status = StreamStatus::Ok;
        slot.counters.grabbed += 1;
        Some(Frame {
            width: slot.dimensions.width,
            height: slot.dimensions.height,
            pixels: slot.pixels.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(dimensions: Dimensions, value: u8) -> Vec<u8> {
        vec![value; dimensions.byte_len()]
    }

    #[test]
    fn status_codes_match_c_interface() {
        for status in [
            StreamStatus::Connecting,
            StreamStatus::Error,
            StreamStatus::Ok,
            StreamStatus::NewFrame,
        ] {
            assert_eq!(StreamStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(StreamStatus::NewFrame.code(), 3);
        assert_eq!(StreamStatus::from_code(7), None);
    }

    #[test]
    fn requested_dimensions_preallocate_buffer() {
        let record = FrameRecord::new(Dimensions::new(4, 2));
        let snapshot = record.snapshot();
        assert_eq!(snapshot.status, StreamStatus::Connecting);
        assert_eq!(snapshot.dimensions, Dimensions::new(4, 2));
        assert_eq!(snapshot.buffer_len, 24);
    }

    #[test]
    fn native_dimensions_resolve_once() {
        let record = FrameRecord::new(Dimensions::NATIVE);
        assert_eq!(record.dimensions(), Dimensions::NATIVE);
        assert_eq!(record.snapshot().buffer_len, 0);

        let first = record.resolve_dimensions(Dimensions::new(8, 6));
        assert_eq!(first, Dimensions::new(8, 6));
        assert_eq!(record.snapshot().buffer_len, 8 * 6 * 3);

        let second = record.resolve_dimensions(Dimensions::new(16, 12));
        assert_eq!(second, Dimensions::new(8, 6));
    }

    #[test]
    fn half_specified_request_is_native_mode() {
        let record = FrameRecord::new(Dimensions::new(640, 0));
        assert_eq!(record.dimensions(), Dimensions::NATIVE);
        assert_eq!(record.snapshot().buffer_len, 0);
    }

    #[test]
    fn publish_then_grab_round_trips_status() {
        let dims = Dimensions::new(2, 2);
        let record = FrameRecord::new(dims);
        assert!(record.mark_ready());
        assert!(record.publish(&solid(dims, 9)));
        assert_eq!(record.status(), StreamStatus::NewFrame);

        let mut out = vec![0u8; dims.byte_len()];
        assert_eq!(record.grab_into(&mut out), 12);
        assert!(out.iter().all(|&b| b == 9));
        assert_eq!(record.status(), StreamStatus::Ok);
        assert_eq!(record.counters().grabbed, 1);
    }

    #[test]
    fn overwrite_before_grab_counts_drop() {
        let dims = Dimensions::new(1, 1);
        let record = FrameRecord::new(dims);
        record.mark_ready();
        record.publish(&[1, 1, 1]);
        record.publish(&[2, 2, 2]);

        let frame = record.take().expect("new frame");
        assert_eq!(frame.pixels, vec![2, 2, 2]);
        let counters = record.counters();
        assert_eq!(counters.published, 2);
        assert_eq!(counters.dropped, 1);
        assert_eq!(counters.grabbed, 1);
        assert!(record.take().is_none());
    }

    #[test]
    fn error_is_terminal() {
        let dims = Dimensions::new(1, 1);
        let record = FrameRecord::new(dims);
        record.fail(ErrorKind::EndOfStream);
        record.fail(ErrorKind::Cancelled);
        assert!(!record.mark_ready());
        assert!(!record.publish(&[5, 5, 5]));
        assert_eq!(record.status(), StreamStatus::Error);
        assert_eq!(record.error_kind(), Some(ErrorKind::EndOfStream));

        let mut out = [7u8; 3];
        assert_eq!(record.grab_into(&mut out), 3);
        assert_eq!(out, [0, 0, 0]);
        assert_eq!(record.status(), StreamStatus::Error);
    }

    #[test]
    fn checked_byte_len_rejects_overflow() {
        assert_eq!(Dimensions::new(4, 2).checked_byte_len(), Some(24));
        assert_eq!(Dimensions::NATIVE.checked_byte_len(), Some(0));
        assert_eq!(Dimensions::new(u32::MAX, u32::MAX).checked_byte_len(), None);
    }

    #[test]
    fn grab_before_first_native_frame_writes_nothing() {
        let record = FrameRecord::new(Dimensions::NATIVE);
        let mut out = [0u8; 0];
        assert_eq!(record.grab_into(&mut out), 0);
    }
}
