//! The stream engine: open, poll, grab, close.
//!
//! `StreamEngine` owns the session table and hands out integer handles. Each open
//! session has its own decode thread; the control thread only ever touches a
//! session's `FrameRecord` under its lock, so every polling call is safe to issue
//! while the worker is writing.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::decode::{redact_uri, MediaBackend};
use crate::error::EngineError;
use crate::frame::{Dimensions, ErrorKind, Frame, FrameCounters, StreamStatus};
use crate::session::table::CloseOutcome;
use crate::session::{Handle, Session, SessionParams, SessionTable};

/// Point-in-time view of one open session.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub handle: Handle,
    /// URI with any password removed.
    pub uri: String,
    pub requested: Dimensions,
    pub dimensions: Dimensions,
    pub status: StreamStatus,
    pub error: Option<ErrorKind>,
    pub counters: FrameCounters,
    pub uptime: Duration,
}

pub struct StreamEngine<B: MediaBackend> {
    backend: Arc<B>,
    config: EngineConfig,
    table: SessionTable,
}

impl<B: MediaBackend> StreamEngine<B> {
    pub fn new(backend: B, config: EngineConfig) -> Self {
        log::info!(
            "StreamEngine: {} backend, {} session slots, close timeout {:?}",
            backend.name(),
            config.max_sessions,
            config.close_timeout
        );
        Self {
            table: SessionTable::with_capacity(config.max_sessions),
            backend: Arc::new(backend),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Start decoding `uri` and return the session's handle without waiting for the
    /// connection.
    ///
    /// With `width` and `height` both non-zero every frame is scaled to that size and
    /// the pixel buffer exists from the start. Otherwise the stream's native size is
    /// used and reads as 0x0 until the first frame is decoded.
    pub fn open(&mut self, uri: &str, width: u32, height: u32) -> Result<Handle, EngineError> {
        self.table.reap();
        if uri.trim().is_empty() {
            return Err(EngineError::EmptyUri);
        }
        let requested = Dimensions::new(width, height);
        let requested = if requested.is_resolved() {
            requested
        } else {
            Dimensions::NATIVE
        };
        if requested.checked_byte_len().is_none() {
            return Err(EngineError::InvalidDimensions { width, height });
        }

        let backend = self.backend.clone();
        let params = SessionParams {
            uri: uri.to_string(),
            requested,
            decode_error_budget: self.config.decode_error_budget,
        };
        let handle = self
            .table
            .insert_with(|handle| Ok(Session::spawn(handle, backend, params)?))
            .map_err(|err| {
                log::warn!("StreamEngine: open '{}' failed: {}", redact_uri(uri), err);
                err
            })?;

        log::info!(
            "StreamEngine: session {} opened for '{}' ({})",
            handle,
            redact_uri(uri),
            if requested.is_resolved() {
                requested.to_string()
            } else {
                "native size".to_string()
            }
        );
        Ok(handle)
    }

    /// Stop a session and release its handle.
    ///
    /// Blocks for at most the configured close timeout. Closing a handle that is not
    /// open does nothing.
    pub fn close(&mut self, handle: Handle) -> CloseOutcome {
        self.table.reap();
        let outcome = self.table.close(
            handle,
            self.config.close_timeout,
            self.config.close_poll_interval,
        );
        match outcome {
            CloseOutcome::Closed => log::info!("StreamEngine: session {} closed", handle),
            CloseOutcome::NotOpen => {
                log::debug!("StreamEngine: close of session {} ignored, not open", handle)
            }
            CloseOutcome::Draining => {}
        }
        outcome
    }

    /// Current status, `Error` for handles that are not open.
    pub fn status(&self, handle: Handle) -> StreamStatus {
        self.table
            .get(handle)
            .map_or(StreamStatus::Error, |session| session.record().status())
    }

    /// Why a session entered `Error`, if it has.
    pub fn error_kind(&self, handle: Handle) -> Option<ErrorKind> {
        self.table
            .get(handle)
            .and_then(|session| session.record().error_kind())
    }

    pub fn frame_dimensions(&self, handle: Handle) -> Dimensions {
        self.table
            .get(handle)
            .map_or(Dimensions::NATIVE, |session| session.record().dimensions())
    }

    pub fn frame_width(&self, handle: Handle) -> u32 {
        self.frame_dimensions(handle).width
    }

    pub fn frame_height(&self, handle: Handle) -> u32 {
        self.frame_dimensions(handle).height
    }

    /// Copy the latest frame as packed RGB24 into `out` and mark it grabbed.
    ///
    /// Returns the number of bytes written, 0 for handles that are not open or when
    /// no frame buffer exists yet.
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than `width * height * 3` of the session.
    pub fn grab_frame(&self, handle: Handle, out: &mut [u8]) -> usize {
        self.table
            .get(handle)
            .map_or(0, |session| session.record().grab_into(out))
    }

    /// Take an owned copy of the latest frame if it has not been grabbed yet.
    pub fn take_frame(&self, handle: Handle) -> Option<Frame> {
        self.table
            .get(handle)
            .and_then(|session| session.record().take())
    }

    pub fn stats(&self, handle: Handle) -> Option<SessionStats> {
        let session = self.table.get(handle)?;
        let snapshot = session.record().snapshot();
        Some(SessionStats {
            handle: session.handle(),
            uri: redact_uri(session.uri()),
            requested: session.requested(),
            dimensions: snapshot.dimensions,
            status: snapshot.status,
            error: snapshot.error,
            counters: snapshot.counters,
            uptime: session.uptime(),
        })
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.table.handles()
    }

    pub fn open_count(&self) -> usize {
        self.table.open_count()
    }

    pub fn draining_count(&self) -> usize {
        self.table.draining_count()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Close every open session, then give draining workers one more close timeout
    /// to exit.
    pub fn shutdown(&mut self) {
        self.table.reap();
        let handles = self.table.handles();
        if handles.is_empty() && self.table.draining_count() == 0 {
            return;
        }
        log::info!("StreamEngine: shutting down {} session(s)", handles.len());
        for handle in handles {
            self.close(handle);
        }

        let deadline = std::time::Instant::now() + self.config.close_timeout;
        while self.table.draining_count() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(self.config.close_poll_interval);
            self.table.reap();
        }
        let left = self.table.draining_count();
        if left > 0 {
            log::warn!(
                "StreamEngine: {} worker(s) still running after shutdown",
                left
            );
        }
    }
}

impl<B: MediaBackend> Drop for StreamEngine<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
