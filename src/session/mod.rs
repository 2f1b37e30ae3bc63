//! Decode sessions.
//!
//! A `Session` is one open stream: its URI and requested size, the cancel token, the
//! worker thread, and the `FrameRecord` it shares with that worker. Sessions are
//! created by `StreamEngine::open` and live in the `SessionTable` until the worker
//! has exited.

pub mod table;

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::decode::worker::{self, WorkerContext};
use crate::decode::MediaBackend;
use crate::frame::{Dimensions, FrameRecord};

pub use table::SessionTable;

/// Opaque integer identity of an open session.
///
/// Handles are slot indices: the lowest free slot is handed out first, and a handle
/// is reused only after its previous session was closed and its worker exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(usize);

impl Handle {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl From<usize> for Handle {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settings a session is opened with.
#[derive(Clone, Debug)]
pub(crate) struct SessionParams {
    pub uri: String,
    pub requested: Dimensions,
    pub decode_error_budget: u32,
}

pub(crate) struct Session {
    handle: Handle,
    uri: String,
    requested: Dimensions,
    cancel: CancelToken,
    record: Arc<FrameRecord>,
    worker: Option<JoinHandle<()>>,
    opened_at: Instant,
}

impl Session {
    /// Create the session record and start its worker thread.
    pub(crate) fn spawn<B: MediaBackend>(
        handle: Handle,
        backend: Arc<B>,
        params: SessionParams,
    ) -> std::io::Result<Self> {
        let cancel = CancelToken::new();
        let record = Arc::new(FrameRecord::new(params.requested));
        let ctx = WorkerContext {
            backend,
            handle,
            uri: params.uri.clone(),
            requested: params.requested,
            record: record.clone(),
            cancel: cancel.clone(),
            decode_error_budget: params.decode_error_budget,
        };
        let join = std::thread::Builder::new()
            .name(format!("stream-{}", handle))
            .spawn(move || worker::run(ctx))?;

        Ok(Self {
            handle,
            uri: params.uri,
            requested: params.requested,
            cancel,
            record,
            worker: Some(join),
            opened_at: Instant::now(),
        })
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }

    pub(crate) fn uri(&self) -> &str {
        &self.uri
    }

    pub(crate) fn requested(&self) -> Dimensions {
        self.requested
    }

    pub(crate) fn record(&self) -> &FrameRecord {
        &self.record
    }

    #[cfg(test)]
    pub(crate) fn record_arc(&self) -> &Arc<FrameRecord> {
        &self.record
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Set the closing flag. The worker observes it at its next check or from inside
    /// the backend's blocking call.
    pub(crate) fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the worker to exit, polling every `poll`.
    ///
    /// Returns true once the worker has finished and was joined. Returns false if it
    /// is still running at the deadline; the session must then be kept until a later
    /// `try_join` succeeds.
    pub(crate) fn join_within(&mut self, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_join() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(poll.min(deadline - now));
        }
    }

    /// Join the worker if it has already exited. Never blocks.
    pub(crate) fn try_join(&mut self) -> bool {
        if !self.is_finished() {
            return false;
        }
        if let Some(join) = self.worker.take() {
            if join.join().is_err() {
                log::error!("StreamEngine: worker for session {} panicked", self.handle);
            }
        }
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Dropping with a live worker only happens when the engine itself is torn
        // down mid-drain; the worker keeps its own Arc to the record.
        if self.worker.is_some() {
            self.cancel.cancel();
            log::warn!(
                "StreamEngine: session {} dropped while its worker was still running",
                self.handle
            );
        }
    }
}
