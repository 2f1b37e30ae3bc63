use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};

use rtsp_frame_grabber::decode::{
    MediaBackend, MediaInput, MediaKind, Picture, PixelScaler, StreamInfo, VideoDecoder,
};
use rtsp_frame_grabber::{
    CancelToken, CloseOutcome, Dimensions, EngineConfig, EngineError, ErrorKind, StreamEngine,
    StreamStatus, SyntheticBackend,
};

const GATE_POLL: Duration = Duration::from_millis(2);

/// One step the test releases to the scripted source.
enum Step {
    Connect,
    Frame,
    End,
}

/// Backend whose every blocking call waits for the test to release the next step,
/// so the status sequence is fully determined by the test.
struct ScriptedBackend {
    steps: Mutex<Option<Receiver<Step>>>,
    native: Dimensions,
}

impl ScriptedBackend {
    fn new(native: Dimensions) -> (Self, Sender<Step>) {
        let (tx, rx) = mpsc::channel();
        let backend = Self {
            steps: Mutex::new(Some(rx)),
            native,
        };
        (backend, tx)
    }
}

fn next_step(steps: &Receiver<Step>, cancel: &CancelToken) -> Result<Option<Step>> {
    loop {
        cancel.check()?;
        match steps.recv_timeout(GATE_POLL) {
            Ok(step) => return Ok(Some(step)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(None),
        }
    }
}

struct ScriptedInput {
    steps: Receiver<Step>,
    cancel: CancelToken,
    native: Dimensions,
    sequence: u8,
}

struct ScriptedDecoder {
    native: Dimensions,
    pending: Option<u8>,
}

struct ScriptedPicture {
    dimensions: Dimensions,
    value: u8,
}

struct ScriptedScaler;

impl MediaBackend for ScriptedBackend {
    type Input = ScriptedInput;

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open_input(&self, _uri: &str, cancel: &CancelToken) -> Result<ScriptedInput> {
        let steps = self
            .steps
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("scripted backend opened twice"))?;
        match next_step(&steps, cancel)? {
            Some(Step::Connect) => Ok(ScriptedInput {
                steps,
                cancel: cancel.clone(),
                native: self.native,
                sequence: 0,
            }),
            _ => bail!("connection refused"),
        }
    }
}

impl MediaInput for ScriptedInput {
    type Packet = u8;
    type Decoder = ScriptedDecoder;

    fn streams(&self) -> Vec<StreamInfo> {
        vec![StreamInfo {
            index: 0,
            kind: MediaKind::Video,
            codec: "scripted".to_string(),
        }]
    }

    fn open_decoder(&mut self, _stream: &StreamInfo) -> Result<ScriptedDecoder> {
        Ok(ScriptedDecoder {
            native: self.native,
            pending: None,
        })
    }

    fn read_packet(&mut self) -> Result<Option<(usize, u8)>> {
        match next_step(&self.steps, &self.cancel)? {
            Some(Step::Frame) => {
                self.sequence += 1;
                Ok(Some((0, self.sequence)))
            }
            Some(Step::End) | None => Ok(None),
            Some(Step::Connect) => bail!("unexpected connect step"),
        }
    }
}

impl VideoDecoder for ScriptedDecoder {
    type Packet = u8;
    type Picture = ScriptedPicture;
    type Scaler = ScriptedScaler;

    fn send_packet(&mut self, packet: &u8) -> Result<()> {
        self.pending = Some(*packet);
        Ok(())
    }

    fn receive_picture(&mut self) -> Result<Option<ScriptedPicture>> {
        Ok(self.pending.take().map(|value| ScriptedPicture {
            dimensions: self.native,
            value,
        }))
    }

    fn scaler(&self, _source: &ScriptedPicture, _target: Dimensions) -> Result<ScriptedScaler> {
        Ok(ScriptedScaler)
    }
}

impl Picture for ScriptedPicture {
    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }
}

impl PixelScaler for ScriptedScaler {
    type Picture = ScriptedPicture;

    fn scale(&mut self, picture: &ScriptedPicture, out: &mut [u8]) -> Result<()> {
        out.fill(picture.value);
        Ok(())
    }
}

fn config(max_sessions: usize, close_timeout: Duration) -> EngineConfig {
    EngineConfig {
        max_sessions,
        close_timeout,
        close_poll_interval: Duration::from_millis(1),
        decode_error_budget: 0,
    }
}

fn wait_for_status<B: MediaBackend>(
    engine: &StreamEngine<B>,
    handle: rtsp_frame_grabber::Handle,
    expected: StreamStatus,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = engine.status(handle);
        if status == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {:?}, status is {:?}",
            expected,
            status
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn three_frame_stream_walks_the_status_machine() {
    let (backend, steps) = ScriptedBackend::new(Dimensions::new(4, 2));
    let mut engine = StreamEngine::new(backend, config(4, Duration::from_secs(3)));
    let handle = engine.open("rtsp://scripted/cam", 0, 0).expect("open");

    let mut observed = vec![engine.status(handle)];
    assert_eq!(engine.frame_dimensions(handle), Dimensions::NATIVE);

    steps.send(Step::Connect).expect("connect");
    wait_for_status(&engine, handle, StreamStatus::Ok);
    observed.push(StreamStatus::Ok);
    assert_eq!(engine.frame_width(handle), 0);

    let mut out = vec![0u8; 4 * 2 * 3];
    let mut grabs = 0;
    for value in 1..=3u8 {
        steps.send(Step::Frame).expect("frame");
        wait_for_status(&engine, handle, StreamStatus::NewFrame);
        observed.push(StreamStatus::NewFrame);
        assert_eq!(engine.frame_dimensions(handle), Dimensions::new(4, 2));

        if value == 3 {
            steps.send(Step::End).expect("end");
            wait_for_status(&engine, handle, StreamStatus::Error);
            observed.push(StreamStatus::Error);
        }
        assert_eq!(engine.grab_frame(handle, &mut out), 24);
        assert!(out.iter().all(|&px| px == value));
        grabs += 1;
        if value < 3 {
            assert_eq!(engine.status(handle), StreamStatus::Ok);
            observed.push(StreamStatus::Ok);
        }
    }

    assert_eq!(
        observed,
        vec![
            StreamStatus::Connecting,
            StreamStatus::Ok,
            StreamStatus::NewFrame,
            StreamStatus::Ok,
            StreamStatus::NewFrame,
            StreamStatus::Ok,
            StreamStatus::NewFrame,
            StreamStatus::Error,
        ]
    );
    assert_eq!(grabs, 3);
    assert_eq!(engine.error_kind(handle), Some(ErrorKind::EndOfStream));
    let stats = engine.stats(handle).expect("stats");
    assert_eq!(stats.counters.published, 3);
    assert_eq!(stats.counters.dropped, 0);

    assert_eq!(engine.close(handle), CloseOutcome::Closed);
}

#[test]
fn requested_dimensions_stay_fixed() {
    let (backend, steps) = ScriptedBackend::new(Dimensions::new(64, 32));
    let mut engine = StreamEngine::new(backend, config(1, Duration::from_secs(3)));
    let handle = engine.open("rtsp://scripted/cam", 8, 6).expect("open");
    assert_eq!(engine.frame_dimensions(handle), Dimensions::new(8, 6));

    steps.send(Step::Connect).expect("connect");
    steps.send(Step::Frame).expect("frame");
    wait_for_status(&engine, handle, StreamStatus::NewFrame);
    assert_eq!(engine.frame_dimensions(handle), Dimensions::new(8, 6));

    let mut out = vec![0u8; 8 * 6 * 3];
    assert_eq!(engine.grab_frame(handle, &mut out), 8 * 6 * 3);
    assert_eq!(engine.status(handle), StreamStatus::Ok);
    engine.close(handle);
}

#[test]
fn source_without_video_fails_without_buffer() {
    let mut engine = StreamEngine::new(SyntheticBackend::new(), config(2, Duration::from_secs(3)));
    let handle = engine.open("stub://audio_only?video=0&audio=1", 0, 0).expect("open");
    wait_for_status(&engine, handle, StreamStatus::Error);

    assert_eq!(engine.error_kind(handle), Some(ErrorKind::StreamNotFound));
    assert_eq!(engine.frame_dimensions(handle), Dimensions::NATIVE);
    let mut out = [0u8; 8];
    assert_eq!(engine.grab_frame(handle, &mut out), 0);
    assert_eq!(engine.close(handle), CloseOutcome::Closed);
}

#[test]
fn capacity_exceeded_leaves_other_sessions_running() {
    let mut engine = StreamEngine::new(SyntheticBackend::new(), config(3, Duration::from_secs(3)));
    let handles: Vec<_> = (0..3)
        .map(|_| engine.open("stub://cam?width=16&height=16&fps=100", 0, 0).expect("open"))
        .collect();
    assert_eq!(
        handles.iter().map(|h| h.index()).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let err = engine.open("stub://cam", 0, 0).expect_err("fourth open");
    assert!(matches!(err, EngineError::CapacityExceeded { capacity: 3 }));
    assert_eq!(engine.open_count(), 3);
    for &handle in &handles {
        assert_ne!(engine.status(handle), StreamStatus::Error);
    }

    assert_eq!(engine.close(handles[1]), CloseOutcome::Closed);
    let reopened = engine.open("stub://cam", 0, 0).expect("reopen");
    assert_eq!(reopened, handles[1]);
    engine.shutdown();
    assert_eq!(engine.open_count(), 0);
}

#[test]
fn oversized_request_is_rejected_without_taking_a_slot() {
    let mut engine = StreamEngine::new(SyntheticBackend::new(), config(1, Duration::from_secs(3)));
    let err = engine
        .open("stub://cam?stall=1", u32::MAX, u32::MAX)
        .expect_err("oversized open");
    assert!(matches!(err, EngineError::InvalidDimensions { .. }));
    assert_eq!(engine.open_count(), 0);
}

#[test]
fn close_interrupts_stalled_transport_within_bound() {
    let timeout = Duration::from_secs(3);
    let mut engine = StreamEngine::new(SyntheticBackend::new(), config(2, timeout));
    let handle = engine.open("stub://dead_camera?stall=1", 320, 240).expect("open");
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(engine.status(handle), StreamStatus::Connecting);

    let started = Instant::now();
    assert_eq!(engine.close(handle), CloseOutcome::Closed);
    assert!(started.elapsed() < timeout);
    assert_eq!(engine.status(handle), StreamStatus::Error);
    assert_eq!(engine.frame_width(handle), 0);
    assert_eq!(engine.close(handle), CloseOutcome::NotOpen);
}

#[test]
fn close_of_scripted_session_waiting_for_frames() {
    let (backend, steps) = ScriptedBackend::new(Dimensions::new(2, 2));
    let mut engine = StreamEngine::new(backend, config(1, Duration::from_secs(3)));
    let handle = engine.open("rtsp://scripted/cam", 0, 0).expect("open");
    steps.send(Step::Connect).expect("connect");
    wait_for_status(&engine, handle, StreamStatus::Ok);

    assert_eq!(engine.close(handle), CloseOutcome::Closed);
    assert_eq!(engine.open_count(), 0);
    assert_eq!(engine.close(handle), CloseOutcome::NotOpen);
}

#[test]
fn unpolled_frames_are_counted_as_dropped() {
    let (backend, steps) = ScriptedBackend::new(Dimensions::new(2, 2));
    let mut engine = StreamEngine::new(backend, config(1, Duration::from_secs(3)));
    let handle = engine.open("rtsp://scripted/cam", 0, 0).expect("open");
    steps.send(Step::Connect).expect("connect");
    for _ in 0..3 {
        steps.send(Step::Frame).expect("frame");
    }
    steps.send(Step::End).expect("end");
    wait_for_status(&engine, handle, StreamStatus::Error);

    let stats = engine.stats(handle).expect("stats");
    assert_eq!(stats.counters.published, 3);
    assert_eq!(stats.counters.dropped, 2);
    let frame = engine.take_frame(handle);
    assert!(frame.is_none(), "terminal sessions hand out frames through grab only");

    let mut out = vec![0u8; 12];
    assert_eq!(engine.grab_frame(handle, &mut out), 12);
    assert!(out.iter().all(|&px| px == 3));
    engine.close(handle);
}
