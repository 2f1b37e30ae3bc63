//! Synthetic backend for `stub://` URIs.
//!
//! Produces a deterministic RGB test pattern without touching the network, so the
//! engine and the grabber binary can run without a camera or a decoding library.
//! Behaviour is selected by query parameters:
//!
//! | parameter  | default | effect                                                   |
//! |------------|---------|----------------------------------------------------------|
//! | `frames`   | none    | end of stream after this many video packets              |
//! | `width`    | 640     | native picture width                                     |
//! | `height`   | 480     | native picture height                                    |
//! | `fps`      | 25      | packet pacing; `0` reads as fast as possible             |
//! | `video`    | 1       | `0` omits the video stream                               |
//! | `audio`    | 0       | `1` interleaves an audio stream that must be discarded   |
//! | `fail`     | none    | `open`, `decoder` or `decode`: fail at that step         |
//! | `stall`    | 0       | `1` blocks in `open_input` until cancelled               |

use anyhow::{anyhow, bail, Context, Result};
use std::time::{Duration, Instant};
use url::Url;

use super::{MediaBackend, MediaInput, MediaKind, Picture, PixelScaler, StreamInfo, VideoDecoder};
use crate::cancel::{CancelToken, Cancelled};
use crate::frame::{Dimensions, CHANNELS};

const SCHEME: &str = "stub";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 25;
const CANCEL_POLL: Duration = Duration::from_millis(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FailAt {
    Open,
    Decoder,
    Decode,
}

/// Parsed `stub://` URI.
#[derive(Clone, Debug, PartialEq, Eq)]
struct StubSpec {
    frames: Option<u64>,
    native: Dimensions,
    fps: u32,
    video: bool,
    audio: bool,
    fail: Option<FailAt>,
    stall: bool,
}

impl StubSpec {
    fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).with_context(|| format!("invalid stub URI '{}'", uri))?;
        if url.scheme() != SCHEME {
            bail!("synthetic backend only serves stub:// URIs, got '{}'", uri);
        }

        let mut spec = StubSpec {
            frames: None,
            native: Dimensions::new(DEFAULT_WIDTH, DEFAULT_HEIGHT),
            fps: DEFAULT_FPS,
            video: true,
            audio: false,
            fail: None,
            stall: false,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => spec.frames = Some(parse_number(&key, &value)?),
                "width" => spec.native.width = parse_number(&key, &value)?,
                "height" => spec.native.height = parse_number(&key, &value)?,
                "fps" => spec.fps = parse_number(&key, &value)?,
                "video" => spec.video = parse_flag(&key, &value)?,
                "audio" => spec.audio = parse_flag(&key, &value)?,
                "stall" => spec.stall = parse_flag(&key, &value)?,
                "fail" => {
                    spec.fail = Some(match value.as_ref() {
                        "open" => FailAt::Open,
                        "decoder" => FailAt::Decoder,
                        "decode" => FailAt::Decode,
                        other => bail!("unknown stub failure point '{}'", other),
                    })
                }
                other => log::warn!("SyntheticBackend: ignoring unknown parameter '{}'", other),
            }
        }
        if !spec.native.is_resolved() {
            bail!("stub picture size must be non-zero, got {}", spec.native);
        }
        Ok(spec)
    }

    fn frame_interval(&self) -> Option<Duration> {
        (self.fps > 0).then(|| Duration::from_secs(1) / self.fps)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("stub parameter '{}' must be a number, got '{}'", key, value))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => bail!("stub parameter '{}' must be 0 or 1, got '{}'", key, value),
    }
}

/// Sleep until `deadline`, waking every few milliseconds to check `cancel`.
fn sleep_until(deadline: Instant, cancel: &CancelToken) -> Result<(), Cancelled> {
    loop {
        cancel.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}

/// Pattern value of source pixel (`x`, `y`) in frame `sequence`.
fn pattern(sequence: u64, x: u32, y: u32) -> [u8; CHANNELS] {
    [
        (x as u64 + sequence) as u8,
        (y as u64 + sequence) as u8,
        (sequence.wrapping_mul(16)) as u8,
    ]
}

/// Backend serving `stub://` URIs.
#[derive(Clone, Debug, Default)]
pub struct SyntheticBackend;

impl SyntheticBackend {
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for SyntheticBackend {
    type Input = SyntheticInput;

    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open_input(&self, uri: &str, cancel: &CancelToken) -> Result<SyntheticInput> {
        let spec = StubSpec::parse(uri)?;
        if spec.stall {
            while !cancel.is_cancelled() {
                std::thread::sleep(CANCEL_POLL);
            }
            return Err(anyhow::Error::new(Cancelled).context("stub transport stalled until close"));
        }
        if spec.fail == Some(FailAt::Open) {
            bail!("stub transport refused connection");
        }
        log::info!("SyntheticBackend: connected to {}", super::redact_uri(uri));
        Ok(SyntheticInput {
            spec,
            cancel: cancel.clone(),
            sequence: 0,
            audio_due: false,
            next_due: Instant::now(),
        })
    }
}

/// An open `stub://` transport.
pub struct SyntheticInput {
    spec: StubSpec,
    cancel: CancelToken,
    sequence: u64,
    audio_due: bool,
    next_due: Instant,
}

impl SyntheticInput {
    fn audio_index(&self) -> Option<usize> {
        self.spec.audio.then_some(0)
    }

    fn video_index(&self) -> usize {
        usize::from(self.spec.audio)
    }
}

impl MediaInput for SyntheticInput {
    type Packet = SyntheticPacket;
    type Decoder = SyntheticDecoder;

    fn streams(&self) -> Vec<StreamInfo> {
        let mut streams = Vec::new();
        if let Some(index) = self.audio_index() {
            streams.push(StreamInfo {
                index,
                kind: MediaKind::Audio,
                codec: "pcm_s16le".to_string(),
            });
        }
        if self.spec.video {
            streams.push(StreamInfo {
                index: self.video_index(),
                kind: MediaKind::Video,
                codec: "rawvideo".to_string(),
            });
        }
        streams
    }

    fn open_decoder(&mut self, stream: &StreamInfo) -> Result<SyntheticDecoder> {
        if stream.kind != MediaKind::Video {
            bail!("stream #{} is not video", stream.index);
        }
        if self.spec.fail == Some(FailAt::Decoder) {
            bail!("no stub decoder for codec '{}'", stream.codec);
        }
        Ok(SyntheticDecoder {
            native: self.spec.native,
            corrupt: self.spec.fail == Some(FailAt::Decode),
            pending: None,
        })
    }

    fn read_packet(&mut self) -> Result<Option<(usize, SyntheticPacket)>> {
        if let Some(audio_index) = self.audio_index() {
            if self.audio_due {
                self.audio_due = false;
                return Ok(Some((audio_index, SyntheticPacket { sequence: 0 })));
            }
        }
        if self.spec.frames.is_some_and(|frames| self.sequence >= frames) {
            return Ok(None);
        }
        if let Some(interval) = self.spec.frame_interval() {
            sleep_until(self.next_due, &self.cancel).context("stub read interrupted")?;
            self.next_due = Instant::now() + interval;
        }

        let packet = SyntheticPacket {
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.audio_due = self.spec.audio;
        Ok(Some((self.video_index(), packet)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyntheticPacket {
    sequence: u64,
}

pub struct SyntheticDecoder {
    native: Dimensions,
    corrupt: bool,
    pending: Option<u64>,
}

impl VideoDecoder for SyntheticDecoder {
    type Packet = SyntheticPacket;
    type Picture = SyntheticPicture;
    type Scaler = SyntheticScaler;

    fn send_packet(&mut self, packet: &SyntheticPacket) -> Result<()> {
        if self.corrupt {
            bail!("stub packet {} is corrupt", packet.sequence);
        }
        self.pending = Some(packet.sequence);
        Ok(())
    }

    fn receive_picture(&mut self) -> Result<Option<SyntheticPicture>> {
        Ok(self.pending.take().map(|sequence| SyntheticPicture {
            dimensions: self.native,
            sequence,
        }))
    }

    fn scaler(&self, _source: &SyntheticPicture, target: Dimensions) -> Result<SyntheticScaler> {
        Ok(SyntheticScaler { target })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyntheticPicture {
    dimensions: Dimensions,
    sequence: u64,
}

impl Picture for SyntheticPicture {
    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }
}

/// Nearest-neighbour scaler over the test pattern.
pub struct SyntheticScaler {
    target: Dimensions,
}

impl PixelScaler for SyntheticScaler {
    type Picture = SyntheticPicture;

    fn scale(&mut self, picture: &SyntheticPicture, out: &mut [u8]) -> Result<()> {
        if out.len() != self.target.byte_len() {
            bail!(
                "output buffer is {} bytes, expected {} for {}",
                out.len(),
                self.target.byte_len(),
                self.target
            );
        }
        let source = picture.dimensions;
        let row_bytes = self.target.width as usize * CHANNELS;
        for (y, row) in out.chunks_exact_mut(row_bytes).enumerate() {
            let sy = (y as u64 * source.height as u64 / self.target.height as u64) as u32;
            for (x, pixel) in row.chunks_exact_mut(CHANNELS).enumerate() {
                let sx = (x as u64 * source.width as u64 / self.target.width as u64) as u32;
                pixel.copy_from_slice(&pattern(picture.sequence, sx, sy));
            }
        }
        Ok(())
    }
}
