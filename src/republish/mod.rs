//! Republishing grabbed frames.
//!
//! The `stream_grabber` binary turns each grabbed RGB24 frame into an
//! `ImageMessage` (optionally halved and/or reduced to grey) and hands it to a
//! `FramePublisher`.

pub mod dump;
pub mod mqtt;
pub mod process;

use anyhow::Result;

use crate::frame::{Dimensions, Frame, CHANNELS};

pub use mqtt::{parse_broker_addr, MqttPublisher};

/// Pixel layout of an `ImageMessage`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Rgb8,
    Mono8,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Rgb8 => "rgb8",
            Encoding::Mono8 => "mono8",
        }
    }

    pub fn channels(self) -> usize {
        match self {
            Encoding::Rgb8 => CHANNELS,
            Encoding::Mono8 => 1,
        }
    }

    /// Topic leaf the message is published under.
    pub fn topic_suffix(self) -> &'static str {
        match self {
            Encoding::Rgb8 => "rgb",
            Encoding::Mono8 => "grey",
        }
    }
}

/// Post-processing applied before publishing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Processing {
    /// 2x2 box-average downscale.
    pub half: bool,
    /// Publish `mono8` instead of `rgb8`.
    pub grey: bool,
}

impl Processing {
    pub fn encoding(&self) -> Encoding {
        if self.grey {
            Encoding::Mono8
        } else {
            Encoding::Rgb8
        }
    }
}

/// A raw image as republished: row-major, no padding, little-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageMessage {
    pub height: u32,
    pub width: u32,
    pub encoding: Encoding,
    pub is_bigendian: u8,
    /// Bytes per row.
    pub step: u32,
    pub data: Vec<u8>,
}

impl ImageMessage {
    /// Build a message from packed RGB24 pixels, applying `processing`.
    pub fn from_rgb(rgb: &[u8], dimensions: Dimensions, processing: Processing) -> Self {
        let (rgb, dimensions) = if processing.half {
            process::halve(rgb, dimensions)
        } else {
            (rgb[..dimensions.byte_len()].to_vec(), dimensions)
        };
        let encoding = processing.encoding();
        let data = match encoding {
            Encoding::Rgb8 => rgb,
            Encoding::Mono8 => process::grey(&rgb),
        };
        Self {
            height: dimensions.height,
            width: dimensions.width,
            encoding,
            is_bigendian: 0,
            step: dimensions.width * encoding.channels() as u32,
            data,
        }
    }

    pub fn from_frame(frame: &Frame, processing: Processing) -> Self {
        Self::from_rgb(&frame.pixels, frame.dimensions(), processing)
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    /// Binary wire form: `height`, `width` (u32 LE), encoding length (u8) and name,
    /// `is_bigendian` (u8), `step` and data length (u32 LE), then the pixels.
    pub fn encode(&self) -> Vec<u8> {
        let encoding = self.encoding.as_str().as_bytes();
        let mut out = Vec::with_capacity(18 + encoding.len() + self.data.len());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.push(encoding.len() as u8);
        out.extend_from_slice(encoding);
        out.push(self.is_bigendian);
        out.extend_from_slice(&self.step.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Destination for republished frames.
pub trait FramePublisher {
    fn publish(&mut self, message: &ImageMessage) -> Result<()>;

    /// Flush and disconnect.
    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Publisher that only logs a line per frame.
#[derive(Debug, Default)]
pub struct LogPublisher {
    published: u64,
}

impl FramePublisher for LogPublisher {
    fn publish(&mut self, message: &ImageMessage) -> Result<()> {
        self.published += 1;
        log::info!(
            "frame {}: {} {} ({} bytes)",
            self.published,
            message.dimensions(),
            message.encoding.as_str(),
            message.data.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb(dimensions: Dimensions) -> Vec<u8> {
        (0..dimensions.byte_len()).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn rgb_message_layout() {
        let dims = Dimensions::new(4, 2);
        let message = ImageMessage::from_rgb(&rgb(dims), dims, Processing::default());
        assert_eq!(message.encoding, Encoding::Rgb8);
        assert_eq!(message.step, 12);
        assert_eq!(message.data.len(), 24);
        assert_eq!(message.is_bigendian, 0);
    }

    #[test]
    fn half_grey_message_layout() {
        let dims = Dimensions::new(4, 2);
        let message = ImageMessage::from_rgb(
            &rgb(dims),
            dims,
            Processing {
                half: true,
                grey: true,
            },
        );
        assert_eq!(message.dimensions(), Dimensions::new(2, 1));
        assert_eq!(message.encoding, Encoding::Mono8);
        assert_eq!(message.step, 2);
        assert_eq!(message.data.len(), 2);
    }

    #[test]
    fn encode_writes_header_then_pixels() {
        let message = ImageMessage {
            height: 1,
            width: 2,
            encoding: Encoding::Mono8,
            is_bigendian: 0,
            step: 2,
            data: vec![7, 9],
        };
        let bytes = message.encode();
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(bytes[8], 5);
        assert_eq!(&bytes[9..14], b"mono8");
        assert_eq!(bytes[14], 0);
        assert_eq!(&bytes[15..19], &2u32.to_le_bytes());
        assert_eq!(&bytes[19..23], &2u32.to_le_bytes());
        assert_eq!(&bytes[23..], &[7, 9]);
    }
}
