//! Debug dumps of published frames as binary PPM (rgb8) or PGM (mono8).

use anyhow::{Context, Result};
use image::{ExtendedColorType, ImageFormat};
use std::path::{Path, PathBuf};

use super::{Encoding, ImageMessage};

/// Writes every `every`-th offered frame into `dir`.
#[derive(Debug)]
pub struct FrameDumper {
    dir: PathBuf,
    every: u64,
    seen: u64,
}

impl FrameDumper {
    pub fn new(dir: impl Into<PathBuf>, every: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create dump dir {}", dir.display()))?;
        Ok(Self {
            dir,
            every: every.max(1),
            seen: 0,
        })
    }

    /// Count the frame and write it if it is due. Returns the written path.
    pub fn offer(&mut self, message: &ImageMessage) -> Result<Option<PathBuf>> {
        let index = self.seen;
        self.seen += 1;
        if index % self.every != 0 {
            return Ok(None);
        }
        let extension = match message.encoding {
            Encoding::Rgb8 => "ppm",
            Encoding::Mono8 => "pgm",
        };
        let path = self.dir.join(format!("frame_{:06}.{}", index, extension));
        write_pnm(&path, message)?;
        log::debug!("FrameDumper: wrote {}", path.display());
        Ok(Some(path))
    }
}

/// Write `message` as a binary netpbm file.
pub fn write_pnm(path: &Path, message: &ImageMessage) -> Result<()> {
    let color = match message.encoding {
        Encoding::Rgb8 => ExtendedColorType::Rgb8,
        Encoding::Mono8 => ExtendedColorType::L8,
    };
    image::save_buffer_with_format(
        path,
        &message.data,
        message.width,
        message.height,
        color,
        ImageFormat::Pnm,
    )
    .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Dimensions;
    use crate::republish::Processing;

    #[test]
    fn dumps_every_nth_frame_as_ppm() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dumper = FrameDumper::new(dir.path(), 2).expect("dumper");
        let dims = Dimensions::new(2, 2);
        let message = ImageMessage::from_rgb(&[200u8; 12], dims, Processing::default());

        let first = dumper.offer(&message).expect("offer").expect("written");
        assert!(dumper.offer(&message).expect("offer").is_none());
        assert!(dumper.offer(&message).expect("offer").is_some());

        let bytes = std::fs::read(&first).expect("read");
        assert!(bytes.starts_with(b"P6"));
        assert!(bytes.ends_with(&[200u8; 12]));
    }

    #[test]
    fn grey_frames_are_pgm() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dumper = FrameDumper::new(dir.path(), 1).expect("dumper");
        let message = ImageMessage::from_rgb(
            &[90u8; 12],
            Dimensions::new(2, 2),
            Processing {
                half: false,
                grey: true,
            },
        );
        let path = dumper.offer(&message).expect("offer").expect("written");
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("pgm"));
        let bytes = std::fs::read(&path).expect("read");
        assert!(bytes.starts_with(b"P5"));
        assert!(bytes.ends_with(&[90u8; 4]));
    }
}
