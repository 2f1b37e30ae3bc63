//! Pixel post-processing applied to grabbed RGB24 frames before republishing.

use crate::frame::{Dimensions, CHANNELS};

/// Halve both dimensions by averaging each 2x2 block (integer mean).
///
/// An odd last row or column is dropped. Returns the smaller frame and its size.
pub fn halve(rgb: &[u8], dimensions: Dimensions) -> (Vec<u8>, Dimensions) {
    let width = dimensions.width as usize;
    let out_dims = Dimensions::new(dimensions.width / 2, dimensions.height / 2);
    let (out_w, out_h) = (out_dims.width as usize, out_dims.height as usize);
    let mut out = vec![0u8; out_w * out_h * CHANNELS];

    for y in 0..out_h {
        let top = (y * 2) * width;
        let bottom = (y * 2 + 1) * width;
        for x in 0..out_w {
            let quad = [top + x * 2, top + x * 2 + 1, bottom + x * 2, bottom + x * 2 + 1];
            for channel in 0..CHANNELS {
                let sum: u32 = quad
                    .iter()
                    .map(|pixel| u32::from(rgb[pixel * CHANNELS + channel]))
                    .sum();
                out[(y * out_w + x) * CHANNELS + channel] = (sum / 4) as u8;
            }
        }
    }
    (out, out_dims)
}

/// Reduce packed RGB24 to one byte per pixel: `(r + g + b) / 3`.
pub fn grey(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(CHANNELS)
        .map(|px| ((u16::from(px[0]) + u16::from(px[1]) + u16::from(px[2])) / 3) as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halve_averages_blocks() {
        // 2x2 RGB frame
        let rgb = [
            10, 0, 255, 20, 0, 255, //
            30, 0, 255, 41, 3, 254,
        ];
        let (out, dims) = halve(&rgb, Dimensions::new(2, 2));
        assert_eq!(dims, Dimensions::new(1, 1));
        assert_eq!(out, vec![25, 0, 254]);
    }

    #[test]
    fn halve_drops_odd_edge() {
        let rgb = vec![100u8; 3 * 3 * CHANNELS];
        let (out, dims) = halve(&rgb, Dimensions::new(3, 3));
        assert_eq!(dims, Dimensions::new(1, 1));
        assert_eq!(out, vec![100, 100, 100]);
    }

    #[test]
    fn grey_is_channel_mean() {
        assert_eq!(grey(&[255, 255, 255, 0, 0, 2, 10, 20, 31]), vec![255, 0, 20]);
    }
}
