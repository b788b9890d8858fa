use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Global, 1-based session sequence number. 0 until the acquisition loop assigns it.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row.
    pub stride: u32,
    pub format: PixelFormat,
    /// Capture time in monotonic nanoseconds (device clock when available).
    pub timestamp_ns: i64,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Mono8,
    BayerBggr8,
    Rgb24,
    Bgr24,
    Bgra,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats; `None` for compressed, planar or
    /// macro-pixel layouts.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Mono8 | PixelFormat::BayerBggr8 => Some(1),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Bgra => Some(4),
            PixelFormat::Yuyv4 | PixelFormat::Mjpeg | PixelFormat::Nv12 => None,
        }
    }

    /// Bytes in one row of `width` pixels, for uncompressed single-plane formats.
    pub fn row_bytes(self, width: u32) -> Option<u32> {
        match self {
            PixelFormat::Yuyv4 => Some(width * 2),
            _ => self.bytes_per_pixel().map(|bpp| width * bpp),
        }
    }

    /// Smallest horizontal unit a subsample may keep or skip, as
    /// `(pixels, bytes)`. YUYV pixels share chroma in pairs, so its unit is
    /// one 4-byte macropixel. `None` when striding would corrupt the image.
    fn subsample_unit(self) -> Option<(u32, usize)> {
        match self {
            PixelFormat::Mono8 => Some((1, 1)),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some((1, 3)),
            PixelFormat::Bgra => Some((1, 4)),
            PixelFormat::Yuyv4 => Some((2, 4)),
            PixelFormat::BayerBggr8 | PixelFormat::Mjpeg | PixelFormat::Nv12 => None,
        }
    }

    /// Name of the matching ffmpeg `-pix_fmt`.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "gray",
            PixelFormat::BayerBggr8 => "bayer_bggr8",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Bgra => "bgra",
            PixelFormat::Yuyv4 => "yuyv422",
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::Nv12 => "nv12",
        }
    }
}

impl Frame {
    /// Wrap a freshly grabbed buffer. The sequence number is assigned later.
    pub fn new(
        data: Bytes,
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp_ns: i64,
    ) -> Self {
        let stride = format.row_bytes(width).unwrap_or(width);
        Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence: 0,
                width,
                height,
                stride,
                format,
                timestamp_ns,
            }),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn timestamp_ns(&self) -> i64 {
        self.meta.timestamp_ns
    }

    /// Stamp the global sequence number.
    pub fn sequenced(mut self, sequence: u64) -> Self {
        Arc::make_mut(&mut self.meta).sequence = sequence;
        self
    }

    /// Keep every `factor`-th pixel of every `factor`-th row.
    ///
    /// YUYV keeps every `factor`-th pixel pair, so its width stays even.
    /// Bayer, compressed and planar formats, and a factor of 1, get a
    /// read-only view of the same bytes at full size.
    pub fn downsample(&self, factor: u32) -> Frame {
        let meta = &self.meta;
        let (unit_px, unit_bytes) = match meta.format.subsample_unit() {
            Some(unit) if factor > 1 => unit,
            _ => return self.clone(),
        };

        let step = factor as usize;
        let units = meta.width.div_ceil(unit_px);
        let width = units.div_ceil(factor) * unit_px;
        let height = meta.height.div_ceil(factor);
        let src_stride = meta.stride as usize;
        let src_row = units as usize * unit_bytes;
        let row_bytes = (width / unit_px) as usize * unit_bytes;

        let mut out = BytesMut::with_capacity(row_bytes * height as usize);
        for row in (0..meta.height as usize).step_by(step) {
            let start = row * src_stride;
            let Some(line) = self.data.get(start..start + src_row) else {
                break;
            };
            for unit in line.chunks_exact(unit_bytes).step_by(step) {
                out.extend_from_slice(unit);
            }
        }

        Frame {
            data: out.freeze(),
            meta: Arc::new(FrameMetadata {
                width,
                height,
                stride: row_bytes as u32,
                ..meta.as_ref().clone()
            }),
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: u32, height: u32) -> Frame {
        let data: Vec<u8> = (0..width * height).map(|i| i as u8).collect();
        Frame::new(Bytes::from(data), width, height, PixelFormat::Mono8, 42)
    }

    #[test]
    fn downsample_strides_rows_and_columns() {
        let frame = ramp(4, 4).sequenced(7);
        let small = frame.downsample(2);
        assert_eq!(small.meta.width, 2);
        assert_eq!(small.meta.height, 2);
        assert_eq!(&small.data[..], &[0, 2, 8, 10]);
        assert_eq!(small.sequence(), 7);
        assert_eq!(small.timestamp_ns(), 42);
    }

    #[test]
    fn downsample_rounds_odd_sizes_up() {
        let small = ramp(5, 3).downsample(2);
        assert_eq!((small.meta.width, small.meta.height), (3, 2));
        assert_eq!(&small.data[..], &[0, 2, 4, 10, 12, 14]);
    }

    #[test]
    fn downsample_keeps_whole_rgb_pixels() {
        let data: Vec<u8> = (0..2 * 2 * 3).map(|i| i as u8).collect();
        let frame = Frame::new(Bytes::from(data), 2, 2, PixelFormat::Rgb24, 0);
        let small = frame.downsample(2);
        assert_eq!(&small.data[..], &[0, 1, 2]);
        assert_eq!(small.meta.stride, 3);
    }

    #[test]
    fn downsample_keeps_whole_yuyv_pairs() {
        // 8x2 YUYV: four macropixels per row, 16 bytes per row.
        let data: Vec<u8> = (0..2 * 16).map(|i| i as u8).collect();
        let frame = Frame::new(Bytes::from(data), 8, 2, PixelFormat::Yuyv4, 0);
        assert_eq!(frame.meta.stride, 16);

        let small = frame.downsample(2);
        assert_eq!((small.meta.width, small.meta.height), (4, 1));
        assert_eq!(small.meta.stride, 8);
        assert_eq!(&small.data[..], &[0, 1, 2, 3, 8, 9, 10, 11]);
    }

    #[test]
    fn yuyv_width_stays_even_when_pairs_do_not_divide() {
        // Three macropixels per row; factor 2 keeps the first and the third.
        let data: Vec<u8> = (0..3 * 12).map(|i| i as u8).collect();
        let frame = Frame::new(Bytes::from(data), 6, 3, PixelFormat::Yuyv4, 0);

        let small = frame.downsample(2);
        assert_eq!((small.meta.width, small.meta.height), (4, 2));
        assert_eq!(small.data.len(), 2 * 8);
        assert_eq!(&small.data[..8], &[0, 1, 2, 3, 8, 9, 10, 11]);
        assert_eq!(&small.data[8..], &[24, 25, 26, 27, 32, 33, 34, 35]);
    }

    #[test]
    fn compressed_frames_are_shared_not_subsampled() {
        let jpeg = Bytes::from_static(b"\xff\xd8jpeg");
        let frame = Frame::new(jpeg, 640, 480, PixelFormat::Mjpeg, 0);
        let view = frame.downsample(4);
        assert_eq!(view.data, frame.data);
        assert_eq!(view.meta.width, 640);
    }

    #[test]
    fn sequencing_does_not_touch_clones() {
        let frame = ramp(2, 2);
        let other = frame.clone();
        let stamped = frame.sequenced(3);
        assert_eq!(stamped.sequence(), 3);
        assert_eq!(other.sequence(), 0);
    }
}
