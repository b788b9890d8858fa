use crate::capture::{Frame, PixelFormat};
use crate::error::DisplayError;

/// Convert a preview frame to packed RGB24 for on-screen display.
pub fn to_rgb24(frame: &Frame) -> Result<Vec<u8>, DisplayError> {
    let meta = &frame.meta;
    let (width, height) = (meta.width as usize, meta.height as usize);
    let data = &frame.data[..];

    match meta.format {
        PixelFormat::Mjpeg => decode_mjpeg(data),
        PixelFormat::Rgb24 => Ok(packed(data, width, height, meta.stride as usize, 3)),
        PixelFormat::Bgr24 => {
            let mut rgb = packed(data, width, height, meta.stride as usize, 3);
            for px in rgb.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(rgb)
        }
        PixelFormat::Bgra => {
            let bgra = packed(data, width, height, meta.stride as usize, 4);
            Ok(bgra.chunks_exact(4).flat_map(|px| [px[2], px[1], px[0]]).collect())
        }
        // Raw Bayer is shown as intensity; good enough to aim a camera.
        PixelFormat::Mono8 | PixelFormat::BayerBggr8 => {
            let gray = packed(data, width, height, meta.stride as usize, 1);
            Ok(gray.iter().flat_map(|&v| [v, v, v]).collect())
        }
        PixelFormat::Nv12 => {
            let luma = data.get(..width * height).ok_or_else(|| short(data.len(), width * height))?;
            Ok(luma.iter().flat_map(|&v| [v, v, v]).collect())
        }
        PixelFormat::Yuyv4 => yuyv_to_rgb(data, width, height, meta.stride as usize),
    }
}

#[cfg(feature = "sdl-preview")]
fn decode_mjpeg(data: &[u8]) -> Result<Vec<u8>, DisplayError> {
    let mut decoder = jpeg_decoder::Decoder::new(data);
    decoder.decode().map_err(|e| DisplayError::Decode(e.to_string()))
}

#[cfg(not(feature = "sdl-preview"))]
fn decode_mjpeg(_data: &[u8]) -> Result<Vec<u8>, DisplayError> {
    Err(DisplayError::Unsupported(PixelFormat::Mjpeg))
}

fn short(got: usize, expected: usize) -> DisplayError {
    DisplayError::Decode(format!("frame has {got} bytes, expected at least {expected}"))
}

/// Copy `height` rows of `width * bpp` bytes, dropping row padding.
fn packed(data: &[u8], width: usize, height: usize, stride: usize, bpp: usize) -> Vec<u8> {
    let row = width * bpp;
    let stride = stride.max(row);
    let mut out = Vec::with_capacity(row * height);
    for line in data.chunks(stride).take(height) {
        out.extend_from_slice(&line[..row.min(line.len())]);
    }
    out
}

fn yuyv_to_rgb(
    data: &[u8],
    width: usize,
    height: usize,
    stride: usize,
) -> Result<Vec<u8>, DisplayError> {
    let packed = packed(data, width, height, stride, 2);
    if packed.len() < width * height * 2 {
        return Err(short(packed.len(), width * height * 2));
    }

    let mut rgb = Vec::with_capacity(width * height * 3);
    for quad in packed.chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    Ok(rgb)
}

// BT.601, integer approximation.
fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}
