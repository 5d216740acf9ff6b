//! Pixel format conversion into the surface buffer.
//!
//! BT.601 integer conversions for the uncompressed camera formats and a
//! host-side JPEG decode for MJPG payloads.

use crate::{
    video::surface::{SurfaceBuffer, SurfaceFormat},
    Error, Result,
};

#[inline]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// One BT.601 YUV sample to RGB.
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let r = clamp_u8((298 * c + 409 * e + 128) >> 8);
    let g = clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8);
    let b = clamp_u8((298 * c + 516 * d + 128) >> 8);
    (r, g, b)
}

/// Converts an NV12 frame (packed Y plane followed by interleaved UV) of
/// the given dimensions into the surface buffer.
///
/// Rows and columns outside the smaller of frame and surface are left
/// untouched.
pub fn nv12_into(src: &[u8], src_width: usize, src_height: usize, buffer: &mut SurfaceBuffer<'_>) {
    let width = (buffer.width as usize).min(src_width);
    let height = (buffer.height as usize).min(src_height);
    let bpp = buffer.format.bytes_per_pixel();
    let dst_stride = buffer.stride_bytes();
    let uv_plane = src_width * src_height;

    for row in 0..height {
        let y_row = &src[row * src_width..];
        let uv_row = &src[uv_plane + (row / 2) * src_width..];
        let dst_row = &mut buffer.bits[row * dst_stride..];

        for col in 0..width {
            let y = y_row[col];
            let uv = (col / 2) * 2;
            let u = uv_row[uv];
            let v = uv_row[uv + 1];
            let (r, g, b) = yuv_to_rgb(y, u, v);

            let px = &mut dst_row[col * bpp..col * bpp + bpp];
            px[0] = r;
            px[1] = g;
            px[2] = b;
            if buffer.format == SurfaceFormat::Rgba8888 {
                px[3] = 0xff;
            }
        }
    }
}

/// Converts a YUY2 frame (packed Y0 U Y1 V) of the given dimensions into
/// the surface buffer.
///
/// The surface must be RGBA.
pub fn yuy2_into(src: &[u8], src_width: usize, src_height: usize, buffer: &mut SurfaceBuffer<'_>) {
    let width = (buffer.width as usize).min(src_width);
    let height = (buffer.height as usize).min(src_height);
    let dst_stride = buffer.stride_bytes();

    for row in 0..height {
        let src_row = &src[row * src_width * 2..];
        let dst_row = &mut buffer.bits[row * dst_stride..];

        for pair in 0..width / 2 {
            let s = &src_row[pair * 4..pair * 4 + 4];
            let (y0, u, y1, v) = (s[0], s[1], s[2], s[3]);

            let (r, g, b) = yuv_to_rgb(y0, u, v);
            let px = &mut dst_row[pair * 8..pair * 8 + 4];
            px.copy_from_slice(&[r, g, b, 0xff]);

            let (r, g, b) = yuv_to_rgb(y1, u, v);
            let px = &mut dst_row[pair * 8 + 4..pair * 8 + 8];
            px.copy_from_slice(&[r, g, b, 0xff]);
        }
    }
}

/// Decodes an MJPG payload into the surface buffer.
///
/// On decode failure the buffer is zeroed so a stale frame is never posted.
pub fn mjpg_into(data: &[u8], buffer: &mut SurfaceBuffer<'_>) -> Result<()> {
    let decoded = match image::load_from_memory_with_format(data, image::ImageFormat::Jpeg) {
        Ok(img) => img.to_rgba8(),
        Err(err) => {
            buffer.clear();
            return Err(Error::NegotiationFailed(format!("MJPG decode failed: {err}")));
        }
    };

    let width = (buffer.width as usize).min(decoded.width() as usize);
    let rows = (buffer.height as usize).min(decoded.height() as usize);
    let src_stride = decoded.width() as usize * 4;
    let dst_stride = buffer.stride_bytes();
    let src = decoded.as_raw();

    for row in 0..rows {
        let src_row = &src[row * src_stride..row * src_stride + width * 4];
        buffer.bits[row * dst_stride..row * dst_stride + width * 4].copy_from_slice(src_row);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::video::surface::{MemorySurface, VideoSurface};

    fn rgba_at(pixels: &[u8], stride: usize, x: usize, y: usize) -> [u8; 4] {
        let off = y * stride * 4 + x * 4;
        [pixels[off], pixels[off + 1], pixels[off + 2], pixels[off + 3]]
    }

    #[test]
    fn yuy2_white_and_black() {
        // two pixels: white (Y=235) and black (Y=16), neutral chroma
        let src = [235u8, 128, 16, 128];
        let mut surface = MemorySurface::new(SurfaceFormat::Rgba8888, 2, 1);
        surface
            .render(&mut |buffer| yuy2_into(&src, 2, 1, buffer))
            .unwrap();

        let white = rgba_at(surface.pixels(), 2, 0, 0);
        let black = rgba_at(surface.pixels(), 2, 1, 0);
        assert_eq!(white, [255, 255, 255, 255]);
        assert_eq!(black, [0, 0, 0, 255]);
    }

    #[test]
    fn nv12_gray_midpoint() {
        // 2x2 gray frame: Y=126 with neutral chroma decodes to mid gray
        let src = [126u8, 126, 126, 126, 128, 128];
        let mut surface = MemorySurface::new(SurfaceFormat::Rgba8888, 2, 2);
        surface
            .render(&mut |buffer| nv12_into(&src, 2, 2, buffer))
            .unwrap();

        let px = rgba_at(surface.pixels(), 2, 1, 1);
        assert_eq!(px[3], 255);
        assert!(px[0] == px[1] && px[1] == px[2], "gray expected, got {px:?}");
        assert!((px[0] as i32 - 128).abs() <= 2);
    }

    #[test]
    fn nv12_to_rgb888() {
        let src = [235u8, 235, 235, 235, 128, 128];
        let mut surface = MemorySurface::new(SurfaceFormat::Rgb888, 2, 2);
        surface
            .render(&mut |buffer| nv12_into(&src, 2, 2, buffer))
            .unwrap();
        assert_eq!(&surface.pixels()[..3], &[255, 255, 255]);
    }

    #[test]
    fn invalid_mjpg_zeroes_the_buffer() {
        let mut surface = MemorySurface::new(SurfaceFormat::Rgba8888, 4, 4);
        surface
            .render(&mut |buffer| {
                buffer.bits.fill(0xaa);
                let res = mjpg_into(&[0xff, 0xd8, 0, 0, 0, 0], buffer);
                assert!(res.is_err());
            })
            .unwrap();
        assert!(surface.pixels().iter().all(|&b| b == 0));
    }
}
