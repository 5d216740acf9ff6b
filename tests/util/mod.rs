//! Configuration descriptor fixtures for integration tests.
//!
//! The blobs mirror the descriptor layout of real capture devices: a video
//! interface association with format/frame descriptors followed by an audio
//! function with its class-specific interface and endpoint records.

#![allow(dead_code)]

use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uvcap::desc::Descriptors;

/// Initializes test logging; safe to call from every test.
pub fn init_log() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

/// GUID tail shared by the uncompressed format GUIDs.
const GUID_TAIL: [u8; 12] =
    [0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xaa, 0x00, 0x38, 0x9b, 0x71];

/// Incremental configuration descriptor builder.
pub struct ConfigBuilder {
    blob: Vec<u8>,
    interfaces: u8,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        // wTotalLength and bNumInterfaces are patched in build()
        Self { blob: vec![9, 0x02, 0, 0, 0, 1, 0, 0x80, 0xfa], interfaces: 0 }
    }

    fn push(&mut self, bytes: &[u8]) -> &mut Self {
        self.blob.extend_from_slice(bytes);
        self
    }

    pub fn iad(&mut self, first: u8, count: u8, class: u8, sub_class: u8) -> &mut Self {
        self.push(&[8, 0x0b, first, count, class, sub_class, 0x00, 0])
    }

    pub fn interface(
        &mut self,
        number: u8,
        alt: u8,
        num_endpoints: u8,
        class: u8,
        sub_class: u8,
    ) -> &mut Self {
        if alt == 0 {
            self.interfaces += 1;
        }
        self.push(&[9, 0x04, number, alt, num_endpoints, class, sub_class, 0, 0])
    }

    pub fn endpoint(&mut self, address: u8, attributes: u8, max_packet: u16) -> &mut Self {
        let [lo, hi] = max_packet.to_le_bytes();
        self.push(&[7, 0x05, address, attributes, lo, hi, 1])
    }

    pub fn audio_endpoint(&mut self, address: u8, max_packet: u16) -> &mut Self {
        let [lo, hi] = max_packet.to_le_bytes();
        // 9-byte audio variant with refresh and synch address
        self.push(&[9, 0x05, address, 0x05, lo, hi, 1, 0, 0])
    }

    pub fn vs_input_header(&mut self, num_formats: u8, endpoint: u8) -> &mut Self {
        self.push(&[13, 0x24, 0x01, num_formats, 13, 0, 0, endpoint, 0, 0, 0, 0, 0])
    }

    pub fn uncompressed_format(&mut self, index: u8, frames: u8, fourcc: &[u8; 4]) -> &mut Self {
        let mut d = vec![27, 0x24, 0x04, index, frames];
        d.extend_from_slice(fourcc);
        d.extend_from_slice(&GUID_TAIL);
        d.extend_from_slice(&[16, 1, 0, 0, 0, 0]);
        self.push(&d)
    }

    pub fn mjpeg_format(&mut self, index: u8, frames: u8) -> &mut Self {
        self.push(&[11, 0x24, 0x06, index, frames, 0x01, 1, 0, 0, 0, 0])
    }

    fn frame(&mut self, subtype: u8, index: u8, w: u16, h: u16, interval: u32) -> &mut Self {
        let mut d = vec![30, 0x24, subtype, index, 0x00];
        d.extend_from_slice(&w.to_le_bytes());
        d.extend_from_slice(&h.to_le_bytes());
        d.extend_from_slice(&[0; 12]); // bit rates and frame buffer size
        d.extend_from_slice(&interval.to_le_bytes());
        d.extend_from_slice(&[1, 0, 0, 0, 0]);
        self.push(&d)
    }

    pub fn uncompressed_frame(&mut self, index: u8, w: u16, h: u16, interval: u32) -> &mut Self {
        self.frame(0x05, index, w, h, interval)
    }

    pub fn mjpeg_frame(&mut self, index: u8, w: u16, h: u16, interval: u32) -> &mut Self {
        self.frame(0x07, index, w, h, interval)
    }

    pub fn audio_as_general(&mut self, format_tag: u16) -> &mut Self {
        let [lo, hi] = format_tag.to_le_bytes();
        self.push(&[7, 0x24, 0x01, 1, 1, lo, hi])
    }

    pub fn audio_format_type(
        &mut self,
        channels: u8,
        sub_frame: u8,
        bits: u8,
        rates: &[u32],
    ) -> &mut Self {
        let mut d = vec![0, 0x24, 0x02, 1, channels, sub_frame, bits, rates.len() as u8];
        for rate in rates {
            d.extend_from_slice(&rate.to_le_bytes()[..3]);
        }
        d[0] = d.len() as u8;
        self.push(&d)
    }

    pub fn build(&self) -> Descriptors {
        let mut blob = self.blob.clone();
        let total = blob.len() as u16;
        blob[2..4].copy_from_slice(&total.to_le_bytes());
        blob[4] = self.interfaces;
        Descriptors::new(blob)
    }
}

/// Frame interval constants in 100 ns units.
pub const FPS_60: u32 = 166_666;
pub const FPS_59: u32 = 169_491;
pub const FPS_30: u32 = 333_333;
pub const FPS_24: u32 = 416_666;

/// Appends the UAC function shared by the fixtures: zero-bandwidth alt 0,
/// streaming alt 1 with an IN endpoint, PCM16 stereo at 48 kHz and 96 kHz.
fn audio_function(builder: &mut ConfigBuilder) {
    builder
        .iad(2, 2, 0x01, 0x02)
        .interface(2, 0, 0, 0x01, 0x01)
        .interface(3, 0, 0, 0x01, 0x02)
        .interface(3, 1, 1, 0x01, 0x02)
        .audio_as_general(0x0001)
        .audio_format_type(2, 2, 16, &[48_000, 96_000])
        .audio_endpoint(0x84, 0x200);
}

/// MS2130-style generic capture stick: 4K capable, YUY2 preferred, MJPG
/// fallback, UAC audio function.
pub fn ms2130() -> Descriptors {
    let mut b = ConfigBuilder::new();
    b.iad(0, 2, 0x0e, 0x03)
        .interface(0, 0, 0, 0x0e, 0x01)
        .interface(1, 0, 1, 0x0e, 0x02)
        .vs_input_header(2, 0x81)
        .uncompressed_format(1, 3, b"YUY2")
        .uncompressed_frame(1, 1920, 1080, FPS_60)
        .uncompressed_frame(2, 3840, 2160, FPS_30)
        .uncompressed_frame(3, 1280, 720, FPS_60)
        .mjpeg_format(2, 2)
        .mjpeg_frame(1, 1920, 1080, FPS_60)
        .mjpeg_frame(2, 3840, 2160, FPS_30)
        .endpoint(0x81, 0x02, 0x400);
    audio_function(&mut b);
    b.build()
}

/// Cam Link 4K: NV12 at 2160p24, YUY2 at 1080p60.
pub fn camlink_4k() -> Descriptors {
    let mut b = ConfigBuilder::new();
    b.iad(0, 2, 0x0e, 0x03)
        .interface(0, 0, 0, 0x0e, 0x01)
        .interface(1, 0, 1, 0x0e, 0x02)
        .vs_input_header(2, 0x81)
        .uncompressed_format(1, 1, b"NV12")
        .uncompressed_frame(1, 3840, 2160, FPS_24)
        .uncompressed_format(2, 2, b"YUY2")
        .uncompressed_frame(1, 1920, 1080, FPS_60)
        .uncompressed_frame(2, 1280, 720, FPS_60)
        .endpoint(0x81, 0x02, 0x400);
    audio_function(&mut b);
    b.build()
}

/// Cam Link variant whose default 1080p interval is 59 fps and which has no
/// 60 fps entry at that resolution.
pub fn camlink_59() -> Descriptors {
    let mut b = ConfigBuilder::new();
    b.iad(0, 2, 0x0e, 0x03)
        .interface(0, 0, 0, 0x0e, 0x01)
        .interface(1, 0, 1, 0x0e, 0x02)
        .vs_input_header(1, 0x81)
        .uncompressed_format(1, 2, b"YUY2")
        .uncompressed_frame(1, 1920, 1080, FPS_59)
        .uncompressed_frame(2, 1280, 720, FPS_30)
        .endpoint(0x81, 0x02, 0x400);
    audio_function(&mut b);
    b.build()
}

/// Hagibis capture stick: single YUY2 1080p60 mode.
pub fn hagibis() -> Descriptors {
    let mut b = ConfigBuilder::new();
    b.iad(0, 2, 0x0e, 0x03)
        .interface(0, 0, 0, 0x0e, 0x01)
        .interface(1, 0, 1, 0x0e, 0x02)
        .vs_input_header(1, 0x81)
        .uncompressed_format(1, 2, b"YUY2")
        .uncompressed_frame(1, 1920, 1080, FPS_60)
        .uncompressed_frame(2, 1280, 720, FPS_60)
        .endpoint(0x81, 0x02, 0x400);
    audio_function(&mut b);
    b.build()
}
