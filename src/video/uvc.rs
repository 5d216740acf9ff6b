//! UVC stream control seam.
//!
//! The low-level UVC protocol handshake (probe/commit negotiation and
//! payload reassembly) is performed by an external driver library; this
//! module specifies the calls the streamer makes against it. Tests and
//! embedders supply implementations of [`UvcDevice`].

use bytes::Bytes;

use crate::{FourCc, Result};

/// Frame formats the video streamer can negotiate.
///
/// The discriminants form the wire ordinal used by embedders when
/// marshalling a format across a language boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UvcFrameFormat {
    /// Packed 4:2:2 YUV.
    Yuy2 = 0,
    /// Planar 4:2:0 YUV with interleaved chroma.
    Nv12 = 1,
    /// Motion JPEG.
    Mjpeg = 2,
}

impl UvcFrameFormat {
    /// Maps a descriptor fourcc to the negotiable frame format.
    pub fn from_fourcc(fourcc: FourCc) -> Option<Self> {
        match fourcc {
            FourCc::YUY2 => Some(Self::Yuy2),
            FourCc::NV12 => Some(Self::Nv12),
            FourCc::MJPG => Some(Self::Mjpeg),
            _ => None,
        }
    }

    /// The fourcc for this format.
    pub fn fourcc(&self) -> FourCc {
        match self {
            Self::Yuy2 => FourCc::YUY2,
            Self::Nv12 => FourCc::NV12,
            Self::Mjpeg => FourCc::MJPG,
        }
    }

    /// Maps a wire ordinal back to the format.
    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Yuy2),
            1 => Some(Self::Nv12),
            2 => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

/// The stream profile requested from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfile {
    /// Frame format.
    pub format: UvcFrameFormat,
    /// Frame width in pixels.
    pub width: u16,
    /// Frame height in pixels.
    pub height: u16,
    /// Frame rate in frames per second.
    pub fps: u32,
}

impl std::fmt::Display for StreamProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {}x{} @{}fps", self.format.fourcc(), self.width, self.height, self.fps)
    }
}

/// A negotiated stream control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCtrl {
    /// The profile the device committed to.
    pub profile: StreamProfile,
    /// Maximum payload transfer size the device will send.
    pub max_payload_size: u32,
}

/// One decoded frame delivered by the driver.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame format.
    pub format: UvcFrameFormat,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row stride in bytes.
    pub step: usize,
    /// The payload bytes.
    pub data: Bytes,
}

/// Per-frame callback driven by the stream.
pub type FrameCallback = Box<dyn FnMut(&Frame) + Send>;

/// An open UVC stream.
pub trait UvcStreamHandle: Send {
    /// Starts frame delivery into the callback.
    fn start(&mut self, callback: FrameCallback) -> Result<()>;

    /// Stops frame delivery. Idempotent.
    fn stop(&mut self) -> Result<()>;
}

/// A UVC device the streamer negotiates with.
pub trait UvcDevice: Send {
    /// The stream type this device opens.
    type Stream: UvcStreamHandle;

    /// Negotiates a stream control record for the profile.
    fn negotiate(&mut self, profile: &StreamProfile) -> Result<StreamCtrl>;

    /// Opens the stream for a negotiated control record.
    fn open_stream(&mut self, ctrl: &StreamCtrl) -> Result<Self::Stream>;
}
