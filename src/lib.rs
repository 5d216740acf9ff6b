//! # USB video/audio capture core.
//!
//! This library ingests audio and video from a UVC/UAC capture device and
//! presents the decoded media to local sinks: a video surface and an audio
//! output stream.
//!
//! The pieces fit together as follows: the [`desc`] module tokenizes the
//! device's raw configuration descriptors and extracts the audio and video
//! streaming connections, [`select`] picks the best video format for a target
//! resolution, [`audio`] and [`video`] drive the actual streaming engines,
//! and [`state`] runs the device lifecycle state machine that coordinates
//! them. All native calls are serialized onto the [`event_loop`] thread and
//! surfaced to embedders through the [`facade`].
//!

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod audio;
pub mod desc;
pub mod error;
pub mod event_loop;
pub mod facade;
pub mod ring;
pub mod select;
pub mod state;
pub mod video;

pub use error::Error;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// USB interface class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsbClass {
    /// Class code.
    pub class: u8,
    /// Subclass code.
    pub sub_class: u8,
}

impl UsbClass {
    /// Audio device class code.
    pub const AUDIO: u8 = 0x01;
    /// Video device class code.
    pub const VIDEO: u8 = 0x0e;
    /// Miscellaneous device class code (composite devices with an IAD).
    pub const MISC: u8 = 0xef;

    /// Audio streaming interface subclass.
    pub const AUDIO_STREAMING: u8 = 0x02;
    /// Video streaming interface subclass.
    pub const VIDEO_STREAMING: u8 = 0x02;

    /// Creates a new USB interface class.
    pub const fn new(class: u8, sub_class: u8) -> Self {
        Self { class, sub_class }
    }
}

/// Four-character code identifying a pixel format.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    /// Packed 4:2:2 YUV.
    pub const YUY2: Self = Self(*b"YUY2");
    /// Planar 4:2:0 YUV with interleaved chroma.
    pub const NV12: Self = Self(*b"NV12");
    /// Motion JPEG.
    pub const MJPG: Self = Self(*b"MJPG");

    /// The four code bytes.
    pub const fn bytes(&self) -> [u8; 4] {
        self.0
    }
}

impl std::fmt::Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for b in self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "FourCc({self})")
    }
}

/// Speed of an attached USB device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSpeed {
    /// Speed could not be determined.
    #[default]
    Unknown,
    /// Low speed (1.5 MBit/s).
    Low,
    /// Full speed (12 MBit/s).
    Full,
    /// High speed (480 MBit/s).
    High,
    /// Super speed (5 GBit/s) or faster.
    Super,
}

impl From<rusb::Speed> for DeviceSpeed {
    fn from(speed: rusb::Speed) -> Self {
        match speed {
            rusb::Speed::Low => Self::Low,
            rusb::Speed::Full => Self::Full,
            rusb::Speed::High => Self::High,
            rusb::Speed::Super | rusb::Speed::SuperPlus => Self::Super,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for DeviceSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Full => "full",
            Self::High => "high",
            Self::Super => "super",
        };
        write!(f, "{name}")
    }
}
