//! Error type.

use std::io;

/// Errors produced by the capture core.
///
/// Errors from the USB library are mapped in one place ([`Error::from`]) so
/// the rest of the crate never inspects raw status codes. The facade
/// flattens these into `(ok, message)` pairs before they reach a UI.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration descriptors contain no audio streaming interface.
    #[error("No Audio Streaming Interface")]
    NoAudioStreamingInterface,

    /// The audio streaming interface has no IN endpoint.
    #[error("No Audio Input Endpoint")]
    NoAudioInputEndpoint,

    /// The audio function advertises no supported sample rate.
    #[error("No Sample Rate")]
    NoSampleRate,

    /// The audio function advertises an unsupported PCM format tag.
    #[error("Unsupported Audio Format")]
    UnsupportedAudioFormat,

    /// The configuration descriptors contain no video streaming interface.
    #[error("No Video Streaming Interface")]
    NoVideoStreamingInterface,

    /// Stream control negotiation with the device failed.
    #[error("stream control negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The streamer is not in a state that permits the requested operation.
    #[error("invalid streamer state: {0}")]
    InvalidStreamerState(&'static str),

    /// No isochronous transfer could be submitted.
    #[error("no transfer could be submitted")]
    NoTransferSubmitted,

    /// The device disappeared mid-operation.
    #[error("device is gone")]
    DeviceGone,

    /// Stopping the stream did not complete within its deadline.
    #[error("stop timed out: {0}")]
    StopTimeout(&'static str),

    /// The audio output sink reported a failure.
    #[error("audio sink: {0}")]
    Sink(String),

    /// No video surface has been configured.
    #[error("no video surface configured")]
    NoSurface,

    /// A task posted to the event loop panicked.
    #[error("event loop task panicked")]
    TaskPanicked,

    /// The event loop is shut down.
    #[error("event loop terminated")]
    EventLoopTerminated,

    /// An event-loop call was issued from the event-loop thread itself.
    #[error("call would deadlock the event loop")]
    WouldDeadlock,

    /// USB transport error.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error means the device was disconnected.
    pub fn is_device_gone(&self) -> bool {
        matches!(self, Self::DeviceGone | Self::Usb(rusb::Error::NoDevice))
    }
}

/// Maps a USB error to an [`io::ErrorKind`] for embedders that work with
/// `std::io` errors.
pub fn usb_error_kind(error: rusb::Error) -> io::ErrorKind {
    match error {
        rusb::Error::Io => io::ErrorKind::ConnectionAborted,
        rusb::Error::InvalidParam => io::ErrorKind::InvalidInput,
        rusb::Error::Access => io::ErrorKind::PermissionDenied,
        rusb::Error::NoDevice => io::ErrorKind::NotFound,
        rusb::Error::NotFound => io::ErrorKind::NotFound,
        rusb::Error::Busy => io::ErrorKind::AddrInUse,
        rusb::Error::Timeout => io::ErrorKind::TimedOut,
        rusb::Error::Overflow => io::ErrorKind::OutOfMemory,
        rusb::Error::Pipe => io::ErrorKind::BrokenPipe,
        rusb::Error::Interrupted => io::ErrorKind::Interrupted,
        rusb::Error::NoMem => io::ErrorKind::OutOfMemory,
        rusb::Error::NotSupported => io::ErrorKind::Unsupported,
        rusb::Error::BadDescriptor => io::ErrorKind::InvalidInput,
        rusb::Error::Other => io::ErrorKind::Other,
    }
}
