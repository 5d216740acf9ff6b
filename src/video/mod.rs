//! UVC video streaming engine.
//!
//! Opens a UVC stream with a selected format, validates and converts each
//! delivered frame into the sink surface and keeps frame-rate and timing
//! statistics.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

pub mod convert;
pub mod surface;
pub mod uvc;

pub use surface::{MemorySurface, SurfaceBuffer, SurfaceFormat, VideoSurface};
pub use uvc::{Frame, StreamCtrl, StreamProfile, UvcDevice, UvcFrameFormat, UvcStreamHandle};

use crate::{Error, Result};

/// Interval of the aggregate stats log line.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// How often the memoized fps value is refreshed.
const FPS_MEMO_INTERVAL: Duration = Duration::from_secs(1);

/// Frame-rate and timing statistics.
#[derive(Debug, Default)]
struct VideoStats {
    window_started: Option<Instant>,
    last_frame_at: Option<Instant>,
    last_fps_update: Option<Instant>,
    frames: u32,
    capture: Duration,
    render: Duration,
    fps: f32,
}

impl VideoStats {
    /// Called once per frame with the conversion duration.
    fn record_frame(&mut self, render: Duration) {
        let now = Instant::now();
        let window_started = *self.window_started.get_or_insert(now);

        if let Some(prev) = self.last_frame_at {
            self.capture += now - prev - render.min(now - prev);
        }
        self.last_frame_at = Some(now);
        self.render += render;
        self.frames += 1;

        let elapsed = now - window_started;
        if self
            .last_fps_update
            .map_or(true, |at| now - at >= FPS_MEMO_INTERVAL)
        {
            if !elapsed.is_zero() {
                self.fps = self.frames as f32 / elapsed.as_secs_f32();
            }
            self.last_fps_update = Some(now);
        }

        if elapsed >= STATS_LOG_INTERVAL {
            let busy = (self.capture + self.render).as_secs_f32().max(f32::EPSILON);
            tracing::info!(
                frames = self.frames,
                fps = self.fps,
                capture_share = self.capture.as_secs_f32() / busy,
                render_share = self.render.as_secs_f32() / busy,
                "video window: {:.1}s",
                elapsed.as_secs_f32(),
            );
            self.window_started = Some(now);
            self.frames = 0;
            self.capture = Duration::ZERO;
            self.render = Duration::ZERO;
        }
    }
}

/// Validates the payload size of a frame for its format.
fn frame_is_valid(frame: &Frame) -> bool {
    let pixels = frame.width as usize * frame.height as usize;
    match frame.format {
        UvcFrameFormat::Nv12 => {
            let expected = pixels * 3 / 2;
            if frame.data.len() != expected {
                tracing::warn!(
                    bytes = frame.data.len(),
                    expected,
                    width = frame.width,
                    height = frame.height,
                    "invalid NV12 frame size"
                );
                return false;
            }
            true
        }
        UvcFrameFormat::Yuy2 => {
            let expected = pixels * 2;
            if frame.data.len() != expected {
                tracing::warn!(
                    bytes = frame.data.len(),
                    expected,
                    width = frame.width,
                    height = frame.height,
                    "invalid YUY2 frame size"
                );
                return false;
            }
            true
        }
        UvcFrameFormat::Mjpeg => {
            // a JPEG starts with the SOI marker 0xff 0xd8
            if frame.data.len() < 6 || frame.data[0] != 0xff || frame.data[1] != 0xd8 {
                tracing::warn!(bytes = frame.data.len(), "invalid MJPG frame");
                return false;
            }
            true
        }
    }
}

/// Renders validated frames into the surface. Runs on the driver's frame
/// callback thread.
struct FrameRenderer {
    surface: Arc<Mutex<Box<dyn VideoSurface>>>,
    stats: Arc<Mutex<VideoStats>>,
}

impl FrameRenderer {
    fn handle(&mut self, frame: &Frame) {
        if !frame_is_valid(frame) {
            return;
        }

        let started = Instant::now();
        let mut surface = self.surface.lock().unwrap();
        // size validation guarantees packed rows, so the stride follows
        // from the frame width even when the driver reports a bogus step
        let res = surface.render(&mut |buffer| match frame.format {
            UvcFrameFormat::Nv12 => {
                convert::nv12_into(&frame.data, frame.width as usize, frame.height as usize, buffer)
            }
            UvcFrameFormat::Yuy2 => {
                convert::yuy2_into(&frame.data, frame.width as usize, frame.height as usize, buffer)
            }
            UvcFrameFormat::Mjpeg => {
                if let Err(err) = convert::mjpg_into(&frame.data, buffer) {
                    tracing::warn!(
                        bytes = frame.data.len(),
                        width = frame.width,
                        height = frame.height,
                        "{err}"
                    );
                }
            }
        });
        drop(surface);

        if let Err(err) = res {
            tracing::warn!("surface lock failed: {err}");
            return;
        }

        self.stats.lock().unwrap().record_frame(started.elapsed());
    }
}

/// UVC video streaming engine.
///
/// Construction negotiates the stream control record; whether negotiation
/// succeeded is queryable and also reported by the facade. The stream
/// itself is opened by [`configure_output`](Self::configure_output) once
/// the sink surface is available.
pub struct UsbVideoStreamer<D: UvcDevice> {
    dev: D,
    profile: StreamProfile,
    ctrl: Option<StreamCtrl>,
    stream: Option<D::Stream>,
    surface: Option<Arc<Mutex<Box<dyn VideoSurface>>>>,
    stats: Arc<Mutex<VideoStats>>,
    streaming: bool,
}

impl<D: UvcDevice> UsbVideoStreamer<D> {
    /// Negotiates `profile` with the device.
    ///
    /// Negotiation failure does not fail construction; it is recorded and
    /// reported through [`is_negotiated`](Self::is_negotiated) so the state
    /// machine can surface the reason.
    pub fn new(mut dev: D, profile: StreamProfile) -> Self {
        let ctrl = match dev.negotiate(&profile) {
            Ok(ctrl) => {
                tracing::info!(%profile, "stream control negotiated");
                Some(ctrl)
            }
            Err(err) => {
                tracing::warn!(%profile, "stream control negotiation failed: {err}");
                None
            }
        };

        Self {
            dev,
            profile,
            ctrl,
            stream: None,
            surface: None,
            stats: Arc::new(Mutex::new(VideoStats::default())),
            streaming: false,
        }
    }

    /// Whether stream control negotiation succeeded.
    pub fn is_negotiated(&self) -> bool {
        self.ctrl.is_some()
    }

    /// The negotiated profile.
    pub fn profile(&self) -> &StreamProfile {
        &self.profile
    }

    /// Opens the stream onto the given surface.
    pub fn configure_output(&mut self, surface: Box<dyn VideoSurface>) -> Result<()> {
        let Some(ctrl) = self.ctrl else {
            return Err(Error::NegotiationFailed(format!(
                "no stream control for {}",
                self.profile
            )));
        };

        if self.surface.is_none() {
            self.surface = Some(Arc::new(Mutex::new(surface)));
        }
        let stream = self.dev.open_stream(&ctrl)?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Starts frame delivery.
    pub fn start(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::InvalidStreamerState("video stream is not configured"));
        };
        if self.streaming {
            return Ok(());
        }

        let surface = self.surface.clone().ok_or(Error::NoSurface)?;
        let mut renderer = FrameRenderer { surface, stats: self.stats.clone() };
        stream.start(Box::new(move |frame| renderer.handle(frame)))?;
        self.streaming = true;
        Ok(())
    }

    /// Stops frame delivery. Idempotent when no stream is open.
    pub fn stop(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        stream.stop()?;
        self.streaming = false;
        Ok(())
    }

    /// Whether frames are currently being delivered.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// The memoized frame rate over the current stats window.
    pub fn current_fps(&self) -> f32 {
        self.stats.lock().unwrap().fps
    }

    /// Human-readable summary, e.g. `YUY2 1920x1080 @60 fps`.
    pub fn stats_summary(&self) -> String {
        format!(
            "{} {}x{} @{:.0} fps",
            self.profile.format.fourcc(),
            self.profile.width,
            self.profile.height,
            self.current_fps(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn frame(format: UvcFrameFormat, width: u32, height: u32, data: Vec<u8>) -> Frame {
        Frame { format, width, height, step: width as usize * 2, data: Bytes::from(data) }
    }

    #[test]
    fn nv12_size_validation() {
        let good = frame(UvcFrameFormat::Nv12, 4, 2, vec![0; 12]);
        let bad = frame(UvcFrameFormat::Nv12, 4, 2, vec![0; 11]);
        assert!(frame_is_valid(&good));
        assert!(!frame_is_valid(&bad));
    }

    #[test]
    fn yuy2_size_validation() {
        let good = frame(UvcFrameFormat::Yuy2, 4, 2, vec![0; 16]);
        let bad = frame(UvcFrameFormat::Yuy2, 4, 2, vec![0; 15]);
        assert!(frame_is_valid(&good));
        assert!(!frame_is_valid(&bad));
    }

    #[test]
    fn mjpg_soi_validation() {
        let mut data = vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10];
        assert!(frame_is_valid(&frame(UvcFrameFormat::Mjpeg, 4, 2, data.clone())));
        data[1] = 0xd9;
        assert!(!frame_is_valid(&frame(UvcFrameFormat::Mjpeg, 4, 2, data.clone())));
        assert!(!frame_is_valid(&frame(UvcFrameFormat::Mjpeg, 4, 2, vec![0xff, 0xd8])));
    }

    #[test]
    fn fps_memoization() {
        let mut stats = VideoStats::default();
        stats.record_frame(Duration::from_millis(1));
        // first frame memoizes immediately off a near-zero window
        assert!(stats.fps >= 0.0);
        assert_eq!(stats.frames, 1);
    }
}
