//! Typed facade over the streaming engines.
//!
//! The boundary between the state machine and the streamers: every
//! operation is marshalled onto the event loop thread and reported back as
//! a [`StreamStatus`] pair of success flag and message, so the state
//! machine never inspects raw error codes and no native call overlaps
//! another.

use std::sync::{Arc, Mutex};

use futures::{future::BoxFuture, FutureExt};

use crate::{
    audio::{AudioSink, PcmParams, PerformanceMode, UsbAudioStreamer, UsbDeviceIo},
    desc::{AudioStreamingConnection, VideoStreamingConnection},
    event_loop::EventLoop,
    select::{best_format, Target},
    state::{DeviceInfo, StreamDriver, StreamStatus},
    video::{StreamProfile, UsbVideoStreamer, UvcDevice, UvcFrameFormat, VideoSurface},
    DeviceSpeed, Error, Result,
};

/// Object-safe view of an audio streamer.
pub trait AudioStreaming: Send {
    /// Starts streaming.
    fn start(&mut self) -> Result<()>;
    /// Stops streaming and re-arms.
    fn stop(&mut self) -> Result<()>;
    /// Whether audio is flowing.
    fn is_playing(&self) -> bool;
    /// Negotiated USB device speed.
    fn device_speed(&self) -> DeviceSpeed;
    /// Summary line for UIs.
    fn stats_summary(&self) -> String;
}

impl<D: UsbDeviceIo, S: AudioSink> AudioStreaming for UsbAudioStreamer<D, S> {
    fn start(&mut self) -> Result<()> {
        UsbAudioStreamer::start(self)
    }

    fn stop(&mut self) -> Result<()> {
        UsbAudioStreamer::stop(self)
    }

    fn is_playing(&self) -> bool {
        UsbAudioStreamer::is_playing(self)
    }

    fn device_speed(&self) -> DeviceSpeed {
        UsbAudioStreamer::device_speed(self)
    }

    fn stats_summary(&self) -> String {
        UsbAudioStreamer::stats_summary(self)
    }
}

/// Object-safe view of a video streamer.
pub trait VideoStreaming: Send {
    /// Whether stream control negotiation succeeded.
    fn is_negotiated(&self) -> bool;
    /// Opens the stream onto the surface.
    fn configure_output(&mut self, surface: Box<dyn VideoSurface>) -> Result<()>;
    /// Starts frame delivery.
    fn start(&mut self) -> Result<()>;
    /// Stops frame delivery.
    fn stop(&mut self) -> Result<()>;
    /// Summary line for UIs.
    fn stats_summary(&self) -> String;
}

impl<D: UvcDevice> VideoStreaming for UsbVideoStreamer<D> {
    fn is_negotiated(&self) -> bool {
        UsbVideoStreamer::is_negotiated(self)
    }

    fn configure_output(&mut self, surface: Box<dyn VideoSurface>) -> Result<()> {
        UsbVideoStreamer::configure_output(self, surface)
    }

    fn start(&mut self) -> Result<()> {
        UsbVideoStreamer::start(self)
    }

    fn stop(&mut self) -> Result<()> {
        UsbVideoStreamer::stop(self)
    }

    fn stats_summary(&self) -> String {
        UsbVideoStreamer::stats_summary(self)
    }
}

/// Builds an audio streamer for a device; runs on the event loop thread.
pub type AudioFactory =
    Box<dyn FnMut(&DeviceInfo, &PcmParams) -> Result<Box<dyn AudioStreaming>> + Send>;

/// Builds a video streamer for a device; runs on the event loop thread.
pub type VideoFactory =
    Box<dyn FnMut(&DeviceInfo, &StreamProfile) -> Result<Box<dyn VideoStreaming>> + Send>;

#[derive(Default)]
struct Slots {
    audio: Option<Box<dyn AudioStreaming>>,
    video: Option<Box<dyn VideoStreaming>>,
}

/// Facade owning the streamers and the factories that build them.
pub struct StreamerFacade {
    event_loop: Arc<EventLoop>,
    target: Target,
    audio_factory: Arc<Mutex<AudioFactory>>,
    video_factory: Arc<Mutex<VideoFactory>>,
    slots: Arc<Mutex<Slots>>,
}

impl std::fmt::Debug for StreamerFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("StreamerFacade").field("target", &self.target).finish()
    }
}

impl StreamerFacade {
    /// Creates a facade that selects formats against `target` and builds
    /// streamers through the given factories.
    pub fn new(
        event_loop: Arc<EventLoop>,
        target: Target,
        audio_factory: AudioFactory,
        video_factory: VideoFactory,
    ) -> Self {
        Self {
            event_loop,
            target,
            audio_factory: Arc::new(Mutex::new(audio_factory)),
            video_factory: Arc::new(Mutex::new(video_factory)),
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    /// Derives the PCM parameters for an audio connection.
    pub fn pcm_params(audio: &AudioStreamingConnection) -> Result<PcmParams> {
        let format = audio.supported_audio_format().ok_or(Error::UnsupportedAudioFormat)?;
        let format_type = audio.format_type().ok_or(Error::NoSampleRate)?;
        let sample_rate = audio.sample_rate().ok_or(Error::NoSampleRate)?;
        Ok(PcmParams {
            format,
            sample_rate,
            sub_frame_size: format_type.sub_frame_size,
            channels: format_type.channels,
            performance_mode: PerformanceMode::LowLatency,
            frames_per_buffer: 0,
        })
    }

    async fn status_call(
        &self,
        task: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> StreamStatus {
        match self.event_loop.call(task).await {
            Ok(result) => result.into(),
            Err(err) => StreamStatus::failure(err.to_string()),
        }
    }

    /// Opens the audio streamer for the connection.
    pub async fn connect_audio(
        &self,
        device: DeviceInfo,
        audio: AudioStreamingConnection,
    ) -> StreamStatus {
        let params = match Self::pcm_params(&audio) {
            Ok(params) => params,
            Err(err) => return StreamStatus::failure(err.to_string()),
        };

        let factory = self.audio_factory.clone();
        let slots = self.slots.clone();
        self.status_call(move || {
            let mut factory = factory.lock().unwrap();
            let streamer = (*factory)(&device, &params)?;
            slots.lock().unwrap().audio = Some(streamer);
            Ok(())
        })
        .await
    }

    /// Opens the video streamer for the best-matching format and configures
    /// it onto the surface.
    pub async fn connect_video(
        &self,
        device: DeviceInfo,
        video: VideoStreamingConnection,
        surface: Box<dyn VideoSurface>,
    ) -> StreamStatus {
        let Some(format) = best_format(video.formats(), self.target) else {
            return StreamStatus::failure("no supported video format");
        };
        let Some(frame_format) = UvcFrameFormat::from_fourcc(format.fourcc) else {
            return StreamStatus::failure(format!("unsupported fourcc {}", format.fourcc));
        };
        let profile = StreamProfile {
            format: frame_format,
            width: format.width,
            height: format.height,
            fps: format.fps,
        };
        tracing::info!(%profile, "selected video format");

        let factory = self.video_factory.clone();
        let slots = self.slots.clone();
        self.status_call(move || {
            let mut factory = factory.lock().unwrap();
            let mut streamer = (*factory)(&device, &profile)?;
            let negotiated = streamer.is_negotiated();
            let res = if negotiated {
                streamer.configure_output(surface)
            } else {
                Err(Error::NegotiationFailed(profile.to_string()))
            };
            slots.lock().unwrap().video = Some(streamer);
            res
        })
        .await
    }

    /// Starts the audio stream.
    pub async fn start_audio(&self) -> StreamStatus {
        let slots = self.slots.clone();
        self.status_call(move || {
            match slots.lock().unwrap().audio.as_mut() {
                Some(streamer) => streamer.start(),
                None => Err(Error::InvalidStreamerState("no audio streamer")),
            }
        })
        .await
    }

    /// Stops the audio stream.
    pub async fn stop_audio(&self) -> StreamStatus {
        let slots = self.slots.clone();
        self.status_call(move || {
            match slots.lock().unwrap().audio.as_mut() {
                Some(streamer) => streamer.stop(),
                None => Err(Error::InvalidStreamerState("no audio streamer")),
            }
        })
        .await
    }

    /// Starts the video stream.
    pub async fn start_video(&self) -> StreamStatus {
        let slots = self.slots.clone();
        self.status_call(move || {
            match slots.lock().unwrap().video.as_mut() {
                Some(streamer) => streamer.start(),
                None => Err(Error::InvalidStreamerState("no video streamer")),
            }
        })
        .await
    }

    /// Stops the video stream.
    pub async fn stop_video(&self) -> StreamStatus {
        let slots = self.slots.clone();
        self.status_call(move || {
            match slots.lock().unwrap().video.as_mut() {
                Some(streamer) => streamer.stop(),
                None => Err(Error::InvalidStreamerState("no video streamer")),
            }
        })
        .await
    }

    /// Drops both streamers, releasing their device handles.
    pub async fn disconnect(&self) {
        let slots = self.slots.clone();
        let _ = self
            .event_loop
            .call(move || {
                let mut slots = slots.lock().unwrap();
                slots.audio = None;
                slots.video = None;
            })
            .await;
    }

    /// The USB speed of the audio device, when one is open.
    pub async fn device_speed(&self) -> DeviceSpeed {
        let slots = self.slots.clone();
        self.event_loop
            .call(move || {
                slots.lock().unwrap().audio.as_ref().map(|a| a.device_speed()).unwrap_or_default()
            })
            .await
            .unwrap_or_default()
    }

    /// Combined stats summary, audio line then video line.
    pub async fn stats_summary(&self) -> String {
        let slots = self.slots.clone();
        self.event_loop
            .call(move || {
                let slots = slots.lock().unwrap();
                let audio =
                    slots.audio.as_ref().map(|a| a.stats_summary()).unwrap_or_default();
                let video =
                    slots.video.as_ref().map(|v| v.stats_summary()).unwrap_or_default();
                format!("{audio}\n{video}")
            })
            .await
            .unwrap_or_default()
    }
}

impl StreamDriver for StreamerFacade {
    fn open_audio<'a>(
        &'a mut self,
        device: &'a DeviceInfo,
        audio: &'a AudioStreamingConnection,
    ) -> BoxFuture<'a, StreamStatus> {
        let device = device.clone();
        let audio = audio.clone();
        async move { self.connect_audio(device, audio).await }.boxed()
    }

    fn open_video<'a>(
        &'a mut self,
        device: &'a DeviceInfo,
        video: &'a VideoStreamingConnection,
        surface: Box<dyn VideoSurface>,
    ) -> BoxFuture<'a, StreamStatus> {
        let device = device.clone();
        let video = video.clone();
        async move { self.connect_video(device, video, surface).await }.boxed()
    }

    fn start_audio(&mut self) -> BoxFuture<'_, StreamStatus> {
        async move { StreamerFacade::start_audio(self).await }.boxed()
    }

    fn start_video(&mut self) -> BoxFuture<'_, StreamStatus> {
        async move { StreamerFacade::start_video(self).await }.boxed()
    }

    fn stop_audio(&mut self) -> BoxFuture<'_, StreamStatus> {
        async move { StreamerFacade::stop_audio(self).await }.boxed()
    }

    fn stop_video(&mut self) -> BoxFuture<'_, StreamStatus> {
        async move { StreamerFacade::stop_video(self).await }.boxed()
    }

    fn disconnect(&mut self) -> BoxFuture<'_, ()> {
        async move { StreamerFacade::disconnect(self).await }.boxed()
    }
}
