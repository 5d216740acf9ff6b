//! Audio output sink.
//!
//! The streaming engine pulls PCM out of the ring buffer from inside the
//! sink's data callback; the callback thread is owned by the sink. The
//! [`AudioSink`] trait is the seam to the host audio API, with a
//! cpal-backed implementation behind the `playback` feature.

use std::time::Duration;

use crate::{desc::audio::AudioFormat, Result};

/// How long to wait for the sink to reach the requested stream state.
pub const SINK_STATE_TIMEOUT: Duration = Duration::from_millis(500);

/// Performance mode requested from the host audio API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PerformanceMode {
    /// No preference.
    #[default]
    None,
    /// Minimize latency at the cost of power.
    LowLatency,
    /// Minimize power at the cost of latency.
    PowerSaving,
}

/// PCM parameters for an audio output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmParams {
    /// Sample wire format.
    pub format: AudioFormat,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bytes per sample per channel.
    pub sub_frame_size: u8,
    /// Channel count.
    pub channels: u8,
    /// Requested performance mode.
    pub performance_mode: PerformanceMode,
    /// Frames per buffer hint from the embedder; 0 lets the sink decide.
    pub frames_per_buffer: u32,
}

/// Burst and capacity figures reported by an opened sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkCaps {
    /// Frames the sink pulls per data callback.
    pub frames_per_burst: u32,
    /// Total buffer capacity of the sink in frames.
    pub buffer_capacity_frames: u32,
}

/// Continuation decision returned by the data callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFlow {
    /// Keep pulling.
    Continue,
    /// Stop the stream.
    Stop,
}

/// Data producer installed into a sink.
///
/// Called on the sink's callback thread with the interleaved output buffer
/// to fill; `out.len()` is `frames * channels`.
pub type SinkDataFn = Box<dyn FnMut(&mut [i16]) -> SinkFlow + Send>;

/// Host audio output stream.
pub trait AudioSink: Send {
    /// Configures the output stream and reports its burst figures.
    fn open(&mut self, params: &PcmParams) -> Result<SinkCaps>;

    /// Registers the data producer. Must be called after [`open`](Self::open)
    /// and before [`start`](Self::start).
    fn install(&mut self, data_fn: SinkDataFn) -> Result<()>;

    /// Requests stream start and waits up to [`SINK_STATE_TIMEOUT`] for the
    /// stream to be running.
    fn start(&mut self) -> Result<()>;

    /// Requests stream stop and waits up to [`SINK_STATE_TIMEOUT`] for the
    /// stream to be stopped.
    fn stop(&mut self) -> Result<()>;

    /// Releases the stream. Further calls are rejected.
    fn close(&mut self);
}

#[cfg(feature = "playback")]
pub use playback::PlaybackSink;

#[cfg(feature = "playback")]
mod playback {
    use super::*;

    use std::{
        sync::mpsc,
        thread::{self, JoinHandle},
    };

    use crate::Error;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    enum Command {
        Build(PcmParams, SinkDataFn, mpsc::Sender<Result<()>>),
        Play(mpsc::Sender<Result<()>>),
        Pause(mpsc::Sender<Result<()>>),
        Close,
    }

    /// Default audio-device output sink backed by cpal.
    ///
    /// cpal streams are not `Send`, so the stream lives on a dedicated
    /// thread and is driven through a command channel; state-change waits
    /// are bounded by [`SINK_STATE_TIMEOUT`].
    pub struct PlaybackSink {
        tx: Option<mpsc::Sender<Command>>,
        thread: Option<JoinHandle<()>>,
        params: Option<PcmParams>,
    }

    impl PlaybackSink {
        /// Creates a sink for the default output device.
        pub fn new() -> Self {
            Self { tx: None, thread: None, params: None }
        }

        fn command(&self, build: impl FnOnce(mpsc::Sender<Result<()>>) -> Command) -> Result<()> {
            let tx = self.tx.as_ref().ok_or_else(|| Error::Sink("sink is closed".into()))?;
            let (ack_tx, ack_rx) = mpsc::channel();
            tx.send(build(ack_tx)).map_err(|_| Error::Sink("sink thread is gone".into()))?;
            match ack_rx.recv_timeout(SINK_STATE_TIMEOUT) {
                Ok(res) => res,
                Err(_) => Err(Error::StopTimeout("audio sink state change")),
            }
        }

        fn run(rx: mpsc::Receiver<Command>) {
            let mut stream: Option<cpal::Stream> = None;

            while let Ok(cmd) = rx.recv() {
                match cmd {
                    Command::Build(params, mut data_fn, ack) => {
                        let res = Self::build_stream(&params, move |out| {
                            let _ = data_fn(out);
                        });
                        let res = match res {
                            Ok(s) => {
                                stream = Some(s);
                                Ok(())
                            }
                            Err(err) => Err(err),
                        };
                        let _ = ack.send(res);
                    }
                    Command::Play(ack) => {
                        let res = match &stream {
                            Some(s) => s.play().map_err(|e| Error::Sink(e.to_string())),
                            None => Err(Error::Sink("no stream built".into())),
                        };
                        let _ = ack.send(res);
                    }
                    Command::Pause(ack) => {
                        let res = match &stream {
                            Some(s) => s.pause().map_err(|e| Error::Sink(e.to_string())),
                            None => Err(Error::Sink("no stream built".into())),
                        };
                        let _ = ack.send(res);
                    }
                    Command::Close => break,
                }
            }

            drop(stream);
        }

        fn build_stream(
            params: &PcmParams,
            mut fill: impl FnMut(&mut [i16]) + Send + 'static,
        ) -> Result<cpal::Stream> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| Error::Sink("no output device".into()))?;

            let config = cpal::StreamConfig {
                channels: params.channels.into(),
                sample_rate: cpal::SampleRate(params.sample_rate),
                buffer_size: if params.frames_per_buffer > 0 {
                    cpal::BufferSize::Fixed(params.frames_per_buffer)
                } else {
                    cpal::BufferSize::Default
                },
            };

            let stream = device
                .build_output_stream(
                    &config,
                    move |out: &mut [i16], _info| fill(out),
                    |err| tracing::warn!("audio output error: {err}"),
                    None,
                )
                .map_err(|e| Error::Sink(e.to_string()))?;

            // cpal streams start live; hold until start() is requested
            stream.pause().map_err(|e| Error::Sink(e.to_string()))?;
            Ok(stream)
        }
    }

    impl Default for PlaybackSink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl AudioSink for PlaybackSink {
        fn open(&mut self, params: &PcmParams) -> Result<SinkCaps> {
            if self.thread.is_some() {
                return Err(Error::Sink("sink already open".into()));
            }

            let (tx, rx) = mpsc::channel();
            let thread = thread::Builder::new()
                .name("capture-audio-sink".to_string())
                .spawn(move || Self::run(rx))
                .map_err(|e| Error::Sink(e.to_string()))?;

            self.tx = Some(tx);
            self.thread = Some(thread);
            self.params = Some(*params);

            // cpal exposes no burst size; one callback per 10 ms of audio
            // is the common device period
            let frames_per_burst = (params.sample_rate / 100).max(1);
            Ok(SinkCaps { frames_per_burst, buffer_capacity_frames: frames_per_burst * 8 })
        }

        fn install(&mut self, data_fn: SinkDataFn) -> Result<()> {
            let params = self.params.ok_or_else(|| Error::Sink("sink not open".into()))?;
            self.command(|ack| Command::Build(params, data_fn, ack))
        }

        fn start(&mut self) -> Result<()> {
            self.command(Command::Play)
        }

        fn stop(&mut self) -> Result<()> {
            self.command(Command::Pause)
        }

        fn close(&mut self) {
            if let Some(tx) = self.tx.take() {
                let _ = tx.send(Command::Close);
            }
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    impl Drop for PlaybackSink {
        fn drop(&mut self) {
            self.close();
        }
    }
}
