//! USB audio streaming engine.
//!
//! Pulls isochronous IN packets from the device into a lock-free PCM ring
//! buffer and feeds the host audio output sink from it. The USB event loop
//! is driven from the sink's data callback thread, so ring writes (transfer
//! completions) and ring reads happen on the same thread and the producer
//! clock is decoupled from the audio clock by the ring buffer alone.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use crate::{
    desc::{audio::AudioFormat, AudioStreamingConnection, Descriptors},
    ring::{ring_buffer, RingConsumer, RingProducer},
    DeviceSpeed, Error, Result,
};

pub mod libusb;
pub mod sink;

pub use sink::{AudioSink, PcmParams, PerformanceMode, SinkCaps, SinkDataFn, SinkFlow};

/// Timeout passed to each USB event-loop service call.
const EVENT_LOOP_TIMEOUT: Duration = Duration::from_micros(100);

/// How long one drain wait lasts while stopping.
const DRAIN_WAIT: Duration = Duration::from_millis(100);

/// How many drain waits are attempted while stopping.
const DRAIN_TRIES: u32 = 5;

/// Minimum interval between logs for failed packets.
const PACKET_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Interval of the aggregate stats log line.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Lifecycle state of a streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamerState {
    /// Construction has not finished.
    Initial = 0,
    /// Armed; `start` may be called.
    ReadyToStart = 1,
    /// Start requested, sink spinning up.
    Starting = 2,
    /// Audio is flowing.
    Started = 3,
    /// Stop requested, transfers draining.
    Stopping = 4,
    /// Stopped for good.
    Stopped = 5,
    /// Tear-down in progress.
    Destroying = 6,
    /// Torn down.
    Destroyed = 7,
    /// Unrecoverable failure; `start` is rejected.
    Error = 8,
}

impl StreamerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initial,
            1 => Self::ReadyToStart,
            2 => Self::Starting,
            3 => Self::Started,
            4 => Self::Stopping,
            5 => Self::Stopped,
            6 => Self::Destroying,
            7 => Self::Destroyed,
            _ => Self::Error,
        }
    }
}

/// Sizing of the isochronous transfer pool and the ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLayout {
    /// Isochronous packets per transfer.
    pub num_packets: usize,
    /// Buffer bytes per transfer.
    pub buffer_size: usize,
    /// Number of transfers in flight.
    pub num_transfers: usize,
    /// Ring buffer capacity in samples.
    pub ring_capacity: usize,
}

impl TransferLayout {
    /// Derives the pool layout from the sink burst figures and the endpoint
    /// packet size.
    pub fn derive(caps: &SinkCaps, params: &PcmParams, max_packet_size: u16) -> Self {
        let max_packet = usize::from(max_packet_size).max(1);
        let sub_frame = usize::from(params.sub_frame_size).max(1);
        let frames_per_burst = caps.frames_per_burst.max(1) as usize;

        let bytes_per_burst = frames_per_burst * sub_frame * usize::from(params.channels);
        let num_packets = bytes_per_burst.div_ceil(max_packet).max(2);
        let buffer_size = max_packet * num_packets;
        let num_transfers =
            (caps.buffer_capacity_frames as usize).div_ceil(frames_per_burst).max(2);
        let ring_capacity = buffer_size * num_transfers / sub_frame;

        Self { num_packets, buffer_size, num_transfers, ring_capacity }
    }
}

/// Pool of in-flight isochronous transfers.
pub trait TransferPool: Send {
    /// Submits every transfer; returns how many submissions succeeded.
    fn submit_all(&mut self) -> usize;

    /// Number of transfers currently submitted.
    fn active(&self) -> usize;

    /// Cancels all submitted transfers.
    fn cancel_all(&mut self);
}

/// Drives the USB event loop from the sink callback thread.
pub trait UsbEventPump: Send + Sync {
    /// Services pending USB events, bounded by `timeout` and gated by the
    /// stop flag.
    fn handle_events(&self, timeout: Duration, stop: &AtomicI32);
}

/// The USB operations the audio streamer performs against a device.
///
/// The production implementation is [`libusb::LibusbDeviceIo`]; tests drive
/// the streamer with in-memory fakes.
pub trait UsbDeviceIo: Send {
    /// Negotiated connection speed.
    fn speed(&self) -> DeviceSpeed;

    /// Reads the active configuration descriptor blob.
    fn read_config_descriptor(&mut self) -> Result<Descriptors>;

    /// Whether a kernel driver is bound to the interface.
    fn kernel_driver_active(&self, interface: u8) -> Result<bool>;

    /// Detaches the kernel driver from the interface.
    fn detach_kernel_driver(&mut self, interface: u8) -> Result<()>;

    /// Reattaches the kernel driver to the interface.
    fn attach_kernel_driver(&mut self, interface: u8) -> Result<()>;

    /// Claims the interface.
    fn claim_interface(&mut self, interface: u8) -> Result<()>;

    /// Releases a claimed interface.
    fn release_interface(&mut self, interface: u8) -> Result<()>;

    /// Selects the alternate setting of the interface.
    fn set_alternate_setting(&mut self, interface: u8, alt_setting: u8) -> Result<()>;

    /// The event pump shared with the sink callback thread.
    fn event_pump(&self) -> Arc<dyn UsbEventPump>;

    /// Allocates the isochronous transfer pool for the endpoint.
    fn create_iso_pool(
        &mut self,
        endpoint: u8,
        max_packet_size: u16,
        layout: &TransferLayout,
        shared: Arc<AudioShared>,
        producer: RingProducer,
    ) -> Result<Box<dyn TransferPool>>;
}

/// Streaming statistics over the current aggregation window.
#[derive(Debug, Default, Clone, Copy)]
struct AudioStats {
    window_started: Option<Instant>,
    total_bytes: u64,
    samples: u64,
    player_callbacks: u32,
    usb_callbacks: u32,
    event_loops: u32,
}

/// State shared between the streamer, the transfer completions and the sink
/// data callback.
pub struct AudioShared {
    state: AtomicU8,
    stop_flag: AtomicI32,
    active_transfers: AtomicUsize,
    device_gone: AtomicBool,
    drain_lock: Mutex<()>,
    drained: Condvar,
    stats: Mutex<AudioStats>,
    last_packet_error_log: Mutex<Option<Instant>>,
}

impl AudioShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(StreamerState::Initial as u8),
            stop_flag: AtomicI32::new(0),
            active_transfers: AtomicUsize::new(0),
            device_gone: AtomicBool::new(false),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
            stats: Mutex::new(AudioStats::default()),
            last_packet_error_log: Mutex::new(None),
        })
    }

    /// Current streamer state.
    pub fn state(&self) -> StreamerState {
        StreamerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StreamerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The stop flag handed to the USB event pump.
    pub fn stop_flag(&self) -> &AtomicI32 {
        &self.stop_flag
    }

    /// Whether the device reported `NO_DEVICE` on a transfer.
    pub fn is_device_gone(&self) -> bool {
        self.device_gone.load(Ordering::Acquire)
    }

    /// Marks the device as gone; its transfers are not resubmitted.
    pub fn set_device_gone(&self) {
        self.device_gone.store(true, Ordering::Release);
    }

    /// Registers submitted transfers.
    pub fn transfers_submitted(&self, count: usize) {
        self.active_transfers.fetch_add(count, Ordering::AcqRel);
    }

    /// Registers one completed (no longer submitted) transfer.
    pub fn transfer_completed(&self) -> usize {
        self.active_transfers.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    /// Number of transfers currently submitted.
    pub fn active_transfers(&self) -> usize {
        self.active_transfers.load(Ordering::Acquire)
    }

    /// Wakes a stop waiting for the transfer pool to drain.
    pub fn notify_drained(&self) {
        let _guard = self.drain_lock.lock().unwrap();
        self.drained.notify_one();
    }

    fn wait_drained(&self, timeout: Duration) {
        let guard = self.drain_lock.lock().unwrap();
        let _ = self.drained.wait_timeout(guard, timeout).unwrap();
    }

    /// Logs a failed packet status, rate-limited to one log per minute.
    pub fn note_packet_error(&self, status: i32) {
        let mut last = self.last_packet_error_log.lock().unwrap();
        let now = Instant::now();
        if last.map_or(true, |at| now - at > PACKET_ERROR_LOG_INTERVAL) {
            tracing::warn!(status, "isochronous packet failed");
            *last = Some(now);
        }
    }

    /// Accounts for payload received from the device and emits the
    /// aggregate log line once per window.
    pub fn record_usb_payload(&self, bytes: usize, samples: usize) {
        let mut stats = self.stats.lock().unwrap();
        let now = Instant::now();
        let started = *stats.window_started.get_or_insert(now);
        stats.total_bytes += bytes as u64;
        stats.samples += samples as u64;
        stats.usb_callbacks += 1;

        let elapsed = now - started;
        if elapsed >= STATS_LOG_INTERVAL {
            let secs = elapsed.as_secs_f32();
            tracing::info!(
                player_callbacks = stats.player_callbacks,
                usb_callbacks = stats.usb_callbacks,
                event_loops = stats.event_loops,
                bytes = stats.total_bytes,
                speed_bps = (stats.total_bytes as f32 / secs) as u64,
                "audio window: {:.1}s",
                secs,
            );
            *stats = AudioStats { window_started: Some(now), ..AudioStats::default() };
        }
    }

    fn record_player_callback(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.player_callbacks += 1;
        stats.event_loops += 1;
    }

    fn reset_stats(&self) {
        *self.stats.lock().unwrap() = AudioStats::default();
    }
}

impl std::fmt::Debug for AudioShared {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AudioShared")
            .field("state", &self.state())
            .field("active_transfers", &self.active_transfers())
            .finish()
    }
}

/// The resolved audio streaming interface.
#[derive(Debug, Clone, Copy)]
struct ResolvedInterface {
    interface: u8,
    alt_setting: u8,
    endpoint: u8,
    max_packet_size: u16,
}

/// USB audio streaming engine.
///
/// Construction resolves the audio streaming interface from the device's
/// configuration descriptors, opens the output sink, claims the interface
/// and allocates the isochronous transfer pool. The streamer is then armed
/// (`ReadyToStart`); [`start`](Self::start) submits the transfers and
/// starts the sink.
pub struct UsbAudioStreamer<D: UsbDeviceIo, S: AudioSink> {
    dev: D,
    sink: S,
    params: PcmParams,
    connection: AudioStreamingConnection,
    resolved: ResolvedInterface,
    layout: TransferLayout,
    shared: Arc<AudioShared>,
    pool: Option<Box<dyn TransferPool>>,
    claimed_interface: Option<u8>,
    detached_interface: Option<u8>,
}

impl<D: UsbDeviceIo, S: AudioSink> std::fmt::Debug for UsbAudioStreamer<D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("UsbAudioStreamer")
            .field("params", &self.params)
            .field("resolved", &self.resolved)
            .field("shared", &self.shared)
            .finish()
    }
}

impl<D: UsbDeviceIo, S: AudioSink> UsbAudioStreamer<D, S> {
    /// Builds a streamer over an opened device.
    pub fn new(mut dev: D, mut sink: S, params: PcmParams) -> Result<Self> {
        let descriptors = dev.read_config_descriptor()?;
        let connection = AudioStreamingConnection::parse(&descriptors);
        if let Some(reason) = connection.failure_reason() {
            return Err(reason);
        }

        let interface = *connection.interface().unwrap();
        let endpoint = *connection.endpoint().unwrap();
        if endpoint.max_packet_size == 0 {
            return Err(Error::NoAudioInputEndpoint);
        }
        let resolved = ResolvedInterface {
            interface: interface.interface_number,
            alt_setting: interface.alternate_setting,
            endpoint: endpoint.endpoint_address,
            max_packet_size: endpoint.max_packet_size,
        };
        tracing::debug!(
            interface = resolved.interface,
            endpoint = resolved.endpoint,
            max_packet_size = resolved.max_packet_size,
            "resolved audio streaming interface"
        );

        let caps = sink.open(&params)?;
        tracing::debug!(
            frames_per_burst = caps.frames_per_burst,
            buffer_capacity_frames = caps.buffer_capacity_frames,
            "audio sink opened"
        );

        // claims acquired so far are rolled back on any later failure
        fn rollback<D: UsbDeviceIo>(dev: &mut D, claimed: Option<u8>, detached: Option<u8>) {
            if let Some(interface) = claimed {
                let _ = dev.release_interface(interface);
            }
            if let Some(interface) = detached {
                let _ = dev.attach_kernel_driver(interface);
            }
        }

        let mut detached_interface = None;
        if dev.kernel_driver_active(resolved.interface).unwrap_or(false) {
            dev.detach_kernel_driver(resolved.interface)?;
            detached_interface = Some(resolved.interface);
        }
        if let Err(err) = dev.claim_interface(resolved.interface) {
            rollback(&mut dev, None, detached_interface);
            return Err(err);
        }
        let claimed_interface = Some(resolved.interface);
        if let Err(err) = dev.set_alternate_setting(resolved.interface, resolved.alt_setting) {
            rollback(&mut dev, claimed_interface, detached_interface);
            return Err(err);
        }

        let layout = TransferLayout::derive(&caps, &params, resolved.max_packet_size);
        tracing::debug!(?layout, "isochronous transfer layout");

        let shared = AudioShared::new();
        let (producer, consumer) = ring_buffer(layout.ring_capacity);
        let pool = match dev.create_iso_pool(
            resolved.endpoint,
            resolved.max_packet_size,
            &layout,
            shared.clone(),
            producer,
        ) {
            Ok(pool) => pool,
            Err(err) => {
                rollback(&mut dev, claimed_interface, detached_interface);
                return Err(err);
            }
        };

        if let Err(err) = sink.install(Self::sink_pump(shared.clone(), consumer, dev.event_pump())) {
            rollback(&mut dev, claimed_interface, detached_interface);
            return Err(err);
        }
        shared.set_state(StreamerState::ReadyToStart);

        Ok(Self {
            dev,
            sink,
            params,
            connection,
            resolved,
            layout,
            shared,
            pool: Some(pool),
            claimed_interface,
            detached_interface,
        })
    }

    /// Builds the data callback that services the USB event loop and drains
    /// the ring buffer, padding with silence when it runs dry.
    fn sink_pump(
        shared: Arc<AudioShared>,
        mut consumer: RingConsumer,
        pump: Arc<dyn UsbEventPump>,
    ) -> SinkDataFn {
        let mut scratch: Vec<u16> = Vec::new();
        Box::new(move |out: &mut [i16]| {
            shared.record_player_callback();
            pump.handle_events(EVENT_LOOP_TIMEOUT, shared.stop_flag());

            let wanted = out.len();
            if consumer.len() < wanted {
                out.fill(0);
            } else {
                scratch.resize(wanted, 0);
                let moved = consumer.read(&mut scratch);
                for (dst, &src) in out.iter_mut().zip(&scratch[..moved]) {
                    *dst = src as i16;
                }
                if moved != wanted && shared.state() == StreamerState::Started {
                    tracing::debug!(wanted, moved, "short ring buffer read");
                }
            }
            SinkFlow::Continue
        })
    }

    /// Starts streaming.
    ///
    /// Rejected unless the streamer is armed; enters `Error` when no
    /// transfer submits or the sink does not reach its running state.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != StreamerState::ReadyToStart {
            return Err(Error::InvalidStreamerState("start requires ReadyToStart"));
        }

        self.shared.set_state(StreamerState::Starting);
        self.shared.reset_stats();
        self.shared.stop_flag().store(0, Ordering::Release);

        let submitted = self.pool.as_mut().map(|p| p.submit_all()).unwrap_or(0);
        if submitted == 0 {
            self.shared.set_state(StreamerState::Error);
            return Err(Error::NoTransferSubmitted);
        }
        tracing::debug!(submitted, "submitted isochronous transfers");

        if let Err(err) = self.sink.start() {
            self.shared.set_state(StreamerState::Error);
            return Err(err);
        }

        self.shared.set_state(StreamerState::Started);
        Ok(())
    }

    /// Stops streaming and re-arms the streamer.
    ///
    /// Waits for the in-flight transfers to drain, then stops the sink. On
    /// timeout the streamer enters `Error` and further starts are rejected.
    pub fn stop(&mut self) -> Result<()> {
        tracing::debug!("stopping audio streamer");
        self.shared.set_state(StreamerState::Stopping);

        let mut tries = 0;
        while self.pool.as_ref().map(|p| p.active()).unwrap_or(0) > 0 && tries < DRAIN_TRIES {
            self.shared.wait_drained(DRAIN_WAIT);
            tries += 1;
        }
        self.shared.stop_flag().store(1, Ordering::Release);

        let still_active = self.pool.as_ref().map(|p| p.active()).unwrap_or(0);
        if still_active > 0 {
            self.shared.set_state(StreamerState::Error);
            return Err(Error::StopTimeout("transfers did not drain"));
        }
        if let Err(err) = self.sink.stop() {
            self.shared.set_state(StreamerState::Error);
            return Err(err);
        }

        self.shared.set_state(StreamerState::ReadyToStart);
        Ok(())
    }

    /// Resubmits the transfer pool after a stop, re-arming capture.
    pub fn ensure_transfers_submitted(&mut self) -> bool {
        match self.pool.as_mut() {
            Some(pool) if pool.active() == 0 => pool.submit_all() > 0,
            Some(_) => true,
            None => false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamerState {
        self.shared.state()
    }

    /// Shared state handle; remains valid after the streamer is dropped.
    pub fn shared_state(&self) -> Arc<AudioShared> {
        self.shared.clone()
    }

    /// Whether audio is currently flowing.
    pub fn is_playing(&self) -> bool {
        self.state() == StreamerState::Started
    }

    /// Negotiated USB device speed.
    pub fn device_speed(&self) -> DeviceSpeed {
        self.dev.speed()
    }

    /// Address of the resolved IN endpoint.
    pub fn endpoint_address(&self) -> u8 {
        self.resolved.endpoint
    }

    /// Maximum packet size of the resolved IN endpoint.
    pub fn max_packet_size(&self) -> u16 {
        self.resolved.max_packet_size
    }

    /// The parsed audio connection this streamer was built from.
    pub fn connection(&self) -> &AudioStreamingConnection {
        &self.connection
    }

    /// The transfer pool sizing in effect.
    pub fn layout(&self) -> &TransferLayout {
        &self.layout
    }

    /// Human-readable summary, e.g. `PCM16 2Ch. 48000`.
    pub fn stats_summary(&self) -> String {
        let format = match self.params.format {
            AudioFormat::Pcm16 => "PCM16",
            AudioFormat::PcmFloat => "PCM Float",
        };
        format!("{} {}Ch. {}", format, self.params.channels, self.params.sample_rate)
    }
}

impl<D: UsbDeviceIo, S: AudioSink> Drop for UsbAudioStreamer<D, S> {
    fn drop(&mut self) {
        self.sink.close();
        self.shared.set_state(StreamerState::Destroying);

        if let Some(pool) = self.pool.as_mut() {
            pool.cancel_all();
        }

        if let Some(interface) = self.claimed_interface.take() {
            match self.dev.release_interface(interface) {
                Ok(()) => tracing::debug!(interface, "released claimed audio interface"),
                Err(err) => tracing::warn!(interface, "could not release audio interface: {err}"),
            }
        }

        if let Some(interface) = self.detached_interface.take() {
            match self.dev.attach_kernel_driver(interface) {
                Ok(()) => tracing::debug!(interface, "reattached kernel driver"),
                Err(err) => tracing::warn!(interface, "could not reattach kernel driver: {err}"),
            }
        }

        self.pool = None;
        self.shared.set_state(StreamerState::Destroyed);
        tracing::debug!("audio streamer destroyed");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::desc::audio::AudioFormat;

    #[test]
    fn layout_minimums() {
        let caps = SinkCaps { frames_per_burst: 1, buffer_capacity_frames: 1 };
        let params = PcmParams {
            format: AudioFormat::Pcm16,
            sample_rate: 48_000,
            sub_frame_size: 2,
            channels: 2,
            performance_mode: PerformanceMode::None,
            frames_per_buffer: 0,
        };
        let layout = TransferLayout::derive(&caps, &params, 512);
        assert_eq!(layout.num_packets, 2);
        assert_eq!(layout.num_transfers, 2);
        assert_eq!(layout.buffer_size, 1024);
        assert_eq!(layout.ring_capacity, 1024);
    }

    #[test]
    fn layout_scales_with_burst() {
        let caps = SinkCaps { frames_per_burst: 480, buffer_capacity_frames: 1920 };
        let params = PcmParams {
            format: AudioFormat::Pcm16,
            sample_rate: 48_000,
            sub_frame_size: 2,
            channels: 2,
            performance_mode: PerformanceMode::LowLatency,
            frames_per_buffer: 0,
        };
        let layout = TransferLayout::derive(&caps, &params, 192);
        // 480 frames * 4 bytes = 1920 bytes per burst over 192-byte packets
        assert_eq!(layout.num_packets, 10);
        assert_eq!(layout.buffer_size, 1920);
        assert_eq!(layout.num_transfers, 4);
        assert_eq!(layout.ring_capacity, 1920 * 4 / 2);
    }

    #[test]
    fn state_roundtrip() {
        for state in [
            StreamerState::Initial,
            StreamerState::ReadyToStart,
            StreamerState::Starting,
            StreamerState::Started,
            StreamerState::Stopping,
            StreamerState::Stopped,
            StreamerState::Destroying,
            StreamerState::Destroyed,
            StreamerState::Error,
        ] {
            assert_eq!(StreamerState::from_u8(state as u8), state);
        }
    }
}
