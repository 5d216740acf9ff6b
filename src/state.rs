//! Device lifecycle state machine.
//!
//! The sole writer of [`UsbDeviceState`]. Host events (attach, detach,
//! permission results) and user commands (stop, restart) come in over a
//! channel; every transition is published through a watch channel so
//! subscribers always observe the current state. Streamer work is delegated
//! to a [`StreamDriver`], which the facade implements on top of the event
//! loop.

use std::{future::pending, time::Duration};

use futures::{
    future::BoxFuture,
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use tokio::{
    sync::{mpsc, watch},
    time::{sleep_until, Instant},
};

use crate::{
    desc::{AudioStreamingConnection, Descriptors, VideoStreamingConnection},
    video::VideoSurface,
    Result, UsbClass,
};

/// Debounce before a permission request is issued.
const PERMISSION_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Capacity of the event inbox.
const EVENT_QUEUE: usize = 16;

/// Identity of an attached USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Vendor id.
    pub vendor_id: u16,
    /// Product id.
    pub product_id: u16,
    /// Product name reported by the host.
    pub name: String,
    /// Device class code.
    pub device_class: u8,
    /// Class codes of the device's interfaces.
    pub interface_classes: Vec<u8>,
}

/// Whether the device looks like a UVC/UAC capture device.
///
/// Either the device class itself is video or audio, or it is a
/// miscellaneous composite with at least one video or audio interface.
pub fn is_uvc_device(device: &DeviceInfo) -> bool {
    let av = |class: u8| class == UsbClass::VIDEO || class == UsbClass::AUDIO;
    av(device.device_class)
        || (device.device_class == UsbClass::MISC
            && device.interface_classes.iter().copied().any(av))
}

/// Outcome of a streamer operation, shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    /// Whether the operation succeeded.
    pub ok: bool,
    /// Human-readable explanation.
    pub message: String,
}

impl StreamStatus {
    /// A successful status.
    pub fn success() -> Self {
        Self { ok: true, message: "OK".to_string() }
    }

    /// A failed status with the given message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self { ok: false, message: message.into() }
    }
}

impl<T> From<Result<T>> for StreamStatus {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(_) => Self::success(),
            Err(err) => Self::failure(err.to_string()),
        }
    }
}

/// The payload carried through the streaming states.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingInfo {
    /// The streaming device.
    pub device: DeviceInfo,
    /// Parsed audio connection.
    pub audio: AudioStreamingConnection,
    /// Status of the audio stream.
    pub audio_status: StreamStatus,
    /// Parsed video connection.
    pub video: VideoStreamingConnection,
    /// Status of the video stream.
    pub video_status: StreamStatus,
}

/// Lifecycle state of the capture device.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum UsbDeviceState {
    /// No capture device is present.
    #[default]
    NotFound,
    /// A capture device was attached.
    Attached(DeviceInfo),
    /// The device was detached.
    Detached(DeviceInfo),
    /// The host has not granted access yet.
    PermissionRequired(DeviceInfo),
    /// A permission prompt is pending.
    PermissionRequested(DeviceInfo),
    /// Access was granted.
    PermissionGranted(DeviceInfo),
    /// Access was denied.
    PermissionDenied(DeviceInfo),
    /// Device is open and its descriptors are parsed.
    Connected {
        /// The connected device.
        device: DeviceInfo,
        /// Parsed audio connection.
        audio: AudioStreamingConnection,
        /// Parsed video connection.
        video: VideoStreamingConnection,
    },
    /// Streams are running (or failed with the recorded statuses).
    Streaming(StreamingInfo),
    /// Stop was requested; resolves to `StreamingStopped`.
    StreamingStop(StreamingInfo),
    /// Streams are stopped; restart is possible.
    StreamingStopped(StreamingInfo),
    /// Restart was requested; resolves to `Streaming`.
    StreamingRestart(StreamingInfo),
}

impl UsbDeviceState {
    /// The device this state refers to, if any.
    pub fn device(&self) -> Option<&DeviceInfo> {
        match self {
            Self::NotFound => None,
            Self::Attached(d)
            | Self::Detached(d)
            | Self::PermissionRequired(d)
            | Self::PermissionRequested(d)
            | Self::PermissionGranted(d)
            | Self::PermissionDenied(d) => Some(d),
            Self::Connected { device, .. } => Some(device),
            Self::Streaming(info)
            | Self::StreamingStop(info)
            | Self::StreamingStopped(info)
            | Self::StreamingRestart(info) => Some(&info.device),
        }
    }

    /// Whether both streams report success.
    pub fn is_streaming_ok(&self) -> bool {
        matches!(self, Self::Streaming(info) if info.audio_status.ok && info.video_status.ok)
    }
}

/// Host events and user commands driving the state machine.
pub enum DeviceEvent {
    /// A USB device was attached. The permission bit is re-checked against
    /// a device-list scan because many hosts report stale values on raw
    /// attach broadcasts.
    Attached {
        /// The attached device.
        device: DeviceInfo,
        /// Permission bit from the broadcast.
        has_permission: bool,
    },
    /// The device was detached.
    Detached(DeviceInfo),
    /// Result of the permission prompt.
    PermissionResult {
        /// The device the prompt was for.
        device: DeviceInfo,
        /// Whether access was granted.
        granted: bool,
    },
    /// The sink surface became available.
    SurfaceReady(Box<dyn VideoSurface>),
    /// User asked to stop streaming.
    StopStreaming,
    /// User asked to restart streaming.
    RestartStreaming,
    /// Shut the state machine down.
    Shutdown,
}

impl std::fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Attached { device, has_permission } => f
                .debug_struct("Attached")
                .field("device", device)
                .field("has_permission", has_permission)
                .finish(),
            Self::Detached(d) => f.debug_tuple("Detached").field(d).finish(),
            Self::PermissionResult { device, granted } => f
                .debug_struct("PermissionResult")
                .field("device", device)
                .field("granted", granted)
                .finish(),
            Self::SurfaceReady(_) => f.debug_tuple("SurfaceReady").finish(),
            Self::StopStreaming => f.write_str("StopStreaming"),
            Self::RestartStreaming => f.write_str("RestartStreaming"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Host-side services the state machine depends on.
pub trait HostServices: Send {
    /// Issues the permission prompt for the device.
    fn request_permission(&mut self, device: &DeviceInfo);

    /// Scans the currently attached devices with fresh permission bits.
    fn scan_devices(&mut self) -> Vec<(DeviceInfo, bool)>;

    /// Opens the device and reads its configuration descriptors.
    fn open_device(&mut self, device: &DeviceInfo) -> Result<Descriptors>;
}

/// Streamer operations the state machine delegates.
pub trait StreamDriver: Send {
    /// Opens the audio stream for the connection.
    fn open_audio<'a>(
        &'a mut self,
        device: &'a DeviceInfo,
        audio: &'a AudioStreamingConnection,
    ) -> BoxFuture<'a, StreamStatus>;

    /// Opens the video stream onto the surface.
    fn open_video<'a>(
        &'a mut self,
        device: &'a DeviceInfo,
        video: &'a VideoStreamingConnection,
        surface: Box<dyn VideoSurface>,
    ) -> BoxFuture<'a, StreamStatus>;

    /// Starts the audio stream.
    fn start_audio(&mut self) -> BoxFuture<'_, StreamStatus>;

    /// Starts the video stream.
    fn start_video(&mut self) -> BoxFuture<'_, StreamStatus>;

    /// Stops the audio stream.
    fn stop_audio(&mut self) -> BoxFuture<'_, StreamStatus>;

    /// Stops the video stream.
    fn stop_video(&mut self) -> BoxFuture<'_, StreamStatus>;

    /// Releases both streamers.
    fn disconnect(&mut self) -> BoxFuture<'_, ()>;
}

/// Handle for feeding events in and observing states.
#[derive(Clone)]
pub struct StateMachineHandle {
    events_tx: mpsc::Sender<DeviceEvent>,
    state_rx: watch::Receiver<UsbDeviceState>,
}

impl std::fmt::Debug for StateMachineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("StateMachineHandle").field("state", &*self.state_rx.borrow()).finish()
    }
}

impl StateMachineHandle {
    /// The current state.
    pub fn current(&self) -> UsbDeviceState {
        self.state_rx.borrow().clone()
    }

    /// Sends an event; waits for inbox space.
    pub async fn send(&self, event: DeviceEvent) -> Result<()> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| crate::Error::EventLoopTerminated)
    }

    /// Subscribes to state replacements.
    pub fn subscribe(&self) -> watch::Receiver<UsbDeviceState> {
        self.state_rx.clone()
    }

    /// Turns the subscription into a stream of states.
    ///
    /// The stream yields the state at subscription time first and then
    /// every replacement.
    pub fn state_stream(&self) -> StateStream {
        let mut rx = self.state_rx.clone();
        rx.mark_changed();
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.changed().await.ok()?;
            let state = rx.borrow_and_update().clone();
            Some((state, rx))
        });
        StateStream(stream.boxed())
    }
}

/// Stream of device state replacements.
pub struct StateStream(BoxStream<'static, UsbDeviceState>);

impl std::fmt::Debug for StateStream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("StateStream").finish()
    }
}

impl Stream for StateStream {
    type Item = UsbDeviceState;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::into_inner(self).0.poll_next_unpin(cx)
    }
}

/// The device lifecycle state machine.
pub struct DeviceStateMachine<H: HostServices, D: StreamDriver> {
    host: H,
    driver: D,
    state_tx: watch::Sender<UsbDeviceState>,
    events_rx: mpsc::Receiver<DeviceEvent>,
    pending_surface: Option<Box<dyn VideoSurface>>,
    permission_debounce: Option<(DeviceInfo, Instant)>,
}

impl<H: HostServices, D: StreamDriver> DeviceStateMachine<H, D> {
    /// Creates the state machine and its handle.
    pub fn new(host: H, driver: D) -> (Self, StateMachineHandle) {
        let (state_tx, state_rx) = watch::channel(UsbDeviceState::NotFound);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let machine = Self {
            host,
            driver,
            state_tx,
            events_rx,
            pending_surface: None,
            permission_debounce: None,
        };
        (machine, StateMachineHandle { events_tx, state_rx })
    }

    fn set(&self, state: UsbDeviceState) {
        tracing::debug!(?state, "state transition");
        let _ = self.state_tx.send(state);
    }

    fn current(&self) -> UsbDeviceState {
        self.state_tx.borrow().clone()
    }

    /// Runs until shutdown or until all handles are dropped.
    ///
    /// Scans for an already-attached capture device first; if none is
    /// present the machine stays in `NotFound`.
    pub async fn run(mut self) {
        for (device, has_permission) in self.host.scan_devices() {
            if is_uvc_device(&device) {
                self.on_attached(device, has_permission).await;
                break;
            }
        }

        loop {
            let debounce = self.permission_debounce.clone();
            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(DeviceEvent::Shutdown) | None => break,
                        Some(event) => self.handle_event(event).await,
                    }
                }
                _ = async {
                    match debounce {
                        Some((_, at)) => sleep_until(at).await,
                        None => pending::<()>().await,
                    }
                } => {
                    if let Some((device, _)) = self.permission_debounce.take() {
                        self.host.request_permission(&device);
                        self.set(UsbDeviceState::PermissionRequested(device));
                    }
                }
            }
        }

        self.driver.disconnect().await;
    }

    async fn handle_event(&mut self, event: DeviceEvent) {
        tracing::debug!(?event, "handling device event");
        match event {
            DeviceEvent::Attached { device, has_permission } => {
                self.on_attached(device, has_permission).await;
            }
            DeviceEvent::Detached(device) => self.on_detached(device).await,
            DeviceEvent::PermissionResult { device, granted } => {
                self.permission_debounce = None;
                if granted {
                    self.connect(device).await;
                } else {
                    self.set(UsbDeviceState::PermissionDenied(device));
                }
            }
            DeviceEvent::SurfaceReady(surface) => {
                self.pending_surface = Some(surface);
                self.try_stream().await;
            }
            DeviceEvent::StopStreaming => self.on_stop().await,
            DeviceEvent::RestartStreaming => self.on_restart().await,
            DeviceEvent::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    async fn on_attached(&mut self, device: DeviceInfo, has_permission: bool) {
        if !is_uvc_device(&device) {
            tracing::debug!(?device, "ignoring non-capture device");
            return;
        }

        // duplicate attach broadcasts while already connected are no-ops
        match self.current() {
            UsbDeviceState::PermissionGranted(current)
            | UsbDeviceState::Connected { device: current, .. }
                if current == device =>
            {
                return;
            }
            UsbDeviceState::Streaming(info)
            | UsbDeviceState::StreamingStop(info)
            | UsbDeviceState::StreamingStopped(info)
            | UsbDeviceState::StreamingRestart(info)
                if info.device == device =>
            {
                return;
            }
            _ => {}
        }

        self.set(UsbDeviceState::Attached(device.clone()));

        // attach broadcasts often carry stale permission bits
        let has_permission = has_permission || self.rescan_permission(&device);
        if has_permission {
            self.connect(device).await;
        } else {
            self.set(UsbDeviceState::PermissionRequired(device.clone()));
            self.permission_debounce = Some((device, Instant::now() + PERMISSION_DEBOUNCE));
        }
    }

    fn rescan_permission(&mut self, device: &DeviceInfo) -> bool {
        self.host.scan_devices().iter().any(|(d, granted)| {
            *granted && d.vendor_id == device.vendor_id && d.product_id == device.product_id
        })
    }

    async fn on_detached(&mut self, device: DeviceInfo) {
        self.permission_debounce = None;
        self.pending_surface = None;

        match self.current() {
            UsbDeviceState::Streaming(_)
            | UsbDeviceState::StreamingStop(_)
            | UsbDeviceState::StreamingRestart(_) => {
                let _ = self.driver.stop_audio().await;
                let _ = self.driver.stop_video().await;
                self.driver.disconnect().await;
            }
            UsbDeviceState::StreamingStopped(_) | UsbDeviceState::Connected { .. } => {
                self.driver.disconnect().await;
            }
            _ => {}
        }

        self.set(UsbDeviceState::Detached(device));
    }

    async fn connect(&mut self, device: DeviceInfo) {
        self.permission_debounce = None;
        self.set(UsbDeviceState::PermissionGranted(device.clone()));

        let descriptors = match self.host.open_device(&device) {
            Ok(descriptors) => descriptors,
            Err(err) => {
                tracing::warn!(?device, "opening device failed: {err}");
                return;
            }
        };

        let audio = AudioStreamingConnection::parse(&descriptors);
        let video = VideoStreamingConnection::parse(&descriptors);
        tracing::info!(
            audio = audio.supports_audio_streaming(),
            video = video.supports_video_streaming(),
            formats = video.formats().len(),
            "device connected"
        );

        self.set(UsbDeviceState::Connected { device, audio, video });
        self.try_stream().await;
    }

    /// Opens and starts both streams once connected and a surface exists.
    async fn try_stream(&mut self) {
        let UsbDeviceState::Connected { device, audio, video } = self.current() else {
            return;
        };
        let Some(surface) = self.pending_surface.take() else {
            return;
        };

        let audio_status = self.driver.open_audio(&device, &audio).await;
        let video_status = self.driver.open_video(&device, &video, surface).await;

        let audio_status =
            if audio_status.ok { self.driver.start_audio().await } else { audio_status };
        let video_status =
            if video_status.ok { self.driver.start_video().await } else { video_status };

        self.set(UsbDeviceState::Streaming(StreamingInfo {
            device,
            audio,
            audio_status,
            video,
            video_status,
        }));
    }

    async fn on_stop(&mut self) {
        let UsbDeviceState::Streaming(info) = self.current() else {
            return;
        };

        self.set(UsbDeviceState::StreamingStop(info.clone()));
        let audio_status = self.driver.stop_audio().await;
        let video_status = self.driver.stop_video().await;
        self.set(UsbDeviceState::StreamingStopped(StreamingInfo {
            audio_status,
            video_status,
            ..info
        }));
    }

    async fn on_restart(&mut self) {
        let UsbDeviceState::StreamingStopped(info) = self.current() else {
            return;
        };

        self.set(UsbDeviceState::StreamingRestart(info.clone()));
        // report the actual start results instead of assuming success
        let audio_status = self.driver.start_audio().await;
        let video_status = self.driver.start_video().await;
        self.set(UsbDeviceState::Streaming(StreamingInfo {
            audio_status,
            video_status,
            ..info
        }));
    }
}
