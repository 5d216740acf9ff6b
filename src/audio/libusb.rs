//! libusb-backed device I/O and isochronous transfer pool.
//!
//! The only module that talks to the raw libusb API; everything above it
//! goes through the [`UsbDeviceIo`] and [`TransferPool`] traits. The device
//! handle is created from a file descriptor supplied by the host with
//! device discovery suppressed, as required on hosts that broker USB access
//! through a permission service.

#![allow(unsafe_code)]

use std::{
    cell::UnsafeCell,
    os::{
        fd::RawFd,
        raw::{c_int, c_uint, c_void},
    },
    ptr::{self, NonNull},
    slice,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};

use rusb::{constants as usb, ffi, Context, DeviceHandle, UsbContext};

use crate::{
    audio::{AudioShared, StreamerState, TransferLayout, TransferPool, UsbDeviceIo, UsbEventPump},
    desc::Descriptors,
    ring::RingProducer,
    DeviceSpeed, Error, Result,
};

/// Timeout of each isochronous transfer in milliseconds.
const ISO_TRANSFER_TIMEOUT_MS: c_uint = 1000;

/// Timeout for control transfers reading descriptors.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

fn error_from_code(code: c_int) -> rusb::Error {
    match code {
        usb::LIBUSB_ERROR_IO => rusb::Error::Io,
        usb::LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        usb::LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        usb::LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        usb::LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        usb::LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        usb::LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        usb::LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        usb::LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        usb::LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        usb::LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        usb::LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

/// Production [`UsbDeviceIo`] over a host-supplied file descriptor.
pub struct LibusbDeviceIo {
    context: Context,
    handle: DeviceHandle<Context>,
}

impl LibusbDeviceIo {
    /// Wraps an already-open device file descriptor.
    ///
    /// Device discovery is disabled on the context, so the library never
    /// scans the bus itself.
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        let rc = unsafe {
            ffi::libusb_set_option(ptr::null_mut(), ffi::constants::LIBUSB_OPTION_NO_DEVICE_DISCOVERY)
        };
        if rc != 0 {
            tracing::warn!(rc, "could not suppress libusb device discovery");
        }

        let context = Context::new()?;

        let mut raw = ptr::null_mut();
        let rc = unsafe { ffi::libusb_wrap_sys_device(context.as_raw(), fd as _, &mut raw) };
        if rc != 0 {
            return Err(error_from_code(rc).into());
        }
        let raw = NonNull::new(raw).ok_or(rusb::Error::NoDevice)?;
        let handle = unsafe { DeviceHandle::from_libusb(context.clone(), raw) };

        tracing::debug!(fd, speed = %DeviceSpeed::from(handle.device().speed()), "wrapped USB device");
        Ok(Self { context, handle })
    }
}

impl UsbDeviceIo for LibusbDeviceIo {
    fn speed(&self) -> DeviceSpeed {
        self.handle.device().speed().into()
    }

    fn read_config_descriptor(&mut self) -> Result<Descriptors> {
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Standard,
            rusb::Recipient::Device,
        );
        let value = (usb::LIBUSB_DT_CONFIG as u16) << 8;

        let mut header = [0u8; 9];
        self.handle.read_control(
            request_type,
            usb::LIBUSB_REQUEST_GET_DESCRIPTOR,
            value,
            0,
            &mut header,
            CONTROL_TIMEOUT,
        )?;

        let total = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut blob = vec![0u8; total.max(header.len())];
        let read = self.handle.read_control(
            request_type,
            usb::LIBUSB_REQUEST_GET_DESCRIPTOR,
            value,
            0,
            &mut blob,
            CONTROL_TIMEOUT,
        )?;
        blob.truncate(read);
        Ok(Descriptors::new(blob))
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool> {
        Ok(self.handle.kernel_driver_active(interface)?)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<()> {
        Ok(self.handle.detach_kernel_driver(interface)?)
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> Result<()> {
        Ok(self.handle.attach_kernel_driver(interface)?)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<()> {
        Ok(self.handle.claim_interface(interface)?)
    }

    fn release_interface(&mut self, interface: u8) -> Result<()> {
        Ok(self.handle.release_interface(interface)?)
    }

    fn set_alternate_setting(&mut self, interface: u8, alt_setting: u8) -> Result<()> {
        Ok(self.handle.set_alternate_setting(interface, alt_setting)?)
    }

    fn event_pump(&self) -> Arc<dyn UsbEventPump> {
        Arc::new(LibusbEventPump { context: self.context.clone() })
    }

    fn create_iso_pool(
        &mut self,
        endpoint: u8,
        max_packet_size: u16,
        layout: &TransferLayout,
        shared: Arc<AudioShared>,
        producer: RingProducer,
    ) -> Result<Box<dyn TransferPool>> {
        let pool =
            IsoTransferPool::new(self.handle.as_raw(), endpoint, max_packet_size, layout, shared, producer)?;
        Ok(Box::new(pool))
    }
}

struct LibusbEventPump {
    context: Context,
}

impl UsbEventPump for LibusbEventPump {
    fn handle_events(&self, timeout: Duration, stop: &AtomicI32) {
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            ffi::libusb_handle_events_timeout_completed(
                self.context.as_raw(),
                &mut tv as *mut libc::timeval,
                stop.as_ptr(),
            )
        };
        if rc != 0 {
            tracing::debug!(rc, "libusb event handling returned an error");
        }
    }
}

/// State reachable from the transfer completion callback.
///
/// The ring producer is only ever touched from the thread driving
/// `libusb_handle_events`, which serializes all completion callbacks.
struct PoolState {
    shared: Arc<AudioShared>,
    producer: UnsafeCell<RingProducer>,
    max_packet: usize,
}

unsafe impl Send for PoolState {}
unsafe impl Sync for PoolState {}

/// Per-transfer record; the transfer's `user_data` points at it.
///
/// Holds no owning reference back to the pool so transfers and pool can
/// never keep each other alive.
struct TransferSlot {
    state: Arc<PoolState>,
    submitted: AtomicBool,
}

/// Pool of isochronous transfers on the audio IN endpoint.
pub struct IsoTransferPool {
    transfers: Vec<*mut ffi::libusb_transfer>,
    slots: Vec<Arc<TransferSlot>>,
    state: Arc<PoolState>,
}

unsafe impl Send for IsoTransferPool {}

impl IsoTransferPool {
    fn new(
        handle: *mut ffi::libusb_device_handle,
        endpoint: u8,
        max_packet_size: u16,
        layout: &TransferLayout,
        shared: Arc<AudioShared>,
        producer: RingProducer,
    ) -> Result<Self> {
        let state = Arc::new(PoolState {
            shared,
            producer: UnsafeCell::new(producer),
            max_packet: usize::from(max_packet_size),
        });

        let mut transfers = Vec::with_capacity(layout.num_transfers);
        let mut slots = Vec::with_capacity(layout.num_transfers);

        for index in 0..layout.num_transfers {
            let transfer = unsafe { ffi::libusb_alloc_transfer(layout.num_packets as c_int) };
            if transfer.is_null() {
                tracing::warn!(index, "libusb_alloc_transfer failed");
                continue;
            }

            let buffer = unsafe { libc::malloc(layout.buffer_size) } as *mut u8;
            if buffer.is_null() {
                unsafe { ffi::libusb_free_transfer(transfer) };
                tracing::warn!(index, "transfer buffer allocation failed");
                continue;
            }

            let slot = Arc::new(TransferSlot { state: state.clone(), submitted: AtomicBool::new(false) });

            unsafe {
                (*transfer).dev_handle = handle;
                (*transfer).endpoint = endpoint;
                (*transfer).transfer_type = usb::LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
                (*transfer).timeout = ISO_TRANSFER_TIMEOUT_MS;
                (*transfer).buffer = buffer;
                (*transfer).length = layout.buffer_size as c_int;
                (*transfer).num_iso_packets = layout.num_packets as c_int;
                (*transfer).callback = transfer_callback;
                (*transfer).user_data = Arc::as_ptr(&slot) as *mut c_void;
                (*transfer).flags =
                    usb::LIBUSB_TRANSFER_SHORT_NOT_OK | usb::LIBUSB_TRANSFER_FREE_BUFFER;

                let descs = (*transfer).iso_packet_desc.as_mut_ptr();
                for p in 0..layout.num_packets {
                    (*descs.add(p)).length = state.max_packet as c_uint;
                }
            }

            transfers.push(transfer);
            slots.push(slot);
        }

        if transfers.is_empty() {
            return Err(Error::NoTransferSubmitted);
        }

        tracing::debug!(
            transfers = transfers.len(),
            packets = layout.num_packets,
            buffer_size = layout.buffer_size,
            "allocated isochronous transfer pool"
        );
        Ok(Self { transfers, slots, state })
    }
}

impl TransferPool for IsoTransferPool {
    fn submit_all(&mut self) -> usize {
        let mut submitted = 0;
        for (transfer, slot) in self.transfers.iter().zip(&self.slots) {
            if slot.submitted.load(Ordering::Acquire) {
                submitted += 1;
                continue;
            }
            let rc = unsafe { ffi::libusb_submit_transfer(*transfer) };
            if rc == 0 {
                slot.submitted.store(true, Ordering::Release);
                self.state.shared.transfers_submitted(1);
                submitted += 1;
            } else {
                tracing::warn!(rc, "libusb_submit_transfer failed");
            }
        }
        submitted
    }

    fn active(&self) -> usize {
        self.state.shared.active_transfers()
    }

    fn cancel_all(&mut self) {
        for (transfer, slot) in self.transfers.iter().zip(&self.slots) {
            if slot.submitted.load(Ordering::Acquire) {
                unsafe { ffi::libusb_cancel_transfer(*transfer) };
            }
        }
    }
}

impl Drop for IsoTransferPool {
    fn drop(&mut self) {
        for transfer in &self.transfers {
            // the FREE_BUFFER flag releases the packet buffer with it
            unsafe { ffi::libusb_free_transfer(*transfer) };
        }
        self.transfers.clear();
        self.slots.clear();
    }
}

/// Completion callback; runs on the thread driving the USB event loop.
extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    if transfer.is_null() {
        return;
    }

    let slot = unsafe { &*((*transfer).user_data as *const TransferSlot) };
    let shared = &slot.state.shared;
    slot.submitted.store(false, Ordering::Release);
    shared.transfer_completed();

    let status = unsafe { (*transfer).status };
    if status == usb::LIBUSB_TRANSFER_NO_DEVICE {
        tracing::debug!("transfer completed with NO_DEVICE");
        shared.set_device_gone();
        return;
    }

    match shared.state() {
        StreamerState::Stopping => {
            if shared.active_transfers() == 0 {
                shared.notify_drained();
            }
            return;
        }
        StreamerState::Destroying | StreamerState::Destroyed => return,
        _ => {}
    }

    let num_packets = unsafe { (*transfer).num_iso_packets } as usize;
    let buffer = unsafe { (*transfer).buffer };
    let descs = unsafe { (*transfer).iso_packet_desc.as_ptr() };
    let max_packet = slot.state.max_packet;

    let mut bytes = 0;
    let mut samples_written = 0;
    for index in 0..num_packets {
        let desc = unsafe { &*descs.add(index) };
        if desc.status != usb::LIBUSB_TRANSFER_COMPLETED {
            shared.note_packet_error(desc.status);
            continue;
        }

        let len = desc.actual_length as usize;
        if len == 0 {
            continue;
        }
        let data = unsafe { slice::from_raw_parts(buffer.add(index * max_packet), len) };
        let samples: Vec<u16> =
            data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();

        // Safety: completion callbacks are serialized on the event thread,
        // the single producer of the ring buffer.
        let producer = unsafe { &mut *slot.state.producer.get() };
        let written = producer.write(&samples);
        if written != samples.len() {
            tracing::warn!(written, expected = samples.len(), "short ring buffer write");
        }

        bytes += len;
        samples_written += samples.len();
    }

    if bytes > 0 {
        shared.record_usb_payload(bytes, samples_written);
    }

    if bytes > max_packet * num_packets {
        tracing::warn!(bytes, max = max_packet * num_packets, "transfer returned more data than its packets hold");
        return;
    }

    let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
    if rc == 0 {
        slot.submitted.store(true, Ordering::Release);
        shared.transfers_submitted(1);
    } else if rc == usb::LIBUSB_ERROR_NO_DEVICE {
        tracing::warn!("device lost on transfer resubmit");
        shared.set_device_gone();
    } else {
        tracing::warn!(rc, "transfer resubmit failed");
    }
}
