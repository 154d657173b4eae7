//! Bulk-transfer transport for sensor sessions.
//!
//! Drivers reach the device through the [`Transport`] trait so phase logic
//! can be exercised against a scripted double; [`LibusbTransport`] is the
//! hardware implementation. Transfers are asynchronous libusb transfers
//! completed through a oneshot channel, with a small helper thread polling
//! libusb for completions. Completion callbacks do nothing beyond resolving
//! the transfer's channel.

use std::ffi::CStr;
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use libusb1_sys as libusb;
use libusb1_sys::constants::{
    LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_NOT_FOUND,
    LIBUSB_ERROR_TIMEOUT, LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED,
    LIBUSB_TRANSFER_NO_DEVICE, LIBUSB_TRANSFER_TIMED_OUT, LIBUSB_TRANSFER_TYPE_BULK,
};
use log::{debug, warn};
use tokio::sync::oneshot;

/// USB vendor/product pair a driver family claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

/// Why a bulk transfer did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// Cancelled while in flight.
    Cancelled,
    /// No completion within the requested timeout.
    TimedOut,
    /// The device went away.
    Disconnected,
    /// Stall or any other transport failure.
    Failed,
    /// Transfer allocation or submission failed.
    NoResources,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferError::Cancelled => "transfer cancelled",
            TransferError::TimedOut => "transfer timed out",
            TransferError::Disconnected => "device disconnected",
            TransferError::Failed => "transfer failed",
            TransferError::NoResources => "transfer could not be submitted",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for TransferError {}

/// Asynchronous bulk pipe to one opened sensor.
///
/// A session keeps at most one IN transfer in flight, which is what makes
/// [`Transport::cancel_in`] well defined.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn claim_interface(&self, interface: u8) -> io::Result<()>;

    async fn release_interface(&self, interface: u8) -> io::Result<()>;

    /// Write `data` to a bulk OUT endpoint; resolves to the bytes accepted.
    async fn bulk_out(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransferError>;

    /// Read up to `len` bytes from a bulk IN endpoint. `None` waits forever
    /// and relies on [`Transport::cancel_in`] to get out.
    async fn bulk_in(
        &self,
        endpoint: u8,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransferError>;

    /// Cancel the in-flight IN transfer, if any; it then completes with
    /// [`TransferError::Cancelled`]. Callable from any thread.
    fn cancel_in(&self);
}

#[derive(Copy, Clone)]
struct ContextPtr(*mut libusb::libusb_context);

unsafe impl Send for ContextPtr {}
unsafe impl Sync for ContextPtr {}

/// RAII wrapper owning a libusb context and a background event thread.
struct LibusbContext {
    ptr: ContextPtr,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LibusbContext {
    fn new() -> io::Result<Arc<Self>> {
        let mut ctx = ptr::null_mut();
        let rc = unsafe { libusb::libusb_init(&mut ctx) };
        if rc < 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("libusb init failed: {rc}"),
            ));
        }

        let ptr = ContextPtr(ctx);
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = running.clone();

        // A short poll keeps completion latency low without busy spinning.
        let handle = std::thread::Builder::new()
            .name("libusb-events".into())
            .spawn(move || {
                let ptr = ptr;
                let mut timeval = libc::timeval {
                    tv_sec: 0,
                    tv_usec: 10_000,
                };
                while running_thread.load(Ordering::SeqCst) {
                    let rc = unsafe {
                        libusb::libusb_handle_events_timeout_completed(
                            ptr.0,
                            &mut timeval,
                            ptr::null_mut(),
                        )
                    };
                    if rc == LIBUSB_ERROR_INTERRUPTED {
                        continue;
                    }
                    if rc < 0 && running_thread.load(Ordering::SeqCst) {
                        std::thread::yield_now();
                    }
                }
            })
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::Other,
                    format!("failed to spawn libusb event thread: {e}"),
                )
            })?;

        Ok(Arc::new(LibusbContext {
            ptr,
            running,
            thread: Mutex::new(Some(handle)),
        }))
    }
}

impl Drop for LibusbContext {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
        unsafe { libusb::libusb_exit(self.ptr.0) };
    }
}

struct HandlePtr(*mut libusb::libusb_device_handle);

unsafe impl Send for HandlePtr {}
unsafe impl Sync for HandlePtr {}

impl Drop for HandlePtr {
    fn drop(&mut self) {
        unsafe { libusb::libusb_close(self.0) };
    }
}

/// In-flight IN transfer, recorded so deactivation can cancel it.
struct PendingIn(*mut libusb::libusb_transfer);

unsafe impl Send for PendingIn {}

/// Bulk pipe to one opened sensor, backed by asynchronous libusb transfers.
pub struct LibusbTransport {
    _context: Arc<LibusbContext>,
    handle: Arc<HandlePtr>,
    pending_in: Arc<Mutex<Option<PendingIn>>>,
}

impl LibusbTransport {
    /// Open the first attached device matching one of `id_table`.
    pub fn open_matching(id_table: &[UsbId]) -> io::Result<Self> {
        let context = LibusbContext::new()?;

        let mut list: *const *mut libusb::libusb_device = ptr::null();
        let count = unsafe { libusb::libusb_get_device_list(context.ptr.0, &mut list) };
        if count < 0 {
            return Err(map_libusb_error(count as i32));
        }

        let devices = unsafe { std::slice::from_raw_parts(list, count as usize) };
        let mut opened = None;
        for &device in devices {
            let Ok(descriptor) = device_descriptor(device) else {
                continue;
            };
            let id = UsbId {
                vendor: descriptor.idVendor,
                product: descriptor.idProduct,
            };
            if !id_table.contains(&id) {
                continue;
            }
            debug!("opening sensor {:04x}:{:04x}", id.vendor, id.product);
            let mut handle = ptr::null_mut();
            let rc = unsafe { libusb::libusb_open(device, &mut handle) };
            if rc < 0 {
                warn!(
                    "failed to open {:04x}:{:04x}: {}",
                    id.vendor,
                    id.product,
                    libusb_error_string(rc)
                );
                continue;
            }
            opened = Some(handle);
            break;
        }
        unsafe { libusb::libusb_free_device_list(list, 1) };

        let handle = opened.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no matching sensor attached")
        })?;
        Ok(LibusbTransport {
            _context: context,
            handle: Arc::new(HandlePtr(handle)),
            pending_in: Arc::new(Mutex::new(None)),
        })
    }
}

impl LibusbTransport {
    /// Fill and submit a bulk write; completion resolves the returned
    /// receiver. Kept synchronous so no raw pointer outlives the await in
    /// the caller.
    fn submit_write(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<usize, TransferError>>, TransferError> {
        let (sender, receiver) = oneshot::channel();
        let state = Box::new(WriteState {
            sender: Some(sender),
            buffer: Some(data.to_vec()),
        });
        let state_ptr = Box::into_raw(state);
        let transfer = unsafe { libusb::libusb_alloc_transfer(0) };
        if transfer.is_null() {
            unsafe { drop(Box::from_raw(state_ptr)) };
            return Err(TransferError::NoResources);
        }
        unsafe {
            (*transfer).dev_handle = self.handle.0;
            (*transfer).endpoint = endpoint;
            (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
            (*transfer).timeout = duration_to_timeout(Some(timeout));
            (*transfer).callback = write_callback;
            (*transfer).user_data = state_ptr as *mut c_void;
            let buffer = (*state_ptr).buffer.as_mut().expect("write buffer");
            (*transfer).buffer = buffer.as_mut_ptr();
            (*transfer).length = buffer.len() as c_int;
        }
        let rc = unsafe { libusb::libusb_submit_transfer(transfer) };
        if rc < 0 {
            unsafe {
                drop(Box::from_raw(state_ptr));
                libusb::libusb_free_transfer(transfer);
            }
            return Err(map_submit_error(rc));
        }
        Ok(receiver)
    }

    /// Fill and submit a bulk read, recording it as the pending IN transfer
    /// for the lifetime of the flight.
    fn submit_read(
        &self,
        endpoint: u8,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<oneshot::Receiver<Result<Vec<u8>, TransferError>>, TransferError> {
        let (sender, receiver) = oneshot::channel();
        let state = Box::new(ReadState {
            sender: Some(sender),
            buffer: Some(vec![0u8; len]),
            pending: self.pending_in.clone(),
        });
        let state_ptr = Box::into_raw(state);
        let transfer = unsafe { libusb::libusb_alloc_transfer(0) };
        if transfer.is_null() {
            unsafe { drop(Box::from_raw(state_ptr)) };
            return Err(TransferError::NoResources);
        }
        unsafe {
            (*transfer).dev_handle = self.handle.0;
            (*transfer).endpoint = endpoint;
            (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
            (*transfer).timeout = duration_to_timeout(timeout);
            (*transfer).callback = read_callback;
            (*transfer).user_data = state_ptr as *mut c_void;
            let buffer = (*state_ptr).buffer.as_mut().expect("read buffer");
            (*transfer).buffer = buffer.as_mut_ptr();
            (*transfer).length = buffer.len() as c_int;
        }

        // Register under the lock so a concurrent cancel sees either a live
        // transfer or none at all.
        let Ok(mut pending) = self.pending_in.lock() else {
            unsafe {
                drop(Box::from_raw(state_ptr));
                libusb::libusb_free_transfer(transfer);
            }
            return Err(TransferError::NoResources);
        };
        if pending.is_some() {
            unsafe {
                drop(Box::from_raw(state_ptr));
                libusb::libusb_free_transfer(transfer);
            }
            warn!("IN transfer already in flight");
            return Err(TransferError::NoResources);
        }
        let rc = unsafe { libusb::libusb_submit_transfer(transfer) };
        if rc < 0 {
            unsafe {
                drop(Box::from_raw(state_ptr));
                libusb::libusb_free_transfer(transfer);
            }
            return Err(map_submit_error(rc));
        }
        *pending = Some(PendingIn(transfer));
        Ok(receiver)
    }
}

#[async_trait]
impl Transport for LibusbTransport {
    async fn claim_interface(&self, interface: u8) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_claim_interface(self.handle.0, interface as c_int) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    async fn release_interface(&self, interface: u8) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_release_interface(self.handle.0, interface as c_int) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    async fn bulk_out(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransferError> {
        let receiver = self.submit_write(endpoint, data, timeout)?;
        receiver.await.unwrap_or(Err(TransferError::Failed))
    }

    async fn bulk_in(
        &self,
        endpoint: u8,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransferError> {
        let receiver = self.submit_read(endpoint, len, timeout)?;
        receiver.await.unwrap_or(Err(TransferError::Failed))
    }

    fn cancel_in(&self) {
        let Ok(pending) = self.pending_in.lock() else {
            return;
        };
        if let Some(PendingIn(transfer)) = pending.as_ref() {
            debug!("cancelling in-flight IN transfer");
            let rc = unsafe { libusb::libusb_cancel_transfer(*transfer) };
            if rc < 0 && rc != LIBUSB_ERROR_NOT_FOUND {
                warn!("transfer cancel failed: {}", libusb_error_string(rc));
            }
        }
    }
}

struct WriteState {
    sender: Option<oneshot::Sender<Result<usize, TransferError>>>,
    buffer: Option<Vec<u8>>,
}

struct ReadState {
    sender: Option<oneshot::Sender<Result<Vec<u8>, TransferError>>>,
    buffer: Option<Vec<u8>>,
    pending: Arc<Mutex<Option<PendingIn>>>,
}

extern "system" fn write_callback(transfer: *mut libusb::libusb_transfer) {
    unsafe {
        let state_ptr = (*transfer).user_data as *mut WriteState;
        let mut state = Box::from_raw(state_ptr);
        let result = if (*transfer).status == LIBUSB_TRANSFER_COMPLETED {
            Ok((*transfer).actual_length as usize)
        } else {
            Err(map_transfer_status((*transfer).status))
        };
        state.buffer.take();
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(result);
        }
        libusb::libusb_free_transfer(transfer);
    }
}

extern "system" fn read_callback(transfer: *mut libusb::libusb_transfer) {
    unsafe {
        let state_ptr = (*transfer).user_data as *mut ReadState;
        let mut state = Box::from_raw(state_ptr);
        // Unregister before freeing so a racing cancel never touches a
        // transfer that is already gone.
        if let Ok(mut pending) = state.pending.lock() {
            *pending = None;
        }
        let status = (*transfer).status;
        let result = if status == LIBUSB_TRANSFER_COMPLETED {
            let mut buffer = state.buffer.take().expect("read buffer");
            buffer.truncate((*transfer).actual_length as usize);
            Ok(buffer)
        } else {
            Err(map_transfer_status(status))
        };
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(result);
        }
        libusb::libusb_free_transfer(transfer);
    }
}

/// Convert to a libusb timeout in milliseconds; `None` means no timeout.
fn duration_to_timeout(duration: Option<Duration>) -> u32 {
    use std::os::raw::c_uint;
    let Some(duration) = duration else {
        return 0;
    };
    let millis = duration.as_millis();
    if millis == 0 {
        1
    } else if millis > c_uint::MAX as u128 {
        c_uint::MAX as u32
    } else {
        millis as u32
    }
}

fn device_descriptor(
    device: *mut libusb::libusb_device,
) -> io::Result<libusb::libusb_device_descriptor> {
    let mut descriptor = MaybeUninit::<libusb::libusb_device_descriptor>::uninit();
    let rc = unsafe { libusb::libusb_get_device_descriptor(device, descriptor.as_mut_ptr()) };
    if rc < 0 {
        return Err(map_libusb_error(rc));
    }
    Ok(unsafe { descriptor.assume_init() })
}

fn libusb_error_string(code: i32) -> String {
    unsafe {
        let name = libusb::libusb_error_name(code);
        if name.is_null() {
            format!("libusb error {code}")
        } else {
            CStr::from_ptr(name).to_string_lossy().into_owned()
        }
    }
}

fn map_libusb_error(code: i32) -> io::Error {
    let kind = match code {
        LIBUSB_ERROR_TIMEOUT => io::ErrorKind::WouldBlock,
        LIBUSB_ERROR_NO_DEVICE => io::ErrorKind::NotConnected,
        LIBUSB_ERROR_NOT_FOUND => io::ErrorKind::NotFound,
        LIBUSB_ERROR_INTERRUPTED => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, libusb_error_string(code))
}

fn map_submit_error(code: i32) -> TransferError {
    if code == LIBUSB_ERROR_NO_DEVICE {
        TransferError::Disconnected
    } else {
        TransferError::NoResources
    }
}

fn map_transfer_status(status: i32) -> TransferError {
    match status {
        s if s == LIBUSB_TRANSFER_CANCELLED => TransferError::Cancelled,
        s if s == LIBUSB_TRANSFER_TIMED_OUT => TransferError::TimedOut,
        s if s == LIBUSB_TRANSFER_NO_DEVICE => TransferError::Disconnected,
        _ => TransferError::Failed,
    }
}
