//! libusb backend
//!
//! [`LibusbSubsystem`] implements [`DeviceSubsystem`] over a `rusb::Context`.
//! Descriptor enumeration, pollfd notifiers, the timeout query and transfer
//! submission go through the raw `rusb::ffi` bindings; event handling uses
//! rusb's own `handle_events`.
//!
//! Everything here must stay on the loop thread: libusb calls the pollfd
//! notifiers and transfer callbacks on whichever thread opens devices or
//! handles events, and the notifier state is `Rc`-based.

use crate::subsystem::{
    CompletionCallback, DeviceSubsystem, PollfdNotifiers, Rejected, TerminalTransfer,
};
use crate::types::{
    CONTROL_SETUP_SIZE, Interest, NextTimeout, PollfdSpec, TransferRequest, TransferShape,
    TransferStatus, round_up_to_millis,
};
use libc::{c_int, c_short, c_uint, c_void};
use rusb::constants::*;
use rusb::ffi;
use rusb::{Context, DeviceHandle, UsbContext};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Device handle type accepted by [`LibusbSubsystem`]
///
/// In-flight transfers hold a clone so the handle outlives them.
pub type LibusbDevice = Rc<DeviceHandle<Context>>;

/// libusb context driven through the [`DeviceSubsystem`] boundary
pub struct LibusbSubsystem {
    context: Context,
    notifiers: RefCell<Option<Box<Rc<dyn PollfdNotifiers>>>>,
}

impl LibusbSubsystem {
    pub fn new() -> rusb::Result<Self> {
        Ok(Self::from_context(Context::new()?))
    }

    pub fn from_context(context: Context) -> Self {
        // SAFETY: the context pointer is valid for the lifetime of `context`.
        let handles_timeouts = unsafe { ffi::libusb_pollfds_handle_timeouts(context.as_raw()) };
        debug!(
            "libusb context ready (pollfds handle timeouts: {})",
            handles_timeouts != 0
        );

        Self {
            context,
            notifiers: RefCell::new(None),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Open the first device matching `vendor_id:product_id`
    pub fn open_device(&self, vendor_id: u16, product_id: u16) -> Option<LibusbDevice> {
        self.context
            .open_device_with_vid_pid(vendor_id, product_id)
            .map(Rc::new)
    }

    fn install_notifiers(&self, user_data: *mut c_void) {
        let added = pollfd_added as extern "system" fn(c_int, c_short, *mut c_void);
        let removed = pollfd_removed as extern "system" fn(c_int, *mut c_void);

        // SAFETY: the callbacks tolerate a null `user_data`; a non-null one
        // points into the box kept in `self.notifiers` until it is replaced
        // here again.
        unsafe {
            ffi::libusb_set_pollfd_notifiers(
                self.context.as_raw(),
                added.into(),
                removed.into(),
                user_data,
            );
        }
    }
}

impl Drop for LibusbSubsystem {
    fn drop(&mut self) {
        if self.notifiers.get_mut().is_some() {
            self.install_notifiers(std::ptr::null_mut());
            self.notifiers.get_mut().take();
        }
    }
}

impl DeviceSubsystem for LibusbSubsystem {
    type Device = LibusbDevice;

    fn pollfds(&self) -> Vec<PollfdSpec> {
        // SAFETY: the context is valid; the returned array is NULL-terminated
        // and released with libusb_free_pollfds below.
        unsafe {
            let fds = ffi::libusb_get_pollfds(self.context.as_raw());
            if fds.is_null() {
                warn!("libusb does not expose pollfds on this platform");
                return Vec::new();
            }

            let mut specs = Vec::new();
            let mut index = 0;
            loop {
                let pollfd = *fds.add(index);
                if pollfd.is_null() {
                    break;
                }
                specs.push(PollfdSpec {
                    fd: (*pollfd).fd,
                    interest: Interest::from_poll_events((*pollfd).events),
                });
                index += 1;
            }

            ffi::libusb_free_pollfds(fds);
            specs
        }
    }

    fn next_timeout(&self) -> rusb::Result<NextTimeout> {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };

        // SAFETY: `tv` is a valid out-parameter for the duration of the call.
        let r = unsafe { ffi::libusb_get_next_timeout(self.context.as_raw(), &mut tv) };
        match r {
            0 => Ok(NextTimeout::None),
            1 => {
                let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
                let micros = u32::try_from(tv.tv_usec).unwrap_or(0);
                let duration = Duration::from_secs(secs) + Duration::from_micros(u64::from(micros));
                Ok(NextTimeout::from_duration(duration))
            }
            code => Err(map_libusb_error(code)),
        }
    }

    fn handle_events_timeout(&self, max_wait: Duration) -> rusb::Result<()> {
        self.context.handle_events(Some(max_wait))
    }

    fn set_pollfd_notifiers(&self, notifiers: Option<Rc<dyn PollfdNotifiers>>) {
        let mut slot = self.notifiers.borrow_mut();
        match notifiers {
            Some(notifiers) => {
                let boxed = Box::new(notifiers);
                let user_data = &*boxed as *const Rc<dyn PollfdNotifiers> as *mut c_void;
                self.install_notifiers(user_data);
                *slot = Some(boxed);
            }
            None => {
                self.install_notifiers(std::ptr::null_mut());
                *slot = None;
            }
        }
    }

    fn submit_transfer(
        &self,
        device: &LibusbDevice,
        request: TransferRequest,
        on_complete: CompletionCallback,
    ) -> Result<(), Rejected> {
        let TransferRequest {
            shape,
            buffer,
            timeout,
        } = request;

        if let Err(error) = validate_request(shape, &buffer) {
            return Err(Rejected { error, buffer });
        }
        let length = buffer.len() as c_int;
        let timeout_ms = c_uint::try_from(round_up_to_millis(timeout).as_millis()).unwrap_or(c_uint::MAX);

        // SAFETY: plain allocation; checked for NULL below.
        let transfer = match NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) }) {
            Some(transfer) => transfer,
            None => {
                return Err(Rejected {
                    error: rusb::Error::NoMem,
                    buffer,
                });
            }
        };

        let in_flight = Box::into_raw(Box::new(InFlight {
            transfer,
            buffer,
            on_complete,
            device: device.clone(),
        }));

        // SAFETY: `in_flight` stays allocated until `transfer_finished`
        // reclaims it or the submission fails below. The buffer is heap memory
        // owned by `in_flight` and does not move while the transfer is active.
        // `device` is kept alive by the clone in `in_flight`.
        let result = unsafe {
            let buffer_ptr = (*in_flight).buffer.as_mut_ptr();
            let dev_handle = device.as_raw();
            let user_data = in_flight as *mut c_void;

            match shape {
                TransferShape::Control => ffi::libusb_fill_control_transfer(
                    transfer.as_ptr(),
                    dev_handle,
                    buffer_ptr,
                    transfer_finished as _,
                    user_data,
                    timeout_ms,
                ),
                TransferShape::Interrupt { endpoint } => ffi::libusb_fill_interrupt_transfer(
                    transfer.as_ptr(),
                    dev_handle,
                    endpoint,
                    buffer_ptr,
                    length,
                    transfer_finished as _,
                    user_data,
                    timeout_ms,
                ),
                TransferShape::Bulk { endpoint } => ffi::libusb_fill_bulk_transfer(
                    transfer.as_ptr(),
                    dev_handle,
                    endpoint,
                    buffer_ptr,
                    length,
                    transfer_finished as _,
                    user_data,
                    timeout_ms,
                ),
            }

            ffi::libusb_submit_transfer(transfer.as_ptr())
        };

        if result != 0 {
            // SAFETY: libusb refused the transfer, so the callback will never
            // run and we are the sole owner of both allocations again.
            let in_flight = unsafe { Box::from_raw(in_flight) };
            unsafe { ffi::libusb_free_transfer(transfer.as_ptr()) };
            return Err(Rejected {
                error: map_libusb_error(result),
                buffer: in_flight.buffer,
            });
        }

        Ok(())
    }
}

/// State owned by libusb's `user_data` while a transfer is in flight
struct InFlight {
    transfer: NonNull<ffi::libusb_transfer>,
    buffer: Vec<u8>,
    on_complete: CompletionCallback,
    device: LibusbDevice,
}

/// A finished libusb transfer; dropping it frees the `libusb_transfer`
struct LibusbTransfer {
    transfer: NonNull<ffi::libusb_transfer>,
    buffer: Vec<u8>,
    status: TransferStatus,
    actual_length: usize,
    _device: LibusbDevice,
}

impl TerminalTransfer for LibusbTransfer {
    fn status(&self) -> TransferStatus {
        self.status
    }

    fn actual_length(&self) -> usize {
        self.actual_length
    }

    fn into_buffer(mut self: Box<Self>) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

impl Drop for LibusbTransfer {
    fn drop(&mut self) {
        // SAFETY: the transfer is complete and owned only by us; libusb allows
        // freeing it from (or after) its completion callback.
        unsafe { ffi::libusb_free_transfer(self.transfer.as_ptr()) };
    }
}

extern "system" fn transfer_finished(transfer_ptr: *mut ffi::libusb_transfer) {
    if transfer_ptr.is_null() {
        return;
    }

    // SAFETY: libusb passes the transfer we filled; its user_data is the
    // `InFlight` leaked in `submit_transfer`, reclaimed exactly once here.
    let (in_flight, status, actual_length) = unsafe {
        let transfer = &*transfer_ptr;
        if transfer.user_data.is_null() {
            return;
        }
        (
            Box::from_raw(transfer.user_data as *mut InFlight),
            transfer.status,
            transfer.actual_length,
        )
    };

    let InFlight {
        transfer,
        buffer,
        on_complete,
        device,
    } = *in_flight;

    let finished = LibusbTransfer {
        transfer,
        buffer,
        status: map_transfer_status(status),
        actual_length: usize::try_from(actual_length).unwrap_or(0),
        _device: device,
    };

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        on_complete(Box::new(finished))
    }));
    if let Err(e) = result {
        error!("Panic in transfer completion callback: {:?}", e);
    }
}

extern "system" fn pollfd_added(fd: c_int, events: c_short, user_data: *mut c_void) {
    if let Some(notifiers) = notifiers_from(user_data) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            notifiers.descriptor_added(fd, Interest::from_poll_events(events))
        }));
        if let Err(e) = result {
            error!("Panic in pollfd added notifier: {:?}", e);
        }
    }
}

extern "system" fn pollfd_removed(fd: c_int, user_data: *mut c_void) {
    if let Some(notifiers) = notifiers_from(user_data) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            notifiers.descriptor_removed(fd)
        }));
        if let Err(e) = result {
            error!("Panic in pollfd removed notifier: {:?}", e);
        }
    }
}

/// Clone the notifiers out of libusb's user_data
///
/// The clone keeps them alive even if the callback replaces the registration.
fn notifiers_from(user_data: *mut c_void) -> Option<Rc<dyn PollfdNotifiers>> {
    if user_data.is_null() {
        return None;
    }
    // SAFETY: non-null user_data always points at the boxed `Rc` owned by the
    // `LibusbSubsystem` that registered it.
    let notifiers = unsafe { &*(user_data as *const Rc<dyn PollfdNotifiers>) };
    Some(notifiers.clone())
}

fn validate_request(shape: TransferShape, buffer: &[u8]) -> rusb::Result<()> {
    if c_int::try_from(buffer.len()).is_err() {
        return Err(rusb::Error::InvalidParam);
    }

    if shape == TransferShape::Control {
        if buffer.len() < CONTROL_SETUP_SIZE {
            return Err(rusb::Error::InvalidParam);
        }
        // libusb takes the data length from wLength in the setup packet.
        let w_length = usize::from(u16::from_le_bytes([buffer[6], buffer[7]]));
        if CONTROL_SETUP_SIZE + w_length > buffer.len() {
            return Err(rusb::Error::InvalidParam);
        }
    }

    Ok(())
}

/// Fill the 8-byte setup packet at the start of a control transfer buffer
///
/// Returns a buffer of `CONTROL_SETUP_SIZE + length` bytes; for OUT requests
/// `data` is copied after the setup packet.
pub fn control_buffer(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    data: &[u8],
) -> Vec<u8> {
    let mut buffer = vec![0u8; CONTROL_SETUP_SIZE + usize::from(length)];
    buffer[0] = request_type;
    buffer[1] = request;
    buffer[2..4].copy_from_slice(&value.to_le_bytes());
    buffer[4..6].copy_from_slice(&index.to_le_bytes());
    buffer[6..8].copy_from_slice(&length.to_le_bytes());

    let copied = data.len().min(usize::from(length));
    buffer[CONTROL_SETUP_SIZE..CONTROL_SETUP_SIZE + copied].copy_from_slice(&data[..copied]);
    buffer
}

fn map_transfer_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

/// Map a negative libusb return code to `rusb::Error`
pub fn map_libusb_error(code: c_int) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_libusb_error() {
        assert_eq!(map_libusb_error(LIBUSB_ERROR_NO_DEVICE), rusb::Error::NoDevice);
        assert_eq!(map_libusb_error(LIBUSB_ERROR_PIPE), rusb::Error::Pipe);
        assert_eq!(map_libusb_error(LIBUSB_ERROR_BUSY), rusb::Error::Busy);
        assert_eq!(map_libusb_error(-12345), rusb::Error::Other);
    }

    #[test]
    fn test_map_transfer_status() {
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_COMPLETED),
            TransferStatus::Completed
        );
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_TIMED_OUT),
            TransferStatus::TimedOut
        );
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_STALL),
            TransferStatus::Stall
        );
        assert_eq!(
            map_transfer_status(LIBUSB_TRANSFER_ERROR),
            TransferStatus::Error
        );
    }

    #[test]
    fn test_control_buffer_layout() {
        // GET_DESCRIPTOR(device), 18 bytes
        let buffer = control_buffer(0x80, 0x06, 0x0100, 0, 18, &[]);
        assert_eq!(buffer.len(), 26);
        assert_eq!(&buffer[..8], &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 18, 0]);
        assert!(validate_request(TransferShape::Control, &buffer).is_ok());
    }

    #[test]
    fn test_validate_control_request() {
        assert_eq!(
            validate_request(TransferShape::Control, &[0; 4]),
            Err(rusb::Error::InvalidParam)
        );

        // wLength of 16 but no room for it
        let mut short = control_buffer(0x80, 0x06, 0x0100, 0, 16, &[]);
        short.truncate(12);
        assert_eq!(
            validate_request(TransferShape::Control, &short),
            Err(rusb::Error::InvalidParam)
        );

        assert!(validate_request(TransferShape::Bulk { endpoint: 0x81 }, &[]).is_ok());
    }

    #[test]
    fn test_control_buffer_out_data() {
        let buffer = control_buffer(0x21, 0x09, 0x0200, 1, 3, &[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(buffer.len(), 11);
        assert_eq!(&buffer[8..], &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_subsystem_creation() {
        // May fail without libusb access in the test environment
        match LibusbSubsystem::new() {
            Ok(subsystem) => {
                let _ = subsystem.pollfds();
                assert!(subsystem.next_timeout().is_ok());
            }
            Err(e) => {
                eprintln!("libusb context creation failed (expected without USB): {}", e);
            }
        }
    }
}
