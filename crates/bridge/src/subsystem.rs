//! Device subsystem boundary
//!
//! The adapter and the transfer bridge only talk to the device I/O library
//! through [`DeviceSubsystem`]. The libusb backend lives in
//! [`crate::libusb`]; tests drive a scripted implementation from
//! `test_utils` (behind the `test-utils` feature).

use crate::types::{Interest, NextTimeout, PollfdSpec, TransferRequest, TransferStatus};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Receiver of the subsystem's descriptor-change notifications
///
/// The subsystem may call these at any time on the loop thread, including
/// from inside [`DeviceSubsystem::handle_events_timeout`].
pub trait PollfdNotifiers {
    fn descriptor_added(&self, fd: RawFd, interest: Interest);
    fn descriptor_removed(&self, fd: RawFd);
}

/// A transfer in its terminal state, owned by whoever received it
///
/// Dropping the box releases the subsystem's resources for the transfer.
pub trait TerminalTransfer {
    fn status(&self) -> TransferStatus;

    /// Bytes actually moved. For control transfers this excludes the setup
    /// packet.
    fn actual_length(&self) -> usize;

    /// Take the data buffer back, releasing the transfer
    fn into_buffer(self: Box<Self>) -> Vec<u8>;
}

/// Invoked by the subsystem exactly once per accepted transfer
pub type CompletionCallback = Box<dyn FnOnce(Box<dyn TerminalTransfer>)>;

/// Synchronous refusal of a transfer
///
/// The subsystem has already released everything it allocated; only the
/// caller's buffer comes back.
#[derive(Debug)]
pub struct Rejected {
    pub error: rusb::Error,
    pub buffer: Vec<u8>,
}

/// A polling-based device I/O library
pub trait DeviceSubsystem {
    /// Handle type transfers are addressed to
    type Device;

    /// Descriptors the subsystem currently wants watched
    fn pollfds(&self) -> Vec<PollfdSpec>;

    /// When the subsystem next needs servicing regardless of descriptor activity
    fn next_timeout(&self) -> rusb::Result<NextTimeout>;

    /// Service ready descriptors and due timeouts, waiting at most `max_wait`
    ///
    /// Completion callbacks of finished transfers fire from inside this call.
    fn handle_events_timeout(&self, max_wait: Duration) -> rusb::Result<()>;

    /// Install (or with `None`, remove) the descriptor-change notifiers
    fn set_pollfd_notifiers(&self, notifiers: Option<Rc<dyn PollfdNotifiers>>);

    /// Submit a single transfer
    ///
    /// On `Ok`, `on_complete` is later invoked exactly once from inside
    /// [`handle_events_timeout`](Self::handle_events_timeout). On `Err`, it is
    /// dropped without being called.
    fn submit_transfer(
        &self,
        device: &Self::Device,
        request: TransferRequest,
        on_complete: CompletionCallback,
    ) -> Result<(), Rejected>;
}

/// Terminal transfer synthesized for a synchronous rejection
///
/// It owns nothing of the subsystem's, so dropping it only frees the buffer.
#[derive(Debug)]
pub(crate) struct RejectedTransfer {
    pub(crate) buffer: Vec<u8>,
}

impl TerminalTransfer for RejectedTransfer {
    fn status(&self) -> TransferStatus {
        TransferStatus::SubmitRejected
    }

    fn actual_length(&self) -> usize {
        0
    }

    fn into_buffer(self: Box<Self>) -> Vec<u8> {
        self.buffer
    }
}
