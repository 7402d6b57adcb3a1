//! Test utilities for the bridge crate
//!
//! Provides a scripted [`DeviceSubsystem`] and a [`PollRegistry`] that records
//! what was registered, so the adapter and the transfer bridge can be driven
//! without libusb or hardware.
//!
//! # Example
//!
//! ```
//! use bridge::test_utils::MockSubsystem;
//! use bridge::types::{Interest, NextTimeout};
//! use bridge::DeviceSubsystem;
//!
//! let subsystem = MockSubsystem::with_pollfds(&[(5, Interest::READABLE)]);
//! assert_eq!(subsystem.pollfds().len(), 1);
//! assert_eq!(subsystem.next_timeout().unwrap(), NextTimeout::None);
//! ```

use crate::descriptor_set::{Descriptor, PollRegistry};
use crate::subsystem::{
    CompletionCallback, DeviceSubsystem, PollfdNotifiers, Rejected, TerminalTransfer,
};
use crate::types::{
    CONTROL_SETUP_SIZE, Interest, NextTimeout, PollfdSpec, TransferRequest, TransferShape,
    TransferStatus,
};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Device handle type of [`MockSubsystem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockDevice {
    pub id: u32,
}

impl MockDevice {
    pub fn new(id: u32) -> Self {
        Self { id }
    }
}

/// How [`MockSubsystem::submit_transfer`] answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitBehavior {
    Accept,
    Reject(rusb::Error),
}

/// What the subsystem saw for one accepted or rejected submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTransfer {
    pub device_id: u32,
    pub shape: TransferShape,
    pub length: usize,
    pub timeout: Duration,
    pub accepted: bool,
}

struct PendingTransfer {
    shape: TransferShape,
    buffer: Vec<u8>,
    on_complete: CompletionCallback,
}

/// Terminal transfer produced by [`MockSubsystem`]; counts its own release
pub struct MockTransfer {
    status: TransferStatus,
    actual_length: usize,
    buffer: Vec<u8>,
    released: Rc<Cell<usize>>,
}

impl TerminalTransfer for MockTransfer {
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

impl Drop for MockTransfer {
    fn drop(&mut self) {
        self.released.set(self.released.get() + 1);
    }
}

type ScriptedAction = Box<dyn FnOnce(&MockSubsystem)>;

/// Scripted device subsystem
///
/// Completions queued with [`complete_next`](Self::complete_next) and actions
/// queued with [`on_next_handle_events`](Self::on_next_handle_events) only run
/// inside [`handle_events_timeout`](DeviceSubsystem::handle_events_timeout),
/// like a real subsystem's callbacks.
pub struct MockSubsystem {
    pollfds: RefCell<Vec<PollfdSpec>>,
    next_timeout: Cell<NextTimeout>,
    fail_next_timeout: Cell<bool>,
    handle_events_error: Cell<Option<rusb::Error>>,
    handle_events_calls: RefCell<Vec<Duration>>,
    notifiers: RefCell<Option<Rc<dyn PollfdNotifiers>>>,
    submit_behavior: Cell<SubmitBehavior>,
    submitted: RefCell<Vec<SubmittedTransfer>>,
    pending: RefCell<VecDeque<PendingTransfer>>,
    completions: RefCell<VecDeque<(TransferStatus, Vec<u8>)>>,
    actions: RefCell<Vec<ScriptedAction>>,
    released: Rc<Cell<usize>>,
}

impl Default for MockSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSubsystem {
    pub fn new() -> Self {
        Self {
            pollfds: RefCell::new(Vec::new()),
            next_timeout: Cell::new(NextTimeout::None),
            fail_next_timeout: Cell::new(false),
            handle_events_error: Cell::new(None),
            handle_events_calls: RefCell::new(Vec::new()),
            notifiers: RefCell::new(None),
            submit_behavior: Cell::new(SubmitBehavior::Accept),
            submitted: RefCell::new(Vec::new()),
            pending: RefCell::new(VecDeque::new()),
            completions: RefCell::new(VecDeque::new()),
            actions: RefCell::new(Vec::new()),
            released: Rc::new(Cell::new(0)),
        }
    }

    pub fn with_pollfds(pollfds: &[(RawFd, Interest)]) -> Self {
        let subsystem = Self::new();
        subsystem.pollfds.borrow_mut().extend(
            pollfds
                .iter()
                .map(|&(fd, interest)| PollfdSpec { fd, interest }),
        );
        subsystem
    }

    pub fn set_next_timeout(&self, timeout: NextTimeout) {
        self.next_timeout.set(timeout);
    }

    pub fn fail_next_timeout(&self, fail: bool) {
        self.fail_next_timeout.set(fail);
    }

    /// Make every following `handle_events_timeout` return `error`
    pub fn fail_handle_events(&self, error: Option<rusb::Error>) {
        self.handle_events_error.set(error);
    }

    pub fn set_submit_behavior(&self, behavior: SubmitBehavior) {
        self.submit_behavior.set(behavior);
    }

    /// Add a descriptor and notify, as the real subsystem would on open
    pub fn notify_added(&self, fd: RawFd, interest: Interest) {
        self.pollfds.borrow_mut().push(PollfdSpec { fd, interest });
        let notifiers = self.notifiers.borrow().clone();
        if let Some(notifiers) = notifiers {
            notifiers.descriptor_added(fd, interest);
        }
    }

    /// Remove a descriptor and notify; notifies even for unknown fds
    pub fn notify_removed(&self, fd: RawFd) {
        self.pollfds.borrow_mut().retain(|p| p.fd != fd);
        let notifiers = self.notifiers.borrow().clone();
        if let Some(notifiers) = notifiers {
            notifiers.descriptor_removed(fd);
        }
    }

    /// Run `action` inside the next `handle_events_timeout` call
    pub fn on_next_handle_events(&self, action: impl FnOnce(&MockSubsystem) + 'static) {
        self.actions.borrow_mut().push(Box::new(action));
    }

    /// Finish the oldest pending transfer during the next event handling
    ///
    /// `data` is copied to the start of the transfer buffer and its length
    /// becomes the actual length. For control transfers `data` includes the
    /// setup packet, which the actual length does not count.
    pub fn complete_next(&self, status: TransferStatus, data: &[u8]) {
        self.completions
            .borrow_mut()
            .push_back((status, data.to_vec()));
    }

    pub fn has_notifiers(&self) -> bool {
        self.notifiers.borrow().is_some()
    }

    pub fn handle_events_calls(&self) -> Vec<Duration> {
        self.handle_events_calls.borrow().clone()
    }

    pub fn submitted(&self) -> Vec<SubmittedTransfer> {
        self.submitted.borrow().clone()
    }

    /// Accepted transfers whose callback has not fired yet
    pub fn pending_transfers(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Terminal transfers dropped so far
    pub fn released_transfers(&self) -> usize {
        self.released.get()
    }

    fn fire_completion(&self, status: TransferStatus, data: Vec<u8>) -> bool {
        let Some(pending) = self.pending.borrow_mut().pop_front() else {
            return false;
        };

        let mut buffer = pending.buffer;
        let copied = data.len().min(buffer.len());
        buffer[..copied].copy_from_slice(&data[..copied]);
        let actual_length = match pending.shape {
            TransferShape::Control => copied.saturating_sub(CONTROL_SETUP_SIZE),
            _ => copied,
        };

        (pending.on_complete)(Box::new(MockTransfer {
            status,
            actual_length,
            buffer,
            released: self.released.clone(),
        }));
        true
    }
}

impl DeviceSubsystem for MockSubsystem {
    type Device = MockDevice;

    fn pollfds(&self) -> Vec<PollfdSpec> {
        self.pollfds.borrow().clone()
    }

    fn next_timeout(&self) -> rusb::Result<NextTimeout> {
        if self.fail_next_timeout.get() {
            return Err(rusb::Error::Other);
        }
        Ok(self.next_timeout.get())
    }

    fn handle_events_timeout(&self, max_wait: Duration) -> rusb::Result<()> {
        self.handle_events_calls.borrow_mut().push(max_wait);
        if let Some(error) = self.handle_events_error.get() {
            return Err(error);
        }

        let actions: Vec<ScriptedAction> = self.actions.borrow_mut().drain(..).collect();
        for action in actions {
            action(self);
        }

        let completions: Vec<(TransferStatus, Vec<u8>)> =
            self.completions.borrow_mut().drain(..).collect();
        for (status, data) in completions {
            if !self.fire_completion(status, data) {
                break;
            }
        }
        Ok(())
    }

    fn set_pollfd_notifiers(&self, notifiers: Option<Rc<dyn PollfdNotifiers>>) {
        *self.notifiers.borrow_mut() = notifiers;
    }

    fn submit_transfer(
        &self,
        device: &MockDevice,
        request: TransferRequest,
        on_complete: CompletionCallback,
    ) -> Result<(), Rejected> {
        let behavior = self.submit_behavior.get();
        self.submitted.borrow_mut().push(SubmittedTransfer {
            device_id: device.id,
            shape: request.shape,
            length: request.buffer.len(),
            timeout: request.timeout,
            accepted: behavior == SubmitBehavior::Accept,
        });

        match behavior {
            SubmitBehavior::Accept => {
                self.pending.borrow_mut().push_back(PendingTransfer {
                    shape: request.shape,
                    buffer: request.buffer,
                    on_complete,
                });
                Ok(())
            }
            SubmitBehavior::Reject(error) => Err(Rejected {
                error,
                buffer: request.buffer,
            }),
        }
    }
}

/// Poll registry that records every registration
#[derive(Default)]
pub struct RecordingRegistry {
    registered: RefCell<Vec<Descriptor>>,
    adds: RefCell<HashMap<RawFd, usize>>,
    removes: RefCell<HashMap<RawFd, usize>>,
}

impl RecordingRegistry {
    /// Currently registered fds, ascending, duplicates kept
    pub fn registered_fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.registered.borrow().iter().map(|d| d.fd()).collect();
        fds.sort_unstable();
        fds
    }

    pub fn add_count(&self, fd: RawFd) -> usize {
        self.adds.borrow().get(&fd).copied().unwrap_or(0)
    }

    pub fn remove_count(&self, fd: RawFd) -> usize {
        self.removes.borrow().get(&fd).copied().unwrap_or(0)
    }

    /// Play the loop's poll step for one fd
    pub fn set_observed(&self, fd: RawFd, observed: Interest) {
        for descriptor in self.registered.borrow().iter().filter(|d| d.fd() == fd) {
            descriptor.set_observed(observed);
        }
    }
}

impl PollRegistry for RecordingRegistry {
    fn add_poll(&self, descriptor: &Descriptor) {
        self.registered.borrow_mut().push(descriptor.clone());
        *self.adds.borrow_mut().entry(descriptor.fd()).or_insert(0) += 1;
    }

    fn remove_poll(&self, descriptor: &Descriptor) {
        self.registered
            .borrow_mut()
            .retain(|d| !d.same_registration(descriptor));
        *self.removes.borrow_mut().entry(descriptor.fd()).or_insert(0) += 1;
    }
}

/// A connected pipe: (read end, write end)
///
/// # Panics
///
/// If the pipe cannot be created.
pub fn pipe() -> (File, File) {
    let (reader, writer) = nix::unistd::pipe().expect("Failed to create pipe");
    (File::from(reader), File::from(writer))
}
