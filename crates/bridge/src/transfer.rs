//! Asynchronous transfer bridge
//!
//! Turns the subsystem's one-shot, callback-driven transfer primitive into a
//! submit → continuation → finish contract:
//!
//! - [`TransferBridge::submit`] hands the request to the subsystem and returns a
//!   [`TransferHandle`].
//! - When the transfer reaches a terminal state (completion callback fired
//!   from inside the source's dispatch, or synchronous rejection), the
//!   continuation is scheduled on the loop with a clone of the handle. It is
//!   never run inline from `submit`.
//! - [`TransferHandle::finish`] takes the result exactly once and releases the
//!   subsystem's transfer resources.
//!
//! Each handle moves through `Pending → Completed → Consumed`; rejection lands
//! directly in `Completed` with [`TransferStatus::SubmitRejected`].

use crate::main_loop::{MainLoop, Scheduler};
use crate::subsystem::{
    CompletionCallback, DeviceSubsystem, Rejected, RejectedTransfer, TerminalTransfer,
};
use crate::types::{CONTROL_SETUP_SIZE, TransferRequest, TransferShape, TransferStatus};
use common::{Error, Result};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Caller-supplied completion handler
pub type Continuation = Box<dyn FnOnce(TransferHandle)>;

/// Outcome returned by [`TransferHandle::finish`]
#[derive(Debug)]
pub struct TransferResult {
    pub shape: TransferShape,
    pub status: TransferStatus,
    pub actual_length: usize,
    /// The buffer passed at submission, with received data for IN transfers
    pub buffer: Vec<u8>,
    /// Why the subsystem refused the transfer, for `SubmitRejected`
    pub rejection: Option<rusb::Error>,
}

impl TransferResult {
    /// Bytes actually transferred
    ///
    /// For control transfers this skips the setup packet at the start of the
    /// buffer.
    pub fn data(&self) -> &[u8] {
        let start = match self.shape {
            TransferShape::Control => CONTROL_SETUP_SIZE.min(self.buffer.len()),
            _ => 0,
        };
        let end = start.saturating_add(self.actual_length).min(self.buffer.len());
        &self.buffer[start..end]
    }
}

enum TransferState {
    Pending,
    Completed {
        transfer: Box<dyn TerminalTransfer>,
        rejection: Option<rusb::Error>,
    },
    Consumed,
}

struct TransferInner {
    shape: TransferShape,
    state: RefCell<TransferState>,
    continuation: RefCell<Option<Continuation>>,
}

/// Shared handle to one submitted transfer
#[derive(Clone)]
pub struct TransferHandle {
    inner: Rc<TransferInner>,
}

impl TransferHandle {
    fn new(shape: TransferShape, continuation: Continuation) -> Self {
        Self {
            inner: Rc::new(TransferInner {
                shape,
                state: RefCell::new(TransferState::Pending),
                continuation: RefCell::new(Some(continuation)),
            }),
        }
    }

    pub fn shape(&self) -> TransferShape {
        self.inner.shape
    }

    /// True once the transfer reached a terminal state and before `finish`
    pub fn is_completed(&self) -> bool {
        matches!(*self.inner.state.borrow(), TransferState::Completed { .. })
    }

    pub fn is_consumed(&self) -> bool {
        matches!(*self.inner.state.borrow(), TransferState::Consumed)
    }

    /// Take the terminal result
    ///
    /// The subsystem's resources for the transfer are released before this
    /// returns.
    ///
    /// # Errors
    ///
    /// `NotReady` before completion (nothing changes), `AlreadyConsumed` on any
    /// call after the first successful one.
    pub fn finish(&self) -> Result<TransferResult> {
        let mut state = self.inner.state.borrow_mut();
        match std::mem::replace(&mut *state, TransferState::Consumed) {
            TransferState::Pending => {
                *state = TransferState::Pending;
                Err(Error::NotReady)
            }
            TransferState::Consumed => Err(Error::AlreadyConsumed),
            TransferState::Completed {
                transfer,
                rejection,
            } => {
                let status = transfer.status();
                let actual_length = transfer.actual_length();
                let buffer = transfer.into_buffer();
                Ok(TransferResult {
                    shape: self.inner.shape,
                    status,
                    actual_length,
                    buffer,
                    rejection,
                })
            }
        }
    }

    /// Record the terminal transfer and schedule the continuation
    fn complete(
        &self,
        transfer: Box<dyn TerminalTransfer>,
        rejection: Option<rusb::Error>,
        scheduler: &dyn Scheduler,
    ) {
        {
            let mut state = self.inner.state.borrow_mut();
            if !matches!(*state, TransferState::Pending) {
                // Dropping `transfer` here releases it; the first outcome stands.
                error!(
                    "Duplicate completion for {} transfer ignored",
                    self.inner.shape
                );
                return;
            }
            *state = TransferState::Completed {
                transfer,
                rejection,
            };
        }

        let continuation = self.inner.continuation.borrow_mut().take();
        if let Some(continuation) = continuation {
            let handle = self.clone();
            scheduler.schedule(Box::new(move || continuation(handle)));
        }
    }
}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.inner.state.borrow() {
            TransferState::Pending => "pending",
            TransferState::Completed { .. } => "completed",
            TransferState::Consumed => "consumed",
        };
        f.debug_struct("TransferHandle")
            .field("shape", &self.inner.shape)
            .field("state", &state)
            .finish()
    }
}

/// Submits transfers to a subsystem and routes their completions
pub struct TransferBridge<S: DeviceSubsystem> {
    subsystem: Rc<S>,
    scheduler: Rc<dyn Scheduler>,
}

impl<S: DeviceSubsystem> Clone for TransferBridge<S> {
    fn clone(&self) -> Self {
        Self {
            subsystem: self.subsystem.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<S: DeviceSubsystem> TransferBridge<S> {
    pub fn new(subsystem: Rc<S>, scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            subsystem,
            scheduler,
        }
    }

    /// Bridge whose continuations run on `main_loop`'s idle queue
    pub fn for_loop(subsystem: Rc<S>, main_loop: &MainLoop) -> Self {
        Self::new(subsystem, main_loop.idle_queue())
    }

    /// Submit one transfer of any shape
    ///
    /// `continuation` runs exactly once, later, on the loop.
    pub fn submit<F>(
        &self,
        device: &S::Device,
        shape: TransferShape,
        timeout: Duration,
        buffer: Vec<u8>,
        continuation: F,
    ) -> TransferHandle
    where
        F: FnOnce(TransferHandle) + 'static,
    {
        let handle = TransferHandle::new(shape, Box::new(continuation));
        let length = buffer.len();

        let on_complete: CompletionCallback = {
            let handle = handle.clone();
            let scheduler = self.scheduler.clone();
            Box::new(move |transfer| {
                debug!(
                    "{} transfer finished: {} ({} bytes)",
                    handle.shape(),
                    transfer.status(),
                    transfer.actual_length()
                );
                handle.complete(transfer, None, scheduler.as_ref());
            })
        };

        let request = TransferRequest {
            shape,
            buffer,
            timeout,
        };

        match self.subsystem.submit_transfer(device, request, on_complete) {
            Ok(()) => {
                debug!(
                    "Submitted {} transfer: length={}, timeout={}ms",
                    shape,
                    length,
                    timeout.as_millis()
                );
            }
            Err(Rejected { error, buffer }) => {
                warn!("{} transfer rejected at submission: {}", shape, error);
                handle.complete(
                    Box::new(RejectedTransfer { buffer }),
                    Some(error),
                    self.scheduler.as_ref(),
                );
            }
        }

        handle
    }

    /// Control transfer; the buffer starts with the 8-byte setup packet
    pub fn control_transfer<F>(
        &self,
        device: &S::Device,
        timeout: Duration,
        buffer: Vec<u8>,
        continuation: F,
    ) -> TransferHandle
    where
        F: FnOnce(TransferHandle) + 'static,
    {
        self.submit(device, TransferShape::Control, timeout, buffer, continuation)
    }

    pub fn interrupt_transfer<F>(
        &self,
        device: &S::Device,
        endpoint: u8,
        timeout: Duration,
        buffer: Vec<u8>,
        continuation: F,
    ) -> TransferHandle
    where
        F: FnOnce(TransferHandle) + 'static,
    {
        self.submit(
            device,
            TransferShape::Interrupt { endpoint },
            timeout,
            buffer,
            continuation,
        )
    }

    pub fn bulk_transfer<F>(
        &self,
        device: &S::Device,
        endpoint: u8,
        timeout: Duration,
        buffer: Vec<u8>,
        continuation: F,
    ) -> TransferHandle
    where
        F: FnOnce(TransferHandle) + 'static,
    {
        self.submit(
            device,
            TransferShape::Bulk { endpoint },
            timeout,
            buffer,
            continuation,
        )
    }

    /// Finish a handle returned by [`control_transfer`](Self::control_transfer)
    ///
    /// # Errors
    ///
    /// `InternalConsistency` for a handle of another shape (left untouched),
    /// otherwise as [`TransferHandle::finish`].
    pub fn control_transfer_finish(&self, handle: &TransferHandle) -> Result<TransferResult> {
        finish_shape(handle, |shape| matches!(shape, TransferShape::Control))
    }

    /// # Errors
    ///
    /// As [`control_transfer_finish`](Self::control_transfer_finish).
    pub fn interrupt_transfer_finish(&self, handle: &TransferHandle) -> Result<TransferResult> {
        finish_shape(handle, |shape| {
            matches!(shape, TransferShape::Interrupt { .. })
        })
    }

    /// # Errors
    ///
    /// As [`control_transfer_finish`](Self::control_transfer_finish).
    pub fn bulk_transfer_finish(&self, handle: &TransferHandle) -> Result<TransferResult> {
        finish_shape(handle, |shape| matches!(shape, TransferShape::Bulk { .. }))
    }
}

fn finish_shape(
    handle: &TransferHandle,
    expected: impl Fn(TransferShape) -> bool,
) -> Result<TransferResult> {
    if !expected(handle.shape()) {
        return Err(Error::InternalConsistency(format!(
            "finish called with a {} transfer handle of the wrong shape",
            handle.shape()
        )));
    }
    handle.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::main_loop::IdleQueue;
    use crate::test_utils::{MockDevice, MockSubsystem, SubmitBehavior};
    use std::cell::Cell;

    fn new_bridge() -> (TransferBridge<MockSubsystem>, Rc<MockSubsystem>, Rc<IdleQueue>) {
        let subsystem = Rc::new(MockSubsystem::new());
        let idle = Rc::new(IdleQueue::default());
        (
            TransferBridge::new(subsystem.clone(), idle.clone()),
            subsystem,
            idle,
        )
    }

    #[test]
    fn test_finish_before_completion_is_not_ready() {
        let (bridge, subsystem, _idle) = new_bridge();
        let device = MockDevice::new(1);

        let handle =
            bridge.bulk_transfer(&device, 0x81, Duration::from_millis(100), vec![0; 64], |_| {});

        assert!(matches!(handle.finish(), Err(Error::NotReady)));
        assert_eq!(subsystem.pending_transfers(), 1);
        assert!(!handle.is_completed());
    }

    #[test]
    fn test_completion_schedules_continuation() {
        let (bridge, subsystem, idle) = new_bridge();
        let device = MockDevice::new(1);
        let called = Rc::new(Cell::new(false));

        let flag = called.clone();
        let handle = bridge.interrupt_transfer(
            &device,
            0x81,
            Duration::from_millis(100),
            vec![0; 8],
            move |handle| {
                flag.set(true);
                let result = handle.finish().unwrap();
                assert_eq!(result.status, TransferStatus::Completed);
                assert_eq!(result.actual_length, 4);
                assert_eq!(result.data(), &[1, 2, 3, 4]);
            },
        );

        subsystem.complete_next(TransferStatus::Completed, &[1, 2, 3, 4]);
        subsystem.handle_events_timeout(Duration::ZERO).unwrap();
        assert!(!called.get());
        assert!(handle.is_completed());

        idle.run_pending();
        assert!(called.get());
        assert!(handle.is_consumed());
        assert_eq!(subsystem.released_transfers(), 1);
    }

    #[test]
    fn test_second_finish_is_already_consumed() {
        let (bridge, subsystem, _idle) = new_bridge();
        let device = MockDevice::new(1);

        let handle =
            bridge.bulk_transfer(&device, 0x02, Duration::from_millis(100), vec![7; 16], |_| {});
        subsystem.complete_next(TransferStatus::Completed, &[]);
        subsystem.handle_events_timeout(Duration::ZERO).unwrap();

        let result = handle.finish().unwrap();
        assert_eq!(result.buffer.len(), 16);
        assert!(matches!(handle.finish(), Err(Error::AlreadyConsumed)));
        assert_eq!(subsystem.released_transfers(), 1);
    }

    #[test]
    fn test_rejected_submit_completes_on_loop() {
        let (bridge, subsystem, idle) = new_bridge();
        subsystem.set_submit_behavior(SubmitBehavior::Reject(rusb::Error::NoDevice));
        let device = MockDevice::new(1);
        let called = Rc::new(Cell::new(false));

        let flag = called.clone();
        let handle = bridge.control_transfer(
            &device,
            Duration::from_millis(1000),
            vec![0; 8],
            move |handle| {
                flag.set(true);
                let result = handle.finish().unwrap();
                assert_eq!(result.status, TransferStatus::SubmitRejected);
                assert_eq!(result.actual_length, 0);
                assert!(result.data().is_empty());
                assert_eq!(result.rejection, Some(rusb::Error::NoDevice));
            },
        );

        assert!(!called.get());
        assert!(handle.is_completed());
        assert_eq!(subsystem.pending_transfers(), 0);

        idle.run_pending();
        assert!(called.get());
    }

    #[test]
    fn test_finish_with_wrong_shape_leaves_result() {
        let (bridge, subsystem, _idle) = new_bridge();
        let device = MockDevice::new(1);

        let handle =
            bridge.bulk_transfer(&device, 0x81, Duration::from_millis(10), vec![0; 4], |_| {});
        subsystem.complete_next(TransferStatus::TimedOut, &[]);
        subsystem.handle_events_timeout(Duration::ZERO).unwrap();

        assert!(matches!(
            bridge.control_transfer_finish(&handle),
            Err(Error::InternalConsistency(_))
        ));
        let result = bridge.bulk_transfer_finish(&handle).unwrap();
        assert_eq!(result.status, TransferStatus::TimedOut);
    }

    #[test]
    fn test_shape_fields_reach_subsystem() {
        let (bridge, subsystem, _idle) = new_bridge();
        let device = MockDevice::new(3);

        bridge.control_transfer(&device, Duration::from_millis(5), vec![0; 8], |_| {});
        bridge.interrupt_transfer(&device, 0x83, Duration::from_millis(6), vec![0; 8], |_| {});
        bridge.bulk_transfer(&device, 0x04, Duration::from_millis(7), vec![0; 512], |_| {});

        let submitted = subsystem.submitted();
        assert_eq!(submitted.len(), 3);
        assert_eq!(submitted[0].shape, TransferShape::Control);
        assert_eq!(submitted[1].shape, TransferShape::Interrupt { endpoint: 0x83 });
        assert_eq!(submitted[2].shape, TransferShape::Bulk { endpoint: 0x04 });
        assert_eq!(submitted[2].length, 512);
        assert_eq!(submitted[1].timeout, Duration::from_millis(6));
        assert!(submitted.iter().all(|s| s.device_id == 3));
    }
}
