//! Cooperative single-threaded main loop
//!
//! Each iteration runs every attached [`EventSource`] through four phases:
//!
//! 1. `prepare`: a source may declare itself ready or cap the poll timeout
//! 2. `poll(2)` over every descriptor registered in the [`PollTable`]
//! 3. `check`: sources that were not ready in prepare look at poll results
//! 4. `dispatch`: ready sources do their work
//!
//! Tasks queued on the [`IdleQueue`] run at the end of the iteration. The
//! loop stops when [`MainLoop::quit`] or a [`QuitHandle`] (usable from any
//! thread) is triggered.

use crate::descriptor_set::{Descriptor, PollRegistry};
use crate::types::Interest;
use common::{Error, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// What the loop should do with a source after dispatching it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    Continue,
    Remove,
}

/// The loop's four-phase source protocol
pub trait EventSource {
    /// Returns `(ready_now, suggested_timeout)`; `None` means no limit.
    fn prepare(&mut self) -> (bool, Option<Duration>);

    /// Called after polling when `prepare` did not report ready.
    fn check(&mut self) -> bool;

    /// Service the source. Returning [`PostAction::Remove`] detaches and
    /// finalizes it.
    fn dispatch(&mut self) -> PostAction;

    /// Called once when the source leaves the loop.
    fn finalize(&mut self);
}

/// Identifier returned by [`MainLoop::attach`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

/// Something that can defer a closure to a later point on the loop thread
pub trait Scheduler {
    /// Queue `task`; it never runs inside this call.
    fn schedule(&self, task: Box<dyn FnOnce()>);
}

/// Descriptors polled by the loop, shared with the sources that register them
#[derive(Default)]
pub struct PollTable {
    entries: RefCell<Vec<Descriptor>>,
}

impl PollTable {
    /// Registered descriptors
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    fn snapshot(&self) -> Vec<Descriptor> {
        self.entries.borrow().clone()
    }
}

impl PollRegistry for PollTable {
    fn add_poll(&self, descriptor: &Descriptor) {
        self.entries.borrow_mut().push(descriptor.clone());
    }

    fn remove_poll(&self, descriptor: &Descriptor) {
        self.entries
            .borrow_mut()
            .retain(|d| !d.same_registration(descriptor));
    }
}

/// FIFO of deferred closures
#[derive(Default)]
pub struct IdleQueue {
    tasks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

impl IdleQueue {
    /// Tasks waiting to run
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// True when no task is queued
    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Run the tasks queued so far
    ///
    /// Tasks queued while running wait for the next call. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let pending = self.len();
        for _ in 0..pending {
            let task = self.tasks.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
        pending
    }
}

impl Scheduler for IdleQueue {
    fn schedule(&self, task: Box<dyn FnOnce()>) {
        self.tasks.borrow_mut().push_back(task);
    }
}

struct QuitShared {
    quit: AtomicBool,
    writer: File,
}

/// Stops a [`MainLoop`] from any thread
#[derive(Clone)]
pub struct QuitHandle {
    shared: Arc<QuitShared>,
}

impl QuitHandle {
    /// Ask the loop to stop and wake it if it is blocked in poll
    ///
    /// Only the first call writes to the wake pipe.
    pub fn quit(&self) {
        if self.shared.quit.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake a blocked poll; the flag alone is enough if this fails.
        if let Err(e) = (&self.shared.writer).write_all(&[1]) {
            warn!("Failed to wake main loop: {}", e);
        }
    }

    /// Whether quit has been requested
    pub fn is_quit(&self) -> bool {
        self.shared.quit.load(Ordering::SeqCst)
    }
}

struct SourceSlot {
    id: SourceId,
    source: Box<dyn EventSource>,
}

/// Single-threaded event loop
pub struct MainLoop {
    sources: Vec<SourceSlot>,
    next_source_id: u64,
    polls: Rc<PollTable>,
    idle: Rc<IdleQueue>,
    wake_reader: File,
    quit: QuitHandle,
}

impl MainLoop {
    /// Empty loop with its own wake pipe
    pub fn new() -> Result<Self> {
        let (reader, writer) =
            nix::unistd::pipe().map_err(|e| Error::EventLoop(format!("pipe: {}", e)))?;

        Ok(Self {
            sources: Vec::new(),
            next_source_id: 1,
            polls: Rc::new(PollTable::default()),
            idle: Rc::new(IdleQueue::default()),
            wake_reader: File::from(reader),
            quit: QuitHandle {
                shared: Arc::new(QuitShared {
                    quit: AtomicBool::new(false),
                    writer: File::from(writer),
                }),
            },
        })
    }

    /// Registry sources use to add and remove polled descriptors
    pub fn poll_table(&self) -> Rc<PollTable> {
        self.polls.clone()
    }

    /// Queue whose tasks run at the end of each iteration
    pub fn idle_queue(&self) -> Rc<IdleQueue> {
        self.idle.clone()
    }

    /// Handle that can stop this loop from another thread
    pub fn quit_handle(&self) -> QuitHandle {
        self.quit.clone()
    }

    /// Same as `quit_handle().quit()`
    pub fn quit(&self) {
        self.quit.quit();
    }

    /// Add a source; it takes part from the next iteration on
    pub fn attach(&mut self, source: Box<dyn EventSource>) -> SourceId {
        let id = SourceId(self.next_source_id);
        self.next_source_id += 1;
        self.sources.push(SourceSlot { id, source });
        debug!("Attached event source {:?}", id);
        id
    }

    /// Detach and finalize a source; false if it is not attached
    pub fn remove_source(&mut self, id: SourceId) -> bool {
        match self.sources.iter().position(|slot| slot.id == id) {
            Some(index) => {
                let mut slot = self.sources.remove(index);
                slot.source.finalize();
                debug!("Removed event source {:?}", id);
                true
            }
            None => false,
        }
    }

    /// Sources currently attached
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Run iterations until quit
    pub fn run(&mut self) -> Result<()> {
        debug!("Main loop running");
        while !self.quit.is_quit() {
            self.iteration(true)?;
        }
        debug!("Main loop stopped");
        Ok(())
    }

    /// One prepare → poll → check → dispatch → idle pass
    ///
    /// With `may_block` false the poll never waits. Returns whether any source
    /// was dispatched or any idle task ran.
    pub fn iteration(&mut self, may_block: bool) -> Result<bool> {
        let mut ready = Vec::with_capacity(self.sources.len());
        let mut timeout: Option<Duration> = None;

        for slot in &mut self.sources {
            let (ready_now, suggested) = slot.source.prepare();
            ready.push(ready_now);
            if ready_now {
                timeout = Some(Duration::ZERO);
            } else if let Some(suggested) = suggested {
                timeout = Some(timeout.map_or(suggested, |t| t.min(suggested)));
            }
        }

        if !may_block || !self.idle.is_empty() || self.quit.is_quit() {
            timeout = Some(Duration::ZERO);
        }

        self.poll_descriptors(timeout)?;

        for (slot, ready_now) in self.sources.iter_mut().zip(ready.iter_mut()) {
            if !*ready_now {
                *ready_now = slot.source.check();
            }
        }

        let mut dispatched = false;
        let mut finished = Vec::new();
        for (slot, ready_now) in self.sources.iter_mut().zip(ready) {
            if !ready_now {
                continue;
            }
            dispatched = true;
            trace!("Dispatching event source {:?}", slot.id);
            if slot.source.dispatch() == PostAction::Remove {
                finished.push(slot.id);
            }
        }
        for id in finished {
            self.remove_source(id);
        }

        let ran = self.idle.run_pending();
        Ok(dispatched || ran > 0)
    }

    fn poll_descriptors(&mut self, timeout: Option<Duration>) -> Result<()> {
        let entries = self.polls.snapshot();
        for entry in &entries {
            entry.set_observed(Interest::NONE);
        }

        // SAFETY: every fd stays open while registered; the subsystem removes a
        // registration before closing its descriptor, and the wake pipe lives
        // as long as `self`.
        let mut fds: Vec<PollFd<'_>> = entries
            .iter()
            .map(|entry| {
                let fd = unsafe { BorrowedFd::borrow_raw(entry.fd()) };
                PollFd::new(fd, interest_to_flags(entry.interest()))
            })
            .collect();
        let wake_fd = unsafe { BorrowedFd::borrow_raw(self.wake_reader.as_raw_fd()) };
        fds.push(PollFd::new(wake_fd, PollFlags::POLLIN));

        match poll(&mut fds, to_poll_timeout(timeout)) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                trace!("poll interrupted");
                return Ok(());
            }
            Err(e) => {
                error!("poll failed: {}", e);
                return Err(Error::EventLoop(format!("poll: {}", e)));
            }
        }

        for (entry, pollfd) in entries.iter().zip(fds.iter()) {
            let revents = pollfd.revents().unwrap_or(PollFlags::empty());
            entry.set_observed(observed_from(revents, entry.interest()));
        }

        let woken = fds
            .last()
            .and_then(|pollfd| pollfd.revents())
            .is_some_and(|revents| revents.contains(PollFlags::POLLIN));
        drop(fds);
        if woken {
            let mut buf = [0u8; 16];
            if let Err(e) = self.wake_reader.read(&mut buf) {
                warn!("Failed to drain wake pipe: {}", e);
            }
        }

        Ok(())
    }
}

impl Drop for MainLoop {
    fn drop(&mut self) {
        for mut slot in self.sources.drain(..) {
            slot.source.finalize();
        }
    }
}

fn interest_to_flags(interest: Interest) -> PollFlags {
    PollFlags::from_bits_truncate(interest.to_poll_events())
}

/// Error and hang-up conditions count as activity on whatever the descriptor
/// is interested in.
fn observed_from(revents: PollFlags, interest: Interest) -> Interest {
    let observed = Interest::from_poll_events(revents.bits());
    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
        if interest.is_empty() {
            return observed | Interest::READABLE;
        }
        return observed | interest;
    }
    observed
}

/// `poll(2)` takes milliseconds; long waits are capped and simply re-prepared.
fn to_poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(timeout) => {
            let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
            PollTimeout::from(millis)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_idle_queue_defers_tasks_queued_while_running() {
        let queue = Rc::new(IdleQueue::default());
        let order = Rc::new(RefCell::new(Vec::new()));

        let inner_queue = queue.clone();
        let inner_order = order.clone();
        queue.schedule(Box::new(move || {
            inner_order.borrow_mut().push(1);
            let nested_order = inner_order.clone();
            inner_queue.schedule(Box::new(move || nested_order.borrow_mut().push(2)));
        }));

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(*order.borrow(), vec![1]);
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(*order.borrow(), vec![1, 2]);
        assert_eq!(queue.run_pending(), 0);
    }

    #[test]
    fn test_poll_table_removes_by_registration() {
        let table = PollTable::default();
        let first = Descriptor::new(3, Interest::READABLE);
        let second = Descriptor::new(3, Interest::WRITABLE);
        table.add_poll(&first);
        table.add_poll(&second);

        table.remove_poll(&first);

        let left = table.snapshot();
        assert_eq!(left.len(), 1);
        assert!(left[0].same_registration(&second));
    }

    #[test]
    fn test_observed_from_error_bits() {
        assert_eq!(
            observed_from(PollFlags::POLLHUP, Interest::WRITABLE),
            Interest::WRITABLE
        );
        assert_eq!(
            observed_from(PollFlags::POLLERR, Interest::NONE),
            Interest::READABLE
        );
        assert_eq!(
            observed_from(PollFlags::POLLIN, Interest::BOTH),
            Interest::READABLE
        );
    }

    #[test]
    fn test_quit_handle_stops_run() {
        let mut main_loop = MainLoop::new().unwrap();
        let handle = main_loop.quit_handle();
        let ran = Rc::new(Cell::new(false));

        let flag = ran.clone();
        main_loop.idle_queue().schedule(Box::new(move || {
            flag.set(true);
            handle.quit();
        }));
        main_loop.run().unwrap();

        assert!(ran.get());
        assert!(main_loop.quit_handle().is_quit());
    }

    #[test]
    fn test_quit_from_other_thread_wakes_poll() {
        let mut main_loop = MainLoop::new().unwrap();
        let handle = main_loop.quit_handle();

        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.quit();
        });

        // Nothing attached: without the wake pipe this would block forever.
        main_loop.run().unwrap();
        waker.join().unwrap();
    }

    #[test]
    fn test_to_poll_timeout() {
        assert_eq!(to_poll_timeout(None), PollTimeout::NONE);
        assert_eq!(
            to_poll_timeout(Some(Duration::from_millis(5))),
            PollTimeout::from(5u16)
        );
        assert_eq!(
            to_poll_timeout(Some(Duration::from_secs(3600))),
            PollTimeout::from(u16::MAX)
        );
    }
}
