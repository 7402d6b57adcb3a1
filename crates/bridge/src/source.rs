//! Event source adapter
//!
//! [`UsbSource`] plugs a [`DeviceSubsystem`] into the [`MainLoop`]: it mirrors
//! the subsystem's descriptors into the loop's poll table, turns the
//! subsystem's "next timeout" answer into a poll timeout, and lets the
//! subsystem service its descriptors once per wake.
//!
//! Descriptor notifications may arrive at any point on the loop thread,
//! including re-entrantly while [`EventSource::dispatch`] is inside the
//! subsystem. Nothing here holds a borrow of the descriptor set across a call
//! into the subsystem.

use crate::descriptor_set::{DescriptorSet, PollRegistry};
use crate::main_loop::{EventSource, MainLoop, PostAction, SourceId};
use crate::subsystem::{DeviceSubsystem, PollfdNotifiers};
use crate::types::{Interest, NextTimeout, round_up_to_millis};
use common::{Error, Result};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Event source driving a device subsystem from the main loop
pub struct UsbSource<S: DeviceSubsystem> {
    subsystem: Rc<S>,
    descriptors: Rc<RefCell<DescriptorSet>>,
    finalized: bool,
}

impl<S: DeviceSubsystem> UsbSource<S> {
    /// Build the adapter over `subsystem`, registering descriptors in `registry`
    ///
    /// The subsystem's current descriptors are added before the live
    /// notifiers are installed, so no change can slip in between.
    pub fn new(subsystem: Rc<S>, registry: Rc<dyn PollRegistry>) -> Self {
        let descriptors = Rc::new(RefCell::new(DescriptorSet::new(registry)));

        let initial = subsystem.pollfds();
        for pollfd in &initial {
            if let Err(e) = add_descriptor(&descriptors, pollfd.fd, pollfd.interest) {
                warn!("Ignoring initial descriptor: {}", e);
            }
        }
        debug!("USB source created with {} initial descriptors", initial.len());

        subsystem.set_pollfd_notifiers(Some(Rc::new(SourceNotifiers {
            descriptors: descriptors.clone(),
        })));

        Self {
            subsystem,
            descriptors,
            finalized: false,
        }
    }

    /// Handler for the subsystem's "descriptor added" notification
    ///
    /// # Errors
    ///
    /// `InternalConsistency` if `fd` is already tracked.
    pub fn on_descriptor_added(&self, fd: RawFd, interest: Interest) -> Result<()> {
        add_descriptor(&self.descriptors, fd, interest)
    }

    /// Handler for the subsystem's "descriptor removed" notification
    ///
    /// # Errors
    ///
    /// `InternalConsistency` if `fd` is not tracked.
    pub fn on_descriptor_removed(&self, fd: RawFd) -> Result<()> {
        remove_descriptor(&self.descriptors, fd)
    }

    /// Tracked descriptors in ascending fd order
    pub fn descriptor_fds(&self) -> Vec<RawFd> {
        self.descriptors.borrow().fds()
    }

    pub fn subsystem(&self) -> &Rc<S> {
        &self.subsystem
    }

    fn query_timeout(&self) -> NextTimeout {
        match self.subsystem.next_timeout() {
            Ok(timeout) => timeout,
            Err(e) => {
                warn!("Next timeout query failed: {}", e);
                NextTimeout::None
            }
        }
    }

    fn shutdown(&mut self) {
        if self.finalized {
            return;
        }

        self.subsystem.set_pollfd_notifiers(None);
        match self.descriptors.try_borrow_mut() {
            Ok(mut set) => set.teardown(),
            Err(_) => {
                // Stay unfinalized so a later finalize or Drop retries.
                error!("Descriptor set busy during finalize; registrations left in place");
                return;
            }
        }
        self.finalized = true;
        debug!("USB source finalized");
    }
}

impl<S: DeviceSubsystem + 'static> UsbSource<S> {
    /// Build the adapter and attach it to `main_loop`
    pub fn attach(subsystem: Rc<S>, main_loop: &mut MainLoop) -> SourceId {
        let source = UsbSource::new(subsystem, main_loop.poll_table());
        main_loop.attach(Box::new(source))
    }
}

impl<S: DeviceSubsystem> EventSource for UsbSource<S> {
    fn prepare(&mut self) -> (bool, Option<Duration>) {
        match self.query_timeout() {
            NextTimeout::None => (false, None),
            NextTimeout::Immediate => (true, Some(Duration::ZERO)),
            NextTimeout::After(timeout) => (false, Some(round_up_to_millis(timeout))),
        }
    }

    fn check(&mut self) -> bool {
        // Time may have passed while the loop polled.
        self.descriptors.borrow().any_ready() || self.query_timeout().is_due()
    }

    fn dispatch(&mut self) -> PostAction {
        match self.subsystem.handle_events_timeout(Duration::ZERO) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
            Err(e) => warn!("Error handling USB events: {}", e),
        }
        PostAction::Continue
    }

    fn finalize(&mut self) {
        self.shutdown();
    }
}

impl<S: DeviceSubsystem> Drop for UsbSource<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Notifier object handed to the subsystem
struct SourceNotifiers {
    descriptors: Rc<RefCell<DescriptorSet>>,
}

impl PollfdNotifiers for SourceNotifiers {
    fn descriptor_added(&self, fd: RawFd, interest: Interest) {
        if let Err(e) = add_descriptor(&self.descriptors, fd, interest) {
            warn!("Ignoring descriptor notification: {}", e);
        }
    }

    fn descriptor_removed(&self, fd: RawFd) {
        if let Err(e) = remove_descriptor(&self.descriptors, fd) {
            warn!("Ignoring descriptor notification: {}", e);
        }
    }
}

fn add_descriptor(
    descriptors: &RefCell<DescriptorSet>,
    fd: RawFd,
    interest: Interest,
) -> Result<()> {
    descriptors
        .try_borrow_mut()
        .map_err(|_| {
            Error::InternalConsistency(format!("descriptor set busy while adding fd {}", fd))
        })?
        .add(fd, interest)
}

fn remove_descriptor(descriptors: &RefCell<DescriptorSet>, fd: RawFd) -> Result<()> {
    descriptors
        .try_borrow_mut()
        .map_err(|_| {
            Error::InternalConsistency(format!("descriptor set busy while removing fd {}", fd))
        })?
        .remove(fd)
}
