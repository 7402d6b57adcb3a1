//! Descriptor set
//!
//! Tracks the descriptors an event source asks the loop to poll. Every entry
//! in the set is registered with the loop's [`PollRegistry`] and every
//! registration made through the set has an entry; `add`, `remove` and
//! `teardown` keep the two in lock-step.

use crate::types::Interest;
use common::{Error, Result};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::debug;

/// A polled descriptor
///
/// Clones share the observed mask, so the copy held by the loop's poll table
/// and the copy held by the set see the same readiness.
#[derive(Clone)]
pub struct Descriptor {
    fd: RawFd,
    interest: Interest,
    observed: Rc<Cell<Interest>>,
}

impl Descriptor {
    /// New registration with nothing observed yet
    pub fn new(fd: RawFd, interest: Interest) -> Self {
        Self {
            fd,
            interest,
            observed: Rc::new(Cell::new(Interest::NONE)),
        }
    }

    /// Underlying OS descriptor
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Readiness the subsystem asked to be woken for
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Readiness seen by the last poll
    pub fn observed(&self) -> Interest {
        self.observed.get()
    }

    /// Written by the loop's poll step only
    pub fn set_observed(&self, observed: Interest) {
        self.observed.set(observed);
    }

    /// Whether `other` is the same registration (not merely the same fd)
    pub fn same_registration(&self, other: &Descriptor) -> bool {
        Rc::ptr_eq(&self.observed, &other.observed)
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("fd", &self.fd)
            .field("interest", &self.interest)
            .field("observed", &self.observed.get())
            .finish()
    }
}

/// The loop's poll mechanism, as seen by an event source
pub trait PollRegistry {
    /// Start polling `descriptor`; readiness is written to its observed mask.
    fn add_poll(&self, descriptor: &Descriptor);

    /// Stop polling the registration `descriptor` was created as.
    fn remove_poll(&self, descriptor: &Descriptor);
}

/// fd → Descriptor mapping mirrored into a [`PollRegistry`]
pub struct DescriptorSet {
    registry: Rc<dyn PollRegistry>,
    descriptors: HashMap<RawFd, Descriptor>,
}

impl DescriptorSet {
    /// Empty set that mirrors additions and removals into `registry`
    pub fn new(registry: Rc<dyn PollRegistry>) -> Self {
        Self {
            registry,
            descriptors: HashMap::new(),
        }
    }

    /// Start tracking `fd` and register it for polling
    ///
    /// # Errors
    ///
    /// `InternalConsistency` if `fd` is already tracked; the existing entry is
    /// kept as is.
    pub fn add(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        if let Some(existing) = self.descriptors.get(&fd) {
            return Err(Error::InternalConsistency(format!(
                "fd {} added twice (tracked interest {}, new interest {})",
                fd,
                existing.interest(),
                interest
            )));
        }

        let descriptor = Descriptor::new(fd, interest);
        self.registry.add_poll(&descriptor);
        self.descriptors.insert(fd, descriptor);
        debug!("now monitoring fd {} ({})", fd, interest);
        Ok(())
    }

    /// Stop tracking `fd` and deregister it
    ///
    /// # Errors
    ///
    /// `InternalConsistency` if `fd` is not tracked; the set is unchanged.
    pub fn remove(&mut self, fd: RawFd) -> Result<()> {
        let descriptor = self.descriptors.remove(&fd).ok_or_else(|| {
            Error::InternalConsistency(format!("couldn't find fd {} in descriptor set", fd))
        })?;

        self.registry.remove_poll(&descriptor);
        debug!("no longer monitoring fd {}", fd);
        Ok(())
    }

    /// True iff some descriptor saw activity in the last poll
    pub fn any_ready(&self) -> bool {
        self.descriptors.values().any(|d| !d.observed().is_empty())
    }

    /// Deregister and drop every descriptor
    pub fn teardown(&mut self) {
        if self.descriptors.is_empty() {
            return;
        }

        let count = self.descriptors.len();
        for (_, descriptor) in self.descriptors.drain() {
            self.registry.remove_poll(&descriptor);
        }
        debug!("Descriptor set torn down ({} descriptors released)", count);
    }

    /// Whether `fd` is tracked
    pub fn contains(&self, fd: RawFd) -> bool {
        self.descriptors.contains_key(&fd)
    }

    /// Registration for `fd`, if tracked
    pub fn get(&self, fd: RawFd) -> Option<&Descriptor> {
        self.descriptors.get(&fd)
    }

    /// Number of tracked descriptors
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// True when no descriptor is tracked
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Tracked fds in ascending order
    pub fn fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.descriptors.keys().copied().collect();
        fds.sort_unstable();
        fds
    }
}

impl fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("fds", &self.fds())
            .finish()
    }
}
