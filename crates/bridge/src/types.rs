//! Types shared across the adapter, the transfer bridge and the backends
//!
//! Readiness masks, the subsystem's three-way timeout answer, and the
//! shape/status vocabulary of one-shot transfers.

use std::fmt;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness mask: which of readable/writable a descriptor cares about, or
/// which of them the last poll observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Interest {
    /// `POLLIN`
    pub readable: bool,
    /// `POLLOUT`
    pub writable: bool,
}

impl Interest {
    /// Neither direction
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };
    /// `POLLIN`
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    /// `POLLOUT`
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    /// `POLLIN | POLLOUT`
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    /// True when neither direction is set
    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }

    /// Build from a `poll(2)` event mask (`POLLIN` / `POLLOUT`)
    ///
    /// Other bits are ignored.
    pub fn from_poll_events(events: libc::c_short) -> Self {
        Interest {
            readable: events & libc::POLLIN != 0,
            writable: events & libc::POLLOUT != 0,
        }
    }

    /// Convert back to a `poll(2)` event mask
    pub fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.readable {
            events |= libc::POLLIN;
        }
        if self.writable {
            events |= libc::POLLOUT;
        }
        events
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest {
            readable: self.readable || rhs.readable,
            writable: self.writable || rhs.writable,
        }
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.readable, self.writable) {
            (true, true) => write!(f, "rw"),
            (true, false) => write!(f, "r"),
            (false, true) => write!(f, "w"),
            (false, false) => write!(f, "-"),
        }
    }
}

/// A descriptor the subsystem wants watched, as reported by enumeration or by
/// an "added" notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollfdSpec {
    pub fd: RawFd,
    pub interest: Interest,
}

/// Answer of the subsystem's "next timeout" query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextTimeout {
    /// No timed work is pending; the loop may sleep until a descriptor fires.
    None,
    /// Timed work is already due.
    Immediate,
    /// Timed work becomes due after this (strictly positive) duration.
    After(Duration),
}

impl NextTimeout {
    /// Classify a raw duration: zero means due now
    pub fn from_duration(duration: Duration) -> Self {
        if duration.is_zero() {
            NextTimeout::Immediate
        } else {
            NextTimeout::After(duration)
        }
    }

    /// Whether the subsystem has timeout work to do right now
    pub fn is_due(self) -> bool {
        matches!(self, NextTimeout::Immediate)
    }
}

/// Round a duration up to whole milliseconds
///
/// A positive sub-millisecond remainder never collapses to a zero wait.
pub fn round_up_to_millis(duration: Duration) -> Duration {
    let millis = duration.as_millis();
    let exact = Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX));
    if exact < duration {
        exact.saturating_add(Duration::from_millis(1))
    } else {
        exact
    }
}

/// Size of the setup packet that prefixes a control transfer buffer
pub const CONTROL_SETUP_SIZE: usize = 8;

/// Which kind of transfer, with the fields only that kind carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferShape {
    /// Control transfer on the default pipe; the setup packet sits in the
    /// first 8 bytes of the buffer.
    Control,
    Interrupt { endpoint: u8 },
    Bulk { endpoint: u8 },
}

impl TransferShape {
    /// Endpoint address, or `None` for control transfers (default pipe)
    pub fn endpoint(self) -> Option<u8> {
        match self {
            TransferShape::Control => None,
            TransferShape::Interrupt { endpoint } | TransferShape::Bulk { endpoint } => {
                Some(endpoint)
            }
        }
    }

    /// Lower-case kind name used in logs
    pub fn name(self) -> &'static str {
        match self {
            TransferShape::Control => "control",
            TransferShape::Interrupt { .. } => "interrupt",
            TransferShape::Bulk { .. } => "bulk",
        }
    }
}

impl fmt::Display for TransferShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint() {
            Some(endpoint) => write!(f, "{} ep {:#04x}", self.name(), endpoint),
            None => write!(f, "{}", self.name()),
        }
    }
}

/// Terminal status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
    /// The subsystem refused the transfer at submission time.
    SubmitRejected,
}

impl TransferStatus {
    /// Only [`TransferStatus::Completed`] counts as success; a short
    /// transfer is still a success.
    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Completed => "completed",
            TransferStatus::Error => "error",
            TransferStatus::TimedOut => "timed out",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Stall => "stall",
            TransferStatus::NoDevice => "no device",
            TransferStatus::Overflow => "overflow",
            TransferStatus::SubmitRejected => "submit rejected",
        };
        f.write_str(s)
    }
}

/// One transfer as handed to the subsystem
///
/// The buffer length is the transfer length. For control transfers the buffer
/// starts with the 8-byte setup packet.
#[derive(Debug)]
pub struct TransferRequest {
    pub shape: TransferShape,
    pub buffer: Vec<u8>,
    pub timeout: Duration,
}
