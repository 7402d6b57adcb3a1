//! USB event loop bridge
//!
//! Drives an asynchronous USB subsystem from a single-threaded poll-based main
//! loop, and exposes one-shot control, interrupt and bulk transfers as
//! submit / continuation / finish operations.
//!
//! - [`UsbSource`] mirrors the subsystem's descriptors into the loop's poll
//!   table and services them when they become ready or a timeout falls due.
//! - [`TransferBridge`] submits transfers and runs each continuation from the
//!   loop's idle queue once the transfer has a terminal result.
//! - [`DeviceSubsystem`] is the seam between the two and a concrete subsystem;
//!   [`libusb::LibusbSubsystem`] is the libusb one.
//!
//! Everything here lives on one thread. Only [`QuitHandle`] crosses threads.

pub mod descriptor_set;
pub mod libusb;
pub mod main_loop;
pub mod source;
pub mod subsystem;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transfer;
pub mod types;

pub use descriptor_set::{Descriptor, DescriptorSet, PollRegistry};
pub use main_loop::{
    EventSource, IdleQueue, MainLoop, PollTable, PostAction, QuitHandle, Scheduler, SourceId,
};
pub use source::UsbSource;
pub use subsystem::{CompletionCallback, DeviceSubsystem, PollfdNotifiers, Rejected, TerminalTransfer};
pub use transfer::{Continuation, TransferBridge, TransferHandle, TransferResult};
pub use types::{Interest, NextTimeout, TransferShape, TransferStatus};
