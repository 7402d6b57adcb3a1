//! Common utilities for usb-loop-bridge
//!
//! This crate provides the pieces shared by the bridge library and the monitor
//! binary: the error taxonomy and the tracing subscriber setup.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
