//! usb-loop-monitor library
//!
//! Configuration, the USB loop worker thread and the run summary used by the
//! `usb-loop-monitor` binary.

pub mod config;
pub mod summary;
pub mod worker;

pub use config::MonitorConfig;
pub use summary::RunSummary;
pub use worker::{JobReport, LoopEvent, LoopWorker, WorkerConfig};
