//! USB loop worker thread
//!
//! Owns the libusb context, the main loop, the event source and the transfer
//! bridge, all of which are single-threaded. Job completions are forwarded to
//! the Tokio runtime over an async channel; the runtime stops the loop with a
//! [`QuitHandle`].

use crate::config::JobConfig;
use anyhow::{Context, anyhow};
use async_channel::Sender;
use bridge::libusb::LibusbSubsystem;
use bridge::{
    DeviceSubsystem, MainLoop, QuitHandle, TransferBridge, TransferHandle, TransferStatus,
    UsbSource,
};
use std::cell::Cell;
use std::rc::Rc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Bytes of each completion kept for display
const PREVIEW_LEN: usize = 16;

/// Outcome of one submission of a job
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: String,
    pub round: u32,
    pub status: TransferStatus,
    pub actual_length: usize,
    pub preview: Vec<u8>,
}

/// Events sent from the loop thread to the runtime
#[derive(Debug, Clone)]
pub enum LoopEvent {
    Completed(JobReport),
    /// The job will not be submitted again
    JobFinished { job: String, rounds: u32 },
    /// The loop returned; no more events follow
    Stopped,
}

/// What the worker thread should run
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub device: Option<(u16, u16)>,
    pub jobs: Vec<JobConfig>,
}

/// Handle to a running loop thread
pub struct LoopWorker {
    quit: QuitHandle,
    thread: JoinHandle<()>,
}

impl LoopWorker {
    /// Start the `usb-loop` thread and wait until its loop is set up
    pub async fn spawn(config: WorkerConfig, events: Sender<LoopEvent>) -> anyhow::Result<Self> {
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("usb-loop".to_string())
            .spawn(move || run_worker(config, events, ready_tx))?;

        match ready_rx.await {
            Ok(Ok(quit)) => Ok(Self { quit, thread }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(anyhow!("USB loop failed to start: {}", e))
            }
            Err(_) => {
                let _ = thread.join();
                Err(anyhow!("USB loop thread exited during startup"))
            }
        }
    }

    /// Stop the loop and wait for the thread
    pub fn shutdown(self) {
        self.quit.quit();
        if let Err(e) = self.thread.join() {
            error!("USB loop thread panicked: {:?}", e);
        }
    }
}

fn run_worker(
    config: WorkerConfig,
    events: Sender<LoopEvent>,
    ready: oneshot::Sender<Result<QuitHandle, String>>,
) {
    let mut main_loop = match setup(&config, &events) {
        Ok(main_loop) => main_loop,
        Err(e) => {
            let _ = ready.send(Err(format!("{:#}", e)));
            return;
        }
    };

    if ready.send(Ok(main_loop.quit_handle())).is_err() {
        warn!("Runtime went away before the USB loop started");
        return;
    }

    info!("USB loop thread started");

    // Keep panics in continuations from taking the thread down silently
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| main_loop.run()));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB loop failed: {}", e),
        Err(e) => error!("Panic in USB loop: {:?}", e),
    }

    drop(main_loop);
    let _ = events.send_blocking(LoopEvent::Stopped);
    info!("USB loop thread stopped");
}

/// Build the loop, attach the source and submit every job
fn setup(config: &WorkerConfig, events: &Sender<LoopEvent>) -> anyhow::Result<MainLoop> {
    let subsystem = Rc::new(LibusbSubsystem::new().context("Failed to initialize libusb")?);
    let mut main_loop = MainLoop::new().context("Failed to create main loop")?;

    UsbSource::attach(subsystem.clone(), &mut main_loop);
    debug!(
        "USB source attached ({} descriptors polled)",
        main_loop.poll_table().len()
    );

    if config.jobs.is_empty() {
        info!("No jobs configured; servicing USB events only");
        return Ok(main_loop);
    }

    let Some((vendor_id, product_id)) = config.device else {
        warn!(
            "No device configured; {} jobs will not run",
            config.jobs.len()
        );
        return Ok(main_loop);
    };

    let device = subsystem
        .open_device(vendor_id, product_id)
        .ok_or_else(|| anyhow!("Device {:04x}:{:04x} not found", vendor_id, product_id))?;
    info!("Opened device {:04x}:{:04x}", vendor_id, product_id);

    JobRunner::start(
        TransferBridge::for_loop(subsystem, &main_loop),
        device,
        events.clone(),
        main_loop.quit_handle(),
        &config.jobs,
    );

    Ok(main_loop)
}

/// Shared state of the job continuations
///
/// Each continuation holds the runner; it lives as long as some job still has
/// a transfer in flight.
struct JobRunner<S: DeviceSubsystem> {
    bridge: TransferBridge<S>,
    device: S::Device,
    events: Sender<LoopEvent>,
    quit: QuitHandle,
    /// Jobs that will still report `JobFinished`
    remaining: Cell<usize>,
}

impl<S: DeviceSubsystem + 'static> JobRunner<S> {
    /// Submit round 1 of every job; `quit` fires once all of them finish
    fn start(
        bridge: TransferBridge<S>,
        device: S::Device,
        events: Sender<LoopEvent>,
        quit: QuitHandle,
        jobs: &[JobConfig],
    ) {
        let runner = Rc::new(JobRunner {
            bridge,
            device,
            events,
            quit,
            remaining: Cell::new(jobs.len()),
        });

        for job in jobs {
            runner.submit(Rc::new(job.clone()), 1);
        }
    }

    fn submit(self: &Rc<Self>, job: Rc<JobConfig>, round: u32) {
        let runner = self.clone();
        let shape = job.shape();
        debug!("Submitting job '{}' round {} ({})", job.name, round, shape);

        self.bridge.submit(
            &self.device,
            shape,
            job.timeout(),
            job.buffer(),
            move |handle| runner.on_complete(job, round, handle),
        );
    }

    fn on_complete(self: &Rc<Self>, job: Rc<JobConfig>, round: u32, handle: TransferHandle) {
        let result = match handle.finish() {
            Ok(result) => result,
            Err(e) => {
                error!("Job '{}' round {}: {}", job.name, round, e);
                self.job_finished(&job, round);
                return;
            }
        };

        let data = result.data();
        let report = JobReport {
            job: job.name.clone(),
            round,
            status: result.status,
            actual_length: result.actual_length,
            preview: data[..data.len().min(PREVIEW_LEN)].to_vec(),
        };
        if self.events.send_blocking(LoopEvent::Completed(report)).is_err() {
            warn!("Runtime stopped listening; quitting USB loop");
            self.quit.quit();
            return;
        }

        let fatal = matches!(
            result.status,
            TransferStatus::NoDevice | TransferStatus::SubmitRejected
        );
        if fatal {
            warn!(
                "Job '{}' stopped after round {}: {}",
                job.name, round, result.status
            );
        }

        if round < job.repeat && !fatal {
            self.submit(job, round + 1);
        } else {
            self.job_finished(&job, round);
        }
    }

    fn job_finished(&self, job: &JobConfig, rounds: u32) {
        let _ = self.events.send_blocking(LoopEvent::JobFinished {
            job: job.name.clone(),
            rounds,
        });

        let remaining = self.remaining.get().saturating_sub(1);
        self.remaining.set(remaining);
        if remaining == 0 {
            info!("All jobs finished");
            self.quit.quit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobKind;
    use async_channel::Receiver;
    use bridge::NextTimeout;
    use bridge::test_utils::{MockDevice, MockSubsystem, SubmitBehavior};

    fn interrupt_job(name: &str, repeat: u32) -> JobConfig {
        JobConfig {
            name: name.to_string(),
            kind: JobKind::Interrupt,
            endpoint: Some(0x81),
            length: 8,
            data: Vec::new(),
            timeout_ms: 100,
            repeat,
            request_type: 0,
            request: 0,
            value: 0,
            index: 0,
        }
    }

    struct Harness {
        main_loop: MainLoop,
        subsystem: Rc<MockSubsystem>,
        events: Receiver<LoopEvent>,
    }

    fn start_jobs(jobs: &[JobConfig], behavior: SubmitBehavior) -> Harness {
        let subsystem = Rc::new(MockSubsystem::new());
        subsystem.set_submit_behavior(behavior);
        subsystem.set_next_timeout(NextTimeout::Immediate);

        let mut main_loop = MainLoop::new().unwrap();
        UsbSource::attach(subsystem.clone(), &mut main_loop);

        let (tx, rx) = async_channel::unbounded();
        JobRunner::start(
            TransferBridge::for_loop(subsystem.clone(), &main_loop),
            MockDevice::new(1),
            tx,
            main_loop.quit_handle(),
            jobs,
        );

        Harness {
            main_loop,
            subsystem,
            events: rx,
        }
    }

    fn drain(events: &Receiver<LoopEvent>) -> Vec<LoopEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_job_repeats_then_finishes() {
        let mut h = start_jobs(&[interrupt_job("hid", 3)], SubmitBehavior::Accept);

        for _ in 0..3 {
            assert_eq!(h.subsystem.pending_transfers(), 1);
            h.subsystem
                .complete_next(TransferStatus::Completed, &[0xaa, 0xbb]);
            h.main_loop.iteration(false).unwrap();
        }

        let events = drain(&h.events);
        assert_eq!(events.len(), 4);
        for (i, event) in events[..3].iter().enumerate() {
            match event {
                LoopEvent::Completed(report) => {
                    assert_eq!(report.job, "hid");
                    assert_eq!(report.round, i as u32 + 1);
                    assert_eq!(report.status, TransferStatus::Completed);
                    assert_eq!(report.preview, vec![0xaa, 0xbb]);
                }
                other => panic!("expected a completion, got {:?}", other),
            }
        }
        assert!(matches!(
            &events[3],
            LoopEvent::JobFinished { job, rounds: 3 } if job == "hid"
        ));
        assert_eq!(h.subsystem.submitted().len(), 3);
        assert_eq!(h.subsystem.pending_transfers(), 0);
    }

    #[test]
    fn test_rejected_submit_stops_job() {
        let mut h = start_jobs(
            &[interrupt_job("hid", 5)],
            SubmitBehavior::Reject(rusb::Error::NoDevice),
        );

        h.main_loop.iteration(false).unwrap();
        h.main_loop.iteration(false).unwrap();

        let events = drain(&h.events);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            LoopEvent::Completed(report)
                if report.round == 1 && report.status == TransferStatus::SubmitRejected
        ));
        assert!(matches!(
            &events[1],
            LoopEvent::JobFinished { rounds: 1, .. }
        ));
        assert_eq!(h.subsystem.submitted().len(), 1);
    }

    #[test]
    fn test_no_device_status_stops_job() {
        let mut h = start_jobs(&[interrupt_job("hid", 5)], SubmitBehavior::Accept);

        h.subsystem.complete_next(TransferStatus::NoDevice, &[]);
        h.main_loop.iteration(false).unwrap();

        let events = drain(&h.events);
        assert!(matches!(
            events.last(),
            Some(LoopEvent::JobFinished { rounds: 1, .. })
        ));
        assert_eq!(h.subsystem.pending_transfers(), 0);
    }

    #[test]
    fn test_last_finished_job_quits_loop() {
        let jobs = [interrupt_job("first", 1), interrupt_job("second", 1)];
        let mut h = start_jobs(&jobs, SubmitBehavior::Accept);
        let quit = h.main_loop.quit_handle();

        h.subsystem.complete_next(TransferStatus::Completed, &[1]);
        h.main_loop.iteration(false).unwrap();
        assert!(!quit.is_quit());

        h.subsystem.complete_next(TransferStatus::TimedOut, &[]);
        h.main_loop.iteration(false).unwrap();
        assert!(quit.is_quit());

        let finished: Vec<String> = drain(&h.events)
            .into_iter()
            .filter_map(|event| match event {
                LoopEvent::JobFinished { job, .. } => Some(job),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec!["first".to_string(), "second".to_string()]);
    }
}
