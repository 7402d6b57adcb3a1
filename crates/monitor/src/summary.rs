//! Per-job completion statistics printed when the monitor exits

use crate::worker::JobReport;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStats {
    pub completed: u64,
    pub failed: u64,
    pub bytes: u64,
    /// Set once the job will not be submitted again
    pub finished: bool,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    jobs: BTreeMap<String, JobStats>,
}

impl RunSummary {
    pub fn record(&mut self, report: &JobReport) {
        let stats = self.jobs.entry(report.job.clone()).or_default();
        if report.status.is_success() {
            stats.completed += 1;
            stats.bytes += report.actual_length as u64;
        } else {
            stats.failed += 1;
        }
    }

    pub fn mark_finished(&mut self, job: &str) {
        self.jobs.entry(job.to_string()).or_default().finished = true;
    }

    pub fn get(&self, job: &str) -> Option<&JobStats> {
        self.jobs.get(job)
    }

    pub fn total_transfers(&self) -> u64 {
        self.jobs.values().map(|s| s.completed + s.failed).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.jobs.is_empty() {
            return writeln!(f, "No transfers completed");
        }

        writeln!(
            f,
            "{:<24} {:>10} {:>8} {:>12}  state",
            "job", "completed", "failed", "bytes"
        )?;
        for (name, stats) in &self.jobs {
            writeln!(
                f,
                "{:<24} {:>10} {:>8} {:>12}  {}",
                name,
                stats.completed,
                stats.failed,
                stats.bytes,
                if stats.finished { "done" } else { "running" }
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge::TransferStatus;

    fn report(job: &str, status: TransferStatus, actual_length: usize) -> JobReport {
        JobReport {
            job: job.to_string(),
            round: 1,
            status,
            actual_length,
            preview: Vec::new(),
        }
    }

    #[test]
    fn test_record_counts_success_and_failure() {
        let mut summary = RunSummary::default();
        summary.record(&report("a", TransferStatus::Completed, 18));
        summary.record(&report("a", TransferStatus::Completed, 18));
        summary.record(&report("a", TransferStatus::TimedOut, 0));
        summary.record(&report("b", TransferStatus::SubmitRejected, 0));

        let a = summary.get("a").unwrap();
        assert_eq!((a.completed, a.failed, a.bytes), (2, 1, 36));
        assert_eq!(summary.get("b").unwrap().failed, 1);
        assert_eq!(summary.total_transfers(), 4);
    }

    #[test]
    fn test_display_marks_finished_jobs() {
        let mut summary = RunSummary::default();
        summary.record(&report("descriptor", TransferStatus::Completed, 18));
        summary.mark_finished("descriptor");

        let text = summary.to_string();
        assert!(text.contains("descriptor"));
        assert!(text.contains("done"));
    }
}
