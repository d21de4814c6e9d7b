//! End-of-run accounting.

use std::time::{Duration, Instant};

use kestrel_protocol::Tag;
use tracing::info;

use crate::registry::RegistrySnapshot;

/// Per-run report: every non-superseded command lands in exactly one of the
/// status buckets, plus duplicate-response and abort-failure annotations and
/// throughput figures over the actual send/receive windows.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub successful: Vec<Tag>,
    pub failed: Vec<Tag>,
    pub timed_out: Vec<Tag>,
    /// Commands that never received any response and could not be (or were
    /// not) aborted.
    pub missing: Vec<Tag>,
    /// Tags that received more than one response. The first terminal status
    /// stands; the extras are only counted here.
    pub duplicates: Vec<Tag>,
    /// Hung commands the abort phase failed to clean up.
    pub abort_failed: Vec<Tag>,
    /// Commands replaced by a retransmitted clone; excluded from the buckets.
    pub superseded: usize,
    pub retransmitted_streams: usize,
    pub elapsed: Duration,
    pub cmds_sent: u64,
    pub rsps_resolved: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Commands per second over the first-to-last send window.
    pub cmd_rate: f64,
    /// Resolved responses per second over the first-to-last receive window.
    pub rsp_rate: f64,
    pub send_bytes_per_sec: f64,
    pub recv_bytes_per_sec: f64,
}

impl ExecutionSummary {
    /// Commands accounted for in the status buckets.
    pub fn total(&self) -> usize {
        self.successful.len()
            + self.failed.len()
            + self.timed_out.len()
            + self.missing.len()
            + self.abort_failed.len()
    }

    /// True when anything other than clean successes happened.
    pub fn run_failed(&self) -> bool {
        !(self.failed.is_empty()
            && self.timed_out.is_empty()
            && self.missing.is_empty()
            && self.duplicates.is_empty()
            && self.abort_failed.is_empty())
    }

    pub fn log(&self) {
        info!(
            total = self.total(),
            successful = self.successful.len(),
            failed = self.failed.len(),
            timed_out = self.timed_out.len(),
            missing = self.missing.len(),
            duplicates = self.duplicates.len(),
            abort_failed = self.abort_failed.len(),
            superseded = self.superseded,
            retransmitted_streams = self.retransmitted_streams,
            elapsed_ms = self.elapsed.as_millis() as u64,
            "execution summary"
        );
        info!(
            cmds_sent = self.cmds_sent,
            rsps_resolved = self.rsps_resolved,
            cmd_rate = format_args!("{:.1}/s", self.cmd_rate),
            rsp_rate = format_args!("{:.1}/s", self.rsp_rate),
            send = format_args!("{:.0} B/s", self.send_bytes_per_sec),
            recv = format_args!("{:.0} B/s", self.recv_bytes_per_sec),
            "throughput"
        );
        if !self.failed.is_empty() {
            info!(tags = ?self.failed, "failed commands");
        }
        if !self.timed_out.is_empty() {
            info!(tags = ?self.timed_out, "timed-out commands");
        }
        if !self.missing.is_empty() {
            info!(tags = ?self.missing, "commands with no response");
        }
        if !self.duplicates.is_empty() {
            info!(tags = ?self.duplicates, "duplicate responses");
        }
        if !self.abort_failed.is_empty() {
            info!(tags = ?self.abort_failed, "hung commands abort could not clean up");
        }
    }
}

fn rate(count: u64, window: Option<(Instant, Instant)>) -> f64 {
    match window {
        Some((first, last)) if last > first => count as f64 / (last - first).as_secs_f64(),
        _ => 0.0,
    }
}

pub(crate) fn build(
    snap: RegistrySnapshot,
    abort_failed: Vec<Tag>,
    retransmitted_streams: usize,
    elapsed: Duration,
) -> ExecutionSummary {
    // Abort-failed targets are a distinct bucket, not double-counted as
    // missing.
    let mut missing = snap.missing;
    missing.retain(|t| !abort_failed.contains(t));
    ExecutionSummary {
        successful: snap.successful,
        failed: snap.failed,
        timed_out: snap.timed_out,
        missing,
        duplicates: snap.duplicates,
        abort_failed,
        superseded: snap.superseded,
        retransmitted_streams,
        elapsed,
        cmds_sent: snap.cmds_sent,
        rsps_resolved: snap.rsps_resolved,
        bytes_sent: snap.bytes_sent,
        bytes_received: snap.bytes_received,
        cmd_rate: rate(snap.cmds_sent, snap.cmd_window),
        rsp_rate: rate(snap.rsps_resolved, snap.rsp_window),
        send_bytes_per_sec: rate(snap.bytes_sent, snap.cmd_window),
        recv_bytes_per_sec: rate(snap.bytes_received, snap.rsp_window),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_snapshot() -> RegistrySnapshot {
        RegistrySnapshot {
            successful: Vec::new(),
            failed: Vec::new(),
            timed_out: Vec::new(),
            missing: Vec::new(),
            duplicates: Vec::new(),
            superseded: 0,
            cmd_window: None,
            rsp_window: None,
            bytes_sent: 0,
            bytes_received: 0,
            cmds_sent: 0,
            rsps_resolved: 0,
        }
    }

    #[test]
    fn abort_failures_move_out_of_missing() {
        let mut snap = empty_snapshot();
        snap.successful = vec![1, 2];
        snap.missing = vec![3, 4];
        let s = build(snap, vec![4], 0, Duration::from_secs(1));
        assert_eq!(s.missing, vec![3]);
        assert_eq!(s.abort_failed, vec![4]);
        assert_eq!(s.total(), 5);
        assert!(s.run_failed());
    }

    #[test]
    fn all_successful_run_passes() {
        let mut snap = empty_snapshot();
        snap.successful = vec![1, 2, 3];
        let s = build(snap, Vec::new(), 0, Duration::from_millis(5));
        assert!(!s.run_failed());
        assert_eq!(s.total(), 3);
    }

    #[test]
    fn duplicate_responses_fail_the_run() {
        let mut snap = empty_snapshot();
        snap.successful = vec![1];
        snap.duplicates = vec![1];
        let s = build(snap, Vec::new(), 0, Duration::from_millis(5));
        assert!(s.run_failed());
    }

    #[test]
    fn rates_guard_against_degenerate_windows() {
        let now = Instant::now();
        assert_eq!(rate(10, None), 0.0);
        assert_eq!(rate(10, Some((now, now))), 0.0);
        let later = now + Duration::from_secs(2);
        assert!((rate(10, Some((now, later))) - 5.0).abs() < 1e-9);
    }
}
