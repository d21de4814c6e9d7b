//! Tag allocation and per-command lifecycle tracking.
//!
//! Every command submitted during a run is registered here under its tag. The
//! registry is the single place where responses are correlated, statuses
//! resolved, and run-wide timing and byte counters accumulated. It is owned by
//! the engine and shared by reference with the dispatcher and listener
//! threads; there is no global state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use kestrel_protocol::{classify, Opcode, RspHeader, Tag, Verdict, WireError};

use crate::error::EngineError;

/// Lifecycle status of one registered command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    /// Registered, no terminal response recorded yet. Covers both unsent and
    /// in-flight commands.
    AwaitingResponse,
    Successful,
    Failed,
    TimedOut,
}

impl CmdStatus {
    pub fn is_terminal(self) -> bool {
        self != CmdStatus::AwaitingResponse
    }
}

#[derive(Debug)]
struct Entry {
    opcode: Opcode,
    expected: u32,
    device_idx: usize,
    stream_id: usize,
    cancelable: bool,
    status: CmdStatus,
    /// A retransmission has replaced this command with a fresh-tag clone.
    /// Superseded entries keep accepting late responses (so the listener can
    /// tell them apart from unknown tags) but are excluded from accounting.
    superseded: bool,
    /// The command actually hit the wire. Unsent commands never become abort
    /// targets.
    sent: bool,
}

/// What the registry made of one popped response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// First response for a registered tag; its status is now terminal.
    Resolved {
        tag: Tag,
        status: CmdStatus,
        superseded: bool,
    },
    /// The tag already had a terminal status. The recorded status is never
    /// overwritten; the duplicate is counted and reported in the summary.
    Duplicate { tag: Tag },
    /// No command with this tag was ever registered this run.
    Unknown { tag: Tag },
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Tag, Entry>,
    duplicate_rsps: Vec<Tag>,
    unknown_rsps: Vec<Tag>,
    first_cmd: Option<Instant>,
    last_cmd: Option<Instant>,
    first_rsp: Option<Instant>,
    last_rsp: Option<Instant>,
    bytes_sent: u64,
    bytes_received: u64,
    cmds_sent: u64,
    rsps_resolved: u64,
}

/// Accounting snapshot used to build the execution summary.
pub(crate) struct RegistrySnapshot {
    pub successful: Vec<Tag>,
    pub failed: Vec<Tag>,
    pub timed_out: Vec<Tag>,
    pub missing: Vec<Tag>,
    pub duplicates: Vec<Tag>,
    pub superseded: usize,
    pub cmd_window: Option<(Instant, Instant)>,
    pub rsp_window: Option<(Instant, Instant)>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub cmds_sent: u64,
    pub rsps_resolved: u64,
}

pub struct TagRegistry {
    next_tag: AtomicU32,
    inner: Mutex<Inner>,
}

impl TagRegistry {
    pub fn new() -> TagRegistry {
        TagRegistry {
            // Tag 0 is never issued so a zeroed response header can never
            // correlate by accident.
            next_tag: AtomicU32::new(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Allocates a run-unique tag.
    pub fn allocate_tag(&self) -> Tag {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(
        &self,
        tag: Tag,
        opcode: Opcode,
        expected: u32,
        device_idx: usize,
        stream_id: usize,
        cancelable: bool,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(&tag) {
            return Err(EngineError::DuplicateTag(tag));
        }
        inner.entries.insert(
            tag,
            Entry {
                opcode,
                expected,
                device_idx,
                stream_id,
                cancelable,
                status: CmdStatus::AwaitingResponse,
                superseded: false,
                sent: false,
            },
        );
        Ok(())
    }

    /// Accounts one command hitting the wire.
    pub(crate) fn note_sent(&self, tag: Tag, len: usize) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&tag) {
            entry.sent = true;
        }
        if inner.first_cmd.is_none() {
            inner.first_cmd = Some(now);
        }
        inner.last_cmd = Some(now);
        inner.bytes_sent += len as u64;
        inner.cmds_sent += 1;
    }

    /// Correlates one raw response with its command and resolves the status.
    pub fn record_response(&self, bytes: &[u8]) -> Result<ResponseOutcome, WireError> {
        let hdr = RspHeader::parse(bytes)?;
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.bytes_received += bytes.len() as u64;
        let Some(entry) = inner.entries.get_mut(&hdr.tag_id) else {
            inner.unknown_rsps.push(hdr.tag_id);
            return Ok(ResponseOutcome::Unknown { tag: hdr.tag_id });
        };
        if entry.status.is_terminal() {
            inner.duplicate_rsps.push(hdr.tag_id);
            return Ok(ResponseOutcome::Duplicate { tag: hdr.tag_id });
        }
        entry.status = match classify(entry.opcode, entry.expected, hdr.result_code) {
            Verdict::Success => CmdStatus::Successful,
            Verdict::Failed => CmdStatus::Failed,
            Verdict::TimedOut => CmdStatus::TimedOut,
        };
        let outcome = ResponseOutcome::Resolved {
            tag: hdr.tag_id,
            status: entry.status,
            superseded: entry.superseded,
        };
        if inner.first_rsp.is_none() {
            inner.first_rsp = Some(now);
        }
        inner.last_rsp = Some(now);
        inner.rsps_resolved += 1;
        Ok(outcome)
    }

    pub fn status(&self, tag: Tag) -> Option<CmdStatus> {
        self.inner.lock().unwrap().entries.get(&tag).map(|e| e.status)
    }

    pub(crate) fn is_superseded(&self, tag: Tag) -> bool {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&tag)
            .is_some_and(|e| e.superseded)
    }

    pub(crate) fn stream_of(&self, tag: Tag) -> Option<usize> {
        self.inner.lock().unwrap().entries.get(&tag).map(|e| e.stream_id)
    }

    /// Marks `tag` as replaced by a retransmitted clone. Returns the status it
    /// had at that point, or `None` if the tag is unknown.
    pub(crate) fn supersede(&self, tag: Tag) -> Option<CmdStatus> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(&tag)?;
        let prior = entry.status;
        entry.superseded = true;
        Some(prior)
    }

    /// Tags on `device_idx` that were sent, are still awaiting a response,
    /// are not superseded, and can be torn down with an abort command.
    pub(crate) fn awaiting_cancelable(&self, device_idx: usize) -> Vec<Tag> {
        let inner = self.inner.lock().unwrap();
        let mut tags: Vec<Tag> = inner
            .entries
            .iter()
            .filter(|(_, e)| {
                e.device_idx == device_idx
                    && e.cancelable
                    && e.sent
                    && !e.superseded
                    && e.status == CmdStatus::AwaitingResponse
            })
            .map(|(&t, _)| t)
            .collect();
        tags.sort_unstable();
        tags
    }

    /// Drops one tag from the registry entirely, as if it had never been
    /// issued. Used for commands that were built but never handed to a run.
    pub fn erase(&self, tag: Tag) {
        self.inner.lock().unwrap().entries.remove(&tag);
    }

    pub(crate) fn clear(&self) {
        *self.inner.lock().unwrap() = Inner::default();
    }

    pub(crate) fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock().unwrap();
        let mut snap = RegistrySnapshot {
            successful: Vec::new(),
            failed: Vec::new(),
            timed_out: Vec::new(),
            missing: Vec::new(),
            duplicates: inner.duplicate_rsps.clone(),
            superseded: 0,
            cmd_window: inner.first_cmd.zip(inner.last_cmd),
            rsp_window: inner.first_rsp.zip(inner.last_rsp),
            bytes_sent: inner.bytes_sent,
            bytes_received: inner.bytes_received,
            cmds_sent: inner.cmds_sent,
            rsps_resolved: inner.rsps_resolved,
        };
        for (&tag, entry) in &inner.entries {
            if entry.superseded {
                snap.superseded += 1;
                continue;
            }
            match entry.status {
                CmdStatus::Successful => snap.successful.push(tag),
                CmdStatus::Failed => snap.failed.push(tag),
                CmdStatus::TimedOut => snap.timed_out.push(tag),
                CmdStatus::AwaitingResponse => snap.missing.push(tag),
            }
        }
        snap.successful.sort_unstable();
        snap.failed.sort_unstable();
        snap.timed_out.sort_unstable();
        snap.missing.sort_unstable();
        snap
    }
}

impl Default for TagRegistry {
    fn default() -> TagRegistry {
        TagRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_protocol::{encode_response, result};

    fn registry_with(tag: Tag, opcode: Opcode, expected: u32) -> TagRegistry {
        let reg = TagRegistry::new();
        reg.register(tag, opcode, expected, 0, 0, opcode == Opcode::KernelLaunch)
            .unwrap();
        reg
    }

    #[test]
    fn tags_are_unique_and_never_zero() {
        let reg = TagRegistry::new();
        let a = reg.allocate_tag();
        let b = reg.allocate_tag();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn response_resolves_status_by_expected_code() {
        let reg = registry_with(5, Opcode::KernelLaunch, result::KERNEL_HOST_ABORTED);
        let out = reg
            .record_response(&encode_response(5, result::KERNEL_HOST_ABORTED, &[]))
            .unwrap();
        assert_eq!(
            out,
            ResponseOutcome::Resolved {
                tag: 5,
                status: CmdStatus::Successful,
                superseded: false,
            }
        );
        assert_eq!(reg.status(5), Some(CmdStatus::Successful));
    }

    #[test]
    fn duplicate_response_never_overwrites_terminal_status() {
        let reg = registry_with(7, Opcode::Echo, result::SUCCESS);
        reg.record_response(&encode_response(7, result::SUCCESS, &[]))
            .unwrap();
        // A later failure response for the same tag must not flip the status.
        let out = reg.record_response(&encode_response(7, 9, &[])).unwrap();
        assert_eq!(out, ResponseOutcome::Duplicate { tag: 7 });
        assert_eq!(reg.status(7), Some(CmdStatus::Successful));
        let snap = reg.snapshot();
        assert_eq!(snap.duplicates, vec![7]);
        assert_eq!(snap.successful, vec![7]);
    }

    #[test]
    fn unknown_tag_is_counted_not_registered() {
        let reg = registry_with(1, Opcode::Echo, result::SUCCESS);
        let out = reg.record_response(&encode_response(99, 0, &[])).unwrap();
        assert_eq!(out, ResponseOutcome::Unknown { tag: 99 });
        assert_eq!(reg.status(99), None);
    }

    #[test]
    fn superseded_entries_leave_the_accounting() {
        let reg = registry_with(3, Opcode::DataWrite, result::SUCCESS);
        assert_eq!(reg.supersede(3), Some(CmdStatus::AwaitingResponse));
        assert!(reg.is_superseded(3));
        let snap = reg.snapshot();
        assert!(snap.missing.is_empty());
        assert_eq!(snap.superseded, 1);
        // A late response still resolves, flagged as superseded.
        let out = reg.record_response(&encode_response(3, 0, &[])).unwrap();
        assert_eq!(
            out,
            ResponseOutcome::Resolved {
                tag: 3,
                status: CmdStatus::Successful,
                superseded: true,
            }
        );
    }

    #[test]
    fn awaiting_cancelable_filters_by_device_and_kind() {
        let reg = TagRegistry::new();
        reg.register(1, Opcode::KernelLaunch, 0, 0, 0, true).unwrap();
        reg.register(2, Opcode::Echo, 0, 0, 0, false).unwrap();
        reg.register(3, Opcode::KernelLaunch, 0, 1, 0, true).unwrap();
        reg.register(4, Opcode::KernelLaunch, 0, 0, 0, true).unwrap();
        reg.register(5, Opcode::KernelLaunch, 0, 0, 0, true).unwrap();
        for tag in [1, 2, 3, 4] {
            reg.note_sent(tag, 16);
        }
        reg.record_response(&encode_response(4, 0, &[])).unwrap();
        // Tag 2 is not cancelable, 4 already resolved, 5 never hit the wire.
        assert_eq!(reg.awaiting_cancelable(0), vec![1]);
        assert_eq!(reg.awaiting_cancelable(1), vec![3]);
    }

    #[test]
    fn erased_tag_is_as_if_never_issued() {
        let reg = registry_with(8, Opcode::Echo, result::SUCCESS);
        reg.erase(8);
        assert_eq!(reg.status(8), None);
        // A response for it is now indistinguishable from a stray tag.
        let out = reg.record_response(&encode_response(8, 0, &[])).unwrap();
        assert_eq!(out, ResponseOutcome::Unknown { tag: 8 });
        // The tag is free again.
        reg.register(8, Opcode::Echo, 0, 0, 0, false).unwrap();
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let reg = registry_with(5, Opcode::Echo, 0);
        assert!(matches!(
            reg.register(5, Opcode::Echo, 0, 0, 0, false),
            Err(EngineError::DuplicateTag(5))
        ));
    }
}
