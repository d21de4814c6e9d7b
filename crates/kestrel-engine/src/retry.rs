//! Stream retransmission.
//!
//! When a command fails or times out and its stream has retry budget left,
//! the unresolved tail of the stream (the first non-successful command
//! onward, the trigger included) is cloned under fresh tags into a successor
//! stream and queued for submission. The original commands are superseded:
//! they leave the accounting, and late responses for them no longer count.
//! A stream is retransmitted at most once; the successor inherits the
//! remaining budget, so a budget of N bounds the chain to N retransmissions.

use std::sync::{Arc, Mutex};

use kestrel_protocol::{Command, Tag};
use tracing::{debug, info};

use crate::engine::EngineShared;
use crate::registry::CmdStatus;
use crate::stream::Stream;

pub(crate) fn maybe_retransmit(shared: &EngineShared, failed_tag: Tag) {
    let Some(stream_id) = shared.registry.stream_of(failed_tag) else {
        return;
    };
    let stream_arc = shared.stream(stream_id);
    let (device_idx, queue_idx, budget, old_tags, successor) = {
        let mut s = stream_arc.lock().unwrap();
        if s.retransmitted {
            return;
        }
        if s.retry_budget == 0 {
            debug!(
                tag = failed_tag,
                stream = stream_id,
                "retry budget exhausted, failure is final"
            );
            return;
        }
        let resolved_ok = |cmd: &Command| {
            matches!(
                shared.registry.status(cmd.tag()),
                Some(CmdStatus::Successful)
            )
        };
        let Some(start) = s.commands.iter().position(|c| !resolved_ok(c)) else {
            return;
        };
        // Interleaved successes after the failure point stay resolved; only
        // the non-successful commands are cloned.
        let mut old_tags = Vec::new();
        let mut successor = Vec::new();
        for cmd in s.commands[start..].iter().filter(|c| !resolved_ok(c)) {
            old_tags.push(cmd.tag());
            successor.push(cmd.clone_with_tag(shared.registry.allocate_tag()));
        }
        s.retransmitted = true;
        let budget = s.retry_budget - 1;
        s.retry_budget = 0;
        (s.device_idx, s.queue_idx, budget, old_tags, successor)
    };
    if successor.is_empty() {
        return;
    }

    let state = &shared.devices[device_idx];
    // Settle the response debt of originals that were still awaiting; their
    // clones carry the expectation from here on.
    for &old in &old_tags {
        if shared.registry.supersede(old) == Some(CmdStatus::AwaitingResponse) {
            state.dec_expected();
        }
    }

    let new_id = {
        let mut streams = shared.streams.lock().unwrap();
        let id = streams.len();
        streams.push(Arc::new(Mutex::new(Stream::new(
            device_idx,
            queue_idx,
            successor.clone(),
            budget,
        ))));
        id
    };
    for cmd in &successor {
        if let Err(err) = shared.registry.register(
            cmd.tag(),
            cmd.opcode(),
            cmd.expected_result(),
            device_idx,
            new_id,
            cmd.cancelable(),
        ) {
            shared.record_run_error(err);
            return;
        }
    }
    state.add_expected(successor.len() as i64);
    shared.enqueue_work(new_id, device_idx, queue_idx);
    state.notify();
    info!(
        trigger = failed_tag,
        stream = stream_id,
        successor = new_id,
        commands = successor.len(),
        budget_left = budget,
        "retransmitting unresolved stream tail"
    );
}
