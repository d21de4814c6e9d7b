//! End-of-run abort phase.
//!
//! After the main phase drains (or its deadline elapses), any sent, still
//! unresolved, cancelable command is presumed hung. One abort command per
//! target is issued on queue 0 of the owning device and the normal
//! dispatcher/listener machinery runs again under the (shorter) abort
//! deadline. The abort either flushes a terminal response for the target or
//! the target is reported as un-cleanable.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use kestrel_protocol::{result, CmdFlags, Command, CommandBody, Tag};
use tracing::{info, warn};

use crate::engine::{run_phase, EngineShared};
use crate::registry::CmdStatus;
use crate::stream::Stream;

/// Runs the abort phase. Returns the target tags that were still unresolved
/// when the abort window closed.
pub(crate) fn run_abort_phase(shared: &EngineShared) -> Vec<Tag> {
    let per_device: Vec<(usize, Vec<Tag>)> = (0..shared.devices.len())
        .map(|d| (d, shared.registry.awaiting_cancelable(d)))
        .collect();
    let total: usize = per_device.iter().map(|(_, t)| t.len()).sum();
    if total == 0 {
        return Vec::new();
    }
    info!(count = total, "aborting commands left without a response");

    shared.aborting.store(true, Ordering::SeqCst);
    // Main-phase leftovers (unsent work, stale response debt) are abandoned;
    // the abort phase gets a clean slate.
    shared.clear_work();
    for state in &shared.devices {
        state.reset_phase();
        state.set_expected(0);
    }

    let mut tracked: Vec<Tag> = Vec::new();
    for (device_idx, targets) in &per_device {
        if targets.is_empty() {
            continue;
        }
        let cmds: Vec<Command> = targets
            .iter()
            .map(|&target_tag| {
                Command::new(
                    shared.registry.allocate_tag(),
                    CmdFlags::default().with_route(0),
                    result::SUCCESS,
                    CommandBody::KernelAbort { target_tag },
                )
            })
            .collect();
        let new_id = {
            let mut streams = shared.streams.lock().unwrap();
            let id = streams.len();
            streams.push(Arc::new(Mutex::new(Stream::new(
                *device_idx,
                0,
                cmds.clone(),
                0,
            ))));
            id
        };
        for cmd in &cmds {
            if let Err(err) = shared.registry.register(
                cmd.tag(),
                cmd.opcode(),
                cmd.expected_result(),
                *device_idx,
                new_id,
                false,
            ) {
                shared.record_run_error(err);
                return Vec::new();
            }
        }
        // Each abort owes its own response, and may flush one for its target.
        shared.devices[*device_idx].set_expected((cmds.len() + targets.len()) as i64);
        shared.enqueue_work(new_id, *device_idx, 0);
        tracked.extend(targets.iter().copied());
    }

    run_phase(shared, Instant::now() + shared.config.abort_timeout);
    shared.aborting.store(false, Ordering::SeqCst);

    tracked.retain(|&t| shared.registry.status(t) == Some(CmdStatus::AwaitingResponse));
    for &tag in &tracked {
        warn!(tag, "abort did not clean up hung command");
    }
    tracked
}
