//! Per-device completion worker.
//!
//! One listener owns the completion queue of one device for the duration of a
//! phase. It pops responses, resolves them against the registry, forwards
//! submission-queue availability to the dispatchers, and triggers
//! retransmission for failed commands. It exits when every expected response
//! has been resolved, or on deadline or run error.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;

use kestrel_device::QueueEvents;
use tracing::{debug, trace, warn};

use crate::device_state::WAIT_SLICE;
use crate::engine::{EngineShared, WaitMode};
use crate::registry::{CmdStatus, ResponseOutcome};
use crate::retry;

pub(crate) fn run(shared: &EngineShared, device_idx: usize, deadline: Instant) {
    let state = &shared.devices[device_idx];
    let queue_count = shared.queue_counts[device_idx];
    while state.expected() > 0 {
        if shared.has_run_error() {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(
                device = device_idx,
                outstanding = state.expected(),
                "deadline elapsed with responses outstanding"
            );
            break;
        }
        match shared.device.pop(device_idx) {
            Err(err) => {
                shared.record_run_error(err.into());
                break;
            }
            Ok(Some(bytes)) => handle_response(shared, device_idx, &bytes),
            Ok(None) => {
                if state.abort.load(Ordering::SeqCst) {
                    break;
                }
                let bound = (deadline - now).min(WAIT_SLICE);
                match shared.config.wait_mode {
                    WaitMode::Event => match shared.device.wait_for_queue_events(device_idx, bound)
                    {
                        Ok(events) => state.grant_sq(events.sq_bitmap),
                        Err(err) => {
                            shared.record_run_error(err.into());
                            break;
                        }
                    },
                    // No event source: sleep, then assume full availability
                    // and let push/pop discover the real state.
                    WaitMode::Poll(interval) => {
                        thread::sleep(interval.min(bound));
                        state.grant_sq(QueueEvents::synthesized(queue_count).sq_bitmap);
                    }
                }
            }
        }
    }
    state.listener_done.store(true, Ordering::SeqCst);
    state.notify();
    debug!(device = device_idx, "listener exiting");
}

/// Resolves one raw response. Shared by the threaded listener and the
/// synchronous execution path.
pub(crate) fn handle_response(shared: &EngineShared, device_idx: usize, bytes: &[u8]) {
    let state = &shared.devices[device_idx];
    match shared.registry.record_response(bytes) {
        Err(err) => warn!(device = device_idx, %err, "discarding malformed response"),
        Ok(ResponseOutcome::Unknown { tag }) => {
            warn!(device = device_idx, tag, "response for unregistered tag, discarding");
        }
        Ok(ResponseOutcome::Duplicate { tag }) => {
            warn!(device = device_idx, tag, "duplicate response, first terminal status stands");
        }
        Ok(ResponseOutcome::Resolved {
            tag,
            status,
            superseded,
        }) => {
            trace!(device = device_idx, tag, ?status, "response resolved");
            if superseded {
                // The debt for this tag was already settled when it was
                // superseded; its clone carries the live expectation.
                return;
            }
            state.dec_expected();
            if matches!(status, CmdStatus::Failed | CmdStatus::TimedOut)
                && !shared.aborting.load(Ordering::SeqCst)
            {
                retry::maybe_retransmit(shared, tag);
            }
        }
    }
}
