//! Per-(device, queue) submission worker.
//!
//! One dispatcher owns one submission queue for the duration of a phase. It
//! pulls streams from the work queue and pushes their commands in order,
//! blocking on a grant from the listener when the queue is full. It exits
//! when the work queue is empty and the device's listener has finished, or on
//! deadline, abort, or run error.

use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::device_state::DeviceState;
use crate::engine::EngineShared;
use crate::error::EngineError;
use crate::stream::Stream;

const IDLE_WAIT: Duration = Duration::from_millis(10);

pub(crate) fn run(shared: &EngineShared, device_idx: usize, queue_idx: usize, deadline: Instant) {
    let state = &shared.devices[device_idx];
    loop {
        if Instant::now() >= deadline || state.abort.load(Ordering::SeqCst) {
            break;
        }
        if shared.has_run_error() {
            break;
        }
        match shared.take_work(device_idx, queue_idx) {
            Some(stream) => {
                if let Err(err) = dispatch_stream(shared, state, &stream, device_idx, queue_idx, deadline) {
                    shared.record_run_error(err);
                    break;
                }
            }
            None => {
                if state.listener_done.load(Ordering::SeqCst) {
                    break;
                }
                state.idle_wait(IDLE_WAIT);
            }
        }
    }
    debug!(device = device_idx, queue = queue_idx, "dispatcher exiting");
}

fn dispatch_stream(
    shared: &EngineShared,
    state: &DeviceState,
    stream: &Mutex<Stream>,
    device_idx: usize,
    queue_idx: usize,
    deadline: Instant,
) -> Result<(), EngineError> {
    loop {
        let cmd = {
            let mut s = stream.lock().unwrap();
            loop {
                let Some(c) = s.commands.get(s.next_unsent) else {
                    return Ok(());
                };
                // A retransmission may have replaced commands we had not sent
                // yet; skip those, the successor stream carries their clones.
                if shared.registry.is_superseded(c.tag()) {
                    s.next_unsent += 1;
                    continue;
                }
                break c.clone();
            }
        };
        let bytes = cmd.encode();
        loop {
            if state.abort.load(Ordering::SeqCst) || Instant::now() >= deadline {
                return Ok(());
            }
            if shared
                .device
                .push(device_idx, queue_idx, &bytes, cmd.is_dma())?
            {
                shared.registry.note_sent(cmd.tag(), bytes.len());
                trace!(
                    device = device_idx,
                    queue = queue_idx,
                    tag = cmd.tag(),
                    opcode = %cmd.opcode(),
                    "command submitted"
                );
                stream.lock().unwrap().next_unsent += 1;
                break;
            }
            // Queue full. Wait for the listener to grant fresh slots.
            state.take_sq_grant(queue_idx, deadline);
        }
    }
}
