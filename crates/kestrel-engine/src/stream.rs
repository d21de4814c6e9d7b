//! Ordered command streams and the builder the caller hands to the engine.

use kestrel_protocol::{CmdFlags, Command, CommandBody};

/// One command as drafted by the caller, before the engine assigns a tag and
/// routes it to a queue.
#[derive(Debug, Clone)]
pub struct StreamCommand {
    pub body: CommandBody,
    pub flags: CmdFlags,
    /// Result code this command is expected to complete with. Defaults to
    /// nominal success; tests that provoke failures set the failure code they
    /// expect so it classifies as successful.
    pub expected: u32,
}

impl StreamCommand {
    pub fn new(body: CommandBody) -> StreamCommand {
        StreamCommand {
            body,
            flags: CmdFlags::default(),
            expected: kestrel_protocol::result::SUCCESS,
        }
    }

    /// Requests a device-side barrier: no later command in the same queue may
    /// begin execution before this one completes.
    pub fn barrier(mut self) -> StreamCommand {
        self.flags |= CmdFlags::BARRIER;
        self
    }

    pub fn expecting(mut self, result_code: u32) -> StreamCommand {
        self.expected = result_code;
        self
    }
}

/// An ordered run of tagged commands bound to one (device, queue) pair.
///
/// `next_unsent` is the dispatcher's cursor; commands before it are on the
/// wire. Retransmission never rewrites a stream in place: it builds a
/// successor stream with fresh tags and zeroes the remaining budget here.
#[derive(Debug)]
pub(crate) struct Stream {
    pub device_idx: usize,
    pub queue_idx: usize,
    pub commands: Vec<Command>,
    pub retry_budget: u32,
    /// Set once a successor stream has been issued for this one.
    pub retransmitted: bool,
    pub next_unsent: usize,
}

impl Stream {
    pub fn new(
        device_idx: usize,
        queue_idx: usize,
        commands: Vec<Command>,
        retry_budget: u32,
    ) -> Stream {
        Stream {
            device_idx,
            queue_idx,
            commands,
            retry_budget,
            retransmitted: false,
            next_unsent: 0,
        }
    }
}
