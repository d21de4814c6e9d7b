//! Host-side protocol engine for queue-based accelerator devices.
//!
//! The engine accepts ordered command streams bound to (device, submission
//! queue) pairs, drives them through a [`kestrel_device::DeviceLayer`]
//! transport, correlates tagged responses, retransmits the unresolved tail of
//! a stream on failure, aborts commands that hang, and reports a per-run
//! [`ExecutionSummary`].
//!
//! Two execution modes share all of the bookkeeping: `execute_async` runs one
//! dispatcher thread per (device, queue) pair and one listener thread per
//! device; `execute_sync` drains each command's response on the caller's
//! thread before submitting the next.
#![forbid(unsafe_code)]

mod abort;
mod device_state;
mod dispatcher;
mod engine;
mod error;
mod listener;
mod registry;
mod retry;
mod stream;
mod summary;

pub use engine::{Engine, EngineConfig, WaitMode};
pub use error::EngineError;
pub use registry::{CmdStatus, ResponseOutcome, TagRegistry};
pub use stream::StreamCommand;
pub use summary::ExecutionSummary;
