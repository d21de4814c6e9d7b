//! Host-side command/response engine for queue-based accelerator devices.
//!
//! Facade over the workspace crates:
//!
//! - [`protocol`]: wire format, command kinds, result-code classification.
//! - [`device`]: the [`device::DeviceLayer`] transport seam and the loopback
//!   device used in tests.
//! - [`engine`]: stream intake, dispatch/listen orchestration,
//!   retransmission, abort, and per-run summaries.
#![forbid(unsafe_code)]

pub use kestrel_device as device;
pub use kestrel_engine as engine;
pub use kestrel_protocol as protocol;

pub use kestrel_device::{DeviceError, DeviceLayer, DramWindow, QueueEvents};
pub use kestrel_engine::{
    CmdStatus, Engine, EngineConfig, EngineError, ExecutionSummary, StreamCommand, WaitMode,
};
pub use kestrel_protocol::{CmdFlags, Command, CommandBody, Opcode, Tag};
