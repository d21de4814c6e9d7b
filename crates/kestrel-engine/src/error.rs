use kestrel_device::DeviceError;
use kestrel_protocol::{Tag, WireError};
use thiserror::Error;

/// Run-level engine errors. Per-command outcomes (failed, timed out, missing)
/// are not errors; they are reported through the execution summary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("tag {0} is already registered")]
    DuplicateTag(Tag),

    #[error("a stream must contain at least one command")]
    EmptyStream,

    #[error("no such device {0}")]
    UnknownDevice(usize),

    #[error("no such submission queue {queue} on device {device}")]
    UnknownQueue { device: usize, queue: usize },

    #[error("device {device}: DRAM window exhausted allocating {requested} bytes")]
    DmaRegionExhausted { device: usize, requested: u64 },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Wire(#[from] WireError),
}
