//! Wire format for the accelerator command/response protocol.
//!
//! Commands travel host to device over submission queues, responses travel
//! device to host over a per-device completion queue. Every message starts
//! with a fixed 16-byte header (see [`header`]); the payload layout is
//! per-kind (see [`command`]). Correlation is by tag: the response for a
//! command carries the same `tag_id` the command was submitted with.
//!
//! This crate is transport-agnostic and does no I/O.
#![forbid(unsafe_code)]

mod command;
mod header;

pub use command::{classify, result, Command, CommandBody, Verdict, KERNEL_ARGS_MAX};
pub use header::{
    encode_response, CmdFlags, CmdHeader, Opcode, RspHeader, Tag, CMD_HEADER_LEN, RSP_HEADER_LEN,
};

use thiserror::Error;

/// Errors from encoding or decoding wire messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("message truncated: {len} bytes, need {need}")]
    Truncated { len: usize, need: usize },

    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u16),

    #[error("declared total_size {declared} does not fit buffer of {actual} bytes")]
    SizeMismatch { declared: u32, actual: usize },

    #[error("kernel argument payload of {len} bytes exceeds the {max}-byte limit")]
    OversizedArgs { len: usize, max: usize },
}
