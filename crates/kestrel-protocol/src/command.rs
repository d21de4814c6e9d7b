//! The closed set of command kinds and their payload encodings.
//!
//! Each command is header + payload; the payload layout is private to the
//! kind, but every kind shares the [`CmdHeader`] contract, an expected result
//! code, and a classification of device result codes into success / failure /
//! timeout.

use crate::header::{CmdFlags, CmdHeader, Opcode, Tag, CMD_HEADER_LEN};
use crate::WireError;

/// Maximum inline kernel-argument payload, in bytes.
pub const KERNEL_ARGS_MAX: usize = 128;

/// Device result codes, per command kind.
///
/// Code 0 is the nominal success for every kind. The non-zero codes below are
/// the ones the host engine distinguishes; everything else is an opaque
/// failure.
pub mod result {
    /// Nominal success for every command kind.
    pub const SUCCESS: u32 = 0;

    /// DMA read/write: no idle channel became available in time.
    pub const DMA_TIMEOUT_CHANNEL_UNAVAILABLE: u32 = 2;
    /// DMA read/write: the transfer hung.
    pub const DMA_TIMEOUT_HANG: u32 = 3;

    /// Kernel launch: the kernel raised an exception.
    pub const KERNEL_EXCEPTION: u32 = 2;
    /// Kernel launch: the launch was torn down by a host abort command.
    pub const KERNEL_HOST_ABORTED: u32 = 4;
    /// Kernel launch: the kernel hung and the device firmware gave up.
    pub const KERNEL_TIMEOUT_HANG: u32 = 6;

    /// Kernel abort: the referenced tag is not pipelined on the device.
    pub const ABORT_INVALID_TAG: u32 = 2;
}

/// How a device result code relates to what the host expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failed,
    TimedOut,
}

/// Classifies a device result code for a command of kind `opcode` against the
/// host's expected code.
///
/// An exact match is a success even when the expected code is itself an error
/// code (e.g. a test that expects `KERNEL_HOST_ABORTED`). Device-side timeout
/// codes are surfaced as [`Verdict::TimedOut`] so the retry path can treat
/// them like a missing response.
pub fn classify(opcode: Opcode, expected: u32, actual: u32) -> Verdict {
    if actual == expected {
        return Verdict::Success;
    }
    let timed_out = match opcode {
        Opcode::DataWrite | Opcode::DataRead => {
            actual == result::DMA_TIMEOUT_CHANNEL_UNAVAILABLE || actual == result::DMA_TIMEOUT_HANG
        }
        Opcode::KernelLaunch => actual == result::KERNEL_TIMEOUT_HANG,
        _ => false,
    };
    if timed_out {
        Verdict::TimedOut
    } else {
        Verdict::Failed
    }
}

/// Payload of one command, by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    Echo {
        payload: u64,
    },
    FirmwareVersion {
        firmware_type: u32,
    },
    /// Host to device DMA transfer.
    DataWrite {
        device_addr: u64,
        host_addr: u64,
        len: u64,
    },
    /// Device to host DMA transfer.
    DataRead {
        device_addr: u64,
        host_addr: u64,
        len: u64,
    },
    KernelLaunch {
        entry_addr: u64,
        args_addr: u64,
        exception_buf: u64,
        cluster_mask: u64,
        trace_buf: u64,
        args: Vec<u8>,
    },
    /// Aborts the still-pipelined command identified by `target_tag`.
    KernelAbort {
        target_tag: Tag,
    },
    TraceControl {
        component: u32,
        control: u32,
    },
}

impl CommandBody {
    pub fn opcode(&self) -> Opcode {
        match self {
            CommandBody::Echo { .. } => Opcode::Echo,
            CommandBody::FirmwareVersion { .. } => Opcode::FirmwareVersion,
            CommandBody::DataWrite { .. } => Opcode::DataWrite,
            CommandBody::DataRead { .. } => Opcode::DataRead,
            CommandBody::KernelLaunch { .. } => Opcode::KernelLaunch,
            CommandBody::KernelAbort { .. } => Opcode::KernelAbort,
            CommandBody::TraceControl { .. } => Opcode::TraceControl,
        }
    }

    /// True for transfers that move bulk data over the DMA engines; the
    /// transport may route these differently.
    pub fn is_dma(&self) -> bool {
        matches!(
            self,
            CommandBody::DataWrite { .. } | CommandBody::DataRead { .. }
        )
    }

    /// True if an in-flight command of this kind can be torn down with an
    /// explicit [`CommandBody::KernelAbort`].
    pub fn cancelable(&self) -> bool {
        matches!(self, CommandBody::KernelLaunch { .. })
    }

    pub fn validate(&self) -> Result<(), WireError> {
        match self {
            CommandBody::KernelLaunch { args, .. } if args.len() > KERNEL_ARGS_MAX => {
                Err(WireError::OversizedArgs {
                    len: args.len(),
                    max: KERNEL_ARGS_MAX,
                })
            }
            _ => Ok(()),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            CommandBody::Echo { .. } => 8,
            CommandBody::FirmwareVersion { .. } => 4,
            CommandBody::DataWrite { .. } | CommandBody::DataRead { .. } => 24,
            CommandBody::KernelLaunch { args, .. } => 44 + args.len(),
            CommandBody::KernelAbort { .. } => 4,
            CommandBody::TraceControl { .. } => 8,
        }
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        match self {
            CommandBody::Echo { payload } => out.extend_from_slice(&payload.to_le_bytes()),
            CommandBody::FirmwareVersion { firmware_type } => {
                out.extend_from_slice(&firmware_type.to_le_bytes())
            }
            CommandBody::DataWrite {
                device_addr,
                host_addr,
                len,
            }
            | CommandBody::DataRead {
                device_addr,
                host_addr,
                len,
            } => {
                out.extend_from_slice(&device_addr.to_le_bytes());
                out.extend_from_slice(&host_addr.to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
            }
            CommandBody::KernelLaunch {
                entry_addr,
                args_addr,
                exception_buf,
                cluster_mask,
                trace_buf,
                args,
            } => {
                out.extend_from_slice(&entry_addr.to_le_bytes());
                out.extend_from_slice(&args_addr.to_le_bytes());
                out.extend_from_slice(&exception_buf.to_le_bytes());
                out.extend_from_slice(&cluster_mask.to_le_bytes());
                out.extend_from_slice(&trace_buf.to_le_bytes());
                out.extend_from_slice(&(args.len() as u32).to_le_bytes());
                out.extend_from_slice(args);
            }
            CommandBody::KernelAbort { target_tag } => {
                out.extend_from_slice(&target_tag.to_le_bytes())
            }
            CommandBody::TraceControl { component, control } => {
                out.extend_from_slice(&component.to_le_bytes());
                out.extend_from_slice(&control.to_le_bytes());
            }
        }
    }

    /// Decodes a payload for `opcode`. Used by device models; the host engine
    /// only ever encodes.
    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<CommandBody, WireError> {
        let need = |n: usize| {
            if payload.len() < n {
                Err(WireError::Truncated {
                    len: payload.len(),
                    need: n,
                })
            } else {
                Ok(())
            }
        };
        let u32_at = |off: usize| u32::from_le_bytes(payload[off..off + 4].try_into().unwrap());
        let u64_at = |off: usize| u64::from_le_bytes(payload[off..off + 8].try_into().unwrap());
        match opcode {
            Opcode::Echo => {
                need(8)?;
                Ok(CommandBody::Echo {
                    payload: u64_at(0),
                })
            }
            Opcode::FirmwareVersion => {
                need(4)?;
                Ok(CommandBody::FirmwareVersion {
                    firmware_type: u32_at(0),
                })
            }
            Opcode::DataWrite => {
                need(24)?;
                Ok(CommandBody::DataWrite {
                    device_addr: u64_at(0),
                    host_addr: u64_at(8),
                    len: u64_at(16),
                })
            }
            Opcode::DataRead => {
                need(24)?;
                Ok(CommandBody::DataRead {
                    device_addr: u64_at(0),
                    host_addr: u64_at(8),
                    len: u64_at(16),
                })
            }
            Opcode::KernelLaunch => {
                need(44)?;
                let args_len = u32_at(40) as usize;
                need(44 + args_len)?;
                Ok(CommandBody::KernelLaunch {
                    entry_addr: u64_at(0),
                    args_addr: u64_at(8),
                    exception_buf: u64_at(16),
                    cluster_mask: u64_at(24),
                    trace_buf: u64_at(32),
                    args: payload[44..44 + args_len].to_vec(),
                })
            }
            Opcode::KernelAbort => {
                need(4)?;
                Ok(CommandBody::KernelAbort {
                    target_tag: u32_at(0),
                })
            }
            Opcode::TraceControl => {
                need(8)?;
                Ok(CommandBody::TraceControl {
                    component: u32_at(0),
                    control: u32_at(4),
                })
            }
        }
    }
}

/// A fully-formed command: immutable header + payload plus the result code the
/// host expects back. The terminal status lives in the engine's tag registry,
/// not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    tag: Tag,
    flags: CmdFlags,
    expected: u32,
    body: CommandBody,
}

impl Command {
    pub fn new(tag: Tag, flags: CmdFlags, expected: u32, body: CommandBody) -> Command {
        Command {
            tag,
            flags,
            expected,
            body,
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn opcode(&self) -> Opcode {
        self.body.opcode()
    }

    pub fn flags(&self) -> CmdFlags {
        self.flags
    }

    pub fn expected_result(&self) -> u32 {
        self.expected
    }

    pub fn body(&self) -> &CommandBody {
        &self.body
    }

    pub fn is_dma(&self) -> bool {
        self.body.is_dma()
    }

    pub fn cancelable(&self) -> bool {
        self.body.cancelable()
    }

    pub fn classify(&self, actual: u32) -> Verdict {
        classify(self.opcode(), self.expected, actual)
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        CMD_HEADER_LEN + self.body.payload_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let total = self.encoded_len();
        let mut out = vec![0u8; CMD_HEADER_LEN];
        CmdHeader {
            tag_id: self.tag,
            opcode: self.opcode(),
            flags: self.flags,
            total_size: total as u32,
        }
        .write_to(&mut out[..CMD_HEADER_LEN]);
        self.body.write_payload(&mut out);
        debug_assert_eq!(out.len(), total);
        out
    }

    /// Clones this command under a fresh tag; used when the unresolved tail of
    /// a stream is retransmitted.
    pub fn clone_with_tag(&self, tag: Tag) -> Command {
        Command {
            tag,
            flags: self.flags,
            expected: self.expected,
            body: self.body.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(body: CommandBody) {
        let cmd = Command::new(42, CmdFlags::default(), result::SUCCESS, body.clone());
        let bytes = cmd.encode();
        let hdr = CmdHeader::parse(&bytes).unwrap();
        assert_eq!(hdr.tag_id, 42);
        assert_eq!(hdr.opcode, body.opcode());
        assert_eq!(hdr.total_size as usize, bytes.len());
        let decoded = CommandBody::decode(hdr.opcode, &bytes[CMD_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn kernel_launch_payload_round_trips_with_args() {
        round_trip(CommandBody::KernelLaunch {
            entry_addr: 0x8000_0000,
            args_addr: 0x8100_0000,
            exception_buf: 0x8200_0000,
            cluster_mask: 0xff,
            trace_buf: 0,
            args: vec![1, 2, 3, 4, 5],
        });
    }

    #[test]
    fn abort_payload_carries_target_tag() {
        let cmd = Command::new(
            9,
            CmdFlags::default(),
            result::SUCCESS,
            CommandBody::KernelAbort { target_tag: 5 },
        );
        let bytes = cmd.encode();
        let body = CommandBody::decode(Opcode::KernelAbort, &bytes[CMD_HEADER_LEN..]).unwrap();
        assert_eq!(body, CommandBody::KernelAbort { target_tag: 5 });
    }

    #[test]
    fn oversized_kernel_args_fail_validation() {
        let body = CommandBody::KernelLaunch {
            entry_addr: 0,
            args_addr: 0,
            exception_buf: 0,
            cluster_mask: 0,
            trace_buf: 0,
            args: vec![0; KERNEL_ARGS_MAX + 1],
        };
        assert!(matches!(
            body.validate(),
            Err(WireError::OversizedArgs { .. })
        ));
    }

    #[test]
    fn classification_honors_expected_code() {
        // Expecting the abort code makes it a success.
        assert_eq!(
            classify(
                Opcode::KernelLaunch,
                result::KERNEL_HOST_ABORTED,
                result::KERNEL_HOST_ABORTED
            ),
            Verdict::Success
        );
        assert_eq!(
            classify(Opcode::KernelLaunch, result::SUCCESS, result::KERNEL_TIMEOUT_HANG),
            Verdict::TimedOut
        );
        assert_eq!(
            classify(Opcode::DataWrite, result::SUCCESS, result::DMA_TIMEOUT_HANG),
            Verdict::TimedOut
        );
        assert_eq!(
            classify(Opcode::Echo, result::SUCCESS, 7),
            Verdict::Failed
        );
        // Timeout codes are kind-specific: an echo never times out device-side.
        assert_eq!(
            classify(Opcode::Echo, result::SUCCESS, result::DMA_TIMEOUT_HANG),
            Verdict::Failed
        );
    }
}
