//! Fixed-layout command and response headers.
//!
//! Every message exchanged with the device starts with one of these headers at
//! offset 0. The layout is identical for all command kinds so queue consumers
//! can route and correlate messages without knowing the payload shape. All
//! fields are little-endian.

use crate::WireError;
use bitflags::bitflags;

/// Size of the command header, in bytes. Payload starts at this offset.
pub const CMD_HEADER_LEN: usize = 16;

/// Size of the response header, in bytes.
pub const RSP_HEADER_LEN: usize = 16;

/// Correlation tag carried by every command and its eventual response.
pub type Tag = u32;

bitflags! {
    /// Command `flags` word.
    ///
    /// Bit 0 requests a device-side barrier: no later command in the same
    /// queue may begin execution before this one completes. The host makes no
    /// scheduling decision based on this bit beyond never reordering its own
    /// submissions. Bits 8..=11 carry the queue routing hint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmdFlags: u16 {
        const BARRIER = 1 << 0;
        const ROUTE_MASK = 0x0f00;
    }
}

impl CmdFlags {
    /// Returns these flags with the queue routing hint set to `queue`.
    ///
    /// Only the low 4 bits of `queue` are representable; the engine rejects
    /// queue indices outside that range before building commands.
    pub fn with_route(self, queue: usize) -> CmdFlags {
        let bits = (self.bits() & !Self::ROUTE_MASK.bits()) | (((queue as u16) & 0xf) << 8);
        CmdFlags::from_bits_retain(bits)
    }

    pub fn route(self) -> usize {
        usize::from((self.bits() & Self::ROUTE_MASK.bits()) >> 8)
    }

    pub fn barrier(self) -> bool {
        self.contains(CmdFlags::BARRIER)
    }
}

/// Command opcodes. One per command kind; the response carries no opcode, the
/// host resolves the kind from the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Echo = 0x0001,
    FirmwareVersion = 0x0002,
    DataWrite = 0x0003,
    DataRead = 0x0004,
    KernelLaunch = 0x0005,
    KernelAbort = 0x0006,
    TraceControl = 0x0007,
}

impl Opcode {
    pub fn from_u16(raw: u16) -> Result<Opcode, WireError> {
        match raw {
            0x0001 => Ok(Opcode::Echo),
            0x0002 => Ok(Opcode::FirmwareVersion),
            0x0003 => Ok(Opcode::DataWrite),
            0x0004 => Ok(Opcode::DataRead),
            0x0005 => Ok(Opcode::KernelLaunch),
            0x0006 => Ok(Opcode::KernelAbort),
            0x0007 => Ok(Opcode::TraceControl),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

impl core::fmt::Display for Opcode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Opcode::Echo => "ECHO",
            Opcode::FirmwareVersion => "FW_VERSION",
            Opcode::DataWrite => "DATA_WRITE",
            Opcode::DataRead => "DATA_READ",
            Opcode::KernelLaunch => "KERNEL_LAUNCH",
            Opcode::KernelAbort => "KERNEL_ABORT",
            Opcode::TraceControl => "TRACE_CONTROL",
        };
        f.write_str(name)
    }
}

/// Command header: `tag_id` (u32) | `opcode` (u16) | `flags` (u16) |
/// `total_size` (u32, includes this header) | reserved (u32).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    pub tag_id: Tag,
    pub opcode: Opcode,
    pub flags: CmdFlags,
    pub total_size: u32,
}

impl CmdHeader {
    pub fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.tag_id.to_le_bytes());
        out[4..6].copy_from_slice(&(self.opcode as u16).to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[8..12].copy_from_slice(&self.total_size.to_le_bytes());
        out[12..16].fill(0);
    }

    pub fn parse(bytes: &[u8]) -> Result<CmdHeader, WireError> {
        if bytes.len() < CMD_HEADER_LEN {
            return Err(WireError::Truncated {
                len: bytes.len(),
                need: CMD_HEADER_LEN,
            });
        }
        let tag_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let opcode = Opcode::from_u16(u16::from_le_bytes(bytes[4..6].try_into().unwrap()))?;
        let flags = CmdFlags::from_bits_retain(u16::from_le_bytes(bytes[6..8].try_into().unwrap()));
        let total_size = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if (total_size as usize) < CMD_HEADER_LEN || total_size as usize > bytes.len() {
            return Err(WireError::SizeMismatch {
                declared: total_size,
                actual: bytes.len(),
            });
        }
        Ok(CmdHeader {
            tag_id,
            opcode,
            flags,
            total_size,
        })
    }
}

/// Response header: `tag_id` (u32) | `total_size` (u32, includes this header) |
/// `result_code` (u32) | reserved (u32).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RspHeader {
    pub tag_id: Tag,
    pub total_size: u32,
    pub result_code: u32,
}

impl RspHeader {
    pub fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.tag_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.total_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.result_code.to_le_bytes());
        out[12..16].fill(0);
    }

    pub fn parse(bytes: &[u8]) -> Result<RspHeader, WireError> {
        if bytes.len() < RSP_HEADER_LEN {
            return Err(WireError::Truncated {
                len: bytes.len(),
                need: RSP_HEADER_LEN,
            });
        }
        let tag_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let total_size = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let result_code = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if (total_size as usize) < RSP_HEADER_LEN || total_size as usize > bytes.len() {
            return Err(WireError::SizeMismatch {
                declared: total_size,
                actual: bytes.len(),
            });
        }
        Ok(RspHeader {
            tag_id,
            total_size,
            result_code,
        })
    }
}

/// Builds a complete response message (header + payload).
pub fn encode_response(tag_id: Tag, result_code: u32, payload: &[u8]) -> Vec<u8> {
    let total = RSP_HEADER_LEN + payload.len();
    let mut out = vec![0u8; total];
    RspHeader {
        tag_id,
        total_size: total as u32,
        result_code,
    }
    .write_to(&mut out[..RSP_HEADER_LEN]);
    out[RSP_HEADER_LEN..].copy_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_header_layout_is_fixed() {
        let hdr = CmdHeader {
            tag_id: 0x11223344,
            opcode: Opcode::KernelLaunch,
            flags: CmdFlags::BARRIER.with_route(3),
            total_size: 48,
        };
        let mut buf = [0u8; CMD_HEADER_LEN];
        hdr.write_to(&mut buf);

        assert_eq!(&buf[0..4], &0x11223344u32.to_le_bytes());
        assert_eq!(&buf[4..6], &0x0005u16.to_le_bytes());
        assert_eq!(&buf[6..8], &0x0301u16.to_le_bytes()); // route=3, barrier
        assert_eq!(&buf[8..12], &48u32.to_le_bytes());
        assert_eq!(&buf[12..16], &[0, 0, 0, 0]);

        let mut msg = vec![0u8; 48];
        msg[..CMD_HEADER_LEN].copy_from_slice(&buf);
        let parsed = CmdHeader::parse(&msg).unwrap();
        assert_eq!(parsed, hdr);
        assert!(parsed.flags.barrier());
        assert_eq!(parsed.flags.route(), 3);
    }

    #[test]
    fn rsp_header_round_trip() {
        let msg = encode_response(7, 4, &[0xaa; 8]);
        let hdr = RspHeader::parse(&msg).unwrap();
        assert_eq!(hdr.tag_id, 7);
        assert_eq!(hdr.result_code, 4);
        assert_eq!(hdr.total_size as usize, RSP_HEADER_LEN + 8);
    }

    #[test]
    fn truncated_and_oversized_headers_are_rejected() {
        assert!(matches!(
            CmdHeader::parse(&[0u8; 4]),
            Err(WireError::Truncated { .. })
        ));
        assert!(matches!(
            RspHeader::parse(&[0u8; 15]),
            Err(WireError::Truncated { .. })
        ));

        // Declared size larger than the buffer.
        let mut msg = encode_response(1, 0, &[]);
        msg[4..8].copy_from_slice(&64u32.to_le_bytes());
        assert!(matches!(
            RspHeader::parse(&msg),
            Err(WireError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut buf = [0u8; CMD_HEADER_LEN];
        CmdHeader {
            tag_id: 1,
            opcode: Opcode::Echo,
            flags: CmdFlags::default(),
            total_size: CMD_HEADER_LEN as u32,
        }
        .write_to(&mut buf);
        buf[4..6].copy_from_slice(&0x00ffu16.to_le_bytes());
        assert!(matches!(
            CmdHeader::parse(&buf),
            Err(WireError::UnknownOpcode(0x00ff))
        ));
    }
}
