//! Memory-transfer facade between host buffers and VE memory.
//!
//! The DMA engine only moves 8-byte-aligned ranges. For arbitrary caller
//! ranges the facade widens to the enclosing aligned range and preserves the
//! edge bytes by reading the first and last aligned words back first:
//!
//! ```text
//!        +----------+ <- aligned_top (8-byte aligned)
//!        |top_offset|
//!        +----------+ <- addr
//!        |   len    |
//!        +----------+ <- addr + len
//!        |bottom_off|
//!        +----------+ <- aligned_bottom (8-byte aligned)
//! ```

use std::sync::Arc;

use log::debug;

use crate::dma::{DmaEndpoint, DmaEngine, DmaStatus, DmaTranslator};
use crate::error::{Result, VeosError};
use crate::mm::VE_PAGE_SIZE;
use crate::task::Pid;

/// Receive granularity of the string reader.
const STRING_CHUNK: u64 = 4096;

/// Failure codes of `recv_string`, kept wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// No NUL byte within the prescribed range.
    NullNotFound,
    /// The DMA transfer itself failed.
    TransferFailed,
    /// The destination buffer cannot hold the string.
    DestTooSmall,
}

impl StringError {
    pub fn code(self) -> i64 {
        match self {
            Self::NullNotFound => -2,
            Self::TransferFailed => -3,
            Self::DestTooSmall => -4,
        }
    }
}

/// The enclosing 8-byte-aligned range of `[addr, addr + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AlignedRange {
    pub aligned_top: u64,
    pub top_offset: usize,
    pub aligned_bottom: u64,
    pub bottom_offset: usize,
    pub new_size: usize,
}

pub(crate) fn aligned_range(addr: u64, len: usize) -> AlignedRange {
    let bottom = addr + len as u64;
    let aligned_top = addr & !7;
    let aligned_bottom = if bottom % 8 != 0 {
        (bottom & !7) + 8
    } else {
        bottom
    };
    AlignedRange {
        aligned_top,
        top_offset: (addr - aligned_top) as usize,
        aligned_bottom,
        bottom_offset: (aligned_bottom - bottom) as usize,
        new_size: (aligned_bottom - aligned_top) as usize,
    }
}

/// Bridge between pseudo-process requests and the DMA engine.
pub struct MemTransfer {
    engine: Arc<DmaEngine>,
    translator: Arc<dyn DmaTranslator>,
    /// Pid owning the host-side bounce buffers (the service itself).
    host_pid: Pid,
}

impl MemTransfer {
    pub fn new(engine: Arc<DmaEngine>, translator: Arc<dyn DmaTranslator>, host_pid: Pid) -> Self {
        Self {
            engine,
            translator,
            host_pid,
        }
    }

    fn xfer(&self, src: DmaEndpoint, dst: DmaEndpoint, len: u64) -> Result<()> {
        let fault_addr = dst.addr();
        match self.engine.xfer(self.translator.as_ref(), src, dst, len)? {
            DmaStatus::Ok => Ok(()),
            _ => Err(VeosError::TranslationFault { addr: fault_addr }),
        }
    }

    /// Aligned lower rung of the send path. Intentionally strict: lengths
    /// that are not a multiple of 8 are rejected as invalid argument.
    pub fn send_aligned(&self, pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        if data.len() % 8 != 0 {
            return Err(VeosError::InvalidArgument {
                name: "datasize",
                value: "must be a multiple of 8",
            });
        }
        self.xfer(
            DmaEndpoint::host_virt(self.host_pid, data.as_ptr() as u64),
            DmaEndpoint::ve_virt(pid, addr),
            data.len() as u64,
        )
    }

    /// Aligned lower rung of the receive path.
    pub fn recv_aligned(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() % 8 != 0 {
            return Err(VeosError::InvalidArgument {
                name: "datasize",
                value: "must be a multiple of 8",
            });
        }
        self.xfer(
            DmaEndpoint::ve_virt(pid, addr),
            DmaEndpoint::host_virt(self.host_pid, buf.as_mut_ptr() as u64),
            buf.len() as u64,
        )
    }

    /// Write `data` to VE memory at `addr`, any alignment. Unaligned edges
    /// are read-modify-written as whole 8-byte words.
    pub fn send_data(&self, pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let range = aligned_range(addr, data.len());
        let mut buf = vec![0u8; range.new_size];

        if range.top_offset != 0 {
            self.recv_aligned(pid, range.aligned_top, &mut buf[..8])?;
        }
        if range.bottom_offset != 0 {
            let tail = range.new_size - 8;
            self.recv_aligned(pid, range.aligned_bottom - 8, &mut buf[tail..])?;
        }
        buf[range.top_offset..range.top_offset + data.len()].copy_from_slice(data);
        self.send_aligned(pid, range.aligned_top, &buf)
    }

    /// Read `len` bytes from VE memory at `addr`, any alignment.
    pub fn recv_data(&self, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let range = aligned_range(addr, len);
        let mut buf = vec![0u8; range.new_size];
        self.recv_aligned(pid, range.aligned_top, &mut buf)?;
        Ok(buf[range.top_offset..range.top_offset + len].to_vec())
    }

    /// Read a NUL-terminated string from VE memory, 4 KiB at a time,
    /// touching at most two VE pages. At most `dest_size` bytes (including
    /// the terminator's slot) are scanned.
    pub fn recv_string(
        &self,
        pid: Pid,
        from: u64,
        dest_size: usize,
    ) -> core::result::Result<Vec<u8>, StringError> {
        if dest_size == 0 {
            return Err(StringError::DestTooSmall);
        }
        let window_end = (from & !(VE_PAGE_SIZE - 1)) + 2 * VE_PAGE_SIZE;
        let mut dest: Vec<u8> = Vec::new();
        let mut pos = from;

        while pos < window_end && dest.len() < dest_size {
            let to_page = VE_PAGE_SIZE - (pos & (VE_PAGE_SIZE - 1));
            let budget = (dest_size - dest.len()) as u64;
            let chunk_len = STRING_CHUNK.min(to_page).min(window_end - pos).min(budget);

            let chunk = self
                .recv_data(pid, pos, chunk_len as usize)
                .map_err(|_| StringError::TransferFailed)?;

            if let Some(idx) = chunk.iter().position(|b| *b == 0) {
                for b in &chunk[..idx] {
                    if !b.is_ascii_graphic() && *b != b' ' && *b != b'\n' {
                        debug!("non-printable byte {b:#04x} in string at {from:#x}");
                    }
                }
                let total = dest.len() + idx;
                if total + 1 > dest_size {
                    return Err(StringError::DestTooSmall);
                }
                dest.extend_from_slice(&chunk[..idx]);
                return Ok(dest);
            }
            dest.extend_from_slice(&chunk);
            pos += chunk_len;
        }
        debug!("no NUL within the prescribed range at {from:#x}");
        Err(StringError::NullNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_range_already_aligned() {
        let r = aligned_range(0x1000, 16);
        assert_eq!(r.aligned_top, 0x1000);
        assert_eq!(r.top_offset, 0);
        assert_eq!(r.aligned_bottom, 0x1010);
        assert_eq!(r.bottom_offset, 0);
        assert_eq!(r.new_size, 16);
    }

    #[test]
    fn test_aligned_range_unaligned_both_ends() {
        let r = aligned_range(0x1003, 5);
        assert_eq!(r.aligned_top, 0x1000);
        assert_eq!(r.top_offset, 3);
        assert_eq!(r.aligned_bottom, 0x1008);
        assert_eq!(r.bottom_offset, 0);
        assert_eq!(r.new_size, 8);

        let r = aligned_range(0x1006, 5);
        assert_eq!(r.aligned_top, 0x1000);
        assert_eq!(r.top_offset, 6);
        assert_eq!(r.aligned_bottom, 0x1010);
        assert_eq!(r.bottom_offset, 5);
        assert_eq!(r.new_size, 16);
    }

    #[test]
    fn test_string_error_codes_are_wire_stable() {
        assert_eq!(StringError::NullNotFound.code(), -2);
        assert_eq!(StringError::TransferFailed.code(), -3);
        assert_eq!(StringError::DestTooSmall.code(), -4);
    }
}
