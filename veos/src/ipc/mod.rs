//! Pseudo-process wire protocol.
//!
//! Length-prefixed frames over a UNIX stream socket. A request carries the
//! command id, the caller pid and an opaque command payload; the response
//! carries an `i64` return value with Linux errno conventions (negative
//! means error) plus an optional payload. All integers are little-endian.

pub mod server;

use std::io::{Read, Write};

use crate::signal::SigInfo;
use crate::task::Pid;

/// Command ids, stable on the wire.
pub const CMD_DMA_REQUEST: u32 = 1;
pub const CMD_SIGNAL_SEND: u32 = 2;
pub const CMD_SIGACTION: u32 = 3;
pub const CMD_SIGPROCMASK: u32 = 4;
pub const CMD_SIGPENDING: u32 = 5;
pub const CMD_SIGSUSPEND: u32 = 6;
pub const CMD_SIGALTSTACK: u32 = 7;
pub const CMD_GETCONTEXT: u32 = 8;
pub const CMD_SETCONTEXT: u32 = 9;

/// Largest accepted frame body.
pub const MAX_FRAME: u32 = 4 * 1024 * 1024;

/// Byte-cursor over a received payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let out = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(out)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn i32(&mut self) -> Option<i32> {
        self.take(4).map(|b| i32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Option<i64> {
        self.take(8).map(|b| i64::from_le_bytes(b.try_into().unwrap()))
    }
}

/// One request as read off the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub cmd: u32,
    pub pid: Pid,
    pub payload: Vec<u8>,
}

impl RequestFrame {
    pub fn encode(&self) -> Vec<u8> {
        let body_len = 8 + self.payload.len();
        let mut out = Vec::with_capacity(4 + body_len);
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.extend_from_slice(&self.cmd.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a frame body (without the length prefix).
    pub fn decode(body: &[u8]) -> Option<Self> {
        let mut rd = WireReader::new(body);
        let cmd = rd.u32()?;
        let pid = rd.i32()?;
        Some(Self {
            cmd,
            pid,
            payload: body[8..].to_vec(),
        })
    }
}

/// Read one request frame; `None` on orderly EOF.
pub fn read_request(stream: &mut impl Read) -> std::io::Result<Option<RequestFrame>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_le_bytes(len_buf);
    if len < 8 || len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad frame length",
        ));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    let frame = RequestFrame::decode(&body).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "bad frame header")
    })?;
    Ok(Some(frame))
}

/// Write an acknowledgement.
pub fn write_response(stream: &mut impl Write, retval: i64, payload: &[u8]) -> std::io::Result<()> {
    let body_len = 8 + payload.len();
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    out.extend_from_slice(&retval.to_le_bytes());
    out.extend_from_slice(payload);
    stream.write_all(&out)
}

/// Read an acknowledgement (client side).
pub fn read_response(stream: &mut impl Read) -> std::io::Result<(i64, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len < 8 || len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad response length",
        ));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    let retval = i64::from_le_bytes(body[..8].try_into().unwrap());
    Ok((retval, body[8..].to_vec()))
}

/// DMA transfer request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaXferArgs {
    pub src_kind: u32,
    pub src_pid: Pid,
    pub src_addr: u64,
    pub dst_kind: u32,
    pub dst_pid: Pid,
    pub dst_addr: u64,
    pub len: u64,
}

impl DmaXferArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        out.extend_from_slice(&self.src_kind.to_le_bytes());
        out.extend_from_slice(&self.src_pid.to_le_bytes());
        out.extend_from_slice(&self.src_addr.to_le_bytes());
        out.extend_from_slice(&self.dst_kind.to_le_bytes());
        out.extend_from_slice(&self.dst_pid.to_le_bytes());
        out.extend_from_slice(&self.dst_addr.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        let mut rd = WireReader::new(payload);
        Some(Self {
            src_kind: rd.u32()?,
            src_pid: rd.i32()?,
            src_addr: rd.u64()?,
            dst_kind: rd.u32()?,
            dst_pid: rd.i32()?,
            dst_addr: rd.u64()?,
            len: rd.u64()?,
        })
    }
}

/// Signal-send payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSendArgs {
    pub signum: i32,
    pub info: SigInfo,
}

impl SignalSendArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(36);
        out.extend_from_slice(&self.signum.to_le_bytes());
        out.extend_from_slice(&self.info.signo.to_le_bytes());
        out.extend_from_slice(&self.info.errno.to_le_bytes());
        out.extend_from_slice(&self.info.code.to_le_bytes());
        out.extend_from_slice(&self.info.pid.to_le_bytes());
        out.extend_from_slice(&self.info.uid.to_le_bytes());
        out.extend_from_slice(&self.info.addr.to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        let mut rd = WireReader::new(payload);
        let signum = rd.i32()?;
        let signo = rd.i32()?;
        let errno = rd.i32()?;
        let code = rd.i32()?;
        let pid = rd.i32()?;
        let uid = rd.u32()?;
        let addr = rd.u64()?;
        let mut info = SigInfo::new(signo, code, pid, uid);
        info.errno = errno;
        info.addr = addr;
        Some(Self { signum, info })
    }
}

/// sigaction payload; `has_new` selects whether a new action is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigactionArgs {
    pub signum: i32,
    pub has_new: bool,
    pub handler: u64,
    pub flags: u32,
    pub mask: u64,
}

impl SigactionArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(25);
        out.extend_from_slice(&self.signum.to_le_bytes());
        out.push(self.has_new as u8);
        out.extend_from_slice(&self.handler.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.mask.to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        let mut rd = WireReader::new(payload);
        Some(Self {
            signum: rd.i32()?,
            has_new: rd.u8()? != 0,
            handler: rd.u64()?,
            flags: rd.u32()?,
            mask: rd.u64()?,
        })
    }
}

/// sigprocmask payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigprocmaskArgs {
    pub how: i32,
    pub store_mask: bool,
    pub has_set: bool,
    pub newset: u64,
}

impl SigprocmaskArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14);
        out.extend_from_slice(&self.how.to_le_bytes());
        out.push(self.store_mask as u8);
        out.push(self.has_set as u8);
        out.extend_from_slice(&self.newset.to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        let mut rd = WireReader::new(payload);
        Some(Self {
            how: rd.i32()?,
            store_mask: rd.u8()? != 0,
            has_set: rd.u8()? != 0,
            newset: rd.u64()?,
        })
    }
}

/// sigaltstack payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigaltstackArgs {
    pub has_new: bool,
    pub sp: u64,
    pub flags: i32,
    pub size: u64,
}

impl SigaltstackArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(21);
        out.push(self.has_new as u8);
        out.extend_from_slice(&self.sp.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        let mut rd = WireReader::new(payload);
        Some(Self {
            has_new: rd.u8()? != 0,
            sp: rd.u64()?,
            flags: rd.i32()?,
            size: rd.u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_round_trip() {
        let frame = RequestFrame {
            cmd: CMD_SIGPENDING,
            pid: 4321,
            payload: vec![1, 2, 3],
        };
        let bytes = frame.encode();
        let body = &bytes[4..];
        assert_eq!(RequestFrame::decode(body).unwrap(), frame);

        let mut cursor = std::io::Cursor::new(bytes);
        let read = read_request(&mut cursor).unwrap().unwrap();
        assert_eq!(read, frame);
    }

    #[test]
    fn test_read_request_eof_is_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_request(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_response_round_trip() {
        let mut buf = Vec::new();
        write_response(&mut buf, -22, &[9, 9]).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (retval, payload) = read_response(&mut cursor).unwrap();
        assert_eq!(retval, -22);
        assert_eq!(payload, vec![9, 9]);
    }

    #[test]
    fn test_dma_args_round_trip() {
        let args = DmaXferArgs {
            src_kind: 2,
            src_pid: 10,
            src_addr: 0x7f00_0000_1000,
            dst_kind: 0,
            dst_pid: 11,
            dst_addr: 0x6000_0000,
            len: 4096,
        };
        assert_eq!(DmaXferArgs::decode(&args.encode()).unwrap(), args);
    }

    #[test]
    fn test_sigaction_args_round_trip() {
        let args = SigactionArgs {
            signum: 11,
            has_new: true,
            handler: 0x6000_2000,
            flags: 0x0800_0000,
            mask: 0xffff,
        };
        assert_eq!(SigactionArgs::decode(&args.encode()).unwrap(), args);
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let args = SigprocmaskArgs {
            how: 0,
            store_mask: false,
            has_set: true,
            newset: 5,
        };
        let bytes = args.encode();
        assert!(SigprocmaskArgs::decode(&bytes[..bytes.len() - 1]).is_none());
    }
}
