//! Request dispatcher and socket server.
//!
//! One thread per connected pseudo process. Every dispatched request holds
//! the node's handling-request lock on the read side, so shutdown (which
//! takes the write side) drains in-flight handlers before tearing anything
//! down. Handlers answer negated errnos; undecodable payloads indicate a
//! broken protocol layer and abort the service.

use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::dma::{DmaEndpoint, DmaStatus};
use crate::error::VeosError;
use crate::ipc::{
    read_request, write_response, DmaXferArgs, RequestFrame, SigactionArgs, SigaltstackArgs,
    SignalSendArgs, SigprocmaskArgs, WireReader, CMD_DMA_REQUEST, CMD_GETCONTEXT, CMD_SETCONTEXT,
    CMD_SIGACTION, CMD_SIGALTSTACK, CMD_SIGNAL_SEND, CMD_SIGPENDING, CMD_SIGPROCMASK,
    CMD_SIGSUSPEND,
};
use crate::node::VeNode;
use crate::signal::{
    deliver, send, SaFlags, SigAction, SigAltStack, SigHandler, SigSet, SigSource,
};
use crate::task::VeTask;

fn errno_of(err: &VeosError) -> i64 {
    err.errno()
}

/// Payloads that fail to decode mean the protocol layers disagree; that is
/// not recoverable per the error-handling contract.
fn decode_or_abort<T>(value: Option<T>, cmd: u32) -> T {
    match value {
        Some(v) => v,
        None => {
            error!("internal wire protocol error decoding command {cmd}");
            panic!("wire protocol mismatch on command {cmd}");
        }
    }
}

fn lookup_task(node: &Arc<VeNode>, pid: i32) -> Result<Arc<VeTask>, i64> {
    node.registry.lookup(pid).ok_or_else(|| {
        warn!("no task for pid {pid}");
        -(libc::ESRCH as i64)
    })
}

fn handle_dma_request(node: &Arc<VeNode>, frame: &RequestFrame) -> (i64, Vec<u8>) {
    let args = decode_or_abort(DmaXferArgs::decode(&frame.payload), frame.cmd);
    let endpoints = DmaEndpoint::from_wire(args.src_kind, args.src_pid, args.src_addr).and_then(
        |src| {
            DmaEndpoint::from_wire(args.dst_kind, args.dst_pid, args.dst_addr).map(|dst| (src, dst))
        },
    );
    let (src, dst) = match endpoints {
        Ok(pair) => pair,
        Err(err) => return (errno_of(&err), Vec::new()),
    };
    match node
        .dma()
        .xfer(node.translator().as_ref(), src, dst, args.len)
    {
        Ok(DmaStatus::Ok) => (0, Vec::new()),
        Ok(DmaStatus::Canceled) => (-(libc::ECANCELED as i64), Vec::new()),
        Ok(_) => (-(libc::EFAULT as i64), Vec::new()),
        Err(err) => (errno_of(&err), Vec::new()),
    }
}

fn handle_signal_send(node: &Arc<VeNode>, frame: &RequestFrame) -> (i64, Vec<u8>) {
    let args = decode_or_abort(SignalSendArgs::decode(&frame.payload), frame.cmd);
    let task = match lookup_task(node, frame.pid) {
        Ok(task) => task,
        Err(errno) => return (errno, Vec::new()),
    };
    match send::send_signal(node, &task, SigSource::Info(args.info), args.signum, false) {
        Ok(()) => (0, Vec::new()),
        Err(err) => (errno_of(&err), Vec::new()),
    }
}

fn handle_sigaction(node: &Arc<VeNode>, frame: &RequestFrame) -> (i64, Vec<u8>) {
    let args = decode_or_abort(SigactionArgs::decode(&frame.payload), frame.cmd);
    if args.signum < 1 || args.signum as usize > crate::signal::NSIG {
        return (-(libc::EINVAL as i64), Vec::new());
    }
    let task = match lookup_task(node, frame.pid) {
        Ok(task) => task,
        Err(errno) => return (errno, Vec::new()),
    };
    let new = args.has_new.then(|| SigAction {
        handler: SigHandler::from_raw(args.handler),
        flags: SaFlags::from_bits_truncate(args.flags),
        mask: SigSet::from_bits(args.mask),
    });
    let old = send::do_sigaction(node, &task, args.signum, new);
    let mut payload = Vec::with_capacity(20);
    payload.extend_from_slice(&old.handler.to_raw().to_le_bytes());
    payload.extend_from_slice(&old.flags.bits().to_le_bytes());
    payload.extend_from_slice(&old.mask.bits().to_le_bytes());
    (0, payload)
}

fn handle_sigprocmask(node: &Arc<VeNode>, frame: &RequestFrame) -> (i64, Vec<u8>) {
    let args = decode_or_abort(SigprocmaskArgs::decode(&frame.payload), frame.cmd);
    let task = match lookup_task(node, frame.pid) {
        Ok(task) => task,
        Err(errno) => return (errno, Vec::new()),
    };
    let newset = args.has_set.then(|| SigSet::from_bits(args.newset));
    match send::do_sigprocmask(&task, args.how, newset, args.store_mask) {
        Ok(old) => (0, old.bits().to_le_bytes().to_vec()),
        Err(err) => (errno_of(&err), Vec::new()),
    }
}

fn handle_sigpending(node: &Arc<VeNode>, frame: &RequestFrame) -> (i64, Vec<u8>) {
    let task = match lookup_task(node, frame.pid) {
        Ok(task) => task,
        Err(errno) => return (errno, Vec::new()),
    };
    let set = send::do_sigpending(&task);
    (0, set.bits().to_le_bytes().to_vec())
}

fn handle_sigsuspend(node: &Arc<VeNode>, frame: &RequestFrame) -> (i64, Vec<u8>) {
    let mut rd = WireReader::new(&frame.payload);
    let mask = decode_or_abort(rd.u64(), frame.cmd);
    let task = match lookup_task(node, frame.pid) {
        Ok(task) => task,
        Err(errno) => return (errno, Vec::new()),
    };
    send::do_sigsuspend(&task, SigSet::from_bits(mask));
    (0, Vec::new())
}

fn handle_sigaltstack(node: &Arc<VeNode>, frame: &RequestFrame) -> (i64, Vec<u8>) {
    let args = decode_or_abort(SigaltstackArgs::decode(&frame.payload), frame.cmd);
    let task = match lookup_task(node, frame.pid) {
        Ok(task) => task,
        Err(errno) => return (errno, Vec::new()),
    };
    let old = send::getold_sas(&task);
    if args.has_new {
        let new = SigAltStack {
            sp: args.sp,
            flags: args.flags,
            size: args.size,
        };
        if let Err(err) = send::setnew_sas(&task, new) {
            return (errno_of(&err), Vec::new());
        }
    }
    let mut payload = Vec::with_capacity(20);
    payload.extend_from_slice(&old.sp.to_le_bytes());
    payload.extend_from_slice(&old.flags.to_le_bytes());
    payload.extend_from_slice(&old.size.to_le_bytes());
    (0, payload)
}

fn handle_getcontext(node: &Arc<VeNode>, frame: &RequestFrame) -> (i64, Vec<u8>) {
    let task = match lookup_task(node, frame.pid) {
        Ok(task) => task,
        Err(errno) => return (errno, Vec::new()),
    };
    let main = task.main.lock();
    (0, main.regs.as_bytes().to_vec())
}

fn handle_setcontext(node: &Arc<VeNode>, frame: &RequestFrame) -> (i64, Vec<u8>) {
    let task = match lookup_task(node, frame.pid) {
        Ok(task) => task,
        Err(errno) => return (errno, Vec::new()),
    };
    match deliver::restore_context(node, &task) {
        Ok(()) => (0, Vec::new()),
        Err(err) => (errno_of(&err), Vec::new()),
    }
}

/// Dispatch one request. Returns the ack value and payload.
pub fn dispatch(node: &Arc<VeNode>, frame: &RequestFrame) -> (i64, Vec<u8>) {
    let _guard = node.handling_request_lock.read();
    debug!("request cmd {} from pid {}", frame.cmd, frame.pid);
    match frame.cmd {
        CMD_DMA_REQUEST => handle_dma_request(node, frame),
        CMD_SIGNAL_SEND => handle_signal_send(node, frame),
        CMD_SIGACTION => handle_sigaction(node, frame),
        CMD_SIGPROCMASK => handle_sigprocmask(node, frame),
        CMD_SIGPENDING => handle_sigpending(node, frame),
        CMD_SIGSUSPEND => handle_sigsuspend(node, frame),
        CMD_SIGALTSTACK => handle_sigaltstack(node, frame),
        CMD_GETCONTEXT => handle_getcontext(node, frame),
        CMD_SETCONTEXT => handle_setcontext(node, frame),
        other => {
            warn!("unknown command {other} from pid {}", frame.pid);
            (-(libc::EINVAL as i64), Vec::new())
        }
    }
}

fn client_loop(node: Arc<VeNode>, mut stream: UnixStream) {
    loop {
        if node.terminating() {
            return;
        }
        let frame = match read_request(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                warn!("dropping connection: {err}");
                return;
            }
        };
        let (retval, payload) = dispatch(&node, &frame);
        if let Err(err) = write_response(&mut stream, retval, &payload) {
            warn!("failed to send the acknowledgement: {err}");
            return;
        }
    }
}

/// Accept pseudo-process connections until shutdown.
pub fn serve(node: Arc<VeNode>, listener: UnixListener) {
    info!("serving requests on {}", node.config.socket_path.display());
    for stream in listener.incoming() {
        if node.terminating() {
            break;
        }
        match stream {
            Ok(stream) => {
                let node = node.clone();
                let _ = std::thread::Builder::new()
                    .name("veos-request".into())
                    .spawn(move || client_loop(node, stream));
            }
            Err(err) => {
                error!("accept failed: {err}");
                break;
            }
        }
    }
}
