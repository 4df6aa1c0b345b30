//! Signal delivery pipeline and sigreturn.
//!
//! The scheduler invokes `do_signal` when a task with `sigpending` set is
//! about to run. Delivery either consumes the signal in the service (ignore,
//! stop, terminate, core dump) or installs the registered handler by writing
//! a frame to the VE stack and rewriting the task's registers so the next
//! dispatch enters the handler. `restore_context` undoes the rewrite when
//! the handler returns through the trampoline.

use std::sync::Arc;

use log::{debug, error, info};

use crate::dma::{DmaEndpoint, DmaStatus};
use crate::error::{Result, VeosError};
use crate::node::VeNode;
use crate::signal::coredump;
use crate::signal::frame::{SigFrame, SigStack, HANDLER_STACK_FRAME, TRAMPOLINE};
use crate::signal::send::{group_stop, send_signal, set_current_blocked, StopMode};
use crate::signal::{
    default_action_dumps, default_action_ignores, default_action_stops, SigAction, SigHandler,
    SigInfo, SigSet, SigSource, SIGKILL, SIGSEGV, SS_ONSTACK, SYNCHRONOUS_MASK,
};
use crate::task::regs::{SR_ARG1, SR_ARG2, SR_LINK, SR_OUTER, SR_RETVAL, SR_STACK_LIMIT,
    SR_STACK_PTR};
use crate::task::{GroupState, SigHandState, TaskSignals, TaskState, VeTask};

/// Interrupted-syscall sentinels in SR0, Linux internal numbering.
pub const ERESTARTSYS: i64 = 512;
pub const ENORESTART: i64 = 514;

/// Outcome of one `do_signal` pass, consumed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A handler frame was installed; dispatch the task.
    Handled,
    /// Nothing to deliver; dispatch the task.
    NoSignal,
    /// The group stopped; do not dispatch.
    Stopped,
    /// The task was terminated (or a core dump is running); do not dispatch.
    Terminated,
    /// Frame setup failed; a forced SIGSEGV is pending.
    Failed,
}

enum GotSignal {
    None,
    Handler {
        signum: i32,
        action: SigAction,
        info: SigInfo,
        hw_origin: bool,
    },
    Stopped,
    Terminated,
}

/// Choose the next deliverable signal: synchronous fault signals first,
/// otherwise the lowest-numbered unblocked pending one.
fn next_signal(sig: &TaskSignals) -> Option<i32> {
    let effective = sig.pending.set.without(sig.blocked);
    let sync = effective.intersect(SYNCHRONOUS_MASK);
    if !sync.is_empty() {
        sync.lowest()
    } else {
        effective.lowest()
    }
}

/// Multiple tasks of a dumping group must not start a second dump; any
/// late requestor is parked in STOP instead.
fn may_start_dump(sh: &SigHandState, task: &Arc<VeTask>) -> bool {
    if sh.group_state == GroupState::Coredump {
        task.set_state(TaskState::Stop);
        return false;
    }
    true
}

fn get_signal(node: &Arc<VeNode>, task: &Arc<VeTask>) -> GotSignal {
    let mut sh = task.sighand.siglock.lock();

    if !may_start_dump(&sh, task) {
        debug!("core dump ongoing for {}", task.pid);
        return GotSignal::Terminated;
    }

    loop {
        let mut sig = task.sig.lock();
        let Some(signum) = next_signal(&sig) else {
            sig.sigpending = false;
            return GotSignal::None;
        };
        let (info, hw_origin, dequeued) = sig.pending.collect(signum);
        if dequeued {
            sh.pending_count = sh.pending_count.saturating_sub(1);
        }
        let action = sh.actions[(signum - 1) as usize];

        match action.handler {
            SigHandler::Ignore => continue,
            SigHandler::Handler(_) => {
                sig.sigpending = false;
                return GotSignal::Handler {
                    signum,
                    action,
                    info,
                    hw_origin,
                };
            }
            SigHandler::Default => {}
        }

        if default_action_ignores(signum) {
            continue;
        }
        if default_action_stops(signum) {
            debug!("default action stops the group, signal {signum}");
            sig.sigpending = false;
            drop(sig);
            group_stop(node, task, StopMode::Stopping);
            return GotSignal::Stopped;
        }
        drop(sig);
        if default_action_dumps(signum) {
            debug!("default action dumps core, signal {signum}");
            sh.group_state = GroupState::Coredump;
            task.set_state(TaskState::Stop);
            if coredump::spawn_dumper(node.clone(), task.clone(), info, signum, hw_origin).is_ok()
            {
                return GotSignal::Terminated;
            }
            // Dump thread creation failed: fall through and terminate.
            error!("failed to start the core dump worker for {}", task.pid);
        }
        // Default action terminates the pseudo process: the original signal
        // for synchronous faults, SIGKILL otherwise.
        let kill_sig = if hw_origin { signum } else { SIGKILL };
        info!("terminating pseudo process {} with signal {kill_sig}", task.pid);
        let _ = node.pseudo.kill(task.pid, kill_sig);
        return GotSignal::Terminated;
    }
}

/// Compute the frame location, fill and write the frame, and rewrite the
/// task's registers for handler entry.
fn setup_frame(
    node: &Arc<VeNode>,
    task: &Arc<VeTask>,
    signum: i32,
    action: &SigAction,
    info: SigInfo,
    hw_origin: bool,
) -> Result<()> {
    let frame_size = core::mem::size_of::<SigFrame>() as u64;
    let mut frame = SigFrame::new_boxed();
    frame.tramp = TRAMPOLINE;
    frame.info = info;
    frame.flag = hw_origin as u64;
    frame.signum = signum as u64;
    frame.lshm_area = task.sighand.lshm_snapshot(task.lshm_offset);

    let (frame_va, frame_pa, on_altstack, altstack_sp) = {
        let sig = task.sig.lock();
        let main = task.main.lock();
        let sp = main.regs.sr[SR_STACK_PTR];
        let on_stack = sp > sig.altstack.sp && sp - sig.altstack.sp <= sig.altstack.size;

        let (frame_va, on_altstack) = if !on_stack
            && action.flags.contains(crate::signal::SaFlags::ONSTACK)
            && sig.altstack.size != 0
        {
            (sig.altstack.sp + sig.altstack.size - frame_size, true)
        } else {
            (sp - frame_size, false)
        };
        let frame_pa = task.mm.translate(frame_va)?;

        frame.uc.mcontext = *main.regs;
        frame.uc.sigmask = if sig.mask_saved {
            sig.saved_mask.bits()
        } else {
            sig.blocked.bits()
        };
        frame.uc.stack = SigStack::new(
            sig.altstack.sp,
            sig.altstack.size,
            if on_stack { SS_ONSTACK } else { 0 },
        );
        (frame_va, frame_pa, on_altstack, sig.altstack.sp)
    };

    debug!(
        "signal {signum} frame for {}: va {frame_va:#x} pa {frame_pa:#x} altstack {on_altstack}",
        task.pid
    );

    let status = node.dma().xfer(
        node.translator().as_ref(),
        DmaEndpoint::host_virt(node.host_pid, frame.as_bytes().as_ptr() as u64),
        DmaEndpoint::ve_phys(frame_pa),
        frame_size,
    )?;
    if status != DmaStatus::Ok {
        error!("unable to write the signal frame for {}", task.pid);
        return Err(VeosError::TranslationFault { addr: frame_va });
    }

    let mut main = task.main.lock();
    let handler = action.handler.to_raw();
    main.regs.ic = handler;
    main.regs.sr[SR_OUTER] = handler;
    main.regs.sr[SR_RETVAL] = signum as u64;
    main.regs.sr[SR_ARG1] = frame_va + SigFrame::siginfo_offset();
    main.regs.sr[SR_ARG2] = frame_va + SigFrame::ucontext_offset();
    // The link register points at the trampoline so the handler's return
    // executes sigreturn.
    main.regs.sr[SR_LINK] = frame_va;
    main.regs.sr[SR_STACK_PTR] = frame_va - HANDLER_STACK_FRAME;
    if on_altstack {
        main.regs.sr[SR_STACK_LIMIT] = altstack_sp;
    }
    main.regs_dirty = true;
    Ok(())
}

/// Install the handler for a dequeued signal: restart bookkeeping, frame
/// setup, handler-table and mask updates.
fn handle_signal(
    node: &Arc<VeNode>,
    task: &Arc<VeTask>,
    signum: i32,
    action: SigAction,
    info: SigInfo,
    hw_origin: bool,
) -> Result<()> {
    {
        let mut main = task.main.lock();
        let sr0 = main.regs.sr[SR_RETVAL] as i64;
        if sr0 == -ENORESTART {
            main.regs.sr[SR_RETVAL] = (-(libc::EINTR as i64)) as u64;
        } else if sr0 == -ERESTARTSYS {
            if action.flags.contains(crate::signal::SaFlags::RESTART) {
                debug!("restarting syscall, SA_RESTART set");
                main.regs.ic = main.regs.ic.wrapping_sub(8);
            } else {
                main.regs.sr[SR_RETVAL] = (-(libc::EINTR as i64)) as u64;
            }
        }
    }

    setup_frame(node, task, signum, &action, info, hw_origin).map_err(|err| {
        error!("failed to set up the signal frame: {err}");
        force_sigsegv(node, task);
        err
    })?;

    if action.flags.contains(crate::signal::SaFlags::RESETHAND) {
        task.sighand.siglock.lock().actions[(signum - 1) as usize].handler = SigHandler::Default;
    }

    let mut blocked = {
        let sig = task.sig.lock();
        sig.blocked.union(action.mask)
    };
    if !action.flags.contains(crate::signal::SaFlags::NODEFER) {
        blocked.add(signum);
    }
    task.sig.lock().mask_saved = false;
    set_current_blocked(task, blocked);
    Ok(())
}

/// Deliver the next pending signal to `task`.
pub fn do_signal(node: &Arc<VeNode>, task: &Arc<VeTask>) -> Delivery {
    match get_signal(node, task) {
        GotSignal::Handler {
            signum,
            action,
            info,
            hw_origin,
        } => match handle_signal(node, task, signum, action, info, hw_origin) {
            Ok(()) => {
                debug!("signal {signum} handler installed for {}", task.pid);
                Delivery::Handled
            }
            Err(_) => Delivery::Failed,
        },
        outcome @ (GotSignal::None | GotSignal::Stopped) => {
            // No handler ran: an interrupted syscall restarts regardless of
            // SA_RESTART, and a saved sigsuspend mask goes back into effect.
            {
                let mut main = task.main.lock();
                let sr0 = main.regs.sr[SR_RETVAL] as i64;
                if sr0 == -ERESTARTSYS || sr0 == -ENORESTART {
                    main.regs.ic = main.regs.ic.wrapping_sub(8);
                }
            }
            let saved = {
                let mut sig = task.sig.lock();
                if sig.mask_saved {
                    sig.mask_saved = false;
                    Some(sig.saved_mask)
                } else {
                    None
                }
            };
            if let Some(mask) = saved {
                set_current_blocked(task, mask);
            }
            if matches!(outcome, GotSignal::Stopped) {
                info!("task {} stopped by signal", task.pid);
                Delivery::Stopped
            } else {
                Delivery::NoSignal
            }
        }
        GotSignal::Terminated => Delivery::Terminated,
    }
}

/// Forcefully deliver SIGSEGV with the default disposition, used when frame
/// setup or sigreturn cannot proceed. The handler is reset and the signal
/// unblocked so the process cannot wedge in handler-execution state.
pub fn force_sigsegv(node: &Arc<VeNode>, task: &Arc<VeTask>) {
    {
        let mut sh = task.sighand.siglock.lock();
        if sh.actions[(SIGSEGV - 1) as usize].handler != SigHandler::Default {
            sh.actions[(SIGSEGV - 1) as usize].handler = SigHandler::Default;
        }
        let mut sig = task.sig.lock();
        if sig.blocked.contains(SIGSEGV) {
            sig.blocked.del(SIGSEGV);
        }
    }
    if let Err(err) = send_signal(node, task, SigSource::Priv, SIGSEGV, false) {
        error!("failed to force SIGSEGV for {}: {err}", task.pid);
    }
}

/// sigreturn: read the frame back from the VE stack and restore the
/// pre-handler context.
pub fn restore_context(node: &Arc<VeNode>, task: &Arc<VeTask>) -> Result<()> {
    let frame_size = core::mem::size_of::<SigFrame>() as u64;
    let curr_sp = task.main.lock().regs.sr[SR_STACK_PTR];
    let frame_va = curr_sp + HANDLER_STACK_FRAME;

    let frame_pa = match task.mm.translate(frame_va) {
        Ok(pa) => pa,
        Err(err) => {
            error!("sigreturn frame translation failed for {}", task.pid);
            force_sigsegv(node, task);
            return Err(err);
        }
    };

    let mut frame = SigFrame::new_boxed();
    let read = node.dma().xfer(
        node.translator().as_ref(),
        DmaEndpoint::ve_phys(frame_pa),
        DmaEndpoint::host_virt(node.host_pid, frame.as_bytes_mut().as_mut_ptr() as u64),
        frame_size,
    );
    match read {
        Ok(DmaStatus::Ok) => {}
        _ => {
            error!("failed to read the signal frame back for {}", task.pid);
            force_sigsegv(node, task);
            return Err(VeosError::TranslationFault { addr: frame_va });
        }
    }

    {
        let mut main = task.main.lock();
        *main.regs = frame.uc.mcontext;
        main.regs_dirty = true;
    }
    task.sighand
        .lshm_restore(task.lshm_offset, &frame.lshm_area);
    {
        let mut sig = task.sig.lock();
        let mut mask = SigSet::from_bits(frame.uc.sigmask);
        mask.scrub_unblockable();
        sig.blocked = mask;
    }

    if frame.flag != 0 {
        info!(
            "fatal flag set in the restored frame, terminating pseudo process {}",
            task.pid
        );
        let _ = node.pseudo.kill(task.pid, frame.signum as i32);
        return Ok(());
    }

    let mut sig = task.sig.lock();
    if !sig.recalc_sigpending() {
        debug!("no signal pending for {} after sigreturn", task.pid);
    }
    Ok(())
}
