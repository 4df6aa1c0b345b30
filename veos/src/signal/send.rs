//! Signal generation and mask management.
//!
//! `send_signal` is the single entry point through which a signal reaches a
//! task, whether it came from the pseudo process, from a hardware exception,
//! or from the service itself. Lock order here is the global one: tasklist
//! lock, then the group's signal lock, then the task's own locks.

use std::sync::Arc;

use log::debug;

use crate::node::VeNode;
use crate::signal::{
    is_stop_signal, SigAction, SigAltStack, SigHandler, SigSet, SigSource, SIGCONT, SIGINT,
    SIGRTMIN, SIG_BLOCK, SIG_SETMASK, SIG_UNBLOCK, SS_DISABLE, SS_ONSTACK, STOP_FLUSH_MASK,
};
use crate::error::{Result, VeosError};
use crate::signal::frame::VE_MINSIGSTKSZ;
use crate::task::regs::{EXS_EXCEPTION, SR_STACK_PTR};
use crate::task::{GroupState, Pid, SigHandState, SigRecord, TaskState, VeTask, VforkState};

/// Group-walk stop modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Stop every thread (default action of a stop signal).
    Stopping,
    /// Mirror a host-side stop; abandons the walk when the pseudo process
    /// turns out not to be stopped.
    StopProc,
    /// Freeze the group for a core dump, skipping the requesting task.
    CleanThread,
}

/// Set a task RUNNING unless a vfork or MONC processing is in flight.
pub(crate) fn start_task(task: &Arc<VeTask>) {
    let mut main = task.main.lock();
    if main.vfork == VforkState::Ongoing {
        debug!("SIGCONT for {} with vfork ongoing", task.pid);
        main.state = TaskState::Wait;
    } else if main.regs.exs & EXS_EXCEPTION != 0 && main.block_received {
        debug!("MONC in progress, {} set to WAIT", task.pid);
        main.state = TaskState::Wait;
    } else if main.state != TaskState::Running {
        main.state = TaskState::Running;
    }
}

/// Stop one task. Returns false when a `StopProc` walk must be abandoned.
pub(crate) fn stop_task(node: &VeNode, task: &Arc<VeTask>, mode: StopMode) -> bool {
    if mode == StopMode::StopProc && !node.proc.is_actually_stopped(task.pid) {
        debug!("pseudo process {} not stopped, leaving task alone", task.pid);
        return false;
    }
    task.set_state(TaskState::Stop);
    // Halt the core and fetch the latest context when the task is on it, so
    // stop-class signals and core dumps observe current registers.
    if let Some(current) = node.current_on_core(task.core_id) {
        if Arc::ptr_eq(&current, task) {
            node.sched.halt_core_and_save(task);
        }
    }
    true
}

/// Drop pending stop-class signals and wake the whole group. The caller
/// holds the group signal lock.
pub(crate) fn group_continue(sh: &mut SigHandState, task: &Arc<VeTask>) {
    for member in task.thread_group() {
        let removed = {
            let mut sig = member.sig.lock();
            let removed = sig.pending.flush_matching(STOP_FLUSH_MASK);
            sig.recalc_sigpending();
            removed
        };
        sh.pending_count = sh.pending_count.saturating_sub(removed as u64);
        start_task(&member);
    }
}

/// Remove pending records of `signo` group-wide. The caller holds the group
/// signal lock.
pub(crate) fn group_flush(sh: &mut SigHandState, task: &Arc<VeTask>, signo: i32) {
    for member in task.thread_group() {
        let removed = {
            let mut sig = member.sig.lock();
            let removed = sig.pending.flush_signo(signo);
            sig.recalc_sigpending();
            removed
        };
        sh.pending_count = sh.pending_count.saturating_sub(removed as u64);
    }
}

/// Stop the thread group.
pub fn group_stop(node: &VeNode, task: &Arc<VeTask>, mode: StopMode) {
    for member in task.thread_group() {
        if mode == StopMode::CleanThread && member.pid == task.pid {
            continue;
        }
        if mode == StopMode::StopProc && member.state() == TaskState::Stop {
            continue;
        }
        if !stop_task(node, &member, mode) {
            debug!("abandoning group stop walk at {}", member.pid);
            return;
        }
    }
}

/// Generate `signum` for `task`.
pub fn send_signal(
    node: &VeNode,
    task: &Arc<VeTask>,
    source: SigSource,
    signum: i32,
    hw_origin: bool,
) -> Result<()> {
    let _tasklist = node.tasklist_lock.lock();
    let mut sh = task.sighand.siglock.lock();

    if sh.group_state == GroupState::Coredump {
        // Only SIGINT is recorded while the dump runs; everything else is
        // dropped.
        if signum == SIGINT {
            sh.got_sigint = true;
        } else {
            debug!("coredump in progress, signal {signum} ignored");
        }
        return Ok(());
    } else if signum == SIGCONT {
        group_continue(&mut sh, task);
    } else if is_stop_signal(signum) {
        group_flush(&mut sh, task, SIGCONT);
    }

    let mut sig = task.sig.lock();

    // Exactly one queued instance per non-realtime signal.
    if signum < SIGRTMIN && sig.pending.set.contains(signum) {
        debug!("non-rt signal {signum} already pending for {}", task.pid);
        return Ok(());
    }

    let override_rlimit = match source {
        SigSource::Priv => true,
        SigSource::Info(info) => info.code >= 0,
    };

    sh.pending_count += 1;
    if override_rlimit || sh.pending_count <= sh.rlim_sigpending {
        let info = match source {
            SigSource::Priv => crate::signal::SigInfo::kernel(signum),
            SigSource::Info(mut info) => {
                if hw_origin {
                    // Attach the faulting instruction address.
                    info.addr = task.main.lock().regs.ice;
                }
                info
            }
        };
        sig.pending.queue.push(SigRecord {
            signo: signum,
            info,
            hw_origin,
        });
    } else {
        sh.pending_count -= 1;
        debug!(
            "{}: RLIMIT_SIGPENDING reached, dropped info for signal {signum}",
            task.pid
        );
    }

    sig.pending.set.add(signum);
    let pending_now = sig.recalc_sigpending();
    drop(sig);
    drop(sh);
    drop(_tasklist);

    if !pending_now {
        return Ok(());
    }

    let from_priv = matches!(source, SigSource::Priv);
    if hw_origin && !from_priv {
        // Synchronous signal: get the target schedulable immediately.
        node.sched.unblock(task);
    } else if !hw_origin && !from_priv {
        if let Some(current) = node.current_on_core(task.core_id) {
            if Arc::ptr_eq(&current, task) {
                node.sched.kick_core(task.core_id);
            }
        }
    }
    Ok(())
}

/// Handle a signal mapped from a hardware exception: ignored or blocked
/// exception signals fall back to the default disposition and are unblocked
/// so the fault cannot be masked away.
pub fn handle_hw_exception(
    node: &VeNode,
    task: &Arc<VeTask>,
    info: crate::signal::SigInfo,
    signum: i32,
) -> Result<()> {
    {
        let mut sh = task.sighand.siglock.lock();
        let mut sig = task.sig.lock();
        let ignored = sh.actions[(signum - 1) as usize].handler == SigHandler::Ignore;
        let blocked = sig.blocked.contains(signum);
        if ignored || blocked {
            sh.actions[(signum - 1) as usize].handler = SigHandler::Default;
            if blocked {
                sig.blocked.del(signum);
            }
        }
        task.main.lock().syncsignal = true;
    }
    send_signal(node, task, SigSource::Info(info), signum, true)
}

/// Whether `caller` may signal `callee` through the external kill path.
/// Only the two reserved realtime signals arrive this way.
pub fn check_kill_permission(
    node: &VeNode,
    caller_pid: Pid,
    caller_uid: u32,
    callee: &Arc<VeTask>,
    sig: i32,
) -> Result<()> {
    if sig != SIGRTMIN - 1 && sig != SIGRTMIN - 2 {
        return Err(VeosError::PermissionDenied {
            operation: "signal send",
        });
    }
    let callee_info = node.proc.status(callee.pid)?;
    let caller_info = node.proc.status(caller_pid)?;
    let caller = node
        .registry
        .lookup(caller_pid)
        .ok_or(VeosError::NotFound {
            resource: "task",
            id: caller_pid as u64,
        })?;

    if Arc::ptr_eq(&caller.group_leader(), &callee.group_leader()) {
        return Ok(());
    }
    if caller_info.euid == callee_info.suid
        || caller_info.euid == callee.uid
        || caller_uid == callee_info.suid
        || caller_uid == callee.uid
    {
        return Ok(());
    }
    if caller_info.has_cap_kill() {
        return Ok(());
    }
    Err(VeosError::PermissionDenied {
        operation: "signal send",
    })
}

/// Install the scrubbed `newset` as the blocked mask and recompute the
/// pending flag.
pub fn set_current_blocked(task: &Arc<VeTask>, newset: SigSet) {
    let mut sig = task.sig.lock();
    let mut mask = newset;
    mask.scrub_unblockable();
    sig.blocked = mask;
    sig.recalc_sigpending();
}

/// sigaction: install `new` (when present) and return the previous action.
/// A newly ignoring disposition flushes matching pending records group-wide.
pub fn do_sigaction(
    node: &VeNode,
    task: &Arc<VeTask>,
    signum: i32,
    new: Option<SigAction>,
) -> SigAction {
    let _tasklist = node.tasklist_lock.lock();
    let mut sh = task.sighand.siglock.lock();
    let old = sh.actions[(signum - 1) as usize];
    if let Some(action) = new {
        sh.actions[(signum - 1) as usize] = action;
        if action.ignores(signum) {
            debug!("new action ignores signal {signum}, flushing pending records");
            group_flush(&mut sh, task, signum);
        }
    }
    old
}

/// sigprocmask: returns the old mask. With `store_mask`, the new mask is
/// only recorded as the saved mask for a later sigsuspend-style delivery.
pub fn do_sigprocmask(
    task: &Arc<VeTask>,
    how: i32,
    newset: Option<SigSet>,
    store_mask: bool,
) -> Result<SigSet> {
    let old = task.sig.lock().blocked;

    if store_mask {
        let mut sig = task.sig.lock();
        let mut mask = newset.unwrap_or(old);
        mask.scrub_unblockable();
        sig.saved_mask = mask;
        sig.mask_saved = true;
        return Ok(old);
    }

    if let Some(set) = newset {
        let new_blocked = match how {
            SIG_BLOCK => old.union(set),
            SIG_UNBLOCK => old.without(set),
            SIG_SETMASK => set,
            _ => {
                return Err(VeosError::InvalidArgument {
                    name: "how",
                    value: "not one of SIG_BLOCK/SIG_UNBLOCK/SIG_SETMASK",
                })
            }
        };
        set_current_blocked(task, new_blocked);
    }
    Ok(old)
}

/// sigpending: signals both pending and blocked.
pub fn do_sigpending(task: &Arc<VeTask>) -> SigSet {
    let sig = task.sig.lock();
    sig.pending.set.intersect(sig.blocked)
}

/// sigsuspend: save the current mask and install `mask` until the next
/// delivery restores it.
pub fn do_sigsuspend(task: &Arc<VeTask>, mask: SigSet) {
    {
        let mut sig = task.sig.lock();
        let saved = sig.blocked;
        sig.saved_mask = saved;
        sig.mask_saved = true;
    }
    set_current_blocked(task, mask);
}

/// Whether the task currently executes on its alternate signal stack.
pub fn on_sig_stack(task: &Arc<VeTask>) -> bool {
    let sig = task.sig.lock();
    let main = task.main.lock();
    let sp = main.regs.sr[SR_STACK_PTR];
    sp > sig.altstack.sp && sp - sig.altstack.sp <= sig.altstack.size
}

/// sigaltstack read half.
pub fn getold_sas(task: &Arc<VeTask>) -> SigAltStack {
    let (sp, size) = {
        let sig = task.sig.lock();
        (sig.altstack.sp, sig.altstack.size)
    };
    let flags = if size == 0 {
        SS_DISABLE
    } else if on_sig_stack(task) {
        SS_ONSTACK
    } else {
        0
    };
    SigAltStack { sp, flags, size }
}

/// sigaltstack write half.
pub fn setnew_sas(task: &Arc<VeTask>, new: SigAltStack) -> Result<()> {
    task.mm
        .translate(new.sp)
        .map_err(|_| VeosError::TranslationFault { addr: new.sp })?;
    if on_sig_stack(task) {
        return Err(VeosError::PermissionDenied {
            operation: "changing an active alternate stack",
        });
    }
    if new.flags != 0 && new.flags != SS_ONSTACK && new.flags != SS_DISABLE {
        return Err(VeosError::InvalidArgument {
            name: "ss_flags",
            value: "not one of 0/SS_ONSTACK/SS_DISABLE",
        });
    }
    let mut sig = task.sig.lock();
    if new.flags == SS_DISABLE {
        sig.altstack = SigAltStack::default();
    } else {
        if new.size < VE_MINSIGSTKSZ {
            return Err(VeosError::OutOfMemory {
                requested: new.size,
            });
        }
        sig.altstack = SigAltStack {
            sp: new.sp,
            flags: 0,
            size: new.size,
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{SigInfo, SIGSEGV, SIGTERM, SIGUSR1, SI_USER};
    use crate::task::regs::SR_STACK_PTR;
    use crate::testing::TestRig;

    #[test]
    fn test_sigsuspend_saves_and_installs_mask() {
        let rig = TestRig::new();
        let task = rig.spawn_process(400);
        let _ = rig;

        let mut old = SigSet::empty();
        old.add(SIGTERM);
        set_current_blocked(&task, old);

        let mut susp = SigSet::empty();
        susp.add(SIGUSR1);
        do_sigsuspend(&task, susp);

        let sig = task.sig.lock();
        assert!(sig.mask_saved);
        assert_eq!(sig.saved_mask, old);
        assert!(sig.blocked.contains(SIGUSR1));
        assert!(!sig.blocked.contains(SIGTERM));
    }

    #[test]
    fn test_sigpending_reports_blocked_pending_intersection() {
        let rig = TestRig::new();
        let task = rig.spawn_process(401);

        let mut mask = SigSet::empty();
        mask.add(SIGTERM);
        set_current_blocked(&task, mask);
        send_signal(
            &rig.node,
            &task,
            SigSource::Info(SigInfo::new(SIGTERM, SI_USER, 1, 0)),
            SIGTERM,
            false,
        )
        .unwrap();
        send_signal(
            &rig.node,
            &task,
            SigSource::Info(SigInfo::new(SIGUSR1, SI_USER, 1, 0)),
            SIGUSR1,
            false,
        )
        .unwrap();

        let pending = do_sigpending(&task);
        assert!(pending.contains(SIGTERM));
        assert!(!pending.contains(SIGUSR1));
    }

    #[test]
    fn test_new_ignoring_action_flushes_pending_records() {
        let rig = TestRig::new();
        let task = rig.spawn_process(402);

        let mut mask = SigSet::empty();
        mask.add(SIGUSR1);
        set_current_blocked(&task, mask);
        send_signal(
            &rig.node,
            &task,
            SigSource::Info(SigInfo::new(SIGUSR1, SI_USER, 1, 0)),
            SIGUSR1,
            false,
        )
        .unwrap();
        assert_eq!(task.sig.lock().queue_len(SIGUSR1), 1);

        do_sigaction(
            &rig.node,
            &task,
            SIGUSR1,
            Some(SigAction {
                handler: SigHandler::Ignore,
                flags: Default::default(),
                mask: SigSet::empty(),
            }),
        );
        assert_eq!(task.sig.lock().queue_len(SIGUSR1), 0);
    }

    #[test]
    fn test_hw_exception_unblocks_and_resets_ignored_handler() {
        let rig = TestRig::new();
        let task = rig.spawn_process(403);

        task.sighand.siglock.lock().actions[(SIGSEGV - 1) as usize].handler = SigHandler::Ignore;
        {
            let mut sig = task.sig.lock();
            sig.blocked.add(SIGSEGV);
        }
        let mut info = SigInfo::new(SIGSEGV, SI_USER, 0, 0);
        info.code = 1;
        task.main.lock().regs.ice = 0x6000_0008;

        handle_hw_exception(&rig.node, &task, info, SIGSEGV).unwrap();

        assert_eq!(
            task.sighand.siglock.lock().actions[(SIGSEGV - 1) as usize].handler,
            SigHandler::Default
        );
        let sig = task.sig.lock();
        assert!(!sig.blocked.contains(SIGSEGV));
        let rec = sig
            .pending
            .queue
            .iter()
            .find(|r| r.signo == SIGSEGV)
            .expect("queued");
        assert!(rec.hw_origin);
        assert_eq!(rec.info.addr, 0x6000_0008);
        assert!(task.main.lock().syncsignal);
    }

    #[test]
    fn test_kill_permission_rules() {
        let rig = TestRig::new();
        let caller = rig.spawn_process(404);
        let callee = rig.spawn_process(405);
        let _ = caller;

        // Wrong signal number is rejected outright.
        assert!(check_kill_permission(&rig.node, 404, 1000, &callee, SIGTERM).is_err());
        // Matching uid (FakeProc reports euid 1000) authorizes.
        assert!(check_kill_permission(&rig.node, 404, 1000, &callee, SIGRTMIN - 1).is_ok());
        // Unknown caller task fails lookup.
        assert!(check_kill_permission(&rig.node, 777, 1000, &callee, SIGRTMIN - 1).is_err());
    }

    #[test]
    fn test_setnew_sas_validation() {
        let rig = TestRig::new();
        let task = rig.spawn_process(406);
        let _ = rig;

        // Unmapped stack pointer.
        let err = setnew_sas(
            &task,
            SigAltStack {
                sp: 64 * 1024 * 1024,
                flags: 0,
                size: VE_MINSIGSTKSZ,
            },
        )
        .unwrap_err();
        assert!(matches!(err, VeosError::TranslationFault { .. }));

        // Too small.
        let err = setnew_sas(
            &task,
            SigAltStack {
                sp: 0x10_0000,
                flags: 0,
                size: VE_MINSIGSTKSZ - 8,
            },
        )
        .unwrap_err();
        assert!(matches!(err, VeosError::OutOfMemory { .. }));

        // Bad flags.
        let err = setnew_sas(
            &task,
            SigAltStack {
                sp: 0x10_0000,
                flags: 7,
                size: VE_MINSIGSTKSZ,
            },
        )
        .unwrap_err();
        assert!(matches!(err, VeosError::InvalidArgument { .. }));

        // Valid install, then a change while active is refused.
        setnew_sas(
            &task,
            SigAltStack {
                sp: 0x10_0000,
                flags: 0,
                size: VE_MINSIGSTKSZ,
            },
        )
        .unwrap();
        task.main.lock().regs.sr[SR_STACK_PTR] = 0x10_0000 + 64;
        let err = setnew_sas(
            &task,
            SigAltStack {
                sp: 0x20_0000,
                flags: 0,
                size: VE_MINSIGSTKSZ,
            },
        )
        .unwrap_err();
        assert!(matches!(err, VeosError::PermissionDenied { .. }));

        // SS_DISABLE clears the descriptor.
        task.main.lock().regs.sr[SR_STACK_PTR] = 0x40_0000;
        setnew_sas(
            &task,
            SigAltStack {
                sp: 0,
                flags: SS_DISABLE,
                size: 0,
            },
        )
        .unwrap();
        assert_eq!(task.sig.lock().altstack, SigAltStack::default());
    }
}
