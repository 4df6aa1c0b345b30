//! End-to-end signal scenarios: generation, delivery, sigreturn, stop and
//! continue, forced termination.

use std::sync::Arc;
use std::time::{Duration, Instant};

use veos::ipc::{self, server, RequestFrame, SigprocmaskArgs};
use veos::signal::deliver::{do_signal, restore_context, Delivery};
use veos::signal::frame::{HANDLER_STACK_FRAME, VE_MINSIGSTKSZ};
use veos::signal::send::{self, do_sigprocmask};
use veos::signal::{
    SaFlags, SigAction, SigAltStack, SigHandler, SigInfo, SigSet, SigSource, SIGCONT, SIGINT,
    SIGKILL, SIGQUIT, SIGRTMIN, SIGSEGV, SIGSTOP, SIGTERM, SIGTSTP, SIGUSR1, SIG_BLOCK,
    SIG_SETMASK, SIG_UNBLOCK, SI_USER,
};
use veos::task::regs::{SR_LINK, SR_OUTER, SR_RETVAL, SR_STACK_PTR};
use veos::task::{GroupState, TaskState, VeTask};
use veos::testing::TestRig;

const HANDLER_ADDR: u64 = 0x60_0000;

fn user_info(signo: i32) -> SigInfo {
    SigInfo::new(signo, SI_USER, 55, 1000)
}

fn set_of(signo: i32) -> SigSet {
    let mut s = SigSet::empty();
    s.add(signo);
    s
}

fn install_handler(rig: &TestRig, task: &Arc<VeTask>, signo: i32, flags: SaFlags) {
    send::do_sigaction(
        &rig.node,
        task,
        signo,
        Some(SigAction {
            handler: SigHandler::Handler(HANDLER_ADDR),
            flags,
            mask: SigSet::empty(),
        }),
    );
}

fn wait_for_kill(rig: &TestRig, pid: i32) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some((_, sig)) = rig
            .pseudo
            .kills
            .lock()
            .iter()
            .find(|(p, _)| *p == pid)
            .copied()
        {
            return sig;
        }
        assert!(Instant::now() < deadline, "pseudo process {pid} was not killed");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_nonrt_signals_coalesce_and_deliver_once() {
    let rig = TestRig::new();
    let task = rig.spawn_process(200);

    // Block SIGTERM, send it twice: exactly one queued record.
    do_sigprocmask(&task, SIG_BLOCK, Some(set_of(SIGTERM)), false).unwrap();
    for _ in 0..2 {
        send::send_signal(&rig.node, &task, SigSource::Info(user_info(SIGTERM)), SIGTERM, false)
            .unwrap();
    }
    {
        let sig = task.sig.lock();
        assert_eq!(sig.queue_len(SIGTERM), 1);
        assert!(!sig.sigpending, "blocked signal must not set sigpending");
    }

    // Unblock and deliver through the registered handler.
    install_handler(&rig, &task, SIGTERM, SaFlags::empty());
    do_sigprocmask(&task, SIG_UNBLOCK, Some(set_of(SIGTERM)), false).unwrap();
    assert!(task.sig.lock().sigpending);

    assert_eq!(do_signal(&rig.node, &task), Delivery::Handled);
    let sig = task.sig.lock();
    assert!(!sig.sigpending);
    assert!(!sig.pending.set.contains(SIGTERM));
}

#[test]
fn test_handler_round_trip_restores_context() {
    let rig = TestRig::new();
    let task = rig.spawn_process(201);

    // Distinctive pre-delivery state.
    {
        let mut main = task.main.lock();
        main.regs.ic = 0x4000_1000;
        main.regs.sr[SR_RETVAL] = 7;
        main.regs.sr[SR_OUTER] = 0x9999;
    }
    do_sigprocmask(&task, SIG_SETMASK, Some(set_of(SIGTERM)), false).unwrap();
    let pre_regs = *task.main.lock().regs;
    let pre_blocked = task.sig.lock().blocked;

    install_handler(&rig, &task, SIGUSR1, SaFlags::empty());
    send::send_signal(&rig.node, &task, SigSource::Info(user_info(SIGUSR1)), SIGUSR1, false)
        .unwrap();
    assert_eq!(do_signal(&rig.node, &task), Delivery::Handled);

    {
        let main = task.main.lock();
        assert_eq!(main.regs.ic, HANDLER_ADDR);
        assert_eq!(main.regs.sr[SR_OUTER], HANDLER_ADDR);
        assert_eq!(main.regs.sr[SR_RETVAL], SIGUSR1 as u64);
        // Link register points at the trampoline at the frame base.
        assert_eq!(
            main.regs.sr[SR_LINK],
            main.regs.sr[SR_STACK_PTR] + HANDLER_STACK_FRAME
        );
    }
    // The delivered signal is blocked while its handler runs.
    assert!(task.sig.lock().blocked.contains(SIGUSR1));

    // Handler returns through the trampoline: sigreturn.
    restore_context(&rig.node, &task).unwrap();
    assert!(
        *task.main.lock().regs == pre_regs,
        "register image must be restored"
    );
    assert_eq!(task.sig.lock().blocked, pre_blocked);
}

#[test]
fn test_sigprocmask_block_unblock_identity_and_scrubbing() {
    let rig = TestRig::new();
    let task = rig.spawn_process(202);

    let before = task.sig.lock().blocked;
    let mut x = SigSet::empty();
    x.add(SIGUSR1);
    x.add(SIGTERM);
    do_sigprocmask(&task, SIG_BLOCK, Some(x), false).unwrap();
    do_sigprocmask(&task, SIG_UNBLOCK, Some(x), false).unwrap();
    assert_eq!(task.sig.lock().blocked, before);

    // KILL/STOP/CONT never enter the mask.
    do_sigprocmask(&task, SIG_SETMASK, Some(SigSet::from_bits(u64::MAX)), false).unwrap();
    let blocked = task.sig.lock().blocked;
    assert!(!blocked.contains(SIGKILL));
    assert!(!blocked.contains(SIGSTOP));
    assert!(!blocked.contains(SIGCONT));
}

#[test]
fn test_stop_then_continue_purges_stop_signals() {
    let rig = TestRig::new();
    let task = rig.spawn_process(203);
    task.set_state(TaskState::Running);

    send::send_signal(&rig.node, &task, SigSource::Info(user_info(SIGTSTP)), SIGTSTP, false)
        .unwrap();
    assert_eq!(do_signal(&rig.node, &task), Delivery::Stopped);
    assert_eq!(task.state(), TaskState::Stop);

    // A second SIGTSTP queued while stopped is purged by SIGCONT.
    send::send_signal(&rig.node, &task, SigSource::Info(user_info(SIGTSTP)), SIGTSTP, false)
        .unwrap();
    assert!(task.sig.lock().pending.set.contains(SIGTSTP));

    send::send_signal(&rig.node, &task, SigSource::Info(user_info(SIGCONT)), SIGCONT, false)
        .unwrap();
    assert!(!task.sig.lock().pending.set.contains(SIGTSTP));
    assert_eq!(task.state(), TaskState::Running);
}

#[test]
fn test_altstack_frame_fault_forces_default_sigsegv() {
    let rig = TestRig::new();
    let task = rig.spawn_process(204);
    // Dumps are disabled so the forced SIGSEGV terminates directly.
    task.sighand.siglock.lock().rlim_core = 0;

    // A minimal alternate stack, then pull its mapping so frame setup
    // faults.
    let sas_base = 4 * 1024 * 1024u64;
    send::setnew_sas(
        &task,
        SigAltStack {
            sp: sas_base,
            flags: 0,
            size: VE_MINSIGSTKSZ,
        },
    )
    .unwrap();
    task.mm.unmap_page(sas_base);

    install_handler(&rig, &task, SIGSEGV, SaFlags::ONSTACK);
    send::send_signal(&rig.node, &task, SigSource::Info(user_info(SIGSEGV)), SIGSEGV, false)
        .unwrap();

    // Frame setup fails, SIGSEGV is re-armed with the default action and
    // unblocked.
    assert_eq!(do_signal(&rig.node, &task), Delivery::Failed);
    assert_eq!(
        task.sighand.siglock.lock().actions[(SIGSEGV - 1) as usize].handler,
        SigHandler::Default
    );
    {
        let sig = task.sig.lock();
        assert!(!sig.blocked.contains(SIGSEGV));
        assert!(sig.pending.set.contains(SIGSEGV));
    }

    // The forced signal terminates the pseudo process on the next pass.
    assert_eq!(do_signal(&rig.node, &task), Delivery::Terminated);
    wait_for_kill(&rig, 204);
}

#[test]
fn test_rt_signal_queue_respects_rlimit_with_priv_override() {
    let rig = TestRig::new();
    let task = rig.spawn_process(205);
    task.sighand.siglock.lock().rlim_sigpending = 2;

    let rt = SIGRTMIN + 2;
    // Queue-class user signals carry a negative code.
    let info = SigInfo::new(rt, -1, 55, 1000);
    for _ in 0..3 {
        send::send_signal(&rig.node, &task, SigSource::Info(info), rt, false).unwrap();
    }
    assert_eq!(task.sig.lock().queue_len(rt), 2, "cap applies");

    // A privileged send overrides the cap.
    send::send_signal(&rig.node, &task, SigSource::Priv, rt, false).unwrap();
    assert_eq!(task.sig.lock().queue_len(rt), 3);
}

#[test]
fn test_coredump_class_marks_group_and_kills() {
    let rig = TestRig::new();
    let task = rig.spawn_process(206);
    task.sighand.siglock.lock().rlim_core = 0;

    send::send_signal(&rig.node, &task, SigSource::Info(user_info(SIGQUIT)), SIGQUIT, false)
        .unwrap();
    assert_eq!(do_signal(&rig.node, &task), Delivery::Terminated);
    assert_eq!(task.state(), TaskState::Stop);
    assert_eq!(wait_for_kill(&rig, 206), SIGKILL);
}

#[test]
fn test_signals_dropped_during_coredump_except_sigint() {
    let rig = TestRig::new();
    let task = rig.spawn_process(208);
    task.sighand.siglock.lock().group_state = GroupState::Coredump;

    send::send_signal(&rig.node, &task, SigSource::Info(user_info(SIGTERM)), SIGTERM, false)
        .unwrap();
    send::send_signal(&rig.node, &task, SigSource::Info(user_info(SIGINT)), SIGINT, false)
        .unwrap();

    let sh = task.sighand.siglock.lock();
    assert!(sh.got_sigint);
    let sig = task.sig.lock();
    assert_eq!(sig.queue_len(SIGTERM), 0);
    assert_eq!(sig.queue_len(SIGINT), 0);
}

#[test]
fn test_sigsuspend_mask_restored_when_nothing_delivers() {
    let rig = TestRig::new();
    let task = rig.spawn_process(209);

    do_sigprocmask(&task, SIG_SETMASK, Some(set_of(SIGTERM)), false).unwrap();
    send::do_sigsuspend(&task, set_of(SIGUSR1));
    assert!(task.sig.lock().blocked.contains(SIGUSR1));

    // No signal pending: the pass restores the saved mask.
    assert_eq!(do_signal(&rig.node, &task), Delivery::NoSignal);
    let sig = task.sig.lock();
    assert!(!sig.mask_saved);
    assert!(sig.blocked.contains(SIGTERM));
    assert!(!sig.blocked.contains(SIGUSR1));
}

#[test]
fn test_saved_mask_enters_frame_and_survives_sigreturn() {
    let rig = TestRig::new();
    let task = rig.spawn_process(210);

    // sigsuspend(USR1-blocked), then a handled SIGTERM arrives: the frame
    // must carry the saved mask so sigreturn restores the pre-suspend one.
    do_sigprocmask(&task, SIG_SETMASK, Some(set_of(SIGUSR1)), false).unwrap();
    send::do_sigsuspend(&task, SigSet::empty());

    install_handler(&rig, &task, SIGTERM, SaFlags::empty());
    send::send_signal(&rig.node, &task, SigSource::Info(user_info(SIGTERM)), SIGTERM, false)
        .unwrap();
    assert_eq!(do_signal(&rig.node, &task), Delivery::Handled);

    restore_context(&rig.node, &task).unwrap();
    let sig = task.sig.lock();
    assert!(sig.blocked.contains(SIGUSR1), "pre-suspend mask restored");
    assert!(!sig.blocked.contains(SIGTERM));
}

#[test]
fn test_dispatch_sigprocmask_over_the_wire() {
    let rig = TestRig::new();
    let task = rig.spawn_process(207);

    let frame = RequestFrame {
        cmd: ipc::CMD_SIGPROCMASK,
        pid: task.pid,
        payload: SigprocmaskArgs {
            how: SIG_BLOCK,
            store_mask: false,
            has_set: true,
            newset: set_of(SIGUSR1).bits(),
        }
        .encode(),
    };
    let (retval, payload) = server::dispatch(&rig.node, &frame);
    assert_eq!(retval, 0);
    assert_eq!(payload, 0u64.to_le_bytes().to_vec());
    assert!(task.sig.lock().blocked.contains(SIGUSR1));

    // Unknown pid answers -ESRCH.
    let (retval, _) = server::dispatch(
        &rig.node,
        &RequestFrame {
            cmd: ipc::CMD_SIGPENDING,
            pid: 9999,
            payload: Vec::new(),
        },
    );
    assert_eq!(retval, -(libc::ESRCH as i64));
}
