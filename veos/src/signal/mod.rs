//! Signal model for VE tasks.
//!
//! Signal numbers, dispositions and masks mirror the Linux numbering the
//! pseudo process lives under; all register state referenced by delivery
//! resides on the VE, so the types here are plain data shared between the
//! generation, delivery and wire-protocol layers.

use bitflags::bitflags;

pub mod coredump;
pub mod deliver;
pub mod frame;
pub mod send;

pub use frame::{SigFrame, TRAMPOLINE};

/// Number of supported signals.
pub const NSIG: usize = 64;
/// First realtime signal.
pub const SIGRTMIN: i32 = 32;

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGILL: i32 = 4;
pub const SIGTRAP: i32 = 5;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGSEGV: i32 = 11;
pub const SIGUSR2: i32 = 12;
pub const SIGPIPE: i32 = 13;
pub const SIGALRM: i32 = 14;
pub const SIGTERM: i32 = 15;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGTSTP: i32 = 20;
pub const SIGTTIN: i32 = 21;
pub const SIGTTOU: i32 = 22;
pub const SIGURG: i32 = 23;
pub const SIGXCPU: i32 = 24;
pub const SIGXFSZ: i32 = 25;
pub const SIGVTALRM: i32 = 26;
pub const SIGPROF: i32 = 27;
pub const SIGWINCH: i32 = 28;
pub const SIGIO: i32 = 29;
pub const SIGPWR: i32 = 30;
pub const SIGSYS: i32 = 31;

/// `si_code` for user-sent signals.
pub const SI_USER: i32 = 0;
/// `si_code` for kernel-originated signals.
pub const SI_KERNEL: i32 = 0x80;

pub const SIG_BLOCK: i32 = 0;
pub const SIG_UNBLOCK: i32 = 1;
pub const SIG_SETMASK: i32 = 2;

pub const SS_ONSTACK: i32 = 1;
pub const SS_DISABLE: i32 = 2;

/// Set of signal numbers, one bit per signal (`signo - 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigSet(u64);

impl SigSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    fn bit(signo: i32) -> u64 {
        debug_assert!(signo >= 1 && signo as usize <= NSIG);
        1u64 << (signo - 1)
    }

    pub fn add(&mut self, signo: i32) {
        self.0 |= Self::bit(signo);
    }

    pub fn del(&mut self, signo: i32) {
        self.0 &= !Self::bit(signo);
    }

    pub fn contains(self, signo: i32) -> bool {
        self.0 & Self::bit(signo) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: SigSet) -> SigSet {
        Self(self.0 | other.0)
    }

    pub fn intersect(self, other: SigSet) -> SigSet {
        Self(self.0 & other.0)
    }

    pub fn without(self, other: SigSet) -> SigSet {
        Self(self.0 & !other.0)
    }

    /// Lowest-numbered member, if any.
    pub fn lowest(self) -> Option<i32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as i32 + 1)
        }
    }

    /// Remove the signals that must never be masked.
    pub fn scrub_unblockable(&mut self) {
        self.del(SIGKILL);
        self.del(SIGSTOP);
        self.del(SIGCONT);
    }
}

/// Stop-class signals removed from pending queues when SIGCONT arrives.
pub const STOP_FLUSH_MASK: SigSet =
    SigSet::from_bits(1 << (SIGTSTP - 1) | 1 << (SIGTTIN - 1) | 1 << (SIGTTOU - 1));

/// Signals delivered ahead of others because they report a fault at the
/// current instruction.
pub const SYNCHRONOUS_MASK: SigSet = SigSet::from_bits(
    1 << (SIGSEGV - 1) | 1 << (SIGBUS - 1) | 1 << (SIGILL - 1) | 1 << (SIGFPE - 1)
        | 1 << (SIGTRAP - 1),
);

/// Default action is to stop the whole thread group.
pub fn default_action_stops(signo: i32) -> bool {
    matches!(signo, SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU)
}

/// Default action is to ignore the signal.
pub fn default_action_ignores(signo: i32) -> bool {
    matches!(signo, SIGCHLD | SIGCONT | SIGURG | SIGWINCH)
}

/// Default action is to dump core before terminating.
pub fn default_action_dumps(signo: i32) -> bool {
    matches!(
        signo,
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV | SIGXCPU | SIGXFSZ
            | SIGSYS
    )
}

/// True for SIGSTOP and the tty stop signals.
pub fn is_stop_signal(signo: i32) -> bool {
    default_action_stops(signo)
}

bitflags! {
    /// `sa_flags` bits honored by delivery.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SaFlags: u32 {
        const NOCLDSTOP = 1;
        const NOCLDWAIT = 2;
        const SIGINFO   = 4;
        const ONSTACK   = 0x0800_0000;
        const RESTART   = 0x1000_0000;
        const NODEFER   = 0x4000_0000;
        const RESETHAND = 0x8000_0000;
    }
}

/// Disposition installed for one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigHandler {
    #[default]
    Default,
    Ignore,
    Handler(u64),
}

impl SigHandler {
    pub fn from_raw(addr: u64) -> Self {
        match addr {
            0 => Self::Default,
            1 => Self::Ignore,
            addr => Self::Handler(addr),
        }
    }

    pub fn to_raw(self) -> u64 {
        match self {
            Self::Default => 0,
            Self::Ignore => 1,
            Self::Handler(addr) => addr,
        }
    }
}

/// One slot of the per-thread-group handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigAction {
    pub handler: SigHandler,
    pub flags: SaFlags,
    pub mask: SigSet,
}

impl SigAction {
    /// Whether this action discards `signo` outright.
    pub fn ignores(&self, signo: i32) -> bool {
        match self.handler {
            SigHandler::Ignore => true,
            SigHandler::Default => default_action_ignores(signo),
            SigHandler::Handler(_) => false,
        }
    }
}

/// Signal payload carried from generation to the frame on the VE stack.
/// The layout is part of the frame ABI and must stay 128 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: i32,
    pub errno: i32,
    pub code: i32,
    _pad: i32,
    pub pid: i32,
    pub uid: u32,
    pub addr: u64,
    _reserved: [u64; 12],
}

impl SigInfo {
    pub fn new(signo: i32, code: i32, pid: i32, uid: u32) -> Self {
        Self {
            signo,
            errno: 0,
            code,
            _pad: 0,
            pid,
            uid,
            addr: 0,
            _reserved: [0; 12],
        }
    }

    /// The synthetic payload used for kernel-internal sends.
    pub fn kernel(signo: i32) -> Self {
        Self::new(signo, SI_KERNEL, 0, 0)
    }
}

impl Default for SigInfo {
    fn default() -> Self {
        Self::new(0, SI_USER, 0, 0)
    }
}

/// Origin of a generated signal, replacing the C sentinel-pointer scheme:
/// `Priv` stands in for SEND_SIG_PRIV.
#[derive(Debug, Clone, Copy)]
pub enum SigSource {
    Priv,
    Info(SigInfo),
}

/// Alternate signal stack descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigAltStack {
    pub sp: u64,
    pub flags: i32,
    pub size: u64,
}
