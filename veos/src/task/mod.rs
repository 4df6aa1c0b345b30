//! VE task model and registry.
//!
//! A VE task mirrors one pseudo-process thread on the host. Thread groups
//! share a `SigHand` (handler table, group flags, LSHM area) and a memory
//! descriptor; everything per-thread lives in two lock domains: `main`
//! (scheduler-visible state and the register image, the ve_task_lock
//! equivalent) and `sig` (pending queue, masks and the alternate stack).
//! Lock order: sighand siglock, then `sig`, then `main`.

pub mod regs;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, VeosError};
use crate::mm::VeMm;
use crate::signal::frame::LSHM_SIZE;
use crate::signal::{SigAction, SigAltStack, SigInfo, SigSet, SI_USER, NSIG};
pub use regs::RegSet;

pub type Pid = i32;

/// Default soft limit on queued realtime signals per thread group.
pub const DEFAULT_RLIMIT_SIGPENDING: u64 = 128;

/// Scheduler-visible task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Wait,
    Stop,
    Zombie,
}

/// Thread-group-wide signal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Normal,
    Coredump,
    Exit,
}

/// Whether the task sits in the parent half of an unfinished vfork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VforkState {
    Inactive,
    Ongoing,
}

/// One queued signal.
#[derive(Debug, Clone)]
pub struct SigRecord {
    pub signo: i32,
    pub info: SigInfo,
    /// Set when the signal was generated from a hardware exception.
    pub hw_origin: bool,
}

/// Pending-signal structure: the bitset accelerates membership checks and
/// `recalc_sigpending`; the queue preserves siginfo and arrival order. Both
/// mutate only together, under the task's `sig` lock.
#[derive(Debug, Default)]
pub struct PendingQueue {
    pub set: SigSet,
    pub queue: Vec<SigRecord>,
}

impl PendingQueue {
    /// Drop every queued record whose signal is in `mask`; returns how many
    /// records were removed.
    pub fn flush_matching(&mut self, mask: SigSet) -> usize {
        let before = self.queue.len();
        self.queue.retain(|rec| !mask.contains(rec.signo));
        self.set = self.set.without(mask);
        before - self.queue.len()
    }

    /// Drop every queued record for `signo`.
    pub fn flush_signo(&mut self, signo: i32) -> usize {
        let mut mask = SigSet::empty();
        mask.add(signo);
        self.flush_matching(mask)
    }

    /// Dequeue the oldest record for `signo`. The bit stays set while more
    /// records of the same number remain queued. When the record was lost to
    /// the queue budget, a synthetic SI_USER payload is returned and the
    /// third result is false.
    pub fn collect(&mut self, signo: i32) -> (SigInfo, bool, bool) {
        let mut first = None;
        let mut more = false;
        for (i, rec) in self.queue.iter().enumerate() {
            if rec.signo == signo {
                if first.is_some() {
                    more = true;
                    break;
                }
                first = Some(i);
            }
        }
        if !more {
            self.set.del(signo);
        }
        match first {
            Some(i) => {
                let rec = self.queue.remove(i);
                (rec.info, rec.hw_origin, true)
            }
            None => (SigInfo::new(signo, SI_USER, 0, 0), false, false),
        }
    }
}

/// State shared by a thread group under the signal lock.
#[derive(Debug)]
pub struct SigHandState {
    pub actions: [SigAction; NSIG],
    pub group_state: GroupState,
    /// SIGINT arrived while a core dump was in progress.
    pub got_sigint: bool,
    /// Queued-signal records across the whole group.
    pub pending_count: u64,
    /// Soft RLIMIT_SIGPENDING.
    pub rlim_sigpending: u64,
    /// Soft RLIMIT_CORE; zero disables core dumps.
    pub rlim_core: u64,
}

/// Per-thread-group signal-handling structure.
pub struct SigHand {
    pub siglock: Mutex<SigHandState>,
    /// Serializes group teardown against core dumping.
    pub del_lock: Mutex<()>,
    lshm: Mutex<Vec<u8>>,
}

impl SigHand {
    pub fn new() -> Self {
        Self {
            siglock: Mutex::new(SigHandState {
                actions: [SigAction::default(); NSIG],
                group_state: GroupState::Normal,
                got_sigint: false,
                pending_count: 0,
                rlim_sigpending: DEFAULT_RLIMIT_SIGPENDING,
                rlim_core: u64::MAX,
            }),
            del_lock: Mutex::new(()),
            lshm: Mutex::new(Vec::new()),
        }
    }

    /// Reserve an LSHM partition for a new thread; returns its offset.
    pub fn alloc_lshm_slot(&self) -> usize {
        let mut lshm = self.lshm.lock();
        let offset = lshm.len();
        lshm.resize(offset + LSHM_SIZE, 0);
        offset
    }

    pub fn lshm_snapshot(&self, offset: usize) -> [u8; LSHM_SIZE] {
        let lshm = self.lshm.lock();
        let mut out = [0u8; LSHM_SIZE];
        out.copy_from_slice(&lshm[offset..offset + LSHM_SIZE]);
        out
    }

    pub fn lshm_restore(&self, offset: usize, data: &[u8; LSHM_SIZE]) {
        let mut lshm = self.lshm.lock();
        lshm[offset..offset + LSHM_SIZE].copy_from_slice(data);
    }
}

impl Default for SigHand {
    fn default() -> Self {
        Self::new()
    }
}

/// Task fields guarded by the task lock.
#[derive(Debug)]
pub struct TaskMain {
    pub state: TaskState,
    pub regs: Box<RegSet>,
    /// Register image modified since the last core write-back.
    pub regs_dirty: bool,
    pub vfork: VforkState,
    /// A blocking-syscall notification from the pseudo process is being
    /// handled (MONC in flight).
    pub block_received: bool,
    /// A synchronous (hardware-exception) signal is outstanding.
    pub syncsignal: bool,
    pub exit_code: i32,
    pub exit_code_set: bool,
    pub ptraced: bool,
}

/// Task fields guarded by the per-task signal lock.
#[derive(Debug, Default)]
pub struct TaskSignals {
    pub pending: PendingQueue,
    pub blocked: SigSet,
    pub saved_mask: SigSet,
    pub mask_saved: bool,
    /// Cached `(pending & ~blocked) != 0`.
    pub sigpending: bool,
    pub altstack: SigAltStack,
}

impl TaskSignals {
    /// Recompute and return the cached sigpending flag.
    pub fn recalc_sigpending(&mut self) -> bool {
        self.sigpending = !self.pending.set.without(self.blocked).is_empty();
        self.sigpending
    }

    /// Queued records for one signal number.
    pub fn queue_len(&self, signo: i32) -> usize {
        self.pending
            .queue
            .iter()
            .filter(|rec| rec.signo == signo)
            .count()
    }
}

/// Construction parameters for a task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub pid: Pid,
    pub uid: u32,
    pub gid: u32,
    pub core_id: usize,
    pub ve_exec_path: PathBuf,
}

/// One VE task.
pub struct VeTask {
    pub pid: Pid,
    pub tgid: Pid,
    pub uid: u32,
    pub gid: u32,
    pub core_id: usize,
    /// Offset of this thread's partition in the group LSHM area.
    pub lshm_offset: usize,
    pub ve_exec_path: PathBuf,
    pub sighand: Arc<SigHand>,
    pub mm: Arc<VeMm>,
    group_leader: Weak<VeTask>,
    /// Non-leader members of the group; meaningful on the leader only.
    threads: Mutex<Vec<Arc<VeTask>>>,
    pub main: Mutex<TaskMain>,
    pub sig: Mutex<TaskSignals>,
}

impl VeTask {
    fn build(
        spec: TaskSpec,
        tgid: Pid,
        sighand: Arc<SigHand>,
        mm: Arc<VeMm>,
        leader: Option<&Arc<VeTask>>,
    ) -> Arc<VeTask> {
        let lshm_offset = sighand.alloc_lshm_slot();
        let main = TaskMain {
            state: TaskState::Wait,
            regs: Box::new(RegSet::new()),
            regs_dirty: false,
            vfork: VforkState::Inactive,
            block_received: false,
            syncsignal: false,
            exit_code: 0,
            exit_code_set: false,
            ptraced: false,
        };
        match leader {
            Some(leader) => Arc::new(VeTask {
                pid: spec.pid,
                tgid,
                uid: spec.uid,
                gid: spec.gid,
                core_id: spec.core_id,
                lshm_offset,
                ve_exec_path: spec.ve_exec_path,
                sighand,
                mm,
                group_leader: Arc::downgrade(leader),
                threads: Mutex::new(Vec::new()),
                main: Mutex::new(main),
                sig: Mutex::new(TaskSignals::default()),
            }),
            None => Arc::new_cyclic(|weak| VeTask {
                pid: spec.pid,
                tgid,
                uid: spec.uid,
                gid: spec.gid,
                core_id: spec.core_id,
                lshm_offset,
                ve_exec_path: spec.ve_exec_path,
                sighand,
                mm,
                group_leader: weak.clone(),
                threads: Mutex::new(Vec::new()),
                main: Mutex::new(main),
                sig: Mutex::new(TaskSignals::default()),
            }),
        }
    }

    /// Create a new thread-group leader with fresh signal and memory state.
    pub fn new_process(spec: TaskSpec) -> Arc<VeTask> {
        let tgid = spec.pid;
        Self::build(spec, tgid, Arc::new(SigHand::new()), Arc::new(VeMm::new()), None)
    }

    /// Create a thread inside an existing group.
    pub fn new_thread(leader: &Arc<VeTask>, spec: TaskSpec) -> Arc<VeTask> {
        let task = Self::build(
            spec,
            leader.tgid,
            leader.sighand.clone(),
            leader.mm.clone(),
            Some(leader),
        );
        leader.threads.lock().push(task.clone());
        task
    }

    pub fn is_leader(&self) -> bool {
        self.pid == self.tgid
    }

    pub fn group_leader(self: &Arc<Self>) -> Arc<VeTask> {
        self.group_leader
            .upgrade()
            .unwrap_or_else(|| self.clone())
    }

    /// Group members in traversal order: threads first, leader last.
    pub fn thread_group(self: &Arc<Self>) -> Vec<Arc<VeTask>> {
        let leader = self.group_leader();
        let mut members: Vec<Arc<VeTask>> = leader.threads.lock().clone();
        members.push(leader);
        members
    }

    pub fn state(&self) -> TaskState {
        self.main.lock().state
    }

    pub fn set_state(&self, state: TaskState) {
        self.main.lock().state = state;
    }
}

impl core::fmt::Debug for VeTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VeTask")
            .field("pid", &self.pid)
            .field("tgid", &self.tgid)
            .finish_non_exhaustive()
    }
}

/// Node-level task registry, the tree the C code roots at the init task.
/// Handed to subsystems by reference from the node; no hidden singleton.
pub struct TaskRegistry {
    tasks: RwLock<BTreeMap<Pid, Arc<VeTask>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, task: Arc<VeTask>) -> Result<()> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.pid) {
            return Err(VeosError::Busy {
                resource: "task pid",
            });
        }
        tasks.insert(task.pid, task);
        Ok(())
    }

    pub fn lookup(&self, pid: Pid) -> Option<Arc<VeTask>> {
        self.tasks.read().get(&pid).cloned()
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<VeTask>> {
        self.tasks.write().remove(&pid)
    }

    /// Thread-group leaders, i.e. the per-process view.
    pub fn processes(&self) -> Vec<Arc<VeTask>> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.is_leader())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
