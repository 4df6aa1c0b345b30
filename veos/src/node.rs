//! Per-node service state.
//!
//! `VeNode` is the central registry handed to every subsystem by reference:
//! the task tree, the DMA engine, the per-core current-task view, the
//! scheduler and pseudo-process seams, and the shutdown machinery. There is
//! deliberately no global singleton.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::NodeConfig;
use crate::dma::reqlist::DmaTranslator;
use crate::dma::{AddrKind, DmaEngine, DmaHw};
use crate::driver::VeDriver;
use crate::error::{Result, VeosError};
use crate::mm::transfer::MemTransfer;
use crate::proc::ProcSource;
use crate::signal::coredump::CoreWriter;
use crate::task::{Pid, TaskRegistry, VeTask};

/// Scheduler integration points. Dispatch itself is out of scope; the core
/// observes it through the per-core current task and pokes it through this
/// seam.
pub trait SchedHook: Send + Sync {
    /// Re-run scheduling on `core_id` so a freshly pending signal is seen.
    fn kick_core(&self, core_id: usize);
    /// Make a blocked task schedulable after a synchronous signal.
    fn unblock(&self, task: &Arc<VeTask>);
    /// Halt the core the task runs on and save its user context.
    fn halt_core_and_save(&self, task: &Arc<VeTask>);
}

/// No-op scheduler used until a dispatcher is attached.
pub struct NullSched;

impl SchedHook for NullSched {
    fn kick_core(&self, _core_id: usize) {}
    fn unblock(&self, _task: &Arc<VeTask>) {}
    fn halt_core_and_save(&self, _task: &Arc<VeTask>) {}
}

/// Host-side actions on the pseudo process.
pub trait PseudoProc: Send + Sync {
    fn kill(&self, pid: Pid, sig: i32) -> Result<()>;
}

/// Sends real host signals.
pub struct HostPseudoProc;

impl PseudoProc for HostPseudoProc {
    fn kill(&self, pid: Pid, sig: i32) -> Result<()> {
        // SAFETY: plain kill(2) call; arguments carry no pointers.
        let rv = unsafe { libc::kill(pid, sig) };
        if rv == -1 {
            return Err(VeosError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// One VE core as the service sees it: the scheduler's read/write lock and
/// the currently dispatched task.
pub struct VeCore {
    pub lock: RwLock<()>,
    curr: Mutex<Weak<VeTask>>,
}

impl VeCore {
    fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            curr: Mutex::new(Weak::new()),
        }
    }

    pub fn current(&self) -> Option<Arc<VeTask>> {
        self.curr.lock().upgrade()
    }

    pub fn set_current(&self, task: Option<&Arc<VeTask>>) {
        *self.curr.lock() = task.map(Arc::downgrade).unwrap_or_default();
    }
}

/// Translator backed by the task registry (VE sides) and the driver's host
/// pinning (host virtual side).
pub struct NodeTranslator {
    registry: Arc<TaskRegistry>,
    driver: Option<Arc<dyn VeDriver>>,
}

impl DmaTranslator for NodeTranslator {
    fn translate(
        &self,
        kind: AddrKind,
        pid: Pid,
        addr: u64,
        len: u64,
        write: bool,
    ) -> Result<u64> {
        match kind {
            AddrKind::VeVirtual | AddrKind::VeVirtualNoProt => {
                let task = self.registry.lookup(pid).ok_or(VeosError::NotFound {
                    resource: "task",
                    id: pid as u64,
                })?;
                if kind == AddrKind::VeVirtual {
                    task.mm.translate_checked(addr, write)
                } else {
                    task.mm.translate(addr)
                }
            }
            AddrKind::HostVirtual => match &self.driver {
                Some(driver) => driver.pin_host(pid, addr, len),
                None => Ok(addr),
            },
            AddrKind::VePhysical | AddrKind::VeRegister | AddrKind::HostPhysical => Ok(addr),
        }
    }
}

/// Everything one VE node needs to serve requests.
pub struct VeNode {
    pub config: NodeConfig,
    /// Read-held by request handlers, write-held by shutdown.
    pub handling_request_lock: RwLock<()>,
    /// Node-level task enumeration lock.
    pub tasklist_lock: Mutex<()>,
    pub registry: Arc<TaskRegistry>,
    cores: Vec<VeCore>,
    dma: Arc<DmaEngine>,
    translator: Arc<dyn DmaTranslator>,
    transfer: MemTransfer,
    pub sched: Arc<dyn SchedHook>,
    pub pseudo: Arc<dyn PseudoProc>,
    pub proc: Arc<dyn ProcSource>,
    pub core_writer: Arc<dyn CoreWriter>,
    /// Pid owning host-side bounce buffers (the service).
    pub host_pid: Pid,
    /// Cooperative global shutdown flag.
    pub terminate_flag: AtomicBool,
    num_ve_proc: AtomicUsize,
    stop_mtx: Mutex<()>,
    stop_cond: Condvar,
}

/// External collaborators injected into a node.
pub struct NodeDeps {
    pub driver: Option<Arc<dyn VeDriver>>,
    pub sched: Arc<dyn SchedHook>,
    pub pseudo: Arc<dyn PseudoProc>,
    pub proc: Arc<dyn ProcSource>,
    pub core_writer: Arc<dyn CoreWriter>,
}

impl VeNode {
    pub fn new(config: NodeConfig, hw: Arc<dyn DmaHw>, deps: NodeDeps) -> Result<Arc<VeNode>> {
        let registry = Arc::new(TaskRegistry::new());
        let translator: Arc<dyn DmaTranslator> = Arc::new(NodeTranslator {
            registry: registry.clone(),
            driver: deps.driver,
        });
        let dma = DmaEngine::open(hw)?;
        let host_pid = std::process::id() as Pid;
        let transfer = MemTransfer::new(dma.clone(), translator.clone(), host_pid);
        let cores = (0..config.num_cores).map(|_| VeCore::new()).collect();

        info!("bringing up VE node {}", config.node_id);
        Ok(Arc::new(VeNode {
            config,
            handling_request_lock: RwLock::new(()),
            tasklist_lock: Mutex::new(()),
            registry,
            cores,
            dma,
            translator,
            transfer,
            sched: deps.sched,
            pseudo: deps.pseudo,
            proc: deps.proc,
            core_writer: deps.core_writer,
            host_pid,
            terminate_flag: AtomicBool::new(false),
            num_ve_proc: AtomicUsize::new(0),
            stop_mtx: Mutex::new(()),
            stop_cond: Condvar::new(),
        }))
    }

    pub fn dma(&self) -> &Arc<DmaEngine> {
        &self.dma
    }

    pub fn translator(&self) -> &Arc<dyn DmaTranslator> {
        &self.translator
    }

    pub fn transfer(&self) -> &MemTransfer {
        &self.transfer
    }

    pub fn core(&self, core_id: usize) -> &VeCore {
        &self.cores[core_id]
    }

    pub fn current_on_core(&self, core_id: usize) -> Option<Arc<VeTask>> {
        self.cores.get(core_id).and_then(|core| core.current())
    }

    /// Register a task and wake the stopping thread.
    pub fn add_task(&self, task: Arc<VeTask>) -> Result<()> {
        let is_leader = task.is_leader();
        self.registry.register(task)?;
        if is_leader {
            self.num_ve_proc.fetch_add(1, Ordering::SeqCst);
            let _guard = self.stop_mtx.lock();
            self.stop_cond.notify_all();
        }
        Ok(())
    }

    pub fn remove_task(&self, pid: Pid) -> Option<Arc<VeTask>> {
        let removed = self.registry.remove(pid)?;
        if removed.is_leader() {
            self.num_ve_proc.fetch_sub(1, Ordering::SeqCst);
        }
        Some(removed)
    }

    pub fn num_ve_proc(&self) -> usize {
        self.num_ve_proc.load(Ordering::SeqCst)
    }

    pub fn terminating(&self) -> bool {
        self.terminate_flag.load(Ordering::SeqCst)
    }

    /// Park the stopping thread until a process exists or shutdown starts.
    /// Returns false when the node is terminating.
    pub fn wait_for_processes(&self, timeout: Duration) -> bool {
        let mut guard = self.stop_mtx.lock();
        while self.num_ve_proc.load(Ordering::SeqCst) == 0 {
            if self.terminating() {
                return false;
            }
            debug!("stopping thread waiting to be woken");
            self.stop_cond.wait_for(&mut guard, timeout);
            if self.terminating() {
                return false;
            }
        }
        !self.terminating()
    }

    /// Cooperative shutdown: raise the flag, wake sleepers, drain handlers,
    /// then tear the DMA engine down.
    pub fn shutdown(&self) -> Result<()> {
        info!("shutting down VE node {}", self.config.node_id);
        self.terminate_flag.store(true, Ordering::SeqCst);
        {
            let _guard = self.stop_mtx.lock();
            self.stop_cond.notify_all();
        }
        // Wait for in-flight request handlers to finish.
        let _write = self.handling_request_lock.write();
        self.dma.terminate_all();
        self.dma.close()
    }
}
