//! Test support: a software DMA engine and node fixtures.
//!
//! `MockDmaHw` implements the descriptor-register contract against a
//! simulated VE memory: posted descriptors execute on `start`, raise the
//! completion interrupt, and advance the read pointer exactly like the
//! device. Host-side endpoints are honored by copying through the live
//! buffer addresses, so the full facade and signal paths run end-to-end in
//! tests without hardware.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::NodeConfig;
use crate::dma::hw::{
    CTL_STATUS_HALT, CTL_STATUS_RUN, DESC_DONE, DESC_EXCEPTION, NUM_DESC,
};
use crate::dma::reqlist::DmaTranslator;
use crate::dma::{AddrKind, DmaHw, HwDesc, HwSpace};
use crate::error::Result;
use crate::mm::VE_PAGE_SIZE;
use crate::node::{NodeDeps, PseudoProc, SchedHook, VeNode};
use crate::proc::{ProcSource, ProcStatus};
use crate::signal::coredump::NoopCoreWriter;
use crate::task::regs::SR_STACK_PTR;
use crate::task::{Pid, TaskSpec, VeTask};

/// Simulated VE memory size of the default rig.
pub const MOCK_VE_MEM: usize = 8 * 1024 * 1024;

#[derive(Clone, Copy, Default)]
struct MockDesc {
    active: bool,
    status: u32,
    desc: Option<HwDesc>,
}

struct MockState {
    ctl_status: u32,
    read_ptr: usize,
    descs: [MockDesc; NUM_DESC],
}

/// Software stand-in for the DMA control window.
pub struct MockDmaHw {
    state: Mutex<MockState>,
    ve_mem: Mutex<Vec<u8>>,
    intr_flag: Mutex<bool>,
    intr_cond: Condvar,
    /// With manual mode on, `start` arms but does not execute; tests drive
    /// completion through `complete_posted`.
    manual: AtomicBool,
    poison: Mutex<Vec<(u64, u64)>>,
}

impl MockDmaHw {
    pub fn new(mem_size: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                ctl_status: CTL_STATUS_HALT,
                read_ptr: 0,
                descs: [MockDesc::default(); NUM_DESC],
            }),
            ve_mem: Mutex::new(vec![0u8; mem_size]),
            intr_flag: Mutex::new(false),
            intr_cond: Condvar::new(),
            manual: AtomicBool::new(false),
            poison: Mutex::new(Vec::new()),
        })
    }

    pub fn set_manual(&self, manual: bool) {
        self.manual.store(manual, Ordering::SeqCst);
    }

    /// Mark a VE physical range as faulting.
    pub fn poison_range(&self, start: u64, len: u64) {
        self.poison.lock().push((start, len));
    }

    pub fn ve_read(&self, addr: u64, len: usize) -> Vec<u8> {
        let mem = self.ve_mem.lock();
        mem[addr as usize..addr as usize + len].to_vec()
    }

    pub fn ve_write(&self, addr: u64, data: &[u8]) {
        let mut mem = self.ve_mem.lock();
        mem[addr as usize..addr as usize + data.len()].copy_from_slice(data);
    }

    fn poisoned(&self, space: HwSpace, addr: u64, len: u64) -> bool {
        if space != HwSpace::VeMem {
            return false;
        }
        self.poison
            .lock()
            .iter()
            .any(|(start, plen)| addr < start + plen && *start < addr + len)
    }

    /// Execute one descriptor; returns the status word.
    fn execute(&self, desc: &HwDesc) -> u32 {
        if self.poisoned(desc.src_space, desc.src, desc.len)
            || self.poisoned(desc.dst_space, desc.dst, desc.len)
        {
            return DESC_DONE | DESC_EXCEPTION;
        }
        let len = desc.len as usize;
        let data: Vec<u8> = match desc.src_space {
            HwSpace::VeMem => {
                let mem = self.ve_mem.lock();
                let Some(slice) = mem.get(desc.src as usize..desc.src as usize + len) else {
                    return DESC_DONE | DESC_EXCEPTION;
                };
                slice.to_vec()
            }
            HwSpace::VeReg => return DESC_DONE | DESC_EXCEPTION,
            // SAFETY: test-only path; host addresses come from buffers the
            // engine keeps alive until the request completes.
            HwSpace::HostBus => unsafe {
                core::slice::from_raw_parts(desc.src as *const u8, len).to_vec()
            },
        };
        match desc.dst_space {
            HwSpace::VeMem => {
                let mut mem = self.ve_mem.lock();
                let Some(slice) = mem.get_mut(desc.dst as usize..desc.dst as usize + len) else {
                    return DESC_DONE | DESC_EXCEPTION;
                };
                slice.copy_from_slice(&data);
            }
            HwSpace::VeReg => return DESC_DONE | DESC_EXCEPTION,
            // SAFETY: as above for the destination buffer.
            HwSpace::HostBus => unsafe {
                core::slice::from_raw_parts_mut(desc.dst as *mut u8, len).copy_from_slice(&data);
            },
        }
        DESC_DONE
    }

    fn raise_interrupt(&self) {
        *self.intr_flag.lock() = true;
        self.intr_cond.notify_all();
    }

    fn run(&self) {
        let mut progressed = false;
        loop {
            let (slot, desc) = {
                let st = self.state.lock();
                if st.ctl_status & CTL_STATUS_RUN == 0 {
                    break;
                }
                let slot = st.read_ptr;
                let entry = st.descs[slot];
                match (entry.active, entry.desc) {
                    (true, Some(desc)) if entry.status & DESC_DONE == 0 => (slot, desc),
                    _ => break,
                }
            };
            let status = self.execute(&desc);
            let mut st = self.state.lock();
            st.descs[slot].status = status;
            st.read_ptr = (slot + 1) % NUM_DESC;
            progressed = true;
        }
        if progressed {
            self.raise_interrupt();
        }
    }

    /// Drive up to `max` posted descriptors to completion (manual mode).
    pub fn complete_posted(&self, max: usize) {
        for _ in 0..max {
            let (slot, desc) = {
                let st = self.state.lock();
                let slot = st.read_ptr;
                let entry = st.descs[slot];
                match (entry.active, entry.desc) {
                    (true, Some(desc)) if entry.status & DESC_DONE == 0 => (slot, desc),
                    _ => break,
                }
            };
            let status = self.execute(&desc);
            let mut st = self.state.lock();
            st.descs[slot].status = status;
            st.read_ptr = (slot + 1) % NUM_DESC;
        }
        self.raise_interrupt();
    }
}

impl DmaHw for MockDmaHw {
    fn ctl_status(&self) -> u32 {
        self.state.lock().ctl_status
    }

    fn start(&self) {
        self.state.lock().ctl_status = CTL_STATUS_RUN;
        if !self.manual.load(Ordering::SeqCst) {
            self.run();
        }
    }

    fn post_stop(&self) {
        self.state.lock().ctl_status = CTL_STATUS_HALT;
    }

    fn post_descriptor(&self, slot: usize, desc: &HwDesc) {
        let mut st = self.state.lock();
        st.descs[slot] = MockDesc {
            active: true,
            status: 0,
            desc: Some(*desc),
        };
    }

    fn clear_descriptor(&self, slot: usize) {
        let mut st = self.state.lock();
        st.descs[slot] = MockDesc::default();
    }

    fn descriptor_status(&self, slot: usize) -> u32 {
        self.state.lock().descs[slot].status
    }

    fn read_ptr(&self) -> usize {
        self.state.lock().read_ptr
    }

    fn wait_interrupt(&self, timeout: Duration) -> Result<bool> {
        let mut flag = self.intr_flag.lock();
        if !*flag {
            self.intr_cond.wait_for(&mut flag, timeout);
        }
        let fired = *flag;
        *flag = false;
        Ok(fired)
    }

    fn commit_order(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// Identity translator for engine-level tests.
pub struct IdentityTranslator;

impl DmaTranslator for IdentityTranslator {
    fn translate(
        &self,
        _kind: AddrKind,
        _pid: Pid,
        addr: u64,
        _len: u64,
        _write: bool,
    ) -> Result<u64> {
        Ok(addr)
    }
}

/// Canned pseudo-process states.
pub struct FakeProc {
    states: Mutex<HashMap<Pid, char>>,
}

impl FakeProc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_state(&self, pid: Pid, state: char) {
        self.states.lock().insert(pid, state);
    }
}

impl ProcSource for FakeProc {
    fn status(&self, pid: Pid) -> Result<ProcStatus> {
        let state = self.states.lock().get(&pid).copied().unwrap_or('S');
        Ok(ProcStatus {
            state,
            euid: 1000,
            suid: 1000,
            cap_eff: 0,
        })
    }
}

/// Records kill requests instead of signalling the host.
pub struct RecordingPseudo {
    pub kills: Mutex<Vec<(Pid, i32)>>,
}

impl RecordingPseudo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            kills: Mutex::new(Vec::new()),
        })
    }
}

impl PseudoProc for RecordingPseudo {
    fn kill(&self, pid: Pid, sig: i32) -> Result<()> {
        self.kills.lock().push((pid, sig));
        Ok(())
    }
}

/// Records scheduler pokes.
pub struct RecordingSched {
    pub kicks: Mutex<Vec<usize>>,
    pub unblocks: Mutex<Vec<Pid>>,
}

impl RecordingSched {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            kicks: Mutex::new(Vec::new()),
            unblocks: Mutex::new(Vec::new()),
        })
    }
}

impl SchedHook for RecordingSched {
    fn kick_core(&self, core_id: usize) {
        self.kicks.lock().push(core_id);
    }

    fn unblock(&self, task: &Arc<VeTask>) {
        self.unblocks.lock().push(task.pid);
    }

    fn halt_core_and_save(&self, _task: &Arc<VeTask>) {}
}

/// A complete node wired to mock hardware.
pub struct TestRig {
    pub node: Arc<VeNode>,
    pub hw: Arc<MockDmaHw>,
    pub proc: Arc<FakeProc>,
    pub pseudo: Arc<RecordingPseudo>,
    pub sched: Arc<RecordingSched>,
}

impl TestRig {
    pub fn new() -> Self {
        let hw = MockDmaHw::new(MOCK_VE_MEM);
        let proc = FakeProc::new();
        let pseudo = RecordingPseudo::new();
        let sched = RecordingSched::new();
        let node = VeNode::new(
            NodeConfig::default(),
            hw.clone(),
            NodeDeps {
                driver: None,
                sched: sched.clone(),
                pseudo: pseudo.clone(),
                proc: proc.clone(),
                core_writer: Arc::new(NoopCoreWriter),
            },
        )
        .expect("mock node bring-up");
        Self {
            node,
            hw,
            proc,
            pseudo,
            sched,
        }
    }

    /// Register a process whose VE address space identity-maps the whole
    /// simulated memory and whose stack pointer sits near its top.
    pub fn spawn_process(&self, pid: Pid) -> Arc<VeTask> {
        let task = VeTask::new_process(TaskSpec {
            pid,
            uid: 1000,
            gid: 1000,
            core_id: 0,
            ve_exec_path: PathBuf::from("/home/user/a.out"),
        });
        let mut addr = 0u64;
        while (addr as usize) < MOCK_VE_MEM {
            task.mm.map_page(addr, addr, true);
            addr += VE_PAGE_SIZE;
        }
        task.main.lock().regs.sr[SR_STACK_PTR] = (MOCK_VE_MEM as u64) - 4096;
        self.node.add_task(task.clone()).expect("register task");
        task
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}
