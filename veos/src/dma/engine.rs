//! DMA engine: descriptor-ring scheduler and completion reaper.
//!
//! One engine exists per VE node. Posting fills free ring slots and queues
//! the overflow; the interrupt helper thread harvests completed descriptors
//! strictly in ring order from `desc_used_begin`, so user-visible completion
//! is FIFO even when the hardware retires out of order internally.
//!
//! Invariant maintained under the engine mutex: `desc_num_used` equals the
//! number of occupied slots, and the occupied slots form one contiguous ring
//! segment starting at `desc_used_begin`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::dma::hw::{DmaHw, CTL_STATUS_HALT, CTL_STATUS_MASK, DESC_DONE, DESC_EXCEPTION, NUM_DESC};
use crate::dma::reqlist::{build_entries, DmaTranslator, EntryState, ReqEntry};
use crate::dma::{DmaEndpoint, DmaStatus, MAX_LENGTH};
use crate::error::{Result, VeosError};

/// Interrupt-helper wakeup period when no interrupt arrives.
const INTR_TIMEOUT: Duration = Duration::from_millis(100);

/// Entries of one request plus the condvar its waiters block on.
struct RequestShared {
    cond: Condvar,
    entries: Vec<Arc<ReqEntry>>,
}

impl RequestShared {
    /// Join of the entry states.
    fn status(&self) -> DmaStatus {
        let mut all_done = true;
        let mut canceled = false;
        for entry in &self.entries {
            match entry.state() {
                EntryState::Failed => return DmaStatus::Error,
                EntryState::Canceled => canceled = true,
                EntryState::Done => {}
                EntryState::Waiting | EntryState::Posted => all_done = false,
            }
        }
        if canceled {
            DmaStatus::Canceled
        } else if all_done {
            DmaStatus::Ok
        } else {
            DmaStatus::NotFinished
        }
    }
}

/// A slot or waiting-list occupant: the entry plus a back-pointer to its
/// request for completion broadcast.
struct Pending {
    req: Arc<RequestShared>,
    entry: Arc<ReqEntry>,
}

struct EngineState {
    desc_used_begin: usize,
    desc_num_used: usize,
    slots: Vec<Option<Pending>>,
    waiting: VecDeque<Pending>,
    should_stop: bool,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    pub begin: usize,
    pub used: usize,
    pub occupied: usize,
    pub waiting: usize,
}

/// User-visible handle for one posted request.
pub struct DmaRequest {
    engine: Arc<DmaEngine>,
    shared: Arc<RequestShared>,
}

impl std::fmt::Debug for DmaRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaRequest").finish_non_exhaustive()
    }
}

impl DmaRequest {
    /// Current status without blocking.
    pub fn test(&self) -> DmaStatus {
        let _guard = self.engine.state.lock();
        self.shared.status()
    }

    /// Block until the request reaches a terminal state. Unblocking because
    /// the engine is shutting down reports CANCELED.
    pub fn wait(&self) -> DmaStatus {
        let mut guard = self.engine.state.lock();
        let mut status = self.shared.status();
        while status == DmaStatus::NotFinished && !guard.should_stop {
            self.shared.cond.wait(&mut guard);
            status = self.shared.status();
        }
        drop(guard);
        if status == DmaStatus::NotFinished {
            DmaStatus::Canceled
        } else {
            status
        }
    }

    /// `wait` with a deadline. TIMEDOUT is reported without mutating the
    /// request, so a later `wait` remains legal.
    pub fn timedwait(&self, timeout: Duration) -> DmaStatus {
        let deadline = Instant::now() + timeout;
        let mut guard = self.engine.state.lock();
        let mut status = self.shared.status();
        while status == DmaStatus::NotFinished && !guard.should_stop {
            let res = self.shared.cond.wait_until(&mut guard, deadline);
            if res.timed_out() {
                return DmaStatus::Timedout;
            }
            status = self.shared.status();
        }
        drop(guard);
        if status == DmaStatus::NotFinished {
            DmaStatus::Canceled
        } else {
            status
        }
    }

    /// Cancel this request: the engine halts, the request's descriptors are
    /// removed, other work is re-posted and the engine restarts.
    pub fn terminate(&self) {
        let mut st = self.engine.state.lock();
        self.engine.cancel_request(&mut st, &self.shared);
        self.engine.hw.commit_order();
    }
}

/// The per-node DMA engine.
pub struct DmaEngine {
    hw: Arc<dyn DmaHw>,
    state: Mutex<EngineState>,
    helper: Mutex<Option<JoinHandle<()>>>,
}

impl DmaEngine {
    /// Bring up the engine: verify the HALT state (halting and clearing the
    /// ring if the previous owner left it running), snapshot the read
    /// pointer, and start the interrupt helper.
    pub fn open(hw: Arc<dyn DmaHw>) -> Result<Arc<DmaEngine>> {
        let ctl = hw.ctl_status();
        if ctl & CTL_STATUS_MASK != CTL_STATUS_HALT {
            warn!("DMA engine not halted at open ({ctl:#010x}); stopping and clearing");
            stop_engine(hw.as_ref());
        }
        for slot in 0..NUM_DESC {
            hw.clear_descriptor(slot);
        }
        let begin = hw.read_ptr();

        let mut slots = Vec::with_capacity(NUM_DESC);
        slots.resize_with(NUM_DESC, || None);
        let engine = Arc::new(DmaEngine {
            hw,
            state: Mutex::new(EngineState {
                desc_used_begin: begin,
                desc_num_used: 0,
                slots,
                waiting: VecDeque::new(),
                should_stop: false,
            }),
            helper: Mutex::new(None),
        });

        let for_helper = engine.clone();
        let handle = std::thread::Builder::new()
            .name("dma-intr-helper".into())
            .spawn(move || helper_loop(for_helper))
            .map_err(VeosError::Io)?;
        *engine.helper.lock() = Some(handle);
        engine.hw.commit_order();
        debug!("DMA engine opened, read pointer {begin}");
        Ok(engine)
    }

    /// Post a transfer. Alignment, length and address-kind validation happen
    /// here; the split into physically contiguous entries and the slot fill
    /// happen under the engine mutex.
    pub fn post(
        self: &Arc<Self>,
        translator: &dyn DmaTranslator,
        src: DmaEndpoint,
        dst: DmaEndpoint,
        len: u64,
    ) -> Result<DmaRequest> {
        if len == 0 || len % 8 != 0 {
            return Err(VeosError::InvalidArgument {
                name: "length",
                value: "must be a non-zero multiple of 8",
            });
        }
        if len > MAX_LENGTH {
            return Err(VeosError::InvalidArgument {
                name: "length",
                value: "exceeds the maximum transfer length",
            });
        }
        if src.addr() % 8 != 0 {
            return Err(VeosError::InvalidAddress { addr: src.addr() });
        }
        if dst.addr() % 8 != 0 {
            return Err(VeosError::InvalidAddress { addr: dst.addr() });
        }

        let entries = build_entries(translator, &src, &dst, len);
        let shared = Arc::new(RequestShared {
            cond: Condvar::new(),
            entries,
        });

        let mut st = self.state.lock();
        if st.should_stop {
            return Err(VeosError::Canceled {
                operation: "dma post",
            });
        }
        let posted = self.fill_slots(&mut st, &shared);
        if posted > 0 {
            self.hw.start();
        }
        self.hw.commit_order();
        drop(st);

        Ok(DmaRequest {
            engine: self.clone(),
            shared,
        })
    }

    /// Synchronous transfer: post, wait, release.
    pub fn xfer(
        self: &Arc<Self>,
        translator: &dyn DmaTranslator,
        src: DmaEndpoint,
        dst: DmaEndpoint,
        len: u64,
    ) -> Result<DmaStatus> {
        let req = self.post(translator, src, dst, len)?;
        Ok(req.wait())
    }

    /// Cancel every posted and queued request, clear the ring and leave the
    /// engine halted.
    pub fn terminate_all(&self) {
        let mut st = self.state.lock();
        stop_engine(self.hw.as_ref());

        let mut to_wake: Vec<Arc<RequestShared>> = Vec::new();
        for slot in st.slots.iter_mut() {
            if let Some(pending) = slot.take() {
                pending.entry.set_state(EntryState::Canceled);
                to_wake.push(pending.req);
            }
        }
        for pending in st.waiting.drain(..) {
            pending.entry.set_state(EntryState::Canceled);
            to_wake.push(pending.req);
        }
        for slot in 0..NUM_DESC {
            self.hw.clear_descriptor(slot);
        }
        st.desc_used_begin = self.hw.read_ptr();
        st.desc_num_used = 0;
        self.hw.commit_order();
        for req in to_wake {
            req.cond.notify_all();
        }
    }

    /// Shut the engine down. Fails BUSY while descriptors are in use or when
    /// already closing.
    pub fn close(&self) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.desc_num_used != 0 {
                error!("close with {} descriptors still used", st.desc_num_used);
                return Err(VeosError::Busy {
                    resource: "dma descriptors",
                });
            }
            if st.should_stop {
                return Err(VeosError::Busy {
                    resource: "dma engine",
                });
            }
            st.should_stop = true;
            stop_engine(self.hw.as_ref());
            self.hw.commit_order();
        }
        // The helper wakes by its own interrupt timeout, sees should_stop
        // and exits.
        if let Some(handle) = self.helper.lock().take() {
            if handle.join().is_err() {
                error!("DMA interrupt helper panicked");
            }
        }
        debug!("DMA engine closed");
        Ok(())
    }

    /// Ring counters for diagnostics.
    pub fn ring_snapshot(&self) -> RingSnapshot {
        let st = self.state.lock();
        RingSnapshot {
            begin: st.desc_used_begin,
            used: st.desc_num_used,
            occupied: st.slots.iter().filter(|s| s.is_some()).count(),
            waiting: st.waiting.len(),
        }
    }

    /// Place as many of the request's runnable entries as fit into free
    /// slots; queue the rest. Returns how many were placed.
    fn fill_slots(&self, st: &mut EngineState, shared: &Arc<RequestShared>) -> usize {
        let mut placed = 0;
        for entry in &shared.entries {
            if entry.state() != EntryState::Waiting {
                // Translation faults are terminal from birth.
                continue;
            }
            let pending = Pending {
                req: shared.clone(),
                entry: entry.clone(),
            };
            if st.desc_num_used < NUM_DESC {
                self.post_slot(st, pending);
                placed += 1;
            } else {
                st.waiting.push_back(pending);
            }
        }
        placed
    }

    fn post_slot(&self, st: &mut EngineState, pending: Pending) {
        let slot = (st.desc_used_begin + st.desc_num_used) % NUM_DESC;
        self.hw.post_descriptor(slot, &pending.entry.hw_desc());
        pending.entry.set_state(EntryState::Posted);
        st.slots[slot] = Some(pending);
        st.desc_num_used += 1;
    }

    /// Harvest completed descriptors in ring order. Returns the requests
    /// with entries that reached a terminal state.
    fn reap(&self, st: &mut EngineState) -> Vec<Arc<RequestShared>> {
        let read_ptr = self.hw.read_ptr();
        let mut finished = Vec::new();
        while st.desc_num_used > 0 {
            let slot = st.desc_used_begin;
            if slot == read_ptr {
                // Either nothing was consumed or a full ring wrapped; the
                // DONE bit of the cursor slot disambiguates.
                let wrapped = st.desc_num_used == NUM_DESC
                    && self.hw.descriptor_status(slot) & DESC_DONE != 0;
                if !wrapped {
                    break;
                }
            }
            if let Some(pending) = st.slots[slot].take() {
                let word = self.hw.descriptor_status(slot);
                if word & DESC_DONE == 0 {
                    // The cursor says consumed but the slot is not done;
                    // keep it for the next pass.
                    st.slots[slot] = Some(pending);
                    break;
                }
                let state = if word & DESC_EXCEPTION != 0 {
                    EntryState::Failed
                } else {
                    EntryState::Done
                };
                pending.entry.set_state(state);
                finished.push(pending.req);
            }
            self.hw.clear_descriptor(slot);
            st.desc_used_begin = (slot + 1) % NUM_DESC;
            st.desc_num_used -= 1;
        }
        finished
    }

    /// Move waiting entries into freed slots. Returns how many were placed.
    fn drain_waiting(&self, st: &mut EngineState) -> usize {
        let mut placed = 0;
        while st.desc_num_used < NUM_DESC {
            let Some(pending) = st.waiting.pop_front() else {
                break;
            };
            if pending.entry.state() != EntryState::Waiting {
                continue;
            }
            self.post_slot(st, pending);
            placed += 1;
        }
        placed
    }

    /// Remove one request from the ring and the waiting list; other work is
    /// compacted back onto the ring and the engine restarted.
    fn cancel_request(&self, st: &mut EngineState, shared: &Arc<RequestShared>) {
        stop_engine(self.hw.as_ref());

        // Queued entries first.
        let mut kept = VecDeque::with_capacity(st.waiting.len());
        for pending in st.waiting.drain(..) {
            if Arc::ptr_eq(&pending.req, shared) {
                pending.entry.set_state(EntryState::Canceled);
            } else {
                kept.push_back(pending);
            }
        }
        st.waiting = kept;

        // Harvest whatever the hardware finished before the halt, then
        // rebuild the ring segment without this request's descriptors.
        let finished = self.reap(st);
        let begin = st.desc_used_begin;
        let used = st.desc_num_used;
        let mut survivors = Vec::new();
        for k in 0..used {
            let slot = (begin + k) % NUM_DESC;
            if let Some(pending) = st.slots[slot].take() {
                self.hw.clear_descriptor(slot);
                if Arc::ptr_eq(&pending.req, shared) {
                    pending.entry.set_state(EntryState::Canceled);
                } else {
                    survivors.push(pending);
                }
            }
        }
        st.desc_num_used = 0;
        for pending in survivors {
            self.post_slot(st, pending);
        }
        self.drain_waiting(st);

        if !st.should_stop && st.desc_num_used > 0 {
            self.hw.start();
        }
        for req in finished {
            req.cond.notify_all();
        }
        shared.cond.notify_all();
    }
}

/// Request a halt and wait for the engine to reach it.
fn stop_engine(hw: &dyn DmaHw) {
    hw.post_stop();
    while hw.ctl_status() & CTL_STATUS_MASK != CTL_STATUS_HALT {
        std::hint::spin_loop();
    }
}

fn helper_loop(engine: Arc<DmaEngine>) {
    loop {
        if let Err(err) = engine.hw.wait_interrupt(INTR_TIMEOUT) {
            error!("interrupt wait failed: {err}");
        }
        let mut st = engine.state.lock();
        let stopping = st.should_stop;
        let finished = engine.reap(&mut st);
        let placed = engine.drain_waiting(&mut st);
        if placed > 0 && !st.should_stop {
            engine.hw.start();
            engine.hw.commit_order();
        }
        for req in &finished {
            req.cond.notify_all();
        }
        drop(st);
        if stopping {
            break;
        }
    }
}
