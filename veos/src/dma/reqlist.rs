//! Transfer splitting into request-list entries.
//!
//! A logical (src, dst, len) transfer becomes one entry per physically
//! contiguous fragment: the walk advances both endpoints together and cuts
//! at whichever side reaches a page boundary first (4 KiB host pages, 2 MiB
//! VE pages; physical endpoints have no boundary). Adjacent fragments whose
//! translations are contiguous on both sides merge back into one entry, so
//! huge-page-backed regions consume few descriptors.
//!
//! A translation fault does not abort the whole request: the failing entry
//! is born in the `Failed` state and the caller observes an error status on
//! wait while unaffected entries still transfer.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::dma::hw::{HwDesc, HwSpace};
use crate::dma::{AddrKind, DmaEndpoint};
use crate::error::Result;
use crate::mm::{VE_PAGE_SIZE, VH_PAGE_SIZE};
use crate::task::Pid;

/// Virtual-to-physical translation used by the request builder.
pub trait DmaTranslator: Send + Sync {
    /// Translate `addr` in the space of `kind` for `pid`. `write` selects
    /// the protection check applied to protection-checked kinds.
    fn translate(&self, kind: AddrKind, pid: Pid, addr: u64, len: u64, write: bool)
        -> Result<u64>;
}

/// Lifecycle of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    /// Built but not yet on a descriptor.
    Waiting = 0,
    /// Occupies a descriptor slot.
    Posted = 1,
    /// Completed successfully.
    Done = 2,
    /// Hardware exception or translation fault.
    Failed = 3,
    /// Removed by terminate / terminate_all / engine shutdown.
    Canceled = 4,
}

/// One physically contiguous fragment of a request.
///
/// Entries are shared between the request handle and, while posted, the
/// engine's slot table; the state word is only written under the engine
/// mutex, readers may sample it lock-free.
#[derive(Debug)]
pub struct ReqEntry {
    pub src_space: HwSpace,
    pub dst_space: HwSpace,
    pub src_phys: u64,
    pub dst_phys: u64,
    pub len: u64,
    state: AtomicU8,
}

impl ReqEntry {
    fn new(src_space: HwSpace, dst_space: HwSpace, src_phys: u64, dst_phys: u64, len: u64) -> Self {
        Self {
            src_space,
            dst_space,
            src_phys,
            dst_phys,
            len,
            state: AtomicU8::new(EntryState::Waiting as u8),
        }
    }

    fn new_failed(len: u64) -> Self {
        let entry = Self::new(HwSpace::HostBus, HwSpace::HostBus, 0, 0, len);
        entry.set_state(EntryState::Failed);
        entry
    }

    pub fn state(&self) -> EntryState {
        match self.state.load(Ordering::Acquire) {
            0 => EntryState::Waiting,
            1 => EntryState::Posted,
            2 => EntryState::Done,
            3 => EntryState::Failed,
            _ => EntryState::Canceled,
        }
    }

    pub fn set_state(&self, state: EntryState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state(),
            EntryState::Done | EntryState::Failed | EntryState::Canceled
        )
    }

    pub fn hw_desc(&self) -> HwDesc {
        HwDesc {
            src_space: self.src_space,
            dst_space: self.dst_space,
            src: self.src_phys,
            dst: self.dst_phys,
            len: self.len,
        }
    }
}

/// Distance to the next page boundary of `kind` from `addr`, used to cut
/// fragments. Physical spaces are boundary-free.
fn boundary_distance(kind: AddrKind, addr: u64) -> u64 {
    if !kind.is_virtual() {
        return u64::MAX;
    }
    let page = if kind.is_ve() { VE_PAGE_SIZE } else { VH_PAGE_SIZE };
    page - (addr & (page - 1))
}

fn translate_side(
    translator: &dyn DmaTranslator,
    ep: &DmaEndpoint,
    addr: u64,
    len: u64,
    write: bool,
) -> Result<u64> {
    match *ep {
        DmaEndpoint::Virtual { kind, pid, .. } => translator.translate(kind, pid, addr, len, write),
        DmaEndpoint::Physical { .. } => Ok(addr),
    }
}

/// Split a transfer into entries. Both addresses and the length are already
/// validated 8-byte aligned by the caller.
pub fn build_entries(
    translator: &dyn DmaTranslator,
    src: &DmaEndpoint,
    dst: &DmaEndpoint,
    len: u64,
) -> Vec<Arc<ReqEntry>> {
    let mut entries: Vec<Arc<ReqEntry>> = Vec::new();
    let src_space = src.kind().hw_space();
    let dst_space = dst.kind().hw_space();
    let mut off = 0u64;

    while off < len {
        let src_addr = src.addr() + off;
        let dst_addr = dst.addr() + off;
        let chunk = (len - off)
            .min(boundary_distance(src.kind(), src_addr))
            .min(boundary_distance(dst.kind(), dst_addr));

        let translated = translate_side(translator, src, src_addr, chunk, false)
            .and_then(|s| translate_side(translator, dst, dst_addr, chunk, true).map(|d| (s, d)));

        match translated {
            Ok((src_phys, dst_phys)) => {
                // Merge with the previous fragment when both physical runs
                // continue it.
                if let Some(prev) = entries.last() {
                    if prev.state() == EntryState::Waiting
                        && prev.src_phys + prev.len == src_phys
                        && prev.dst_phys + prev.len == dst_phys
                    {
                        let merged = Arc::new(ReqEntry::new(
                            src_space,
                            dst_space,
                            prev.src_phys,
                            prev.dst_phys,
                            prev.len + chunk,
                        ));
                        *entries.last_mut().unwrap() = merged;
                        off += chunk;
                        continue;
                    }
                }
                entries.push(Arc::new(ReqEntry::new(
                    src_space, dst_space, src_phys, dst_phys, chunk,
                )));
            }
            Err(_) => {
                log::debug!(
                    "translation failed for fragment src={src_addr:#x} dst={dst_addr:#x} len={chunk:#x}"
                );
                entries.push(Arc::new(ReqEntry::new_failed(chunk)));
            }
        }
        off += chunk;
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VeosError;

    struct Identity;

    impl DmaTranslator for Identity {
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

    /// Pages at even 2 MiB indexes translate, odd ones fault.
    struct OddPagesFault;

    impl DmaTranslator for OddPagesFault {
        fn translate(
            &self,
            kind: AddrKind,
            _pid: Pid,
            addr: u64,
            _len: u64,
            _write: bool,
        ) -> Result<u64> {
            if kind.is_ve() && (addr / VE_PAGE_SIZE) % 2 == 1 {
                Err(VeosError::TranslationFault { addr })
            } else {
                Ok(addr)
            }
        }
    }

    #[test]
    fn test_contiguous_fragments_merge() {
        // Identity translation makes every neighbouring fragment
        // contiguous, so a multi-page transfer collapses to one entry.
        let src = DmaEndpoint::ve_virt(1, 0);
        let dst = DmaEndpoint::host_virt(2, 0);
        let entries = build_entries(&Identity, &src, &dst, 3 * VE_PAGE_SIZE);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].len, 3 * VE_PAGE_SIZE);
    }

    #[test]
    fn test_cut_honors_smaller_boundary() {
        // Host side is offset so its 4 KiB boundary arrives first.
        let src = DmaEndpoint::ve_virt(1, 0);
        let dst = DmaEndpoint::host_virt(2, VH_PAGE_SIZE - 8);
        let entries = build_entries(&Identity, &src, &dst, 24);
        // 8 bytes to the host boundary, then the 16-byte remainder; the
        // second fragment is not host-contiguous... identity keeps it
        // contiguous, so both merge back into one entry.
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].len, 24);
    }

    #[test]
    fn test_translation_fault_poisons_single_entry() {
        let src = DmaEndpoint::ve_virt(1, 0);
        let dst = DmaEndpoint::host_phys(0x9000_0000);
        let entries = build_entries(&OddPagesFault, &src, &dst, 3 * VE_PAGE_SIZE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].state(), EntryState::Waiting);
        assert_eq!(entries[1].state(), EntryState::Failed);
        assert_eq!(entries[2].state(), EntryState::Waiting);
    }

    #[test]
    fn test_physical_endpoints_have_no_boundary() {
        let src = DmaEndpoint::ve_phys(0x100_0000);
        let dst = DmaEndpoint::host_phys(0x200_0000);
        let entries = build_entries(&Identity, &src, &dst, 8 * VE_PAGE_SIZE);
        assert_eq!(entries.len(), 1);
    }
}
