//! VE memory map and address translation.
//!
//! VE pages are tracked at the fixed 2 MiB granularity; huge mappings are a
//! multiple of it and physically contiguous fragments are merged again by
//! the DMA request builder, so nothing is lost by the single page size.

pub mod transfer;

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::{Result, VeosError};

/// VE page size (2 MiB).
pub const VE_PAGE_SHIFT: u32 = 21;
pub const VE_PAGE_SIZE: u64 = 1 << VE_PAGE_SHIFT;
/// Host page size.
pub const VH_PAGE_SHIFT: u32 = 12;
pub const VH_PAGE_SIZE: u64 = 1 << VH_PAGE_SHIFT;

#[derive(Debug, Clone, Copy)]
struct VePage {
    phys: u64,
    writable: bool,
}

/// Page table of one VE address space.
#[derive(Debug, Default)]
pub struct VePageMap {
    pages: BTreeMap<u64, VePage>,
}

impl VePageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a mapping for the 2 MiB page containing `vaddr`.
    pub fn map_page(&mut self, vaddr: u64, phys: u64, writable: bool) {
        self.pages
            .insert(vaddr >> VE_PAGE_SHIFT, VePage { phys, writable });
    }

    pub fn unmap_page(&mut self, vaddr: u64) {
        self.pages.remove(&(vaddr >> VE_PAGE_SHIFT));
    }

    /// Translate `vaddr`, optionally enforcing write permission.
    pub fn translate(&self, vaddr: u64, write: bool, prot_check: bool) -> Result<u64> {
        let page = self
            .pages
            .get(&(vaddr >> VE_PAGE_SHIFT))
            .ok_or(VeosError::TranslationFault { addr: vaddr })?;
        if prot_check && write && !page.writable {
            return Err(VeosError::TranslationFault { addr: vaddr });
        }
        Ok(page.phys + (vaddr & (VE_PAGE_SIZE - 1)))
    }
}

/// Memory descriptor shared by a thread group.
///
/// The inner mutex is the thread-group memory lock; it is the lowest-but-two
/// lock in the service order (only the core lock and the engine mutex rank
/// below it).
pub struct VeMm {
    map: Mutex<VePageMap>,
}

impl VeMm {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(VePageMap::new()),
        }
    }

    pub fn map_page(&self, vaddr: u64, phys: u64, writable: bool) {
        self.map.lock().map_page(vaddr, phys, writable);
    }

    pub fn unmap_page(&self, vaddr: u64) {
        self.map.lock().unmap_page(vaddr);
    }

    /// Translation without a protection check.
    pub fn translate(&self, vaddr: u64) -> Result<u64> {
        self.map.lock().translate(vaddr, false, false)
    }

    /// Translation with the protection check applied for writes.
    pub fn translate_checked(&self, vaddr: u64, write: bool) -> Result<u64> {
        self.map.lock().translate(vaddr, write, true)
    }
}

impl Default for VeMm {
    fn default() -> Self {
        Self::new()
    }
}
