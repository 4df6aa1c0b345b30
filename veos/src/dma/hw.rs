//! DMA descriptor register shim.
//!
//! Everything the engine needs from the memory-mapped control window sits
//! behind `DmaHw`, so the engine logic runs unmodified against the real
//! window or the software double in `testing`. Writes that publish new work
//! must be followed by `commit_order` before the start bit is raised.

use std::sync::Arc;
use std::time::Duration;

use crate::driver::{VeDriver, VeslotDriver};
use crate::error::{Result, VeosError};

/// Number of descriptor slots in the hardware ring.
pub const NUM_DESC: usize = 128;

/// Control/status register bits.
pub const CTL_START: u32 = 0x1;
pub const CTL_STOP: u32 = 0x2;
pub const CTL_STATUS_RUN: u32 = 0x1;
pub const CTL_STATUS_HALT: u32 = 0x2;
pub const CTL_STATUS_MASK: u32 = 0x3;

/// Per-descriptor status word bits.
pub const DESC_DONE: u32 = 0x1;
pub const DESC_EXCEPTION: u32 = 0x2;

/// Physical address space selector in a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HwSpace {
    HostBus = 0,
    VeMem = 1,
    VeReg = 2,
}

/// One hardware descriptor as the engine programs it: both addresses are
/// already physical for their selected space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwDesc {
    pub src_space: HwSpace,
    pub dst_space: HwSpace,
    pub src: u64,
    pub dst: u64,
    pub len: u64,
}

/// Access to the DMA control window of one node.
pub trait DmaHw: Send + Sync {
    fn ctl_status(&self) -> u32;
    /// Raise the start bit.
    fn start(&self);
    /// Request a halt; completion is observed through `ctl_status`.
    fn post_stop(&self);
    fn post_descriptor(&self, slot: usize, desc: &HwDesc);
    fn clear_descriptor(&self, slot: usize);
    fn descriptor_status(&self, slot: usize) -> u32;
    /// Ring read cursor as the hardware reports it.
    fn read_ptr(&self) -> usize;
    /// Wait for a completion interrupt or `timeout`.
    fn wait_interrupt(&self, timeout: Duration) -> Result<bool>;
    /// Order-commit barrier: all previous register writes become visible to
    /// the device before any later read or start.
    fn commit_order(&self);
}

#[repr(C)]
struct DescRegs {
    ctl: u32,
    status: u32,
    src_space: u32,
    dst_space: u32,
    src: u64,
    dst: u64,
    len: u64,
}

#[repr(C)]
struct ControlRegs {
    ctl: u32,
    status: u32,
    read_ptr: u32,
    _pad: u32,
    descs: [DescRegs; NUM_DESC],
}

/// `DmaHw` over the real memory-mapped control window.
pub struct MmioDmaHw {
    regs: *mut ControlRegs,
    driver: Arc<VeslotDriver>,
}

// SAFETY: the register window is device memory accessed exclusively through
// volatile reads and writes below; the device itself serializes concurrent
// register access, and the engine additionally serializes all mutation under
// its mutex.
unsafe impl Send for MmioDmaHw {}
unsafe impl Sync for MmioDmaHw {}

impl MmioDmaHw {
    /// Map the control window of the node served by `driver`.
    pub fn map(driver: Arc<VeslotDriver>) -> Result<Self> {
        let len = core::mem::size_of::<ControlRegs>();
        // SAFETY: mapping a shared register window from the driver fd; the
        // fd stays open for the lifetime of self because the driver Arc is
        // stored alongside the pointer.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                driver.device_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(VeosError::Io(std::io::Error::last_os_error()));
        }
        Ok(Self {
            regs: ptr as *mut ControlRegs,
            driver,
        })
    }
}

impl Drop for MmioDmaHw {
    fn drop(&mut self) {
        // SAFETY: unmapping the window mapped in `map` with the same length.
        unsafe {
            libc::munmap(self.regs as *mut libc::c_void, core::mem::size_of::<ControlRegs>());
        }
    }
}

impl DmaHw for MmioDmaHw {
    fn ctl_status(&self) -> u32 {
        // SAFETY: regs points to the live mapped window for the lifetime of
        // self; all accesses are volatile.
        unsafe { core::ptr::read_volatile(&(*self.regs).status) }
    }

    fn start(&self) {
        // SAFETY: as above.
        unsafe { core::ptr::write_volatile(&mut (*self.regs).ctl, CTL_START) }
    }

    fn post_stop(&self) {
        // SAFETY: as above.
        unsafe { core::ptr::write_volatile(&mut (*self.regs).ctl, CTL_STOP) }
    }

    fn post_descriptor(&self, slot: usize, desc: &HwDesc) {
        debug_assert!(slot < NUM_DESC);
        // SAFETY: slot is bounded by NUM_DESC; field-wise volatile writes
        // into the mapped descriptor block.
        unsafe {
            let d = &mut (*self.regs).descs[slot];
            core::ptr::write_volatile(&mut d.src_space, desc.src_space as u32);
            core::ptr::write_volatile(&mut d.dst_space, desc.dst_space as u32);
            core::ptr::write_volatile(&mut d.src, desc.src);
            core::ptr::write_volatile(&mut d.dst, desc.dst);
            core::ptr::write_volatile(&mut d.len, desc.len);
            core::ptr::write_volatile(&mut d.status, 0);
            core::ptr::write_volatile(&mut d.ctl, 1);
        }
    }

    fn clear_descriptor(&self, slot: usize) {
        debug_assert!(slot < NUM_DESC);
        // SAFETY: as above.
        unsafe {
            let d = &mut (*self.regs).descs[slot];
            core::ptr::write_volatile(&mut d.ctl, 0);
            core::ptr::write_volatile(&mut d.status, 0);
        }
    }

    fn descriptor_status(&self, slot: usize) -> u32 {
        debug_assert!(slot < NUM_DESC);
        // SAFETY: as above.
        unsafe { core::ptr::read_volatile(&(*self.regs).descs[slot].status) }
    }

    fn read_ptr(&self) -> usize {
        // SAFETY: as above.
        (unsafe { core::ptr::read_volatile(&(*self.regs).read_ptr) } as usize) % NUM_DESC
    }

    fn wait_interrupt(&self, timeout: Duration) -> Result<bool> {
        self.driver.wait_interrupt(timeout)
    }

    fn commit_order(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        // A posted-write flush: reading any window register forces earlier
        // writes out to the device.
        let _ = self.ctl_status();
    }
}
