//! Signal frame written to the VE stack.
//!
//! The frame layout and the trampoline words are an ABI contract with VE
//! user code: the handler receives pointers into the frame, and the
//! trampoline at its top invokes the sigreturn pseudo-syscall when the
//! handler returns. Everything here is a fixed binary blob, not a
//! source-level convenience structure.

use core::mem::{offset_of, size_of};
use std::alloc::{alloc_zeroed, handle_alloc_error, Layout};

use crate::signal::SigInfo;
use crate::task::regs::RegSet;

/// Size of the per-task LSHM partition snapshotted into each frame.
pub const LSHM_SIZE: usize = 96;

/// Space reserved below the frame for the handler's register-save area.
pub const HANDLER_STACK_FRAME: u64 = 512;

/// Sigreturn trampoline instructions, little-endian.
pub const TRAMPOLINE: [u64; 5] = [
    0x462e_aeae_0000_0000,
    0x012e_008e_0000_0018,
    0x4500_0f00_0000_0000,
    0x3100_03ae_0000_0000,
    0x3f00_0000_0000_0000,
];

/// Minimum usable alternate-stack size: one frame plus the handler's own
/// stack frame.
pub const VE_MINSIGSTKSZ: u64 = size_of::<SigFrame>() as u64 + HANDLER_STACK_FRAME;

/// Stack descriptor embedded in the ucontext (`stack_t` shape).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigStack {
    pub sp: u64,
    pub flags: i32,
    _pad: i32,
    pub size: u64,
}

impl SigStack {
    pub fn new(sp: u64, size: u64, flags: i32) -> Self {
        Self {
            sp,
            flags,
            _pad: 0,
            size,
        }
    }
}

/// User context saved across handler execution.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UContext {
    pub flags: u64,
    pub link: u64,
    pub stack: SigStack,
    /// Blocked mask to restore on sigreturn.
    pub sigmask: u64,
    /// Pad the mask area to 1024 bits.
    _unused: [u8; 120],
    /// Register image at the moment of delivery.
    pub mcontext: RegSet,
}

/// Complete signal frame as laid out in VE stack memory.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SigFrame {
    pub tramp: [u64; 5],
    pub info: SigInfo,
    pub uc: UContext,
    pub lshm_area: [u8; LSHM_SIZE],
    /// Non-zero when the delivered signal came from a fatal hardware
    /// exception; sigreturn then terminates instead of resuming.
    pub flag: u64,
    pub signum: u64,
}

impl SigFrame {
    /// Heap-allocate a zeroed frame.
    pub fn new_boxed() -> Box<SigFrame> {
        let layout = Layout::new::<SigFrame>();
        // SAFETY: SigFrame is repr(C) and contains only plain integers and
        // byte arrays, so the all-zero pattern is a valid value. The pointer
        // comes from the global allocator with SigFrame's own layout.
        unsafe {
            let ptr = alloc_zeroed(layout) as *mut SigFrame;
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        }
    }

    /// Offset of the siginfo payload, handed to the handler in SR1.
    pub const fn siginfo_offset() -> u64 {
        offset_of!(SigFrame, info) as u64
    }

    /// Offset of the ucontext, handed to the handler in SR2.
    pub const fn ucontext_offset() -> u64 {
        offset_of!(SigFrame, uc) as u64
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: SigFrame is repr(C), fully initialized, and has no
        // padding-only niches a reader could misinterpret; the slice covers
        // exactly the frame's own bytes for the lifetime of &self.
        unsafe {
            core::slice::from_raw_parts(self as *const SigFrame as *const u8, size_of::<SigFrame>())
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; every bit pattern is a valid SigFrame, so
        // arbitrary writes through the slice cannot produce an invalid
        // value.
        unsafe {
            core::slice::from_raw_parts_mut(self as *mut SigFrame as *mut u8, size_of::<SigFrame>())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trampoline_words() {
        assert_eq!(TRAMPOLINE[0], 0x462eaeae00000000);
        assert_eq!(TRAMPOLINE[4], 0x3f00000000000000);
    }

    #[test]
    fn test_frame_starts_with_trampoline() {
        assert_eq!(offset_of!(SigFrame, tramp), 0);
        assert_eq!(SigFrame::siginfo_offset(), 40);
    }

    #[test]
    fn test_minsigstksz_covers_frame() {
        assert!(VE_MINSIGSTKSZ > size_of::<SigFrame>() as u64);
    }

    #[test]
    fn test_frame_byte_view_round_trip() {
        let mut frame = SigFrame::new_boxed();
        frame.tramp = TRAMPOLINE;
        frame.signum = 11;
        frame.uc.mcontext.ic = 0xdead_beef;
        let bytes = frame.as_bytes().to_vec();

        let mut copy = SigFrame::new_boxed();
        copy.as_bytes_mut().copy_from_slice(&bytes);
        assert_eq!(copy.signum, 11);
        assert_eq!(copy.uc.mcontext.ic, 0xdead_beef);
        assert_eq!(copy.tramp, TRAMPOLINE);
    }
}
