//! DMA engine manager.
//!
//! Moves data between host virtual, host bus-physical, VE virtual and VE
//! physical address spaces over a fixed-size hardware descriptor ring. The
//! public surface is `DmaEngine` (post / wait / test / timedwait / terminate
//! / terminate_all / close) plus the endpoint and status types shared with
//! the wire protocol.

pub mod engine;
pub mod hw;
pub mod reqlist;

pub use engine::{DmaEngine, DmaRequest, RingSnapshot};
pub use hw::{DmaHw, HwDesc, HwSpace, NUM_DESC};
pub use reqlist::DmaTranslator;

use crate::error::{Result, VeosError};
use crate::task::Pid;

/// Largest accepted transfer length.
pub const MAX_LENGTH: u64 = 0x7FFF_FFFF_FFFF_FFF8;

/// Address-space tag, stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AddrKind {
    /// VE virtual address, protection-checked.
    VeVirtual = 0,
    /// VE virtual address without the protection check.
    VeVirtualNoProt = 1,
    /// Host virtual address.
    HostVirtual = 2,
    /// VE absolute (physical) address.
    VePhysical = 3,
    /// VE register-access physical address.
    VeRegister = 4,
    /// Host system-bus physical address.
    HostPhysical = 5,
}

impl AddrKind {
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::VeVirtual),
            1 => Some(Self::VeVirtualNoProt),
            2 => Some(Self::HostVirtual),
            3 => Some(Self::VePhysical),
            4 => Some(Self::VeRegister),
            5 => Some(Self::HostPhysical),
            _ => None,
        }
    }

    pub fn is_virtual(self) -> bool {
        matches!(self, Self::VeVirtual | Self::VeVirtualNoProt | Self::HostVirtual)
    }

    pub fn is_ve(self) -> bool {
        matches!(
            self,
            Self::VeVirtual | Self::VeVirtualNoProt | Self::VePhysical | Self::VeRegister
        )
    }

    /// Physical target space a translated address of this kind lands in.
    pub fn hw_space(self) -> HwSpace {
        match self {
            Self::VeVirtual | Self::VeVirtualNoProt | Self::VePhysical => HwSpace::VeMem,
            Self::VeRegister => HwSpace::VeReg,
            Self::HostVirtual | Self::HostPhysical => HwSpace::HostBus,
        }
    }
}

/// One side of a transfer. Virtual endpoints carry the owning pid; physical
/// endpoints deliberately cannot.
#[derive(Debug, Clone, Copy)]
pub enum DmaEndpoint {
    Virtual { kind: AddrKind, pid: Pid, addr: u64 },
    Physical { kind: AddrKind, addr: u64 },
}

impl DmaEndpoint {
    pub fn ve_virt(pid: Pid, addr: u64) -> Self {
        Self::Virtual {
            kind: AddrKind::VeVirtual,
            pid,
            addr,
        }
    }

    pub fn ve_virt_no_prot(pid: Pid, addr: u64) -> Self {
        Self::Virtual {
            kind: AddrKind::VeVirtualNoProt,
            pid,
            addr,
        }
    }

    pub fn host_virt(pid: Pid, addr: u64) -> Self {
        Self::Virtual {
            kind: AddrKind::HostVirtual,
            pid,
            addr,
        }
    }

    pub fn ve_phys(addr: u64) -> Self {
        Self::Physical {
            kind: AddrKind::VePhysical,
            addr,
        }
    }

    pub fn ve_reg(addr: u64) -> Self {
        Self::Physical {
            kind: AddrKind::VeRegister,
            addr,
        }
    }

    pub fn host_phys(addr: u64) -> Self {
        Self::Physical {
            kind: AddrKind::HostPhysical,
            addr,
        }
    }

    /// Rebuild an endpoint from its wire encoding.
    pub fn from_wire(raw_kind: u32, pid: Pid, addr: u64) -> Result<Self> {
        let kind = AddrKind::from_wire(raw_kind).ok_or(VeosError::InvalidArgument {
            name: "addrtype",
            value: "unsupported address-space tag",
        })?;
        Ok(if kind.is_virtual() {
            Self::Virtual { kind, pid, addr }
        } else {
            Self::Physical { kind, addr }
        })
    }

    pub fn kind(&self) -> AddrKind {
        match *self {
            Self::Virtual { kind, .. } | Self::Physical { kind, .. } => kind,
        }
    }

    pub fn addr(&self) -> u64 {
        match *self {
            Self::Virtual { addr, .. } | Self::Physical { addr, .. } => addr,
        }
    }

    pub fn with_addr(&self, addr: u64) -> Self {
        match *self {
            Self::Virtual { kind, pid, .. } => Self::Virtual { kind, pid, addr },
            Self::Physical { kind, .. } => Self::Physical { kind, addr },
        }
    }
}

/// Status of a request or of the join over its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaStatus {
    Ok,
    NotFinished,
    Error,
    Canceled,
    Timedout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_kind_wire_round_trip() {
        for raw in 0..6 {
            let kind = AddrKind::from_wire(raw).unwrap();
            assert_eq!(kind as u32, raw);
        }
        assert!(AddrKind::from_wire(6).is_none());
    }

    #[test]
    fn test_endpoint_from_wire_picks_variant() {
        let v = DmaEndpoint::from_wire(0, 42, 0x1000).unwrap();
        assert!(matches!(v, DmaEndpoint::Virtual { pid: 42, .. }));
        let p = DmaEndpoint::from_wire(3, 42, 0x1000).unwrap();
        assert!(matches!(p, DmaEndpoint::Physical { .. }));
        assert!(DmaEndpoint::from_wire(9, 0, 0).is_err());
    }

    #[test]
    fn test_hw_space_mapping() {
        assert_eq!(AddrKind::VeVirtual.hw_space(), HwSpace::VeMem);
        assert_eq!(AddrKind::HostVirtual.hw_space(), HwSpace::HostBus);
        assert_eq!(AddrKind::VeRegister.hw_space(), HwSpace::VeReg);
    }
}
