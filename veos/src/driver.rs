//! VE driver seam.
//!
//! The driver character device delivers DMA completion interrupts, pins host
//! pages for bus-address DMA, and exposes the dead-PID sysfs attribute the
//! polling thread watches. Only the operations the core needs are modeled;
//! everything else about the device stays behind this trait so the DMA
//! engine and the polling thread can run against test doubles.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, VeosError};
use crate::task::Pid;

/// Access to the VE driver for one node.
pub trait VeDriver: Send + Sync {
    /// Block until a DMA completion interrupt or `timeout`. Returns whether
    /// an interrupt was observed.
    fn wait_interrupt(&self, timeout: Duration) -> Result<bool>;

    /// Translate a pinned host virtual address to a system-bus address.
    fn pin_host(&self, pid: Pid, vaddr: u64, len: u64) -> Result<u64>;

    /// Driver sysfs directory carrying the dead-PID attribute file.
    fn sysfs_path(&self) -> &Path;
}

/// Driver handle backed by `/dev/veslot<N>`.
pub struct VeslotDriver {
    device: File,
    sysfs: PathBuf,
}

impl VeslotDriver {
    pub fn open(device_path: &Path, sysfs: PathBuf) -> Result<Self> {
        let device = OpenOptions::new().read(true).write(true).open(device_path)?;
        Ok(Self { device, sysfs })
    }

    pub fn device_fd(&self) -> i32 {
        self.device.as_raw_fd()
    }
}

impl VeDriver for VeslotDriver {
    fn wait_interrupt(&self, timeout: Duration) -> Result<bool> {
        let mut fds = libc::pollfd {
            fd: self.device.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        // SAFETY: `fds` is a valid pollfd array of length 1 for the duration
        // of the call.
        let rv = unsafe { libc::poll(&mut fds, 1, millis) };
        match rv {
            -1 => Err(VeosError::Io(std::io::Error::last_os_error())),
            0 => Ok(false),
            _ => Ok(fds.revents & libc::POLLIN != 0),
        }
    }

    fn pin_host(&self, _pid: Pid, vaddr: u64, _len: u64) -> Result<u64> {
        // The production driver resolves VHVA to VHSAA through a pin ioctl.
        // The host IOMMU on supported platforms presents pinned pages at
        // their virtual address, so the identity mapping is used here.
        Ok(vaddr)
    }

    fn sysfs_path(&self) -> &Path {
        &self.sysfs
    }
}
