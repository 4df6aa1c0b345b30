//! Host-side OS services for a Vector Engine accelerator.
//!
//! Each VE workload is mirrored by a pseudo process on the host; this crate
//! owns the VE-side task model and the three subsystems behind it:
//!
//! - [`dma`]: request scheduling over the hardware descriptor ring;
//! - [`signal`]: POSIX-style signal generation, delivery and core dumps
//!   for tasks whose register state lives on the VE;
//! - [`mm`]: address translation and the aligned memory-transfer facade.
//!
//! [`node::VeNode`] ties them together with the task registry, the request
//! socket served by [`ipc::server`], and the monitor threads in
//! [`monitor`]. The [`testing`] module carries a software DMA device so the
//! whole stack runs without hardware.

pub mod config;
pub mod dma;
pub mod driver;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod mm;
pub mod monitor;
pub mod node;
pub mod proc;
pub mod signal;
pub mod task;
pub mod testing;

pub use error::{Result, VeosError};
