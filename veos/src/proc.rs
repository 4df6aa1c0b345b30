//! Host `/proc` access for pseudo-process state.
//!
//! The stopping thread and the group-stop path need to know whether a pseudo
//! process is actually stopped on the host before mirroring the state onto
//! the VE task. Reads go through the `ProcSource` seam so tests can supply
//! canned process states.

use std::fs;

use crate::error::{Result, VeosError};
use crate::task::Pid;

/// Fields of `/proc/<pid>/status` the service consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStatus {
    /// Single-letter process state (`R`, `S`, `T`, `Z`, ...).
    pub state: char,
    /// Effective uid.
    pub euid: u32,
    /// Saved uid.
    pub suid: u32,
    /// Effective capability set.
    pub cap_eff: u64,
}

impl ProcStatus {
    /// Whether the process holds CAP_KILL.
    pub fn has_cap_kill(&self) -> bool {
        self.cap_eff & (1 << 5) != 0
    }
}

/// Source of pseudo-process status information.
pub trait ProcSource: Send + Sync {
    fn status(&self, pid: Pid) -> Result<ProcStatus>;

    /// Whether the pseudo process is stopped (`T`) on the host.
    fn is_actually_stopped(&self, pid: Pid) -> bool {
        matches!(self.status(pid), Ok(st) if st.state == 'T')
    }
}

/// `ProcSource` backed by the real `/proc` filesystem.
pub struct HostProc;

impl ProcSource for HostProc {
    fn status(&self, pid: Pid) -> Result<ProcStatus> {
        let text = fs::read_to_string(format!("/proc/{pid}/status")).map_err(|_| {
            VeosError::NotFound {
                resource: "pseudo process",
                id: pid as u64,
            }
        })?;
        parse_status(&text).ok_or(VeosError::NotFound {
            resource: "pseudo process",
            id: pid as u64,
        })
    }
}

/// Parse the `State:` and `Uid:` lines of a status file.
pub fn parse_status(text: &str) -> Option<ProcStatus> {
    let mut state = None;
    let mut euid = None;
    let mut suid = None;
    let mut cap_eff = 0;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("State:") {
            state = rest.trim_start().chars().next();
        } else if let Some(rest) = line.strip_prefix("Uid:") {
            // Real, effective, saved, filesystem.
            let mut fields = rest.split_whitespace();
            let _real = fields.next();
            euid = fields.next().and_then(|f| f.parse().ok());
            suid = fields.next().and_then(|f| f.parse().ok());
        } else if let Some(rest) = line.strip_prefix("CapEff:") {
            cap_eff = u64::from_str_radix(rest.trim(), 16).unwrap_or(0);
        }
    }
    Some(ProcStatus {
        state: state?,
        euid: euid?,
        suid: suid?,
        cap_eff,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Name:\tve_exec\nState:\tT (stopped)\nTgid:\t100\nPid:\t100\nUid:\t1000\t1000\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\n";

    #[test]
    fn test_parse_status_stopped() {
        let st = parse_status(SAMPLE).unwrap();
        assert_eq!(st.state, 'T');
        assert_eq!(st.euid, 1000);
        assert_eq!(st.suid, 1000);
    }

    #[test]
    fn test_parse_status_missing_fields() {
        assert!(parse_status("Name:\tx\n").is_none());
    }
}
