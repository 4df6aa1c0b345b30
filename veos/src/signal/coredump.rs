//! Core-dump orchestration.
//!
//! The service runs as root, so it must not create the core file itself: a
//! helper binary is forked with the target process's credentials, opens the
//! file, and ships the descriptor back over a socketpair with SCM_RIGHTS.
//! The ELF writer itself is an external collaborator behind `CoreWriter`.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info};

use crate::error::{Result, VeosError};
use crate::node::VeNode;
use crate::signal::send::{group_stop, StopMode};
use crate::signal::{SigInfo, SIGKILL};
use crate::task::{GroupState, VeTask};

/// Host core-pattern file.
pub const CORE_PATTERN_FILE: &str = "/proc/sys/kernel/core_pattern";

/// External ELF core writer.
pub trait CoreWriter: Send + Sync {
    /// Dump `task`'s image through `fd`. Returns whether the dump is
    /// complete and within RLIMIT_CORE.
    fn write_core(&self, fd: i32, task: &Arc<VeTask>, info: &SigInfo) -> bool;
}

/// Placeholder writer used until the ELF dumper is attached.
pub struct NoopCoreWriter;

impl CoreWriter for NoopCoreWriter {
    fn write_core(&self, fd: i32, task: &Arc<VeTask>, _info: &SigInfo) -> bool {
        debug!("core writer invoked for {} on fd {fd}", task.pid);
        true
    }
}

/// Expand a core_pattern into the VE core file name.
///
/// Supported tokens: `%p` (tgid), `%h` (hostname), `%%`; other `%X` escapes
/// are dropped. A leading `|` replaces the whole pattern with
/// `<exec_dir>/core`. Relative results are prefixed with the VE executable's
/// directory, and `.<tgid>.ve` (or just `.ve` when `%p` appeared) is
/// appended.
pub fn expand_core_pattern(pattern: &str, tgid: i32, hostname: &str, exec_dir: &Path) -> PathBuf {
    let mut name = String::new();
    let mut pid_in_pattern = false;

    if pattern.starts_with('|') {
        name = format!("{}/core", exec_dir.display());
        return PathBuf::from(format!("{name}.{tgid}.ve"));
    }

    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\n' => continue,
            '%' => match chars.next() {
                // A lone % at the end is dropped with the rest.
                None => break,
                Some('%') => name.push('%'),
                Some('p') => {
                    name.push_str(&tgid.to_string());
                    pid_in_pattern = true;
                }
                Some('h') => name.push_str(hostname),
                Some(other) => {
                    debug!("core_pattern token %{other} not supported");
                }
            },
            c => name.push(c),
        }
    }

    if !name.starts_with('/') && exec_dir != Path::new("") {
        name = format!("{}/{}", exec_dir.display(), name);
    }
    if pid_in_pattern {
        PathBuf::from(format!("{name}.ve"))
    } else {
        PathBuf::from(format!("{name}.{tgid}.ve"))
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is a valid writable buffer of its own length; gethostname
    // NUL-terminates on success.
    let rv = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rv != 0 {
        return String::new();
    }
    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Receive the core-file descriptor from the helper. Unexpected ancillary
/// data is rejected.
pub fn recv_corefile_fd(sockfd: i32) -> Result<i32> {
    let mut real_data = 0i32;
    let mut iov = libc::iovec {
        iov_base: &mut real_data as *mut i32 as *mut libc::c_void,
        iov_len: core::mem::size_of::<i32>(),
    };
    // Control buffer sized for exactly one descriptor.
    let mut control = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { core::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len();

    // SAFETY: msg points at valid iovec and control buffers for the call.
    let size = unsafe { libc::recvmsg(sockfd, &mut msg, libc::MSG_WAITALL) };
    if size <= 0 {
        return Err(VeosError::Io(std::io::Error::last_os_error()));
    }

    // SAFETY: msg was filled in by recvmsg; CMSG_* walk the control buffer
    // it references.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_len as usize != libc::CMSG_LEN(core::mem::size_of::<i32>() as u32) as usize
        {
            return Err(VeosError::InvalidArgument {
                name: "cmsg",
                value: "bad control message length",
            });
        }
        if (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(VeosError::InvalidArgument {
                name: "cmsg",
                value: "unexpected control message type",
            });
        }
        let fd = *(libc::CMSG_DATA(cmsg) as *const i32);
        Ok(fd)
    }
}

/// Fork the helper with the target's credentials. Returns the helper pid.
fn fork_helper(helper: &Path, corename: &Path, child_fd: i32, uid: u32, gid: u32) -> Result<i32> {
    let helper_c = CString::new(helper.as_os_str().as_bytes()).map_err(|_| {
        VeosError::InvalidArgument {
            name: "helper path",
            value: "embedded NUL",
        }
    })?;
    let corename_c = CString::new(corename.as_os_str().as_bytes()).map_err(|_| {
        VeosError::InvalidArgument {
            name: "core file name",
            value: "embedded NUL",
        }
    })?;
    let fd_c = CString::new(child_fd.to_string()).expect("fd string has no NUL");
    let argv0 = CString::new("ve-coredump-helper").expect("static string");

    // SAFETY: after fork the child only calls async-signal-safe functions
    // (setgid, setuid, close, execv, _exit).
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(VeosError::Io(std::io::Error::last_os_error())),
        0 => unsafe {
            if libc::setgid(gid) == -1 || libc::setuid(uid) == -1 {
                libc::_exit(1);
            }
            let argv = [
                argv0.as_ptr(),
                corename_c.as_ptr(),
                fd_c.as_ptr(),
                core::ptr::null(),
            ];
            libc::execv(helper_c.as_ptr(), argv.as_ptr());
            libc::_exit(1);
        },
        pid => Ok(pid),
    }
}

/// Start the detached dump worker.
pub fn spawn_dumper(
    node: Arc<VeNode>,
    task: Arc<VeTask>,
    info: SigInfo,
    signum: i32,
    hw_origin: bool,
) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("ve-coredump-{}", task.tgid))
        .spawn(move || do_coredump(&node, &task, info, signum, hw_origin))
        .map_err(VeosError::Io)?;
    Ok(())
}

fn do_coredump(node: &Arc<VeNode>, task: &Arc<VeTask>, info: SigInfo, signum: i32, hw_origin: bool) {
    info!("starting core dump for pid {} tgid {}", task.pid, task.tgid);
    let _del = task.sighand.del_lock.lock();

    {
        let _tasklist = node.tasklist_lock.lock();
        group_stop(node, task, StopMode::CleanThread);
    }

    let dump_ok = run_dump(node, task, &info);
    if !dump_ok {
        error!("core dump for {} failed or was skipped", task.tgid);
    }

    task.sighand.siglock.lock().group_state = GroupState::Exit;
    let kill_sig = if hw_origin { signum } else { SIGKILL };
    let _ = node.pseudo.kill(task.pid, kill_sig);
}

fn run_dump(node: &Arc<VeNode>, task: &Arc<VeTask>, info: &SigInfo) -> bool {
    if task.sighand.siglock.lock().rlim_core == 0 {
        debug!("RLIMIT_CORE is zero, dump disabled");
        return false;
    }

    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid two-element array for socketpair to fill.
    if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } != 0 {
        error!("failed to create the helper socket pair");
        return false;
    }
    let (child_fd, parent_fd) = (fds[0], fds[1]);

    let pattern = std::fs::read_to_string(CORE_PATTERN_FILE).unwrap_or_default();
    let exec_dir = task
        .ve_exec_path
        .parent()
        .unwrap_or(Path::new(""))
        .to_path_buf();
    let corename = expand_core_pattern(pattern.trim_end(), task.tgid, &hostname(), &exec_dir);
    debug!("core file name: {}", corename.display());

    let helper = fork_helper(
        &node.config.dump_helper_path,
        &corename,
        child_fd,
        task.uid,
        task.gid,
    );
    // SAFETY: closing our copy of the helper's socket end.
    unsafe { libc::close(child_fd) };
    if let Err(err) = helper {
        error!("failed to start the core dump helper: {err}");
        // SAFETY: closing the remaining socket end.
        unsafe { libc::close(parent_fd) };
        return false;
    }

    let result = match recv_corefile_fd(parent_fd) {
        Ok(fd) => {
            let ok = node.core_writer.write_core(fd, task, info);
            // SAFETY: closing the received descriptor after the dump.
            unsafe { libc::close(fd) };
            ok
        }
        Err(err) => {
            error!("failed to receive the core file descriptor: {err}");
            false
        }
    };
    // SAFETY: closing the remaining socket end.
    unsafe { libc::close(parent_fd) };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_plain_name_gets_dir_pid_suffix() {
        let name = expand_core_pattern("core", 1234, "host", Path::new("/home/user"));
        assert_eq!(name, PathBuf::from("/home/user/core.1234.ve"));
    }

    #[test]
    fn test_pattern_pid_token_suppresses_suffix_pid() {
        let name = expand_core_pattern("core-%p", 77, "host", Path::new("/x"));
        assert_eq!(name, PathBuf::from("/x/core-77.ve"));
    }

    #[test]
    fn test_pattern_hostname_and_percent() {
        let name = expand_core_pattern("/cores/%h-%%", 5, "ve0", Path::new("/x"));
        assert_eq!(name, PathBuf::from("/cores/ve0-%.5.ve"));
    }

    #[test]
    fn test_pattern_unknown_tokens_dropped() {
        let name = expand_core_pattern("/c/%e%t-core", 5, "h", Path::new(""));
        assert_eq!(name, PathBuf::from("/c/-core.5.ve"));
    }

    #[test]
    fn test_pattern_pipe_falls_back_to_exec_dir() {
        let name = expand_core_pattern("|/usr/lib/systemd-coredump %p", 9, "h", Path::new("/v"));
        assert_eq!(name, PathBuf::from("/v/core.9.ve"));
    }

    #[test]
    fn test_pattern_trailing_percent_dropped() {
        let name = expand_core_pattern("/c/core%", 3, "h", Path::new(""));
        assert_eq!(name, PathBuf::from("/c/core.3.ve"));
    }
}
