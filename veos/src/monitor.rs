//! Host-state mirror threads.
//!
//! The stopping thread propagates host-side job-control stops onto VE
//! tasks; the polling thread harvests death notifications from the driver's
//! dead-PID sysfs attribute. Both honor the node terminate flag and never
//! race a request handler thanks to the handling-request read lock.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::node::VeNode;
use crate::signal::send::{group_stop, StopMode};
use crate::signal::SIGKILL;
use crate::task::TaskState;

/// Pause between stopping-thread passes.
const STOP_PASS_DELAY: Duration = Duration::from_millis(1);
/// Condvar re-check period while no process exists.
const STOP_IDLE_WAIT: Duration = Duration::from_millis(100);
/// Poll timeout on the dead-PID attribute.
const DEAD_PID_POLL_TIMEOUT_MS: i32 = 1000;

/// One pass of the stopping thread over all processes. Returns false when
/// the pass was cut short by shutdown.
pub fn stopping_pass(node: &Arc<VeNode>) -> bool {
    for task in node.registry.processes() {
        if task.main.lock().ptraced {
            // The tracer owns stop/start of traced tasks.
            continue;
        }
        if task.state() == TaskState::Stop {
            continue;
        }
        let Some(_guard) = node.handling_request_lock.try_read() else {
            // The write side is only ever taken by shutdown.
            return false;
        };
        let Ok(status) = node.proc.status(task.pid) else {
            warn!("failed to read pseudo process state for {}", task.pid);
            continue;
        };
        if status.state == 'T' {
            debug!("stopping VE process {}: pseudo process is stopped", task.pid);
            let _tasklist = node.tasklist_lock.lock();
            group_stop(node, &task, StopMode::StopProc);
        }
    }
    true
}

/// Mirror pseudo-process stops onto VE task state until shutdown.
pub fn stopping_thread(node: Arc<VeNode>) {
    info!("stopping thread running");
    while !node.terminating() {
        if !node.wait_for_processes(STOP_IDLE_WAIT) {
            break;
        }
        if !stopping_pass(&node) {
            break;
        }
        std::thread::sleep(STOP_PASS_DELAY);
    }
    info!("stopping thread exiting");
}

/// Apply one buffer read from the dead-PID attribute: tokenize on
/// whitespace, mark each task dead with a default exit code, and drop the
/// registry reference. Returns false when shutdown interrupted the walk.
pub fn process_dead_pids(node: &Arc<VeNode>, buf: &str) -> bool {
    for tok in buf.split_whitespace() {
        let Ok(pid) = tok.parse::<i32>() else {
            continue;
        };
        if pid == 0 {
            continue;
        }
        let Some(_guard) = node.handling_request_lock.try_read() else {
            return false;
        };
        debug!("cleanup for dead pid {pid}");
        let Some(task) = node.registry.lookup(pid) else {
            warn!("pid {pid} not found, task deletion skipped");
            continue;
        };
        {
            let mut main = task.main.lock();
            main.state = TaskState::Zombie;
            if !main.exit_code_set {
                main.exit_code = SIGKILL;
                main.exit_code_set = true;
            }
        }
        // Drop the registry reference so the reaper can finalize.
        node.remove_task(pid);
    }
    true
}

/// Watch the driver's dead-PID attribute and clean up exited tasks.
pub fn polling_thread(node: Arc<VeNode>) {
    let path = node.config.sysfs_path.join("task_id_dead");
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(err) => {
            error!("unable to open {}: {err}", path.display());
            return;
        }
    };
    info!("polling thread watching {}", path.display());

    while !node.terminating() {
        let mut fds = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLPRI,
            revents: 0,
        };
        // SAFETY: fds is a valid single-element pollfd array for the call.
        let rv = unsafe { libc::poll(&mut fds, 1, DEAD_PID_POLL_TIMEOUT_MS) };
        if rv == -1 {
            error!("polling the dead-PID attribute failed");
            break;
        }
        if rv == 0 || fds.revents & libc::POLLPRI == 0 {
            continue;
        }

        // Sysfs requires a read plus rewind for the next POLLPRI to arm.
        let mut dummy = [0u8; 16];
        let _ = file.read(&mut dummy);
        if file.seek(SeekFrom::Start(0)).is_err() {
            break;
        }
        let mut buf = String::new();
        if file.read_to_string(&mut buf).is_err() {
            error!("error reading dead pids");
            break;
        }
        if file.seek(SeekFrom::Start(0)).is_err() {
            break;
        }
        if !process_dead_pids(&node, &buf) {
            break;
        }
    }
    info!("polling thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SIGKILL;
    use crate::testing::TestRig;

    #[test]
    fn test_stopping_pass_mirrors_host_stop() {
        let rig = TestRig::new();
        let task = rig.spawn_process(300);
        task.set_state(TaskState::Running);

        rig.proc.set_state(300, 'T');
        assert!(stopping_pass(&rig.node));
        assert_eq!(task.state(), TaskState::Stop);
    }

    #[test]
    fn test_stopping_pass_skips_running_and_ptraced() {
        let rig = TestRig::new();
        let running = rig.spawn_process(301);
        running.set_state(TaskState::Running);
        rig.proc.set_state(301, 'S');

        let traced = rig.spawn_process(302);
        traced.set_state(TaskState::Running);
        traced.main.lock().ptraced = true;
        rig.proc.set_state(302, 'T');

        assert!(stopping_pass(&rig.node));
        assert_eq!(running.state(), TaskState::Running);
        assert_eq!(traced.state(), TaskState::Running);
    }

    #[test]
    fn test_dead_pid_buffer_tokenized_and_cleaned() {
        let rig = TestRig::new();
        let doomed = rig.spawn_process(310);
        let survivor = rig.spawn_process(311);

        assert!(process_dead_pids(&rig.node, " 310 \n 9999 "));
        assert!(rig.node.registry.lookup(310).is_none());
        assert!(rig.node.registry.lookup(311).is_some());

        let main = doomed.main.lock();
        assert_eq!(main.state, TaskState::Zombie);
        assert!(main.exit_code_set);
        assert_eq!(main.exit_code, SIGKILL);
        drop(main);
        let _ = survivor;
    }

    #[test]
    fn test_dead_pid_preset_exit_code_kept() {
        let rig = TestRig::new();
        let task = rig.spawn_process(312);
        {
            let mut main = task.main.lock();
            main.exit_code = 7;
            main.exit_code_set = true;
        }
        assert!(process_dead_pids(&rig.node, "312"));
        assert_eq!(task.main.lock().exit_code, 7);
    }
}
