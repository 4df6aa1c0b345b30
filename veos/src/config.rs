//! Node configuration.
//!
//! One VE node is served per daemon instance. The paths here are the ones the
//! launch wrapper would otherwise resolve: the driver character device, the
//! request socket, and the driver sysfs directory carrying the dead-PID
//! attribute file.

use std::path::PathBuf;

/// Default directory for the request socket.
const DEFAULT_STATE_DIR: &str = "/var/opt/nec/ve/veos";

/// Per-node configuration consumed by `VeNode::new`.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// VE node number.
    pub node_id: usize,
    /// VE driver character device (`/dev/veslot<N>`).
    pub device_path: PathBuf,
    /// UNIX stream socket the pseudo processes connect to.
    pub socket_path: PathBuf,
    /// Driver sysfs directory for this node.
    pub sysfs_path: PathBuf,
    /// Path of the privilege-dropping core-dump helper binary.
    pub dump_helper_path: PathBuf,
    /// Number of VE cores exposed by the node.
    pub num_cores: usize,
}

impl NodeConfig {
    /// Configuration for `node_id` with the standard install paths.
    pub fn for_node(node_id: usize) -> Self {
        let state_dir =
            std::env::var("VEOS_STATE_DIR").unwrap_or_else(|_| DEFAULT_STATE_DIR.to_string());
        Self {
            node_id,
            device_path: PathBuf::from(format!("/dev/veslot{node_id}")),
            socket_path: PathBuf::from(format!("{state_dir}/veos{node_id}.sock")),
            sysfs_path: PathBuf::from(format!("/sys/class/ve/ve{node_id}")),
            dump_helper_path: PathBuf::from(
                std::env::var("VEOS_DUMP_HELPER")
                    .unwrap_or_else(|_| "/opt/nec/ve/libexec/ve-coredump-helper".to_string()),
            ),
            num_cores: 8,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::for_node(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths_carry_node_id() {
        let cfg = NodeConfig::for_node(3);
        assert_eq!(cfg.device_path, PathBuf::from("/dev/veslot3"));
        assert!(cfg.socket_path.to_string_lossy().ends_with("veos3.sock"));
        assert!(cfg.sysfs_path.to_string_lossy().ends_with("ve3"));
    }
}
