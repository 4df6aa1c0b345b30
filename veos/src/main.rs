//! veosd: serve one VE node.

use std::sync::Arc;

use log::{error, info};

use veos::config::NodeConfig;
use veos::dma::hw::MmioDmaHw;
use veos::driver::VeslotDriver;
use veos::ipc::server;
use veos::monitor;
use veos::node::{HostPseudoProc, NodeDeps, NullSched, VeNode};
use veos::proc::HostProc;
use veos::signal::coredump::NoopCoreWriter;

fn run() -> veos::Result<()> {
    let node_id = std::env::var("VEOS_NODE_ID")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let config = NodeConfig::for_node(node_id);

    let driver = Arc::new(VeslotDriver::open(
        &config.device_path,
        config.sysfs_path.clone(),
    )?);
    let hw = Arc::new(MmioDmaHw::map(driver.clone())?);

    let node = VeNode::new(
        config,
        hw,
        NodeDeps {
            driver: Some(driver),
            sched: Arc::new(NullSched),
            pseudo: Arc::new(HostPseudoProc),
            proc: Arc::new(HostProc),
            core_writer: Arc::new(NoopCoreWriter),
        },
    )?;

    let stopping = {
        let node = node.clone();
        std::thread::Builder::new()
            .name("veos-stopping".into())
            .spawn(move || monitor::stopping_thread(node))?
    };
    let polling = {
        let node = node.clone();
        std::thread::Builder::new()
            .name("veos-polling".into())
            .spawn(move || monitor::polling_thread(node))?
    };

    let _ = std::fs::remove_file(&node.config.socket_path);
    let listener = std::os::unix::net::UnixListener::bind(&node.config.socket_path)?;
    info!("veosd ready on node {node_id}");
    server::serve(node.clone(), listener);

    node.shutdown()?;
    let _ = stopping.join();
    let _ = polling.join();
    Ok(())
}

fn main() {
    veos::logging::init();
    if let Err(err) = run() {
        error!("veosd failed: {err}");
        std::process::exit(1);
    }
}
