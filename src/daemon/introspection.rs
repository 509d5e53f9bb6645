//! Liveness monitoring and reaping of dead processes

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{info, warn};

use crate::error::Result;

use super::{
    port_manager::PortManager,
    process::{ProcessRegistry, ProcessState},
};

/// Dismantle everything a process owns and drop it from the registry
///
/// Order matters: ports are dismantled before the management block is
/// freed, so peers still running never observe a torn reference.
pub fn reap(registry: &ProcessRegistry, ports: &PortManager, name: &str) -> Result<()> {
    let released = ports.release_ports_of(name)?;
    if let Some(entry) = registry.remove(name) {
        ports.free_management_block(entry.management_block)?;
        info!(
            "reaped process {} (pid {}, session {}), {} ports released",
            name, entry.pid, entry.session_id, released
        );
    }
    Ok(())
}

/// Periodic liveness task marking silent processes LOST and reaping them
#[derive(Debug)]
pub struct ProcessMonitor {
    registry: Arc<ProcessRegistry>,
    ports: Arc<PortManager>,
    liveness_threshold_ms: u64,
    tick: Duration,
    shutdown: Arc<AtomicBool>,
}

impl ProcessMonitor {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        ports: Arc<PortManager>,
        liveness_threshold_ms: u64,
        tick_ms: u64,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            ports,
            liveness_threshold_ms,
            tick: Duration::from_millis(tick_ms),
            shutdown,
        }
    }

    /// One monitoring pass; exposed separately so tests can drive it
    pub fn tick_once(&self) {
        for name in self.registry.expired(self.liveness_threshold_ms) {
            warn!(
                "process {} missed its liveness deadline ({}ms), marking LOST",
                name, self.liveness_threshold_ms
            );
            if self.registry.set_state(&name, ProcessState::Lost).is_err() {
                continue;
            }
            if let Err(e) = reap(&self.registry, &self.ports, &name) {
                warn!("reaping {} failed: {}", name, e);
            }
        }
    }

    /// Run until shutdown is requested
    pub fn run(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            std::thread::sleep(self.tick);
            self.tick_once();
        }
    }
}
