//! Daemon assembly: startup layout, worker threads, graceful shutdown

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use log::{error, info};
use nix::sys::signal::{self, SigHandler, Signal};

use crate::{
    config::DaemonConfig,
    error::Result,
    layout::SegmentTable,
    memory::{BackingType, SegmentManager},
};

use super::{
    introspection::{reap, ProcessMonitor},
    ipc::{Dispatcher, IpcServer},
    port_manager::PortManager,
    process::ProcessRegistry,
    protocol::{Reply, Request},
};

static SIGNAL_SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_: libc::c_int) {
    SIGNAL_SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM into the shutdown flag
pub fn install_signal_handlers() -> Result<()> {
    let handler = SigHandler::Handler(handle_shutdown_signal);
    unsafe {
        signal::signal(Signal::SIGINT, handler)
            .map_err(|e| crate::error::MonetError::ipc_channel(format!("SIGINT handler: {}", e)))?;
        signal::signal(Signal::SIGTERM, handler)
            .map_err(|e| crate::error::MonetError::ipc_channel(format!("SIGTERM handler: {}", e)))?;
    }
    Ok(())
}

/// Whether a termination signal has been observed
pub fn signal_shutdown_requested() -> bool {
    SIGNAL_SHUTDOWN.load(Ordering::SeqCst)
}

/// The broker process: segments, registry, port pool, IPC, monitor
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    segments: Arc<SegmentManager>,
    registry: Arc<ProcessRegistry>,
    ports: Arc<PortManager>,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Lay out shared memory and start the worker threads
    ///
    /// Startup order: purge stale segments, create group segments and the
    /// management segment, initialize the registry, then open the IPC
    /// channel and start the liveness monitor.
    pub fn start(config: DaemonConfig) -> Result<Self> {
        config.validate()?;

        SegmentManager::purge_stale(&config.segment_dir)?;

        let table = Arc::new(SegmentTable::new());
        let segments = Arc::new(SegmentManager::new(table));
        let backing = BackingType::FileBacked {
            dir: config.segment_dir.clone(),
        };
        for group in &config.groups {
            segments.create_group_segment(group, backing.clone())?;
        }

        let ports = Arc::new(PortManager::new(&segments, backing)?);
        let registry = Arc::new(ProcessRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            ports.clone(),
            segments.clone(),
        ));

        let shutdown = Arc::new(AtomicBool::new(false));
        let server = IpcServer::bind(&config.socket_path)?;

        let mut workers = Vec::new();
        {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            workers.push(std::thread::spawn(move || {
                server.run(dispatcher, shutdown);
            }));
        }
        {
            let monitor = ProcessMonitor::new(
                registry.clone(),
                ports.clone(),
                config.liveness_threshold_ms,
                config.monitor_tick_ms,
                shutdown.clone(),
            );
            workers.push(std::thread::spawn(move || {
                monitor.run();
            }));
        }

        info!(
            "daemon up: {} groups, socket {}",
            config.groups.len(),
            config.socket_path.display()
        );
        Ok(Self {
            config,
            segments,
            registry,
            ports,
            dispatcher,
            shutdown,
            workers,
        })
    }

    /// Handle a request in-process, bypassing the socket
    ///
    /// Used by tests and by tooling embedded in the daemon process; the
    /// semantics are identical to the wire path.
    pub fn handle(&self, request: Request) -> Option<Reply> {
        self.dispatcher.handle(request)
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortManager> {
        &self.ports
    }

    pub fn segments(&self) -> &Arc<SegmentManager> {
        &self.segments
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Drive one liveness pass immediately (test hook)
    pub fn monitor_tick(&self) {
        let monitor = ProcessMonitor::new(
            self.registry.clone(),
            self.ports.clone(),
            self.config.liveness_threshold_ms,
            self.config.monitor_tick_ms,
            self.shutdown.clone(),
        );
        monitor.tick_once();
    }

    /// Block until a termination signal arrives, then shut down
    pub fn run_until_signal(self) -> Result<()> {
        install_signal_handlers()?;
        while !signal_shutdown_requested() {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        info!("termination signal received");
        self.shutdown()
    }

    /// Graceful shutdown: unregister everything, close the channel,
    /// unlink every segment
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }

        for name in self.registry.names() {
            if let Err(e) = reap(&self.registry, &self.ports, &name) {
                error!("cleanup of {} failed: {}", name, e);
            }
        }

        self.segments.unlink_all();
        let _ = std::fs::remove_file(&self.config.socket_path);
        info!("daemon shut down cleanly");
        Ok(())
    }
}
