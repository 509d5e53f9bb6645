//! Control-plane IPC: the Unix socket service loop and request dispatch
//!
//! A single daemon thread services the channel; requests are synchronous
//! from the application's point of view. Every non-REGISTER message is
//! validated against the sender's session id, so a reborn process can
//! never act on its predecessor's behalf.

use std::{
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    error::{MonetError, Result},
    layout::constants::{
        ABI_VERSION, DEFAULT_ALLOCATION_BUDGET, MAX_PORTS_PER_PROCESS,
    },
    memory::SegmentManager,
};

use super::{
    introspection::reap,
    port_manager::PortManager,
    process::{ProcessRegistry, ProcessState},
    protocol::{read_frame, write_frame, ProcessInfo, Reply, Request, SegmentInfo},
};

/// Request dispatcher shared by the IPC thread and in-process callers
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<ProcessRegistry>,
    ports: Arc<PortManager>,
    segments: Arc<SegmentManager>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        ports: Arc<PortManager>,
        segments: Arc<SegmentManager>,
    ) -> Self {
        Self {
            registry,
            ports,
            segments,
        }
    }

    /// Handle one request; `None` means no reply is sent (keep-alive)
    pub fn handle(&self, request: Request) -> Option<Reply> {
        match request {
            Request::KeepAlive { session } => {
                // Fire-and-forget; stale sessions are silently discarded.
                if let Err(e) = self.registry.validate_session(session) {
                    debug!("keep-alive dropped: {}", e);
                }
                None
            }
            other => Some(self.handle_with_reply(other).unwrap_or_else(|e| Reply::Error {
                code: e.code(),
            })),
        }
    }

    fn handle_with_reply(&self, request: Request) -> Result<Reply> {
        match request {
            Request::Register {
                name,
                pid,
                uid,
                abi_version,
            } => self.register(name, pid, uid, abi_version),
            Request::Unregister { session } => {
                let entry = self.registry.validate_session(session)?;
                self.registry
                    .set_state(&entry.name, ProcessState::Terminating)?;
                reap(&self.registry, &self.ports, &entry.name)?;
                Ok(Reply::Done)
            }
            Request::CreatePublisher {
                session,
                descriptor,
                history_capacity,
                allocation_budget,
            } => {
                let entry = self.registry.validate_session(session)?;
                self.check_port_quota(&entry.name)?;
                let budget = if allocation_budget == 0 {
                    DEFAULT_ALLOCATION_BUDGET
                } else {
                    allocation_budget
                };
                let (port, location) = self.ports.create_publisher(
                    &entry.name,
                    descriptor,
                    history_capacity,
                    budget,
                    entry.data_segment,
                )?;
                self.registry.add_port(&entry.name, port)?;
                Ok(Reply::PortCreated {
                    port,
                    location,
                    data_segment: entry.data_segment,
                })
            }
            Request::CreateSubscriber {
                session,
                descriptor,
                queue_capacity,
                policy,
                history_request,
            } => {
                let entry = self.registry.validate_session(session)?;
                self.check_port_quota(&entry.name)?;
                let (port, location) = self.ports.create_subscriber(
                    &entry.name,
                    descriptor,
                    queue_capacity,
                    policy,
                    history_request,
                )?;
                self.registry.add_port(&entry.name, port)?;
                Ok(Reply::PortCreated {
                    port,
                    location,
                    data_segment: entry.data_segment,
                })
            }
            Request::DestroyPort { session, port } => {
                let entry = self.registry.validate_session(session)?;
                self.ports.destroy_port(&entry.name, port)?;
                self.registry.remove_port(&entry.name, port)?;
                Ok(Reply::Done)
            }
            Request::QueryIntrospection { session } => {
                self.registry.validate_session(session)?;
                let processes = self
                    .registry
                    .snapshot()
                    .into_iter()
                    .map(|entry| ProcessInfo {
                        ports: self.ports.port_infos(&entry.ports),
                        name: entry.name,
                        pid: entry.pid,
                        state: format!("{:?}", entry.state),
                    })
                    .collect();
                Ok(Reply::Introspection { processes })
            }
            Request::KeepAlive { .. } => unreachable!("keep-alive handled without reply"),
        }
    }

    fn register(&self, name: String, pid: u32, uid: u32, abi_version: u32) -> Result<Reply> {
        if abi_version != ABI_VERSION {
            return Err(MonetError::CompatibilityError {
                expected: ABI_VERSION,
                actual: abi_version,
            });
        }

        // A LOST predecessor holding the name is reaped first; a live one
        // keeps it.
        match self.registry.state_of(&name) {
            Some(ProcessState::Lost) => {
                warn!("name {} held by a lost process, reaping predecessor", name);
                reap(&self.registry, &self.ports, &name)?;
            }
            Some(_) => {
                return Err(MonetError::NameTaken { name });
            }
            None => {}
        }

        let data_segment = self.segments.segment_for(uid)?;
        let session = self.registry.register(
            &name,
            pid,
            uid,
            data_segment,
            crate::layout::RelativePointer::new(0, 0),
        )?;

        let management_block = match self
            .ports
            .alloc_management_block(session, self.registry.now_ms())
        {
            Ok(block) => block,
            Err(e) => {
                self.registry.remove(&name);
                return Err(e);
            }
        };
        self.registry.set_management_block(&name, management_block)?;

        let segments = self
            .segments
            .segment_infos()
            .into_iter()
            .map(|(id, name, size)| SegmentInfo { id, name, size })
            .collect();

        info!("registered {} (pid {}) with session {}", name, pid, session);
        Ok(Reply::Registered {
            session,
            segments,
            management_block,
            data_segment,
        })
    }

    fn check_port_quota(&self, name: &str) -> Result<()> {
        if self.registry.port_count(name) >= MAX_PORTS_PER_PROCESS {
            return Err(MonetError::OutOfPorts { kind: "process" });
        }
        Ok(())
    }
}

/// The daemon's control socket
#[derive(Debug)]
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the control socket, replacing a stale file from a dead daemon
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)
                .map_err(|e| MonetError::ipc_channel(format!("stale socket removal: {}", e)))?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MonetError::ipc_channel(format!("socket directory: {}", e)))?;
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| MonetError::ipc_channel(format!("bind {}: {}", path.display(), e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| MonetError::ipc_channel(format!("set_nonblocking: {}", e)))?;

        info!("control channel listening on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Service loop; one connection at a time, until shutdown
    pub fn run(&self, dispatcher: Arc<Dispatcher>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = handle_connection(stream, &dispatcher, &shutdown) {
                        debug!("connection ended: {}", e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                }
            }
        }

        let _ = std::fs::remove_file(&self.path);
        info!("control channel closed");
    }
}

fn handle_connection(
    stream: UnixStream,
    dispatcher: &Dispatcher,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut stream = stream;
    stream
        .set_nonblocking(false)
        .map_err(|e| MonetError::ipc_channel(format!("stream mode: {}", e)))?;
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .map_err(|e| MonetError::ipc_channel(format!("read timeout: {}", e)))?;

    loop {
        if shutdown.load(Ordering::Acquire) {
            return Ok(());
        }

        match read_frame::<_, Request>(&mut stream) {
            Ok(Some(request)) => {
                debug!("request: {:?}", request);
                if let Some(reply) = dispatcher.handle(request) {
                    write_frame(&mut stream, &reply)?;
                }
            }
            Ok(None) => return Ok(()),
            Err(MonetError::Io { source: Some(e), .. })
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                // Answer malformed traffic once, then drop the peer.
                let _ = write_frame(
                    &mut stream,
                    &Reply::Error {
                        code: MonetError::malformed("undecodable frame").code(),
                    },
                );
                return Err(e);
            }
        }
    }
}
