//! Application-side client for the daemon control channel

use std::{os::unix::net::UnixStream, path::Path, time::Duration};

use crate::{
    error::{MonetError, Result},
    layout::constants::ABI_VERSION,
    layout::{RelativePointer, SegmentId},
    port::{QueuePolicy, ServiceDescriptor},
};

use super::protocol::{read_frame, write_frame, PortId, ProcessInfo, Reply, Request, SegmentInfo};

/// Successful registration handshake
#[derive(Debug, Clone)]
pub struct Registration {
    pub session: u64,
    pub segments: Vec<SegmentInfo>,
    pub management_block: RelativePointer,
    pub data_segment: SegmentId,
}

/// Synchronous connection to the daemon
///
/// Every request carries the default timeout; a daemon that cannot be
/// reached surfaces `DaemonUnavailable`, a silent one `IpcTimeout`.
#[derive(Debug)]
pub struct DaemonClient {
    stream: UnixStream,
    timeout: Duration,
}

impl DaemonClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    /// Connect to the daemon control socket
    pub fn connect(path: &Path) -> Result<Self> {
        Self::connect_with_timeout(path, Self::DEFAULT_TIMEOUT)
    }

    pub fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .map_err(|e| MonetError::daemon_unavailable(format!("{}: {}", path.display(), e)))?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| MonetError::ipc_channel(format!("read timeout: {}", e)))?;
        Ok(Self { stream, timeout })
    }

    fn request(&mut self, request: &Request) -> Result<Reply> {
        write_frame(&mut self.stream, request)?;
        match read_frame::<_, Reply>(&mut self.stream) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(MonetError::daemon_unavailable("daemon closed the channel")),
            Err(MonetError::Io { source: Some(e), .. })
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(MonetError::IpcTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn expect_done(reply: Reply) -> Result<()> {
        match reply {
            Reply::Done => Ok(()),
            Reply::Error { code } => Err(MonetError::from_code(code)),
            other => Err(MonetError::malformed(format!("unexpected reply {:?}", other))),
        }
    }

    /// Register this process under `name`
    pub fn register(&mut self, name: &str) -> Result<Registration> {
        let request = Request::Register {
            name: name.to_string(),
            pid: std::process::id(),
            uid: nix::unistd::getuid().as_raw(),
            abi_version: ABI_VERSION,
        };
        match self.request(&request)? {
            Reply::Registered {
                session,
                segments,
                management_block,
                data_segment,
            } => Ok(Registration {
                session,
                segments,
                management_block,
                data_segment,
            }),
            Reply::Error { code } => Err(MonetError::from_code(code)),
            other => Err(MonetError::malformed(format!("unexpected reply {:?}", other))),
        }
    }

    /// Create a publisher port for `descriptor`
    pub fn create_publisher(
        &mut self,
        session: u64,
        descriptor: ServiceDescriptor,
        history_capacity: u32,
        allocation_budget: u32,
    ) -> Result<(PortId, RelativePointer, SegmentId)> {
        let request = Request::CreatePublisher {
            session,
            descriptor,
            history_capacity,
            allocation_budget,
        };
        match self.request(&request)? {
            Reply::PortCreated {
                port,
                location,
                data_segment,
            } => Ok((port, location, data_segment)),
            Reply::Error { code } => Err(MonetError::from_code(code)),
            other => Err(MonetError::malformed(format!("unexpected reply {:?}", other))),
        }
    }

    /// Create a subscriber port for `descriptor`
    pub fn create_subscriber(
        &mut self,
        session: u64,
        descriptor: ServiceDescriptor,
        queue_capacity: u32,
        policy: QueuePolicy,
        history_request: u32,
    ) -> Result<(PortId, RelativePointer, SegmentId)> {
        let request = Request::CreateSubscriber {
            session,
            descriptor,
            queue_capacity,
            policy,
            history_request,
        };
        match self.request(&request)? {
            Reply::PortCreated {
                port,
                location,
                data_segment,
            } => Ok((port, location, data_segment)),
            Reply::Error { code } => Err(MonetError::from_code(code)),
            other => Err(MonetError::malformed(format!("unexpected reply {:?}", other))),
        }
    }

    /// Destroy a port owned by this session
    pub fn destroy_port(&mut self, session: u64, port: PortId) -> Result<()> {
        let reply = self.request(&Request::DestroyPort { session, port })?;
        Self::expect_done(reply)
    }

    /// Unregister this session, releasing every owned resource
    pub fn unregister(&mut self, session: u64) -> Result<()> {
        let reply = self.request(&Request::Unregister { session })?;
        Self::expect_done(reply)
    }

    /// Fire-and-forget liveness signal; no reply is read
    pub fn keep_alive(&mut self, session: u64) -> Result<()> {
        write_frame(&mut self.stream, &Request::KeepAlive { session })
    }

    /// Snapshot of registered processes and their ports
    pub fn introspect(&mut self, session: u64) -> Result<Vec<ProcessInfo>> {
        match self.request(&Request::QueryIntrospection { session })? {
            Reply::Introspection { processes } => Ok(processes),
            Reply::Error { code } => Err(MonetError::from_code(code)),
            other => Err(MonetError::malformed(format!("unexpected reply {:?}", other))),
        }
    }
}
