//! Control-plane wire protocol: request/reply enums and framing
//!
//! Messages are bincode-encoded and framed with a little-endian `u32`
//! length prefix. Frames above [`MAX_IPC_MESSAGE_SIZE`] are rejected
//! before allocation.

use std::io::{Read, Write};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    error::{ErrorCode, MonetError, Result},
    layout::constants::MAX_IPC_MESSAGE_SIZE,
    layout::{RelativePointer, SegmentId},
    port::{QueuePolicy, ServiceDescriptor},
};

/// Identifier of a port within the daemon's pre-sized port pool
///
/// The top bit distinguishes subscriber ports from publisher ports; the
/// remaining bits are the slot index.
pub type PortId = u32;

const SUBSCRIBER_BIT: PortId = 1 << 31;

pub fn publisher_port_id(slot: u32) -> PortId {
    slot
}

pub fn subscriber_port_id(slot: u32) -> PortId {
    slot | SUBSCRIBER_BIT
}

pub fn is_subscriber_port(id: PortId) -> bool {
    id & SUBSCRIBER_BIT != 0
}

pub fn port_slot(id: PortId) -> u32 {
    id & !SUBSCRIBER_BIT
}

/// Requests an application sends to the daemon control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Register {
        name: String,
        pid: u32,
        uid: u32,
        /// ABI version of the sender, checked against the daemon's
        abi_version: u32,
    },
    Unregister {
        session: u64,
    },
    CreatePublisher {
        session: u64,
        descriptor: ServiceDescriptor,
        history_capacity: u32,
        allocation_budget: u32,
    },
    CreateSubscriber {
        session: u64,
        descriptor: ServiceDescriptor,
        queue_capacity: u32,
        policy: QueuePolicy,
        history_request: u32,
    },
    DestroyPort {
        session: u64,
        port: PortId,
    },
    KeepAlive {
        session: u64,
    },
    QueryIntrospection {
        session: u64,
    },
}

/// Description of one daemon-owned segment, sent at registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub id: SegmentId,
    pub name: String,
    pub size: u64,
}

/// Introspection snapshot of one registered process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: u32,
    pub state: String,
    pub ports: Vec<PortInfo>,
}

/// Introspection snapshot of one port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInfo {
    pub port: PortId,
    pub descriptor: String,
    pub queue_depth: Option<usize>,
}

/// Replies the daemon sends back; errors carry an [`ErrorCode`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Registered {
        session: u64,
        segments: Vec<SegmentInfo>,
        management_block: RelativePointer,
        data_segment: SegmentId,
    },
    PortCreated {
        port: PortId,
        location: RelativePointer,
        data_segment: SegmentId,
    },
    Done,
    Introspection {
        processes: Vec<ProcessInfo>,
    },
    Error {
        code: ErrorCode,
    },
}

/// Write one length-prefixed frame
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_IPC_MESSAGE_SIZE {
        return Err(MonetError::malformed(format!(
            "frame of {} bytes exceeds limit {}",
            bytes.len(),
            MAX_IPC_MESSAGE_SIZE
        )));
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Fill `buffer` completely, retrying timeouts once the frame has begun
///
/// A timeout before the first byte aborts with the I/O error so callers
/// can poll; a timeout mid-frame keeps reading, preserving frame
/// alignment on the stream. `Ok(false)` reports clean end of stream.
fn read_all<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(MonetError::malformed("stream ended mid-frame"));
            }
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if filled == 0 {
                    return Err(e.into());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Read one length-prefixed frame; `Ok(None)` on clean end of stream
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut length_bytes = [0u8; 4];
    if !read_all(reader, &mut length_bytes)? {
        return Ok(None);
    }

    let length = u32::from_le_bytes(length_bytes) as usize;
    if length > MAX_IPC_MESSAGE_SIZE {
        return Err(MonetError::malformed(format!(
            "frame of {} bytes exceeds limit {}",
            length, MAX_IPC_MESSAGE_SIZE
        )));
    }

    let mut buffer = vec![0u8; length];
    loop {
        match read_all(reader, &mut buffer) {
            Ok(true) => break,
            Ok(false) => return Err(MonetError::malformed("stream ended mid-frame")),
            // The prefix arrived, so the body is on its way; keep waiting.
            Err(MonetError::Io { source: Some(e), .. })
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Some(bincode::deserialize(&buffer)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let request = Request::Register {
            name: "camera".into(),
            pid: 42,
            uid: 1000,
            abi_version: crate::layout::constants::ABI_VERSION,
        };

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &request).unwrap();

        let mut cursor = std::io::Cursor::new(buffer);
        let decoded: Request = read_frame(&mut cursor).unwrap().unwrap();
        assert!(matches!(decoded, Request::Register { pid: 42, .. }));

        // Stream exhausted: clean EOF.
        let end: Option<Request> = read_frame(&mut cursor).unwrap();
        assert!(end.is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_IPC_MESSAGE_SIZE as u32 + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buffer);
        let result: Result<Option<Request>> = read_frame(&mut cursor);
        assert!(matches!(result, Err(MonetError::MalformedMessage { .. })));
    }

    #[test]
    fn port_id_encoding() {
        let publisher = publisher_port_id(7);
        let subscriber = subscriber_port_id(7);
        assert!(!is_subscriber_port(publisher));
        assert!(is_subscriber_port(subscriber));
        assert_eq!(port_slot(publisher), 7);
        assert_eq!(port_slot(subscriber), 7);
    }
}
