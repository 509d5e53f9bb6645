//! Error types and handling for Monet

/// Result type alias for Monet operations
pub type Result<T> = std::result::Result<T, MonetError>;

/// Error codes carried in IPC error replies
///
/// The daemon maps a subset of [`MonetError`] onto these codes when
/// answering a request; the application side maps them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    NameTaken = 1,
    StaleSession = 2,
    UnknownRequest = 3,
    MalformedMessage = 4,
    VersionMismatch = 5,
    OutOfPorts = 6,
    OutOfMemory = 7,
    TooManySubscribers = 8,
    PublisherAlreadyExists = 9,
    DescriptorQuotaExceeded = 10,
    UnknownProcess = 11,
    UnknownPort = 12,
    InternalFailure = 13,
}

/// Comprehensive error types for the Monet middleware
#[derive(Debug, thiserror::Error)]
pub enum MonetError {
    /// I/O related errors (file operations, mmap, etc.)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Invalid configuration detected at daemon startup
    #[error("Configuration error: {parameter} - {message}")]
    Config { parameter: String, message: String },

    /// Shared memory segment could not be created
    #[error("Shared memory creation failed: {name} - {message}")]
    ShmCreateFailed { name: String, message: String },

    /// IPC channel setup or transport failure
    #[error("IPC channel error: {message}")]
    IpcChannelError { message: String },

    /// The daemon could not be reached
    #[error("Daemon unavailable: {message}")]
    DaemonUnavailable { message: String },

    /// A synchronous IPC request did not complete in time
    #[error("IPC request timed out after {timeout_ms}ms")]
    IpcTimeout { timeout_ms: u64 },

    /// Insufficient permissions on a segment or channel
    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    /// Segment ABI magic/version does not match this build
    #[error("Compatibility error: expected version {expected:#x}, got {actual:#x}")]
    CompatibilityError { expected: u32, actual: u32 },

    /// A mempool has no free chunks left
    #[error("Pool empty: pool {pool_index} (chunk size {chunk_size})")]
    PoolEmpty { pool_index: u16, chunk_size: u32 },

    /// No pool holds chunks large enough for the requested payload
    #[error("No pool fits payload of {payload_size} bytes")]
    NoFittingPool { payload_size: u32 },

    /// Publisher exceeded its outstanding-allocation budget
    #[error("Allocation budget exceeded: {budget} chunks in flight")]
    AllocationBudgetExceeded { budget: u32 },

    /// Port pool exhausted
    #[error("Out of ports: {kind}")]
    OutOfPorts { kind: &'static str },

    /// Subscriber slot set of a distributor is full
    #[error("Too many subscribers: capacity {capacity}")]
    TooManySubscribers { capacity: usize },

    /// Too many distinct descriptors hold live ports
    #[error("Descriptor quota exceeded: {limit} topics")]
    DescriptorQuotaExceeded { limit: usize },

    /// Bounded queue rejected a push under a non-blocking policy
    #[error("Queue full: capacity {capacity}")]
    QueueFull { capacity: u32 },

    /// No chunk is available to take
    #[error("No chunk available")]
    NoChunkAvailable,

    /// A descriptor already has an offering publisher
    #[error("Publisher already exists for {descriptor}")]
    PublisherAlreadyExists { descriptor: String },

    /// Registration name already in use by a live process
    #[error("Name taken: {name}")]
    NameTaken { name: String },

    /// Request carried a session id from a previous incarnation
    #[error("Stale session: got {got}, current {current}")]
    StaleSession { got: u64, current: u64 },

    /// Request refers to an unknown process or session
    #[error("Unknown process: {name}")]
    UnknownProcess { name: String },

    /// Request refers to an unknown port
    #[error("Unknown port: {port}")]
    UnknownPort { port: u32 },

    /// Wire message could not be decoded
    #[error("Malformed message: {message}")]
    MalformedMessage { message: String },

    /// The matched publisher disappeared
    #[error("Publisher gone")]
    PublisherGone,

    /// The target subscriber disappeared
    #[error("Subscriber gone")]
    SubscriberGone,

    /// Invalid parameters outside the configuration path
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Fatal invariant violation (double free, refcount underflow, bad magic)
    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },
}

impl MonetError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a configuration error
    pub fn config(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a shared memory creation error
    pub fn shm_create(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ShmCreateFailed {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an IPC channel error
    pub fn ipc_channel(message: impl Into<String>) -> Self {
        Self::IpcChannelError {
            message: message.into(),
        }
    }

    /// Create a daemon unavailable error
    pub fn daemon_unavailable(message: impl Into<String>) -> Self {
        Self::DaemonUnavailable {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a malformed message error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    /// Create a fatal invariant violation error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Map daemon-side errors onto wire error codes
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NameTaken { .. } => ErrorCode::NameTaken,
            Self::StaleSession { .. } => ErrorCode::StaleSession,
            Self::MalformedMessage { .. } => ErrorCode::MalformedMessage,
            Self::CompatibilityError { .. } => ErrorCode::VersionMismatch,
            Self::OutOfPorts { .. } => ErrorCode::OutOfPorts,
            Self::PoolEmpty { .. } | Self::NoFittingPool { .. } => ErrorCode::OutOfMemory,
            Self::TooManySubscribers { .. } => ErrorCode::TooManySubscribers,
            Self::DescriptorQuotaExceeded { .. } => ErrorCode::DescriptorQuotaExceeded,
            Self::PublisherAlreadyExists { .. } => ErrorCode::PublisherAlreadyExists,
            Self::UnknownProcess { .. } => ErrorCode::UnknownProcess,
            Self::UnknownPort { .. } => ErrorCode::UnknownPort,
            _ => ErrorCode::InternalFailure,
        }
    }

    /// Reconstruct an error from a wire error code
    pub fn from_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NameTaken => Self::NameTaken {
                name: String::new(),
            },
            ErrorCode::StaleSession => Self::StaleSession { got: 0, current: 0 },
            ErrorCode::UnknownRequest => Self::malformed("unknown request"),
            ErrorCode::MalformedMessage => Self::malformed("malformed message"),
            ErrorCode::VersionMismatch => Self::CompatibilityError {
                expected: 0,
                actual: 0,
            },
            ErrorCode::OutOfPorts => Self::OutOfPorts { kind: "port" },
            ErrorCode::OutOfMemory => Self::NoFittingPool { payload_size: 0 },
            ErrorCode::TooManySubscribers => Self::TooManySubscribers { capacity: 0 },
            ErrorCode::PublisherAlreadyExists => Self::PublisherAlreadyExists {
                descriptor: String::new(),
            },
            ErrorCode::DescriptorQuotaExceeded => Self::DescriptorQuotaExceeded { limit: 0 },
            ErrorCode::UnknownProcess => Self::UnknownProcess {
                name: String::new(),
            },
            ErrorCode::UnknownPort => Self::UnknownPort { port: 0 },
            ErrorCode::InternalFailure => Self::invariant("internal daemon failure"),
        }
    }
}

impl From<std::io::Error> for MonetError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<bincode::Error> for MonetError {
    fn from(err: bincode::Error) -> Self {
        Self::malformed(format!("bincode error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = MonetError::config("size", "must be non-zero");
        assert!(matches!(err, MonetError::Config { .. }));

        let err = MonetError::PoolEmpty {
            pool_index: 2,
            chunk_size: 128,
        };
        assert_eq!(err.code(), ErrorCode::OutOfMemory);
    }

    #[test]
    fn test_error_display() {
        let err = MonetError::AllocationBudgetExceeded { budget: 8 };
        let display = format!("{}", err);
        assert!(display.contains("budget"));
        assert!(display.contains('8'));
    }

    #[test]
    fn test_code_round_trip() {
        let err = MonetError::NameTaken {
            name: "radar".into(),
        };
        let back = MonetError::from_code(err.code());
        assert!(matches!(back, MonetError::NameTaken { .. }));
    }
}
