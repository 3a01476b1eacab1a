//! Error types for iSCSI initiator operations

use thiserror::Error;

/// iSCSI initiator errors
///
/// Variants fall into five classes: connection failures, transient I/O
/// failures (retried internally), boundary violations, use-after-close,
/// and protocol violations. Only the transient class is ever retried.
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection failed after {attempts} attempts: {last}")]
    ConnectFailed { attempts: u32, last: String },

    /// The transient signature: the transport gave up waiting for the target
    #[error("Poll failed")]
    PollFailed,

    #[error("Giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<IscsiError>,
    },

    #[error("Out of bounds: blocks {start_block}..{} exceed device of {device_blocks} blocks", .start_block + .block_count)]
    OutOfBounds {
        start_block: u64,
        block_count: u64,
        device_blocks: u64,
    },

    #[error("Offset {offset} is not aligned to block size {block_size}")]
    Misaligned { offset: u64, block_size: u32 },

    #[error("End of device")]
    EndOfDevice,

    #[error("Device is closed")]
    Closed,

    #[error("Device write error after {written} bytes: {source}")]
    PartialWrite {
        written: usize,
        #[source]
        source: Box<IscsiError>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An asynchronous command completed with an error
    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("SCSI error: {0}")]
    Scsi(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IscsiError {
    /// True for failures that are safe to retry without changing request semantics
    pub fn is_transient(&self) -> bool {
        matches!(self, IscsiError::PollFailed)
    }

    /// True if the operation failed because the device was closed, looking
    /// through a partial write wrapper
    pub fn is_closed(&self) -> bool {
        match self {
            IscsiError::Closed => true,
            IscsiError::PartialWrite { source, .. } => source.is_closed(),
            _ => false,
        }
    }

    pub fn is_end_of_device(&self) -> bool {
        matches!(self, IscsiError::EndOfDevice)
    }

    /// True for offset/length violations against the device geometry
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            IscsiError::OutOfBounds { .. } | IscsiError::Misaligned { .. } | IscsiError::EndOfDevice
        )
    }

    /// Bytes that reached the device before the error, zero unless partial
    pub fn bytes_transferred(&self) -> usize {
        match self {
            IscsiError::PartialWrite { written, .. } => *written,
            _ => 0,
        }
    }
}

/// Result type for SCSI operations
pub type ScsiResult<T> = Result<T, IscsiError>;

impl From<IscsiError> for std::io::Error {
    fn from(err: IscsiError) -> Self {
        use std::io::ErrorKind;
        match err {
            IscsiError::Io(e) => e,
            e @ IscsiError::Closed => std::io::Error::new(ErrorKind::NotConnected, e),
            e @ (IscsiError::OutOfBounds { .. } | IscsiError::Misaligned { .. }) => {
                std::io::Error::new(ErrorKind::InvalidInput, e)
            }
            e @ IscsiError::EndOfDevice => std::io::Error::new(ErrorKind::UnexpectedEof, e),
            e => std::io::Error::other(e),
        }
    }
}

/// Decode a login response status (RFC 3720 Section 10.13.5) into an
/// actionable message.
pub fn decode_login_status(class: u8, detail: u8) -> String {
    match (class, detail) {
        (0x00, _) => "Login success".to_string(),

        (0x01, 0x01) => "Target moved temporarily: retry login at the portal given in TargetAddress".to_string(),
        (0x01, 0x02) => "Target moved permanently: update the target URL configuration with the new TargetAddress".to_string(),

        (0x02, 0x00) => "Initiator error: authentication failure or malformed login request".to_string(),
        (0x02, 0x01) => "Authentication failed: check the CHAP username and password configured on the target".to_string(),
        (0x02, 0x02) => "Authorization failure: this initiator name is not allowed by the target ACL \
             (for TGTD see: tgtadm --mode target --op bind --initiator-name ...)".to_string(),
        (0x02, 0x03) => "Target not found: the requested TargetName doesn't exist on this portal; run discovery to list targets".to_string(),
        (0x02, 0x04) => "Target removed: the target has been removed from this portal".to_string(),
        (0x02, 0x05) => "Unsupported version: the target does not support the requested iSCSI protocol version".to_string(),
        (0x02, 0x06) => "Too many connections: the session has reached its MaxConnections limit".to_string(),
        (0x02, 0x07) => "Missing parameter: the login request lacked a required key (InitiatorName, TargetName)".to_string(),
        (0x02, 0x08) => "Cannot include in session: this connection cannot be added to the existing session".to_string(),
        (0x02, 0x09) => "Session type not supported: use SessionType=Normal with a TargetName, or SendTargets on a discovery session".to_string(),
        (0x02, 0x0A) => "Session does not exist: the TSIH names a session the target no longer knows".to_string(),
        (0x02, 0x0B) => "Invalid request during login: the target rejected a PDU sent while login was in progress".to_string(),

        (0x03, 0x00) => "Target error: the target hit an internal failure during login".to_string(),
        (0x03, 0x01) => "Service unavailable: the target is shutting down or overloaded; Wait and retry later".to_string(),
        (0x03, 0x02) => "Out of resources: the target ran out of resources for a new session".to_string(),

        _ => format!(
            "Unknown login status class=0x{:02x} detail=0x{:02x} (see RFC 3720 Section 10.13.5)",
            class, detail
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(IscsiError::PollFailed.is_transient());
        assert!(!IscsiError::Closed.is_transient());
        assert!(!IscsiError::Protocol("bad".into()).is_transient());
    }

    #[test]
    fn test_closed_through_partial_write() {
        let err = IscsiError::PartialWrite {
            written: 1024,
            source: Box::new(IscsiError::Closed),
        };
        assert!(err.is_closed());
        assert_eq!(err.bytes_transferred(), 1024);
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn test_out_of_bounds_message() {
        let err = IscsiError::OutOfBounds {
            start_block: 6,
            block_count: 4,
            device_blocks: 8,
        };
        assert!(err.is_boundary());
        assert_eq!(
            err.to_string(),
            "Out of bounds: blocks 6..10 exceed device of 8 blocks"
        );
    }

    #[test]
    fn test_into_io_error_kind() {
        use std::io::ErrorKind;
        assert_eq!(std::io::Error::from(IscsiError::Closed).kind(), ErrorKind::NotConnected);
        assert_eq!(std::io::Error::from(IscsiError::EndOfDevice).kind(), ErrorKind::UnexpectedEof);
        let io = std::io::Error::from(IscsiError::Io(std::io::Error::from(ErrorKind::BrokenPipe)));
        assert_eq!(io.kind(), ErrorKind::BrokenPipe);
        assert_eq!(std::io::Error::from(IscsiError::PollFailed).kind(), ErrorKind::Other);
    }
}
