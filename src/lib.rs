//! A pure Rust iSCSI initiator for block-aligned device access
//!
//! This library logs in to a remote iSCSI target and exposes the logical unit
//! as a byte-addressed device: [`BlockReader::read_at`] and
//! [`BlockWriter::write_at`] over a shared [`Session`]. Commands travel
//! through a [`Transport`]; [`IscsiClient`] speaks iSCSI over TCP and
//! [`MemoryTarget`] provides an in-process device for tests.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_initiator::{BlockReader, BlockWriter};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = iscsi_initiator::open(
//!     "iqn.2024-10.libiscsi:go",
//!     "iscsi://127.0.0.1:3260/iqn.2025-12.local:storage.disk1/0",
//! )?;
//! session.connect()?;
//!
//! let writer = BlockWriter::open(session.clone())?;
//! let mut block = vec![0u8; 512];
//! block[..11].copy_from_slice(b"hello iscsi");
//! writer.write_at(&block, 0)?;
//!
//! let reader = BlockReader::open(session.clone())?;
//! let mut buf = [0u8; 11];
//! reader.read_at(&mut buf, 0)?;
//! assert_eq!(&buf, b"hello iscsi");
//!
//! writer.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! Logging goes through the `log` facade; install any logger to observe
//! connect retries, transient read retries and pump failures.

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod memory;
pub mod pdu;
pub mod pump;
pub mod reader;
pub mod scsi;
pub mod session;
pub mod transport;
pub mod url;
pub mod writer;

pub use client::IscsiClient;
pub use config::{SessionConfig, SessionConfigBuilder};
pub use error::{IscsiError, ScsiResult};
pub use executor::{CommandExecutor, ReadCommand, WriteCommand};
pub use memory::{MemoryTarget, MemoryTransport};
pub use pump::{EventPump, Task, TaskHandle, TaskResult};
pub use reader::BlockReader;
pub use scsi::Capacity;
pub use session::{Session, SessionState};
pub use transport::{Events, TaskCompletion, TaskToken, Transport};
pub use url::TargetUrl;
pub use writer::BlockWriter;

use std::sync::Arc;

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a TCP session with default settings. Does not log in.
pub fn open(initiator_name: &str, target_url: &str) -> ScsiResult<Arc<Session>> {
    let config = SessionConfig::builder()
        .initiator_name(initiator_name)
        .target_url(target_url)
        .build()?;
    Ok(Session::open(config))
}
