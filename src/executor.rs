//! Synchronous block-range commands with transient retry

use crate::error::{IscsiError, ScsiResult};
use crate::scsi::Capacity;
use crate::session::Session;
use std::sync::Arc;

/// Read `block_count` blocks starting at `start_block`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCommand {
    pub start_block: u64,
    pub block_count: u32,
    pub block_size: u32,
}

impl ReadCommand {
    pub fn transfer_length(&self) -> usize {
        self.block_count as usize * self.block_size as usize
    }
}

/// Write `data` (a whole number of blocks) starting at `start_block`
#[derive(Debug, Clone, Copy)]
pub struct WriteCommand<'a> {
    pub start_block: u64,
    pub block_size: u32,
    pub data: &'a [u8],
}

/// Issues one device command per call against a session
pub struct CommandExecutor {
    session: Arc<Session>,
    capacity: Capacity,
}

impl CommandExecutor {
    pub fn new(session: Arc<Session>, capacity: Capacity) -> Self {
        CommandExecutor { session, capacity }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Read exactly `block_count * block_size` bytes
    ///
    /// `PollFailed` is retried up to the configured attempt count; any other
    /// error is returned at once.
    pub fn read(&self, cmd: &ReadCommand) -> ScsiResult<Vec<u8>> {
        self.capacity.check_range(cmd.start_block, cmd.block_count as u64)?;

        let attempts = self.session.config().read_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.session.with_handle(|transport| {
                transport.read16(cmd.start_block, cmd.block_count, cmd.block_size)
            });
            match result {
                Ok(data) if data.len() == cmd.transfer_length() => return Ok(data),
                Ok(data) => {
                    return Err(IscsiError::Protocol(format!(
                        "read of {} blocks returned {} bytes, expected {}",
                        cmd.block_count,
                        data.len(),
                        cmd.transfer_length()
                    )))
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    log::debug!(
                        "Read at block {} hit '{}', retrying ({}/{})",
                        cmd.start_block,
                        e,
                        attempt,
                        attempts
                    );
                }
                Err(e) if e.is_transient() => {
                    return Err(IscsiError::RetriesExhausted {
                        attempts,
                        source: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write whole blocks; never retried
    pub fn write(&self, cmd: &WriteCommand<'_>) -> ScsiResult<()> {
        let bs = cmd.block_size as usize;
        if bs == 0 || cmd.data.len() % bs != 0 {
            return Err(IscsiError::Session(format!(
                "write of {} bytes is not a whole number of {} byte blocks",
                cmd.data.len(),
                cmd.block_size
            )));
        }
        let block_count = (cmd.data.len() / bs) as u64;
        self.capacity.check_range(cmd.start_block, block_count)?;

        self.session
            .with_handle(|transport| transport.write16(cmd.start_block, cmd.data, cmd.block_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::memory::MemoryTarget;

    fn executor(target: &MemoryTarget) -> CommandExecutor {
        let config = SessionConfig::builder()
            .initiator_name("iqn.2024-10.libiscsi:go")
            .target_url("iscsi://127.0.0.1/iqn.2025-12.local:mem/0")
            .build()
            .unwrap();
        let session = Session::with_transport(config, Box::new(target.transport().unwrap()));
        session.connect().unwrap();
        let capacity = session.read_capacity().unwrap();
        CommandExecutor::new(session, capacity)
    }

    #[test]
    fn test_read_retries_transient() {
        let target = MemoryTarget::new(512, 8);
        target.fill(0, b"data");
        target.fail_reads(9);
        let exec = executor(&target);

        let data = exec
            .read(&ReadCommand {
                start_block: 0,
                block_count: 1,
                block_size: 512,
            })
            .unwrap();
        assert_eq!(&data[..4], b"data");
        assert_eq!(target.read_commands(), 10);
    }

    #[test]
    fn test_read_gives_up_after_bound() {
        let target = MemoryTarget::new(512, 8);
        target.fail_reads(u32::MAX);
        let exec = executor(&target);

        let err = exec
            .read(&ReadCommand {
                start_block: 0,
                block_count: 1,
                block_size: 512,
            })
            .unwrap_err();
        match err {
            IscsiError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 10);
                assert!(source.is_transient());
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(target.read_commands(), 10);
    }

    #[test]
    fn test_read_out_of_bounds_never_reaches_device() {
        let target = MemoryTarget::new(512, 8);
        let exec = executor(&target);
        let err = exec
            .read(&ReadCommand {
                start_block: 6,
                block_count: 3,
                block_size: 512,
            })
            .unwrap_err();
        assert!(matches!(err, IscsiError::OutOfBounds { device_blocks: 8, .. }));
        assert_eq!(target.read_commands(), 0);
    }

    #[test]
    fn test_write_is_not_retried() {
        let target = MemoryTarget::new(512, 8);
        target.fail_write_at(Some(3));
        let exec = executor(&target);
        let block = [0x11u8; 512];

        let err = exec
            .write(&WriteCommand {
                start_block: 3,
                block_size: 512,
                data: &block,
            })
            .unwrap_err();
        assert!(matches!(err, IscsiError::Scsi(_)));
        assert_eq!(target.writes(), vec![3]);
    }

    #[test]
    fn test_write_requires_whole_blocks() {
        let target = MemoryTarget::new(512, 8);
        let exec = executor(&target);
        let err = exec
            .write(&WriteCommand {
                start_block: 0,
                block_size: 512,
                data: &[0u8; 100],
            })
            .unwrap_err();
        assert!(matches!(err, IscsiError::Session(_)));
        assert!(target.writes().is_empty());
    }
}
