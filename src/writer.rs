//! Byte-offset writes over a session

use crate::error::{IscsiError, ScsiResult};
use crate::executor::{CommandExecutor, WriteCommand};
use crate::scsi::Capacity;
use crate::session::Session;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Writes at block-aligned byte offsets, one command per block
///
/// A trailing partial block is zero-padded on the wire; only the caller's
/// bytes are counted as written. `close` may be called from another thread
/// while a write is in progress: the write stops before its next block.
pub struct BlockWriter {
    executor: CommandExecutor,
    closed: AtomicBool,
}

impl BlockWriter {
    /// Query capacity and bind a writer to `session`
    pub fn open(session: Arc<Session>) -> ScsiResult<Self> {
        let capacity = session.read_capacity()?;
        Ok(BlockWriter {
            executor: CommandExecutor::new(session, capacity),
            closed: AtomicBool::new(false),
        })
    }

    pub fn capacity(&self) -> Capacity {
        self.executor.capacity()
    }

    pub fn session(&self) -> &Arc<Session> {
        self.executor.session()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.session().is_closed()
    }

    /// Write `buf` at byte `offset`, returning the number of bytes written
    ///
    /// `offset` must be a multiple of the block size; any other offset fails
    /// with `Misaligned` before a command is sent, as `read_at` does.
    ///
    /// On a failure part way through, returns `PartialWrite` carrying the
    /// bytes of the blocks that made it. Nothing is rolled back.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> ScsiResult<usize> {
        if self.is_closed() {
            return Err(IscsiError::Closed);
        }

        let capacity = self.capacity();
        let bs = capacity.block_size as usize;
        match offset.checked_add(buf.len() as u64) {
            Some(end) if end < capacity.total_bytes() => {}
            _ => return Err(IscsiError::EndOfDevice),
        }
        if offset % bs as u64 != 0 {
            return Err(IscsiError::Misaligned {
                offset,
                block_size: capacity.block_size,
            });
        }

        let start_block = offset / bs as u64;
        let mut written = 0;
        let mut padded = Vec::new();

        for (lba, chunk) in (start_block..).zip(buf.chunks(bs)) {
            if self.closed.load(Ordering::Acquire) {
                return Err(IscsiError::PartialWrite {
                    written,
                    source: Box::new(IscsiError::Closed),
                });
            }

            let data = if chunk.len() == bs {
                chunk
            } else {
                padded.resize(bs, 0);
                padded[..chunk.len()].copy_from_slice(chunk);
                &padded[..]
            };

            let result = self.executor.write(&WriteCommand {
                start_block: lba,
                block_size: capacity.block_size,
                data,
            });
            if let Err(e) = result {
                log::warn!("Write of block {} failed after {} bytes: {}", lba, written, e);
                return Err(IscsiError::PartialWrite {
                    written,
                    source: Box::new(e),
                });
            }
            written += chunk.len();
        }

        log::debug!("Wrote {} bytes at offset {}", written, offset);
        Ok(written)
    }

    /// Disconnect the session and mark the writer closed
    ///
    /// Only the first call disconnects; later calls return `Ok`.
    pub fn close(&self) -> ScsiResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.session().disconnect()
    }
}
