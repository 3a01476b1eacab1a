//! Byte-offset reads over a session

use crate::error::{IscsiError, ScsiResult};
use crate::executor::{CommandExecutor, ReadCommand};
use crate::scsi::Capacity;
use crate::session::Session;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

/// Upper bound on blocks fetched by one sequential `read`
const MAX_SEQUENTIAL_BLOCKS: u64 = 256;

/// Reads whole blocks at block-aligned byte offsets
///
/// The offset must be a multiple of the block size. A buffer that ends in a
/// partial block is served by reading the covering blocks and copying only
/// what fits.
///
/// The reader also keeps a cursor for [`Read`] and [`Seek`]. Sequential reads
/// start anywhere, cover the whole device including its last block, and
/// return `Ok(0)` once the cursor reaches the end.
pub struct BlockReader {
    executor: CommandExecutor,
    position: u64,
}

impl BlockReader {
    /// Query capacity and bind a reader to `session`
    pub fn open(session: Arc<Session>) -> ScsiResult<Self> {
        let capacity = session.read_capacity()?;
        Ok(BlockReader {
            executor: CommandExecutor::new(session, capacity),
            position: 0,
        })
    }

    pub fn capacity(&self) -> Capacity {
        self.executor.capacity()
    }

    pub fn session(&self) -> &Arc<Session> {
        self.executor.session()
    }

    /// Byte offset of the next sequential read
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Fill `buf` from byte `offset`, returning the number of bytes read
    ///
    /// Reads touching the end of the device (`offset + buf.len()` at or past
    /// the total size) return `EndOfDevice` without issuing a command.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> ScsiResult<usize> {
        if self.session().is_closed() {
            return Err(IscsiError::Closed);
        }

        let capacity = self.capacity();
        let bs = capacity.block_size as u64;
        match offset.checked_add(buf.len() as u64) {
            Some(end) if end < capacity.total_bytes() => {}
            _ => return Err(IscsiError::EndOfDevice),
        }
        if offset % bs != 0 {
            return Err(IscsiError::Misaligned {
                offset,
                block_size: capacity.block_size,
            });
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let data = self.read_blocks(offset / bs, (buf.len() as u64).div_ceil(bs))?;
        buf.copy_from_slice(&data[..buf.len()]);
        log::trace!("Read {} bytes at offset {}", buf.len(), offset);
        Ok(buf.len())
    }

    fn read_blocks(&self, start_block: u64, blocks: u64) -> ScsiResult<Vec<u8>> {
        let capacity = self.capacity();
        let block_count = u32::try_from(blocks).map_err(|_| IscsiError::OutOfBounds {
            start_block,
            block_count: blocks,
            device_blocks: capacity.block_count,
        })?;
        self.executor.read(&ReadCommand {
            start_block,
            block_count,
            block_size: capacity.block_size,
        })
    }

    /// Disconnect the session; repeated calls succeed without doing anything
    pub fn close(&self) -> ScsiResult<()> {
        self.session().disconnect()
    }
}

impl Read for BlockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.session().is_closed() {
            return Err(IscsiError::Closed.into());
        }
        let capacity = self.capacity();
        let total = capacity.total_bytes();
        if buf.is_empty() || self.position >= total {
            return Ok(0);
        }

        let bs = capacity.block_size as u64;
        let skip = self.position % bs;
        let want = (buf.len() as u64).min(total - self.position);
        let blocks = (skip + want).div_ceil(bs).min(MAX_SEQUENTIAL_BLOCKS);
        let data = self.read_blocks(self.position / bs, blocks)?;

        let skip = skip as usize;
        let n = (data.len() - skip).min(want as usize);
        buf[..n].copy_from_slice(&data[skip..skip + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for BlockReader {
    /// Positions past the end are allowed; reads there return `Ok(0)`
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.capacity().total_bytes().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::memory::MemoryTarget;

    fn reader(target: &MemoryTarget) -> BlockReader {
        let config = SessionConfig::builder()
            .initiator_name("iqn.2024-10.libiscsi:go")
            .target_url("iscsi://127.0.0.1/iqn.2025-12.local:mem/0")
            .build()
            .unwrap();
        let session = Session::with_transport(config, Box::new(target.transport().unwrap()));
        session.connect().unwrap();
        BlockReader::open(session).unwrap()
    }

    #[test]
    fn test_read_whole_blocks() {
        let target = MemoryTarget::new(512, 8);
        target.fill(512, &[7u8; 1024]);
        let reader = reader(&target);

        let mut buf = vec![0u8; 1024];
        assert_eq!(reader.read_at(&mut buf, 512).unwrap(), 1024);
        assert!(buf.iter().all(|&b| b == 7));
        assert_eq!(target.read_commands(), 1);
    }

    #[test]
    fn test_short_buffer() {
        let target = MemoryTarget::new(512, 8);
        target.fill(0, b"hello iscsi");
        let reader = reader(&target);

        let mut buf = [0u8; 11];
        assert_eq!(reader.read_at(&mut buf, 0).unwrap(), 11);
        assert_eq!(&buf, b"hello iscsi");
    }

    #[test]
    fn test_misaligned_offset() {
        let target = MemoryTarget::new(512, 8);
        let reader = reader(&target);
        let mut buf = [0u8; 16];
        let err = reader.read_at(&mut buf, 100).unwrap_err();
        assert!(matches!(err, IscsiError::Misaligned { offset: 100, block_size: 512 }));
        assert_eq!(target.read_commands(), 0);
    }

    #[test]
    fn test_end_of_device() {
        let target = MemoryTarget::new(512, 8);
        let reader = reader(&target);
        let mut buf = vec![0u8; 512];
        assert!(reader.read_at(&mut buf, 3584).unwrap_err().is_end_of_device());
        assert!(reader.read_at(&mut buf, 8192).unwrap_err().is_end_of_device());
        assert!(reader.read_at(&mut buf, u64::MAX).unwrap_err().is_end_of_device());
        assert_eq!(reader.read_at(&mut buf, 3072).unwrap(), 512);
    }

    #[test]
    fn test_closed_reader() {
        let target = MemoryTarget::new(512, 8);
        let reader = reader(&target);
        reader.close().unwrap();
        reader.close().unwrap();
        let mut buf = [0u8; 512];
        assert!(matches!(reader.read_at(&mut buf, 0), Err(IscsiError::Closed)));
        assert_eq!(reader.capacity().block_count, 8);
    }

    #[test]
    fn test_sequential_drain() {
        let target = MemoryTarget::new(512, 8);
        let contents: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        target.fill(0, &contents);
        let mut reader = reader(&target);

        let mut drained = Vec::new();
        let copied = io::copy(&mut reader, &mut drained).unwrap();
        assert_eq!(copied, 4096);
        assert_eq!(drained, contents);
        assert_eq!(reader.position(), 4096);

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_sequential_odd_sizes() {
        let target = MemoryTarget::new(512, 8);
        let contents: Vec<u8> = (0..4096u32).map(|i| (i % 13) as u8).collect();
        target.fill(0, &contents);
        let mut reader = reader(&target);

        let mut drained = Vec::new();
        let sizes = [1usize, 700, 33, 1024, 511, 4000];
        let mut i = 0;
        loop {
            let mut buf = vec![0u8; sizes[i % sizes.len()]];
            i += 1;
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            drained.extend_from_slice(&buf[..n]);
        }
        assert_eq!(drained, contents);
    }

    #[test]
    fn test_seek_then_read() {
        let target = MemoryTarget::new(512, 8);
        target.fill(3584, b"last block");
        let mut reader = reader(&target);

        assert_eq!(reader.seek(SeekFrom::End(-512)).unwrap(), 3584);
        let mut buf = [0u8; 10];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"last block");
        assert_eq!(reader.seek(SeekFrom::Current(-10)).unwrap(), 3584);
        assert!(reader.seek(SeekFrom::Current(-4000)).is_err());

        reader.seek(SeekFrom::Start(10_000)).unwrap();
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_sequential_read_after_close() {
        let target = MemoryTarget::new(512, 8);
        let mut reader = reader(&target);
        reader.close().unwrap();
        let mut buf = [0u8; 512];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
