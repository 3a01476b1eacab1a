//! Write "hello iscsi" to block 0 and read it back
//!
//! ```text
//! cargo run --example connect -- iscsi://127.0.0.1:3260/iqn.2025-12.local:storage.disk1/0
//! ```

use iscsi_initiator::{BlockReader, BlockWriter};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "iscsi://127.0.0.1:3260/iqn.2025-12.local:storage.disk1/0".to_string());

    let initiator_iqn = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "iqn.2024-10.libiscsi:go".to_string());

    println!("Connecting to {} as {}...", url, initiator_iqn);
    let session = iscsi_initiator::open(&initiator_iqn, &url)?;
    session.connect()?;

    let capacity = session.read_capacity()?;
    println!(
        "Capacity: {} blocks of {} bytes ({} bytes)",
        capacity.block_count,
        capacity.block_size,
        capacity.total_bytes()
    );

    let writer = BlockWriter::open(Arc::clone(&session))?;
    let reader = BlockReader::open(Arc::clone(&session))?;

    let mut block = vec![0u8; capacity.block_size as usize];
    block[..11].copy_from_slice(b"hello iscsi");
    let written = writer.write_at(&block, 0)?;
    println!("Wrote {} bytes to block 0", written);

    let mut buf = [0u8; 11];
    reader.read_at(&mut buf, 0)?;
    println!("Read back: {:?}", String::from_utf8_lossy(&buf));

    writer.close()?;
    Ok(())
}
