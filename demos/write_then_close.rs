//! Close a writer from one thread while another is writing
//!
//! The producer keeps rewriting the start of the device until `close` on the
//! main thread stops it. A fresh session then reads back what landed.

use iscsi_initiator::{BlockReader, BlockWriter};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "iscsi://127.0.0.1:3260/iqn.2025-12.local:storage.disk1/0".to_string());
    let initiator_iqn = "iqn.2024-10.libiscsi:go";

    let session = iscsi_initiator::open(initiator_iqn, &url)?;
    session.connect()?;
    let writer = Arc::new(BlockWriter::open(session)?);
    let block_size = writer.capacity().block_size as usize;

    let producer = {
        let writer = Arc::clone(&writer);
        thread::spawn(move || {
            let chunk = vec![0x3Cu8; block_size * 16];
            let mut total = 0usize;
            loop {
                match writer.write_at(&chunk, 0) {
                    Ok(n) => total += n,
                    Err(e) => return (total + e.bytes_transferred(), e),
                }
            }
        })
    };

    thread::sleep(Duration::from_millis(500));
    println!("Closing writer...");
    writer.close()?;

    let (total, err) = producer
        .join()
        .map_err(|_| "producer thread panicked")?;
    println!("Producer wrote {} bytes before stopping: {}", total, err);

    let session = iscsi_initiator::open(initiator_iqn, &url)?;
    session.connect()?;
    let reader = BlockReader::open(Arc::clone(&session))?;
    let mut buf = vec![0u8; block_size];
    reader.read_at(&mut buf, 0)?;
    println!(
        "Block 0 after close: {}",
        if buf.iter().all(|&b| b == 0x3C) { "written" } else { "not written" }
    );
    reader.close()?;

    Ok(())
}
