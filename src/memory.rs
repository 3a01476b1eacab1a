//! RAM-backed target and transport
//!
//! `MemoryTarget` is a block device living in process memory with knobs for
//! the failure modes a real target produces: logins that fail after leaving a
//! half-open session behind, transient poll failures, failing writes, slow
//! writes and garbage capacity replies. `MemoryTransport` speaks to it through
//! the same [`Transport`] trait as the TCP client, including a pollable
//! descriptor so the event pump runs unchanged.

use crate::error::{IscsiError, ScsiResult};
use crate::scsi::{asc, describe_status, scsi_status, sense_key, Capacity, ScsiOpcode, ScsiTask, SenseData};
use crate::transport::{Events, TaskCompletion, TaskToken, Transport};
use crate::url::TargetUrl;
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

struct TargetState {
    capacity: Capacity,
    disk: Vec<u8>,
    /// The target's view: a session exists for our initiator
    session_active: bool,

    login_failures: u32,
    poll_failures: u32,
    fail_write_at: Option<u64>,
    write_delay: Duration,
    capacity10_reply: Option<ScsiTask>,
    capacity16_reply: Option<ScsiTask>,
    hold_async: bool,

    login_attempts: u32,
    logouts: u32,
    reconnects: u32,
    read_commands: u32,
    writes: Vec<u64>,
}

/// Shared handle to an in-memory block device
#[derive(Clone)]
pub struct MemoryTarget {
    state: Arc<Mutex<TargetState>>,
}

impl MemoryTarget {
    /// Create a zero-filled device
    pub fn new(block_size: u32, block_count: u64) -> Self {
        let capacity = Capacity::new(block_size, block_count);
        MemoryTarget {
            state: Arc::new(Mutex::new(TargetState {
                capacity,
                disk: vec![0u8; capacity.total_bytes() as usize],
                session_active: false,
                login_failures: 0,
                poll_failures: 0,
                fail_write_at: None,
                write_delay: Duration::ZERO,
                capacity10_reply: None,
                capacity16_reply: None,
                hold_async: false,
                login_attempts: 0,
                logouts: 0,
                reconnects: 0,
                read_commands: 0,
                writes: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TargetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// New transport connected to this device
    pub fn transport(&self) -> ScsiResult<MemoryTransport> {
        let (wake, peer) = UnixStream::pair()?;
        Ok(MemoryTransport {
            state: Arc::clone(&self.state),
            target: None,
            connected: false,
            queue: VecDeque::new(),
            wake,
            _peer: peer,
        })
    }

    pub fn capacity(&self) -> Capacity {
        self.lock().capacity
    }

    /// Snapshot of the whole device
    pub fn contents(&self) -> Vec<u8> {
        self.lock().disk.clone()
    }

    /// Preload bytes at a byte offset
    pub fn fill(&self, offset: usize, data: &[u8]) {
        let mut state = self.lock();
        state.disk[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Fail the next `count` logins, each leaving a half-open session behind
    pub fn fail_logins(&self, count: u32) {
        self.lock().login_failures = count;
    }

    /// Fail the next `count` reads with the transient poll failure
    pub fn fail_reads(&self, count: u32) {
        self.lock().poll_failures = count;
    }

    /// Fail every write that starts at `lba` with a medium error
    pub fn fail_write_at(&self, lba: Option<u64>) {
        self.lock().fail_write_at = lba;
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.lock().write_delay = delay;
    }

    /// Answer READ CAPACITY(10) with `task` instead of the real geometry
    pub fn override_read_capacity10(&self, task: ScsiTask) {
        self.lock().capacity10_reply = Some(task);
    }

    /// Answer READ CAPACITY(16) with `task` instead of the device geometry
    pub fn override_read_capacity16(&self, task: ScsiTask) {
        self.lock().capacity16_reply = Some(task);
    }

    /// Keep submitted asynchronous reads pending until released
    pub fn hold_async(&self, hold: bool) {
        self.lock().hold_async = hold;
    }

    pub fn login_attempts(&self) -> u32 {
        self.lock().login_attempts
    }

    pub fn logouts(&self) -> u32 {
        self.lock().logouts
    }

    pub fn reconnects(&self) -> u32 {
        self.lock().reconnects
    }

    pub fn read_commands(&self) -> u32 {
        self.lock().read_commands
    }

    /// Starting LBA of every WRITE(16) received, in arrival order
    pub fn writes(&self) -> Vec<u64> {
        self.lock().writes.clone()
    }

    /// Whether the target believes a session is logged in
    pub fn has_session(&self) -> bool {
        self.lock().session_active
    }
}

fn lba_out_of_range(what: &str) -> IscsiError {
    let sense = SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0);
    IscsiError::Scsi(describe_status(what, scsi_status::CHECK_CONDITION, Some(&sense)))
}

fn byte_range(capacity: &Capacity, lba: u64, blocks: u64, what: &str) -> ScsiResult<std::ops::Range<usize>> {
    if capacity.check_range(lba, blocks).is_err() {
        return Err(lba_out_of_range(what));
    }
    let bs = capacity.block_size as usize;
    let start = lba as usize * bs;
    Ok(start..start + blocks as usize * bs)
}

/// Transport bound to a [`MemoryTarget`]
pub struct MemoryTransport {
    state: Arc<Mutex<TargetState>>,
    target: Option<TargetUrl>,
    connected: bool,
    queue: VecDeque<(TaskToken, u64, u32, u32)>,
    /// Always-writable socket standing in for the connection
    wake: UnixStream,
    _peer: UnixStream,
}

impl MemoryTransport {
    fn lock(&self) -> MutexGuard<'_, TargetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> ScsiResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(IscsiError::Session("Not logged in. Call connect() first.".to_string()))
        }
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, target: &TargetUrl) -> ScsiResult<()> {
        if self.connected {
            return Err(IscsiError::Session("already logged in".to_string()));
        }
        let mut state = self.lock();
        state.login_attempts += 1;
        if state.session_active {
            return Err(IscsiError::Connection("initiator is already logged in to the target".to_string()));
        }
        // Either way the target now holds a session for us
        state.session_active = true;
        if state.login_failures > 0 {
            state.login_failures -= 1;
            return Err(IscsiError::Connection("login negotiation failed".to_string()));
        }
        drop(state);

        self.target = Some(target.clone());
        self.connected = true;
        Ok(())
    }

    fn reconnect(&mut self) -> ScsiResult<()> {
        if self.target.is_none() {
            return Err(IscsiError::Session("reconnect before connect".to_string()));
        }
        let mut state = self.lock();
        state.reconnects += 1;
        state.session_active = true;
        drop(state);
        self.connected = true;
        Ok(())
    }

    fn is_logged_in(&self) -> bool {
        self.connected
    }

    fn logout(&mut self) -> ScsiResult<()> {
        let mut state = self.lock();
        state.logouts += 1;
        state.session_active = false;
        drop(state);
        self.connected = false;
        Ok(())
    }

    fn read_capacity10(&mut self) -> ScsiResult<ScsiTask> {
        self.ensure_connected()?;
        let state = self.lock();
        if let Some(task) = &state.capacity10_reply {
            return Ok(task.clone());
        }
        Ok(ScsiTask {
            opcode: ScsiOpcode::ReadCapacity10 as u8,
            status: scsi_status::GOOD,
            data_in: state.capacity.to_read_capacity10().to_vec(),
            sense: None,
        })
    }

    fn read_capacity16(&mut self) -> ScsiResult<ScsiTask> {
        self.ensure_connected()?;
        let state = self.lock();
        if let Some(task) = &state.capacity16_reply {
            return Ok(task.clone());
        }
        Ok(ScsiTask {
            opcode: ScsiOpcode::ServiceActionIn16 as u8,
            status: scsi_status::GOOD,
            data_in: state.capacity.to_read_capacity16().to_vec(),
            sense: None,
        })
    }

    fn read16(&mut self, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<Vec<u8>> {
        self.ensure_connected()?;
        let mut state = self.lock();
        state.read_commands += 1;
        if state.poll_failures > 0 {
            state.poll_failures -= 1;
            return Err(IscsiError::PollFailed);
        }
        if block_size != state.capacity.block_size {
            return Err(IscsiError::Protocol(format!(
                "READ(16) with block size {} on a {} byte device",
                block_size, state.capacity.block_size
            )));
        }
        let range = byte_range(&state.capacity, lba, blocks as u64, "READ(16)")?;
        Ok(state.disk[range].to_vec())
    }

    fn write16(&mut self, lba: u64, data: &[u8], block_size: u32) -> ScsiResult<()> {
        self.ensure_connected()?;
        let delay = self.lock().write_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        state.writes.push(lba);
        if block_size != state.capacity.block_size || data.len() % block_size as usize != 0 {
            return Err(IscsiError::Protocol(format!(
                "WRITE(16) of {} bytes with block size {} on a {} byte device",
                data.len(),
                block_size,
                state.capacity.block_size
            )));
        }
        if state.fail_write_at == Some(lba) {
            let sense = SenseData::new(sense_key::MEDIUM_ERROR, 0x0C, 0x00);
            return Err(IscsiError::Scsi(describe_status(
                "WRITE(16)",
                scsi_status::CHECK_CONDITION,
                Some(&sense),
            )));
        }
        let blocks = (data.len() / block_size as usize) as u64;
        let range = byte_range(&state.capacity, lba, blocks, "WRITE(16)")?;
        state.disk[range].copy_from_slice(data);
        Ok(())
    }

    fn descriptor(&self) -> RawFd {
        self.wake.as_raw_fd()
    }

    fn which_events(&self) -> Events {
        if self.queue.is_empty() {
            Events::NONE
        } else if self.lock().hold_async {
            // Nothing ever arrives on the socket, so this waits out the poll timeout
            Events::READABLE
        } else {
            Events::WRITABLE
        }
    }

    fn service(
        &mut self,
        _ready: Events,
        on_complete: &mut dyn FnMut(TaskToken, TaskCompletion<'_>),
    ) -> ScsiResult<()> {
        if self.lock().hold_async {
            return Ok(());
        }
        while let Some((token, lba, blocks, block_size)) = self.queue.pop_front() {
            match self.read16(lba, blocks, block_size) {
                Ok(data) => on_complete(
                    token,
                    TaskCompletion::Done {
                        status: scsi_status::GOOD,
                        data_in: &data,
                    },
                ),
                Err(e) => on_complete(token, TaskCompletion::Failed(e.to_string())),
            }
        }
        Ok(())
    }

    fn submit_read16(&mut self, token: TaskToken, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<()> {
        self.ensure_connected()?;
        self.queue.push_back((token, lba, blocks, block_size));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> TargetUrl {
        TargetUrl::parse("iscsi://127.0.0.1/iqn.2025-12.local:mem/0").unwrap()
    }

    #[test]
    fn test_failed_login_leaves_session_behind() {
        let target = MemoryTarget::new(512, 8);
        target.fail_logins(1);
        let mut transport = target.transport().unwrap();

        assert!(transport.connect(&url()).is_err());
        assert!(target.has_session());

        // Without a logout the target refuses the next login
        let err = transport.connect(&url()).unwrap_err();
        assert!(err.to_string().contains("already logged in"));

        transport.logout().unwrap();
        transport.connect(&url()).unwrap();
        assert_eq!(target.login_attempts(), 3);
        assert_eq!(target.logouts(), 1);
    }

    #[test]
    fn test_read_write_blocks() {
        let target = MemoryTarget::new(512, 8);
        let mut transport = target.transport().unwrap();
        transport.connect(&url()).unwrap();

        let data = vec![0xAB; 1024];
        transport.write16(2, &data, 512).unwrap();
        assert_eq!(transport.read16(2, 2, 512).unwrap(), data);
        assert_eq!(target.writes(), vec![2]);
        assert_eq!(&target.contents()[1024..2048], &data[..]);
    }

    #[test]
    fn test_out_of_range_is_check_condition() {
        let target = MemoryTarget::new(512, 8);
        let mut transport = target.transport().unwrap();
        transport.connect(&url()).unwrap();

        let err = transport.read16(7, 2, 512).unwrap_err();
        assert!(matches!(err, IscsiError::Scsi(_)));
        assert!(err.to_string().contains("CHECK CONDITION"));
    }

    #[test]
    fn test_poll_failures_then_success() {
        let target = MemoryTarget::new(512, 8);
        target.fail_reads(2);
        let mut transport = target.transport().unwrap();
        transport.connect(&url()).unwrap();

        assert!(transport.read16(0, 1, 512).unwrap_err().is_transient());
        assert!(transport.read16(0, 1, 512).unwrap_err().is_transient());
        assert!(transport.read16(0, 1, 512).is_ok());
        assert_eq!(target.read_commands(), 3);
    }

    #[test]
    fn test_async_read_completes_in_service() {
        let target = MemoryTarget::new(512, 8);
        target.fill(512, b"block one");
        let mut transport = target.transport().unwrap();
        transport.connect(&url()).unwrap();

        assert!(transport.which_events().is_empty());
        transport.submit_read16(TaskToken(7), 1, 1, 512).unwrap();
        assert_eq!(transport.which_events(), Events::WRITABLE);

        let mut seen = Vec::new();
        transport
            .service(Events::WRITABLE, &mut |token, completion| match completion {
                TaskCompletion::Done { data_in, .. } => seen.push((token, data_in[..9].to_vec())),
                TaskCompletion::Failed(msg) => panic!("read failed: {}", msg),
            })
            .unwrap();
        assert_eq!(seen, vec![(TaskToken(7), b"block one".to_vec())]);
        assert!(transport.which_events().is_empty());
    }

    #[test]
    fn test_commands_need_login() {
        let target = MemoryTarget::new(512, 8);
        let mut transport = target.transport().unwrap();
        assert!(transport.read_capacity10().is_err());
        assert!(transport.reconnect().is_err());
        assert!(transport.descriptor() >= 0);
    }

    #[test]
    fn test_capacity_reply() {
        let target = MemoryTarget::new(512, 8);
        let mut transport = target.transport().unwrap();
        transport.connect(&url()).unwrap();
        let task = transport.read_capacity10().unwrap();
        assert_eq!(task.data_in, vec![0, 0, 0, 7, 0, 0, 2, 0]);
        assert_eq!(
            Capacity::from_read_capacity10(&task.data_in).unwrap(),
            Some(Capacity::new(512, 8))
        );
        assert_eq!(task.opcode, crate::scsi::build_read_capacity10()[0]);
    }
}
