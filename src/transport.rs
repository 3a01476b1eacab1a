//! Transport capability consumed by the session layer
//!
//! A transport owns one connection to one target and knows how to log in,
//! carry SCSI commands and report completions of asynchronous reads. The
//! rest of the crate only ever talks to a target through this trait.

use crate::error::ScsiResult;
use crate::scsi::ScsiTask;
use crate::url::TargetUrl;
use std::fmt;
use std::os::unix::io::RawFd;

/// Readiness conditions a transport descriptor is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Events(i16);

impl Events {
    pub const NONE: Events = Events(0);
    pub const READABLE: Events = Events(libc::POLLIN);
    pub const WRITABLE: Events = Events(libc::POLLOUT);

    pub fn from_bits(bits: i16) -> Self {
        Events(bits)
    }

    pub fn bits(self) -> i16 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Events) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Error or hang-up reported by poll(2)
    pub fn is_error(self) -> bool {
        self.0 & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
    }
}

impl std::ops::BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

/// Correlation token linking an asynchronous command to its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskToken(pub u64);

impl fmt::Display for TaskToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Completion of an asynchronous command as seen inside `service`
///
/// The payload borrows the transport's command buffer and is only valid for
/// the duration of the callback.
#[derive(Debug)]
pub enum TaskCompletion<'a> {
    Done { status: u8, data_in: &'a [u8] },
    Failed(String),
}

/// The protocol engine behind a session
pub trait Transport: Send {
    /// Log in to the target. Fails if already logged in.
    fn connect(&mut self, target: &TargetUrl) -> ScsiResult<()>;

    /// Re-establish the connection of an existing login with the same parameters
    fn reconnect(&mut self) -> ScsiResult<()>;

    /// True between a successful login and the next logout
    fn is_logged_in(&self) -> bool;

    /// Log out; succeeds without doing anything if not logged in
    fn logout(&mut self) -> ScsiResult<()>;

    /// READ CAPACITY(10), returning the raw task
    fn read_capacity10(&mut self) -> ScsiResult<ScsiTask>;

    /// READ CAPACITY(16), returning the raw task
    fn read_capacity16(&mut self) -> ScsiResult<ScsiTask>;

    /// READ(16) of `blocks` blocks; the payload is exactly `blocks * block_size` bytes
    fn read16(&mut self, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<Vec<u8>>;

    /// WRITE(16); `data.len()` must be a multiple of `block_size`
    fn write16(&mut self, lba: u64, data: &[u8], block_size: u32) -> ScsiResult<()>;

    /// Descriptor to wait on for asynchronous progress
    fn descriptor(&self) -> RawFd;

    /// Events the transport currently needs to make progress
    fn which_events(&self) -> Events;

    /// Make progress on `ready` events, reporting each finished asynchronous
    /// command through `on_complete`
    fn service(
        &mut self,
        ready: Events,
        on_complete: &mut dyn FnMut(TaskToken, TaskCompletion<'_>),
    ) -> ScsiResult<()>;

    /// Queue a READ(16) whose completion is reported by a later `service`
    fn submit_read16(&mut self, token: TaskToken, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<()>;
}
