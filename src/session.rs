//! Initiator session lifecycle
//!
//! A `Session` owns the transport for one target and is the only way the rest
//! of the crate reaches it. State moves Open -> Closing -> Closed exactly once;
//! after `disconnect` starts, every operation fails with `Closed` without
//! touching the transport.

use crate::client::IscsiClient;
use crate::config::SessionConfig;
use crate::error::{IscsiError, ScsiResult};
use crate::scsi::{Capacity, ScsiOpcode, ScsiTask};
use crate::transport::Transport;
use crate::url::TargetUrl;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Open,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// One login to one target
pub struct Session {
    config: SessionConfig,
    state: AtomicU8,
    transport: Mutex<Option<Box<dyn Transport>>>,
    capacity: OnceLock<Capacity>,
}

impl Session {
    /// Create a session using the TCP transport. Does not log in.
    pub fn open(config: SessionConfig) -> Arc<Session> {
        let client = IscsiClient::new(&config.initiator_name, config.io_timeout);
        Self::with_transport(config, Box::new(client))
    }

    /// Create a session over an existing transport
    pub fn with_transport(config: SessionConfig, transport: Box<dyn Transport>) -> Arc<Session> {
        Arc::new(Session {
            config,
            state: AtomicU8::new(SessionState::Open as u8),
            transport: Mutex::new(Some(transport)),
            capacity: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn target(&self) -> &TargetUrl {
        &self.config.target
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once `disconnect` has started
    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::Open
    }

    fn ensure_open(&self) -> ScsiResult<()> {
        if self.is_closed() {
            return Err(IscsiError::Closed);
        }
        Ok(())
    }

    fn handle(&self) -> MutexGuard<'_, Option<Box<dyn Transport>>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the transport while holding the session lock
    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(&mut dyn Transport) -> ScsiResult<R>) -> ScsiResult<R> {
        self.ensure_open()?;
        let mut guard = self.handle();
        // Re-check under the lock: a close may have won the race
        self.ensure_open()?;
        match guard.as_mut() {
            Some(transport) => f(transport.as_mut()),
            None => Err(IscsiError::Closed),
        }
    }

    /// Log in, retrying with backoff
    ///
    /// Each failed attempt is followed by a logout so a half-finished login
    /// does not make the next one fail with "already logged in".
    pub fn connect(&self) -> ScsiResult<()> {
        let target = &self.config.target;
        let attempts = self.config.connect_attempts;
        let mut last = String::new();

        if self.with_handle(|transport| Ok(transport.is_logged_in()))? {
            log::debug!("Already logged in to {}", target);
            return Ok(());
        }

        for attempt in 1..=attempts {
            let result = self.with_handle(|transport| match transport.connect(target) {
                Ok(()) => Ok(Ok(())),
                Err(e) => {
                    match transport.logout() {
                        Ok(()) => log::debug!("Logged out after failed login to {}", target),
                        Err(le) => log::debug!("Logout after failed login to {} failed: {}", target, le),
                    }
                    Ok(Err(e))
                }
            })?;

            match result {
                Ok(()) => {
                    log::info!("Connected to {} (attempt {}/{})", target, attempt, attempts);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Login attempt {}/{} to {} failed: {}", attempt, attempts, target, e);
                    last = e.to_string();
                    if attempt < attempts {
                        thread::sleep(self.config.backoff(attempt));
                    }
                }
            }
        }

        Err(IscsiError::ConnectFailed { attempts, last })
    }

    /// Re-establish a dropped connection. Not retried.
    pub fn reconnect(&self) -> ScsiResult<()> {
        let target = &self.config.target;
        self.with_handle(|transport| transport.reconnect())
            .map_err(|e| match e {
                IscsiError::Closed => IscsiError::Closed,
                e => IscsiError::Connection(format!("reconnect to {} failed: {}", target, e)),
            })?;
        log::info!("Reconnected to {}", target);
        Ok(())
    }

    /// Log out and release the transport
    ///
    /// Only the first call does anything; later calls return `Ok` at once.
    /// The transport is released even when the logout itself fails.
    pub fn disconnect(&self) -> ScsiResult<()> {
        if self
            .state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }

        // Waits for any in-flight command to finish
        let transport = self.handle().take();
        let result = match transport {
            Some(mut transport) => transport.logout(),
            None => Ok(()),
        };
        self.state.store(SessionState::Closed as u8, Ordering::Release);

        match result {
            Ok(()) => {
                log::info!("Disconnected from {}", self.config.target);
                Ok(())
            }
            Err(e) => {
                log::warn!("Logout from {} failed: {}", self.config.target, e);
                Err(IscsiError::Connection(format!(
                    "logout from {} failed: {}",
                    self.config.target, e
                )))
            }
        }
    }

    /// Query the device geometry
    ///
    /// Always issues the command; the first successful answer is cached and
    /// returned from then on.
    pub fn read_capacity(&self) -> ScsiResult<Capacity> {
        let probed = self.with_handle(probe_capacity)?;
        let cached = *self.capacity.get_or_init(|| probed);
        log::debug!(
            "{}: {} blocks of {} bytes",
            self.config.target,
            cached.block_count,
            cached.block_size
        );
        Ok(cached)
    }

    /// Cached geometry, probing the device if it was never queried
    pub fn capacity(&self) -> ScsiResult<Capacity> {
        self.ensure_open()?;
        match self.capacity.get() {
            Some(capacity) => Ok(*capacity),
            None => self.read_capacity(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.disconnect() {
                log::debug!("Disconnect on drop failed: {}", e);
            }
        }
    }
}

fn expect_opcode(task: &ScsiTask, opcode: ScsiOpcode, what: &str) -> ScsiResult<()> {
    if task.opcode != opcode as u8 {
        return Err(IscsiError::Protocol(format!(
            "{} answered for opcode 0x{:02x}",
            what, task.opcode
        )));
    }
    Ok(())
}

fn probe_capacity(transport: &mut dyn Transport) -> ScsiResult<Capacity> {
    let task = transport.read_capacity10()?;
    expect_opcode(&task, ScsiOpcode::ReadCapacity10, "READ CAPACITY(10)")?;
    let task = task.check("READ CAPACITY(10)")?;
    if let Some(capacity) = Capacity::from_read_capacity10(&task.data_in)? {
        return Ok(capacity);
    }

    log::debug!("Device too large for READ CAPACITY(10), using READ CAPACITY(16)");
    let task = transport.read_capacity16()?;
    expect_opcode(&task, ScsiOpcode::ServiceActionIn16, "READ CAPACITY(16)")?;
    let task = task.check("READ CAPACITY(16)")?;
    Capacity::from_read_capacity16(&task.data_in)
}
