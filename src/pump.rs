//! Event pump for asynchronous reads
//!
//! The pump turns descriptor readiness into protocol progress for one
//! session. Callers submit reads from any thread; a single thread drives
//! `run` until its cancel flag is set:
//!
//! 1. ask the transport which events it needs
//! 2. with nothing pending, sleep the idle delay and start over
//! 3. otherwise `poll(2)` the descriptor for at most the poll timeout
//!    (`EINTR` just restarts the loop)
//! 4. hand the ready events to the transport, which reports completions
//!
//! Every submitted read receives exactly one [`TaskResult`]. Payloads are
//! copied out of the transport's buffer before delivery.

use crate::error::{IscsiError, ScsiResult};
use crate::executor::ReadCommand;
use crate::scsi::{describe_status, scsi_status, Capacity};
use crate::session::Session;
use crate::transport::{Events, TaskCompletion, TaskToken};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Successful completion of an asynchronous command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub status: u8,
    pub data_in: Vec<u8>,
}

/// Outcome of one submitted command, paired with the caller's context
#[derive(Debug)]
pub struct TaskResult<C> {
    pub token: TaskToken,
    pub context: C,
    pub outcome: ScsiResult<Task>,
}

/// Receiving end for a single submitted command
pub struct TaskHandle<C> {
    token: TaskToken,
    rx: Receiver<TaskResult<C>>,
}

impl<C> TaskHandle<C> {
    pub fn token(&self) -> TaskToken {
        self.token
    }

    /// Block until the result arrives
    pub fn wait(self) -> ScsiResult<TaskResult<C>> {
        self.rx
            .recv()
            .map_err(|_| IscsiError::TaskFailed(format!("{} was dropped without a result", self.token)))
    }

    /// Wait up to `timeout`; `Ok(None)` if the command is still running
    pub fn wait_timeout(&self, timeout: Duration) -> ScsiResult<Option<TaskResult<C>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Ok(Some(result)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(IscsiError::TaskFailed(format!(
                "{} was dropped without a result",
                self.token
            ))),
        }
    }
}

struct Pending<C> {
    context: C,
    tx: Sender<TaskResult<C>>,
}

/// Cooperative completion loop bound to one session
pub struct EventPump<C> {
    session: Arc<Session>,
    capacity: Capacity,
    pending: Mutex<HashMap<TaskToken, Pending<C>>>,
    next_token: AtomicU64,
}

impl<C: Send> EventPump<C> {
    /// Bind a pump to a connected session, probing capacity if needed
    pub fn new(session: Arc<Session>) -> ScsiResult<Self> {
        let capacity = session.capacity()?;
        Ok(EventPump {
            session,
            capacity,
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<TaskToken, Pending<C>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commands submitted but not yet completed
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Submit a read whose result arrives on its own channel
    pub fn submit_read(&self, cmd: &ReadCommand, context: C) -> ScsiResult<TaskHandle<C>> {
        let (tx, rx) = mpsc::channel();
        let token = self.submit_read_with(cmd, context, tx)?;
        Ok(TaskHandle { token, rx })
    }

    /// Submit a read whose result is sent on `results`
    ///
    /// If submission itself fails, the error is returned here and nothing is
    /// ever sent for this command.
    pub fn submit_read_with(&self, cmd: &ReadCommand, context: C, results: Sender<TaskResult<C>>) -> ScsiResult<TaskToken> {
        self.capacity.check_range(cmd.start_block, cmd.block_count as u64)?;

        let token = TaskToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        // Registered before the transport sees it, so a fast completion finds it
        self.pending().insert(token, Pending { context, tx: results });

        let submitted = self.session.with_handle(|transport| {
            transport.submit_read16(token, cmd.start_block, cmd.block_count, cmd.block_size)
        });
        if let Err(e) = submitted {
            self.pending().remove(&token);
            return Err(e);
        }

        log::trace!("Submitted {} for blocks {}+{}", token, cmd.start_block, cmd.block_count);
        Ok(token)
    }

    /// Drive the transport until `cancel` is set
    ///
    /// A fatal wait or dispatch failure stops the loop, fails every pending
    /// command with that error and is returned.
    pub fn run(&self, cancel: &AtomicBool) -> ScsiResult<()> {
        let result = self.pump(cancel);
        if let Err(e) = &result {
            log::warn!("Event pump for {} stopped: {}", self.session.target(), e);
            self.fail_all(&format!("event pump stopped: {}", e));
        }
        result
    }

    fn pump(&self, cancel: &AtomicBool) -> ScsiResult<()> {
        let config = self.session.config();
        let poll_timeout = config.pump_poll_timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let idle_delay = config.pump_idle_delay;

        while !cancel.load(Ordering::Acquire) {
            let (fd, events) = self
                .session
                .with_handle(|transport| Ok((transport.descriptor(), transport.which_events())))?;

            if events.is_empty() {
                thread::sleep(idle_delay);
                continue;
            }

            let mut pfd = libc::pollfd {
                fd,
                events: events.bits(),
                revents: 0,
            };
            let r = unsafe { libc::poll(&mut pfd, 1, poll_timeout) };
            if r < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            let ready = Events::from_bits(pfd.revents);
            self.session.with_handle(|transport| {
                transport.service(ready, &mut |token, completion| self.complete(token, completion))
            })?;
        }
        Ok(())
    }

    fn complete(&self, token: TaskToken, completion: TaskCompletion<'_>) {
        let Some(Pending { context, tx }) = self.pending().remove(&token) else {
            log::debug!("Completion for unknown {}", token);
            return;
        };

        let outcome = match completion {
            TaskCompletion::Done { status, data_in } if status == scsi_status::GOOD => Ok(Task {
                status,
                data_in: data_in.to_vec(),
            }),
            TaskCompletion::Done { status, .. } => Err(IscsiError::Scsi(describe_status("READ(16)", status, None))),
            TaskCompletion::Failed(msg) => Err(IscsiError::TaskFailed(msg)),
        };

        if tx.send(TaskResult { token, context, outcome }).is_err() {
            log::trace!("Result for {} had no receiver", token);
        }
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = self.pending().drain().collect();
        for (token, Pending { context, tx }) in drained {
            let outcome = Err(IscsiError::TaskFailed(reason.to_string()));
            let _ = tx.send(TaskResult { token, context, outcome });
        }
    }
}

impl<C> Drop for EventPump<C> {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (token, Pending { context, tx }) in pending.drain() {
            let outcome = Err(IscsiError::TaskFailed("event pump dropped".to_string()));
            let _ = tx.send(TaskResult { token, context, outcome });
        }
    }
}
