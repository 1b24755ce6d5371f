//! Paced command delivery to the motor controller.
//!
//! The controller buffers only a command or two and offers no "done"
//! notification, so the host has to pace itself. [`CommandQueue`] keeps a small
//! bounded pending list, and a dedicated worker thread moves commands to the
//! wire one at a time whenever a live `QM` poll says the firmware FIFO has room.
//!
//! ## Dispatch worker
//!
//! The worker is a small state machine ([`DispatchPhase`]):
//!
//! - **IdleEmpty**: nothing pending. Poll motor idleness; when idle and no
//!   enqueue happened meanwhile, go to DrainedSignal. When still moving,
//!   re-check after `idle_recheck` unless new work arrives first.
//! - **PollingBuffer**: work pending. Poll the FIFO flag; while full, sleep a
//!   fixed `poll_interval` and poll again. The firmware has no "room now"
//!   event, so this is a plain timed poll.
//! - **Dispatching**: pop the oldest command, send it, record it in history.
//! - **DrainedSignal**: release `wait_until_drained` callers. Exit when the
//!   queue is closing, otherwise block until new work arrives.
//!
//! Status polls fail open: an I/O error or an unreadable reply counts as
//! "room in the buffer" and "motor idle", logged at `warn`.
//!
//! ## Lost commands
//!
//! The motion planner advances its position model when it enqueues, not when
//! a command executes. A command that is accepted here but never reaches the
//! wire would silently corrupt that model, so a send that still fails after
//! `send_retries` attempts faults the whole queue: the worker stops and every
//! caller from then on gets [`RigError::DispatchFailed`].
//!
//! ## Example
//!
//! ```rust
//! use stylus_rig::command::ActionKind;
//! use stylus_rig::command_queue::{CommandQueue, QueueSettings};
//! use stylus_rig::transport::{self, mock::MockFirmware};
//!
//! let firmware = MockFirmware::new("2.4.4").with_time_scale(0.1);
//! let queue = CommandQueue::open(transport::shared(firmware.clone()), QueueSettings::default())?;
//!
//! queue.enqueue(["SC,5,16200", "SP,0,40", "SC,4,16000", "SP,1,90", "XM,100,0,0"])?;
//! queue.wait_until_drained(ActionKind::Click)?;
//! assert_eq!(firmware.sent_lines().len(), 5);
//!
//! queue.close()?;
//! # Ok::<(), stylus_rig::error::RigError>(())
//! ```

use crate::command::{chrono_duration, ActionKind, Command};
use crate::config::QueueConfig;
use crate::error::{RigError, RigResult};
use crate::firmware::{FirmwareVersion, ParsedStatus, StatusFormat};
use crate::transport::{SharedTransport, QUERY_MOTION, QUERY_VERSION};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Pacing parameters for a [`CommandQueue`].
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Pending commands allowed ahead of the firmware.
    pub capacity: usize,
    /// Sleep between FIFO polls while the buffer is full.
    pub poll_interval: Duration,
    /// Motor idleness re-check period with nothing pending.
    pub idle_recheck: Duration,
    /// Double the poll interval on consecutive full replies.
    pub poll_backoff: bool,
    /// Ceiling for the backed-off poll interval.
    pub max_poll_interval: Duration,
    /// Send attempts per command before the queue faults.
    pub send_retries: u32,
    /// Limit for drain waits; `None` waits forever.
    pub drain_timeout: Option<Duration>,
    /// How long `open` watches the worker for an early exit.
    pub startup_probe: Duration,
    /// Extra sleep past the estimated end time during `close`.
    pub close_grace: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for QueueSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            capacity: config.capacity,
            poll_interval: config.poll_interval(),
            idle_recheck: config.idle_recheck(),
            poll_backoff: config.poll_backoff,
            max_poll_interval: Duration::from_millis(config.max_poll_interval_ms),
            send_retries: config.send_retries,
            drain_timeout: config.drain_timeout(),
            startup_probe: Duration::from_millis(config.startup_probe_ms),
            close_grace: Duration::from_millis(config.close_grace_ms),
        }
    }
}

/// States of the dispatch worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    /// Nothing pending; waiting for the motors to stop.
    IdleEmpty,
    /// Work pending; waiting for room in the firmware FIFO.
    PollingBuffer,
    /// Sending the oldest pending command.
    Dispatching,
    /// Carries the enqueue generation observed before the idle poll.
    DrainedSignal(u64),
    /// Worker is done.
    Exit,
}

#[derive(Debug, Clone)]
struct Fault {
    id: u64,
    text: String,
    reason: String,
}

impl Fault {
    fn to_error(&self) -> RigError {
        RigError::DispatchFailed {
            id: self.id,
            text: self.text.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<Command>,
    history: Vec<Command>,
    next_id: u64,
    estimated_end: DateTime<Utc>,
    /// No more enqueues accepted.
    closed: bool,
    /// Worker exits at the next drained signal.
    stop: bool,
    /// Worker exits at the next opportunity, drained or not.
    abandon: bool,
    drained: bool,
    /// Bumped by every enqueued command.
    generation: u64,
    fault: Option<Fault>,
    worker_exited: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    /// New work, stop or abandon.
    work: Condvar,
    /// A pending slot was freed.
    space: Condvar,
    /// Drained, faulted or worker exited.
    settled: Condvar,
    transport: SharedTransport,
    settings: QueueSettings,
    format: StatusFormat,
}

impl Shared {
    fn poll_status(&self) -> ParsedStatus {
        match self.transport.lock().query(QUERY_MOTION) {
            Ok(reply) => {
                let status = self.format.parse(&reply);
                if !status.is_informative() {
                    warn!(reply = %reply.trim(), "Uninformative motion status, assuming idle with room");
                }
                status
            }
            Err(e) => {
                warn!(error = %e, "Motion status poll failed, assuming idle with room");
                ParsedStatus::NoReply
            }
        }
    }

    fn buffer_full(&self) -> bool {
        self.format.is_queryable() && self.poll_status().buffer_full(self.format)
    }

    fn motor_idle(&self) -> bool {
        !self.format.is_queryable() || self.poll_status().motor_idle()
    }

    fn notify_all(&self) {
        self.work.notify_all();
        self.space.notify_all();
        self.settled.notify_all();
    }
}

/// Bounded, paced command queue with a dedicated dispatch thread.
///
/// Commands are sent in exactly the order they were enqueued. Concurrent
/// producers keep their own batches ordered only if they do not interleave
/// calls; the motion planner is the single producer in practice.
pub struct CommandQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    version: Option<FirmwareVersion>,
}

impl CommandQueue {
    /// Connect to the controller and start the dispatch worker.
    ///
    /// The firmware version is read once here and fixes the `QM` reply format
    /// for the life of the queue.
    pub fn open(transport: SharedTransport, settings: QueueSettings) -> RigResult<Self> {
        let version = read_version(&transport);
        let format = StatusFormat::for_version(version);
        match version {
            Some(v) => info!(firmware = %v, format = ?format, "Motor controller connected"),
            None => warn!("Could not read firmware version, assuming the buffer always has room"),
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::with_capacity(settings.capacity),
                history: Vec::new(),
                next_id: 0,
                estimated_end: Utc::now(),
                closed: false,
                stop: false,
                abandon: false,
                drained: false,
                generation: 0,
                fault: None,
                worker_exited: false,
            }),
            work: Condvar::new(),
            space: Condvar::new(),
            settled: Condvar::new(),
            transport,
            settings,
            format,
        });

        let worker = Worker::new(Arc::clone(&shared));
        let span = info_span!("command_queue");
        let handle = thread::Builder::new()
            .name("command-queue".into())
            .spawn(move || span.in_scope(|| worker.run()))?;

        // Join-with-timeout probe: a worker that dies straight away means the
        // link is unusable.
        let probe_deadline = Instant::now() + shared.settings.startup_probe;
        let exited_early = {
            let mut st = shared.state.lock();
            while !st.worker_exited {
                if shared.settled.wait_until(&mut st, probe_deadline).timed_out() {
                    break;
                }
            }
            st.worker_exited
        };
        if exited_early {
            let _ = handle.join();
            return Err(RigError::Transport(
                "command queue worker exited during startup".into(),
            ));
        }

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            version,
        })
    }

    /// Append a batch of instructions.
    ///
    /// Empty lines are skipped and trailing carriage returns stripped. Blocks
    /// while the pending list is at capacity. Returns the ids assigned.
    pub fn enqueue<I, S>(&self, batch: I) -> RigResult<Vec<u64>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let shared = &self.shared;
        let mut ids = Vec::new();
        let mut st = shared.state.lock();
        Self::check_usable(&st)?;

        let now = Utc::now();
        if st.estimated_end < now {
            st.estimated_end = now;
        }

        for line in batch {
            let text = line.as_ref().trim();
            if text.is_empty() {
                continue;
            }

            while st.pending.len() >= shared.settings.capacity {
                Self::check_usable(&st)?;
                shared.space.wait(&mut st);
            }
            Self::check_usable(&st)?;

            st.next_id += 1;
            let command = Command::new(st.next_id, text.to_string(), st.estimated_end);
            st.estimated_end = st.estimated_end + chrono_duration(command.estimated_duration);
            st.generation += 1;
            st.drained = false;

            debug!(
                id = command.id,
                command = %command.text,
                duration_ms = command.estimated_duration.as_millis() as u64,
                "Enqueued"
            );
            ids.push(command.id);
            st.pending.push_back(command);
            shared.work.notify_one();
        }

        Ok(ids)
    }

    fn check_usable(st: &QueueState) -> RigResult<()> {
        if let Some(fault) = &st.fault {
            return Err(fault.to_error());
        }
        if st.closed || st.worker_exited {
            return Err(RigError::QueueClosed);
        }
        Ok(())
    }

    /// Block until the arm is physically still, if `kind` needs it.
    ///
    /// Returns once the worker has seen an empty pending list and an idle
    /// motor with no enqueue in between. Kinds that don't need a still arm
    /// return immediately.
    pub fn wait_until_drained(&self, kind: ActionKind) -> RigResult<()> {
        if !kind.requires_settle() {
            return Ok(());
        }
        self.wait_drained()
    }

    /// Unconditional drain wait.
    pub fn wait_drained(&self) -> RigResult<()> {
        let shared = &self.shared;
        let started = Instant::now();
        let deadline = shared.settings.drain_timeout.map(|limit| started + limit);
        let mut st = shared.state.lock();

        loop {
            if let Some(fault) = &st.fault {
                return Err(fault.to_error());
            }
            if st.drained {
                return Ok(());
            }
            if st.worker_exited {
                return if st.pending.is_empty() {
                    Ok(())
                } else {
                    Err(RigError::QueueClosed)
                };
            }

            match deadline {
                Some(deadline) => {
                    if shared.settled.wait_until(&mut st, deadline).timed_out() && !st.drained {
                        let waited = started.elapsed();
                        warn!(waited_ms = waited.as_millis() as u64, "Drain wait timed out");
                        return Err(RigError::PossiblyWedged { waited });
                    }
                }
                None => shared.settled.wait(&mut st),
            }
        }
    }

    /// Drain, let the estimated motion finish, stop the worker, then close
    /// the transport.
    ///
    /// Returns only after the worker thread has exited. Calling it again is a
    /// no-op.
    pub fn close(&self) -> RigResult<()> {
        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };

        let drain = self.wait_drained();
        if drain.is_ok() {
            let target = self.estimated_queue_end_time() + chrono_duration(self.shared.settings.close_grace);
            if let Ok(remaining) = (target - Utc::now()).to_std() {
                debug!(remaining_ms = remaining.as_millis() as u64, "Waiting out estimated motion");
                thread::sleep(remaining);
            }
        }

        {
            let mut st = self.shared.state.lock();
            st.closed = true;
            st.stop = true;
            if drain.is_err() {
                st.abandon = true;
            }
            self.shared.notify_all();
        }

        if handle.join().is_err() {
            error!("Command queue worker panicked");
        }

        let transport = self.shared.transport.lock().close();
        info!(dispatched = self.shared.state.lock().history.len(), "Command queue closed");

        match (drain, transport) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(a), Err(b)) => Err(RigError::ShutdownFailed(vec![a, b])),
        }
    }

    /// Query the controller for its firmware version.
    pub fn firmware_version(&self) -> RigResult<Option<FirmwareVersion>> {
        let reply = self.shared.transport.lock().query(QUERY_VERSION)?;
        Ok(FirmwareVersion::parse(&reply))
    }

    /// Version read at connect time.
    pub fn connected_version(&self) -> Option<FirmwareVersion> {
        self.version
    }

    /// `QM` reply shape chosen at connect time.
    pub fn status_format(&self) -> StatusFormat {
        self.shared.format
    }

    /// Projected time at which everything enqueued so far has run.
    pub fn estimated_queue_end_time(&self) -> DateTime<Utc> {
        self.shared.state.lock().estimated_end
    }

    /// Commands already handed to the firmware, oldest first.
    pub fn history(&self) -> Vec<Command> {
        self.shared.state.lock().history.clone()
    }

    /// Commands accepted but not yet sent.
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Pending commands allowed before `enqueue` blocks.
    pub fn capacity(&self) -> usize {
        self.shared.settings.capacity
    }

    /// Whether enqueues are refused, after `close` or a worker exit.
    pub fn is_closed(&self) -> bool {
        let st = self.shared.state.lock();
        st.closed || st.worker_exited
    }

    /// Whether the dispatch thread is still alive.
    pub fn is_worker_running(&self) -> bool {
        !self.shared.state.lock().worker_exited
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            {
                let mut st = self.shared.state.lock();
                st.closed = true;
                st.stop = true;
                st.abandon = true;
                self.shared.notify_all();
            }
            let _ = handle.join();
        }
    }
}

fn read_version(transport: &SharedTransport) -> Option<FirmwareVersion> {
    match transport.lock().query(QUERY_VERSION) {
        Ok(reply) => FirmwareVersion::parse(&reply),
        Err(e) => {
            warn!(error = %e, "Firmware version query failed");
            None
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    poll_interval: Duration,
}

impl Worker {
    fn new(shared: Arc<Shared>) -> Self {
        let poll_interval = shared.settings.poll_interval;
        Self {
            shared,
            poll_interval,
        }
    }

    fn run(mut self) {
        debug!("Command queue worker started");
        let mut phase = DispatchPhase::IdleEmpty;
        loop {
            phase = match phase {
                DispatchPhase::IdleEmpty => self.idle_empty(),
                DispatchPhase::PollingBuffer => self.polling_buffer(),
                DispatchPhase::Dispatching => self.dispatching(),
                DispatchPhase::DrainedSignal(generation) => self.drained_signal(generation),
                DispatchPhase::Exit => break,
            };
        }

        let mut st = self.shared.state.lock();
        st.worker_exited = true;
        self.shared.notify_all();
        debug!("Command queue worker exited");
    }

    fn idle_empty(&mut self) -> DispatchPhase {
        let generation = {
            let st = self.shared.state.lock();
            if st.abandon {
                return DispatchPhase::Exit;
            }
            if !st.pending.is_empty() {
                return DispatchPhase::PollingBuffer;
            }
            st.generation
        };

        let idle = self.shared.motor_idle();

        let mut st = self.shared.state.lock();
        if !st.pending.is_empty() {
            return DispatchPhase::PollingBuffer;
        }
        if idle {
            return if st.generation == generation {
                DispatchPhase::DrainedSignal(generation)
            } else {
                DispatchPhase::IdleEmpty
            };
        }
        if !st.abandon {
            self.shared
                .work
                .wait_for(&mut st, self.shared.settings.idle_recheck);
        }
        DispatchPhase::IdleEmpty
    }

    fn drained_signal(&mut self, generation: u64) -> DispatchPhase {
        let mut st = self.shared.state.lock();
        if st.generation != generation || !st.pending.is_empty() {
            return DispatchPhase::IdleEmpty;
        }
        if !st.drained {
            debug!(dispatched = st.history.len(), "Queue drained, motor idle");
        }
        st.drained = true;
        self.shared.settled.notify_all();

        if st.stop || st.abandon {
            return DispatchPhase::Exit;
        }
        while st.pending.is_empty() && !st.stop && !st.abandon {
            self.shared.work.wait(&mut st);
        }
        DispatchPhase::IdleEmpty
    }

    fn polling_buffer(&mut self) -> DispatchPhase {
        if !self.shared.buffer_full() {
            self.poll_interval = self.shared.settings.poll_interval;
            return DispatchPhase::Dispatching;
        }

        thread::sleep(self.poll_interval);
        if self.shared.settings.poll_backoff {
            self.poll_interval = (self.poll_interval * 2).min(self.shared.settings.max_poll_interval);
        }

        if self.shared.state.lock().abandon {
            DispatchPhase::Exit
        } else {
            DispatchPhase::PollingBuffer
        }
    }

    fn dispatching(&mut self) -> DispatchPhase {
        let command = {
            let mut st = self.shared.state.lock();
            match st.pending.pop_front() {
                Some(command) => {
                    self.shared.space.notify_all();
                    command
                }
                None => return DispatchPhase::IdleEmpty,
            }
        };

        match self.send_with_retry(&command) {
            Ok(()) => {
                debug!(id = command.id, command = %command.text, "Dispatched");
                let mut st = self.shared.state.lock();
                st.history.push(command);
                if st.pending.is_empty() {
                    DispatchPhase::IdleEmpty
                } else {
                    DispatchPhase::PollingBuffer
                }
            }
            Err(reason) => {
                error!(
                    id = command.id,
                    command = %command.text,
                    error = %reason,
                    "Command could not be delivered, faulting queue"
                );
                let mut st = self.shared.state.lock();
                st.fault = Some(Fault {
                    id: command.id,
                    text: command.text,
                    reason,
                });
                self.shared.notify_all();
                DispatchPhase::Exit
            }
        }
    }

    fn send_with_retry(&self, command: &Command) -> Result<(), String> {
        let attempts = self.shared.settings.send_retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.shared.transport.lock().send(&command.text) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(id = command.id, attempt, error = %e, "Send failed");
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                thread::sleep(self.shared.settings.poll_interval);
            }
        }
        Err(last_error)
    }
}
