//! Mock Motor Controller
//!
//! A simulated EiBotBoard for tests and virtual runs. It keeps a timeline of
//! accepted motion so `QM` answers reflect what real hardware would report at
//! that instant, and it records every transport event for later assertions.
//!
//! # Behaviour
//!
//! - `XM`/`SM`/`SP` occupy the motion timeline for their encoded duration,
//!   scaled by [`MockFirmware::with_time_scale`].
//! - The FIFO is full while `fifo_depth` commands are waiting behind the one
//!   executing (depth 1, like the real board, by default).
//! - `QM` replies use the field layout of the configured firmware version.
//! - Scripted replies and failure injection override the simulation.

use super::Transport;
use crate::command::estimate_duration;
use crate::error::{RigError, RigResult};
use crate::firmware::{FirmwareVersion, StatusFormat};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// Events
// =============================================================================

/// Something that crossed the simulated wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A fire-and-forget instruction.
    Sent(String),
    /// A query and the reply handed back.
    Query { command: String, reply: String },
    /// The transport was closed.
    Closed,
}

#[derive(Debug)]
struct Scheduled {
    start: Instant,
    end: Instant,
}

#[derive(Debug)]
struct FirmwareState {
    version: String,
    fifo_depth: usize,
    time_scale: f64,
    timeline: VecDeque<Scheduled>,
    scripted: HashMap<String, VecDeque<String>>,
    fail_sends: u32,
    fail_queries: u32,
    wedged: bool,
    pen_down: bool,
    steps: (i64, i64),
    open: bool,
    events: Vec<(Instant, TransportEvent)>,
}

impl FirmwareState {
    fn prune(&mut self, now: Instant) {
        while self.timeline.front().is_some_and(|s| s.end <= now) {
            self.timeline.pop_front();
        }
    }

    fn schedule(&mut self, text: &str, now: Instant) {
        let duration = estimate_duration(text).mul_f64(self.time_scale);
        if duration.is_zero() {
            return;
        }
        let start = self.timeline.back().map_or(now, |last| last.end.max(now));
        self.timeline.push_back(Scheduled {
            start,
            end: start + duration,
        });
    }

    fn apply(&mut self, text: &str) {
        let fields: Vec<&str> = text.split(',').collect();
        let num = |i: usize| fields.get(i).and_then(|f| f.trim().parse::<i64>().ok());
        match fields.first().copied() {
            Some("XM") | Some("SM") => {
                self.steps.0 += num(2).unwrap_or(0);
                self.steps.1 += num(3).unwrap_or(0);
            }
            Some("SP") => self.pen_down = num(1) == Some(0),
            Some("HM") => self.steps = (0, 0),
            _ => {}
        }
    }

    fn status_reply(&mut self, now: Instant) -> String {
        self.prune(now);
        let executing = self.wedged || self.timeline.iter().any(|s| s.start <= now);
        let queued = self.timeline.iter().filter(|s| s.start > now).count();
        let fifo_full = queued >= self.fifo_depth;
        let command = executing || queued > 0;
        let b = |flag: bool| u8::from(flag);

        match StatusFormat::for_version(FirmwareVersion::parse(&self.version)) {
            StatusFormat::FourField => format!(
                "QM,{},{},{},{}\r\n",
                b(command),
                b(executing),
                b(executing),
                b(fifo_full)
            ),
            StatusFormat::ThreeField => format!(
                "QM,{},{},{}\r\n",
                b(command),
                b(executing),
                b(executing)
            ),
            StatusFormat::Unsupported => "!8 Err: Unknown command 'QM'\r\n".to_string(),
        }
    }

    fn reply_for(&mut self, command: &str, now: Instant) -> String {
        if let Some(reply) = self.scripted.get_mut(command).and_then(VecDeque::pop_front) {
            return reply;
        }
        match command {
            "V" => format!("EBBv13_and_above EB Firmware Version {}\r\n", self.version),
            "QM" => self.status_reply(now),
            "QP" => format!("{}\r\nOK\r\n", if self.pen_down { 0 } else { 1 }),
            "QS" => format!("{},{}\r\nOK\r\n", self.steps.0, self.steps.1),
            _ => "OK\r\n".to_string(),
        }
    }
}

// =============================================================================
// MockFirmware
// =============================================================================

/// Simulated motor controller.
///
/// Cloning shares the same simulated board, so a test can hand one clone to
/// the queue and keep another for assertions.
///
/// # Example
///
/// ```rust
/// use stylus_rig::transport::{mock::MockFirmware, Transport};
///
/// let firmware = MockFirmware::new("2.4.4");
/// let mut link = firmware.clone();
/// link.send("XM,10,100,100").unwrap();
/// assert_eq!(firmware.sent_lines(), vec!["XM,10,100,100".to_string()]);
/// ```
#[derive(Debug, Clone)]
pub struct MockFirmware {
    inner: Arc<Mutex<FirmwareState>>,
}

impl MockFirmware {
    /// Board reporting `version` (e.g. `"2.4.4"`) with real-time motion.
    pub fn new(version: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FirmwareState {
                version: version.to_string(),
                fifo_depth: 1,
                time_scale: 1.0,
                timeline: VecDeque::new(),
                scripted: HashMap::new(),
                fail_sends: 0,
                fail_queries: 0,
                wedged: false,
                pen_down: false,
                steps: (0, 0),
                open: true,
                events: Vec::new(),
            })),
        }
    }

    /// Commands allowed to wait behind the executing one.
    pub fn with_fifo_depth(self, depth: usize) -> Self {
        self.inner.lock().fifo_depth = depth.max(1);
        self
    }

    /// Stretch or compress simulated motion time (0.1 runs ten times faster).
    pub fn with_time_scale(self, scale: f64) -> Self {
        self.inner.lock().time_scale = scale.max(0.0);
        self
    }

    /// Queue canned replies for `command`, consumed before the simulation
    /// answers again.
    pub fn script_replies<I, S>(&self, command: &str, replies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .lock()
            .scripted
            .entry(command.to_string())
            .or_default()
            .extend(replies.into_iter().map(Into::into));
    }

    /// Make the next `count` sends fail.
    pub fn fail_next_sends(&self, count: u32) {
        self.inner.lock().fail_sends = count;
    }

    /// Make the next `count` queries fail with an I/O error.
    pub fn fail_next_queries(&self, count: u32) {
        self.inner.lock().fail_queries = count;
    }

    /// Report motion forever.
    pub fn set_wedged(&self, wedged: bool) {
        self.inner.lock().wedged = wedged;
    }

    pub fn set_pen_down(&self, down: bool) {
        self.inner.lock().pen_down = down;
    }

    /// Net step position from all moves sent so far.
    pub fn step_position(&self) -> (i64, i64) {
        self.inner.lock().steps
    }

    /// Whether simulated motion is still executing or queued.
    pub fn is_moving(&self) -> bool {
        let mut state = self.inner.lock();
        state.prune(Instant::now());
        state.wedged || !state.timeline.is_empty()
    }

    /// Every event so far, oldest first.
    pub fn events(&self) -> Vec<TransportEvent> {
        self.inner.lock().events.iter().map(|(_, e)| e.clone()).collect()
    }

    /// Events with the instant they happened.
    pub fn timed_events(&self) -> Vec<(Instant, TransportEvent)> {
        self.inner.lock().events.clone()
    }

    /// Instruction lines sent, in order.
    pub fn sent_lines(&self) -> Vec<String> {
        self.inner
            .lock()
            .events
            .iter()
            .filter_map(|(_, e)| match e {
                TransportEvent::Sent(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of times `command` was queried.
    pub fn query_count(&self, command: &str) -> usize {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|(_, e)| matches!(e, TransportEvent::Query { command: c, .. } if c == command))
            .count()
    }

    pub fn clear_events(&self) {
        self.inner.lock().events.clear();
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.lock().open
    }

    /// Time left until the simulated timeline runs dry.
    pub fn remaining_motion(&self) -> Duration {
        let now = Instant::now();
        let state = self.inner.lock();
        state
            .timeline
            .back()
            .map_or(Duration::ZERO, |last| last.end.saturating_duration_since(now))
    }
}

impl Transport for MockFirmware {
    fn send(&mut self, line: &str) -> RigResult<()> {
        let now = Instant::now();
        let mut state = self.inner.lock();
        if !state.open {
            return Err(RigError::Transport("mock controller is closed".into()));
        }
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(RigError::Transport(format!("injected send failure for '{line}'")));
        }
        state.prune(now);
        state.schedule(line, now);
        state.apply(line);
        state.events.push((now, TransportEvent::Sent(line.to_string())));
        Ok(())
    }

    fn query(&mut self, line: &str) -> RigResult<String> {
        let now = Instant::now();
        let mut state = self.inner.lock();
        if !state.open {
            return Err(RigError::Transport("mock controller is closed".into()));
        }
        if state.fail_queries > 0 {
            state.fail_queries -= 1;
            return Err(RigError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "injected query failure",
            )));
        }
        let reply = state.reply_for(line, now);
        state.events.push((
            now,
            TransportEvent::Query {
                command: line.to_string(),
                reply: reply.clone(),
            },
        ));
        Ok(reply)
    }

    fn close(&mut self) -> RigResult<()> {
        let mut state = self.inner.lock();
        if state.open {
            state.open = false;
            state.events.push((Instant::now(), TransportEvent::Closed));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lock().open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_status_tracks_timeline() {
        let mut fw = MockFirmware::new("2.4.4");
        assert_eq!(fw.query("QM").unwrap(), "QM,0,0,0,0\r\n");

        fw.send("XM,200,10,10").unwrap();
        fw.send("XM,200,10,10").unwrap();
        assert_eq!(fw.query("QM").unwrap(), "QM,1,1,1,1\r\n");

        thread::sleep(Duration::from_millis(450));
        assert_eq!(fw.query("QM").unwrap(), "QM,0,0,0,0\r\n");
        assert_eq!(fw.step_position(), (20, 20));
    }

    #[test]
    fn test_three_field_layout() {
        let mut fw = MockFirmware::new("2.3.0");
        fw.send("XM,200,1,1").unwrap();
        assert_eq!(fw.query("QM").unwrap(), "QM,1,1,1\r\n");
    }

    #[test]
    fn test_scripted_replies_take_precedence() {
        let mut fw = MockFirmware::new("2.4.4");
        fw.script_replies("QM", ["QM,1,1,1,1\r\n"]);
        assert_eq!(fw.query("QM").unwrap(), "QM,1,1,1,1\r\n");
        assert_eq!(fw.query("QM").unwrap(), "QM,0,0,0,0\r\n");
        assert_eq!(fw.query_count("QM"), 2);
    }

    #[test]
    fn test_failure_injection_and_close() {
        let mut fw = MockFirmware::new("2.4.4");
        fw.fail_next_sends(1);
        assert!(fw.send("SP,1").is_err());
        assert!(fw.send("SP,1").is_ok());

        fw.fail_next_queries(1);
        assert!(fw.query("QM").is_err());

        fw.close().unwrap();
        assert!(!fw.is_open());
        assert!(fw.send("SP,1").is_err());
        assert_eq!(fw.events().last(), Some(&TransportEvent::Closed));
    }

    #[test]
    fn test_version_banner() {
        let mut fw = MockFirmware::new("2.6.2");
        let banner = fw.query("V").unwrap();
        assert_eq!(
            FirmwareVersion::parse(&banner),
            Some(FirmwareVersion::new(2, 6, 2))
        );
    }
}
