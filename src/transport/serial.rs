//! Serial transport using the `serialport` crate.

use super::{Transport, LINE_TERMINATOR};
use crate::config::SerialConfig;
use crate::error::{RigError, RigResult};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortType, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Time the controller gets to start answering a query.
const REPLY_SETTLE: Duration = Duration::from_millis(10);

/// EiBotBoard link over a USB CDC serial port (9600 8N1).
pub struct SerialTransport {
    port_name: String,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Open the port named in `config`, or the first port whose USB
    /// manufacturer matches `config.manufacturer`.
    pub fn open(config: &SerialConfig) -> RigResult<Self> {
        let port_name = find_rig_port(config)?;
        let timeout = Duration::from_millis(config.timeout_ms);

        let port = serialport::new(&port_name, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(timeout)
            .open()?;

        info!(port = %port_name, baud = config.baud_rate, "Opened motor controller port");

        Ok(Self::from_port(port_name, port, timeout))
    }

    fn from_port(port_name: String, port: Box<dyn SerialPort>, timeout: Duration) -> Self {
        Self {
            port_name,
            timeout,
            port: Some(port),
        }
    }

    /// Name of the open port.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn port_mut(&mut self) -> RigResult<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| RigError::Transport(format!("port '{}' is closed", self.port_name)))
    }

    fn write_line(&mut self, line: &str) -> RigResult<()> {
        let port = self.port_mut()?;
        port.write_all(format!("{}{}", line, LINE_TERMINATOR).as_bytes())?;
        port.flush()?;
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, line: &str) -> RigResult<()> {
        self.write_line(line)?;
        debug!(command = line, "Sent");
        Ok(())
    }

    fn query(&mut self, line: &str) -> RigResult<String> {
        // Drop the `OK` acks earlier sends left behind and any stray line end
        // from the previous reply.
        self.port_mut()?.clear(ClearBuffer::Input)?;
        self.write_line(line)?;
        thread::sleep(REPLY_SETTLE);

        let deadline = Instant::now() + self.timeout;
        let port = self.port_mut()?;
        let mut reply = Vec::new();
        let mut buf = [0u8; 64];

        while Instant::now() < deadline {
            match port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    reply.extend_from_slice(&buf[..n]);
                    if reply_complete(&reply) {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }

        let text = String::from_utf8_lossy(&reply).into_owned();
        debug!(query = line, reply = %text.trim(), "Query");
        Ok(text)
    }

    fn close(&mut self) -> RigResult<()> {
        if self.port.take().is_some() {
            info!(port = %self.port_name, "Closed motor controller port");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

/// Whether `reply` holds a full line.
///
/// Firmware ends lines with `\r\n`, but older `QM` replies end `\n\r`, so
/// either character closes the line. Line ends ahead of any text are
/// leftovers from an earlier reply.
fn reply_complete(reply: &[u8]) -> bool {
    let is_end = |b: &u8| *b == b'\r' || *b == b'\n';
    match reply.iter().position(|b| !is_end(b)) {
        Some(start) => reply[start..].iter().any(is_end),
        None => false,
    }
}

/// Resolve the controller port.
///
/// An explicit `config.port` wins. Otherwise USB ports are scanned for a
/// manufacturer string containing `config.manufacturer`.
pub fn find_rig_port(config: &SerialConfig) -> RigResult<String> {
    if let Some(port) = &config.port {
        return Ok(port.clone());
    }

    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        return Err(RigError::SerialPortNotFound(config.manufacturer.clone()));
    }

    for info in &ports {
        if let SerialPortType::UsbPort(usb) = &info.port_type {
            let matches = usb
                .manufacturer
                .as_deref()
                .is_some_and(|m| m.contains(&config.manufacturer));
            if matches {
                debug!(port = %info.port_name, "Matched controller by manufacturer");
                return Ok(info.port_name.clone());
            }
        }
    }

    warn!(
        manufacturer = %config.manufacturer,
        "No serial port matched the controller manufacturer"
    );
    Err(RigError::SerialPortNotFound(config.manufacturer.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_complete_accepts_either_line_end_order() {
        assert!(reply_complete(b"QM,0,0,0,0\r\n"));
        assert!(reply_complete(b"QM,0,0,0,0\n\r"));
        assert!(reply_complete(b"QM,1,0,0\n"));
        assert!(reply_complete(b"0\r"));
    }

    #[test]
    fn test_reply_complete_waits_for_text_and_line_end() {
        assert!(!reply_complete(b""));
        assert!(!reply_complete(b"QM,1,1,1"));
        // A line end left over from the previous reply is not an answer.
        assert!(!reply_complete(b"\r"));
        assert!(!reply_complete(b"\n\rQM,1,1"));
        assert!(reply_complete(b"\rQM,1,1,1,1\r\n"));
    }

    /// Answers each `\r`-terminated request with the next canned reply.
    #[cfg(unix)]
    fn fake_controller(
        mut master: serialport::TTYPort,
        replies: Vec<&'static str>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for reply in replies {
                let mut byte = [0u8; 1];
                loop {
                    match master.read(&mut byte) {
                        Ok(1) if byte[0] == b'\r' => break,
                        Ok(_) => {}
                        Err(e) if e.kind() == ErrorKind::TimedOut => {}
                        Err(_) => return,
                    }
                }
                master.write_all(reply.as_bytes()).unwrap();
                master.flush().unwrap();
            }
        })
    }

    #[cfg(unix)]
    #[test]
    fn test_legacy_status_reply_returns_without_timeout() {
        let (master, slave) = serialport::TTYPort::pair().unwrap();
        let controller = fake_controller(master, vec!["QM,0,0,0,0\n\r", "QM,1,1,1,1\r\n"]);
        let mut link =
            SerialTransport::from_port("pty".into(), Box::new(slave), Duration::from_millis(500));

        let started = Instant::now();
        let reply = link.query("QM").unwrap();
        assert!(started.elapsed() < Duration::from_millis(250), "{:?}", started.elapsed());
        assert_eq!(reply.trim(), "QM,0,0,0,0");

        // The trailing "\r" of the legacy reply is discarded before the next query.
        let reply = link.query("QM").unwrap();
        assert_eq!(reply.trim(), "QM,1,1,1,1");
        assert!(started.elapsed() < Duration::from_millis(500));

        controller.join().unwrap();
        link.close().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_query_discards_pending_acks() {
        let (master, slave) = serialport::TTYPort::pair().unwrap();
        let controller = fake_controller(master, vec!["OK\r\n", "QM,0,1,0,1\r\n"]);
        let mut link =
            SerialTransport::from_port("pty".into(), Box::new(slave), Duration::from_millis(500));

        link.send("SP,1").unwrap();
        // Let the ack land in the input buffer.
        thread::sleep(Duration::from_millis(50));
        let reply = link.query("QM").unwrap();
        assert_eq!(reply.trim(), "QM,0,1,0,1");

        controller.join().unwrap();
    }
}
