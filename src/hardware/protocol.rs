//! Line protocol of the Arduino histogrammer.
//!
//! Commands are ASCII, terminated by `\r`. Replies are `\n`-terminated lines holding one
//! number each; a histogram is N such lines.

use crate::core::{Histogram, ParameterValue};
use crate::error::{AppResult, DaqError};
use crate::settings::Property;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// Terminator appended to every command.
pub const COMMAND_TERMINATOR: char = '\r';

/// Terminator of every reply line.
pub const RESPONSE_DELIMITER: u8 = b'\n';

/// Start continuous recording.
pub const RECORD: &str = "record";
/// Record a single histogram.
pub const RECORD_ONCE: &str = "record 1";
/// Measure the count rate once.
pub const RATE_ONCE: &str = "rate 1";
/// Stop recording.
pub const STOP: &str = "stop";

/// Terminate a bare command.
pub fn format_command(command: &str) -> String {
    format!("{}{}", command, COMMAND_TERMINATOR)
}

/// `<name> <value>\r`
pub fn format_set(property: Property, value: &ParameterValue) -> String {
    format!("{} {}{}", property.name(), value, COMMAND_TERMINATOR)
}

/// `<name>\r`
pub fn format_get(property: Property) -> String {
    format_command(property.name())
}

/// Parse one histogram line into a bin count.
pub fn parse_count_line(line: &str) -> AppResult<u64> {
    let trimmed = line.trim();
    trimmed
        .parse::<u64>()
        .map_err(|_| DaqError::Protocol(format!("expected a count, got '{}'", trimmed)))
}

/// Parse one numeric reply line.
pub fn parse_value_line(line: &str) -> AppResult<f64> {
    let trimmed = line.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DaqError::Protocol(format!("expected a number, got '{}'", trimmed)))
}

/// Parse N reply lines into a histogram.
pub fn parse_histogram<S: AsRef<str>>(lines: &[S]) -> AppResult<Histogram> {
    lines
        .iter()
        .map(|line| parse_count_line(line.as_ref()))
        .collect::<AppResult<Vec<u64>>>()
        .map(Histogram::from)
}

/// Read one delimited line, byte by byte, giving up after `timeout`.
///
/// Short read timeouts of the underlying port are retried until the overall deadline.
pub fn read_line<R: Read + ?Sized>(reader: &mut R, timeout: Duration) -> AppResult<String> {
    let start = Instant::now();
    let mut line = Vec::new();
    let mut buffer = [0u8; 1];

    loop {
        if start.elapsed() > timeout {
            return Err(DaqError::SerialTimeout(timeout));
        }

        match reader.read(&mut buffer) {
            Ok(0) => return Err(DaqError::SerialUnexpectedEof),
            Ok(_) => {
                if buffer[0] == RESPONSE_DELIMITER {
                    break;
                }
                line.push(buffer[0]);
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {
                continue
            }
            Err(e) => return Err(DaqError::Io(e)),
        }
    }

    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

/// Read `n` lines, each within its own `timeout`.
pub fn read_lines<R: Read + ?Sized>(reader: &mut R, n: usize, timeout: Duration) -> AppResult<Vec<String>> {
    (0..n).map(|_| read_line(reader, timeout)).collect()
}

/// Byte link to the device.
pub trait LinePort: Read + Write {
    /// Drop input received but not yet read.
    fn discard_input(&mut self) -> std::io::Result<()>;
}

/// Write `command` and read `reply_lines` lines back.
///
/// A command that expects a reply first discards pending input, so leftovers of an
/// interrupted histogram are never taken for the answer. An empty command only reads,
/// which is how a streamed histogram is collected.
pub fn transact<P: LinePort + ?Sized>(
    port: &mut P,
    command: &str,
    reply_lines: usize,
    timeout: Duration,
) -> AppResult<Vec<String>> {
    if !command.is_empty() {
        if reply_lines > 0 {
            port.discard_input()?;
        }
        port.write_all(command.as_bytes())?;
        port.flush()?;
    }
    read_lines(port, reply_lines, timeout)
}
