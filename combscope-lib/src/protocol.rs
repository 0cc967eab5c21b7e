//! The control channel protocol
//!
//! Per acquisition cycle the client and the server
//! exchange three short messages, each on its own
//! connection to the ack port:
//!
//! 1. client -> server : `"<CMD> <setpoint>"` as text
//! 2. server -> client : the [`AcquisitionReport`] as raw bytes
//! 3. client -> server : the next `"<CMD> <setpoint>"`
//!
//! `CMD` is either the stop token `END` or any short
//! token (e.g. `GO`) to continue.

use std::error::Error;
use std::fmt;

use crate::environment::EnvironmentReading;
use crate::settings::NetworkSettings;

/// The command which ends data taking
pub const STOP_TOKEN          : &str  = "END";
/// Commands are read with a single receive of at most this size
pub const MAX_COMMAND_LEN     : usize = 100;
/// timestamp + controller temperature
pub const REPORT_SIZE         : usize = 12;
/// timestamp + controller temperature + environment
pub const REPORT_SIZE_WITH_ENV: usize = 24;

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
  EmptyCommand,
  StreamTooShort,
}

impl fmt::Display for ProtocolError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      ProtocolError::EmptyCommand   => "EmptyCommand",
      ProtocolError::StreamTooShort => "StreamTooShort",
    };
    write!(f, "<ProtocolError: {}>", etype)
  }
}

impl Error for ProtocolError {
}

/// There are two input channels, commonly
/// denoted as "A" and "B". Each has its own
/// DMA ring and its own data socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
  A,
  B,
}

impl Channel {
  pub fn port(&self, network : &NetworkSettings) -> u16 {
    match self {
      Channel::A => network.port_a,
      Channel::B => network.port_b,
    }
  }
}

impl fmt::Display for Channel {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Channel::A => write!(f, "A"),
      Channel::B => write!(f, "B"),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
  /// Keep acquiring, the token is what the client sent
  Continue(String),
  Stop,
}

/// A command received over the control channel
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
  pub kind     : CommandKind,
  /// New target for the temperature controller. Either a
  /// temperature (PID mode) or a current (manual mode).
  pub setpoint : Option<f32>,
}

impl Command {
  pub fn continue_with(token : &str, setpoint : f32) -> Self {
    Self {
      kind     : CommandKind::Continue(String::from(token)),
      setpoint : Some(setpoint),
    }
  }

  pub fn stop() -> Self {
    Self {
      kind     : CommandKind::Stop,
      setpoint : None,
    }
  }

  pub fn is_stop(&self) -> bool {
    self.kind == CommandKind::Stop
  }

  /// Decode a command from what came in over the wire
  ///
  /// The first token is the command, the second one
  /// the setpoint. Trailing NUL bytes (C clients) and
  /// whitespace are ignored. A setpoint which can not be
  /// parsed is reported as None, so the caller keeps
  /// whatever it had before.
  pub fn from_bytes(stream : &[u8]) -> Result<Command, ProtocolError> {
    let end  = stream.iter().position(|b| *b == 0).unwrap_or(stream.len());
    let text = String::from_utf8_lossy(&stream[..end]);
    let mut tokens = text.split_whitespace();
    let token = match tokens.next() {
      None        => return Err(ProtocolError::EmptyCommand),
      Some(token) => token,
    };
    let setpoint = tokens.next().and_then(|s| s.parse::<f32>().ok());
    let kind = if token == STOP_TOKEN {
      CommandKind::Stop
    } else {
      CommandKind::Continue(String::from(token))
    };
    Ok(Command {
      kind,
      setpoint,
    })
  }

  /// The text form a client sends
  pub fn to_bytes(&self) -> Vec<u8> {
    let token = match &self.kind {
      CommandKind::Stop            => STOP_TOKEN,
      CommandKind::Continue(token) => token.as_str(),
    };
    let line = match self.setpoint {
      None           => String::from(token),
      Some(setpoint) => format!("{} {}", token, setpoint),
    };
    line.into_bytes()
  }
}

impl fmt::Display for Command {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<Command: {:?} setpoint {:?}>", self.kind, self.setpoint)
  }
}

/// What the server reports after each acquisition
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AcquisitionReport {
  /// Milliseconds since the epoch at trigger time
  pub timestamp_ms : u64,
  /// Object temperature from the temperature controller
  pub temperature  : f32,
  /// Only present if environment sensing is enabled
  pub environment  : Option<EnvironmentReading>,
}

impl AcquisitionReport {
  pub fn new() -> Self {
    Self {
      timestamp_ms : 0,
      temperature  : 0.0,
      environment  : None,
    }
  }

  /// Little endian: u64 timestamp, f32 temperature,
  /// then optionally f32 temperature, pressure, humidity
  pub fn to_bytestream(&self) -> Vec<u8> {
    let mut stream = Vec::<u8>::with_capacity(REPORT_SIZE_WITH_ENV);
    stream.extend_from_slice(&self.timestamp_ms.to_le_bytes());
    stream.extend_from_slice(&self.temperature.to_le_bytes());
    if let Some(env) = self.environment {
      stream.extend_from_slice(&env.temperature.to_le_bytes());
      stream.extend_from_slice(&env.pressure.to_le_bytes());
      stream.extend_from_slice(&env.humidity.to_le_bytes());
    }
    stream
  }

  /// The reverse of `to_bytestream`. The client has to know
  /// if the server sends environment readings.
  pub fn from_bytestream(stream           : &[u8],
                         with_environment : bool)
    -> Result<AcquisitionReport, ProtocolError> {
    let expected = if with_environment {REPORT_SIZE_WITH_ENV} else {REPORT_SIZE};
    if stream.len() < expected {
      return Err(ProtocolError::StreamTooShort);
    }
    let mut report = AcquisitionReport::new();
    report.timestamp_ms = parse_u64(stream, 0);
    report.temperature  = parse_f32(stream, 8);
    if with_environment {
      report.environment = Some(EnvironmentReading {
        temperature : parse_f32(stream, 12),
        pressure    : parse_f32(stream, 16),
        humidity    : parse_f32(stream, 20),
      });
    }
    Ok(report)
  }
}

impl Default for AcquisitionReport {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for AcquisitionReport {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = format!("<AcquisitionReport: t {} ms, controller {:.3}", self.timestamp_ms, self.temperature);
    if let Some(env) = self.environment {
      repr += &format!(", {}", env);
    }
    write!(f, "{}>", repr)
  }
}

fn parse_u64(stream : &[u8], pos : usize) -> u64 {
  let mut bytes = [0u8;8];
  bytes.copy_from_slice(&stream[pos..pos + 8]);
  u64::from_le_bytes(bytes)
}

fn parse_f32(stream : &[u8], pos : usize) -> f32 {
  let mut bytes = [0u8;4];
  bytes.copy_from_slice(&stream[pos..pos + 4]);
  f32::from_le_bytes(bytes)
}
