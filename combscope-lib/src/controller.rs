//! Link to the external temperature controller
//!
//! The controller is a Meerstetter TEC driver, attached via
//! a serial line and spoken to with the MeCom protocol.
//! The acquisition only ever needs a handful of synchronous
//! calls, which are collected in [`TemperatureController`].
//!
//! MeCom frames are ASCII:
//! ```text
//! #AASSSSPAYLOADCCCC\r    request
//! !AASSSSPAYLOADCCCC\r    reply
//! ```
//! with a 2 hex digit address, a 4 digit sequence number
//! and a CRC-16 (XMODEM flavor) over everything before it.

use std::error::Error;
use std::fmt;
use std::io::{
    Read,
    Write,
};
use std::time::Duration;

use crc::{
    Crc,
    CRC_16_XMODEM,
};

use crate::settings::ControllerSettings;

const MECOM_CRC : Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Longest reply we are willing to read
const MAX_FRAME_LEN : usize = 64;
/// Late replies to earlier requests dropped before giving up
const MAX_STALE_REPLIES : usize = 8;

/// MeCom parameter ids
pub const PAR_OBJECT_TEMPERATURE        : u16 = 1000;
pub const PAR_ACTUAL_OUTPUT_CURRENT     : u16 = 1020;
pub const PAR_ACTUAL_OUTPUT_VOLTAGE     : u16 = 1021;
pub const PAR_OUTPUT_STAGE_INPUT_SELECT : u16 = 2000;
pub const PAR_TARGET_OBJECT_TEMPERATURE : u16 = 3000;
pub const PAR_LIVE_SET_CURRENT          : u16 = 50000;
pub const PAR_LIVE_SET_VOLTAGE          : u16 = 50001;

/// Values for the output stage input selection
pub const INPUT_LIVE_CURRENT_VOLTAGE    : i32 = 1;
pub const INPUT_TEMPERATURE_CONTROLLER  : i32 = 2;

#[derive(Debug)]
pub enum ControllerError {
  Io(String),
  Timeout,
  MalformedFrame(String),
  CrcMismatch,
  SequenceMismatch,
  /// The device answered with an error code
  DeviceError(u8),
}

impl fmt::Display for ControllerError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      ControllerError::Io(what)             => format!("Io ({})", what),
      ControllerError::Timeout              => String::from("Timeout"),
      ControllerError::MalformedFrame(what) => format!("MalformedFrame ({})", what),
      ControllerError::CrcMismatch          => String::from("CrcMismatch"),
      ControllerError::SequenceMismatch     => String::from("SequenceMismatch"),
      ControllerError::DeviceError(code)    => format!("DeviceError ({})", code),
    };
    write!(f, "<ControllerError: {}>", etype)
  }
}

impl Error for ControllerError {
}

impl From<std::io::Error> for ControllerError {
  fn from(err : std::io::Error) -> Self {
    match err.kind() {
      std::io::ErrorKind::TimedOut
      | std::io::ErrorKind::WouldBlock => ControllerError::Timeout,
      _ => ControllerError::Io(err.to_string()),
    }
  }
}

/// The synchronous interface the acquisition uses
/// to talk to the temperature controller
pub trait TemperatureController {
  /// Select what drives the output stage: the builtin
  /// PID loop or live current/voltage values
  fn init(&mut self, use_builtin_pid : bool) -> Result<(), ControllerError>;
  fn get_object_temperature(&mut self) -> Result<f32, ControllerError>;
  fn set_object_temperature(&mut self, value : f32) -> Result<(), ControllerError>;
  /// Actual output (voltage, current)
  fn get_live_voltage_current(&mut self) -> Result<(f32, f32), ControllerError>;
  fn set_live_voltage_current(&mut self, voltage : f32, current : f32) -> Result<(), ControllerError>;
}

/// CRC of a MeCom frame (everything before the CRC field)
pub fn mecom_crc(frame : &[u8]) -> u16 {
  MECOM_CRC.checksum(frame)
}

/// A reply which passed address, sequence and CRC checks
#[derive(Debug, Clone, PartialEq)]
struct Reply {
  payload : String,
  crc     : u16,
}

/// Meerstetter TEC controller speaking MeCom over
/// any byte port (usually a serial line)
pub struct MeComController<P : Read + Write> {
  port     : P,
  address  : u8,
  instance : u8,
  sequence : u16,
}

impl MeComController<Box<dyn serialport::SerialPort>> {
  /// Open the serial port given in the settings
  pub fn open_serial(settings : &ControllerSettings) -> Result<Self, ControllerError> {
    let port = match serialport::new(&settings.serial_port, settings.baud_rate)
      .timeout(Duration::from_millis(settings.timeout_ms))
      .open() {
      Err(err) => {
        error!("Unable to open serial port {}! {err}", settings.serial_port);
        return Err(ControllerError::Io(err.to_string()));
      }
      Ok(port) => port
    };
    info!("Opened {} at {} baud for the temperature controller", settings.serial_port, settings.baud_rate);
    Ok(MeComController::new(port, settings.address, settings.instance))
  }
}

impl<P : Read + Write> MeComController<P> {
  pub fn new(port : P, address : u8, instance : u8) -> Self {
    Self {
      port,
      address,
      instance,
      sequence : 0,
    }
  }

  fn next_sequence(&mut self) -> u16 {
    self.sequence = self.sequence.wrapping_add(1);
    self.sequence
  }

  /// Build a complete request frame, returns the frame and its CRC
  fn build_frame(&self, sequence : u16, payload : &str) -> (Vec<u8>, u16) {
    let body = format!("#{:02X}{:04X}{}", self.address, sequence, payload);
    let crc  = mecom_crc(body.as_bytes());
    (format!("{}{:04X}\r", body, crc).into_bytes(), crc)
  }

  fn read_frame(&mut self) -> Result<Vec<u8>, ControllerError> {
    let mut frame = Vec::<u8>::with_capacity(MAX_FRAME_LEN);
    let mut byte  = [0u8;1];
    loop {
      let n = self.port.read(&mut byte)?;
      if n == 0 {
        return Err(ControllerError::Io(String::from("port closed")));
      }
      // skip anything before the start of a reply
      if frame.is_empty() && byte[0] != b'!' {
        continue;
      }
      if byte[0] == b'\r' {
        return Ok(frame);
      }
      frame.push(byte[0]);
      if frame.len() > MAX_FRAME_LEN {
        return Err(ControllerError::MalformedFrame(String::from("reply too long")));
      }
    }
  }

  /// Check a reply frame (without the trailing \r)
  fn parse_reply(&self, frame : &[u8], sequence : u16) -> Result<Reply, ControllerError> {
    // ! + address + sequence + crc
    if frame.len() < 11 {
      return Err(ControllerError::MalformedFrame(String::from_utf8_lossy(frame).to_string()));
    }
    if !frame.is_ascii() {
      return Err(ControllerError::MalformedFrame(String::from("not ascii")));
    }
    let text = String::from_utf8_lossy(frame);
    let address = parse_hex_u32(&text[1..3])? as u8;
    let seq     = parse_hex_u32(&text[3..7])? as u16;
    if address != self.address || seq != sequence {
      return Err(ControllerError::SequenceMismatch);
    }
    let payload = &text[7..text.len() - 4];
    let crc     = parse_hex_u32(&text[text.len() - 4..])? as u16;
    if let Some(code) = payload.strip_prefix('+') {
      return Err(ControllerError::DeviceError(parse_hex_u32(code)? as u8));
    }
    Ok(Reply {
      payload : String::from(payload),
      crc,
    })
  }

  fn transact(&mut self, payload : &str) -> Result<(Reply, u16, Vec<u8>), ControllerError> {
    let sequence = self.next_sequence();
    let (request, request_crc) = self.build_frame(sequence, payload);
    trace!("MeCom request {}", String::from_utf8_lossy(&request).trim_end());
    self.port.write_all(&request)?;
    self.port.flush()?;
    let mut n_stale = 0usize;
    loop {
      let frame = self.read_frame()?;
      // a reply to a request which timed out earlier
      if let Some((address, seq)) = reply_header(&frame) {
        if address == self.address && seq != sequence && n_stale < MAX_STALE_REPLIES {
          debug!("Dropping late MeCom reply {:04X}, waiting for {:04X}", seq, sequence);
          n_stale += 1;
          continue;
        }
      }
      let reply = self.parse_reply(&frame, sequence)?;
      return Ok((reply, request_crc, frame));
    }
  }

  /// Read the raw 32 bit value of a parameter
  pub fn get_parameter(&mut self, id : u16) -> Result<u32, ControllerError> {
    let payload = format!("?VR{:04X}{:02X}", id, self.instance);
    let (reply, _, frame) = self.transact(&payload)?;
    if reply.crc != mecom_crc(&frame[..frame.len() - 4]) {
      return Err(ControllerError::CrcMismatch);
    }
    if reply.payload.len() != 8 {
      return Err(ControllerError::MalformedFrame(format!("value '{}'", reply.payload)));
    }
    parse_hex_u32(&reply.payload)
  }

  /// Write the raw 32 bit value of a parameter
  pub fn set_parameter(&mut self, id : u16, value : u32) -> Result<(), ControllerError> {
    let payload = format!("VS{:04X}{:02X}{:08X}", id, self.instance, value);
    let (reply, request_crc, _) = self.transact(&payload)?;
    // the acknowledge carries the CRC of our request
    if !reply.payload.is_empty() {
      return Err(ControllerError::MalformedFrame(format!("ack '{}'", reply.payload)));
    }
    if reply.crc != request_crc {
      return Err(ControllerError::CrcMismatch);
    }
    Ok(())
  }

  pub fn get_float(&mut self, id : u16) -> Result<f32, ControllerError> {
    Ok(f32::from_bits(self.get_parameter(id)?))
  }

  pub fn set_float(&mut self, id : u16, value : f32) -> Result<(), ControllerError> {
    self.set_parameter(id, value.to_bits())
  }

  pub fn set_int(&mut self, id : u16, value : i32) -> Result<(), ControllerError> {
    self.set_parameter(id, value as u32)
  }
}

impl<P : Read + Write> TemperatureController for MeComController<P> {
  fn init(&mut self, use_builtin_pid : bool) -> Result<(), ControllerError> {
    // make sure we can talk to it at all
    let current = self.get_parameter(PAR_OUTPUT_STAGE_INPUT_SELECT)?;
    debug!("Output stage input selection currently {current}");
    if use_builtin_pid {
      info!("Using built-in temperature controller");
      self.set_int(PAR_OUTPUT_STAGE_INPUT_SELECT, INPUT_TEMPERATURE_CONTROLLER)
    } else {
      info!("Using live current/voltage");
      self.set_int(PAR_OUTPUT_STAGE_INPUT_SELECT, INPUT_LIVE_CURRENT_VOLTAGE)
    }
  }

  fn get_object_temperature(&mut self) -> Result<f32, ControllerError> {
    self.get_float(PAR_OBJECT_TEMPERATURE)
  }

  fn set_object_temperature(&mut self, value : f32) -> Result<(), ControllerError> {
    self.set_float(PAR_TARGET_OBJECT_TEMPERATURE, value)
  }

  fn get_live_voltage_current(&mut self) -> Result<(f32, f32), ControllerError> {
    let voltage = self.get_float(PAR_ACTUAL_OUTPUT_VOLTAGE)?;
    let current = self.get_float(PAR_ACTUAL_OUTPUT_CURRENT)?;
    Ok((voltage, current))
  }

  fn set_live_voltage_current(&mut self, voltage : f32, current : f32) -> Result<(), ControllerError> {
    self.set_float(PAR_LIVE_SET_CURRENT, current)?;
    self.set_float(PAR_LIVE_SET_VOLTAGE, voltage)
  }
}

/// Address and sequence of a reply frame
fn reply_header(frame : &[u8]) -> Option<(u8, u16)> {
  if frame.len() < 7 || !frame[..7].is_ascii() {
    return None;
  }
  let text     = std::str::from_utf8(&frame[1..7]).ok()?;
  let address  = u8::from_str_radix(&text[0..2], 16).ok()?;
  let sequence = u16::from_str_radix(&text[2..6], 16).ok()?;
  Some((address, sequence))
}

fn parse_hex_u32(text : &str) -> Result<u32, ControllerError> {
  match u32::from_str_radix(text, 16) {
    Err(_)    => Err(ControllerError::MalformedFrame(format!("'{}' is not hex", text))),
    Ok(value) => Ok(value),
  }
}

#[cfg(test)]
mod test_controller {
  use super::*;
  use std::collections::{HashMap, VecDeque};
  use std::io;

  /// Answers MeCom requests like a TEC driver would
  struct FakeDevice {
    address    : u8,
    parameters : HashMap<u16, u32>,
    incoming   : Vec<u8>,
    outgoing   : VecDeque<u8>,
    /// reply with a broken CRC
    corrupt    : bool,
    /// reply to every request with this error code
    error_code : Option<u8>,
    /// hold back the next reply until the following request
    hold_next  : bool,
    held       : Vec<u8>,
    written    : Vec<(u16, u32)>,
  }

  impl FakeDevice {
    fn new(address : u8) -> Self {
      Self {
        address,
        parameters : HashMap::new(),
        incoming   : Vec::new(),
        outgoing   : VecDeque::new(),
        corrupt    : false,
        error_code : None,
        hold_next  : false,
        held       : Vec::new(),
        written    : Vec::new(),
      }
    }

    fn reply(&mut self, sequence : &str, payload : &str, crc : Option<u16>) {
      let body = format!("!{:02X}{}{}", self.address, sequence, payload);
      let mut crc = crc.unwrap_or(mecom_crc(body.as_bytes()));
      if self.corrupt {
        crc ^= 0x5555;
      }
      let frame = format!("{}{:04X}\r", body, crc).into_bytes();
      if self.hold_next {
        self.hold_next = false;
        self.held.extend(frame);
        return;
      }
      let late : Vec<u8> = self.held.drain(..).collect();
      self.outgoing.extend(late);
      self.outgoing.extend(frame);
    }

    fn handle(&mut self, request : &str) {
      let sequence = String::from(&request[3..7]);
      let crc      = u16::from_str_radix(&request[request.len() - 4..], 16).unwrap();
      assert_eq!(crc, mecom_crc(request[..request.len() - 4].as_bytes()));
      let payload  = String::from(&request[7..request.len() - 4]);
      if let Some(code) = self.error_code {
        self.reply(&sequence, &format!("+{:02X}", code), None);
        return;
      }
      if let Some(query) = payload.strip_prefix("?VR") {
        let id    = u16::from_str_radix(&query[0..4], 16).unwrap();
        let value = *self.parameters.get(&id).unwrap_or(&0);
        self.reply(&sequence, &format!("{:08X}", value), None);
      } else if let Some(set) = payload.strip_prefix("VS") {
        let id    = u16::from_str_radix(&set[0..4], 16).unwrap();
        let value = u32::from_str_radix(&set[6..14], 16).unwrap();
        self.parameters.insert(id, value);
        self.written.push((id, value));
        self.reply(&sequence, "", Some(crc));
      } else {
        panic!("Unknown request {}", request);
      }
    }
  }

  impl Read for FakeDevice {
    fn read(&mut self, buf : &mut [u8]) -> io::Result<usize> {
      let mut n = 0;
      while n < buf.len() {
        match self.outgoing.pop_front() {
          None    => break,
          Some(b) => {
            buf[n] = b;
            n += 1;
          }
        }
      }
      if n == 0 {
        return Err(io::Error::new(io::ErrorKind::TimedOut, "nothing to read"));
      }
      Ok(n)
    }
  }

  impl Write for FakeDevice {
    fn write(&mut self, buf : &[u8]) -> io::Result<usize> {
      for b in buf {
        if *b == b'\r' {
          let request = String::from_utf8(self.incoming.clone()).unwrap();
          self.incoming.clear();
          self.handle(&request);
        } else {
          self.incoming.push(*b);
        }
      }
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  #[test]
  fn crc_is_xmodem() {
    assert_eq!(mecom_crc(b"123456789"), 0x31C3);
  }

  #[test]
  fn request_frame_layout() {
    let ctrl = MeComController::new(FakeDevice::new(0), 0, 1);
    let (frame, crc) = ctrl.build_frame(0x1234, "?VR03E801");
    let text = String::from_utf8(frame).unwrap();
    assert!(text.starts_with("#001234?VR03E801"));
    assert!(text.ends_with('\r'));
    assert_eq!(text.len(), 1 + 2 + 4 + 9 + 4 + 1);
    assert_eq!(crc, mecom_crc(b"#001234?VR03E801"));
  }

  #[test]
  fn reads_object_temperature() {
    let mut dev = FakeDevice::new(0);
    dev.parameters.insert(PAR_OBJECT_TEMPERATURE, 25.75f32.to_bits());
    let mut ctrl = MeComController::new(dev, 0, 1);
    assert_eq!(ctrl.get_object_temperature().unwrap(), 25.75);
  }

  #[test]
  fn sets_target_temperature() {
    let mut ctrl = MeComController::new(FakeDevice::new(0), 0, 1);
    ctrl.set_object_temperature(26.0).unwrap();
    assert_eq!(ctrl.port.written, vec![(PAR_TARGET_OBJECT_TEMPERATURE, 26.0f32.to_bits())]);
  }

  #[test]
  fn init_selects_the_input_stage() {
    let mut ctrl = MeComController::new(FakeDevice::new(2), 2, 1);
    ctrl.init(true).unwrap();
    assert_eq!(ctrl.port.parameters[&PAR_OUTPUT_STAGE_INPUT_SELECT], 2);
    ctrl.init(false).unwrap();
    assert_eq!(ctrl.port.parameters[&PAR_OUTPUT_STAGE_INPUT_SELECT], 1);
  }

  #[test]
  fn live_voltage_and_current() {
    let mut ctrl = MeComController::new(FakeDevice::new(0), 0, 1);
    ctrl.set_live_voltage_current(3.0, 1.5).unwrap();
    assert_eq!(ctrl.port.parameters[&PAR_LIVE_SET_VOLTAGE], 3.0f32.to_bits());
    assert_eq!(ctrl.port.parameters[&PAR_LIVE_SET_CURRENT], 1.5f32.to_bits());
    ctrl.port.parameters.insert(PAR_ACTUAL_OUTPUT_VOLTAGE, 2.5f32.to_bits());
    ctrl.port.parameters.insert(PAR_ACTUAL_OUTPUT_CURRENT, 0.5f32.to_bits());
    assert_eq!(ctrl.get_live_voltage_current().unwrap(), (2.5, 0.5));
  }

  #[test]
  fn corrupted_reply_is_rejected() {
    let mut dev = FakeDevice::new(0);
    dev.corrupt = true;
    let mut ctrl = MeComController::new(dev, 0, 1);
    assert!(matches!(ctrl.get_object_temperature(), Err(ControllerError::CrcMismatch)));
    assert!(matches!(ctrl.set_object_temperature(1.0), Err(ControllerError::CrcMismatch)));
  }

  #[test]
  fn device_error_codes_are_reported() {
    let mut dev = FakeDevice::new(0);
    dev.error_code = Some(0x05);
    let mut ctrl = MeComController::new(dev, 0, 1);
    assert!(matches!(ctrl.get_object_temperature(), Err(ControllerError::DeviceError(5))));
  }

  #[test]
  fn reply_from_another_address_is_rejected() {
    // the device answers as address 3, we talk to address 0
    let mut ctrl = MeComController::new(FakeDevice::new(3), 0, 1);
    assert!(matches!(ctrl.get_object_temperature(), Err(ControllerError::SequenceMismatch)));
  }

  #[test]
  fn link_recovers_after_a_late_reply() {
    let mut dev = FakeDevice::new(0);
    dev.parameters.insert(PAR_OBJECT_TEMPERATURE, 24.5f32.to_bits());
    dev.hold_next = true;
    let mut ctrl = MeComController::new(dev, 0, 1);
    assert!(matches!(ctrl.get_object_temperature(), Err(ControllerError::Timeout)));
    for _ in 0..5 {
      assert_eq!(ctrl.get_object_temperature().unwrap(), 24.5);
    }
    ctrl.set_object_temperature(26.0).unwrap();
    assert!(ctrl.port.outgoing.is_empty());
  }

  #[test]
  fn silent_device_times_out() {
    struct Mute;
    impl Read for Mute {
      fn read(&mut self, _buf : &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::TimedOut, "mute"))
      }
    }
    impl Write for Mute {
      fn write(&mut self, buf : &[u8]) -> io::Result<usize> { Ok(buf.len()) }
      fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }
    let mut ctrl = MeComController::new(Mute, 0, 1);
    assert!(matches!(ctrl.get_object_temperature(), Err(ControllerError::Timeout)));
  }
}
