//! Client side of the data and control sockets
//!
//! This is what the monitoring computer does: send a command
//! with a setpoint, pick up the samples of both channels and
//! read the report for the acquisition.

use std::error::Error;
use std::io::{
    Read,
    Write,
};
use std::net::{
    Shutdown,
    TcpStream,
};

use crate::protocol::{
    AcquisitionReport,
    Channel,
    Command,
};
use crate::settings::NetworkSettings;

pub struct ScopeClient {
  host              : String,
  network           : NetworkSettings,
  /// bytes per channel and acquisition
  acquisition_bytes : usize,
  with_environment  : bool,
}

impl ScopeClient {
  pub fn new(host              : &str,
             network           : &NetworkSettings,
             acquisition_bytes : usize,
             with_environment  : bool) -> Self {
    Self {
      host              : String::from(host),
      network           : network.clone(),
      acquisition_bytes,
      with_environment,
    }
  }

  fn connect(&self, port : u16) -> Result<TcpStream, Box<dyn Error>> {
    let address = format!("{}:{}", self.host, port);
    match TcpStream::connect(&address) {
      Err(err) => {
        error!("Unable to connect to {address}! {err}");
        Err(err.into())
      }
      Ok(stream) => Ok(stream)
    }
  }

  /// Send a command over the control socket
  pub fn send_command(&self, command : &Command) -> Result<(), Box<dyn Error>> {
    let mut stream = self.connect(self.network.port_ack)?;
    stream.write_all(&command.to_bytes())?;
    stream.flush()?;
    stream.shutdown(Shutdown::Write)?;
    debug!("Sent {command}");
    Ok(())
  }

  /// Pick up the report the server sends after each acquisition
  pub fn read_report(&self) -> Result<AcquisitionReport, Box<dyn Error>> {
    let mut stream = self.connect(self.network.port_ack)?;
    let mut bytestream = Vec::<u8>::new();
    stream.read_to_end(&mut bytestream)?;
    let report = AcquisitionReport::from_bytestream(&bytestream, self.with_environment)?;
    debug!("Received {report}");
    Ok(report)
  }

  /// Receive the samples of one channel for one acquisition
  pub fn receive_channel(&self, channel : Channel) -> Result<Vec<u8>, Box<dyn Error>> {
    let mut stream = self.connect(channel.port(&self.network))?;
    let mut samples = vec![0u8;self.acquisition_bytes];
    stream.read_exact(&mut samples)?;
    Ok(samples)
  }
}
