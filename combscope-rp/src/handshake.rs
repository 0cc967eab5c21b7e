//! Server side of the control (ack) channel
//!
//! Every message of the handshake comes in or goes out
//! over its own connection, see `combscope_lib::protocol`.
//! Listeners are non-blocking, so that waiting for a
//! client can be given up as soon as the stop flag is set.

use std::io::{
    self,
    Read,
    Write,
};
use std::net::{
    SocketAddr,
    TcpListener,
    TcpStream,
};
use std::sync::{
    Arc,
    Mutex,
};
use std::thread;
use std::time::Duration;

use combscope_lib::protocol::{
    AcquisitionReport,
    Command,
    MAX_COMMAND_LEN,
};
use combscope_lib::thread_control::stop_requested;
use combscope_lib::ThreadControl;

/// Bind a listener which does not block on accept
pub fn bind_listener(address : &str, port : u16) -> io::Result<TcpListener> {
  let listener = TcpListener::bind((address, port))?;
  listener.set_nonblocking(true)?;
  debug!("Listening on {}", listener.local_addr()?);
  Ok(listener)
}

/// Wait for the next client on a non-blocking listener
///
/// Returns None if the stop flag was set while waiting.
/// The returned stream is blocking again.
pub fn poll_accept(listener       : &TcpListener,
                   interval       : Duration,
                   thread_control : &Arc<Mutex<ThreadControl>>)
  -> io::Result<Option<(TcpStream, SocketAddr)>> {
  loop {
    if stop_requested(thread_control) {
      return Ok(None);
    }
    match listener.accept() {
      Ok((stream, peer)) => {
        stream.set_nonblocking(false)?;
        return Ok(Some((stream, peer)));
      }
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        thread::sleep(interval);
      }
      Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
      Err(err) => return Err(err),
    }
  }
}

/// The control channel as the reader sees it
pub struct ControlChannel {
  listener       : TcpListener,
  accept_poll    : Duration,
  thread_control : Arc<Mutex<ThreadControl>>,
}

impl ControlChannel {
  pub fn new(listener       : TcpListener,
             accept_poll    : Duration,
             thread_control : Arc<Mutex<ThreadControl>>) -> Self {
    Self {
      listener,
      accept_poll,
      thread_control,
    }
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  /// Accept the next client, retrying on accept errors
  fn accept(&self) -> Option<TcpStream> {
    loop {
      match poll_accept(&self.listener, self.accept_poll, &self.thread_control) {
        Err(err) => {
          error!("Accept on the control channel failed! {err}");
          thread::sleep(self.accept_poll);
        }
        Ok(None) => return None,
        Ok(Some((stream, peer))) => {
          debug!("Control connection from {peer}");
          return Some(stream);
        }
      }
    }
  }

  /// Wait until a client sent a command we understand
  ///
  /// Connections which close without a command or send
  /// garbage are logged and dropped. Returns None if
  /// the stop flag was set while waiting.
  pub fn receive_command(&self) -> Option<Command> {
    loop {
      let mut stream = self.accept()?;
      let mut raw    = [0u8;MAX_COMMAND_LEN];
      let n = match stream.read(&mut raw) {
        Err(err) => {
          error!("Unable to read command! {err}");
          continue;
        }
        Ok(n) => n
      };
      match Command::from_bytes(&raw[..n]) {
        Err(err) => {
          warn!("Ignoring control message {:?}! {err}", String::from_utf8_lossy(&raw[..n]));
        }
        Ok(command) => {
          info!("Received {command}");
          return Some(command);
        }
      }
    }
  }

  /// Send the report on a fresh connection and close it
  ///
  /// Returns false if the stop flag was set while
  /// waiting for the client.
  pub fn send_report(&self, report : &AcquisitionReport) -> bool {
    let mut stream = match self.accept() {
      None         => return false,
      Some(stream) => stream
    };
    match stream.write_all(&report.to_bytestream()) {
      Err(err) => error!("Unable to send {report}! {err}"),
      Ok(_)    => debug!("Sent {report}"),
    }
    true
  }
}
