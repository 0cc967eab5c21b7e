//! Thread control structures

use std::fmt;
use std::sync::{
    Arc,
    Mutex,
};

/// Send runtime information
/// to threads via shared memory
/// (Arc(Mutex)
#[derive(Default, Debug)]
pub struct ThreadControl {
  /// Stop ALL threads
  pub stop_flag                 : bool,
  /// alive indicator for the reader (trigger/drain) thread
  pub thread_reader_active      : bool,
  /// alive indicator for the sender of channel A
  pub thread_sender_a_active    : bool,
  /// alive indicator for the sender of channel B
  pub thread_sender_b_active    : bool,
  /// alive indicator for the monitoring thread
  pub thread_monitoring_active  : bool,
  /// Number of acquisitions the reader finished
  pub n_acquisitions            : u64,
}

impl ThreadControl {
  pub fn new() -> Self {
    Self {
      stop_flag                : false,
      thread_reader_active     : false,
      thread_sender_a_active   : false,
      thread_sender_b_active   : false,
      thread_monitoring_active : false,
      n_acquisitions           : 0,
    }
  }
}

impl fmt::Display for ThreadControl {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<ThreadControl:");
    repr        += &(format!("\n  acquisitions   : {}", self.n_acquisitions));
    repr        += "\n    -- program status:";
    repr        += &(format!("\n  stop flag      : {}", self.stop_flag));
    repr        += "\n    -- reported thread activity:";
    repr        += &(format!("\n  reader         : {}", self.thread_reader_active));
    repr        += &(format!("\n  sender A       : {}", self.thread_sender_a_active));
    repr        += &(format!("\n  sender B       : {}", self.thread_sender_b_active));
    repr        += &(format!("\n  monitoring     : {}>", self.thread_monitoring_active));
    write!(f, "{}", repr)
  }
}

/// Check if the stop flag is set
///
/// A poisoned lock means one of the other threads
/// panicked while holding it. There is nothing
/// left to coordinate then, so this reports a stop.
pub fn stop_requested(thread_control : &Arc<Mutex<ThreadControl>>) -> bool {
  match thread_control.lock() {
    Ok(tc) => tc.stop_flag,
    Err(err) => {
      error!("Can't acquire lock for ThreadControl! {err}");
      true
    }
  }
}

/// Set the stop flag for all threads
pub fn request_stop(thread_control : &Arc<Mutex<ThreadControl>>) {
  match thread_control.lock() {
    Ok(mut tc) => tc.stop_flag = true,
    Err(err) => error!("Can't acquire lock for ThreadControl! {err}"),
  }
}

#[cfg(test)]
mod test_thread_control {
  use super::*;
  use std::thread;

  #[test]
  fn stop_is_seen_by_other_threads() {
    let tc   = Arc::new(Mutex::new(ThreadControl::new()));
    assert!(!stop_requested(&tc));
    let tc_c = Arc::clone(&tc);
    thread::spawn(move || request_stop(&tc_c)).join().unwrap();
    assert!(stop_requested(&tc));
  }

  #[test]
  fn poisoned_lock_means_stop() {
    let tc   = Arc::new(Mutex::new(ThreadControl::new()));
    let tc_c = Arc::clone(&tc);
    let _ = thread::spawn(move || {
      let _guard = tc_c.lock().unwrap();
      panic!("poison the lock");
    }).join();
    assert!(stop_requested(&tc));
  }
}
