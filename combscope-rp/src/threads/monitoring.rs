use std::time::{
    Duration,
    Instant,
};
use std::sync::{
    Arc,
    Mutex,
};

use crossbeam_channel::{
    Receiver,
    RecvTimeoutError,
};

use combscope_lib::ThreadControl;

use crate::threads::sender::SendSummary;

/// Log throughput of the senders and the state of
/// the threads
///
/// # Arguments:
///
/// * summaries      - one summary per channel and acquisition
/// * moni_interval  - how often the thread states are logged
pub fn monitoring(summaries      : &Receiver<SendSummary>,
                  moni_interval  : Duration,
                  thread_control : Arc<Mutex<ThreadControl>>) {
  let mut moni_timer = Instant::now();
  match thread_control.lock() {
    Ok(mut tc) => tc.thread_monitoring_active = true,
    Err(err)   => error!("Can't acquire lock! {err}"),
  }
  loop {
    match thread_control.lock() {
      Ok(tc) => {
        if tc.stop_flag {
          info!("Received stop signal. Will stop thread!");
          break;
        }
        if moni_timer.elapsed() > moni_interval {
          debug!("{}", tc);
          moni_timer = Instant::now();
        }
      },
      Err(err) => {
        error!("Can't acquire lock! {err}");
        break;
      },
    }
    match summaries.recv_timeout(Duration::from_millis(100)) {
      Err(RecvTimeoutError::Timeout) => (),
      Err(RecvTimeoutError::Disconnected) => {
        info!("All senders are gone. Will stop thread!");
        break;
      }
      Ok(summary) => {
        let seconds = summary.elapsed.as_secs_f64();
        let rate    = if seconds > 0.0 {summary.bytes as f64/seconds/1e6} else {0.0};
        info!("Channel {}: {} bytes in {:.1} ms ({:.2} MB/s)",
              summary.channel, summary.bytes, seconds*1000.0, rate);
      }
    }
  }
  match thread_control.lock() {
    Ok(mut tc) => tc.thread_monitoring_active = false,
    Err(err)   => error!("Can't acquire lock! {err}"),
  }
}
