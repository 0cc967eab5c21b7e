//! Stream the samples of one channel to the client

use std::io::{
    self,
    Write,
};
use std::net::{
    TcpListener,
    TcpStream,
};
use std::sync::{
    Arc,
    Mutex,
};
use std::thread;
use std::time::{
    Duration,
    Instant,
};

use crossbeam_channel::Sender;

use combscope_lib::protocol::Channel;
use combscope_lib::thread_control::stop_requested;
use combscope_lib::ThreadControl;

use crate::handshake::poll_accept;
use crate::queue::AcquisitionQueue;

/// What a sender did for one acquisition
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SendSummary {
  pub channel : Channel,
  pub bytes   : usize,
  /// from accepting the client to handing the buffer back
  pub elapsed : Duration,
}

/// Everything a sender thread owns
pub struct ChannelSender {
  pub queue          : Arc<AcquisitionQueue>,
  pub listener       : TcpListener,
  /// maximum bytes per write
  pub send_block     : usize,
  pub poll_interval  : Duration,
  pub accept_poll    : Duration,
  pub thread_control : Arc<Mutex<ThreadControl>>,
}

fn set_sender_active(tc : &Arc<Mutex<ThreadControl>>, channel : Channel, active : bool) {
  match tc.lock() {
    Ok(mut tc) => {
      match channel {
        Channel::A => tc.thread_sender_a_active = active,
        Channel::B => tc.thread_sender_b_active = active,
      }
    }
    Err(err) => error!("Can't acquire lock for ThreadControl! {err}"),
  }
}

/// Write everything between `send_pos` and `send_pos + pending`
///
/// Returns the number of bytes which went out, or the
/// error which stopped us.
fn send_pending(stream   : &mut TcpStream,
                queue    : &AcquisitionQueue,
                scratch  : &mut [u8],
                send_pos : usize,
                pending  : usize) -> io::Result<usize> {
  let mut sent = 0;
  while sent < pending {
    let n = (pending - sent).min(scratch.len());
    if let Err(err) = queue.read_into(send_pos + sent, &mut scratch[..n]) {
      return Err(io::Error::new(io::ErrorKind::Other, err));
    }
    match stream.write(&scratch[..n]) {
      Ok(0) => {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "client does not take any more data"));
      }
      Ok(k) => sent += k,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
      Err(err) => return Err(err),
    }
  }
  Ok(sent)
}

/// Send out whatever the reader puts into the queue
///
/// One client connection per acquisition. Once the whole
/// acquisition is out, the connection is closed and the
/// queue is handed back to the reader by resetting its
/// cursor. A failed send ends this thread for good, the
/// other channel is not affected.
///
/// # Arguments
///
/// * sender    : queue, listener and timing of this channel
/// * summaries : one [`SendSummary`] per acquisition goes here
pub fn sender(ctx       : ChannelSender,
              summaries : Sender<SendSummary>) {
  let queue    = ctx.queue;
  let channel  = queue.channel();
  let total    = queue.capacity();
  let mut scratch = vec![0u8;ctx.send_block.max(1)];
  let mut send_pos   = 0usize;
  let mut connection : Option<(TcpStream, Instant)> = None;
  set_sender_active(&ctx.thread_control, channel, true);
  info!("Sender for channel {channel} started, {total} bytes per acquisition");
  loop {
    if stop_requested(&ctx.thread_control) {
      info!("Received stop signal. Will stop sender for channel {channel}!");
      break;
    }
    let pending;
    {
      let mut cursor = match queue.lock() {
        Err(err) => {
          error!("Sender for channel {channel} lost its queue! {err}");
          break;
        }
        Ok(cursor) => cursor
      };
      if send_pos >= total && *cursor >= total {
        send_pos = 0;
        *cursor  = 0;
        if let Some((stream, accepted)) = connection.take() {
          drop(stream);
          let summary = SendSummary {
            channel,
            bytes   : total,
            elapsed : accepted.elapsed(),
          };
          if let Err(err) = summaries.try_send(summary) {
            debug!("No one listens for send summaries! {err}");
          }
        }
      }
      pending = *cursor - send_pos;
    }
    if pending == 0 {
      thread::sleep(ctx.poll_interval);
      continue;
    }
    if connection.is_none() {
      match poll_accept(&ctx.listener, ctx.accept_poll, &ctx.thread_control) {
        Err(err) => {
          error!("Accept for channel {channel} failed! {err}");
          break;
        }
        Ok(None) => {
          info!("Received stop signal. Will stop sender for channel {channel}!");
          break;
        }
        Ok(Some((stream, peer))) => {
          debug!("Channel {channel} streams to {peer}");
          connection = Some((stream, Instant::now()));
        }
      }
    }
    if let Some((stream, _)) = connection.as_mut() {
      match send_pending(stream, &queue, &mut scratch, send_pos, pending) {
        Err(err) => {
          error!("Sending channel {channel} failed, this channel stays silent from now on! {err}");
          break;
        }
        Ok(n) => send_pos += n,
      }
    }
  }
  set_sender_active(&ctx.thread_control, channel, false);
}

#[cfg(test)]
mod test_sender {
  use super::*;
  use std::io::Read;
  use rand::Rng;
  use combscope_lib::thread_control::request_stop;
  use crate::handshake::bind_listener;

  fn start(queue : &Arc<AcquisitionQueue>,
           tc    : &Arc<Mutex<ThreadControl>>,
           block : usize)
    -> (std::net::SocketAddr, thread::JoinHandle<()>, crossbeam_channel::Receiver<SendSummary>) {
    let listener = bind_listener("127.0.0.1", 0).unwrap();
    let addr     = listener.local_addr().unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    let ctx = ChannelSender {
      queue          : Arc::clone(queue),
      listener,
      send_block     : block,
      poll_interval  : Duration::from_micros(5),
      accept_poll    : Duration::from_millis(1),
      thread_control : Arc::clone(tc),
    };
    let handle = thread::spawn(move || sender(ctx, tx));
    (addr, handle, rx)
  }

  /// Push `total` bytes into the queue in random increments
  fn produce(queue : &AcquisitionQueue, seed : u8) {
    let mut rng  = rand::thread_rng();
    let total    = queue.capacity();
    let mut pos  = 0;
    while pos < total {
      let n = rng.gen_range(1..=4096).min(total - pos);
      queue.fill(pos, n, |dst| {
        for (k, b) in dst.iter_mut().enumerate() {
          *b = ((pos + k) as u8).wrapping_add(seed);
        }
      }).unwrap();
      *queue.lock().unwrap() += n;
      pos += n;
    }
  }

  #[test]
  fn one_acquisition_exactly_once() {
    let total = 100_000;
    let queue = Arc::new(AcquisitionQueue::new(Channel::A, total).unwrap());
    let tc    = Arc::new(Mutex::new(ThreadControl::new()));
    let (addr, handle, summaries) = start(&queue, &tc, 16384);
    let client = thread::spawn(move || {
      let mut s = TcpStream::connect(addr).unwrap();
      let mut bytes = Vec::new();
      s.read_to_end(&mut bytes).unwrap();
      bytes
    });
    produce(&queue, 0);
    let bytes = client.join().unwrap();
    assert_eq!(bytes.len(), total);
    assert!(bytes.iter().enumerate().all(|(k, b)| *b == k as u8));
    // the buffer was handed back
    let summary = summaries.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(summary.bytes, total);
    assert_eq!(summary.channel, Channel::A);
    assert_eq!(queue.cursor().unwrap(), 0);
    request_stop(&tc);
    handle.join().unwrap();
    assert!(!tc.lock().unwrap().thread_sender_a_active);
  }

  #[test]
  fn consecutive_acquisitions_use_new_connections() {
    let total = 30_000;
    let queue = Arc::new(AcquisitionQueue::new(Channel::B, total).unwrap());
    let tc    = Arc::new(Mutex::new(ThreadControl::new()));
    let (addr, handle, summaries) = start(&queue, &tc, 1000);
    for seed in 0..3u8 {
      let client = thread::spawn(move || {
        let mut s = TcpStream::connect(addr).unwrap();
        let mut bytes = Vec::new();
        s.read_to_end(&mut bytes).unwrap();
        bytes
      });
      // wait until the previous acquisition was handed back
      while queue.cursor().unwrap() != 0 {
        thread::sleep(Duration::from_micros(50));
      }
      produce(&queue, seed);
      let bytes = client.join().unwrap();
      assert_eq!(bytes.len(), total);
      assert_eq!(bytes[0], seed);
      summaries.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    request_stop(&tc);
    handle.join().unwrap();
  }

  #[test]
  fn broken_client_ends_the_sender() {
    let total = 4_000_000;
    let queue = Arc::new(AcquisitionQueue::new(Channel::A, total).unwrap());
    let tc    = Arc::new(Mutex::new(ThreadControl::new()));
    tc.lock().unwrap().thread_sender_a_active = true;
    let (addr, handle, _summaries) = start(&queue, &tc, 16384);
    // a client which hangs up right away
    let client = thread::spawn(move || {
      drop(TcpStream::connect(addr).unwrap());
    });
    produce(&queue, 0);
    client.join().unwrap();
    // without anyone reading, the sender has to run into an error
    handle.join().unwrap();
    assert!(!tc.lock().unwrap().thread_sender_a_active);
    assert!(!tc.lock().unwrap().stop_flag);
  }
}
