//! Hand over of acquired samples from the reader
//! to the sender of a channel
//!
//! The reader copies blocks out of the DMA ring into
//! the linear buffer and advances the write cursor,
//! the sender streams everything below the cursor and
//! hands the buffer back by resetting the cursor to 0.
//! The cursor is the only thing which has to be agreed
//! on, so it has its own lock. The buffer has a second
//! lock which is only ever held for a memcpy.

use std::error::Error;
use std::fmt;
use std::sync::{
    Mutex,
    MutexGuard,
};

use combscope_lib::protocol::Channel;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum QueueError {
  /// Another thread panicked while holding one of the locks
  LockPoisoned,
  AllocationFailed,
  /// Access outside of the buffer
  OutOfRange,
}

impl fmt::Display for QueueError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      QueueError::LockPoisoned     => "LockPoisoned",
      QueueError::AllocationFailed => "AllocationFailed",
      QueueError::OutOfRange       => "OutOfRange",
    };
    write!(f, "<QueueError: {}>", etype)
  }
}

impl Error for QueueError {
}

/// Samples of one channel for one acquisition
pub struct AcquisitionQueue {
  channel  : Channel,
  /// bytes the reader has put into the buffer
  cursor   : Mutex<usize>,
  buffer   : Mutex<Vec<u8>>,
  capacity : usize,
}

impl AcquisitionQueue {
  /// Allocate the buffer for one acquisition
  ///
  /// # Arguments
  ///
  /// * capacity : bytes per acquisition (2 per sample)
  pub fn new(channel : Channel, capacity : usize) -> Result<Self, QueueError> {
    let mut buffer = Vec::<u8>::new();
    if let Err(err) = buffer.try_reserve_exact(capacity) {
      error!("Can not allocate {capacity} bytes for channel {channel}! {err}");
      return Err(QueueError::AllocationFailed);
    }
    buffer.resize(capacity, 0);
    Ok(Self {
      channel,
      cursor : Mutex::new(0),
      buffer : Mutex::new(buffer),
      capacity,
    })
  }

  pub fn channel(&self) -> Channel {
    self.channel
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Lock the write cursor
  pub fn lock(&self) -> Result<MutexGuard<'_, usize>, QueueError> {
    match self.cursor.lock() {
      Err(err) => {
        error!("Can't acquire cursor lock of channel {}! {err}", self.channel);
        Err(QueueError::LockPoisoned)
      }
      Ok(guard) => Ok(guard)
    }
  }

  /// Current value of the write cursor
  pub fn cursor(&self) -> Result<usize, QueueError> {
    Ok(*self.lock()?)
  }

  fn lock_buffer(&self) -> Result<MutexGuard<'_, Vec<u8>>, QueueError> {
    match self.buffer.lock() {
      Err(err) => {
        error!("Can't acquire buffer lock of channel {}! {err}", self.channel);
        Err(QueueError::LockPoisoned)
      }
      Ok(guard) => Ok(guard)
    }
  }

  /// Let `fill` write `length` bytes at `offset`
  ///
  /// Only the reader calls this, and only at or above
  /// the cursor, which is the region the sender does
  /// not look at.
  pub fn fill<F>(&self, offset : usize, length : usize, fill : F) -> Result<(), QueueError>
    where F : FnOnce(&mut [u8]) {
    if offset + length > self.capacity {
      return Err(QueueError::OutOfRange);
    }
    let mut buffer = self.lock_buffer()?;
    fill(&mut buffer[offset..offset + length]);
    Ok(())
  }

  /// Copy bytes starting at `offset` out of the buffer
  ///
  /// Only the sender calls this, and only below
  /// the cursor.
  pub fn read_into(&self, offset : usize, dst : &mut [u8]) -> Result<(), QueueError> {
    if offset + dst.len() > self.capacity {
      return Err(QueueError::OutOfRange);
    }
    let buffer = self.lock_buffer()?;
    dst.copy_from_slice(&buffer[offset..offset + dst.len()]);
    Ok(())
  }
}
