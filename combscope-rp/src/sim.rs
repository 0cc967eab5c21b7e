//! A scope without FPGA
//!
//! Behaves like the scope core as far as the reader
//! can tell: writing a trigger source arms it, the
//! trigger fires after a few polls, and the write
//! pointer then walks through the ring in steps until
//! the post trigger samples are recorded. Every trigger
//! happens a bit further down the ring, so sooner or
//! later an acquisition wraps around the end.

use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::Mutex;

use crate::memory::{
    DmaRing,
    RegisterAccess,
    RAM_A_ADDRESS,
    RAM_B_ADDRESS,
};
use crate::registers::*;

/// Polls of the trigger source register until the trigger fires
pub const TRIGGER_DELAY_POLLS : u32   = 3;
/// How far the ring moves on between two triggers [bytes]
pub const TRIGGER_GAP         : usize = 2*12_289;

struct ChannelState {
  base      : u32,
  size      : usize,
  /// current write offset
  position  : usize,
  /// bytes still to be recorded for the current trigger
  remaining : usize,
}

impl ChannelState {
  fn advance(&mut self, step : usize) {
    let n = step.min(self.remaining);
    self.position   = (self.position + n) % self.size;
    self.remaining -= n;
  }

  fn pointer(&self) -> u32 {
    self.base + self.position as u32
  }
}

struct SimState {
  registers   : HashMap<u32, u32>,
  /// polls until the armed trigger fires
  trigger_in  : Option<u32>,
  step        : usize,
  a           : ChannelState,
  b           : ChannelState,
  n_triggers  : u64,
}

impl SimState {
  fn value(&self, offset : u32) -> u32 {
    *self.registers.get(&offset).unwrap_or(&0)
  }

  fn fire(&mut self) {
    let post_a = self.value(AXI_A_POST_TRIGGER) as usize*2;
    let post_b = self.value(AXI_B_POST_TRIGGER) as usize*2;
    for (ch, post, trig_reg) in [(&mut self.a, post_a, AXI_A_TRIGGER_PTR),
                                 (&mut self.b, post_b, AXI_B_TRIGGER_PTR)] {
      ch.position  = (ch.position + TRIGGER_GAP) % ch.size;
      ch.remaining = post;
      self.registers.insert(trig_reg, ch.pointer());
    }
    self.registers.insert(TRIGGER_SOURCE, 0);
    self.n_triggers += 1;
    trace!("Simulated trigger {} at A {:#x} B {:#x}", self.n_triggers, self.a.pointer(), self.b.pointer());
  }
}

/// The register file of the simulated scope
pub struct SimulatedRegisters {
  state : Mutex<SimState>,
}

impl SimulatedRegisters {
  /// Number of triggers fired so far
  pub fn n_triggers(&self) -> u64 {
    match self.state.lock() {
      Err(_)    => 0,
      Ok(state) => state.n_triggers,
    }
  }
}

impl RegisterAccess for SimulatedRegisters {
  fn read32(&self, offset : u32) -> u32 {
    let mut state = match self.state.lock() {
      Err(err) => {
        error!("Simulated register file is poisoned! {err}");
        return 0;
      }
      Ok(state) => state
    };
    match offset {
      TRIGGER_SOURCE => {
        match state.trigger_in {
          Some(0) => {
            state.trigger_in = None;
            state.fire();
          }
          Some(n) => state.trigger_in = Some(n - 1),
          None    => ()
        }
        state.value(TRIGGER_SOURCE)
      }
      AXI_A_WRITE_PTR => {
        let step = state.step;
        state.a.advance(step);
        state.a.pointer()
      }
      AXI_B_WRITE_PTR => {
        let step = state.step;
        state.b.advance(step);
        state.b.pointer()
      }
      _ => state.value(offset)
    }
  }

  fn write32(&self, offset : u32, value : u32) {
    let mut state = match self.state.lock() {
      Err(err) => {
        error!("Simulated register file is poisoned! {err}");
        return;
      }
      Ok(state) => state
    };
    state.registers.insert(offset, value);
    if offset == TRIGGER_SOURCE {
      state.trigger_in = if value != 0 {Some(TRIGGER_DELAY_POLLS)} else {None};
    }
  }
}

/// Sample `n` of the simulated waveform of a channel
pub fn waveform(second_channel : bool, n : usize) -> i16 {
  if second_channel {
    // sawtooth
    ((n % 4096) as i16) - 2048
  } else {
    let phase = 2.0*PI*(n % 1000) as f32/1000.0;
    (2000.0*phase.sin()) as i16
  }
}

fn fill_ring(second_channel : bool, size : usize) -> Vec<u8> {
  let mut data = Vec::<u8>::with_capacity(size);
  for n in 0..size/2 {
    data.extend_from_slice(&waveform(second_channel, n).to_le_bytes());
  }
  data.resize(size, 0);
  data
}

/// Everything the reader needs from the hardware,
/// without hardware
pub struct SimulatedScope {
  pub registers : SimulatedRegisters,
  pub ring_a    : DmaRing,
  pub ring_b    : DmaRing,
}

impl SimulatedScope {
  /// # Arguments
  ///
  /// * ring_size : bytes per DMA ring
  /// * step      : bytes the write pointer moves per poll
  pub fn new(ring_size : usize, step : usize) -> Self {
    let state = SimState {
      registers  : HashMap::new(),
      trigger_in : None,
      step,
      a          : ChannelState {
        base      : RAM_A_ADDRESS,
        size      : ring_size,
        position  : 0,
        remaining : 0
      },
      b          : ChannelState {
        base      : RAM_B_ADDRESS,
        size      : ring_size,
        position  : 0,
        remaining : 0
      },
      n_triggers : 0,
    };
    Self {
      registers : SimulatedRegisters { state : Mutex::new(state) },
      ring_a    : DmaRing::from_vec(RAM_A_ADDRESS, fill_ring(false, ring_size)),
      ring_b    : DmaRing::from_vec(RAM_B_ADDRESS, fill_ring(true,  ring_size)),
    }
  }
}

#[cfg(test)]
mod test_sim {
  use super::*;
  use crate::control::Scope;
  use combscope_lib::protocol::Channel;
  use combscope_lib::settings::TriggerSource;

  #[test]
  fn trigger_fires_after_a_few_polls() {
    let sim   = SimulatedScope::new(1 << 16, 1000);
    let scope = Scope::new(sim.registers);
    scope.configure_dma(RAM_A_ADDRESS, 1 << 16, RAM_B_ADDRESS, 1 << 16, 1000, 100);
    scope.arm(TriggerSource::ChannelBFalling);
    let mut polls = 0;
    while scope.trigger_pending() {
      polls += 1;
    }
    assert_eq!(polls, TRIGGER_DELAY_POLLS);
    assert_eq!(scope.registers().n_triggers(), 1);
    assert_eq!(scope.trigger_pointer(Channel::A), RAM_A_ADDRESS + TRIGGER_GAP as u32);
    assert_eq!(scope.trigger_pointer(Channel::B), RAM_B_ADDRESS + TRIGGER_GAP as u32);
  }

  #[test]
  fn write_pointer_stops_after_post_trigger() {
    let sim   = SimulatedScope::new(1 << 16, 1000);
    let scope = Scope::new(sim.registers);
    scope.configure_dma(RAM_A_ADDRESS, 1 << 16, RAM_B_ADDRESS, 1 << 16, 1000, 100);
    scope.arm(TriggerSource::Manual);
    while scope.trigger_pending() {}
    let trig = scope.trigger_pointer(Channel::A);
    let mut last = 0;
    for _ in 0..10 {
      last = scope.write_pointer(Channel::A);
    }
    // (1000 - 100 + 64) samples
    assert_eq!(last, trig + 1928);
  }

  #[test]
  fn disarm_without_trigger() {
    let sim   = SimulatedScope::new(1 << 16, 1000);
    let scope = Scope::new(sim.registers);
    scope.arm(TriggerSource::Manual);
    scope.registers().write32(TRIGGER_SOURCE, 0);
    for _ in 0..10 {
      assert!(!scope.trigger_pending());
    }
    assert_eq!(scope.registers().n_triggers(), 0);
  }
}
