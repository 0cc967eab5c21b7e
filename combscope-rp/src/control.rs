//! Convenience functions to read/write
//!  the various control registers
//!
//!  For the mapping of registers/addresses,
//!  see `registers.rs`
//!

use combscope_lib::protocol::Channel;
use combscope_lib::settings::{
    Decimation,
    Equalizer,
    ScopeSettings,
    TriggerSource,
};

use crate::memory::{
    DmaRing,
    RegisterAccess,
};
use crate::registers::*;

/// The oscilloscope core of the FPGA
///
/// Generic over the register access, so that the same
/// code drives the real hardware and the simulation.
pub struct Scope<R : RegisterAccess> {
  registers : R,
}

impl<R : RegisterAccess> Scope<R> {
  pub fn new(registers : R) -> Self {
    Self {
      registers
    }
  }

  pub fn registers(&self) -> &R {
    &self.registers
  }

  /// Reset the write state machine
  pub fn reset(&self) {
    trace!("Reset scope write state machine!");
    self.registers.write32(CONFIG, CONFIG_RESET);
  }

  /// Set decimation, averaging and the input filters
  /// of both channels
  pub fn configure_input(&self,
                         decimation : Decimation,
                         eq_a       : Equalizer,
                         eq_b       : Equalizer,
                         shaping_a  : bool,
                         shaping_b  : bool) {
    debug!("Input: decimation {:?}, A {:?} (shaping {}), B {:?} (shaping {})",
           decimation, eq_a, shaping_a, eq_b, shaping_b);
    self.registers.write32(DECIMATION, decimation.register_value());
    let averaging = if decimation == Decimation::Off {0} else {1};
    self.registers.write32(AVERAGING, averaging);
    self.set_filter(FILTER_A, eq_a, shaping_a);
    self.set_filter(FILTER_B, eq_b, shaping_b);
  }

  fn set_filter(&self, base : u32, equalizer : Equalizer, shaping : bool) {
    let (aa, bb) = match equalizer {
      Equalizer::Off         => EQ_OFF_COEFFS,
      Equalizer::LowVoltage  => EQ_LV_COEFFS,
      Equalizer::HighVoltage => EQ_HV_COEFFS,
    };
    let (kk, pp) = if shaping {SHAPING_ON_COEFFS} else {SHAPING_OFF_COEFFS};
    self.registers.write32(base + FILTER_AA, aa);
    self.registers.write32(base + FILTER_BB, bb);
    self.registers.write32(base + FILTER_KK, kk);
    self.registers.write32(base + FILTER_PP, pp);
  }

  /// Thresholds and hysteresis are in ADC counts
  /// (signed), the deadtime in samples
  pub fn configure_trigger(&self,
                           thresh_a : i32,
                           thresh_b : i32,
                           hyst_a   : i32,
                           hyst_b   : i32,
                           deadtime : u32) {
    debug!("Trigger: threshold A {thresh_a} B {thresh_b}, hysteresis A {hyst_a} B {hyst_b}, deadtime {deadtime}");
    self.registers.write32(THRESHOLD_A,  thresh_a as u32);
    self.registers.write32(THRESHOLD_B,  thresh_b as u32);
    self.registers.write32(HYSTERESIS_A, hyst_a as u32);
    self.registers.write32(HYSTERESIS_B, hyst_b as u32);
    // this is what clears the trigger source after the trigger
    self.registers.write32(LEGACY_POST_TRIGGER, LEGACY_POST_TRIGGER_SAMPLES);
    self.registers.write32(TRIGGER_DEADTIME, deadtime);
  }

  /// Tell the DMA engine where the rings are and how
  /// long it has to keep recording after a trigger
  pub fn configure_dma(&self,
                       ram_a_base         : u32,
                       ram_a_size         : usize,
                       ram_b_base         : u32,
                       ram_b_size         : usize,
                       acquisition_length : usize,
                       pre_trigger_length : usize) {
    let post_trigger = (acquisition_length - pre_trigger_length + 64) as u32;
    debug!("DMA: A {ram_a_base:#x} ({ram_a_size} bytes), B {ram_b_base:#x} ({ram_b_size} bytes), {post_trigger} post trigger samples");
    self.registers.write32(AXI_A_START,        ram_a_base);
    self.registers.write32(AXI_A_STOP,         ram_a_base + ram_a_size as u32);
    self.registers.write32(AXI_A_POST_TRIGGER, post_trigger);
    self.registers.write32(AXI_B_START,        ram_b_base);
    self.registers.write32(AXI_B_STOP,         ram_b_base + ram_b_size as u32);
    self.registers.write32(AXI_B_POST_TRIGGER, post_trigger);
    self.registers.write32(AXI_A_ENABLE, 1);
    self.registers.write32(AXI_B_ENABLE, 1);
  }

  /// Start recording and wait for the next trigger
  pub fn arm(&self, source : TriggerSource) {
    trace!("Arm with {source}");
    self.registers.write32(CONFIG, CONFIG_ARM | CONFIG_RESET);
    self.registers.write32(CONFIG, CONFIG_ARM);
    self.registers.write32(TRIGGER_SOURCE, source.register_value());
  }

  /// Stop waiting for a trigger
  pub fn disarm(&self) {
    self.registers.write32(TRIGGER_SOURCE, TriggerSource::Off.register_value());
  }

  /// The FPGA clears the trigger source once the trigger fired
  pub fn trigger_pending(&self) -> bool {
    self.registers.read32(TRIGGER_SOURCE) != 0
  }

  /// Physical address the DMA wrote to when the trigger fired
  pub fn trigger_pointer(&self, channel : Channel) -> u32 {
    match channel {
      Channel::A => self.registers.read32(AXI_A_TRIGGER_PTR),
      Channel::B => self.registers.read32(AXI_B_TRIGGER_PTR),
    }
  }

  /// Physical address the DMA is writing to right now
  pub fn write_pointer(&self, channel : Channel) -> u32 {
    match channel {
      Channel::A => self.registers.read32(AXI_A_WRITE_PTR),
      Channel::B => self.registers.read32(AXI_B_WRITE_PTR),
    }
  }

  /// Bring the scope into a defined state as given
  /// by the settings. Does not arm.
  pub fn apply_settings(&self,
                        settings : &ScopeSettings,
                        ring_a   : &DmaRing,
                        ring_b   : &DmaRing) {
    self.reset();
    let input = &settings.input;
    self.configure_input(input.decimation,
                         input.equalizer_a,
                         input.equalizer_b,
                         input.shaping_a,
                         input.shaping_b);
    let trig = &settings.trigger;
    self.configure_trigger(trig.threshold_a,
                           trig.threshold_b,
                           trig.hysteresis_a,
                           trig.hysteresis_b,
                           trig.deadtime);
    self.configure_dma(ring_a.base(),
                       ring_a.size(),
                       ring_b.base(),
                       ring_b.size(),
                       settings.acquisition.acquisition_length,
                       settings.acquisition.pre_trigger_length);
  }

  /// Name, address and current value of every register
  pub fn dump(&self) -> Vec<(&'static str, u32, u32)> {
    REGISTER_TABLE.iter()
      .map(|(name, addr)| (*name, *addr, self.registers.read32(*addr)))
      .collect()
  }
}

#[cfg(test)]
mod test_control {
  use super::*;
  use std::cell::RefCell;
  use std::collections::HashMap;

  /// Remembers every write in order
  struct RecordingRegisters {
    values : RefCell<HashMap<u32, u32>>,
    writes : RefCell<Vec<(u32, u32)>>,
  }

  impl RecordingRegisters {
    fn new() -> Self {
      Self {
        values : RefCell::new(HashMap::new()),
        writes : RefCell::new(Vec::new()),
      }
    }
  }

  impl RegisterAccess for RecordingRegisters {
    fn read32(&self, offset : u32) -> u32 {
      *self.values.borrow().get(&offset).unwrap_or(&0)
    }
    fn write32(&self, offset : u32, value : u32) {
      self.values.borrow_mut().insert(offset, value);
      self.writes.borrow_mut().push((offset, value));
    }
  }

  #[test]
  fn arm_sequence() {
    let scope = Scope::new(RecordingRegisters::new());
    scope.arm(TriggerSource::ChannelBFalling);
    assert_eq!(*scope.registers().writes.borrow(),
               vec![(CONFIG, 3), (CONFIG, 1), (TRIGGER_SOURCE, 5)]);
    assert!(scope.trigger_pending());
    scope.registers().write32(TRIGGER_SOURCE, 0);
    assert!(!scope.trigger_pending());
  }

  #[test]
  fn filter_presets() {
    let scope = Scope::new(RecordingRegisters::new());
    scope.configure_input(Decimation::De8, Equalizer::LowVoltage, Equalizer::HighVoltage, true, false);
    let r = scope.registers();
    assert_eq!(r.read32(DECIMATION), 8);
    assert_eq!(r.read32(AVERAGING), 1);
    assert_eq!(r.read32(FILTER_A + FILTER_AA), 0x7d93);
    assert_eq!(r.read32(FILTER_A + FILTER_BB), 0x437c7);
    assert_eq!(r.read32(FILTER_A + FILTER_KK), 0xd9999a);
    assert_eq!(r.read32(FILTER_A + FILTER_PP), 0x2666);
    assert_eq!(r.read32(FILTER_B + FILTER_AA), 0x4c5f);
    assert_eq!(r.read32(FILTER_B + FILTER_BB), 0x2f38b);
    assert_eq!(r.read32(FILTER_B + FILTER_KK), 0xffffff);
    assert_eq!(r.read32(FILTER_B + FILTER_PP), 0);
    scope.configure_input(Decimation::Off, Equalizer::Off, Equalizer::Off, false, false);
    assert_eq!(r.read32(AVERAGING), 0);
    assert_eq!(r.read32(FILTER_A + FILTER_AA), 0);
  }

  #[test]
  fn trigger_and_dma() {
    let scope = Scope::new(RecordingRegisters::new());
    scope.configure_trigger(-750, 750, 50, 60, 1250);
    scope.configure_dma(0x1e00_0000, 0x0100_0000, 0x1f00_0000, 0x0100_0000, 250000, 2000);
    let r = scope.registers();
    assert_eq!(r.read32(THRESHOLD_A) as i32, -750);
    assert_eq!(r.read32(HYSTERESIS_B), 60);
    assert_eq!(r.read32(LEGACY_POST_TRIGGER), LEGACY_POST_TRIGGER_SAMPLES);
    assert_eq!(r.read32(TRIGGER_DEADTIME), 1250);
    assert_eq!(r.read32(AXI_A_STOP), 0x1f00_0000);
    assert_eq!(r.read32(AXI_B_START), 0x1f00_0000);
    assert_eq!(r.read32(AXI_A_POST_TRIGGER), 248064);
    assert_eq!(r.read32(AXI_B_POST_TRIGGER), 248064);
    assert_eq!(r.read32(AXI_A_ENABLE), 1);
    assert_eq!(r.read32(AXI_B_ENABLE), 1);
  }

  #[test]
  fn pointers_per_channel() {
    let scope = Scope::new(RecordingRegisters::new());
    scope.registers().write32(AXI_A_WRITE_PTR, 0x1e00_0100);
    scope.registers().write32(AXI_B_TRIGGER_PTR, 0x1f00_0200);
    assert_eq!(scope.write_pointer(Channel::A), 0x1e00_0100);
    assert_eq!(scope.write_pointer(Channel::B), 0);
    assert_eq!(scope.trigger_pointer(Channel::B), 0x1f00_0200);
    assert_eq!(scope.dump().len(), REGISTER_TABLE.len());
  }

  #[test]
  fn dump_shows_every_register_we_write() {
    let scope = Scope::new(RecordingRegisters::new());
    scope.reset();
    scope.configure_input(Decimation::De8, Equalizer::LowVoltage, Equalizer::HighVoltage, true, true);
    scope.configure_trigger(750, 750, 50, 50, 1250);
    scope.configure_dma(0x1e00_0000, 0x0100_0000, 0x1f00_0000, 0x0100_0000, 250000, 2000);
    scope.arm(TriggerSource::Manual);
    let dumped : Vec<u32> = scope.dump().iter().map(|(_, addr, _)| *addr).collect();
    for (addr, _) in scope.registers().writes.borrow().iter() {
      assert!(dumped.contains(addr), "{:#07x} is missing in the dump", addr);
    }
    let names : Vec<&str> = scope.dump().iter().map(|(name, _, _)| *name).collect();
    assert!(names.contains(&"AXI_A_ENABLE"));
    assert!(names.contains(&"AXI_B_ENABLE"));
  }
}
