//! The reader is the heart of the server. It arms the
//! scope, waits for the trigger, moves the acquisition
//! out of the DMA rings into the queues of the senders
//! and talks to the client over the control channel.
//!
//! States:
//!
//! WaitHandshake -> ArmAndWaitTrigger -> Draining -> ReportAndWaitAck
//!                        ^                                 |
//!                        +---------------------------------+
//!
//! Each state can go to Terminated, either because the
//! client sent the stop token or because the stop flag
//! was set.

use std::fmt;
use std::sync::{
    Arc,
    Mutex,
};
use std::thread;
use std::time::Duration;

use chrono::Utc;

use combscope_lib::circular;
use combscope_lib::controller::TemperatureController;
use combscope_lib::environment::{
    EnvironmentReading,
    EnvironmentSensor,
};
use combscope_lib::protocol::{
    AcquisitionReport,
    Channel,
};
use combscope_lib::settings::{
    AcquisitionSettings,
    ScopeSettings,
    TriggerSource,
    SAMPLE_SIZE,
};
use combscope_lib::thread_control::stop_requested;
use combscope_lib::ThreadControl;

use crate::control::Scope;
use crate::handshake::ControlChannel;
use crate::memory::{
    DmaRing,
    RegisterAccess,
};
use crate::queue::{
    AcquisitionQueue,
    QueueError,
};

/// When is there enough data in the ring to drain a block
///
/// The historical behaviour wants one byte more than the
/// block for channel B. Uniform treats both channels alike.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DrainCondition {
  Historical,
  Uniform,
}

impl DrainCondition {
  pub fn from_settings(acquisition : &AcquisitionSettings) -> Self {
    if acquisition.uniform_drain {
      DrainCondition::Uniform
    } else {
      DrainCondition::Historical
    }
  }

  /// # Arguments
  ///
  /// * available : bytes between our position and the write pointer
  /// * length    : bytes we want to drain
  pub fn block_available(&self, channel : Channel, available : usize, length : usize) -> bool {
    match (self, channel) {
      (DrainCondition::Historical, Channel::B) => available > length,
      _                                        => available >= length,
    }
  }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ReaderState {
  WaitHandshake,
  ArmAndWaitTrigger,
  Draining,
  ReportAndWaitAck,
  Terminated,
}

impl fmt::Display for ReaderState {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<ReaderState: {:?}>", self)
  }
}

/// Progress of one channel within one acquisition
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ChannelDrain {
  pub channel      : Channel,
  /// next ring offset to drain from
  pub start        : usize,
  /// waiting for the sender to hand the queue back
  pub first        : bool,
  /// queue is ours, drain as soon as data is there
  pub ready        : bool,
  /// last seen write pointer, as ring offset
  pub write_offset : usize,
}

impl ChannelDrain {
  pub fn new(channel : Channel, start : usize, sender_alive : bool) -> Self {
    Self {
      channel,
      start,
      first        : sender_alive,
      ready        : false,
      write_offset : start,
    }
  }

  pub fn is_done(&self) -> bool {
    !self.first && !self.ready
  }
}

/// Everything which belongs to one trigger
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AcquisitionCycle {
  /// ms since the epoch when we saw the trigger
  pub timestamp_ms : u64,
  pub a            : ChannelDrain,
  pub b            : ChannelDrain,
}

/// Move one block from the ring into the queue and publish it
fn drain_block(queue    : &AcquisitionQueue,
               ring     : &DmaRing,
               drain    : &mut ChannelDrain,
               read_pos : usize,
               length   : usize) -> Result<(), QueueError> {
  let start = drain.start;
  queue.fill(read_pos, length, |dst| circular::copy_out(dst, ring.bytes(), start, length))?;
  drain.start = circular::add(drain.start, length, ring.size());
  if read_pos + length >= queue.capacity() {
    drain.ready = false;
  }
  let mut cursor = queue.lock()?;
  if *cursor == read_pos {
    *cursor += length;
  } else {
    warn!("Cursor of channel {} moved from {} to {} while draining, giving up on this acquisition!",
          drain.channel, read_pos, *cursor);
    drain.ready = false;
  }
  Ok(())
}

/// The trigger/readout state machine with everything it owns
pub struct Reader<R : RegisterAccess> {
  scope           : Scope<R>,
  ring_a          : DmaRing,
  ring_b          : DmaRing,
  queue_a         : Arc<AcquisitionQueue>,
  queue_b         : Arc<AcquisitionQueue>,
  control         : ControlChannel,
  controller      : Option<Box<dyn TemperatureController + Send>>,
  sensor          : Option<Box<dyn EnvironmentSensor + Send>>,
  acquisition     : AcquisitionSettings,
  trigger_source  : TriggerSource,
  use_builtin_pid : bool,
  manual_voltage  : f32,
  condition       : DrainCondition,
  thread_control  : Arc<Mutex<ThreadControl>>,
  // the last values we got, reported again if a readout fails
  temperature     : f32,
  environment     : EnvironmentReading,
  target          : Option<f32>,
  last_applied    : Option<f32>,
}

impl<R : RegisterAccess> Reader<R> {
  pub fn new(scope          : Scope<R>,
             ring_a         : DmaRing,
             ring_b         : DmaRing,
             queue_a        : Arc<AcquisitionQueue>,
             queue_b        : Arc<AcquisitionQueue>,
             control        : ControlChannel,
             settings       : &ScopeSettings,
             thread_control : Arc<Mutex<ThreadControl>>) -> Self {
    Self {
      scope,
      ring_a,
      ring_b,
      queue_a,
      queue_b,
      control,
      controller      : None,
      sensor          : None,
      acquisition     : settings.acquisition.clone(),
      trigger_source  : settings.trigger.source,
      use_builtin_pid : settings.controller.use_builtin_pid,
      manual_voltage  : settings.controller.manual_voltage,
      condition       : DrainCondition::from_settings(&settings.acquisition),
      thread_control,
      temperature     : 0.0,
      environment     : EnvironmentReading::new(),
      target          : None,
      last_applied    : None,
    }
  }

  pub fn with_controller(mut self, controller : Box<dyn TemperatureController + Send>) -> Self {
    self.controller = Some(controller);
    self
  }

  pub fn with_sensor(mut self, sensor : Box<dyn EnvironmentSensor + Send>) -> Self {
    self.sensor = Some(sensor);
    self
  }

  pub fn scope(&self) -> &Scope<R> {
    &self.scope
  }

  pub fn queue(&self, channel : Channel) -> &AcquisitionQueue {
    match channel {
      Channel::A => &self.queue_a,
      Channel::B => &self.queue_b,
    }
  }

  fn poll_interval(&self) -> Duration {
    Duration::from_micros(self.acquisition.poll_interval_us)
  }

  fn senders_alive(&self) -> (bool, bool) {
    match self.thread_control.lock() {
      Ok(tc) => (tc.thread_sender_a_active, tc.thread_sender_b_active),
      Err(err) => {
        error!("Can't acquire lock for ThreadControl! {err}");
        (false, false)
      }
    }
  }

  /// Wait until both senders handed their queue back
  ///
  /// A channel whose sender is gone does not hold us up.
  /// Returns false if the stop flag was set.
  pub fn wait_for_empty_queues(&self) -> Result<bool, QueueError> {
    loop {
      let (alive_a, alive_b) = self.senders_alive();
      let empty_a = !alive_a || self.queue_a.cursor()? == 0;
      let empty_b = !alive_b || self.queue_b.cursor()? == 0;
      if empty_a && empty_b {
        return Ok(true);
      }
      if stop_requested(&self.thread_control) {
        return Ok(false);
      }
      thread::sleep(self.poll_interval());
    }
  }

  /// Arm the scope and wait for the trigger
  ///
  /// Returns the time of the trigger in ms since the
  /// epoch, or None if the stop flag was set.
  pub fn arm_and_wait(&self) -> Option<u64> {
    self.scope.arm(self.trigger_source);
    while self.scope.trigger_pending() {
      if stop_requested(&self.thread_control) {
        self.scope.disarm();
        return None;
      }
      thread::sleep(self.poll_interval());
    }
    Some(Utc::now().timestamp_millis() as u64)
  }

  /// Where streaming out starts for both channels
  pub fn start_cycle(&self, timestamp_ms : u64) -> AcquisitionCycle {
    let pre = self.acquisition.pre_trigger_length*SAMPLE_SIZE;
    let (alive_a, alive_b) = self.senders_alive();
    let trig_a  = self.ring_a.to_ring_offset(self.scope.trigger_pointer(Channel::A));
    let trig_b  = self.ring_b.to_ring_offset(self.scope.trigger_pointer(Channel::B));
    let start_a = circular::sub(trig_a, pre, self.ring_a.size());
    let start_b = circular::sub(trig_b, pre, self.ring_b.size());
    trace!("Trigger at A {trig_a:#x} B {trig_b:#x}, start at A {start_a:#x} B {start_b:#x}");
    AcquisitionCycle {
      timestamp_ms,
      a : ChannelDrain::new(Channel::A, start_a, alive_a),
      b : ChannelDrain::new(Channel::B, start_b, alive_b),
    }
  }

  /// Move one acquisition of both channels into the queues
  ///
  /// Returns once both channels are done, or false
  /// if the stop flag was set in the meantime.
  pub fn drain(&self, cycle : &mut AcquisitionCycle) -> Result<bool, QueueError> {
    let block = self.acquisition.read_block_size;
    let mut did_something = true;
    loop {
      if !did_something {
        if stop_requested(&self.thread_control) {
          return Ok(false);
        }
        thread::sleep(self.poll_interval());
      }
      did_something = false;
      for (drain, queue, ring) in [(&mut cycle.a, &self.queue_a, &self.ring_a),
                                   (&mut cycle.b, &self.queue_b, &self.ring_b)] {
        let read_pos = queue.cursor()?;
        if drain.first && read_pos == 0 {
          drain.first = false;
          drain.ready = true;
        }
        drain.write_offset = ring.to_ring_offset(self.scope.write_pointer(drain.channel));
        if !drain.ready {
          continue;
        }
        let total  = queue.capacity();
        let length = if read_pos + block <= total {block} else {total - read_pos};
        let available = circular::distance(drain.start, drain.write_offset, ring.size());
        if self.condition.block_available(drain.channel, available, length) {
          drain_block(queue, ring, drain, read_pos, length)?;
          did_something = true;
        }
      }
      if cycle.a.is_done() && cycle.b.is_done() {
        return Ok(true);
      }
    }
  }

  /// Ask the controller and the sensor what they have to say
  ///
  /// Failures keep the values from before.
  fn read_metadata(&mut self) {
    if let Some(controller) = self.controller.as_mut() {
      match controller.get_object_temperature() {
        Err(err)        => error!("Unable to read object temperature! {err}"),
        Ok(temperature) => self.temperature = temperature,
      }
      if !self.use_builtin_pid {
        match controller.get_live_voltage_current() {
          Err(err)               => error!("Unable to read output voltage and current! {err}"),
          Ok((voltage, current)) => debug!("Controller output {voltage:.3} V, {current:.3} A"),
        }
      }
    }
    if let Some(sensor) = self.sensor.as_mut() {
      match sensor.read() {
        Err(err)    => error!("Unable to read the environment sensor! {err}"),
        Ok(reading) => self.environment = reading,
      }
    }
  }

  fn report(&self, cycle : &AcquisitionCycle) -> AcquisitionReport {
    AcquisitionReport {
      timestamp_ms : cycle.timestamp_ms,
      temperature  : self.temperature,
      environment  : self.sensor.as_ref().map(|_| self.environment),
    }
  }

  /// Push a new target to the controller
  ///
  /// Temperature in PID mode, otherwise the current
  /// at the configured drive voltage.
  fn apply_setpoint(&mut self, setpoint : f32) {
    let controller = match self.controller.as_mut() {
      None => {
        info!("No temperature controller, setpoint {setpoint} is not applied");
        return;
      }
      Some(controller) => controller
    };
    let result = if self.use_builtin_pid {
      controller.set_object_temperature(setpoint)
    } else {
      controller.set_live_voltage_current(self.manual_voltage, setpoint)
    };
    match result {
      Err(err) => error!("Unable to apply setpoint {setpoint}! {err}"),
      Ok(_)    => info!("Applied setpoint {setpoint}"),
    }
  }

  fn finish_acquisition(&self) {
    match self.thread_control.lock() {
      Ok(mut tc) => tc.n_acquisitions += 1,
      Err(err)   => error!("Can't acquire lock for ThreadControl! {err}"),
    }
  }

  fn set_active(&self, active : bool) {
    match self.thread_control.lock() {
      Ok(mut tc) => tc.thread_reader_active = active,
      Err(err)   => error!("Can't acquire lock for ThreadControl! {err}"),
    }
  }

  fn step(&mut self,
          state : ReaderState,
          cycle : &mut Option<AcquisitionCycle>) -> Result<ReaderState, QueueError> {
    let next = match state {
      ReaderState::WaitHandshake => {
        match self.control.receive_command() {
          None => ReaderState::Terminated,
          Some(command) if command.is_stop() => {
            info!("Client stopped before the first acquisition");
            ReaderState::Terminated
          }
          Some(command) => {
            // nothing applied yet, the first acknowledge pushes it
            self.target = command.setpoint;
            ReaderState::ArmAndWaitTrigger
          }
        }
      }
      ReaderState::ArmAndWaitTrigger => {
        if !self.wait_for_empty_queues()? {
          return Ok(ReaderState::Terminated);
        }
        match self.arm_and_wait() {
          None => ReaderState::Terminated,
          Some(timestamp_ms) => {
            self.read_metadata();
            *cycle = Some(self.start_cycle(timestamp_ms));
            ReaderState::Draining
          }
        }
      }
      ReaderState::Draining => {
        match cycle.as_mut() {
          None => ReaderState::ArmAndWaitTrigger,
          Some(c) => {
            if self.drain(c)? {
              self.finish_acquisition();
              ReaderState::ReportAndWaitAck
            } else {
              ReaderState::Terminated
            }
          }
        }
      }
      ReaderState::ReportAndWaitAck => {
        let report = match cycle.take() {
          None    => AcquisitionReport::new(),
          Some(c) => self.report(&c),
        };
        if !self.control.send_report(&report) {
          return Ok(ReaderState::Terminated);
        }
        match self.control.receive_command() {
          None => ReaderState::Terminated,
          Some(command) if command.is_stop() => ReaderState::Terminated,
          Some(command) => {
            if command.setpoint.is_some() {
              self.target = command.setpoint;
            }
            if let Some(setpoint) = self.target {
              if self.target != self.last_applied {
                self.apply_setpoint(setpoint);
                self.last_applied = self.target;
              }
            }
            thread::sleep(Duration::from_micros(self.acquisition.loop_delay_us));
            ReaderState::ArmAndWaitTrigger
          }
        }
      }
      ReaderState::Terminated => ReaderState::Terminated,
    };
    Ok(next)
  }

  /// Run the state machine until the client or
  /// the stop flag ends it
  ///
  /// Returns the number of finished acquisitions. A
  /// poisoned queue lock ends the reader with an error.
  pub fn run(&mut self) -> Result<u64, QueueError> {
    self.set_active(true);
    let mut state = ReaderState::WaitHandshake;
    let mut cycle = None;
    let mut n_acquisitions = 0u64;
    let result = loop {
      let next = match self.step(state, &mut cycle) {
        Err(err) => break Err(err),
        Ok(next) => next,
      };
      if next != state {
        debug!("{state} -> {next}");
      }
      if state == ReaderState::Draining && next == ReaderState::ReportAndWaitAck {
        n_acquisitions += 1;
      }
      if next == ReaderState::Terminated {
        break Ok(n_acquisitions);
      }
      state = next;
    };
    self.scope.disarm();
    self.set_active(false);
    info!("Reader finished after {n_acquisitions} acquisitions");
    result
  }
}

#[cfg(test)]
mod test_reader {
  use super::*;
  use rand::Rng;
  use crate::handshake::{
    bind_listener,
    ControlChannel,
  };
  use crate::sim::SimulatedScope;

  fn reader(ring_size : usize,
            step      : usize,
            settings  : &ScopeSettings) -> Reader<crate::sim::SimulatedRegisters> {
    let sim   = SimulatedScope::new(ring_size, step);
    let tc    = Arc::new(Mutex::new(ThreadControl::new()));
    let bytes = settings.acquisition.acquisition_bytes();
    let qa    = Arc::new(AcquisitionQueue::new(Channel::A, bytes).unwrap());
    let qb    = Arc::new(AcquisitionQueue::new(Channel::B, bytes).unwrap());
    let ctrl  = ControlChannel::new(bind_listener("127.0.0.1", 0).unwrap(),
                                    Duration::from_millis(1),
                                    Arc::clone(&tc));
    let scope = Scope::new(sim.registers);
    scope.apply_settings(settings, &sim.ring_a, &sim.ring_b);
    {
      let mut tc = tc.lock().unwrap();
      tc.thread_sender_a_active = true;
      tc.thread_sender_b_active = true;
    }
    Reader::new(scope, sim.ring_a, sim.ring_b, qa, qb, ctrl, settings, tc)
  }

  fn settings(acquisition_length : usize, pre : usize, block : usize) -> ScopeSettings {
    let mut settings = ScopeSettings::new();
    settings.acquisition.acquisition_length = acquisition_length;
    settings.acquisition.pre_trigger_length = pre;
    settings.acquisition.read_block_size    = block;
    settings.acquisition.poll_interval_us   = 1;
    settings
  }

  /// What the queue of a channel has to hold after a drain
  fn expected(ring : &DmaRing, start : usize, length : usize) -> Vec<u8> {
    let mut out = vec![0u8;length];
    circular::copy_out(&mut out, ring.bytes(), start, length);
    out
  }

  fn queue_content(queue : &AcquisitionQueue) -> Vec<u8> {
    let mut out = vec![0u8;queue.capacity()];
    queue.read_into(0, &mut out).unwrap();
    out
  }

  /// Arm, wait, drain and check that both queues hold
  /// exactly the ring content from the start offset on,
  /// then hand the queues back like a sender would
  fn acquire_and_check(reader : &Reader<crate::sim::SimulatedRegisters>) {
    assert!(reader.wait_for_empty_queues().unwrap());
    let timestamp = reader.arm_and_wait().unwrap();
    let mut cycle = reader.start_cycle(timestamp);
    let start_a = cycle.a.start;
    let start_b = cycle.b.start;
    assert!(reader.drain(&mut cycle).unwrap());
    assert!(cycle.a.is_done() && cycle.b.is_done());
    let total = reader.queue_a.capacity();
    assert_eq!(reader.queue_a.cursor().unwrap(), total);
    assert_eq!(reader.queue_b.cursor().unwrap(), total);
    assert_eq!(queue_content(&reader.queue_a), expected(&reader.ring_a, start_a, total));
    assert_eq!(queue_content(&reader.queue_b), expected(&reader.ring_b, start_b, total));
    // the start offset moved on by exactly one acquisition
    assert_eq!(cycle.a.start, circular::add(start_a, total, reader.ring_a.size()));
    *reader.queue_a.lock().unwrap() = 0;
    *reader.queue_b.lock().unwrap() = 0;
  }

  #[test]
  fn drain_condition() {
    let hist = DrainCondition::Historical;
    let unif = DrainCondition::Uniform;
    assert!(hist.block_available(Channel::A, 100, 100));
    assert!(!hist.block_available(Channel::B, 100, 100));
    assert!(hist.block_available(Channel::B, 101, 100));
    assert!(unif.block_available(Channel::B, 100, 100));
    assert!(!unif.block_available(Channel::A, 99, 100));
  }

  #[test]
  fn start_offset_rewinds_by_pre_trigger() {
    let reader = reader(1 << 16, 4096, &settings(4000, 500, 1024));
    let timestamp = reader.arm_and_wait().unwrap();
    let cycle = reader.start_cycle(timestamp);
    assert_eq!(cycle.a.start, crate::sim::TRIGGER_GAP - 1000);
    assert!(cycle.a.first && !cycle.a.ready);
    assert!(timestamp > 1_600_000_000_000);
  }

  #[test]
  fn blocks_dividing_the_acquisition() {
    let reader = reader(1 << 16, 3000, &settings(8192, 1000, 4096));
    acquire_and_check(&reader);
  }

  #[test]
  fn blocks_not_dividing_the_acquisition() {
    let reader = reader(1 << 16, 777, &settings(10_000, 1234, 3000));
    acquire_and_check(&reader);
  }

  #[test]
  fn acquisitions_wrap_around_the_ring() {
    // every trigger moves TRIGGER_GAP + post trigger bytes
    // down the ring, so a few rounds certainly wrap
    let reader = reader(1 << 16, 5000, &settings(12_000, 2000, 16384));
    for _ in 0..8 {
      acquire_and_check(&reader);
    }
    assert_eq!(reader.scope().registers().n_triggers(), 8);
  }

  #[test]
  fn random_block_sizes() {
    let mut rng = rand::thread_rng();
    for _ in 0..10 {
      let length = rng.gen_range(1000..20_000);
      let pre    = rng.gen_range(0..length);
      let block  = rng.gen_range(1..50_000);
      let step   = rng.gen_range(2..20_000);
      let reader = reader(1 << 17, step, &settings(length, pre, block));
      for _ in 0..3 {
        acquire_and_check(&reader);
      }
    }
  }

  #[test]
  fn uniform_drain_condition() {
    let mut s = settings(6000, 100, 2048);
    s.acquisition.uniform_drain = true;
    let reader = reader(1 << 16, 100, &s);
    acquire_and_check(&reader);
  }

  #[test]
  fn dead_sender_does_not_block() {
    let reader = reader(1 << 16, 4000, &settings(4000, 100, 1024));
    reader.thread_control.lock().unwrap().thread_sender_b_active = false;
    // a queue nobody empties
    *reader.queue_b.lock().unwrap() = 17;
    assert!(reader.wait_for_empty_queues().unwrap());
    let timestamp = reader.arm_and_wait().unwrap();
    let mut cycle = reader.start_cycle(timestamp);
    assert!(cycle.b.is_done());
    assert!(reader.drain(&mut cycle).unwrap());
    assert_eq!(reader.queue_a.cursor().unwrap(), 8000);
    assert_eq!(reader.queue_b.cursor().unwrap(), 17);
  }

  #[test]
  fn stop_flag_ends_the_barrier() {
    let reader = reader(1 << 16, 4000, &settings(4000, 100, 1024));
    *reader.queue_a.lock().unwrap() = 8;
    combscope_lib::thread_control::request_stop(&reader.thread_control);
    assert!(!reader.wait_for_empty_queues().unwrap());
    assert!(reader.arm_and_wait().is_none());
  }
}
