//! Putting the server together: map the hardware, allocate
//! the queues, bind the sockets and run the threads.

use std::error::Error;
use std::fmt;
use std::io;
use std::net::TcpListener;
use std::path::Path;
use std::sync::{
    Arc,
    Mutex,
};
use std::thread;
use std::time::Duration;

use combscope_lib::controller::{
    ControllerError,
    MeComController,
    TemperatureController,
};
use combscope_lib::environment::{
    EnvironmentSensor,
    IioEnvironmentSensor,
};
use combscope_lib::protocol::Channel;
use combscope_lib::settings::{
    NetworkSettings,
    SettingsError,
};
use combscope_lib::thread_control::request_stop;
use combscope_lib::{
    ScopeSettings,
    ThreadControl,
};

use crate::control::Scope;
use crate::handshake::{
    bind_listener,
    ControlChannel,
};
use crate::memory::*;
use crate::queue::{
    AcquisitionQueue,
    QueueError,
};
use crate::sim::{
    SimulatedRegisters,
    SimulatedScope,
};
use crate::threads::{
    monitoring,
    sender,
    ChannelSender,
    Reader,
};

/// Ring size of the simulated scope
pub const SIMULATED_RING_SIZE : usize = 0x0040_0000;
/// Bytes the simulated write pointer moves per poll
pub const SIMULATED_STEP      : usize = 3*16384 + 202;
/// How often the monitoring thread logs the thread states
pub const MONI_INTERVAL       : Duration = Duration::from_secs(30);

/// Anything which keeps the server from running
///
/// Each category has its own exit code.
#[derive(Debug)]
pub enum StartupError {
  Settings(SettingsError),
  MemoryMap(MemoryError),
  BufferAllocation(QueueError),
  Socket(String),
  SenderStart(String),
  Controller(ControllerError),
  /// The reader died on a poisoned queue
  Runtime(QueueError),
}

impl StartupError {
  pub fn exit_code(&self) -> i32 {
    match self {
      StartupError::MemoryMap(_)        => 2,
      StartupError::BufferAllocation(_) => 3,
      StartupError::Socket(_)           => 5,
      StartupError::SenderStart(_)      => 6,
      StartupError::Controller(_)       => 7,
      StartupError::Settings(_)         => 8,
      StartupError::Runtime(_)          => 9,
    }
  }
}

impl fmt::Display for StartupError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      StartupError::Settings(err)         => format!("Settings ({})", err),
      StartupError::MemoryMap(err)        => format!("MemoryMap ({})", err),
      StartupError::BufferAllocation(err) => format!("BufferAllocation ({})", err),
      StartupError::Socket(why)           => format!("Socket ({})", why),
      StartupError::SenderStart(why)      => format!("SenderStart ({})", why),
      StartupError::Controller(err)       => format!("Controller ({})", err),
      StartupError::Runtime(err)          => format!("Runtime ({})", err),
    };
    write!(f, "<StartupError: {}>", etype)
  }
}

impl Error for StartupError {
}

fn bind(address : &str, port : u16) -> Result<TcpListener, StartupError> {
  match bind_listener(address, port) {
    Err(err) => {
      error!("Unable to bind {address}:{port}! {err}");
      Err(StartupError::Socket(format!("{address}:{port}: {err}")))
    }
    Ok(listener) => Ok(listener)
  }
}

/// Everything the server consists of
///
/// Built once at startup, then handed over to
/// the threads by [`SystemContext::run`].
pub struct SystemContext<R : RegisterAccess> {
  pub settings       : ScopeSettings,
  pub scope          : Scope<R>,
  pub ring_a         : DmaRing,
  pub ring_b         : DmaRing,
  pub queue_a        : Arc<AcquisitionQueue>,
  pub queue_b        : Arc<AcquisitionQueue>,
  pub listener_a     : TcpListener,
  pub listener_b     : TcpListener,
  pub control        : ControlChannel,
  pub controller     : Option<Box<dyn TemperatureController + Send>>,
  pub sensor         : Option<Box<dyn EnvironmentSensor + Send>>,
  pub thread_control : Arc<Mutex<ThreadControl>>,
}

impl SystemContext<RegisterBlock> {
  /// Map registers and rings of the FPGA
  pub fn on_hardware(settings       : ScopeSettings,
                     thread_control : Arc<Mutex<ThreadControl>>)
    -> Result<Self, StartupError> {
    let registers = RegisterBlock::map().map_err(StartupError::MemoryMap)?;
    let ring_a    = DmaRing::map(RAM_A_ADDRESS, RAM_A_SIZE).map_err(StartupError::MemoryMap)?;
    let ring_b    = DmaRing::map(RAM_B_ADDRESS, RAM_B_SIZE).map_err(StartupError::MemoryMap)?;
    Self::new(settings, registers, ring_a, ring_b, thread_control)
  }
}

impl SystemContext<SimulatedRegisters> {
  /// A scope without FPGA, see `sim.rs`
  pub fn simulated(settings       : ScopeSettings,
                   thread_control : Arc<Mutex<ThreadControl>>)
    -> Result<Self, StartupError> {
    warn!("Using the simulated scope, no data comes from the FPGA!");
    let sim = SimulatedScope::new(SIMULATED_RING_SIZE, SIMULATED_STEP);
    Self::new(settings, sim.registers, sim.ring_a, sim.ring_b, thread_control)
  }
}

impl<R : RegisterAccess> SystemContext<R> {
  /// Check the settings against the rings, allocate
  /// the queues and bind all sockets
  pub fn new(settings       : ScopeSettings,
             registers      : R,
             ring_a         : DmaRing,
             ring_b         : DmaRing,
             thread_control : Arc<Mutex<ThreadControl>>) -> Result<Self, StartupError> {
    settings.validate(ring_a.size().min(ring_b.size())).map_err(StartupError::Settings)?;
    let bytes   = settings.acquisition.acquisition_bytes();
    let queue_a = AcquisitionQueue::new(Channel::A, bytes).map_err(StartupError::BufferAllocation)?;
    let queue_b = AcquisitionQueue::new(Channel::B, bytes).map_err(StartupError::BufferAllocation)?;
    let net        = &settings.network;
    let listener_a = bind(&net.bind_address, net.port_a)?;
    let listener_b = bind(&net.bind_address, net.port_b)?;
    let control    = ControlChannel::new(bind(&net.bind_address, net.port_ack)?,
                                         Duration::from_micros(settings.acquisition.accept_poll_us),
                                         Arc::clone(&thread_control));
    Ok(Self {
      scope          : Scope::new(registers),
      ring_a,
      ring_b,
      queue_a        : Arc::new(queue_a),
      queue_b        : Arc::new(queue_b),
      listener_a,
      listener_b,
      control,
      controller     : None,
      sensor         : None,
      thread_control,
      settings,
    })
  }

  pub fn with_controller(mut self, controller : Box<dyn TemperatureController + Send>) -> Self {
    self.controller = Some(controller);
    self
  }

  pub fn with_sensor(mut self, sensor : Box<dyn EnvironmentSensor + Send>) -> Self {
    self.sensor = Some(sensor);
    self
  }

  /// Open the temperature controller and the environment
  /// sensor, if the settings ask for them
  pub fn connect_peripherals(mut self) -> Result<Self, StartupError> {
    if self.settings.controller.enabled {
      let mut mecom = MeComController::open_serial(&self.settings.controller)
        .map_err(StartupError::Controller)?;
      mecom.init(self.settings.controller.use_builtin_pid).map_err(StartupError::Controller)?;
      self.controller = Some(Box::new(mecom));
    } else {
      info!("Running without temperature controller");
    }
    if self.settings.environment.enabled {
      let device = Path::new(&self.settings.environment.iio_device);
      info!("Reading the environment from {}", device.display());
      self.sensor = Some(Box::new(IioEnvironmentSensor::new(device)));
    }
    Ok(self)
  }

  /// The network settings with the ports we actually got
  pub fn bound_network(&self) -> io::Result<NetworkSettings> {
    let mut net  = self.settings.network.clone();
    net.port_a   = self.listener_a.local_addr()?.port();
    net.port_b   = self.listener_b.local_addr()?.port();
    net.port_ack = self.control.local_addr()?.port();
    Ok(net)
  }

  /// Configure the scope, start senders and monitoring
  /// and run the reader on this thread until it ends
  ///
  /// Returns the number of acquisitions.
  pub fn run(self) -> Result<u64, StartupError> {
    let SystemContext {
      settings,
      scope,
      ring_a,
      ring_b,
      queue_a,
      queue_b,
      listener_a,
      listener_b,
      control,
      controller,
      sensor,
      thread_control,
    } = self;
    scope.apply_settings(&settings, &ring_a, &ring_b);
    info!("Scope configured, {} samples per acquisition ({} before the trigger)",
          settings.acquisition.acquisition_length, settings.acquisition.pre_trigger_length);
    // the reader must not start the first
    // acquisition before the senders count as alive
    match thread_control.lock() {
      Ok(mut tc) => {
        tc.thread_sender_a_active = true;
        tc.thread_sender_b_active = true;
      }
      Err(err) => error!("Can't acquire lock for ThreadControl! {err}"),
    }

    let acq = &settings.acquisition;
    let (summary_send, summary_recv) = crossbeam_channel::bounded(16);
    let mut workers = Vec::<thread::JoinHandle<()>>::new();
    for (name, queue, listener) in [("sender-a", &queue_a, listener_a),
                                    ("sender-b", &queue_b, listener_b)] {
      let ctx = ChannelSender {
        queue          : Arc::clone(queue),
        listener,
        send_block     : acq.send_block_size,
        poll_interval  : Duration::from_micros(acq.poll_interval_us),
        accept_poll    : Duration::from_micros(acq.accept_poll_us),
        thread_control : Arc::clone(&thread_control),
      };
      let summaries = summary_send.clone();
      match thread::Builder::new().name(name.into()).spawn(move || sender(ctx, summaries)) {
        Err(err) => {
          error!("Unable to start {name}! {err}");
          request_stop(&thread_control);
          for handle in workers {
            let _ = handle.join();
          }
          return Err(StartupError::SenderStart(format!("{name}: {err}")));
        }
        Ok(handle) => workers.push(handle),
      }
    }
    drop(summary_send);

    let moni_tc = Arc::clone(&thread_control);
    match thread::Builder::new()
      .name("monitoring".into())
      .spawn(move || monitoring(&summary_recv, MONI_INTERVAL, moni_tc)) {
      Err(err)   => warn!("Unable to start monitoring thread! {err}"),
      Ok(handle) => workers.push(handle),
    }

    let mut reader = Reader::new(scope,
                                 ring_a,
                                 ring_b,
                                 queue_a,
                                 queue_b,
                                 control,
                                 &settings,
                                 Arc::clone(&thread_control));
    if let Some(controller) = controller {
      reader = reader.with_controller(controller);
    }
    if let Some(sensor) = sensor {
      reader = reader.with_sensor(sensor);
    }
    let result = reader.run();

    request_stop(&thread_control);
    for handle in workers {
      if let Err(err) = handle.join() {
        error!("A thread panicked! {err:?}");
      }
    }
    match thread_control.lock() {
      Ok(tc)   => debug!("{}", tc),
      Err(err) => error!("Can't acquire lock for ThreadControl! {err}"),
    }
    result.map_err(StartupError::Runtime)
  }
}
