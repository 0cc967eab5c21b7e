//! Aggregate settings for the acquisition server
//!
//! Different sections represent different aspects
//! of the server: the acquisition itself, the scope
//! frontend, the network and the attached instruments.
//!
//! The settings can be written to and read from toml
//! files. Every field has a default, so a file only
//! needs to carry what differs.

use std::fs::File;
use std::io::{
    Read,
    Write,
};
use std::error::Error;
use std::fmt;
use std::path::Path;

extern crate toml;

/// Size of a single ADC sample in bytes
pub const SAMPLE_SIZE : usize = 2;

#[derive(Debug)]
pub enum SettingsError {
  FileNotReadable,
  FileNotWritable,
  TomlDecodingError,
  TomlEncodingError,
  Invalid(String),
}

impl fmt::Display for SettingsError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      SettingsError::FileNotReadable   => String::from("FileNotReadable"),
      SettingsError::FileNotWritable   => String::from("FileNotWritable"),
      SettingsError::TomlDecodingError => String::from("TomlDecodingError"),
      SettingsError::TomlEncodingError => String::from("TomlEncodingError"),
      SettingsError::Invalid(why)      => format!("Invalid ({})", why),
    };
    write!(f, "<SettingsError: {}>", etype)
  }
}

impl Error for SettingsError {
}

/// Hardware downsampling factor applied before
/// the samples are written to the DMA ring
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum Decimation {
  Off,
  De1,
  De8,
  De64,
  De1024,
  De8192,
  De65536,
}

impl Decimation {
  /// The value the decimation register expects
  pub fn register_value(&self) -> u32 {
    match self {
      Decimation::Off     => 0x00000,
      Decimation::De1     => 0x00001,
      Decimation::De8     => 0x00008,
      Decimation::De64    => 0x00040,
      Decimation::De1024  => 0x00400,
      Decimation::De8192  => 0x02000,
      Decimation::De65536 => 0x10000,
    }
  }
}

/// Presets for the per-channel equalization filter
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum Equalizer {
  Off,
  LowVoltage,
  HighVoltage,
}

/// What the scope triggers on
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum TriggerSource {
  Off,
  Manual,
  ChannelARising,
  ChannelAFalling,
  ChannelBRising,
  ChannelBFalling,
  ExternalRising,
  ExternalFalling,
  GeneratorRising,
  GeneratorFalling,
}

impl TriggerSource {
  /// The value the trigger source register expects
  pub fn register_value(&self) -> u32 {
    match self {
      TriggerSource::Off              => 0,
      TriggerSource::Manual           => 1,
      TriggerSource::ChannelARising   => 2,
      TriggerSource::ChannelAFalling  => 3,
      TriggerSource::ChannelBRising   => 4,
      TriggerSource::ChannelBFalling  => 5,
      TriggerSource::ExternalRising   => 6,
      TriggerSource::ExternalFalling  => 7,
      TriggerSource::GeneratorRising  => 8,
      TriggerSource::GeneratorFalling => 9,
    }
  }
}

impl fmt::Display for TriggerSource {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<TriggerSource: {:?}>", self)
  }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct AcquisitionSettings {
  /// Samples per channel and acquisition
  pub acquisition_length : usize,
  /// Samples kept from before the trigger
  pub pre_trigger_length : usize,
  /// Bytes copied out of the DMA ring per step
  pub read_block_size    : usize,
  /// Bytes handed to the socket per send call
  pub send_block_size    : usize,
  /// Sleep between two polls of a cursor or
  /// register [us]
  pub poll_interval_us   : u64,
  /// Sleep between two polls of a listening
  /// socket [us]
  pub accept_poll_us     : u64,
  /// Pause after a setpoint was applied and
  /// before the next cycle [us]
  pub loop_delay_us      : u64,
  /// Use `>=` for both channels when checking if
  /// a block is available. Historically channel B
  /// requires strictly more data than the block.
  pub uniform_drain      : bool,
}

impl AcquisitionSettings {
  pub fn new() -> Self {
    Self {
      acquisition_length : 250000,
      pre_trigger_length : 2000,
      read_block_size    : 16384,
      send_block_size    : 16384,
      poll_interval_us   : 5,
      accept_poll_us     : 1000,
      loop_delay_us      : 5,
      uniform_drain      : false,
    }
  }

  /// Bytes per channel and acquisition
  pub fn acquisition_bytes(&self) -> usize {
    self.acquisition_length*SAMPLE_SIZE
  }

  /// The number of samples the hardware keeps
  /// recording after the trigger fired
  ///
  /// The 64 extra samples make sure the write pointer
  /// runs past the end of what we stream out.
  pub fn post_trigger_samples(&self) -> u32 {
    (self.acquisition_length - self.pre_trigger_length + 64) as u32
  }
}

impl Default for AcquisitionSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct TriggerSettings {
  pub source      : TriggerSource,
  /// ADC counts, 2048 corresponds to about +0.25V
  pub threshold_a : i32,
  pub threshold_b : i32,
  pub hysteresis_a: i32,
  pub hysteresis_b: i32,
  pub deadtime    : u32,
}

impl TriggerSettings {
  pub fn new() -> Self {
    Self {
      source       : TriggerSource::ChannelBFalling,
      threshold_a  : 750,
      threshold_b  : 750,
      hysteresis_a : 50,
      hysteresis_b : 50,
      deadtime     : 1250,
    }
  }
}

impl Default for TriggerSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct InputSettings {
  pub decimation  : Decimation,
  pub equalizer_a : Equalizer,
  pub equalizer_b : Equalizer,
  pub shaping_a   : bool,
  pub shaping_b   : bool,
}

impl InputSettings {
  pub fn new() -> Self {
    Self {
      decimation  : Decimation::De8,
      equalizer_a : Equalizer::LowVoltage,
      equalizer_b : Equalizer::HighVoltage,
      shaping_a   : true,
      shaping_b   : true,
    }
  }
}

impl Default for InputSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct NetworkSettings {
  /// Local address all listeners are bound to
  pub bind_address   : String,
  /// Address of the monitoring client. Informational,
  /// we accept connections from anywhere.
  pub client_address : String,
  pub port_a         : u16,
  pub port_b         : u16,
  pub port_ack       : u16,
}

impl NetworkSettings {
  pub fn new() -> Self {
    Self {
      bind_address   : String::from("0.0.0.0"),
      client_address : String::from("10.66.101.131"),
      port_a         : 12345,
      port_b         : 12346,
      port_ack       : 12347,
    }
  }
}

impl Default for NetworkSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ControllerSettings {
  pub enabled         : bool,
  /// Let the controller run its own PID loop on the
  /// object temperature. If false, the setpoints are
  /// interpreted as drive current.
  pub use_builtin_pid : bool,
  pub serial_port     : String,
  pub baud_rate       : u32,
  pub address         : u8,
  pub instance        : u8,
  /// Drive voltage used together with the current
  /// setpoint when not in PID mode [V]
  pub manual_voltage  : f32,
  /// Serial read timeout [ms]
  pub timeout_ms      : u64,
}

impl ControllerSettings {
  pub fn new() -> Self {
    Self {
      enabled         : true,
      use_builtin_pid : true,
      serial_port     : String::from("/dev/ttyUSB0"),
      baud_rate       : 57600,
      address         : 0,
      instance        : 1,
      manual_voltage  : 3.0,
      timeout_ms      : 500,
    }
  }
}

impl Default for ControllerSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct EnvironmentSettings {
  pub enabled    : bool,
  /// sysfs directory of the IIO device
  pub iio_device : String,
}

impl EnvironmentSettings {
  pub fn new() -> Self {
    Self {
      enabled    : false,
      iio_device : String::from("/sys/bus/iio/devices/iio:device0"),
    }
  }
}

impl Default for EnvironmentSettings {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ScopeSettings {
  pub acquisition : AcquisitionSettings,
  pub trigger     : TriggerSettings,
  pub input       : InputSettings,
  pub network     : NetworkSettings,
  pub controller  : ControllerSettings,
  pub environment : EnvironmentSettings,
}

impl ScopeSettings {
  pub fn new() -> Self {
    Self {
      acquisition : AcquisitionSettings::new(),
      trigger     : TriggerSettings::new(),
      input       : InputSettings::new(),
      network     : NetworkSettings::new(),
      controller  : ControllerSettings::new(),
      environment : EnvironmentSettings::new(),
    }
  }

  /// Check that the acquisition fits the hardware
  ///
  /// # Arguments
  ///
  /// * ring_size : size of the smaller of the two DMA rings in bytes
  pub fn validate(&self, ring_size : usize) -> Result<(), SettingsError> {
    let acq = &self.acquisition;
    if acq.acquisition_length == 0 {
      return Err(SettingsError::Invalid(String::from("acquisition_length is 0")));
    }
    if acq.pre_trigger_length >= acq.acquisition_length {
      return Err(SettingsError::Invalid(format!("pre_trigger_length {} is not smaller than acquisition_length {}",
                                                acq.pre_trigger_length, acq.acquisition_length)));
    }
    // the write pointer overshoots by 64 samples
    if (acq.acquisition_length + 64)*SAMPLE_SIZE > ring_size {
      return Err(SettingsError::Invalid(format!("{} samples do not fit into a ring of {} bytes",
                                                acq.acquisition_length, ring_size)));
    }
    if acq.read_block_size == 0 || acq.send_block_size == 0 {
      return Err(SettingsError::Invalid(String::from("block sizes have to be larger than 0")));
    }
    // port 0 lets the OS pick, which never collides
    let net   = &self.network;
    let clash = |p : u16, q : u16| p != 0 && p == q;
    if clash(net.port_a, net.port_b)
    || clash(net.port_a, net.port_ack)
    || clash(net.port_b, net.port_ack) {
      return Err(SettingsError::Invalid(String::from("ports for channel a, b and ack have to differ")));
    }
    Ok(())
  }

  /// Write the settings to a toml file
  pub fn to_toml(&self, filename : &Path) -> Result<(), SettingsError> {
    let toml_string = match toml::to_string_pretty(&self) {
      Err(err) => {
        error!("Unable to serialize toml! {err}");
        return Err(SettingsError::TomlEncodingError);
      }
      Ok(toml_string) => toml_string
    };
    match File::create(filename) {
      Err(err) => {
        error!("Unable to open file {}! {}", filename.display(), err);
        Err(SettingsError::FileNotWritable)
      }
      Ok(mut file) => {
        match file.write_all(toml_string.as_bytes()) {
          Err(err) => {
            error!("Unable to write to file {}! {}", filename.display(), err);
            Err(SettingsError::FileNotWritable)
          }
          Ok(_)    => {
            debug!("Wrote settings to {}!", filename.display());
            Ok(())
          }
        }
      }
    }
  }

  /// Read settings from a toml file
  pub fn from_toml(filename : &Path) -> Result<ScopeSettings, SettingsError> {
    let mut toml_string = String::from("");
    match File::open(filename) {
      Err(err) => {
        error!("Unable to open {}! {}", filename.display(), err);
        return Err(SettingsError::FileNotReadable);
      }
      Ok(mut file) => {
        if let Err(err) = file.read_to_string(&mut toml_string) {
          error!("Unable to read {}! {}", filename.display(), err);
          return Err(SettingsError::FileNotReadable);
        }
      }
    }
    Self::from_toml_str(&toml_string)
  }

  pub fn from_toml_str(toml_string : &str) -> Result<ScopeSettings, SettingsError> {
    match toml::from_str(toml_string) {
      Err(err) => {
        error!("Can't interpret toml! {}", err);
        Err(SettingsError::TomlDecodingError)
      }
      Ok(settings) => Ok(settings)
    }
  }
}

impl Default for ScopeSettings {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for ScopeSettings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp : String;
    match toml::to_string(self) {
      Err(err) => {
        error!("Deserialization error! {err}");
        disp = String::from("-- DESERIALIZATION ERROR! --");
      }
      Ok(_disp) => {
        disp = _disp;
      }
    }
    write!(f, "<ScopeSettings :\n{}>", disp)
  }
}

#[cfg(test)]
mod test_settings {
  use super::*;

  const RING : usize = 0x0100_0000;

  #[test]
  fn defaults_are_valid() {
    let settings = ScopeSettings::new();
    assert!(settings.validate(RING).is_ok());
  }

  #[test]
  fn toml_representation_reads_back() {
    let settings = ScopeSettings::new();
    let toml_string = toml::to_string_pretty(&settings).unwrap();
    let back = ScopeSettings::from_toml_str(&toml_string).unwrap();
    assert_eq!(back, settings);
  }

  #[test]
  fn partial_toml_falls_back_to_defaults() {
    let partial = "
      [acquisition]
      acquisition_length = 20000

      [trigger]
      source = \"ChannelAFalling\"
    ";
    let settings = ScopeSettings::from_toml_str(partial).unwrap();
    assert_eq!(settings.acquisition.acquisition_length, 20000);
    assert_eq!(settings.acquisition.pre_trigger_length, 2000);
    assert_eq!(settings.trigger.source, TriggerSource::ChannelAFalling);
    assert_eq!(settings.network.port_ack, 12347);
  }

  #[test]
  fn garbage_toml_is_rejected() {
    assert!(ScopeSettings::from_toml_str("acquisition = [").is_err());
  }

  #[test]
  fn pre_trigger_has_to_be_shorter_than_acquisition() {
    let mut settings = ScopeSettings::new();
    settings.acquisition.pre_trigger_length = settings.acquisition.acquisition_length;
    assert!(settings.validate(RING).is_err());
  }

  #[test]
  fn acquisition_has_to_fit_the_ring() {
    let mut settings = ScopeSettings::new();
    settings.acquisition.acquisition_length = RING/2;
    assert!(settings.validate(RING).is_err());
    settings.acquisition.acquisition_length = RING/2 - 64;
    assert!(settings.validate(RING).is_ok());
  }

  #[test]
  fn ports_have_to_differ_unless_picked_by_the_os() {
    let mut settings = ScopeSettings::new();
    settings.network.port_b = settings.network.port_a;
    assert!(settings.validate(RING).is_err());
    settings.network.port_a   = 0;
    settings.network.port_b   = 0;
    settings.network.port_ack = 0;
    assert!(settings.validate(RING).is_ok());
  }

  #[test]
  fn post_trigger_samples_overshoot() {
    let mut acq = AcquisitionSettings::new();
    acq.acquisition_length = 20000;
    acq.pre_trigger_length = 2000;
    assert_eq!(acq.post_trigger_samples(), 18064);
    assert_eq!(acq.acquisition_bytes(), 40000);
  }

  #[test]
  fn register_values() {
    assert_eq!(Decimation::De8.register_value(), 8);
    assert_eq!(Decimation::De65536.register_value(), 0x10000);
    assert_eq!(TriggerSource::Off.register_value(), 0);
    assert_eq!(TriggerSource::ChannelBFalling.register_value(), 5);
    assert_eq!(TriggerSource::GeneratorFalling.register_value(), 9);
  }
}
