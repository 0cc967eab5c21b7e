//! Environmental sensor readout (temperature, pressure, humidity)
//!
//! The sensor is a BME280 which the kernel exposes through
//! the industrial IO (IIO) subsystem, so reading it boils down
//! to reading a few sysfs files.

use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{
    Path,
    PathBuf,
};

#[derive(Debug)]
pub enum SensorError {
  Io(String),
  ValueNotParseable(String),
}

impl fmt::Display for SensorError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      SensorError::Io(what)                => format!("Io ({})", what),
      SensorError::ValueNotParseable(what) => format!("ValueNotParseable ({})", what),
    };
    write!(f, "<SensorError: {}>", etype)
  }
}

impl Error for SensorError {
}

/// One set of environment readings
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct EnvironmentReading {
  /// [deg C]
  pub temperature : f32,
  /// [hPa]
  pub pressure    : f32,
  /// [%RH]
  pub humidity    : f32,
}

impl EnvironmentReading {
  pub fn new() -> Self {
    Self::default()
  }
}

impl fmt::Display for EnvironmentReading {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<EnvironmentReading: T {:.2} C, p {:.2} hPa, RH {:.2} %>",
           self.temperature, self.pressure, self.humidity)
  }
}

/// Anything which can give us temperature,
/// pressure and humidity
pub trait EnvironmentSensor {
  fn read(&mut self) -> Result<EnvironmentReading, SensorError>;
}

/// A BME280 (or compatible) behind the Linux IIO sysfs interface
pub struct IioEnvironmentSensor {
  device : PathBuf,
}

impl IioEnvironmentSensor {
  pub fn new(device : &Path) -> Self {
    Self {
      device : device.to_path_buf(),
    }
  }

  fn read_channel(&self, channel : &str) -> Result<f32, SensorError> {
    let path = self.device.join(channel);
    let content = match fs::read_to_string(&path) {
      Err(err) => return Err(SensorError::Io(format!("{}: {}", path.display(), err))),
      Ok(content) => content,
    };
    match content.trim().parse::<f32>() {
      Err(_) => Err(SensorError::ValueNotParseable(format!("{}: '{}'", path.display(), content.trim()))),
      Ok(value) => Ok(value),
    }
  }
}

impl EnvironmentSensor for IioEnvironmentSensor {
  fn read(&mut self) -> Result<EnvironmentReading, SensorError> {
    // IIO units are milli deg C, kPa and milli %RH
    let temperature = self.read_channel("in_temp_input")?/1000.0;
    let pressure    = self.read_channel("in_pressure_input")?*10.0;
    let humidity    = self.read_channel("in_humidityrelative_input")?/1000.0;
    Ok(EnvironmentReading {
      temperature,
      pressure,
      humidity,
    })
  }
}

#[cfg(test)]
mod test_environment {
  use super::*;
  use std::env;

  fn fake_device(name : &str, temp : &str, press : &str, hum : &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("combscope-iio-{}-{}", name, std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("in_temp_input"), temp).unwrap();
    fs::write(dir.join("in_pressure_input"), press).unwrap();
    fs::write(dir.join("in_humidityrelative_input"), hum).unwrap();
    dir
  }

  #[test]
  fn reads_and_scales_iio_values() {
    let dir = fake_device("good", "23450\n", "101.325\n", "45123\n");
    let mut sensor = IioEnvironmentSensor::new(&dir);
    let reading = sensor.read().unwrap();
    assert!((reading.temperature - 23.45).abs() < 1e-3);
    assert!((reading.pressure - 1013.25).abs() < 1e-2);
    assert!((reading.humidity - 45.123).abs() < 1e-3);
    fs::remove_dir_all(dir).unwrap();
  }

  #[test]
  fn garbage_is_an_error() {
    let dir = fake_device("bad", "not a number", "101.3", "45000");
    let mut sensor = IioEnvironmentSensor::new(&dir);
    assert!(sensor.read().is_err());
    fs::remove_dir_all(dir).unwrap();
  }

  #[test]
  fn missing_device_is_an_error() {
    let mut sensor = IioEnvironmentSensor::new(Path::new("/this/does/not/exist"));
    assert!(matches!(sensor.read(), Err(SensorError::Io(_))));
  }
}
