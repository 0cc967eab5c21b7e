//! A client for the acquisition server
//!
//! Runs a number of acquisitions, stepping the setpoint
//! after each one, and prints what came back. The
//! samples can be written to a file for a quick look.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::exit;
use std::thread;

#[macro_use] extern crate log;

use clap::Parser;

use combscope_lib::client::ScopeClient;
use combscope_lib::init_env_logger;
use combscope_lib::protocol::{
    Channel,
    Command,
};
use combscope_lib::settings::{
    NetworkSettings,
    SAMPLE_SIZE,
};

#[derive(Parser, Debug)]
#[command(version, about = "Take acquisitions from a combscope server", long_about = None)]
struct Args {
  /// Address of the server
  #[arg(long, default_value = "127.0.0.1")]
  host: String,
  /// Samples per channel and acquisition, has to match the server
  #[arg(short, long, default_value_t = 250000)]
  acquisition_length: usize,
  /// Number of acquisitions
  #[arg(short, long, default_value_t = 1)]
  n_acquisitions: usize,
  /// Setpoint for the first acquisition
  #[arg(long, default_value_t = 25.0)]
  setpoint: f32,
  /// Added to the setpoint after each acquisition
  #[arg(long, default_value_t = 0.0)]
  step: f32,
  /// The server reads an environment sensor
  #[arg(long, default_value_t = false)]
  environment: bool,
  /// Append the raw samples of both channels here
  #[arg(short, long)]
  output: Option<PathBuf>,
}

fn main() {
  init_env_logger("info");
  let args    = Args::parse();
  let network = NetworkSettings::new();
  let bytes   = args.acquisition_length*SAMPLE_SIZE;
  let client  = ScopeClient::new(&args.host, &network, bytes, args.environment);
  let mut output = match &args.output {
    None       => None,
    Some(path) => match File::create(path) {
      Err(err) => {
        error!("Unable to create {}! {err}", path.display());
        exit(1);
      }
      Ok(f) => Some(f)
    }
  };

  let mut setpoint = args.setpoint;
  if let Err(err) = client.send_command(&Command::continue_with("GO", setpoint)) {
    error!("Unable to start! {err}");
    exit(1);
  }
  for n in 0..args.n_acquisitions {
    let mut channels = Vec::new();
    thread::scope(|s| {
      let client = &client;
      let handles : Vec<_> = [Channel::A, Channel::B].into_iter()
        .map(|ch| s.spawn(move || client.receive_channel(ch).map_err(|e| e.to_string())))
        .collect();
      for handle in handles {
        channels.push(handle.join());
      }
    });
    for (ch, samples) in [Channel::A, Channel::B].iter().zip(channels) {
      match samples {
        Err(_)          => error!("Receiving channel {ch} panicked!"),
        Ok(Err(err))    => error!("Receiving channel {ch} failed! {err}"),
        Ok(Ok(samples)) => {
          println!("=> Acquisition {n}, channel {ch}: {} bytes", samples.len());
          if let Some(f) = output.as_mut() {
            if let Err(err) = f.write_all(&samples) {
              error!("Unable to write samples! {err}");
            }
          }
        }
      }
    }
    match client.read_report() {
      Err(err)   => error!("No report! {err}"),
      Ok(report) => println!("=> {report}"),
    }
    setpoint += args.step;
    let command = if n + 1 == args.n_acquisitions {
      Command::stop()
    } else {
      Command::continue_with("GO", setpoint)
    };
    if let Err(err) = client.send_command(&command) {
      error!("Unable to send {command}! {err}");
      exit(1);
    }
  }
}
