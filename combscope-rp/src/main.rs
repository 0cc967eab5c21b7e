//! # Acquisition server for the Red Pitaya scope
//!
//! Waits for a client on the control port, then loops:
//! arm, wait for the trigger, stream both channels, report
//! and wait for the next command. Ends when the client
//! sends "END" or on SIGINT/SIGTERM.
//!
use std::path::PathBuf;
use std::process::exit;
use std::sync::{
    Arc,
    Mutex,
};
use std::thread;

#[macro_use] extern crate log;

extern crate clap;
use clap::{arg,
           command,
           Parser};

use colored::Colorize;
use signal_hook::consts::{
    SIGINT,
    SIGTERM,
};
use signal_hook::iterator::Signals;

use combscope_lib::{
    init_env_logger,
    ScopeSettings,
    ThreadControl,
    COMBSCOPE_LOGO_SHOW,
};
use combscope_lib::thread_control::request_stop;

use combscope_rp::api::{
    StartupError,
    SystemContext,
};

#[derive(Parser, Debug)]
#[command(author = "combscope developers", version, about, long_about = None)]
struct Args {
  /// Settings file (toml). Without it, the built-in
  /// defaults are used.
  #[arg(short, long)]
  config: Option<PathBuf>,
  /// Samples per channel and acquisition
  #[arg(short, long)]
  acquisition_length: Option<usize>,
  /// IP address of the monitoring computer
  #[arg(short = 'i', long)]
  client_ip: Option<String>,
  /// IP address the server binds to
  #[arg(short, long)]
  server_ip: Option<String>,
  /// Let the temperature controller run its own PID loop
  /// (true) or drive its output directly (false)
  #[arg(short = 'm', long)]
  use_builtin_pid: Option<bool>,
  /// Run without temperature controller
  #[arg(long, default_value_t = false)]
  no_controller: bool,
  /// Use the simulated scope instead of the FPGA
  #[arg(long, default_value_t = false)]
  simulate: bool,
  /// Write the effective settings to this file and exit
  #[arg(long)]
  write_config: Option<PathBuf>,
  /// More output
  #[arg(short, long, default_value_t = false)]
  verbose: bool,
}

/// Settings file and command line, the latter wins
fn load_settings(args : &Args) -> Result<ScopeSettings, StartupError> {
  let mut settings = match &args.config {
    None       => ScopeSettings::new(),
    Some(path) => ScopeSettings::from_toml(path).map_err(StartupError::Settings)?,
  };
  if let Some(length) = args.acquisition_length {
    settings.acquisition.acquisition_length = length;
  }
  if let Some(ip) = &args.client_ip {
    settings.network.client_address = ip.clone();
  }
  if let Some(ip) = &args.server_ip {
    settings.network.bind_address = ip.clone();
  }
  if let Some(pid) = args.use_builtin_pid {
    settings.controller.use_builtin_pid = pid;
  }
  if args.no_controller {
    settings.controller.enabled = false;
  }
  Ok(settings)
}

fn run(args : &Args, thread_control : Arc<Mutex<ThreadControl>>) -> Result<u64, StartupError> {
  let settings = load_settings(args)?;
  if let Some(path) = &args.write_config {
    settings.to_toml(path).map_err(StartupError::Settings)?;
    println!("=> Wrote settings to {}", path.display());
    return Ok(0);
  }
  info!("Using settings {}", settings);
  info!("Expecting the client at {}", settings.network.client_address);
  if args.simulate {
    SystemContext::simulated(settings, thread_control)?
      .connect_peripherals()?
      .run()
  } else {
    SystemContext::on_hardware(settings, thread_control)?
      .connect_peripherals()?
      .run()
  }
}

fn main() {
  let args = Args::parse();
  init_env_logger(if args.verbose {"debug"} else {"info"});
  println!("{}", COMBSCOPE_LOGO_SHOW);

  let thread_control = Arc::new(Mutex::new(ThreadControl::new()));

  let mut signals = match Signals::new([SIGINT, SIGTERM]) {
    Err(err) => {
      error!("Unable to install signal handlers! {err}");
      exit(1);
    }
    Ok(signals) => signals
  };
  let signal_handle = signals.handle();
  let tc_signals    = Arc::clone(&thread_control);
  let signal_thread = thread::Builder::new()
    .name("signals".into())
    .spawn(move || {
      if let Some(signal) = signals.forever().next() {
        println!("=> {} Received signal {signal}, stopping!", "\u{1F6D1}".red());
        request_stop(&tc_signals);
      }
    });

  let result = run(&args, Arc::clone(&thread_control));

  signal_handle.close();
  match signal_thread {
    Err(err)   => warn!("Signal thread did not start! {err}"),
    Ok(handle) => {
      if let Err(err) = handle.join() {
        error!("Signal thread panicked! {err:?}");
      }
    }
  }
  match result {
    Err(err) => {
      error!("{err}");
      exit(err.exit_code());
    }
    Ok(n_acquisitions) => {
      println!("=> Finished after {n_acquisitions} acquisitions. So long and thanks for all the \u{1F41F}");
    }
  }
}
