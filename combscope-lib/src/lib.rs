//! # Shared library for the combscope acquisition suite
//!
//! Everything which does not need the FPGA lives here, so that
//! clients and test setups can use it on any host:
//!
//! * settings and their toml representation
//! * thread control for cooperative shutdown
//! * circular buffer arithmetic for the DMA rings
//! * the control channel protocol and a client for it
//! * the links to the temperature controller and the
//!   environmental sensor
//!
pub mod circular;
pub mod client;
pub mod controller;
pub mod environment;
pub mod protocol;
pub mod settings;
pub mod thread_control;

pub use settings::ScopeSettings;
pub use thread_control::ThreadControl;

use std::io::Write;

use colored::{Colorize, ColoredString};
use log::Level;

#[macro_use] extern crate log;
extern crate env_logger;

pub const COMBSCOPE_LOGO_SHOW : &str = "
   ___               _    ___
  / __|___ _ __  ___| |__/ __| __ ___ _ __  ___
 | (__/ _ \\ '  \\/ _ \\ '_ \\__ \\/ _/ _ \\ '_ \\/ -_)
  \\___\\___/_|_|_\\___/_.__/___/\\__\\___/ .__/\\___|
                                     |_|
      (two channel triggered streaming for the Red Pitaya)
  ";

/// Make sure that the loglevel is in color, even though not using pretty_env logger
pub fn color_log(level : &Level) -> ColoredString {
  match level {
    Level::Error    => String::from(" ERROR!").red(),
    Level::Warn     => String::from(" WARN  ").yellow(),
    Level::Info     => String::from(" Info  ").green(),
    Level::Debug    => String::from(" debug ").blue(),
    Level::Trace    => String::from(" trace ").cyan(),
  }
}

/// Set up the environmental (env) logger
/// with our format
///
/// Ensure that the lines and module paths
/// are printed in the logging output.
///
/// # Arguments
///
/// * default_filter : used when RUST_LOG is not set
pub fn init_env_logger(default_filter : &str) {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
    .format(|buf, record| {
    writeln!( buf, "[{level}][{module_path}:{line}] {args}",
      level = color_log(&record.level()),
      module_path = record.module_path().unwrap_or("<unknown>"),
      line = record.line().unwrap_or(0),
      args = record.args()
      )
    }).init();
}
