//! Print the registers of the scope core
//!
//! The mapping is writable, but no register is ever
//! written, so it can run next to the server.

use std::process::exit;
use std::thread;
use std::time::Duration;

use clap::Parser;

use combscope_rp::control::Scope;
use combscope_rp::memory::RegisterBlock;

#[derive(Parser, Debug)]
#[command(version, about = "Dump the scope registers", long_about = None)]
struct Args {
  /// Dump this many times
  #[arg(short, long, default_value_t = 1)]
  repeat: u32,
  /// Time between two dumps [ms]
  #[arg(short, long, default_value_t = 1000)]
  interval: u64,
}

fn main () {
  let args = Args::parse();
  let registers = match RegisterBlock::map() {
    Err(err) => {
      eprintln!("=> Unable to map the scope registers! {err}");
      exit(2);
    }
    Ok(registers) => registers
  };
  let scope = Scope::new(registers);
  for n in 0..args.repeat {
    if n > 0 {
      thread::sleep(Duration::from_millis(args.interval));
      println!();
    }
    for (name, addr, value) in scope.dump() {
      println!("{:<20} [{:#07x}] : {:#010x} ({})", name, addr, value, value);
    }
  }
}
