//! Show the write pointers of the DMA engine moving
//! through the two rings
//!
//! This is for debugging purposes mainly. With --arm, the
//! scope is armed (manual trigger) so that there is
//! something to watch even without the server.

use std::process::exit;
use std::{thread, time};

use clap::Parser;
use indicatif::{MultiProgress,
                ProgressBar,
                ProgressStyle};

use combscope_lib::protocol::Channel;
use combscope_lib::settings::TriggerSource;
use combscope_rp::control::Scope;
use combscope_rp::memory::*;

const TEMPLATE_BAR_A  : &str = "[{elapsed_precise}] {bar:60.blue/white} {pos:>9}/{len:9} {msg}";
const TEMPLATE_BAR_B  : &str = "[{elapsed_precise}] {bar:60.yellow/white} {pos:>9}/{len:9} {msg}";

#[derive(Parser, Debug)]
#[command(version, about = "Watch the DMA write pointers", long_about = None)]
struct Args {
  /// Seconds to watch
  #[arg(short, long, default_value_t = 10)]
  seconds: u64,
  /// Arm the scope with a manual trigger first
  #[arg(long, default_value_t = false)]
  arm: bool,
}

pub fn setup_progress_bar(msg : String, size : u64, format_string : &str) -> ProgressBar {
  let bar = ProgressBar::new(size);
  match ProgressStyle::with_template(format_string) {
    Err(err)  => eprintln!("=> Bad progress bar template! {err}"),
    Ok(style) => bar.set_style(style.progress_chars("##-")),
  }
  bar.set_message(msg);
  bar
}

fn main() {
  let args = Args::parse();
  let registers = match RegisterBlock::map() {
    Err(err) => {
      eprintln!("=> Unable to map the scope registers! {err}");
      exit(2);
    }
    Ok(registers) => registers
  };
  let scope = Scope::new(registers);
  if args.arm {
    scope.configure_dma(RAM_A_ADDRESS, RAM_A_SIZE, RAM_B_ADDRESS, RAM_B_SIZE, 250000, 2000);
    scope.arm(TriggerSource::Manual);
  }

  let multi_bar = MultiProgress::new();
  let bar_a = multi_bar.add(setup_progress_bar(String::from("ring A"), RAM_A_SIZE as u64, TEMPLATE_BAR_A));
  let bar_b = multi_bar.insert_after(&bar_a, setup_progress_bar(String::from("ring B"), RAM_B_SIZE as u64, TEMPLATE_BAR_B));

  let ten_millis = time::Duration::from_millis(10);
  let start      = time::Instant::now();
  while start.elapsed() < time::Duration::from_secs(args.seconds) {
    let pos_a = scope.write_pointer(Channel::A).wrapping_sub(RAM_A_ADDRESS) as u64 % RAM_A_SIZE as u64;
    let pos_b = scope.write_pointer(Channel::B).wrapping_sub(RAM_B_ADDRESS) as u64 % RAM_B_SIZE as u64;
    bar_a.set_position(pos_a);
    bar_b.set_position(pos_b);
    let msg = if scope.trigger_pending() {"armed"} else {"idle"};
    bar_a.set_message(format!("ring A ({msg})"));
    thread::sleep(ten_millis);
  }
  bar_a.finish();
  bar_b.finish();
}
