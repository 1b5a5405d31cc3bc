//! Process entry point: parse CLI flags, build the environment bus, boot the
//! root application task, and drive `root_tick` at ~10ms cadence until the
//! process is killed.

mod log_macros;

mod cmd_executing;
mod env_bus;
mod errors;
mod flags;
mod peer_cmd_communicating;
mod scheduler;
mod swart_debugging;
mod tcp_listening;
mod wire_transfer;

use env_bus::{DbgChannel, EnvBus};
use flags::{DbgChannelArg, Options};
use log_macros::LogLevel::LogInfo;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use swart_debugging::SwartDebugging;

const TICK_PERIOD: Duration = Duration::from_millis(10);
/// A short sleep every this many ticks to yield CPU; a diagnostic comfort,
/// not a correctness property.
const YIELD_EVERY_N_TICKS: u64 = 10;
const YIELD_SLEEP: Duration = Duration::from_millis(2);

fn main() {
    let opts = Options::from_args_checked();
    log_macros::init(opts.verbose);
    let dbg_channel = match opts.channel {
        DbgChannelArg::Tty => DbgChannel::Tty,
        DbgChannelArg::Socket => DbgChannel::Socket,
    };

    log!(LogInfo, "starting swartd: channel={:?} port={}", dbg_channel, opts.port);

    let env = Rc::new(EnvBus::new(dbg_channel, opts.port));
    let root = scheduler::new_root(Box::new(SwartDebugging::new(env)));

    let mut tick_count: u64 = 0;
    loop {
        let tick_start = Instant::now();
        scheduler::root_tick(&root);
        tick_count += 1;

        if tick_count % YIELD_EVERY_N_TICKS == 0 {
            thread::sleep(YIELD_SLEEP);
        }

        let elapsed = tick_start.elapsed();
        if elapsed < TICK_PERIOD {
            thread::sleep(TICK_PERIOD - elapsed);
        }
    }
}
