use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use drwatch::{Condition, Trap, Watcher, Watchpoint};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
struct Opt {
    /// Debug register slot to arm, 0 through 3.
    #[structopt(short, long, default_value = "0")]
    slot: usize,

    /// Number of writes to make to the watched variable.
    #[structopt(short, long, default_value = "3")]
    writes: u64,

    /// Also trap reads of the watched variable.
    #[structopt(short, long)]
    reads: bool,

    /// Milliseconds to wait for this thread to stop under the helper.
    #[structopt(long, default_value = "5000")]
    timeout: u64,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let mut watched = 0u64;
    let handled = Arc::new(AtomicUsize::new(0));

    let mut watcher = Watcher::new();
    watcher
        .handshake_mut()
        .set_stop_timeout(Duration::from_millis(opt.timeout));

    let mut watchpoint = Watchpoint::new(&watched as *const u64 as usize as u64, opt.slot)?;
    if opt.reads {
        watchpoint.set_condition(Condition::ReadWrite);
    }

    let counter = Arc::clone(&handled);
    let state = watcher.install(&watchpoint, move |_: &Trap| {
        counter.fetch_add(1, Ordering::SeqCst);
    })?;

    println!("armed slot {} at {:#x}, dr7 = {:#x}", opt.slot, watchpoint.address(), state.control.raw());

    for value in 1..=opt.writes {
        unsafe { ptr::write_volatile(&mut watched, value) };
        println!("watched = {}, traps = {}", value, handled.load(Ordering::SeqCst));
    }

    let state = watcher.disable(opt.slot)?;
    println!("cleared slot {}, dr7 = {:#x}", opt.slot, state.control.raw());

    unsafe { ptr::write_volatile(&mut watched, 0) };
    println!("after disable: traps = {}", handled.load(Ordering::SeqCst));

    Ok(())
}
