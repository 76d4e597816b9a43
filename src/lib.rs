//! Hardware watchpoints for the calling thread on x86-64 Linux.
//!
//! A thread cannot write its own debug registers, and cannot `ptrace(2)` itself. Each
//! update forks a helper that attaches to the calling thread, writes the registers
//! through the `user` area, and detaches. Traps are then delivered as `SIGTRAP` and
//! dispatched to the handlers registered for armed slots.
//!
//! ```no_run
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let mut watched = 0u64;
//! let hits = Arc::new(AtomicUsize::new(0));
//!
//! let counter = Arc::clone(&hits);
//! drwatch::install(&watched, 0, move |_: &drwatch::Trap| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! })?;
//!
//! unsafe { std::ptr::write_volatile(&mut watched, 1) };
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//!
//! drwatch::disable(0)?;
//! # Ok::<(), drwatch::Error>(())
//! ```

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("drwatch only supports x86-64 Linux");

#[macro_use]
pub mod error;

pub mod handshake;
pub mod ptracer;
pub mod trap;
pub mod watchpoint;
pub mod x86;

pub use error::{Error, Result};
pub use handshake::{Handshake, Request};
pub use ptracer::{DebugState, Pid, Signal};
pub use trap::{Trap, TrapHandler};
pub use watchpoint::{disable, inspect, install, Watcher, Watchpoint};
pub use x86::{Condition, DebugControl, DebugRegister, Length, Slot};
