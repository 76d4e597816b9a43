//! Process-wide `SIGTRAP` disposition that dispatches to per-slot handlers.
//!
//! The disposition is installed when the first slot gets a handler, and the disposition
//! it replaced is restored when the last handler is removed. The slot that fired is not
//! recovered from the signal, so every registered handler sees every trap.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
use tracing::{debug, trace};

use crate::error::Result;
use crate::ptracer::Signal;
use crate::x86::{Slot, SLOTS};

/// `si_code` of a trap raised by a hardware breakpoint.
///
/// Defined in [`include/uapi/asm-generic/siginfo.h`](https://github.com/torvalds/linux/blob/v6.1/include/uapi/asm-generic/siginfo.h).
pub const TRAP_HWBKPT: i32 = 4;

/// A delivered trap signal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Trap {
    signal: Signal,
    code: i32,
}

impl Trap {
    pub fn new(signal: Signal, code: i32) -> Self {
        Self { signal, code }
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// The `si_code` of the signal.
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn is_hardware_breakpoint(&self) -> bool {
        self.code == TRAP_HWBKPT
    }
}

/// Callback for watchpoint traps, along with whatever context it carries.
///
/// Runs in signal-handler context on the thread that tripped the watchpoint, before that
/// thread executes its next instruction. Implementations must be async-signal-safe:
/// atomics are fine, locks and allocation are not.
pub trait TrapHandler: Send + Sync {
    fn on_trap(&self, trap: &Trap);
}

impl<F> TrapHandler for F
where
    F: Fn(&Trap) + Send + Sync,
{
    fn on_trap(&self, trap: &Trap) {
        self(trap)
    }
}

type Entry = Box<dyn TrapHandler>;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: AtomicPtr<Entry> = AtomicPtr::new(ptr::null_mut());

static HANDLERS: [AtomicPtr<Entry>; SLOTS] = [EMPTY; SLOTS];

/// Number of `on_sigtrap()` invocations currently reading `HANDLERS`.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

static REGISTRY: Mutex<Registry> = Mutex::new(Registry { previous: None });

struct Registry {
    // Disposition to restore once no handlers remain. `Some` iff ours is installed.
    previous: Option<SigAction>,
}

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Set the handler for traps while `slot` is armed, replacing any previous one.
pub fn register(slot: Slot, handler: impl TrapHandler + 'static) -> Result<()> {
    let mut registry = registry();

    if registry.previous.is_none() {
        let action = SigAction::new(
            SigHandler::SigAction(on_sigtrap),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        // SAFETY: `on_sigtrap()` only touches atomics and registered handlers, which are
        // themselves required to be async-signal-safe.
        let previous = unsafe { signal::sigaction(Signal::SIGTRAP, &action) }?;
        registry.previous = Some(previous);

        debug!("installed SIGTRAP disposition");
    }

    let entry: Entry = Box::new(handler);
    let old = HANDLERS[slot.index()].swap(Box::into_raw(Box::new(entry)), Ordering::SeqCst);
    retire(old);

    trace!(slot = slot.index(), "registered trap handler");

    Ok(())
}

/// Remove the handler for `slot`, if any.
///
/// Must not be called from a [`TrapHandler`]: it waits for running handlers to return.
pub fn unregister(slot: Slot) -> Result<()> {
    let mut registry = registry();

    let old = HANDLERS[slot.index()].swap(ptr::null_mut(), Ordering::SeqCst);
    retire(old);

    trace!(slot = slot.index(), "unregistered trap handler");

    let idle = HANDLERS.iter().all(|entry| entry.load(Ordering::SeqCst).is_null());

    if idle {
        if let Some(previous) = registry.previous.take() {
            // SAFETY: restores a disposition the process had before `register()`.
            if let Err(err) = unsafe { signal::sigaction(Signal::SIGTRAP, &previous) } {
                registry.previous = Some(previous);
                return Err(err.into());
            }

            debug!("restored previous SIGTRAP disposition");
        }
    }

    Ok(())
}

pub fn is_registered(slot: Slot) -> bool {
    !HANDLERS[slot.index()].load(Ordering::SeqCst).is_null()
}

// Free an entry swapped out of `HANDLERS` once no dispatch can still be reading it.
fn retire(entry: *mut Entry) {
    if entry.is_null() {
        return;
    }

    while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
        std::thread::yield_now();
    }

    // SAFETY: `entry` came from `Box::into_raw()`, and is no longer reachable.
    drop(unsafe { Box::from_raw(entry) });
}

extern "C" fn on_sigtrap(_signo: libc::c_int, info: *mut libc::siginfo_t, _context: *mut libc::c_void) {
    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);

    // SAFETY: the kernel passes a valid `siginfo_t` to `SA_SIGINFO` handlers.
    let code = unsafe { info.as_ref() }.map_or(0, |info| info.si_code);
    let trap = Trap::new(Signal::SIGTRAP, code);

    for entry in &HANDLERS {
        let entry = entry.load(Ordering::SeqCst);

        // SAFETY: entries are only freed by `retire()`, after `IN_FLIGHT` drops to zero.
        if let Some(handler) = unsafe { entry.as_ref() } {
            handler.on_trap(&trap);
        }
    }

    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
}
