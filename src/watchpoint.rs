//! Arming and disarming watchpoints on the calling thread.

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::handshake::{Handshake, Request};
use crate::ptracer::DebugState;
use crate::trap::{self, TrapHandler};
use crate::x86::{Condition, Length, Slot};

/// A hardware watchpoint to arm.
///
/// Defaults to trapping on pointer-width writes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Watchpoint {
    address: u64,
    slot: Slot,
    condition: Condition,
    length: Length,
}

impl Watchpoint {
    pub fn new(address: u64, slot: usize) -> Result<Self> {
        let slot = Slot::new(slot)?;
        let condition = Condition::Write;
        let length = Length::pointer_width();

        Ok(Self { address, slot, condition, length })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn set_condition(&mut self, condition: Condition) {
        self.condition = condition;
    }

    pub fn length(&self) -> Length {
        self.length
    }

    pub fn set_length(&mut self, length: Length) {
        self.length = length;
    }

    /// Check the address and length against what the hardware accepts.
    ///
    /// Execute breakpoints must use [`Length::One`], and the address must be aligned to
    /// the watched length.
    pub fn validate(&self) -> Result<()> {
        let Self { address, length, .. } = *self;

        if self.condition == Condition::Execute && length != Length::One {
            return Err(Error::InvalidLength { length });
        }

        if address % length.bytes() != 0 {
            return Err(Error::Misaligned { address, length });
        }

        Ok(())
    }

    fn request(&self) -> Request {
        Request::Arm {
            slot: self.slot,
            address: self.address,
            condition: self.condition,
            length: self.length,
        }
    }
}

/// Installs and removes watchpoints on the calling thread.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Watcher {
    handshake: Handshake,
}

impl Watcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn handshake_mut(&mut self) -> &mut Handshake {
        &mut self.handshake
    }

    /// Arm `watchpoint`, then route its traps to `handler`.
    ///
    /// The handler is only registered once the debug registers are confirmed written.
    pub fn install(&self, watchpoint: &Watchpoint, handler: impl TrapHandler + 'static) -> Result<DebugState> {
        watchpoint.validate()?;

        let slot = watchpoint.slot();
        let state = self.handshake.run(watchpoint.request())?;

        if let Err(err) = trap::register(slot, handler) {
            warn!(slot = slot.index(), %err, "could not register trap handler, disarming");

            if let Err(err) = self.handshake.run(Request::Clear { slot }) {
                warn!(slot = slot.index(), %err, "could not disarm watchpoint");
            }

            return Err(err);
        }

        info!(
            slot = slot.index(),
            address = watchpoint.address(),
            condition = ?watchpoint.condition(),
            length = ?watchpoint.length(),
            "armed watchpoint"
        );

        Ok(state)
    }

    /// Disarm `slot` and drop its handler.
    ///
    /// Once no slot has a handler, the `SIGTRAP` disposition in effect before the first
    /// install is restored. Must not be called from a [`TrapHandler`].
    pub fn disable(&self, slot: usize) -> Result<DebugState> {
        let slot = Slot::new(slot)?;

        let state = self.handshake.run(Request::Clear { slot })?;
        trap::unregister(slot)?;

        info!(slot = slot.index(), "cleared watchpoint");

        Ok(state)
    }

    /// Read the calling thread's debug registers.
    pub fn inspect(&self) -> Result<DebugState> {
        self.handshake.run(Request::Inspect)
    }
}

/// Trap pointer-width writes to `address` on the calling thread, using `slot`.
///
/// The watched length is 8 bytes whatever `T` is, so `address` must be 8-byte aligned.
/// Use [`Watcher::install()`] with a [`Watchpoint`] to watch smaller values.
pub fn install<T>(address: *const T, slot: usize, handler: impl TrapHandler + 'static) -> Result<()> {
    let watchpoint = Watchpoint::new(address as usize as u64, slot)?;

    Watcher::new().install(&watchpoint, handler)?;

    Ok(())
}

/// Disarm `slot` on the calling thread and drop its handler.
pub fn disable(slot: usize) -> Result<()> {
    Watcher::new().disable(slot)?;

    Ok(())
}

/// Read the calling thread's debug registers.
pub fn inspect() -> Result<DebugState> {
    Watcher::new().inspect()
}
