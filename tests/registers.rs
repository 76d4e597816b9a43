use std::ptr;
use std::time::Duration;

use anyhow::Result;
use drwatch::{Condition, DebugRegister, Error, Handshake, Length, Request, Slot, Watcher, Watchpoint};
use ntest::timeout;
use pretty_assertions::assert_eq;

mod support;
use support::*;

fn address_of<T>(value: &T) -> u64 {
    value as *const T as usize as u64
}

#[test]
#[timeout(10000)]
fn test_inspect_reflects_install_and_disable() -> Result<()> {
    let _serial = serial();
    if !can_trace() {
        return Ok(());
    }

    let a = 0u64;
    let slot = Slot::new(1)?;
    let watcher = Watcher::new();

    let watchpoint = Watchpoint::new(address_of(&a), 1)?;
    let (_handled, handler) = counter();
    let armed = watcher.install(&watchpoint, handler)?;

    let observed = watcher.inspect()?;
    assert_eq!(observed, armed);
    assert_eq!(observed.address(slot), address_of(&a));
    assert_eq!(observed.register(DebugRegister::Dr1), address_of(&a));
    assert!(observed.control.is_enabled(slot));
    assert_eq!(observed.control.condition(slot), Some(Condition::Write));
    assert_eq!(observed.control.length(slot), Length::Eight);

    let cleared = watcher.disable(1)?;
    assert!(!cleared.control.is_enabled(slot));
    assert_eq!(cleared.address(slot), 0);
    assert_eq!(watcher.inspect()?, cleared);

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_disable_preserves_other_slots() -> Result<()> {
    let _serial = serial();
    if !can_trace() {
        return Ok(());
    }

    let mut a = 0u64;
    let mut b = 0u64;

    let (a_handled, a_handler) = counter();
    let (b_handled, b_handler) = counter();

    drwatch::install(&a, 0, a_handler)?;
    drwatch::install(&b, 2, b_handler)?;

    drwatch::disable(0)?;

    let state = drwatch::inspect()?;
    assert!(!state.control.is_enabled(Slot::new(0)?));
    assert!(state.control.is_enabled(Slot::new(2)?));
    assert_eq!(state.address(Slot::new(2)?), address_of(&b));

    unsafe { ptr::write_volatile(&mut a, 1) };
    assert_eq!(hits(&a_handled), 0);
    assert_eq!(hits(&b_handled), 0);

    unsafe { ptr::write_volatile(&mut b, 1) };
    assert_eq!(hits(&b_handled), 1);

    drwatch::disable(2)?;

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_rearming_slot_replaces_watchpoint() -> Result<()> {
    let _serial = serial();
    if !can_trace() {
        return Ok(());
    }

    let mut a = 0u64;
    let mut b = 0u64;

    let (first, handler) = counter();
    drwatch::install(&a, 3, handler)?;

    let (second, handler) = counter();
    drwatch::install(&b, 3, handler)?;

    unsafe { ptr::write_volatile(&mut a, 1) };
    assert_eq!(hits(&first), 0);
    assert_eq!(hits(&second), 0);

    unsafe { ptr::write_volatile(&mut b, 1) };
    assert_eq!(hits(&first), 0);
    assert_eq!(hits(&second), 1);

    drwatch::disable(3)?;

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_read_write_condition_traps_reads() -> Result<()> {
    let _serial = serial();
    if !can_trace() {
        return Ok(());
    }

    let a = 5u32;

    let mut watcher = Watcher::new();
    watcher.handshake_mut().set_stop_timeout(Duration::from_secs(2));

    let mut watchpoint = Watchpoint::new(address_of(&a), 2)?;
    watchpoint.set_condition(Condition::ReadWrite);
    watchpoint.set_length(Length::Four);

    let (handled, handler) = counter();
    watcher.install(&watchpoint, handler)?;

    let value = unsafe { ptr::read_volatile(&a) };
    assert_eq!(value, 5);
    assert_eq!(hits(&handled), 1);

    let state = watcher.disable(2)?;
    assert!(!state.control.is_enabled(watchpoint.slot()));

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_rejected_control_write_restores_registers() -> Result<()> {
    let _serial = serial();
    if !can_trace() {
        return Ok(());
    }

    let a = [0u64; 2];

    let watcher = Watcher::new();
    let before = watcher.inspect()?;

    // The address register takes any user address, but the kernel refuses an 8-byte
    // watch that is only 4-aligned when DR7 is written.
    let request = Request::Arm {
        slot: Slot::new(0)?,
        address: address_of(&a) + 4,
        condition: Condition::Write,
        length: Length::Eight,
    };

    let err = Handshake::new().run(request).unwrap_err();
    assert!(matches!(err, Error::RegisterWrite { register: DebugRegister::Dr7 }));

    assert_eq!(watcher.inspect()?, before);

    Ok(())
}

#[test]
fn test_misaligned_watchpoint_is_rejected() -> Result<()> {
    let watcher = Watcher::new();

    let watchpoint = Watchpoint::new(0x1001, 0)?;
    let (handled, handler) = counter();

    let err = watcher.install(&watchpoint, handler).unwrap_err();
    assert!(matches!(err, Error::Misaligned { address: 0x1001, length: Length::Eight }));
    assert_eq!(hits(&handled), 0);

    Ok(())
}
