//! Ptrace primitives the handshake helper uses against the thread it arms.
//!
//! Everything here runs in a child forked from a possibly multi-threaded process, so it
//! is restricted to raw system calls: no allocation, no logging, no locks.

use std::time::{Duration, Instant};

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        wait::{self, WaitPidFlag, WaitStatus},
    },
};

use crate::x86::{DebugControl, DebugRegister, Slot, SLOTS};

pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;

/// Size of an encoded [`DebugState`]: one native-endian word per register.
pub(crate) const STATE_LEN: usize = 8 * (SLOTS + 1);

/// Debug register state of a thread: the four address registers and DR7.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DebugState {
    pub addresses: [u64; SLOTS],
    pub control: DebugControl,
}

impl DebugState {
    pub fn address(&self, slot: Slot) -> u64 {
        self.addresses[slot.index()]
    }

    /// Value of `dr` in this state. Registers not tracked here read as zero.
    pub fn register(&self, dr: DebugRegister) -> u64 {
        use DebugRegister::*;

        match dr {
            Dr0 | Dr1 | Dr2 | Dr3 => self.addresses[u64::from(dr) as usize],
            Dr7 => self.control.raw(),
            Dr4 | Dr5 | Dr6 => 0,
        }
    }

    pub(crate) fn to_bytes(&self) -> [u8; STATE_LEN] {
        let mut bytes = [0; STATE_LEN];

        let words = self.addresses.iter().copied().chain(Some(self.control.raw()));
        for (chunk, word) in bytes.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }

        bytes
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != STATE_LEN {
            return None;
        }

        let mut words = bytes.chunks_exact(8).map(|chunk| {
            let mut word = [0; 8];
            word.copy_from_slice(chunk);
            u64::from_ne_bytes(word)
        });

        let mut addresses = [0; SLOTS];
        for address in addresses.iter_mut() {
            *address = words.next()?;
        }
        let control = DebugControl::from_raw(words.next()?);

        Some(Self { addresses, control })
    }
}

/// A debug register access the kernel refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct RegisterError {
    pub register: DebugRegister,
}

/// Why waiting for the attach-stop gave up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum StopError {
    Timeout,

    // Thread exited, or `waitpid()` itself failed.
    Lost,
}

/// Thread traced by the helper.
///
/// **Warning:** register accesses are only valid between a successful
/// [`wait_for_stop()`](Tracee::wait_for_stop) and [`detach()`](Tracee::detach).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Tracee {
    tid: Pid,
}

impl Tracee {
    pub fn new(tid: Pid) -> Self {
        Self { tid }
    }

    /// Seize the thread and ask it to stop.
    ///
    /// No signal is queued, so if the tracer exits before the stop is reported, the
    /// thread resumes as if it had never been traced.
    pub fn attach(&self) -> Result<(), Errno> {
        ptrace::seize(self.tid, ptrace::Options::empty())?;
        ptrace::interrupt(self.tid)
    }

    /// Poll until the interrupt stop is seen, backing off exponentially from `poll_delay`.
    ///
    /// Signal-delivery-stops that arrive first are restarted with the signal re-injected.
    /// The pending interrupt still stops the thread afterwards.
    pub fn wait_for_stop(&self, timeout: Duration, poll_delay: Duration) -> Result<(), StopError> {
        let flags = WaitPidFlag::__WALL | WaitPidFlag::WNOHANG;
        let deadline = Instant::now().checked_add(timeout);
        let mut poll_delay = poll_delay;

        loop {
            match wait::waitpid(self.tid, Some(flags)) {
                Ok(WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP)) => {
                    // Interrupt stop, or a group-stop, which is just as stopped.
                    return Ok(());
                },
                Ok(WaitStatus::Stopped(_, signal)) => {
                    ptrace::cont(self.tid, signal).map_err(|_| StopError::Lost)?;
                    continue;
                },
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                    return Err(StopError::Lost);
                },
                Ok(_) => {
                    // Still running.
                },
                Err(Errno::EINTR) => {
                    continue;
                },
                Err(_) => {
                    return Err(StopError::Lost);
                },
            }

            let now = Instant::now();
            let delay = match deadline {
                Some(deadline) if now >= deadline => return Err(StopError::Timeout),
                Some(deadline) => poll_delay.min(deadline - now),
                None => poll_delay,
            };

            std::thread::sleep(delay);

            // Back off before next attempt.
            poll_delay = poll_delay.saturating_mul(2);
        }
    }

    /// Release the stopped thread without delivering a signal.
    pub fn detach(&self) -> Result<(), Errno> {
        ptrace::detach(self.tid, None)
    }

    pub fn debug_state(&self) -> Result<DebugState, RegisterError> {
        let mut addresses = [0; SLOTS];

        for slot in Slot::ALL {
            addresses[slot.index()] = self.debug_register(slot.address_register())?;
        }

        let control = DebugControl::from_raw(self.debug_register(DebugRegister::Dr7)?);

        Ok(DebugState { addresses, control })
    }

    pub fn debug_register(&self, dr: DebugRegister) -> Result<u64, RegisterError> {
        self.peek_user(dr.offset())
            .map_err(|_| RegisterError { register: dr })
    }

    pub fn set_debug_register(&self, dr: DebugRegister, data: u64) -> Result<(), RegisterError> {
        self.poke_user(dr.offset(), data)
            .map_err(|_| RegisterError { register: dr })
    }

    fn peek_user(&self, off: u64) -> Result<u64, Errno> {
        // SAFETY: `off` does not require validation, because it is not actually used as a
        // pointer offset by the kernel.
        //
        // See: https://github.com/torvalds/linux/blob/v4.9/arch/x86/kernel/ptrace.c#L774-L791

        Errno::clear();

        let data = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                self.tid.as_raw(),
                off,
                0,
            )
        };

        // All-ones is a valid register value, so only `errno` can flag a failure.
        if data == -1 && Errno::last() != Errno::UnknownErrno {
            return Err(Errno::last());
        }

        Ok(data as u64)
    }

    fn poke_user(&self, off: u64, data: u64) -> Result<(), Errno> {
        // SAFETY: `off` does not require validation, because it is not actually used as a
        // pointer offset by the kernel.
        //
        // See: https://github.com/torvalds/linux/blob/v4.9/arch/x86/kernel/ptrace.c#L774-L791

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                self.tid.as_raw(),
                off,
                data,
            )
        };

        Errno::result(res).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::x86::{Condition, Length};

    #[test]
    fn test_debug_state_report_layout() {
        let slot = Slot::new(2).unwrap();
        let state = DebugState {
            addresses: [0x1000, 0, 0x2000, 0],
            control: DebugControl::default().enable(slot, Condition::Write, Length::Eight),
        };

        let bytes = state.to_bytes();

        assert_eq!(&bytes[16..24], &0x2000u64.to_ne_bytes());
        assert_eq!(&bytes[32..], &state.control.raw().to_ne_bytes());
        assert_eq!(DebugState::from_bytes(&bytes), Some(state));
        assert_eq!(state.register(DebugRegister::Dr2), 0x2000);
    }

    // Fork a child that sleeps until killed.
    fn spawn_sleeper() -> Pid {
        use nix::unistd::{fork, ForkResult};

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => loop {
                unsafe { libc::pause() };
            },
            ForkResult::Parent { child } => child,
        }
    }

    fn kill_and_reap(pid: Pid) {
        nix::sys::signal::kill(pid, Signal::SIGKILL).unwrap();
        wait::waitpid(pid, None).unwrap();
    }

    // Check that the untraced child is running, not group-stopped, for a while.
    fn assert_keeps_running(pid: Pid) {
        let flags = WaitPidFlag::WUNTRACED | WaitPidFlag::WNOHANG;

        for _ in 0..20 {
            assert_eq!(wait::waitpid(pid, Some(flags)).unwrap(), WaitStatus::StillAlive);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    #[ntest::timeout(5000)]
    fn test_stop_peek_and_detach() {
        let child = spawn_sleeper();
        let tracee = Tracee::new(child);

        if let Err(errno) = tracee.attach() {
            eprintln!("skipping: {errno}");
            kill_and_reap(child);
            return;
        }

        tracee.wait_for_stop(Duration::from_secs(2), Duration::from_micros(1)).unwrap();

        let state = tracee.debug_state().unwrap();
        assert_eq!(state, DebugState::default());

        tracee.detach().unwrap();
        assert_keeps_running(child);

        kill_and_reap(child);
    }

    #[test]
    #[ntest::timeout(5000)]
    fn test_tracer_exit_before_stop_leaves_nothing_pending() {
        let child = spawn_sleeper();

        // The tracer thread exits without ever waiting for the stop, which is what a
        // helper that times out does.
        let attached = std::thread::spawn(move || Tracee::new(child).attach())
            .join()
            .unwrap();

        if let Err(errno) = attached {
            eprintln!("skipping: {errno}");
            kill_and_reap(child);
            return;
        }

        // `join()` can return before the kernel has untraced the child.
        std::thread::sleep(Duration::from_millis(100));

        assert_keeps_running(child);

        kill_and_reap(child);
    }

    #[test]
    fn test_debug_state_rejects_truncated_report() {
        assert_eq!(DebugState::from_bytes(&[]), None);
        assert_eq!(DebugState::from_bytes(&[0; STATE_LEN - 1]), None);
        assert_eq!(DebugState::from_bytes(&[0; STATE_LEN + 8]), None);
    }
}
