//! Debug register updates performed by a short-lived, forked helper.
//!
//! A thread cannot `ptrace(2)` itself, so each request forks a helper that attaches to
//! the calling thread, waits for it to stop, pokes its debug registers, and detaches.
//! The caller blocks on the helper's exit status, which encodes the step that failed,
//! and reads the resulting register state from a pipe.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::wait::{self, WaitStatus},
    unistd::{self, ForkResult},
};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::ptracer::{DebugState, Pid, RegisterError, StopError, Tracee, STATE_LEN};
use crate::x86::{Condition, DebugRegister, Length, Slot};

const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(1);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte sent to the helper once it may attach.
const GO_AHEAD: u8 = 1;

/// Bits of DR7 the kernel discards on write.
///
/// Defined in [`arch/x86/include/uapi/asm/debugreg.h`](https://github.com/torvalds/linux/blob/v6.1/arch/x86/include/uapi/asm/debugreg.h).
const DR_CONTROL_RESERVED: u64 = 0xffff_ffff_0000_fc00;

/// Change to make to the calling thread's debug registers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Request {
    /// Read the registers without modifying them.
    Inspect,

    /// Point `slot` at `address` and enable it.
    Arm {
        slot: Slot,
        address: u64,
        condition: Condition,
        length: Length,
    },

    /// Disable `slot` and zero its address register.
    Clear { slot: Slot },
}

impl Request {
    /// Register state after applying this request to `prior`.
    ///
    /// Only the bits of the requested slot change.
    pub fn apply(&self, prior: &DebugState) -> DebugState {
        let mut next = *prior;

        match *self {
            Request::Inspect => {},
            Request::Arm { slot, address, condition, length } => {
                next.addresses[slot.index()] = address;
                next.control = prior.control.enable(slot, condition, length);
            },
            Request::Clear { slot } => {
                next.addresses[slot.index()] = 0;
                next.control = prior.control.disable(slot);
            },
        }

        next
    }

    /// Register writes that take the thread to `next`, in the order they must be made.
    ///
    /// An address register is never enabled before it holds its new address, and is only
    /// zeroed after DR7 stops referencing it.
    pub(crate) fn writes(&self, next: &DebugState) -> [Option<(DebugRegister, u64)>; 2] {
        let dr7 = (DebugRegister::Dr7, next.control.raw());

        match *self {
            Request::Inspect => [None, None],
            Request::Arm { slot, address, .. } => {
                [Some((slot.address_register(), address)), Some(dr7)]
            },
            Request::Clear { slot } => {
                [Some(dr7), Some((slot.address_register(), 0))]
            },
        }
    }
}

/// How the helper ended. Carried across the process boundary as its exit code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Outcome {
    Success,
    AttachDenied,
    StopTimeout,
    Detach,

    // Go-ahead, stop, or report lost between the two processes.
    Protocol,

    Read(DebugRegister),
    Write(DebugRegister),
    Verify(DebugRegister),
    Rollback(DebugRegister),
}

// Register failures are `base + n`, for `DRn`.
const EXIT_READ: i32 = 0x10;
const EXIT_WRITE: i32 = 0x20;
const EXIT_VERIFY: i32 = 0x30;
const EXIT_ROLLBACK: i32 = 0x40;

impl Outcome {
    pub fn code(self) -> i32 {
        use Outcome::*;

        match self {
            Success => 0,
            AttachDenied => 1,
            StopTimeout => 2,
            Detach => 3,
            Protocol => 4,
            Read(dr) => EXIT_READ + dr as i32,
            Write(dr) => EXIT_WRITE + dr as i32,
            Verify(dr) => EXIT_VERIFY + dr as i32,
            Rollback(dr) => EXIT_ROLLBACK + dr as i32,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use Outcome::*;

        let outcome = match code {
            0 => Success,
            1 => AttachDenied,
            2 => StopTimeout,
            3 => Detach,
            4 => Protocol,
            _ => {
                let dr = DebugRegister::from_index((code & 0xf) as u8)?;

                match code & !0xf {
                    EXIT_READ => Read(dr),
                    EXIT_WRITE => Write(dr),
                    EXIT_VERIFY => Verify(dr),
                    EXIT_ROLLBACK => Rollback(dr),
                    _ => return None,
                }
            },
        };

        Some(outcome)
    }

    pub fn into_result(self, tid: Pid, timeout: Duration) -> Result<()> {
        use Outcome::*;

        match self {
            Success => Ok(()),
            AttachDenied => Err(Error::AttachDenied { tid }),
            StopTimeout => Err(Error::StopTimeout { tid, timeout }),
            Detach => Err(Error::Detach { tid }),
            Protocol => internal_error!("handshake helper lost contact with the caller"),
            Read(register) => Err(Error::RegisterRead { register }),
            Write(register) => Err(Error::RegisterWrite { register }),
            Verify(register) => Err(Error::Verify { register }),
            Rollback(register) => Err(Error::Rollback { register }),
        }
    }
}

/// Step of the handshake, as run by the helper.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    // Forked, waiting for the caller's go-ahead before attaching.
    Spawned,

    // Seized and interrupted, expecting the thread to stop.
    WaitingForStop,

    // Caller thread stopped. Reading, writing, and verifying its debug registers.
    Poking,

    // Registers updated or restored. Releasing the caller thread.
    Detaching,

    // Done. The outcome becomes the exit code.
    Exited(Outcome),
}

/// Configuration of the helper handshake.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Handshake {
    /// Initial delay between polls for the interrupt stop. Doubles after every poll.
    poll_delay: Duration,

    /// Time allowed for the caller thread to stop after the helper attaches.
    stop_timeout: Duration,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        let poll_delay = DEFAULT_POLL_DELAY;
        let stop_timeout = DEFAULT_STOP_TIMEOUT;

        Self { poll_delay, stop_timeout }
    }

    /// Return the initial interrupt-stop poll delay.
    pub fn poll_delay(&self) -> Duration {
        self.poll_delay
    }

    /// Set the initial interrupt-stop poll delay.
    pub fn set_poll_delay(&mut self, poll_delay: Duration) {
        self.poll_delay = poll_delay;
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Set how long the helper waits for the caller thread to stop before giving up.
    pub fn set_stop_timeout(&mut self, stop_timeout: Duration) {
        self.stop_timeout = stop_timeout;
    }

    /// Apply `request` to the calling thread's debug registers, returning their new state.
    ///
    /// Blocks until the helper exits. On failure, registers already written are restored
    /// to their prior values, unless the error is [`Error::Rollback`].
    pub fn run(&self, request: Request) -> Result<DebugState> {
        let tid = unistd::gettid();

        let (go_read, go_write) = pipe()?;
        let (report_read, report_write) = pipe()?;

        debug!(tid = tid.as_raw(), ?request, "forking handshake helper");

        // SAFETY: the child only makes system calls on stack data and ends in `_exit()`.
        match unsafe { unistd::fork() }? {
            ForkResult::Child => {
                drop(go_write);
                drop(report_read);

                let helper = Helper::new(tid, request, self, go_read.as_raw_fd(), report_write.as_raw_fd());
                let outcome = helper.run();

                unsafe { libc::_exit(outcome.code()) }
            },
            ForkResult::Parent { child } => {
                drop(go_read);
                drop(report_write);

                self.supervise(child, tid, go_write, report_read)
            },
        }
    }

    fn supervise(&self, helper: Pid, tid: Pid, mut go: File, mut report: File) -> Result<DebugState> {
        set_ptracer(Some(helper));

        // If this fails, the helper is already gone and its exit status says why.
        let sent = go.write_all(&[GO_AHEAD]);
        drop(go);

        let status = reap(helper);
        set_ptracer(None);

        if let Err(err) = sent {
            debug!(%err, "could not send go-ahead to handshake helper");
        }

        match status? {
            WaitStatus::Exited(_, code) => {
                let outcome = match Outcome::from_code(code) {
                    Some(outcome) => outcome,
                    None => internal_error!(format!("unknown handshake helper exit code = {code}")),
                };

                debug!(helper = helper.as_raw(), ?outcome, "handshake helper exited");

                if let Err(err) = outcome.into_result(tid, self.stop_timeout) {
                    warn!(tid = tid.as_raw(), %err, "debug register handshake failed");
                    return Err(err);
                }

                let mut bytes = Vec::with_capacity(STATE_LEN);
                report.read_to_end(&mut bytes)?;

                match DebugState::from_bytes(&bytes) {
                    Some(state) => Ok(state),
                    None => internal_error!("truncated handshake report"),
                }
            },
            WaitStatus::Signaled(_, signal, _) => {
                warn!(helper = helper.as_raw(), %signal, "handshake helper killed");
                Err(Error::HelperSignaled { signal })
            },
            _ => {
                // Assume `!WUNTRACED`, `!WCONTINUED`.
                internal_error!("unreachable handshake helper wait status")
            },
        }
    }
}

/// Side of the handshake running in the forked child.
struct Helper<'a> {
    tracee: Tracee,
    request: Request,
    config: &'a Handshake,
    go: RawFd,
    report: RawFd,

    // Registers written so far with their prior values, in write order.
    undo: [Option<(DebugRegister, u64)>; 2],

    // Failure to report once the thread is released.
    failure: Option<Outcome>,

    state: DebugState,
}

impl<'a> Helper<'a> {
    fn new(tid: Pid, request: Request, config: &'a Handshake, go: RawFd, report: RawFd) -> Self {
        Self {
            tracee: Tracee::new(tid),
            request,
            config,
            go,
            report,
            undo: [None, None],
            failure: None,
            state: DebugState::default(),
        }
    }

    fn run(mut self) -> Outcome {
        let mut phase = Phase::Spawned;

        loop {
            phase = match phase {
                Phase::Exited(outcome) => return outcome,
                phase => self.step(phase),
            };
        }
    }

    fn step(&mut self, phase: Phase) -> Phase {
        match phase {
            Phase::Spawned => {
                if !self.await_go_ahead() {
                    return Phase::Exited(Outcome::Protocol);
                }

                match self.tracee.attach() {
                    Ok(()) => Phase::WaitingForStop,
                    Err(_) => Phase::Exited(Outcome::AttachDenied),
                }
            },
            Phase::WaitingForStop => {
                // On failure, exiting detaches us from the thread.
                match self.tracee.wait_for_stop(self.config.stop_timeout, self.config.poll_delay) {
                    Ok(()) => Phase::Poking,
                    Err(StopError::Timeout) => Phase::Exited(Outcome::StopTimeout),
                    Err(StopError::Lost) => Phase::Exited(Outcome::Protocol),
                }
            },
            Phase::Poking => {
                if let Err(outcome) = self.poke() {
                    self.failure = Some(outcome);
                }

                Phase::Detaching
            },
            Phase::Detaching => {
                if self.tracee.detach().is_err() {
                    let outcome = self.rollback(Outcome::Detach);
                    return Phase::Exited(outcome);
                }

                if let Some(outcome) = self.failure {
                    return Phase::Exited(outcome);
                }

                if self.send_report() {
                    Phase::Exited(Outcome::Success)
                } else {
                    Phase::Exited(Outcome::Protocol)
                }
            },
            Phase::Exited(outcome) => Phase::Exited(outcome),
        }
    }

    fn await_go_ahead(&self) -> bool {
        let mut buf = [0; 1];

        loop {
            match unistd::read(self.go, &mut buf) {
                Ok(1) => return buf[0] == GO_AHEAD,
                Err(Errno::EINTR) => continue,
                _ => return false,
            }
        }
    }

    fn poke(&mut self) -> std::result::Result<(), Outcome> {
        let prior = self.tracee
            .debug_state()
            .map_err(|RegisterError { register }| Outcome::Read(register))?;

        let next = self.request.apply(&prior);
        let writes = self.request.writes(&next);

        for (i, (register, value)) in writes.iter().enumerate().filter_map(|(i, w)| Some((i, (*w)?))) {
            if self.tracee.set_debug_register(register, value).is_err() {
                return Err(self.rollback(Outcome::Write(register)));
            }

            self.undo[i] = Some((register, prior.register(register)));
        }

        for (register, value) in writes.iter().flatten().copied() {
            let expected = match register {
                DebugRegister::Dr7 => value & !DR_CONTROL_RESERVED,
                _ => value,
            };

            match self.tracee.debug_register(register) {
                Ok(actual) if actual == expected => {},
                Ok(_) => return Err(self.rollback(Outcome::Verify(register))),
                Err(_) => return Err(self.rollback(Outcome::Read(register))),
            }
        }

        self.state = next;

        Ok(())
    }

    // Restore registers written so far, newest first. Returns `failure` unless a restore
    // is itself rejected.
    fn rollback(&mut self, failure: Outcome) -> Outcome {
        let undo = std::mem::take(&mut self.undo);

        for (register, value) in undo.iter().rev().flatten().copied() {
            if self.tracee.set_debug_register(register, value).is_err() {
                return Outcome::Rollback(register);
            }
        }

        failure
    }

    fn send_report(&self) -> bool {
        let bytes = self.state.to_bytes();

        // Shorter than `PIPE_BUF`, so the write is atomic.
        loop {
            match unistd::write(self.report, &bytes) {
                Ok(len) => return len == bytes.len(),
                Err(Errno::EINTR) => continue,
                Err(_) => return false,
            }
        }
    }
}

fn pipe() -> Result<(File, File)> {
    let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC)?;

    // SAFETY: both descriptors were just created, and are owned by nothing else.
    let ends = unsafe { (File::from_raw_fd(read), File::from_raw_fd(write)) };

    Ok(ends)
}

fn reap(helper: Pid) -> Result<WaitStatus> {
    loop {
        match wait::waitpid(helper, None) {
            Err(Errno::EINTR) => continue,
            status => return Ok(status?),
        }
    }
}

// Let `tracer` attach to us under Yama's `ptrace_scope = 1`, or revoke the exception.
//
// Without Yama this fails with `EINVAL`, and is not needed.
fn set_ptracer(tracer: Option<Pid>) {
    let raw = tracer.map_or(0, |pid| pid.as_raw() as libc::c_ulong);

    let res = unsafe { libc::prctl(libc::PR_SET_PTRACER, raw, 0, 0, 0) };

    if let Err(errno) = Errno::result(res) {
        trace!(%errno, "could not update ptracer exception");
    }
}
