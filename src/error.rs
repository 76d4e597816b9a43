use std::io;
use std::time::Duration;

use crate::ptracer::{Pid, Signal};
use crate::x86::{DebugRegister, Length};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid debug register slot = {0}, expected 0 through 3")]
    InvalidSlot(usize),

    #[error("Address = {address:#x} is not aligned to watch length = {length:?}")]
    Misaligned { address: u64, length: Length },

    #[error("Watch length = {length:?} is not valid for execute breakpoints")]
    InvalidLength { length: Length },

    #[error("Could not attach to thread = {tid}")]
    AttachDenied { tid: Pid },

    #[error("Thread = {tid} did not stop within {timeout:?}")]
    StopTimeout { tid: Pid, timeout: Duration },

    #[error("Could not read debug register {register:?}")]
    RegisterRead { register: DebugRegister },

    #[error("Kernel rejected write to debug register {register:?}")]
    RegisterWrite { register: DebugRegister },

    #[error("Debug register {register:?} did not read back the written value")]
    Verify { register: DebugRegister },

    #[error("Could not restore debug register {register:?} after a failed update")]
    Rollback { register: DebugRegister },

    #[error("Could not detach from thread = {tid}")]
    Detach { tid: Pid },

    #[error("Handshake helper was killed by {signal}")]
    HelperSignaled { signal: Signal },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}
