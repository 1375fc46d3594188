//! Minnow kernel ABI
//!
//! This crate defines the types, constants and records shared between the
//! minnow kernel and anything that talks to it: identifier types and their
//! sentinels, system limits, the syscall error taxonomy, and the fixed
//! byte layout of the process-introspection record.
//!
//! The crate is `no_std` so the same definitions can be used from hosted
//! test harnesses and from freestanding user programs alike.

#![no_std]
#![warn(missing_docs)]

mod error;
mod procinfo;
mod types;

pub use error::{SysError, SysResult};
pub use procinfo::{ProcInfo, PROCINFO_RECORD_SIZE};
pub use types::{
    Fid, Pid, Port, ShutdownMode, Task, Tid, MAX_FILEID, MAX_FILES, MAX_PORT, MAX_PROC, NOFILE,
    NOPORT, NOPROC, NOTHREAD, PIPE_BUFFER_SIZE, PROCINFO_MAX_ARGS_SIZE,
};
