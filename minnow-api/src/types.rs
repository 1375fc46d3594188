//! Identifier types, sentinels and system limits.

/// Process identifier. Doubles as an index into the process table.
pub type Pid = i32;

/// Thread identifier. An opaque generation-tagged handle; never
/// interpreted by callers.
pub type Tid = u64;

/// File identifier, an index into the owning process's FIDT.
pub type Fid = i32;

/// Socket port number.
pub type Port = i32;

/// Entry point of a process main thread or of an additional thread.
/// The argument slice is the (possibly empty) argument buffer.
pub type Task = fn(&[u8]) -> i32;

/// Returned instead of a pid when process creation or child reaping
/// fails, and stored as the ppid of parentless processes.
pub const NOPROC: Pid = -1;

/// Returned instead of a fid when a file cannot be opened.
pub const NOFILE: Fid = -1;

/// Returned instead of a tid when thread creation fails. Never a valid
/// handle.
pub const NOTHREAD: Tid = 0;

/// The reserved "no port" value. Sockets bound to `NOPORT` cannot listen.
pub const NOPORT: Port = 0;

/// Number of process table slots. Slot 0 is the idle/scheduler slot.
pub const MAX_PROC: usize = 64;

/// Number of FIDT slots per process.
pub const MAX_FILEID: usize = 16;

/// Number of file control blocks in the system file table.
pub const MAX_FILES: usize = MAX_PROC * MAX_FILEID;

/// Highest legal port number. Legal ports are `1..=MAX_PORT`.
pub const MAX_PORT: Port = 1023;

/// Pipe ring size in bytes. Usable capacity is one byte less.
pub const PIPE_BUFFER_SIZE: usize = 8192;

/// Number of argument bytes carried inline in a [`crate::ProcInfo`]
/// record. Longer argument buffers are truncated.
pub const PROCINFO_MAX_ARGS_SIZE: usize = 128;

/// Which direction(s) of a peer socket to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Close the receiving side.
    Read,
    /// Close the sending side.
    Write,
    /// Close both sides.
    Both,
}
