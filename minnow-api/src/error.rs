//! Syscall error taxonomy.

use core::fmt;

/// Errors surfaced by the syscall layer.
///
/// Every failure is local to the call that produced it; no syscall
/// panics. The variants follow the usual POSIX flavour so that the
/// sentinel ABI (`-1`/`NOPROC`/`NOFILE`) maps onto them one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// An argument was malformed: out-of-range pid or port, undersized
    /// buffer, operation on an object in the wrong state.
    InvalidArgument,
    /// The referenced process, thread or listener does not exist.
    NotFound,
    /// The fid does not name an open file, or the stream end was already
    /// closed.
    BadFileDescriptor,
    /// No free fid or file control block.
    TooManyOpenFiles,
    /// No free process table slot.
    OutOfMemory,
    /// The stream does not support this operation.
    NotSupported,
    /// The port is already bound by a listener.
    ResourceBusy,
    /// Write on a pipe whose reader is gone.
    BrokenPipe,
    /// The connection rendezvous failed: not admitted, timed out, or the
    /// listener went away.
    ConnectionRefused,
}

/// Result type of the syscall layer.
pub type SysResult<T> = Result<T, SysError>;

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SysError::InvalidArgument => "invalid argument",
            SysError::NotFound => "no such process, thread or listener",
            SysError::BadFileDescriptor => "bad file descriptor",
            SysError::TooManyOpenFiles => "out of file ids or control blocks",
            SysError::OutOfMemory => "out of process table slots",
            SysError::NotSupported => "operation not supported by stream",
            SysError::ResourceBusy => "port already bound",
            SysError::BrokenPipe => "pipe reader is gone",
            SysError::ConnectionRefused => "connection not admitted",
        };
        f.write_str(msg)
    }
}
