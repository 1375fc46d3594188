//! Fixed-layout process-introspection record.
//!
//! The process-information stream produced by `OpenInfo` yields exactly
//! one encoded record per read. The layout is fixed and little-endian so
//! a record can be decoded by any reader of the stream without sharing
//! kernel structures.

use crate::types::{Pid, PROCINFO_MAX_ARGS_SIZE};

/// Size in bytes of one encoded [`ProcInfo`] record.
///
/// pid (4) + ppid (4) + alive (1) + thread_count (4) + main_task (8)
/// + argl (4) + args (`PROCINFO_MAX_ARGS_SIZE`).
pub const PROCINFO_RECORD_SIZE: usize = 25 + PROCINFO_MAX_ARGS_SIZE;

/// One process table entry as reported by the introspection stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcInfo {
    /// Pid of the reported slot.
    pub pid: Pid,
    /// Pid of the parent, or `NOPROC` for parentless processes.
    pub ppid: Pid,
    /// True while the process is ALIVE, false once ZOMBIE.
    pub alive: bool,
    /// Number of threads that have not yet exited.
    pub thread_count: u32,
    /// Identifier of the main task entry point (an address in the
    /// hosted kernel); 0 when the slot has no main task.
    pub main_task: u64,
    /// Full length of the argument buffer, which may exceed the
    /// truncated copy carried in `args`.
    pub argl: u32,
    /// The first `min(argl, PROCINFO_MAX_ARGS_SIZE)` argument bytes.
    pub args: [u8; PROCINFO_MAX_ARGS_SIZE],
}

impl ProcInfo {
    /// Encode the record into `buf`, which must hold at least
    /// [`PROCINFO_RECORD_SIZE`] bytes. Returns the number of bytes
    /// written, or `None` if the buffer is too small.
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < PROCINFO_RECORD_SIZE {
            return None;
        }
        buf[0..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.ppid.to_le_bytes());
        buf[8] = self.alive as u8;
        buf[9..13].copy_from_slice(&self.thread_count.to_le_bytes());
        buf[13..21].copy_from_slice(&self.main_task.to_le_bytes());
        buf[21..25].copy_from_slice(&self.argl.to_le_bytes());
        buf[25..PROCINFO_RECORD_SIZE].copy_from_slice(&self.args);
        Some(PROCINFO_RECORD_SIZE)
    }

    /// Decode one record from `buf`. Returns `None` if the buffer is
    /// shorter than a record.
    pub fn decode(buf: &[u8]) -> Option<ProcInfo> {
        if buf.len() < PROCINFO_RECORD_SIZE {
            return None;
        }
        let mut args = [0u8; PROCINFO_MAX_ARGS_SIZE];
        args.copy_from_slice(&buf[25..PROCINFO_RECORD_SIZE]);
        Some(ProcInfo {
            pid: Pid::from_le_bytes(buf[0..4].try_into().ok()?),
            ppid: Pid::from_le_bytes(buf[4..8].try_into().ok()?),
            alive: buf[8] != 0,
            thread_count: u32::from_le_bytes(buf[9..13].try_into().ok()?),
            main_task: u64::from_le_bytes(buf[13..21].try_into().ok()?),
            argl: u32::from_le_bytes(buf[21..25].try_into().ok()?),
            args,
        })
    }

    /// The argument bytes actually carried by the record.
    pub fn args_bytes(&self) -> &[u8] {
        let n = (self.argl as usize).min(PROCINFO_MAX_ARGS_SIZE);
        &self.args[..n]
    }
}
