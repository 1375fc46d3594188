//! File control blocks and the system file table.
//!
//! An [`Fcb`] is a refcounted handle to a stream object. Streams carry
//! the per-kind operation vector as a trait; operations a stream does
//! not support fail the way the classic dummy file op does. The final
//! `decref` of an FCB invokes the stream's close and releases the slot.
//!
//! Fids are per-process indices into the owning PCB's FIDT; the FIDT
//! maps them to file-table slots. Fid reservation is all-or-nothing so a
//! half-created pipe never leaks a control block.

use std::sync::Arc;

use spin::Mutex;

use minnow_api::{Fid, SysError, SysResult, MAX_FILEID, MAX_FILES};

use crate::process::PROC_TABLE;
use crate::sched::{self, KernelLock};
use crate::socket::SocketRef;

/// Operation vector of a stream object.
///
/// `read`/`write` take the kernel lock token because pipe-backed streams
/// suspend; `close` never suspends.
pub(crate) trait Stream: Send + Sync {
    fn read(&self, _k: &mut KernelLock, _buf: &mut [u8]) -> SysResult<usize> {
        Err(SysError::NotSupported)
    }

    fn write(&self, _k: &mut KernelLock, _buf: &[u8]) -> SysResult<usize> {
        Err(SysError::NotSupported)
    }

    fn close(&self) -> SysResult<()>;

    /// Downcast hook for the socket syscalls.
    fn as_socket(&self) -> Option<SocketRef> {
        None
    }
}

struct Fcb {
    refcount: u32,
    stream: Arc<dyn Stream>,
}

pub(crate) struct FileTable {
    slots: Vec<Option<Fcb>>,
}

pub(crate) static FILE_TABLE: Mutex<FileTable> = Mutex::new(FileTable::new());

impl FileTable {
    const fn new() -> Self {
        FileTable { slots: Vec::new() }
    }

    fn reset(&mut self) {
        self.slots.clear();
        self.slots.resize_with(MAX_FILES, || None);
    }

    fn alloc(&mut self, stream: Arc<dyn Stream>) -> Option<usize> {
        let idx = self.slots.iter().position(|s| s.is_none())?;
        self.slots[idx] = Some(Fcb {
            refcount: 1,
            stream,
        });
        Some(idx)
    }

    fn free(&mut self, idx: usize) {
        self.slots[idx] = None;
    }

    fn get(&self, idx: usize) -> Option<&Fcb> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut Fcb> {
        self.slots.get_mut(idx).and_then(|s| s.as_mut())
    }
}

/// Add one reference to an FCB (fork-style FIDT inheritance).
pub(crate) fn incref(idx: usize) {
    if let Some(fcb) = FILE_TABLE.lock().get_mut(idx) {
        fcb.refcount += 1;
    }
}

/// Drop one reference; the last reference closes the stream and frees
/// the slot.
pub(crate) fn decref(idx: usize) -> SysResult<()> {
    let stream = {
        let mut table = FILE_TABLE.lock();
        let fcb = match table.get_mut(idx) {
            Some(fcb) => fcb,
            None => return Err(SysError::BadFileDescriptor),
        };
        fcb.refcount -= 1;
        if fcb.refcount > 0 {
            return Ok(());
        }
        let stream = fcb.stream.clone();
        table.free(idx);
        stream
    };
    stream.close()
}

/// Reserve one fid per stream in the current process, all or nothing.
pub(crate) fn reserve(streams: &[Arc<dyn Stream>]) -> SysResult<Vec<Fid>> {
    let pid = sched::current_pid().ok_or(SysError::NotFound)?;
    let mut pt = PROC_TABLE.lock();
    let pcb = pt.get_mut(pid).ok_or(SysError::NotFound)?;

    let free: Vec<usize> = (0..MAX_FILEID)
        .filter(|&i| pcb.fidt[i].is_none())
        .take(streams.len())
        .collect();
    if free.len() < streams.len() {
        return Err(SysError::TooManyOpenFiles);
    }

    let mut table = FILE_TABLE.lock();
    let mut indices = Vec::with_capacity(streams.len());
    for stream in streams {
        match table.alloc(stream.clone()) {
            Some(idx) => indices.push(idx),
            None => {
                for idx in indices {
                    table.free(idx);
                }
                return Err(SysError::TooManyOpenFiles);
            }
        }
    }

    let mut fids = Vec::with_capacity(streams.len());
    for (slot, idx) in free.into_iter().zip(indices) {
        pcb.fidt[slot] = Some(idx);
        fids.push(slot as Fid);
    }
    Ok(fids)
}

/// Resolve a fid of the current process to its stream object.
pub(crate) fn stream_of(fid: Fid) -> SysResult<Arc<dyn Stream>> {
    let pid = sched::current_pid().ok_or(SysError::NotFound)?;
    if fid < 0 || fid as usize >= MAX_FILEID {
        return Err(SysError::BadFileDescriptor);
    }
    let idx = PROC_TABLE
        .lock()
        .get(pid)
        .and_then(|pcb| pcb.fidt[fid as usize])
        .ok_or(SysError::BadFileDescriptor)?;
    FILE_TABLE
        .lock()
        .get(idx)
        .map(|fcb| fcb.stream.clone())
        .ok_or(SysError::BadFileDescriptor)
}

/// Read from an open fid. Blocks per the stream's semantics.
pub fn read(fid: Fid, buf: &mut [u8]) -> SysResult<usize> {
    let mut k = sched::lock();
    let stream = stream_of(fid)?;
    stream.read(&mut k, buf)
}

/// Write to an open fid. Blocks per the stream's semantics.
pub fn write(fid: Fid, buf: &[u8]) -> SysResult<usize> {
    let mut k = sched::lock();
    let stream = stream_of(fid)?;
    stream.write(&mut k, buf)
}

/// Close a fid of the current process.
pub fn close(fid: Fid) -> SysResult<()> {
    let _k = sched::lock();
    let pid = sched::current_pid().ok_or(SysError::NotFound)?;
    if fid < 0 || fid as usize >= MAX_FILEID {
        return Err(SysError::BadFileDescriptor);
    }
    let idx = {
        let mut pt = PROC_TABLE.lock();
        let pcb = pt.get_mut(pid).ok_or(SysError::NotFound)?;
        pcb.fidt[fid as usize]
            .take()
            .ok_or(SysError::BadFileDescriptor)?
    };
    decref(idx)
}

pub(crate) fn reset() {
    FILE_TABLE.lock().reset();
}
