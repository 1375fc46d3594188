//! Bounded byte pipes.
//!
//! A pipe is a ring of `PIPE_BUFFER_SIZE` bytes shared by exactly one
//! reader end and one writer end, both plain stream objects. The ring
//! is empty iff `r == w` and full iff `w + 1 == r (mod B)`, so the
//! usable capacity is one byte less than the ring.
//!
//! A full ring blocks writers on `has_space`, an empty ring blocks
//! readers on `has_data`; a vanished reader fails writers, a vanished
//! writer turns an empty ring into end-of-stream. Bytes come out in the
//! exact order they went in.

use std::sync::Arc;

use spin::Mutex;

use minnow_api::{Fid, SysError, SysResult, PIPE_BUFFER_SIZE};

use crate::file::{self, Stream};
use crate::sched::{self, Cond, KernelLock, WaitClass};

/// Pipe control block.
pub(crate) struct PipeCb {
    buffer: Box<[u8]>,
    r: usize,
    w: usize,
    reader_open: bool,
    writer_open: bool,
    has_space: Cond,
    has_data: Cond,
}

pub(crate) type PipeRef = Arc<Mutex<PipeCb>>;

impl PipeCb {
    fn new() -> Self {
        PipeCb {
            buffer: vec![0u8; PIPE_BUFFER_SIZE].into_boxed_slice(),
            r: 0,
            w: 0,
            reader_open: true,
            writer_open: true,
            has_space: Cond::new(),
            has_data: Cond::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.r == self.w
    }

    fn is_full(&self) -> bool {
        (self.w + 1) % self.buffer.len() == self.r
    }
}

/// A fresh pipe control block with both ends open.
pub(crate) fn new_pipe() -> PipeRef {
    Arc::new(Mutex::new(PipeCb::new()))
}

/// Write up to `buf.len()` bytes into the pipe, blocking while the ring
/// is full and the reader is still around. Returns the number of bytes
/// accepted in one pass over the free space; callers loop for more.
pub(crate) fn pipe_write(pipe: &PipeRef, k: &mut KernelLock, buf: &[u8]) -> SysResult<usize> {
    {
        let p = pipe.lock();
        if !p.writer_open {
            return Err(SysError::BadFileDescriptor);
        }
        if !p.reader_open {
            return Err(SysError::BrokenPipe);
        }
    }
    loop {
        let cv = {
            let mut p = pipe.lock();
            if !p.reader_open {
                return Err(SysError::BrokenPipe);
            }
            if !p.is_full() {
                let cap = p.buffer.len();
                let mut n = 0;
                while n < buf.len() && !p.is_full() {
                    let w = p.w;
                    p.buffer[w] = buf[n];
                    p.w = (w + 1) % cap;
                    n += 1;
                }
                p.has_data.broadcast();
                return Ok(n);
            }
            p.has_space.clone()
        };
        cv.wait(k, WaitClass::Pipe);
    }
}

/// Read up to `buf.len()` bytes, blocking while the ring is empty and
/// the writer is still around. `Ok(0)` is end-of-stream.
pub(crate) fn pipe_read(pipe: &PipeRef, k: &mut KernelLock, buf: &mut [u8]) -> SysResult<usize> {
    loop {
        let cv = {
            let mut p = pipe.lock();
            if !p.reader_open {
                return Err(SysError::BadFileDescriptor);
            }
            if !p.is_empty() {
                let cap = p.buffer.len();
                let mut n = 0;
                while n < buf.len() && !p.is_empty() {
                    let r = p.r;
                    buf[n] = p.buffer[r];
                    p.r = (r + 1) % cap;
                    n += 1;
                }
                p.has_space.broadcast();
                return Ok(n);
            }
            if !p.writer_open {
                return Ok(0);
            }
            p.has_data.clone()
        };
        cv.wait(k, WaitClass::Pipe);
    }
}

/// Close the writer end. Readers of a drained ring then see
/// end-of-stream. Closing an already-closed end is an error.
pub(crate) fn close_writer(pipe: &PipeRef) -> SysResult<()> {
    let mut p = pipe.lock();
    if !p.writer_open {
        return Err(SysError::BadFileDescriptor);
    }
    p.writer_open = false;
    // Broadcast before the block can go away with the guard.
    p.has_data.broadcast();
    Ok(())
}

/// Close the reader end. Blocked and future writers fail.
pub(crate) fn close_reader(pipe: &PipeRef) -> SysResult<()> {
    let mut p = pipe.lock();
    if !p.reader_open {
        return Err(SysError::BadFileDescriptor);
    }
    p.reader_open = false;
    p.has_space.broadcast();
    Ok(())
}

struct PipeReader {
    pipe: PipeRef,
}

impl Stream for PipeReader {
    fn read(&self, k: &mut KernelLock, buf: &mut [u8]) -> SysResult<usize> {
        pipe_read(&self.pipe, k, buf)
    }

    fn close(&self) -> SysResult<()> {
        close_reader(&self.pipe)
    }
}

struct PipeWriter {
    pipe: PipeRef,
}

impl Stream for PipeWriter {
    fn write(&self, k: &mut KernelLock, buf: &[u8]) -> SysResult<usize> {
        pipe_write(&self.pipe, k, buf)
    }

    fn close(&self) -> SysResult<()> {
        close_writer(&self.pipe)
    }
}

/// Create a pipe in the current process. Returns `(reader, writer)`
/// fids over one shared control block.
pub fn pipe() -> SysResult<(Fid, Fid)> {
    let _k = sched::lock();
    let cb = new_pipe();
    let reader: Arc<dyn Stream> = Arc::new(PipeReader { pipe: cb.clone() });
    let writer: Arc<dyn Stream> = Arc::new(PipeWriter { pipe: cb });
    let fids = file::reserve(&[reader, writer])?;
    Ok((fids[0], fids[1]))
}
