//! Read-only introspection stream over the process table.
//!
//! Each read yields exactly one encoded record for the next non-FREE
//! slot, ascending from pid 1; a read of 0 bytes is end-of-table. The
//! cursor skips FREE slots, so only live and zombie processes are
//! reported. The stream cannot be written.

use std::sync::Arc;

use spin::Mutex;

use minnow_api::{Fid, SysError, SysResult, PROCINFO_RECORD_SIZE};

use crate::file::{self, Stream};
use crate::process::PROC_TABLE;
use crate::sched::{self, KernelLock};

struct InfoStream {
    /// Next slot to report; `None` once the table is exhausted.
    cursor: Mutex<Option<usize>>,
}

impl Stream for InfoStream {
    fn read(&self, _k: &mut KernelLock, buf: &mut [u8]) -> SysResult<usize> {
        let mut cursor = self.cursor.lock();
        let start = match *cursor {
            Some(start) => start,
            None => return Ok(0),
        };
        let pt = PROC_TABLE.lock();
        let idx = match pt.next_occupied(start) {
            Some(idx) => idx,
            None => {
                *cursor = None;
                return Ok(0);
            }
        };
        let info = pt.info_record(idx);
        info.encode(buf).ok_or(SysError::InvalidArgument)?;
        *cursor = pt.next_occupied(idx + 1);
        Ok(PROCINFO_RECORD_SIZE)
    }

    fn close(&self) -> SysResult<()> {
        // The cursor goes away with the stream object.
        Ok(())
    }
}

/// Open the process-information stream. Records start at pid 1.
pub fn open_info() -> SysResult<Fid> {
    let _k = sched::lock();
    let stream: Arc<dyn Stream> = Arc::new(InfoStream {
        cursor: Mutex::new(Some(1)),
    });
    let fids = file::reserve(&[stream])?;
    Ok(fids[0])
}
