//! Per-process threads: the PTCB arena and the thread syscalls.
//!
//! A [`Tid`] is a generation-tagged handle (pid | arena slot |
//! generation) into its process's thread arena. A freed slot bumps its
//! generation, so a stale or foreign handle simply fails lookup; handles
//! are never dereferenced.
//!
//! PTCB lifetime: `exited` and `detached` are monotonic flags. The join
//! reference count tracks blocked joiners; the last successful joiner
//! removes the PTCB, and anything still in the arena is dropped by
//! process cleanup.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::Result as TaskResult;

use minnow_api::{Pid, SysError, SysResult, Task, Tid};

use crate::process::{self, PROC_TABLE};
use crate::sched::{self, Cond, KernelLock, WaitClass};

/// One per-process thread descriptor.
pub(crate) struct Ptcb {
    pub task: Task,
    /// Shared view of the argument buffer; the PCB (or the
    /// `CreateThread` caller) owns the bytes.
    pub args: Option<Arc<[u8]>>,
    pub exitval: i32,
    pub exited: bool,
    pub detached: bool,
    /// Number of joiners currently blocked on `exit_cv`.
    pub ref_count: u32,
    pub exit_cv: Cond,
}

impl Ptcb {
    fn new(task: Task, args: Option<Arc<[u8]>>) -> Self {
        Ptcb {
            task,
            args,
            exitval: 0,
            exited: false,
            detached: false,
            ref_count: 0,
            exit_cv: Cond::new(),
        }
    }
}

struct ArenaSlot {
    gen: u32,
    ptcb: Option<Ptcb>,
}

/// Generation-tagged PTCB storage, one arena per process.
#[derive(Default)]
pub(crate) struct ThreadArena {
    slots: Vec<ArenaSlot>,
}

impl ThreadArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, ptcb: Ptcb) -> (usize, u32) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.ptcb.is_none() {
                slot.ptcb = Some(ptcb);
                return (i, slot.gen);
            }
        }
        self.slots.push(ArenaSlot {
            gen: 1,
            ptcb: Some(ptcb),
        });
        (self.slots.len() - 1, 1)
    }

    fn get(&self, slot: usize, gen: u32) -> Option<&Ptcb> {
        let s = self.slots.get(slot)?;
        if s.gen != gen {
            return None;
        }
        s.ptcb.as_ref()
    }

    fn get_mut(&mut self, slot: usize, gen: u32) -> Option<&mut Ptcb> {
        let s = self.slots.get_mut(slot)?;
        if s.gen != gen {
            return None;
        }
        s.ptcb.as_mut()
    }

    fn remove(&mut self, slot: usize, gen: u32) -> Option<Ptcb> {
        let s = self.slots.get_mut(slot)?;
        if s.gen != gen {
            return None;
        }
        let ptcb = s.ptcb.take();
        if ptcb.is_some() {
            s.gen += 1;
        }
        ptcb
    }

    /// Drop every remaining PTCB (process cleanup).
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            if slot.ptcb.take().is_some() {
                slot.gen += 1;
            }
        }
    }
}

/// Install the main-thread PTCB of a freshly exec'd process and hand
/// back its handle.
pub(crate) fn install_main(
    pcb: &mut crate::process::Pcb,
    pid: Pid,
    task: Task,
    args: Option<Arc<[u8]>>,
) -> Tid {
    let (slot, gen) = pcb.threads.insert(Ptcb::new(task, args));
    pack_tid(pid, slot, gen)
}

fn pack_tid(pid: Pid, slot: usize, gen: u32) -> Tid {
    ((gen as u64) << 32) | (((slot as u64) & 0xffff) << 16) | ((pid as u16) as u64)
}

fn unpack_tid(tid: Tid) -> (Pid, usize, u32) {
    let pid = (tid & 0xffff) as Pid;
    let slot = ((tid >> 16) & 0xffff) as usize;
    let gen = (tid >> 32) as u32;
    (pid, slot, gen)
}

/// Create a thread in the current process running `task`.
///
/// The argument buffer is shared, not copied; the caller keeps
/// ownership. Returns the new thread's handle.
pub fn create_thread(task: Task, args: Option<Arc<[u8]>>) -> SysResult<Tid> {
    let _k = sched::lock();
    let pid = sched::current_pid().ok_or(SysError::NotFound)?;
    let tid = {
        let mut pt = PROC_TABLE.lock();
        let pcb = pt.get_mut(pid).ok_or(SysError::NotFound)?;
        let (slot, gen) = pcb.threads.insert(Ptcb::new(task, args));
        pcb.thread_count += 1;
        pack_tid(pid, slot, gen)
    };
    let tcb = sched::spawn(pid, tid, run_secondary);
    // Runnable last: the PTCB is fully initialized by now.
    sched::wakeup(&tcb);
    log::debug!("pid {} created thread {:#x}", pid, tid);
    Ok(tid)
}

/// Handle of the calling thread.
pub fn thread_self() -> Tid {
    sched::current_tid()
}

/// Join a thread of the current process and collect its exit value.
///
/// Fails when the handle does not name a live thread of this process,
/// names the caller itself, or the target is (or becomes) detached.
pub fn thread_join(tid: Tid) -> SysResult<i32> {
    let mut k = sched::lock();
    let me = sched::current_pid().ok_or(SysError::NotFound)?;
    if tid == sched::current_tid() {
        return Err(SysError::InvalidArgument);
    }
    let (tpid, slot, gen) = unpack_tid(tid);
    if tpid != me {
        return Err(SysError::NotFound);
    }

    let cv = {
        let mut pt = PROC_TABLE.lock();
        let pcb = pt.get_mut(me).ok_or(SysError::NotFound)?;
        let ptcb = pcb
            .threads
            .get_mut(slot, gen)
            .ok_or(SysError::NotFound)?;
        if ptcb.detached {
            return Err(SysError::InvalidArgument);
        }
        ptcb.ref_count += 1;
        ptcb.exit_cv.clone()
    };

    loop {
        let done = {
            let pt = PROC_TABLE.lock();
            match pt.get(me).and_then(|pcb| pcb.threads.get(slot, gen)) {
                Some(ptcb) => ptcb.exited || ptcb.detached,
                None => true,
            }
        };
        if done {
            break;
        }
        cv.wait(&mut k, WaitClass::User);
    }

    let mut pt = PROC_TABLE.lock();
    let pcb = pt.get_mut(me).ok_or(SysError::NotFound)?;
    let ptcb = pcb
        .threads
        .get_mut(slot, gen)
        .ok_or(SysError::NotFound)?;
    ptcb.ref_count -= 1;
    if ptcb.detached {
        // Woken because the target was detached: no exit value.
        return Err(SysError::InvalidArgument);
    }
    let exitval = ptcb.exitval;
    if ptcb.ref_count == 0 {
        // Last joiner removes the descriptor.
        pcb.threads.remove(slot, gen);
    }
    Ok(exitval)
}

/// Detach a thread of the current process, releasing all joiners.
pub fn thread_detach(tid: Tid) -> SysResult<()> {
    let _k = sched::lock();
    let me = sched::current_pid().ok_or(SysError::NotFound)?;
    let (tpid, slot, gen) = unpack_tid(tid);
    if tpid != me {
        return Err(SysError::NotFound);
    }
    let mut pt = PROC_TABLE.lock();
    let pcb = pt.get_mut(me).ok_or(SysError::NotFound)?;
    let ptcb = pcb
        .threads
        .get_mut(slot, gen)
        .ok_or(SysError::NotFound)?;
    if ptcb.exited {
        return Err(SysError::InvalidArgument);
    }
    ptcb.detached = true;
    ptcb.exit_cv.broadcast();
    Ok(())
}

/// Terminate the calling thread with `exitval`. Does not return.
pub fn thread_exit(exitval: i32) -> ! {
    let mut k = sched::lock();
    do_thread_exit(&mut k, exitval);
    drop(k);
    sched::terminate();
}

/// Exit bookkeeping of the calling thread: record the exit value, wake
/// joiners, and run process cleanup when this was the last live thread.
pub(crate) fn do_thread_exit(k: &mut KernelLock, exitval: i32) {
    let pid = sched::current_pid().expect("thread exit outside a process");
    let (_, slot, gen) = unpack_tid(sched::current_tid());
    let last = {
        let mut pt = PROC_TABLE.lock();
        let pcb = match pt.get_mut(pid) {
            Some(pcb) => pcb,
            None => return,
        };
        if let Some(ptcb) = pcb.threads.get_mut(slot, gen) {
            ptcb.exitval = exitval;
            ptcb.exited = true;
            ptcb.exit_cv.broadcast();
        }
        pcb.thread_count -= 1;
        pcb.thread_count == 0
    };
    log::debug!("pid {} thread {:#x} exited ({})", pid, sched::current_tid(), exitval);
    if last {
        process::last_thread_cleanup(k, pid);
    }
}

/// Carrier body of a process main thread: run the PCB's main task and
/// `Exit` with its return value.
pub(crate) fn run_main() {
    let (task, args) = {
        let _k = sched::lock();
        let pid = sched::current_pid().expect("main thread without a process");
        let pt = PROC_TABLE.lock();
        let pcb = pt.get(pid).expect("main thread of a freed slot");
        (pcb.main_task.expect("main thread without a task"), pcb.args.clone())
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| task(args.as_deref().unwrap_or(&[]))));
    match result {
        Ok(exitval) => process::do_exit(exitval),
        other => finish_abnormal(other),
    }
}

/// Carrier body of a `CreateThread` thread: run its PTCB's task and
/// `ThreadExit` with its return value.
pub(crate) fn run_secondary() {
    let (task, args) = {
        let _k = sched::lock();
        let pid = sched::current_pid().expect("thread without a process");
        let (_, slot, gen) = unpack_tid(sched::current_tid());
        let pt = PROC_TABLE.lock();
        let ptcb = pt
            .get(pid)
            .and_then(|pcb| pcb.threads.get(slot, gen))
            .expect("spawned thread without a descriptor");
        (ptcb.task, ptcb.args.clone())
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| task(args.as_deref().unwrap_or(&[]))));
    match result {
        Ok(exitval) => {
            let mut k = sched::lock();
            do_thread_exit(&mut k, exitval);
        }
        other => finish_abnormal(other),
    }
}

fn finish_abnormal(result: TaskResult<i32>) {
    let payload = match result {
        Ok(_) => return,
        Err(payload) => payload,
    };
    if payload.downcast_ref::<crate::sched::ThreadTerminate>().is_some() {
        // Clean exit through thread_exit()/exit(); bookkeeping is done.
        return;
    }
    let msg = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("non-string panic payload");
    log::error!(
        "panic escaped task on tid {:#x}: {}",
        sched::current_tid(),
        msg
    );
    sched::record_fault();
    let mut k = sched::lock();
    do_thread_exit(&mut k, -1);
}
