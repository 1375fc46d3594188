//! The process table and the process lifecycle syscalls.
//!
//! A process slot moves FREE → ALIVE → ZOMBIE → FREE. The pid is the
//! slot index; pid 0 is the idle/scheduler slot and never runs user
//! threads, pid 1 is init and adopts every orphan. A ZOMBIE keeps its
//! exit value until the parent reaps it through `WaitChild`.
//!
//! The children set and the exited-children list of a PCB are disjoint:
//! a live child sits in `children`, a zombie child sits in `exited`
//! (ordered by exit time). The parent pointer of a child is reciprocal
//! with its presence in exactly one of the two.

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashSet;
use spin::Mutex;

use minnow_api::{
    Pid, ProcInfo, SysError, SysResult, Task, MAX_FILEID, MAX_PROC, NOPROC,
    PROCINFO_MAX_ARGS_SIZE,
};

use crate::file;
use crate::sched::{self, Cond, KernelLock, WaitClass};
use crate::thread::{self, ThreadArena};

/// Lifecycle state of a process table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcState {
    Free,
    Alive,
    Zombie,
}

/// Process control block.
pub(crate) struct Pcb {
    pub state: ProcState,
    pub parent: Option<Pid>,
    pub children: HashSet<Pid>,
    /// Zombie children in exit order; `WaitChild(any)` pops the head.
    pub exited: VecDeque<Pid>,
    pub main_task: Option<Task>,
    pub args: Option<Arc<[u8]>>,
    pub exitval: i32,
    /// Threads of this process that have not yet exited.
    pub thread_count: u32,
    pub threads: ThreadArena,
    pub fidt: [Option<usize>; MAX_FILEID],
    /// Signalled whenever one of this process's children turns ZOMBIE.
    pub child_exit: Cond,
}

impl Pcb {
    fn free_slot() -> Self {
        Pcb {
            state: ProcState::Free,
            parent: None,
            children: HashSet::new(),
            exited: VecDeque::new(),
            main_task: None,
            args: None,
            exitval: 0,
            thread_count: 0,
            threads: ThreadArena::new(),
            fidt: [None; MAX_FILEID],
            child_exit: Cond::new(),
        }
    }
}

pub(crate) struct ProcTable {
    slots: Vec<Pcb>,
}

pub(crate) static PROC_TABLE: Mutex<ProcTable> = Mutex::new(ProcTable::new());

impl ProcTable {
    const fn new() -> Self {
        ProcTable { slots: Vec::new() }
    }

    fn reset(&mut self) {
        self.slots.clear();
        self.slots.resize_with(MAX_PROC, Pcb::free_slot);
    }

    /// First free slot becomes ALIVE; the pid is the slot index.
    fn alloc(&mut self) -> Option<Pid> {
        let idx = self
            .slots
            .iter()
            .position(|p| p.state == ProcState::Free)?;
        self.slots[idx] = Pcb::free_slot();
        self.slots[idx].state = ProcState::Alive;
        Some(idx as Pid)
    }

    fn release(&mut self, pid: Pid) {
        self.slots[pid as usize] = Pcb::free_slot();
    }

    /// Non-FREE slot lookup.
    pub(crate) fn get(&self, pid: Pid) -> Option<&Pcb> {
        if pid < 0 || pid as usize >= self.slots.len() {
            return None;
        }
        let pcb = &self.slots[pid as usize];
        (pcb.state != ProcState::Free).then_some(pcb)
    }

    pub(crate) fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        if pid < 0 || pid as usize >= self.slots.len() {
            return None;
        }
        let pcb = &mut self.slots[pid as usize];
        (pcb.state != ProcState::Free).then_some(pcb)
    }

    /// Hand every child of `dying` to init: live children move into
    /// init's children set, zombies splice onto init's exited list, and
    /// each child's parent pointer is rewritten.
    fn reparent_to_init(&mut self, dying: Pid) {
        let children: Vec<Pid> = self.slots[dying as usize].children.drain().collect();
        for &c in &children {
            self.slots[c as usize].parent = Some(1);
            self.slots[1].children.insert(c);
        }
        let exited = std::mem::take(&mut self.slots[dying as usize].exited);
        if !exited.is_empty() {
            for &c in &exited {
                self.slots[c as usize].parent = Some(1);
            }
            self.slots[1].exited.extend(exited);
            self.slots[1].child_exit.broadcast();
        }
    }

    /// Index of the first non-FREE slot at or after `start`.
    pub(crate) fn next_occupied(&self, start: usize) -> Option<usize> {
        (start..self.slots.len()).find(|&idx| self.slots[idx].state != ProcState::Free)
    }

    /// Introspection record of the slot at `idx`, which must be
    /// non-FREE. The argument copy is truncated to the inline buffer.
    pub(crate) fn info_record(&self, idx: usize) -> ProcInfo {
        let pcb = &self.slots[idx];
        debug_assert_ne!(pcb.state, ProcState::Free);
        let argl = pcb.args.as_ref().map(|a| a.len()).unwrap_or(0);
        let mut args = [0u8; PROCINFO_MAX_ARGS_SIZE];
        let ncopy = argl.min(PROCINFO_MAX_ARGS_SIZE);
        if let Some(a) = &pcb.args {
            args[..ncopy].copy_from_slice(&a[..ncopy]);
        }
        ProcInfo {
            pid: idx as Pid,
            ppid: pcb.parent.unwrap_or(NOPROC),
            alive: pcb.state == ProcState::Alive,
            thread_count: pcb.thread_count,
            main_task: pcb.main_task.map(|t| t as usize as u64).unwrap_or(0),
            argl: argl as u32,
            args,
        }
    }

    /// Reap a zombie child: remove it from both parent lists and free
    /// the slot. Returns its exit value.
    fn reap(&mut self, parent: Pid, child: Pid) -> i32 {
        debug_assert_eq!(self.slots[child as usize].state, ProcState::Zombie);
        let status = self.slots[child as usize].exitval;
        let p = &mut self.slots[parent as usize];
        p.children.remove(&child);
        if let Some(pos) = p.exited.iter().position(|&c| c == child) {
            p.exited.remove(pos);
        }
        self.release(child);
        status
    }
}

/// Create a new process running `task` with a private copy of `args`.
///
/// For pids above 1 the new process becomes a child of the caller and
/// inherits every open fid. With no task the slot is allocated but no
/// thread is spawned (the idle slot is made this way).
pub fn exec(task: Option<Task>, args: Option<&[u8]>) -> SysResult<Pid> {
    let mut k = sched::lock();
    do_exec(&mut k, task, args)
}

pub(crate) fn do_exec(
    _k: &mut KernelLock,
    task: Option<Task>,
    args: Option<&[u8]>,
) -> SysResult<Pid> {
    let pid = PROC_TABLE.lock().alloc().ok_or(SysError::OutOfMemory)?;
    // Fresh storage owned by the new process.
    let owned_args: Option<Arc<[u8]>> = args.map(Arc::from);

    if pid > 1 {
        // Processes with pid <= 1 (idle and init) are parentless.
        let parent = match sched::current_pid() {
            Some(p) => p,
            None => {
                PROC_TABLE.lock().release(pid);
                return Err(SysError::NotFound);
            }
        };
        let inherited = {
            let mut pt = PROC_TABLE.lock();
            let fidt = pt.get(parent).map(|p| p.fidt).unwrap_or([None; MAX_FILEID]);
            if let Some(p) = pt.get_mut(parent) {
                p.children.insert(pid);
            }
            let child = pt.get_mut(pid).expect("freshly allocated slot");
            child.parent = Some(parent);
            child.fidt = fidt;
            fidt
        };
        for idx in inherited.iter().flatten() {
            file::incref(*idx);
        }
    }

    {
        let mut pt = PROC_TABLE.lock();
        let pcb = pt.get_mut(pid).expect("freshly allocated slot");
        pcb.main_task = task;
        pcb.args = owned_args.clone();
    }

    if let Some(task) = task {
        let tid = {
            let mut pt = PROC_TABLE.lock();
            let pcb = pt.get_mut(pid).expect("freshly allocated slot");
            let tid = thread::install_main(pcb, pid, task, owned_args);
            pcb.thread_count = 1;
            tid
        };
        let tcb = sched::spawn(pid, tid, thread::run_main);
        // Wake the main thread last, once the PCB is fully initialized.
        sched::wakeup(&tcb);
    }
    log::debug!("exec'd pid {}", pid);
    Ok(pid)
}

/// Pid of the calling process, or `NOPROC` outside one.
pub fn get_pid() -> Pid {
    sched::current_pid().unwrap_or(NOPROC)
}

/// Pid of the calling process's parent, or `NOPROC` when parentless.
pub fn get_ppid() -> Pid {
    let _k = sched::lock();
    match sched::current_pid() {
        Some(me) => PROC_TABLE
            .lock()
            .get(me)
            .and_then(|p| p.parent)
            .unwrap_or(NOPROC),
        None => NOPROC,
    }
}

/// Reap a child: a specific one (`Some(cpid)`) or any zombie child
/// (`None`). Returns the reaped pid and its exit value.
pub fn wait_child(cpid: Option<Pid>) -> SysResult<(Pid, i32)> {
    let mut k = sched::lock();
    match cpid {
        Some(cpid) => wait_specific(&mut k, cpid),
        None => wait_any(&mut k),
    }
}

fn wait_specific(k: &mut KernelLock, cpid: Pid) -> SysResult<(Pid, i32)> {
    let me = sched::current_pid().ok_or(SysError::NotFound)?;
    if cpid < 0 || cpid as usize >= MAX_PROC {
        return Err(SysError::NotFound);
    }
    let cv = {
        let pt = PROC_TABLE.lock();
        let child = pt.get(cpid).ok_or(SysError::NotFound)?;
        if child.parent != Some(me) {
            return Err(SysError::NotFound);
        }
        pt.get(me).ok_or(SysError::NotFound)?.child_exit.clone()
    };
    loop {
        {
            let mut pt = PROC_TABLE.lock();
            // Re-validate after every wakeup: another thread of this
            // process may have reaped the child meanwhile.
            let child = pt.get(cpid).ok_or(SysError::NotFound)?;
            if child.parent != Some(me) {
                return Err(SysError::NotFound);
            }
            if child.state == ProcState::Zombie {
                let status = pt.reap(me, cpid);
                return Ok((cpid, status));
            }
        }
        cv.wait(k, WaitClass::User);
    }
}

fn wait_any(k: &mut KernelLock) -> SysResult<(Pid, i32)> {
    let me = sched::current_pid().ok_or(SysError::NotFound)?;
    let cv = {
        let pt = PROC_TABLE.lock();
        pt.get(me).ok_or(SysError::NotFound)?.child_exit.clone()
    };
    loop {
        {
            let mut pt = PROC_TABLE.lock();
            let pcb = pt.get(me).ok_or(SysError::NotFound)?;
            if pcb.children.is_empty() && pcb.exited.is_empty() {
                return Err(SysError::NotFound);
            }
            let oldest = pcb.exited.front().copied();
            if let Some(child) = oldest {
                let status = pt.reap(me, child);
                return Ok((child, status));
            }
        }
        cv.wait(k, WaitClass::User);
    }
}

/// Terminate the calling process with `exitval`. Init drains its
/// children first. Does not return.
pub fn exit(exitval: i32) -> ! {
    do_exit(exitval);
    sched::terminate();
}

/// Exit bookkeeping shared by `exit` and a returning main task.
pub(crate) fn do_exit(exitval: i32) {
    let mut k = sched::lock();
    let me = sched::current_pid().expect("exit outside a process");
    if let Some(pcb) = PROC_TABLE.lock().get_mut(me) {
        pcb.exitval = exitval;
    }
    if me == 1 {
        // Init adopts every orphan, so it reaps until nothing is left.
        while wait_any(&mut k).is_ok() {}
    }
    thread::do_thread_exit(&mut k, exitval);
}

/// Last-thread policy: hand children to init, report to the parent,
/// then scrub the PCB down to a ZOMBIE.
pub(crate) fn last_thread_cleanup(k: &mut KernelLock, pid: Pid) {
    {
        let mut pt = PROC_TABLE.lock();
        if pid != 1 {
            pt.reparent_to_init(pid);
            debug_assert!(pt.slots[pid as usize].children.is_empty());
            debug_assert!(pt.slots[pid as usize].exited.is_empty());
            let parent = pt.slots[pid as usize]
                .parent
                .expect("non-init process without parent");
            let p = &mut pt.slots[parent as usize];
            p.children.remove(&pid);
            p.exited.push_back(pid);
            p.child_exit.broadcast();
        }
    }
    cleanup(k, pid);
}

fn cleanup(_k: &mut KernelLock, pid: Pid) {
    let fidt = {
        let mut pt = PROC_TABLE.lock();
        let pcb = match pt.get_mut(pid) {
            Some(pcb) => pcb,
            None => return,
        };
        pcb.args = None;
        pcb.threads.clear();
        std::mem::replace(&mut pcb.fidt, [None; MAX_FILEID])
    };
    for idx in fidt.iter().flatten() {
        let _ = file::decref(*idx);
    }
    if let Some(pcb) = PROC_TABLE.lock().get_mut(pid) {
        pcb.state = ProcState::Zombie;
    }
    log::debug!("pid {} is now a zombie", pid);
}

/// Exit value of a (zombie) slot; used by `boot` to report init.
pub(crate) fn exit_status_of(pid: Pid) -> i32 {
    PROC_TABLE.lock().get(pid).map(|p| p.exitval).unwrap_or(-1)
}

pub(crate) fn reset() {
    PROC_TABLE.lock().reset();
}
