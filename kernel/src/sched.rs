//! Scheduler surface: the big kernel lock, condition variables and
//! kernel threads.
//!
//! The kernel is cooperative and runs under a single big kernel mutex.
//! Every syscall acquires it on entry ([`lock`]) and holds it until the
//! call returns; only [`Cond::wait`] and [`Cond::timedwait`] release it
//! while the caller is blocked. Broadcasts and signals are wakeup hints
//! and every waiter re-checks its predicate in a loop.
//!
//! Kernel threads are carried by host threads. A freshly spawned thread
//! is parked on a start gate until [`wakeup`] is called on its [`Tcb`],
//! so the creator can finish initializing control blocks before the
//! thread can run.

use std::cell::Cell;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Once};
use std::thread;
use std::time::Duration;

use minnow_api::{Pid, Tid, NOPROC, NOTHREAD};

static BIG_LOCK: Mutex<()> = Mutex::new(());
static QUIESCENT: Condvar = Condvar::new();
static LIVE_THREADS: AtomicUsize = AtomicUsize::new(0);
static KERNEL_FAULT: AtomicBool = AtomicBool::new(false);

thread_local! {
    static CURRENT: Cell<(Pid, Tid)> = Cell::new((NOPROC, NOTHREAD));
}

/// Scheduling class recorded at a suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitClass {
    /// Thread join and child reaping.
    User,
    /// Pipe backpressure and end-of-stream.
    Pipe,
    /// Socket rendezvous.
    Io,
}

/// Token proving the big kernel lock is held.
///
/// Move-only; threaded through every internal operation that may
/// suspend. Dropping it releases the lock.
pub struct KernelLock {
    guard: Option<MutexGuard<'static, ()>>,
}

fn acquire() -> MutexGuard<'static, ()> {
    BIG_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Acquire the big kernel lock.
pub fn lock() -> KernelLock {
    KernelLock {
        guard: Some(acquire()),
    }
}

impl KernelLock {
    fn wait_on(&mut self, cv: &Condvar) {
        let guard = self.guard.take().expect("wait without the kernel lock");
        self.guard = Some(cv.wait(guard).unwrap_or_else(|e| e.into_inner()));
    }

    /// Returns false if the wait ended by timeout.
    fn wait_on_timeout(&mut self, cv: &Condvar, timeout: Duration) -> bool {
        let guard = self.guard.take().expect("wait without the kernel lock");
        let (guard, result) = cv
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
        self.guard = Some(guard);
        !result.timed_out()
    }
}

/// A condition variable handle.
///
/// Cheap to clone; clones wake the same set of waiters. All waits happen
/// under the big kernel lock, which is released while blocked and
/// reacquired before the wait returns.
#[derive(Clone, Default)]
pub struct Cond {
    cv: Arc<Condvar>,
}

impl Cond {
    /// A fresh condition variable with no waiters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until woken. Wakeups are hints; callers loop on their
    /// predicate.
    pub fn wait(&self, k: &mut KernelLock, class: WaitClass) {
        log::trace!("tid {:#x} waits ({:?})", current_tid(), class);
        k.wait_on(&self.cv);
    }

    /// Block until woken or until `timeout` elapses. Returns false on
    /// timeout.
    pub fn timedwait(&self, k: &mut KernelLock, class: WaitClass, timeout: Duration) -> bool {
        log::trace!(
            "tid {:#x} waits ({:?}) for at most {:?}",
            current_tid(),
            class,
            timeout
        );
        k.wait_on_timeout(&self.cv, timeout)
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        self.cv.notify_one();
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        self.cv.notify_all();
    }
}

/// Kernel thread handle, parked until [`wakeup`].
pub struct Tcb {
    runnable: Arc<AtomicBool>,
    gate: Cond,
}

/// Unwind payload of a cleanly exiting kernel thread.
pub(crate) struct ThreadTerminate;

/// Spawn a kernel thread for `(pid, tid)` running `body`.
///
/// The thread blocks on its start gate before touching any kernel state;
/// it becomes runnable only once [`wakeup`] is called on the returned
/// [`Tcb`]. The thread is accounted for immediately so that
/// [`await_quiescence`] cannot miss it.
pub(crate) fn spawn<F>(pid: Pid, tid: Tid, body: F) -> Tcb
where
    F: FnOnce() + Send + 'static,
{
    let runnable = Arc::new(AtomicBool::new(false));
    let gate = Cond::new();
    let tcb = Tcb {
        runnable: runnable.clone(),
        gate: gate.clone(),
    };
    LIVE_THREADS.fetch_add(1, Ordering::SeqCst);
    let name = format!("minnow-pid{}-tid{:#x}", pid, tid);
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            CURRENT.with(|c| c.set((pid, tid)));
            let mut k = lock();
            while !runnable.load(Ordering::SeqCst) {
                gate.wait(&mut k, WaitClass::User);
            }
            drop(k);
            body();
            // Last action of every kernel thread: report quiescence to
            // boot under the big lock so the wakeup cannot be missed.
            let guard = acquire();
            LIVE_THREADS.fetch_sub(1, Ordering::SeqCst);
            QUIESCENT.notify_all();
            drop(guard);
        })
        .expect("host thread spawn failed");
    tcb
}

/// Make a parked kernel thread runnable. Called with the big lock held,
/// after its control blocks are fully initialized.
pub(crate) fn wakeup(tcb: &Tcb) {
    tcb.runnable.store(true, Ordering::SeqCst);
    tcb.gate.broadcast();
}

/// Terminal transition of an exiting kernel thread. Must be called
/// without the big lock held; unwinds the carrier thread.
pub(crate) fn terminate() -> ! {
    panic::panic_any(ThreadTerminate);
}

/// Install a panic hook that keeps quiet about [`ThreadTerminate`]
/// unwinds while leaving real panics visible.
pub(crate) fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ThreadTerminate>().is_none() {
                previous(info);
            }
        }));
    });
}

/// Identity of the current kernel thread's process, if any.
pub fn current_pid() -> Option<Pid> {
    let (pid, _) = CURRENT.with(|c| c.get());
    (pid != NOPROC).then_some(pid)
}

/// Identity of the current kernel thread. `NOTHREAD` outside a task.
pub fn current_tid() -> Tid {
    CURRENT.with(|c| c.get()).1
}

/// Record a fault: a panic escaped a task. Reported by `boot`.
pub(crate) fn record_fault() {
    KERNEL_FAULT.store(true, Ordering::SeqCst);
}

/// Reset scheduler bookkeeping for a fresh boot.
pub(crate) fn reset() {
    let stale = LIVE_THREADS.swap(0, Ordering::SeqCst);
    if stale != 0 {
        log::warn!("{} kernel thread(s) leaked by a previous run", stale);
    }
    KERNEL_FAULT.store(false, Ordering::SeqCst);
}

/// Block until every kernel thread has exited. Returns true if a fault
/// was recorded while the system ran.
pub(crate) fn await_quiescence(k: &mut KernelLock) -> bool {
    while LIVE_THREADS.load(Ordering::SeqCst) > 0 {
        k.wait_on(&QUIESCENT);
    }
    KERNEL_FAULT.load(Ordering::SeqCst)
}
