//! Minnow kernel
//!
//! The core primitives of a small educational operating system: the
//! process & thread table, bounded byte pipes, and local stream sockets
//! built from pipe pairs. The kernel is hosted — it runs as an ordinary
//! process, with kernel threads carried by host threads and the big
//! kernel lock carried by a host mutex — but everything above the
//! scheduler surface behaves like the cooperative single-CPU machine it
//! models.
//!
//! # Architecture
//!
//! - [`sched`] — the big kernel lock, condition variables and kernel
//!   threads; the only suspension primitives in the system.
//! - `file` — refcounted file control blocks, the system file table and
//!   the per-process FIDT behind [`read`]/[`write`]/[`close`].
//! - `process`/`thread` — the process table and lifecycle syscalls:
//!   [`exec`], [`exit`], [`wait_child`], [`create_thread`],
//!   [`thread_join`], [`thread_detach`], orphan reparenting.
//! - `pipe` — the bounded byte ring behind [`pipe`].
//! - `socket` — listeners, the Connect/Accept rendezvous and peer
//!   sockets behind [`socket`], [`listen`], [`accept`], [`connect`],
//!   [`shut_down`].
//! - `procfs` — the read-only process-table stream behind
//!   [`open_info`].
//!
//! # Usage
//!
//! [`boot`] brings the machine up with a task as init (pid 1) and
//! returns init's exit status once every process has finished:
//!
//! ```
//! fn init(_args: &[u8]) -> i32 {
//!     kernel::get_pid()
//! }
//!
//! assert_eq!(kernel::boot(init, None), 1);
//! ```

#![warn(missing_docs)]

mod file;
mod pipe;
mod process;
mod procfs;
pub mod sched;
mod socket;
mod thread;

use std::sync::Mutex;

use minnow_api::Task;

pub use minnow_api as api;

pub use file::{close, read, write};
pub use pipe::pipe;
pub use process::{exec, exit, get_pid, get_ppid, wait_child};
pub use procfs::open_info;
pub use socket::{accept, connect, listen, shut_down, socket};
pub use thread::{create_thread, thread_detach, thread_exit, thread_join, thread_self};

/// Bring the machine up and run it to completion.
///
/// Resets every kernel table, installs the idle slot (pid 0), runs
/// `task` as init (pid 1) with a private copy of `args`, and blocks
/// until every kernel thread has exited. Returns init's exit status.
///
/// Boots serialize on an internal mutex, so concurrent callers (test
/// harness threads) run one machine at a time.
///
/// # Panics
///
/// Panics after shutdown if a panic escaped a task while the machine
/// ran, so a faulted run is never reported as a clean one.
pub fn boot(task: Task, args: Option<&[u8]>) -> i32 {
    static BOOT_LOCK: Mutex<()> = Mutex::new(());
    let _serial = BOOT_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    sched::install_panic_hook();
    let mut k = sched::lock();
    sched::reset();
    file::reset();
    socket::reset();
    process::reset();

    let idle = process::do_exec(&mut k, None, None).expect("idle slot allocation");
    debug_assert_eq!(idle, 0);
    let init = process::do_exec(&mut k, Some(task), args).expect("init slot allocation");
    debug_assert_eq!(init, 1);
    log::info!("boot: init is pid {}", init);

    let faulted = sched::await_quiescence(&mut k);
    let status = process::exit_status_of(init);
    drop(k);

    if faulted {
        panic!("a kernel thread panicked while the machine ran");
    }
    log::info!("shutdown: init exited with {}", status);
    status
}
