//! Thread lifecycle tests
//! Join/detach semantics, exit values and handle validity.

use std::sync::Arc;
use std::time::Duration;

use kernel::api::{Fid, SysError, NOTHREAD};

fn args_of(bytes: &[u8]) -> Option<Arc<[u8]>> {
    Some(Arc::from(bytes))
}

fn forty_two(_args: &[u8]) -> i32 {
    42
}

mod join {
    use super::*;

    fn join_value_main(_args: &[u8]) -> i32 {
        let tid = kernel::create_thread(forty_two, None).unwrap();
        assert_eq!(kernel::thread_join(tid).unwrap(), 42);
        // The last successful joiner freed the descriptor.
        assert_eq!(kernel::thread_join(tid), Err(SysError::NotFound));
        0
    }

    /// Test that a join delivers the thread's exit value exactly once
    #[test]
    fn join_delivers_exit_value() {
        assert_eq!(kernel::boot(join_value_main, None), 0);
    }

    fn exits_early(_args: &[u8]) -> i32 {
        kernel::thread_exit(9);
    }

    fn explicit_exit_main(_args: &[u8]) -> i32 {
        // ThreadExit mid-task carries its value to the joiner.
        let tid = kernel::create_thread(exits_early, None).unwrap();
        assert_eq!(kernel::thread_join(tid).unwrap(), 9);
        0
    }

    /// Test that an explicit ThreadExit delivers its value
    #[test]
    fn explicit_thread_exit_value() {
        assert_eq!(kernel::boot(explicit_exit_main, None), 0);
    }

    fn join_self_main(_args: &[u8]) -> i32 {
        assert_eq!(
            kernel::thread_join(kernel::thread_self()),
            Err(SysError::InvalidArgument)
        );
        assert_eq!(kernel::thread_join(NOTHREAD), Err(SysError::NotFound));
        0
    }

    /// Test that joining yourself or the null handle fails
    #[test]
    fn join_self_fails() {
        assert_eq!(kernel::boot(join_self_main, None), 0);
    }

    fn exited_unjoined_main(_args: &[u8]) -> i32 {
        let tid = kernel::create_thread(forty_two, None).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        // Already exited: detach fails, join still collects the value.
        assert_eq!(kernel::thread_detach(tid), Err(SysError::InvalidArgument));
        assert_eq!(kernel::thread_join(tid).unwrap(), 42);
        0
    }

    /// Test that an exited thread stays joinable until reaped
    #[test]
    fn exited_thread_stays_joinable() {
        assert_eq!(kernel::boot(exited_unjoined_main, None), 0);
    }

    fn multi_join_main(_args: &[u8]) -> i32 {
        fn sleeper(args: &[u8]) -> i32 {
            let r = args[0] as Fid;
            let mut b = [0u8; 1];
            let _ = kernel::read(r, &mut b);
            5
        }
        fn joiner(args: &[u8]) -> i32 {
            let tid = u64::from_le_bytes(args[..8].try_into().unwrap());
            kernel::thread_join(tid).unwrap()
        }

        let (r, w) = kernel::pipe().unwrap();
        let target = kernel::create_thread(sleeper, args_of(&[r as u8])).unwrap();
        let j1 = kernel::create_thread(joiner, args_of(&target.to_le_bytes())).unwrap();
        let j2 = kernel::create_thread(joiner, args_of(&target.to_le_bytes())).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        // EOF releases the sleeper; every joiner sees its value.
        kernel::close(w).unwrap();
        assert_eq!(kernel::thread_join(j1).unwrap(), 5);
        assert_eq!(kernel::thread_join(j2).unwrap(), 5);
        // The last of the joiners freed the target's descriptor.
        assert_eq!(kernel::thread_join(target), Err(SysError::NotFound));
        kernel::close(r).unwrap();
        0
    }

    /// Test that several joiners all observe the same exit value
    #[test]
    fn concurrent_joiners_all_succeed() {
        assert_eq!(kernel::boot(multi_join_main, None), 0);
    }
}

mod detach {
    use super::*;

    fn detach_wins_main(_args: &[u8]) -> i32 {
        fn sleeper(args: &[u8]) -> i32 {
            let r = args[0] as Fid;
            let mut b = [0u8; 1];
            let _ = kernel::read(r, &mut b);
            0
        }
        fn joiner(args: &[u8]) -> i32 {
            let tid = u64::from_le_bytes(args[..8].try_into().unwrap());
            match kernel::thread_join(tid) {
                // Woken by the detach, with no exit value delivered.
                Err(SysError::InvalidArgument) => 1,
                _ => 0,
            }
        }

        let (r, w) = kernel::pipe().unwrap();
        let target = kernel::create_thread(sleeper, args_of(&[r as u8])).unwrap();
        let u = kernel::create_thread(joiner, args_of(&target.to_le_bytes())).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        kernel::thread_detach(target).unwrap();
        assert_eq!(kernel::thread_join(u).unwrap(), 1);

        // A detached thread can never be joined again.
        assert_eq!(kernel::thread_join(target), Err(SysError::InvalidArgument));
        // Let the sleeper finish so the process can exit.
        kernel::close(w).unwrap();
        kernel::close(r).unwrap();
        0
    }

    /// Test that detaching releases a blocked joiner without a value
    #[test]
    fn detach_releases_blocked_joiner() {
        assert_eq!(kernel::boot(detach_wins_main, None), 0);
    }

    fn detach_twice_main(_args: &[u8]) -> i32 {
        fn sleeper(args: &[u8]) -> i32 {
            let r = args[0] as Fid;
            let mut b = [0u8; 1];
            let _ = kernel::read(r, &mut b);
            0
        }
        let (r, w) = kernel::pipe().unwrap();
        let target = kernel::create_thread(sleeper, args_of(&[r as u8])).unwrap();
        kernel::thread_detach(target).unwrap();
        // Detaching is monotonic; repeating it is harmless.
        kernel::thread_detach(target).unwrap();
        kernel::close(w).unwrap();
        kernel::close(r).unwrap();
        0
    }

    /// Test that detach is idempotent while the thread lives
    #[test]
    fn detach_twice_is_fine() {
        assert_eq!(kernel::boot(detach_twice_main, None), 0);
    }
}

mod handle_scope {
    use super::*;

    fn foreign_main(_args: &[u8]) -> i32 {
        fn prober(args: &[u8]) -> i32 {
            let tid = u64::from_le_bytes(args[..8].try_into().unwrap());
            // A handle from another process never resolves here.
            match kernel::thread_join(tid) {
                Err(SysError::NotFound) => 0,
                _ => 1,
            }
        }
        let t = kernel::create_thread(forty_two, None).unwrap();
        let handle = t.to_le_bytes();
        let child = kernel::exec(Some(prober), Some(&handle[..])).unwrap();
        let (_, status) = kernel::wait_child(Some(child)).unwrap();
        assert_eq!(status, 0);
        assert_eq!(kernel::thread_join(t).unwrap(), 42);
        0
    }

    /// Test that tids are scoped to their owning process
    #[test]
    fn foreign_process_cannot_join() {
        assert_eq!(kernel::boot(foreign_main, None), 0);
    }
}
