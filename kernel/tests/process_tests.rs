//! Process lifecycle tests
//! Exec/WaitChild round trips, orphan reparenting and the
//! process-information stream.

use std::time::Duration;

use kernel::api::{
    ProcInfo, SysError, NOPROC, PROCINFO_MAX_ARGS_SIZE, PROCINFO_RECORD_SIZE,
};

fn seven(_args: &[u8]) -> i32 {
    7
}

mod reaping {
    use super::*;

    fn wait_specific_main(_args: &[u8]) -> i32 {
        assert_eq!(kernel::get_pid(), 1);
        assert_eq!(kernel::get_ppid(), NOPROC);

        let child = kernel::exec(Some(seven), None).unwrap();
        let (pid, status) = kernel::wait_child(Some(child)).unwrap();
        assert_eq!(pid, child);
        assert_eq!(status, 7);
        // Reaped exactly once.
        assert_eq!(kernel::wait_child(Some(child)), Err(SysError::NotFound));
        0
    }

    /// Test that Exec → Exit → WaitChild recovers the exit value
    #[test]
    fn wait_recovers_exit_value() {
        assert_eq!(kernel::boot(wait_specific_main, None), 0);
    }

    fn leaves(_args: &[u8]) -> i32 {
        kernel::exit(3);
    }

    fn explicit_exit_main(_args: &[u8]) -> i32 {
        let child = kernel::exec(Some(leaves), None).unwrap();
        let (_, status) = kernel::wait_child(Some(child)).unwrap();
        assert_eq!(status, 3);
        0
    }

    /// Test that an explicit Exit mid-task reaches the parent
    #[test]
    fn explicit_exit_reaches_parent() {
        assert_eq!(kernel::boot(explicit_exit_main, None), 0);
    }

    fn wait_any_main(_args: &[u8]) -> i32 {
        let a = kernel::exec(Some(seven), None).unwrap();
        let b = kernel::exec(Some(seven), None).unwrap();
        let (first, s1) = kernel::wait_child(None).unwrap();
        let (second, s2) = kernel::wait_child(None).unwrap();
        assert_eq!(s1, 7);
        assert_eq!(s2, 7);
        let mut reaped = [first, second];
        reaped.sort_unstable();
        let mut spawned = [a, b];
        spawned.sort_unstable();
        assert_eq!(reaped, spawned);
        // No children left.
        assert_eq!(kernel::wait_child(None), Err(SysError::NotFound));
        0
    }

    /// Test that wait-any reaps every zombie child and then reports
    /// childlessness
    #[test]
    fn wait_any_drains_children() {
        assert_eq!(kernel::boot(wait_any_main, None), 0);
    }

    fn bad_waits(_args: &[u8]) -> i32 {
        if kernel::wait_child(Some(1)) != Err(SysError::NotFound) {
            return 1; // own parent is not a child
        }
        if kernel::wait_child(Some(-5)) != Err(SysError::NotFound) {
            return 2;
        }
        if kernel::wait_child(Some(9999)) != Err(SysError::NotFound) {
            return 3;
        }
        if kernel::wait_child(None) != Err(SysError::NotFound) {
            return 4; // no children at all
        }
        0
    }

    fn bad_wait_main(_args: &[u8]) -> i32 {
        let child = kernel::exec(Some(bad_waits), None).unwrap();
        let (_, status) = kernel::wait_child(Some(child)).unwrap();
        status
    }

    /// Test that waiting on non-children and bad pids fails cleanly
    #[test]
    fn wait_rejects_non_children() {
        assert_eq!(kernel::boot(bad_wait_main, None), 0);
    }
}

mod reparenting {
    use super::*;

    fn grandchild(_args: &[u8]) -> i32 {
        // Spin until the reparenting to init is visible.
        for _ in 0..500 {
            if kernel::get_ppid() == 1 {
                return 0;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        1
    }

    fn middle(_args: &[u8]) -> i32 {
        kernel::exec(Some(grandchild), None).unwrap();
        // Exit with the grandchild still alive: it becomes an orphan.
        0
    }

    fn orphan_main(_args: &[u8]) -> i32 {
        let p = kernel::exec(Some(middle), None).unwrap();
        let (_, status) = kernel::wait_child(Some(p)).unwrap();
        assert_eq!(status, 0);
        // The orphan now belongs to init and is reapable here.
        let (_, gstatus) = kernel::wait_child(None).unwrap();
        assert_eq!(gstatus, 0);
        0
    }

    /// Test that children of an exiting process move to init
    #[test]
    fn orphans_are_reparented_to_init() {
        assert_eq!(kernel::boot(orphan_main, None), 0);
    }
}

mod inheritance {
    use super::*;

    fn echo_child(args: &[u8]) -> i32 {
        // The fids were inherited from the parent, so the same numbers
        // work here.
        let r = args[0] as kernel::api::Fid;
        let w = args[1] as kernel::api::Fid;
        let mut b = [0u8; 4];
        let n = kernel::read(r, &mut b).unwrap();
        let mut sent = 0;
        while sent < n {
            sent += kernel::write(w, &b[sent..n]).unwrap();
        }
        0
    }

    fn inherit_main(_args: &[u8]) -> i32 {
        let (pr, pw) = kernel::pipe().unwrap(); // parent -> child
        let (cr, cw) = kernel::pipe().unwrap(); // child -> parent
        let fids = [pr as u8, cw as u8];
        let child = kernel::exec(Some(echo_child), Some(&fids[..])).unwrap();

        let mut sent = 0;
        while sent < 4 {
            sent += kernel::write(pw, &b"ping"[sent..]).unwrap();
        }
        let mut b = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            got += kernel::read(cr, &mut b[got..]).unwrap();
        }
        assert_eq!(&b, b"ping");

        let (_, status) = kernel::wait_child(Some(child)).unwrap();
        assert_eq!(status, 0);
        for fid in [pr, pw, cr, cw] {
            kernel::close(fid).unwrap();
        }
        0
    }

    /// Test that Exec duplicates every open fid into the child
    #[test]
    fn exec_duplicates_open_fids() {
        assert_eq!(kernel::boot(inherit_main, None), 0);
    }
}

mod introspection {
    use super::*;

    fn blocked_child(args: &[u8]) -> i32 {
        let r = args[0] as kernel::api::Fid;
        let mut b = [0u8; 1];
        let _ = kernel::read(r, &mut b);
        0
    }

    fn procinfo_main(_args: &[u8]) -> i32 {
        let (r, w) = kernel::pipe().unwrap();

        // Long argument buffer so the record's inline copy truncates.
        let mut child_args = vec![b'A'; 200];
        child_args[0] = r as u8;
        let child = kernel::exec(Some(blocked_child), Some(child_args.as_slice())).unwrap();

        let f = kernel::open_info().unwrap();
        let mut buf = [0u8; PROCINFO_RECORD_SIZE];

        // Streams only read, in whole records.
        assert_eq!(kernel::write(f, b"x"), Err(SysError::NotSupported));
        let mut small = [0u8; 16];
        assert_eq!(
            kernel::read(f, &mut small),
            Err(SysError::InvalidArgument)
        );

        let mut records = Vec::new();
        loop {
            let n = kernel::read(f, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            assert_eq!(n, PROCINFO_RECORD_SIZE);
            records.push(ProcInfo::decode(&buf).unwrap());
        }
        kernel::close(f).unwrap();

        // Ascending pids, starting at init; the idle slot is skipped.
        assert!(records.windows(2).all(|p| p[0].pid < p[1].pid));
        assert_eq!(records[0].pid, 1);
        assert_eq!(records[0].ppid, NOPROC);
        assert!(records[0].alive);

        let crec = records.iter().find(|p| p.pid == child).unwrap();
        assert_eq!(crec.ppid, 1);
        assert!(crec.alive);
        assert_eq!(crec.thread_count, 1);
        assert_eq!(crec.argl, 200);
        let inline = crec.args_bytes();
        assert_eq!(inline.len(), PROCINFO_MAX_ARGS_SIZE);
        assert_eq!(inline[0], r as u8);
        assert!(inline[1..].iter().all(|&b| b == b'A'));

        // Release the child and reap it.
        assert_eq!(kernel::write(w, b"x").unwrap(), 1);
        let (_, status) = kernel::wait_child(Some(child)).unwrap();
        assert_eq!(status, 0);
        kernel::close(r).unwrap();
        kernel::close(w).unwrap();
        0
    }

    /// Test the process-information stream record per live slot
    #[test]
    fn procinfo_reports_live_processes() {
        assert_eq!(kernel::boot(procinfo_main, None), 0);
    }
}
