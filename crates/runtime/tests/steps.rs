//! Transactional step behavior: checkpoints, aborts, forks, choices,
//! post-commit queues, and the error surface.

use glas_runtime::{
    E_ATOMIC_CB, E_CLIENT1, E_DEAD_BRANCH, E_LINEARITY, E_NAME_SHADOW, E_SIGKILL, E_UNDERFLOW,
    Glas, ProgCb, postop,
};
use serial_test::serial;
use std::sync::{Arc, Mutex};

#[test]
#[serial]
fn commit_order_is_queue_order() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let mut ga = Glas::new();
    let mut gb = Glas::new();
    let la = log.clone();
    ga.step_postop(
        "steps-commit-order",
        Box::new(move || la.lock().unwrap().push("A")),
        None,
    );
    let lb = log.clone();
    gb.step_postop(
        "steps-commit-order",
        Box::new(move || lb.lock().unwrap().push("B")),
        None,
    );
    assert!(ga.step_commit());
    assert!(gb.step_commit());
    postop::drain_all();
    assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
}

#[test]
#[serial]
fn abort_restores_checkpoint_exactly() {
    let mut g = Glas::new();
    assert!(g.int_push(10i64));
    assert!(g.step_commit());
    let before_depth = g.data_depth();
    let before_top = g.peek_cell(0).expect("top");
    assert_eq!(g.error_get(), 0);

    assert!(g.int_push(20i64));
    assert!(g.binary_push(b"noise"));
    g.error_set(E_CLIENT1);
    assert!(!g.step_commit());
    g.step_abort();

    assert_eq!(g.data_depth(), before_depth);
    assert_eq!(g.peek_cell(0), Some(before_top));
    assert_eq!(g.error_get(), 0);
}

#[test]
#[serial]
fn abort_rewinds_namespace() {
    let mut g = Glas::new();
    assert!(g.reg_new("kept."));
    assert!(g.step_commit());
    assert!(g.reg_new("tmp."));
    assert!(g.name_defined("tmp.x"));
    g.step_abort();
    assert!(!g.name_defined("tmp.x"));
    assert!(g.name_defined("kept.x"));
}

#[test]
#[serial]
fn postop_cancel_runs_on_abort() {
    let ran: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let mut g = Glas::new();
    let r1 = ran.clone();
    let r2 = ran.clone();
    g.step_postop(
        "steps-cancel",
        Box::new(move || r1.lock().unwrap().push("op")),
        Some(Box::new(move || r2.lock().unwrap().push("cancel"))),
    );
    g.step_abort();
    postop::drain_all();
    assert_eq!(*ran.lock().unwrap(), vec!["cancel"]);
}

#[test]
#[serial]
fn fork_dies_with_aborted_parent_step() {
    let mut g = Glas::new();
    let mut child = g.fork(0).expect("fork");
    g.step_abort();
    assert!(child.int_push(1i64));
    assert_ne!(child.error_get() & E_DEAD_BRANCH, 0);
    assert!(!child.step_commit());
}

#[test]
#[serial]
fn fork_commit_waits_for_parent() {
    let mut g = Glas::new();
    assert!(g.int_push(41i64));
    let mut child = g.fork(1).expect("fork");
    assert_eq!(g.data_depth(), 0);
    assert_eq!(child.data_depth(), 1);
    // resolve the gate from another thread after a delay
    let h = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(g.step_commit());
        g
    });
    // blocks until the parent commits, then succeeds
    assert!(child.step_commit());
    assert_eq!(child.int_peek::<i64>(), Some(41));
    let _ = h.join().unwrap();
}

#[test]
#[serial]
fn choice_first_committer_wins() {
    let mut g = Glas::new();
    let mut alt = g.choice();
    assert!(alt.int_push(1i64));
    assert!(alt.step_commit());
    assert!(!g.step_commit());
    assert_ne!(g.error_get() & E_DEAD_BRANCH, 0);
    // the winner continues unencumbered
    assert!(alt.int_push(2i64));
    assert!(alt.step_commit());
}

#[test]
#[serial]
fn choice_original_can_win_too() {
    let mut g = Glas::new();
    let mut alt = g.choice();
    assert!(g.step_commit());
    assert!(!alt.step_commit());
    assert_ne!(alt.error_get() & E_DEAD_BRANCH, 0);
}

#[test]
#[serial]
fn kill_handle_blocks_commit() {
    let mut g = Glas::new();
    let kh = g.kill_handle();
    std::thread::spawn(move || kh.kill()).join().unwrap();
    assert!(!g.step_commit());
    assert_ne!(g.error_get() & E_SIGKILL, 0);
}

#[test]
#[serial]
fn linear_values_resist_copy_and_drop() {
    let mut g = Glas::new();
    assert!(g.foreign_push(std::ptr::null_mut(), None, std::ptr::null_mut(), true));
    // anchor the checkpoint so aborts keep the linear value around
    assert!(g.step_commit());
    let depth = g.data_depth();
    assert!(!g.data_copy(1));
    assert_ne!(g.error_get() & E_LINEARITY, 0);
    assert_eq!(g.data_depth(), depth);
    g.step_abort();
    assert!(!g.data_drop(1));
    assert_ne!(g.error_get() & E_LINEARITY, 0);
    assert_eq!(g.data_depth(), depth);
    g.step_abort();
    assert!(!g.data_move("a-aa"));
    assert_ne!(g.error_get() & E_LINEARITY, 0);
    g.step_abort();
    // a plain move that uses the value exactly once is fine
    assert!(g.int_push(1i64));
    assert!(g.data_move("ab-ba"));
    // suppressing the check allows the drop
    g.set_linearity_unchecked(true);
    assert!(g.data_drop(2));
    g.set_linearity_unchecked(false);
}

#[test]
#[serial]
fn move_strings_shuffle_and_copy() {
    let mut g = Glas::new();
    for n in [1i64, 2, 3] {
        assert!(g.int_push(n));
    }
    // rotate: c to the bottom
    assert!(g.data_move("abc-cab"));
    assert_eq!(g.int_peek::<i64>(), Some(2));
    // copy the top two
    assert!(g.data_move("ab-abab"));
    assert_eq!(g.data_depth(), 5);
    // underflow leaves the stack alone
    assert!(!g.data_move("abcdef-a"));
    assert_ne!(g.error_get() & E_UNDERFLOW, 0);
    assert_eq!(g.data_depth(), 5);
    // malformed strings are rejected
    g.step_abort();
    assert!(!g.data_move("aa-a"));
    assert!(!g.data_move("a-ax"));
    assert!(!g.data_move("abc"));
}

#[test]
#[serial]
fn stash_moves_round_trip() {
    let mut g = Glas::new();
    for n in [1i64, 2, 3] {
        assert!(g.int_push(n));
    }
    assert!(g.data_stash(2));
    assert_eq!(g.data_depth(), 1);
    assert_eq!(g.int_peek::<i64>(), Some(1));
    assert!(g.data_stash(-2));
    assert_eq!(g.data_depth(), 3);
    assert_eq!(g.int_peek::<i64>(), Some(3));
    assert!(!g.data_stash(-1));
    assert_ne!(g.error_get() & E_UNDERFLOW, 0);
}

#[test]
#[serial]
fn shadowing_requires_arming() {
    let mut g = Glas::new();
    let mk = || ProgCb {
        op: Box::new(|_: &mut Glas| true),
        caller_prefix: None,
        ar_in: 0,
        ar_out: 0,
        atomic: true,
    };
    assert!(g.define_by_callback("foo", mk()));
    assert!(!g.define_by_callback("foo", mk()));
    assert_ne!(g.error_get() & E_NAME_SHADOW, 0);
    g.step_abort();
    g.name_shadow();
    assert!(g.define_by_callback("foo", mk()));
}

#[test]
#[serial]
fn atomic_callbacks_cannot_commit() {
    let mut g = Glas::new();
    let cb = ProgCb {
        op: Box::new(|cx: &mut Glas| {
            assert!(!cx.step_commit());
            true
        }),
        caller_prefix: None,
        ar_in: 0,
        ar_out: 0,
        atomic: true,
    };
    assert!(g.define_by_callback("nested", cb));
    assert!(g.call("nested"));
    assert_ne!(g.error_get() & E_ATOMIC_CB, 0);
    assert!(!g.step_commit());
}

#[test]
#[serial]
fn callback_failure_restores_arguments() {
    let mut g = Glas::new();
    let cb = ProgCb {
        op: Box::new(|cx: &mut Glas| {
            // consume the argument, then fail
            assert!(cx.data_drop(1));
            false
        }),
        caller_prefix: None,
        ar_in: 1,
        ar_out: 1,
        atomic: true,
    };
    assert!(g.define_by_callback("fickle", cb));
    assert!(g.int_push(33i64));
    assert!(!g.call("fickle"));
    assert_eq!(g.data_depth(), 1);
    assert_eq!(g.int_peek::<i64>(), Some(33));
}

#[test]
#[serial]
fn callback_env_mounts_under_prefix() {
    let mut g = Glas::new();
    assert!(g.reg_new("r."));
    assert!(g.int_push(5i64));
    assert!(g.reg_set("r.x"));
    assert!(g.step_commit());
    let cb = ProgCb {
        op: Box::new(|cx: &mut Glas| {
            // the caller's r.x is visible as $r.x
            cx.reg_get("$r.x")
        }),
        caller_prefix: Some(b"$".to_vec()),
        ar_in: 0,
        ar_out: 1,
        atomic: true,
    };
    assert!(g.define_by_callback("peek-env", cb));
    assert!(g.call("peek-env"));
    assert_eq!(g.int_peek::<i64>(), Some(5));
}

#[test]
#[serial]
fn queue_writer_never_conflicts_with_reader() {
    let mut g = Glas::new();
    assert!(g.reg_new("q."));
    assert!(g.binary_push(&[1, 2]));
    assert!(g.queue_write("q.log"));
    assert!(g.step_commit());

    let mut reader = g.fork(0).expect("fork");
    let mut writer = g.fork(0).expect("fork");
    assert!(g.step_commit());

    // reader takes both elements but has not committed yet
    assert!(reader.queue_read_n("q.log", 2));
    let mut buf = [0u8; 2];
    assert_eq!(reader.binary_peek(0, 2, Some(&mut buf)), (2, true));
    assert_eq!(buf, [1, 2]);

    // writer appends behind the reader's back and commits first
    assert!(writer.binary_push(&[9]));
    assert!(writer.queue_write("q.log"));
    assert!(writer.step_commit());

    // the reader still commits: the observed prefix is intact
    assert!(reader.data_drop(1));
    assert!(reader.step_commit());

    // what remains is exactly the writer's late append
    assert!(g.queue_read_n("q.log", 1));
    assert_eq!(g.binary_peek(0, 1, Some(&mut buf[..1])), (1, true));
    assert_eq!(buf[0], 9);
    // and nothing more
    assert!(g.data_drop(1));
    assert!(!g.queue_read_n("q.log", 1));
    assert_eq!(g.data_depth(), 0);
}

#[test]
#[serial]
fn global_volume_shares_registers_across_contexts() {
    let mut g1 = Glas::new();
    let mut g2 = Glas::new();
    assert!(g1.reg_new_global("g."));
    assert!(g1.int_push(7i64));
    assert!(g1.reg_set("g.shared-x"));
    assert!(g1.step_commit());
    assert!(g2.reg_new_global("g."));
    assert!(g2.reg_get("g.shared-x"));
    assert_eq!(g2.int_peek::<i64>(), Some(7));
}

#[test]
#[serial]
fn prefix_inuse_sees_volumes_and_names() {
    let mut g = Glas::new();
    assert!(!g.prefix_inuse("v."));
    assert!(g.reg_new("v."));
    assert!(g.int_push(1i64));
    assert!(g.reg_set("v.a"));
    assert!(g.prefix_inuse("v."));
    assert!(g.name_defined("v.a"));
    assert!(!g.name_defined("w.a"));
}

#[test]
#[serial]
fn on_stack_counts_drive_queue_and_splits() {
    let mut g = Glas::new();
    assert!(g.reg_new("q."));
    assert!(g.binary_push(&[5, 6, 7]));
    assert!(g.queue_write("q.z"));
    assert!(g.step_commit());
    // N -- List
    assert!(g.int_push(2i64));
    assert!(g.queue_read("q.z"));
    let mut buf = [0u8; 3];
    assert_eq!(g.binary_peek(0, 3, Some(&mut buf)), (2, true));
    assert_eq!(&buf[..2], &[5, 6]);
    assert!(g.data_drop(1));
    // an oversized on-stack count fails and restores the count
    assert!(g.int_push(9i64));
    assert!(!g.queue_read("q.z"));
    assert_eq!(g.int_peek::<i64>(), Some(9));
    assert!(g.data_drop(1));
    // (L++R) (L len) -- L R
    assert!(g.binary_push(&[1, 2, 3, 4]));
    assert!(g.int_push(3i64));
    assert!(g.list_split());
    assert_eq!(g.binary_peek(0, 3, Some(&mut buf)), (1, true));
    assert_eq!(buf[0], 4);
}

#[test]
#[serial]
fn queue_unread_and_peek() {
    let mut g = Glas::new();
    assert!(g.reg_new("q."));
    assert!(g.binary_push(&[1, 2, 3]));
    assert!(g.queue_write("q.s"));
    assert!(g.step_commit());

    assert!(g.queue_read_n("q.s", 2));
    assert!(g.queue_unread("q.s"));
    assert!(g.queue_peek_n("q.s", 3));
    let mut buf = [0u8; 3];
    assert_eq!(g.binary_peek(0, 3, Some(&mut buf)), (3, true));
    assert_eq!(buf, [1, 2, 3]);
    assert!(g.data_drop(1));
    // peek did not consume
    assert!(g.queue_read_n("q.s", 3));
    assert!(g.data_drop(1));
    assert!(g.step_commit());
}
