//! Thunks: lazy values with atomic resolution.
//!
//! A THUNK cell has three atomic slots: the computation, the result, and
//! a signal list. Resolution races are benign: every contender computes
//! against the same immutable computation value and the first result
//! published wins. Observers may hang a signal node on the list; signals
//! fire once, when a result is published.

use crate::error::OpResult;
use crate::value::{Value, new_cell};
use glas_core::alloc::AllocCursor;
use glas_core::cell::{Cell, ReleaseFn, TYPE_THUNK, TYPE_THUNK_SIGNAL};
use glas_core::gc;
use std::sync::atomic::Ordering;

const W_COMPUTATION: usize = 0;
const W_RESULT: usize = 1;
const W_SIGNAL: usize = 2;

/// Force a thunk: return its result, computing it with `eval` when not
/// yet resolved. `eval` receives the computation value.
pub fn force(
    alloc: &mut AllocCursor,
    thunk: *mut Cell,
    eval: impl FnOnce(&mut AllocCursor, Value) -> OpResult<Value>,
) -> OpResult<Value> {
    debug_assert_eq!(unsafe { (*thunk).hdr.type_id }, TYPE_THUNK);
    let t = unsafe { &*thunk };
    let existing = unsafe { t.load_ptr(W_RESULT) };
    if !existing.is_null() {
        return Ok(existing);
    }
    let computation = unsafe { t.load_ptr(W_COMPUTATION) };
    let value = eval(alloc, computation)?;
    // publish; a racing resolver may have beaten us
    let prev = unsafe {
        t.word_atomic(W_RESULT).compare_exchange(
            std::ptr::null_mut(),
            value,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
    };
    match prev {
        Ok(_) => {
            // our result is now reachable through the thunk
            gc::ref_published(thunk, value);
            fire_signals(thunk);
            Ok(value)
        }
        Err(winner) => Ok(winner),
    }
}

/// Queue a signal on the thunk; it fires immediately when the thunk is
/// already resolved.
pub fn observe(
    alloc: &mut AllocCursor,
    thunk: *mut Cell,
    signal: ReleaseFn,
    arg: *mut u8,
) -> OpResult<()> {
    debug_assert_eq!(unsafe { (*thunk).hdr.type_id }, TYPE_THUNK);
    let t = unsafe { &*thunk };
    if !unsafe { t.load_ptr(W_RESULT) }.is_null() {
        unsafe { signal(arg) };
        return Ok(());
    }
    let node = new_cell(alloc)?;
    unsafe {
        (*node).hdr.type_id = TYPE_THUNK_SIGNAL;
        (*node).data.thunk_signal.arg = arg;
        (*node).data.thunk_signal.signal = Some(signal);
    }
    loop {
        let head = unsafe { t.load_ptr(W_SIGNAL) };
        unsafe { (*node).data.thunk_signal.next = head };
        gc::publish_cell(node);
        let swapped = unsafe {
            t.word_atomic(W_SIGNAL)
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
        };
        if swapped.is_ok() {
            gc::ref_published(thunk, node);
            break;
        }
    }
    // resolution may have raced past the enqueue
    if !unsafe { t.load_ptr(W_RESULT) }.is_null() {
        fire_signals(thunk);
    }
    Ok(())
}

/// Detach and invoke the signal list. Multiple callers race on the atomic
/// swap, so each signal fires exactly once.
fn fire_signals(thunk: *mut Cell) {
    let t = unsafe { &*thunk };
    let mut node = unsafe {
        t.word_atomic(W_SIGNAL)
            .swap(std::ptr::null_mut(), Ordering::AcqRel)
    };
    while !node.is_null() {
        let s = unsafe { (*node).data.thunk_signal };
        if let Some(f) = s.signal {
            unsafe { f(s.arg) };
        }
        node = s.next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::with_ctx;
    use crate::value::{byte_cell, cell_to_byte, mk_thunk};
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering as AtOrd};

    #[test]
    #[serial]
    fn force_computes_once() {
        with_ctx(|g| {
            let _b = g.busy();
            let t = mk_thunk(&mut g.alloc, std::ptr::null_mut()).unwrap();
            let calls = AtomicUsize::new(0);
            let r1 = force(&mut g.alloc, t, |alloc, _| {
                calls.fetch_add(1, AtOrd::SeqCst);
                byte_cell(alloc, 7)
            })
            .unwrap();
            let r2 = force(&mut g.alloc, t, |alloc, _| {
                calls.fetch_add(1, AtOrd::SeqCst);
                byte_cell(alloc, 8)
            })
            .unwrap();
            assert_eq!(calls.load(AtOrd::SeqCst), 1);
            assert_eq!(r1, r2);
            assert_eq!(cell_to_byte(r1), Some(7));
        });
    }

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn note_fired(_arg: *mut u8) {
        FIRED.fetch_add(1, AtOrd::SeqCst);
    }

    #[test]
    #[serial]
    fn signals_fire_on_resolution_and_after() {
        with_ctx(|g| {
            let _b = g.busy();
            FIRED.store(0, AtOrd::SeqCst);
            let t = mk_thunk(&mut g.alloc, std::ptr::null_mut()).unwrap();
            observe(&mut g.alloc, t, note_fired, std::ptr::null_mut()).unwrap();
            assert_eq!(FIRED.load(AtOrd::SeqCst), 0);
            force(&mut g.alloc, t, |alloc, _| byte_cell(alloc, 1)).unwrap();
            assert_eq!(FIRED.load(AtOrd::SeqCst), 1);
            // observing a resolved thunk fires immediately
            observe(&mut g.alloc, t, note_fired, std::ptr::null_mut()).unwrap();
            assert_eq!(FIRED.load(AtOrd::SeqCst), 2);
        });
    }
}
