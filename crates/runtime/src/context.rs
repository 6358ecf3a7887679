//! The client context: a transactional coroutine handle.
//!
//! Each `Glas` owns a data stack, an auxiliary stash, a namespace, and
//! step bookkeeping. Stacks and logs are ordinary cell lists rooted in a
//! fixed `RootBlock` whose field offsets form the thread's root
//! descriptor, so the collector can scan a context without knowing
//! anything about its internals.
//!
//! Every public operation runs inside one busy window of the underlying
//! mutator thread; cells held in locals never outlive the window, which
//! is what makes the root descriptor sufficient.

use crate::error::{
    E_LINEARITY, E_SIGKILL, E_UNDERFLOW, ErrorFlags, OpResult, E_DEAD_BRANCH, E_QUOTA,
};
use crate::step::{ForkLatch, PendingPostop, StepGate};
use crate::value::{Value, mk_foreign, mk_pair};
use glas_core::alloc::AllocCursor;
use glas_core::cell::{AGGR_LINEAR, Cell, ReleaseFn, TYPE_BRANCH, TYPE_FOREIGN_PTR};
use glas_core::rt::rt;
use glas_core::thread::{BusyGuard, MutatorThread};
use std::mem::offset_of;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Fixed-offset block of every cell pointer the collector must treat as
/// a root of this context.
#[repr(C)]
pub(crate) struct RootBlock {
    /// Data stack: a cons list, head is top of stack.
    pub data: *mut Cell,
    /// Auxiliary stash, same shape.
    pub stash: *mut Cell,
    /// Namespace dict.
    pub ns: *mut Cell,
    /// Checkpoint snapshots (step start).
    pub ckpt_data: *mut Cell,
    pub ckpt_stash: *mut Cell,
    pub ckpt_ns: *mut Cell,
    /// Register logs for the current step, as cell lists.
    pub log_reads: *mut Cell,
    pub log_writes: *mut Cell,
    pub log_qreads: *mut Cell,
    pub log_qwrites: *mut Cell,
}

unsafe fn drop_root_block(obj: *mut u8) {
    drop(unsafe { Box::from_raw(obj.cast::<RootBlock>()) });
}

static ROOT_OFFSETS: [u16; 10] = [
    offset_of!(RootBlock, data) as u16,
    offset_of!(RootBlock, stash) as u16,
    offset_of!(RootBlock, ns) as u16,
    offset_of!(RootBlock, ckpt_data) as u16,
    offset_of!(RootBlock, ckpt_stash) as u16,
    offset_of!(RootBlock, ckpt_ns) as u16,
    offset_of!(RootBlock, log_reads) as u16,
    offset_of!(RootBlock, log_writes) as u16,
    offset_of!(RootBlock, log_qreads) as u16,
    offset_of!(RootBlock, log_qwrites) as u16,
];

/// Non-cell checkpoint state.
#[derive(Clone, Copy)]
pub(crate) struct CkptMeta {
    pub err: u32,
    pub shadow_armed: bool,
    pub data_depth: usize,
    pub stash_depth: usize,
    pub alloc_mark: u64,
}

/// A glas context. One coroutine's view of the runtime: drive it from one
/// host thread at a time.
pub struct Glas {
    /// Owned by the collector once the context finishes: a context that
    /// goes Done mid-cycle may still have its roots scanned, so the reap
    /// pass frees the block, not Drop.
    pub(crate) roots: std::mem::ManuallyDrop<Box<RootBlock>>,
    pub(crate) thread: *mut MutatorThread,
    pub(crate) alloc: AllocCursor,
    pub(crate) err: Arc<ErrorFlags>,
    pub(crate) data_depth: usize,
    pub(crate) stash_depth: usize,
    pub(crate) shadow_armed: bool,
    pub(crate) linearity_unchecked: bool,
    pub(crate) ckpt: CkptMeta,
    pub(crate) postops: Vec<PendingPostop>,
    pub(crate) gates: Vec<Arc<StepGate>>,
    pub(crate) parent_gate: Option<Arc<StepGate>>,
    pub(crate) choice_token: Option<Arc<std::sync::atomic::AtomicBool>>,
    pub(crate) atomic_cb: bool,
    pub(crate) in_callback: bool,
    /// Latch counting live forks under a callback context.
    pub(crate) fork_latch: Option<Arc<ForkLatch>>,
    /// Latch this context must release when it terminates.
    pub(crate) my_latch: Option<Arc<ForkLatch>>,
}

// A context is driven from one thread at a time; cells are only touched
// inside busy windows coordinated with the collector.
unsafe impl Send for Glas {}

/// Cross-thread handle for injecting error flags (cancellation).
#[derive(Clone)]
pub struct KillHandle {
    err: Arc<ErrorFlags>,
}

impl KillHandle {
    /// Request cancellation: the next commit attempt fails.
    pub fn kill(&self) {
        self.err.set(E_SIGKILL);
    }

    /// Inject host-reserved error flags.
    pub fn inject(&self, flags: u32) {
        self.err.set(flags);
    }
}

impl Default for Glas {
    fn default() -> Self {
        Self::new()
    }
}

impl Glas {
    /// A fresh context with empty namespace, stack, and stash.
    pub fn new() -> Glas {
        crate::config::ensure_applied();
        Self::with_parts(std::ptr::null_mut(), None, None, None)
    }

    pub(crate) fn with_parts(
        ns: *mut Cell,
        parent_gate: Option<Arc<StepGate>>,
        choice_token: Option<Arc<std::sync::atomic::AtomicBool>>,
        my_latch: Option<Arc<ForkLatch>>,
    ) -> Glas {
        let mut roots = Box::new(RootBlock {
            data: std::ptr::null_mut(),
            stash: std::ptr::null_mut(),
            ns,
            ckpt_data: std::ptr::null_mut(),
            ckpt_stash: std::ptr::null_mut(),
            ckpt_ns: ns,
            log_reads: std::ptr::null_mut(),
            log_writes: std::ptr::null_mut(),
            log_qreads: std::ptr::null_mut(),
            log_qwrites: std::ptr::null_mut(),
        });
        let obj = (&raw mut *roots).cast::<u8>();
        let thread = MutatorThread::register(obj, &ROOT_OFFSETS, Some(drop_root_block));
        let roots = std::mem::ManuallyDrop::new(roots);
        if let Some(latch) = &my_latch {
            latch.add();
        }
        Glas {
            roots,
            thread,
            alloc: AllocCursor::new(),
            err: Arc::new(ErrorFlags::new()),
            data_depth: 0,
            stash_depth: 0,
            shadow_armed: false,
            linearity_unchecked: false,
            ckpt: CkptMeta {
                err: 0,
                shadow_armed: false,
                data_depth: 0,
                stash_depth: 0,
                alloc_mark: 0,
            },
            postops: Vec::new(),
            gates: Vec::new(),
            parent_gate,
            choice_token,
            atomic_cb: false,
            in_callback: false,
            fork_latch: None,
            my_latch,
        }
    }

    /// Handle for cross-thread cancellation and host error injection.
    pub fn kill_handle(&self) -> KillHandle {
        KillHandle { err: self.err.clone() }
    }

    /// Current error flags.
    pub fn error_get(&self) -> u32 {
        self.err.get()
    }

    /// Add error flags (monotonic within a step).
    pub fn error_set(&self, flags: u32) {
        self.err.set(flags);
    }

    /// Enter a busy window; also surfaces lazy conditions (dead branch,
    /// step quota) that accumulate between operations.
    pub(crate) fn busy(&mut self) -> BusyGuard<'static> {
        let guard = BusyGuard::enter(unsafe { &*self.thread });
        if let Some(gate) = &self.parent_gate {
            if gate.is_dead() {
                self.err.set(E_DEAD_BRANCH);
            }
        }
        let quota = rt().tuning.step_quota.load(Ordering::Relaxed) as u64;
        if self.alloc.allocated - self.ckpt.alloc_mark > quota {
            self.err.set(E_QUOTA);
        }
        guard
    }

    pub(crate) fn flag(&self, r: u32) {
        self.err.set(r);
    }

    // -----------------------------------------------------------------
    // Stack primitives. The data and stash lists are always cons chains
    // of BRANCH cells built here, so raw destructuring is safe.
    // -----------------------------------------------------------------

    pub(crate) fn push_value(&mut self, v: Value) -> OpResult<()> {
        self.roots.data = mk_pair(&mut self.alloc, v, self.roots.data)?;
        self.data_depth += 1;
        Ok(())
    }

    pub(crate) fn pop_value(&mut self) -> OpResult<Value> {
        let head = self.roots.data;
        if head.is_null() {
            return Err(E_UNDERFLOW);
        }
        debug_assert_eq!(unsafe { (*head).hdr.type_id }, TYPE_BRANCH);
        let b = unsafe { (*head).data.branch };
        self.roots.data = b.r;
        self.data_depth -= 1;
        Ok(b.l)
    }

    pub(crate) fn peek_at(&self, depth: usize) -> OpResult<Value> {
        let mut head = self.roots.data;
        for _ in 0..depth {
            if head.is_null() {
                return Err(E_UNDERFLOW);
            }
            head = unsafe { (*head).data.branch }.r;
        }
        if head.is_null() {
            return Err(E_UNDERFLOW);
        }
        Ok(unsafe { (*head).data.branch }.l)
    }

    pub(crate) fn replace_top(&mut self, v: Value) -> OpResult<()> {
        let _ = self.pop_value()?;
        self.push_value(v)
    }

    /// Stack depth (elements on the data stack).
    pub fn data_depth(&self) -> usize {
        self.data_depth
    }

    /// Raw cell of a stack slot (0 = top), for hosts that embed deeper.
    /// The pointer is only stable until the next operation on any
    /// context.
    pub fn peek_cell(&mut self, depth: usize) -> Option<glas_core::CellRef> {
        let _b = self.busy();
        self.peek_at(depth).ok().map(glas_core::CellRef)
    }

    fn linear_violation(&self, v: Value) -> bool {
        !self.linearity_unchecked && !v.is_null() && unsafe { (*v).is_linear() }
    }

    /// Suppress or re-enable linearity checks in this context.
    pub fn set_linearity_unchecked(&mut self, unchecked: bool) {
        self.linearity_unchecked = unchecked;
    }

    // -----------------------------------------------------------------
    // Data shuffling
    // -----------------------------------------------------------------

    /// Swap the top two stack items.
    pub fn data_swap(&mut self) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let a = self.pop_value()?;
            let b = self.pop_value().inspect_err(|_| {
                // put the first item back before reporting underflow
                let _ = self.push_value(a);
            })?;
            self.push_value(a)?;
            self.push_value(b)
        })();
        match r {
            Ok(()) => true,
            Err(flag) => {
                self.flag(flag);
                false
            }
        }
    }

    /// Structured stack shuffle, e.g. `"abc-abcabc"` copies the top three
    /// items. The left side binds letters bottom..top; the right side is
    /// the new stack, rightmost on top. Fails without touching the stack
    /// on underflow, bad move strings, or linearity violations.
    pub fn data_move(&mut self, moves: &str) -> bool {
        let _b = self.busy();
        match self.data_move_inner(moves) {
            Ok(()) => true,
            Err(flag) => {
                self.flag(flag);
                false
            }
        }
    }

    fn data_move_inner(&mut self, moves: &str) -> OpResult<()> {
        let Some((lhs, rhs)) = moves.split_once('-') else {
            return Err(crate::error::E_DATA_TYPE);
        };
        let lhs: Vec<char> = lhs.chars().collect();
        let rhs: Vec<char> = rhs.chars().collect();
        if !lhs.iter().chain(rhs.iter()).all(|c| c.is_ascii_alphabetic()) {
            return Err(crate::error::E_DATA_TYPE);
        }
        // each LHS letter binds at most once; RHS letters must be bound
        let mut bound: Vec<char> = Vec::new();
        for &c in &lhs {
            if bound.contains(&c) {
                return Err(crate::error::E_DATA_TYPE);
            }
            bound.push(c);
        }
        if !rhs.iter().all(|c| bound.contains(c)) {
            return Err(crate::error::E_DATA_TYPE);
        }
        if self.data_depth < lhs.len() {
            return Err(E_UNDERFLOW);
        }
        // read bindings nondestructively: lhs rightmost is top of stack
        let mut values: Vec<(char, Value)> = Vec::with_capacity(lhs.len());
        for (i, &c) in lhs.iter().rev().enumerate() {
            values.push((c, self.peek_at(i)?));
        }
        // linearity: a linear value may be used exactly once
        for &(c, v) in &values {
            let uses = rhs.iter().filter(|&&r| r == c).count();
            if uses != 1 && self.linear_violation(v) {
                return Err(E_LINEARITY);
            }
        }
        // commit: drop the lhs items, push the rhs
        for _ in 0..lhs.len() {
            self.pop_value()?;
        }
        for &c in &rhs {
            let v = values.iter().find(|(b, _)| *b == c).expect("bound").1;
            self.push_value(v)?;
        }
        Ok(())
    }

    /// Top `amt` stack values, top first, after a linearity scan.
    fn linear_checked_run(&self, amt: usize) -> OpResult<Vec<Value>> {
        if self.data_depth < amt {
            return Err(E_UNDERFLOW);
        }
        let mut run = Vec::with_capacity(amt);
        let mut head = self.roots.data;
        for _ in 0..amt {
            let b = unsafe { (*head).data.branch };
            if self.linear_violation(b.l) {
                return Err(E_LINEARITY);
            }
            run.push(b.l);
            head = b.r;
        }
        Ok(run)
    }

    /// Copy the top `amt` items.
    pub fn data_copy(&mut self, amt: usize) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let run = self.linear_checked_run(amt)?;
            // bottom of the copied run first, so order is preserved
            for &v in run.iter().rev() {
                self.push_value(v)?;
            }
            Ok(())
        })();
        match r {
            Ok(()) => true,
            Err(flag) => {
                self.flag(flag);
                false
            }
        }
    }

    /// Drop the top `amt` items.
    pub fn data_drop(&mut self, amt: usize) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let run = self.linear_checked_run(amt)?;
            let mut head = self.roots.data;
            for _ in 0..run.len() {
                head = unsafe { (*head).data.branch }.r;
            }
            self.roots.data = head;
            self.data_depth -= amt;
            Ok(())
        })();
        match r {
            Ok(()) => true,
            Err(flag) => {
                self.flag(flag);
                false
            }
        }
    }

    /// Move `amt` items to the stash (positive) or back (negative), one
    /// element at a time.
    pub fn data_stash(&mut self, amt: i32) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            if amt >= 0 {
                let n = amt as usize;
                if self.data_depth < n {
                    return Err(E_UNDERFLOW);
                }
                for _ in 0..n {
                    let v = self.pop_value()?;
                    self.roots.stash = mk_pair(&mut self.alloc, v, self.roots.stash)?;
                    self.stash_depth += 1;
                }
            } else {
                let n = amt.unsigned_abs() as usize;
                if self.stash_depth < n {
                    return Err(E_UNDERFLOW);
                }
                for _ in 0..n {
                    let head = self.roots.stash;
                    let b = unsafe { (*head).data.branch };
                    self.roots.stash = b.r;
                    self.stash_depth -= 1;
                    self.push_value(b.l)?;
                }
            }
            Ok(())
        })();
        match r {
            Ok(()) => true,
            Err(flag) => {
                self.flag(flag);
                false
            }
        }
    }

    // -----------------------------------------------------------------
    // Foreign data
    // -----------------------------------------------------------------

    /// Push a host-owned resource. The release callback runs exactly once
    /// from the collector after the value becomes unreachable.
    pub fn foreign_push(
        &mut self,
        ptr: *mut u8,
        release: Option<ReleaseFn>,
        arg: *mut u8,
        linear: bool,
    ) -> bool {
        let _b = self.busy();
        let extra = if linear { AGGR_LINEAR } else { 0 };
        let r = mk_foreign(&mut self.alloc, ptr, release, arg, extra)
            .and_then(|v| self.push_value(v));
        match r {
            Ok(()) => true,
            Err(flag) => {
                self.flag(flag);
                false
            }
        }
    }

    /// Read the raw pointer of the foreign value on top of the stack.
    pub fn foreign_peek(&mut self) -> Option<*mut u8> {
        let _b = self.busy();
        let v = self.peek_at(0).ok()?;
        if v.is_null() || unsafe { (*v).hdr.type_id } != TYPE_FOREIGN_PTR {
            return None;
        }
        Some(unsafe { (*v).data.foreign.ptr })
    }
}

impl Drop for Glas {
    fn drop(&mut self) {
        // orphaned linear data is a client bug worth a warning
        let mut head = self.roots.data;
        while !head.is_null() {
            let b = unsafe { (*head).data.branch };
            if !b.l.is_null() && unsafe { (*b.l).is_linear() } {
                tracing::warn!("context dropped with linear data on the stack");
                break;
            }
            head = b.r;
        }
        // unresolved child gates die with us
        for gate in self.gates.drain(..) {
            gate.die();
        }
        self.alloc.retire();
        unsafe { (*self.thread).finish() };
        if let Some(latch) = self.my_latch.take() {
            latch.done();
        }
    }
}
