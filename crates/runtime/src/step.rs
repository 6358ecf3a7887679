//! Transactional steps: checkpoint, abort, commit, forks, choices.
//!
//! A step is the work between two successful commits. The checkpoint is
//! cheap because values are immutable: restoring four root pointers and a
//! little metadata rewinds the context completely; cells allocated by an
//! aborted step simply become garbage.
//!
//! Commit publishes register writes under the runtime commit lock after
//! validating every recorded read against the registers' current content
//! pointers (the version), and enqueues post-commit actions while still
//! holding the lock so queue order agrees with commit order.

use crate::context::Glas;
use crate::error::{E_ATOMIC_CB, E_CONFLICT, E_DEAD_BRANCH, OpResult};
use crate::postop::PostOp;
use crate::registers;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

const GATE_PENDING: u8 = 0;
const GATE_COMMITTED: u8 = 1;
const GATE_DEAD: u8 = 2;

/// Links a fork (or choice) to the step that created it. Forks block
/// their first commit until the gate resolves; choices only observe
/// death.
pub(crate) struct StepGate {
    state: Mutex<u8>,
    cv: Condvar,
    /// Whether a child commit must wait for resolution (forks yes,
    /// choices no).
    pub wait_required: bool,
}

impl StepGate {
    pub fn new(wait_required: bool) -> Arc<StepGate> {
        Arc::new(StepGate {
            state: Mutex::new(GATE_PENDING),
            cv: Condvar::new(),
            wait_required,
        })
    }

    pub fn commit(&self) {
        *self.state.lock().expect("gate poisoned") = GATE_COMMITTED;
        self.cv.notify_all();
    }

    pub fn die(&self) {
        let mut s = self.state.lock().expect("gate poisoned");
        if *s == GATE_PENDING {
            *s = GATE_DEAD;
        }
        self.cv.notify_all();
    }

    pub fn is_dead(&self) -> bool {
        *self.state.lock().expect("gate poisoned") == GATE_DEAD
    }

    /// Block until resolved; true when committed, false when dead.
    pub fn wait_resolved(&self) -> bool {
        let mut s = self.state.lock().expect("gate poisoned");
        while *s == GATE_PENDING {
            s = self.cv.wait(s).expect("gate poisoned");
        }
        *s == GATE_COMMITTED
    }
}

/// Counts live forks under a callback context; the caller joins on zero.
#[derive(Default)]
pub(crate) struct ForkLatch {
    count: Mutex<usize>,
    cv: Condvar,
}

impl ForkLatch {
    pub fn add(&self) {
        *self.count.lock().expect("latch poisoned") += 1;
    }

    pub fn done(&self) {
        let mut n = self.count.lock().expect("latch poisoned");
        *n -= 1;
        if *n == 0 {
            self.cv.notify_all();
        }
    }

    pub fn join(&self) {
        let mut n = self.count.lock().expect("latch poisoned");
        while *n > 0 {
            n = self.cv.wait(n).expect("latch poisoned");
        }
    }
}

/// A post-commit action registered during the step.
pub(crate) struct PendingPostop {
    pub queue: String,
    pub op: Option<PostOp>,
    pub cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Glas {
    /// Commit the current step. Returns false, leaving the step intact,
    /// when error flags are set or the step lost its choice; aborts
    /// automatically (and returns false) on a register conflict.
    pub fn step_commit(&mut self) -> bool {
        if self.atomic_cb {
            self.err.set(E_ATOMIC_CB);
            return false;
        }
        // resolve fork linkage before touching shared state
        if let Some(gate) = self.parent_gate.clone() {
            let committed = if gate.wait_required {
                gate.wait_resolved()
            } else {
                !gate.is_dead()
            };
            if !committed {
                self.err.set(E_DEAD_BRANCH);
                return false;
            }
            self.parent_gate = None;
        }
        if self.err.any() {
            return false;
        }
        let _b = self.busy();
        if self.err.any() {
            return false;
        }
        let published: OpResult<()> = {
            let _commit = glas_core::rt::rt().commit_lock.lock().expect("commit lock");
            match registers::validate_logs(self) {
                Ok(true) => {
                    // the first successful committer wins a choice
                    if let Some(token) = self.choice_token.clone() {
                        if token
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                        {
                            drop(_commit);
                            self.err.set(E_DEAD_BRANCH);
                            return false;
                        }
                        self.choice_token = None;
                    }
                    let r = registers::publish_logs(self);
                    if r.is_ok() {
                        for mut p in self.postops.drain(..) {
                            if let Some(op) = p.op.take() {
                                crate::postop::enqueue(&p.queue, op);
                            }
                        }
                    }
                    r
                }
                Ok(false) => {
                    drop(_commit);
                    tracing::debug!("step lost an optimistic conflict");
                    self.err.set(E_CONFLICT);
                    drop(_b);
                    self.step_abort();
                    return false;
                }
                Err(flag) => Err(flag),
            }
        };
        if let Err(flag) = published {
            self.err.set(flag);
            return false;
        }
        // advance the checkpoint
        for gate in self.gates.drain(..) {
            gate.commit();
        }
        self.roots.ckpt_data = self.roots.data;
        self.roots.ckpt_stash = self.roots.stash;
        self.roots.ckpt_ns = self.roots.ns;
        self.roots.log_reads = std::ptr::null_mut();
        self.roots.log_writes = std::ptr::null_mut();
        self.roots.log_qreads = std::ptr::null_mut();
        self.roots.log_qwrites = std::ptr::null_mut();
        self.ckpt = crate::context::CkptMeta {
            err: 0,
            shadow_armed: self.shadow_armed,
            data_depth: self.data_depth,
            stash_depth: self.stash_depth,
            alloc_mark: self.alloc.allocated,
        };
        true
    }

    /// Abort the current step: rewind to the checkpoint, run cancel hooks
    /// of pending post-ops, and prune child gates.
    pub fn step_abort(&mut self) {
        {
            let _b = glas_core::thread::BusyGuard::enter(unsafe { &*self.thread });
            self.roots.data = self.roots.ckpt_data;
            self.roots.stash = self.roots.ckpt_stash;
            self.roots.ns = self.roots.ckpt_ns;
            self.roots.log_reads = std::ptr::null_mut();
            self.roots.log_writes = std::ptr::null_mut();
            self.roots.log_qreads = std::ptr::null_mut();
            self.roots.log_qwrites = std::ptr::null_mut();
            self.data_depth = self.ckpt.data_depth;
            self.stash_depth = self.ckpt.stash_depth;
            self.shadow_armed = self.ckpt.shadow_armed;
            self.err.restore(self.ckpt.err);
            self.ckpt.alloc_mark = self.alloc.allocated;
        }
        // cancel hooks run outside the busy window; they are host code
        for mut p in self.postops.drain(..) {
            if let Some(cancel) = p.cancel.take() {
                cancel();
            }
        }
        for gate in self.gates.drain(..) {
            gate.die();
        }
    }

    /// Register a post-commit action. `op` runs on the named queue iff
    /// the step commits; `cancel` runs immediately on abort.
    pub fn step_postop(
        &mut self,
        queue: &str,
        op: PostOp,
        cancel: Option<Box<dyn FnOnce() + Send>>,
    ) {
        self.postops.push(PendingPostop {
            queue: queue.to_string(),
            op: Some(op),
            cancel,
        });
    }

    /// Fork: a new context with a copy of the namespace and `transfer`
    /// cells moved over from the data stack. The fork cannot commit until
    /// this step commits; it dies if this step aborts.
    pub fn fork(&mut self, transfer: u8) -> Option<Glas> {
        let _b = self.busy();
        let n = transfer as usize;
        if self.data_depth < n {
            self.err.set(crate::error::E_UNDERFLOW);
            return None;
        }
        let gate = StepGate::new(true);
        self.gates.push(gate.clone());
        let latch = if self.in_callback { self.fork_latch.clone() } else { None };
        let mut child = Glas::with_parts(self.roots.ns, Some(gate), None, latch);
        // move the top n cells, preserving order
        let mut run = Vec::with_capacity(n);
        for _ in 0..n {
            run.push(self.pop_value().expect("depth checked"));
        }
        for v in run.into_iter().rev() {
            if let Err(flag) = child.push_value(v) {
                child.err.set(flag);
            }
        }
        child.roots.ckpt_data = child.roots.data;
        child.ckpt.data_depth = child.data_depth;
        child.in_callback = self.in_callback;
        child.fork_latch = self.fork_latch.clone();
        Some(child)
    }

    /// Choice: a sibling with a copy of namespace, stack, and stash. The
    /// first of the two contexts to commit wins; the other's commits fail
    /// with E_DEAD_BRANCH.
    pub fn choice(&mut self) -> Glas {
        let _b = self.busy();
        let token = Arc::new(AtomicBool::new(false));
        self.choice_token = Some(token.clone());
        let gate = StepGate::new(false);
        self.gates.push(gate.clone());
        let latch = if self.in_callback { self.fork_latch.clone() } else { None };
        let mut child = Glas::with_parts(self.roots.ns, Some(gate), Some(token), latch);
        child.roots.data = self.roots.data;
        child.roots.stash = self.roots.stash;
        child.roots.ckpt_data = child.roots.data;
        child.roots.ckpt_stash = child.roots.stash;
        child.data_depth = self.data_depth;
        child.stash_depth = self.stash_depth;
        child.ckpt.data_depth = child.data_depth;
        child.ckpt.stash_depth = child.stash_depth;
        child.in_callback = self.in_callback;
        child.fork_latch = self.fork_latch.clone();
        child
    }
}
