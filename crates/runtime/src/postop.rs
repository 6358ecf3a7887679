//! Post-commit action queues.
//!
//! Committed steps append operations to named queues; one worker thread
//! per queue drains it sequentially, preserving commit order within the
//! queue. Cross-queue ordering is not guaranteed. Queues are bounded: a
//! committer that would overflow a queue stalls until the worker catches
//! up (it holds the runtime commit lock while stalled, so commits behind
//! it wait too).

use glas_core::rt::rt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

pub type PostOp = Box<dyn FnOnce() + Send>;

/// Lifetime counters for diagnostics.
pub static TOTAL_ENQUEUED: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_DRAINED: AtomicU64 = AtomicU64::new(0);

struct OpQueue {
    name: String,
    ops: Mutex<VecDeque<PostOp>>,
    nonempty: Condvar,
    space: Condvar,
}

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<OpQueue>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<OpQueue>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn queue(name: &str) -> Arc<OpQueue> {
    let mut reg = registry().lock().expect("postop registry poisoned");
    if let Some(q) = reg.get(name) {
        return q.clone();
    }
    let q = Arc::new(OpQueue {
        name: name.to_string(),
        ops: Mutex::new(VecDeque::new()),
        nonempty: Condvar::new(),
        space: Condvar::new(),
    });
    reg.insert(name.to_string(), q.clone());
    let worker = q.clone();
    std::thread::Builder::new()
        .name(format!("glas-postop-{name}"))
        .spawn(move || worker_main(worker))
        .expect("failed to spawn postop worker");
    q
}

/// Append an operation to the named queue, stalling while the queue is at
/// its bound. Called with the runtime commit lock held, which is what
/// makes queue order agree with commit order.
pub(crate) fn enqueue(name: &str, op: PostOp) {
    let q = queue(name);
    let bound = rt().tuning.postop_queue_bound.load(Ordering::Relaxed).max(1);
    let mut ops = q.ops.lock().expect("postop queue poisoned");
    while ops.len() >= bound {
        tracing::debug!(queue = %q.name, "postop queue full; committer stalls");
        ops = q.space.wait(ops).expect("postop queue poisoned");
    }
    ops.push_back(op);
    TOTAL_ENQUEUED.fetch_add(1, Ordering::Relaxed);
    q.nonempty.notify_one();
}

fn worker_main(q: Arc<OpQueue>) {
    loop {
        let op = {
            let mut ops = q.ops.lock().expect("postop queue poisoned");
            loop {
                if let Some(op) = ops.pop_front() {
                    q.space.notify_all();
                    break op;
                }
                ops = q.nonempty.wait(ops).expect("postop queue poisoned");
            }
        };
        op();
        TOTAL_DRAINED.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of queue depths for diagnostics.
pub fn queue_depths() -> Vec<(String, usize)> {
    let reg = registry().lock().expect("postop registry poisoned");
    reg.iter()
        .map(|(name, q)| (name.clone(), q.ops.lock().expect("postop queue poisoned").len()))
        .collect()
}

/// Test support: block until every queue is drained.
pub fn drain_all() {
    loop {
        let busy = queue_depths().iter().any(|(_, n)| *n > 0);
        if !busy && TOTAL_ENQUEUED.load(Ordering::Acquire) == TOTAL_DRAINED.load(Ordering::Acquire)
        {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}
