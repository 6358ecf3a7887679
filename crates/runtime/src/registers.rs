//! Registers: transactional mutable cells, volumes, and queue views.
//!
//! A step never mutates a register directly. Every access is recorded in
//! per-context log lists (themselves cell lists, so they are GC roots),
//! and commit validates the logs against the registers' current content
//! pointers before publishing. The content pointer doubles as the
//! register's version: values are immutable and never relocated, so
//! pointer equality is exact.
//!
//! Queue views keep the single-reader/multi-writer discipline conflict
//! free: writers only record tails to append, and the reader validates
//! that the list it observed is still the left spine of the current
//! content, tolerating tails appended behind its back.

use crate::context::Glas;
use crate::dict::{dict_get, dict_insert, label_path};
use crate::error::{E_DATA_TYPE, E_EPHEMERALITY, E_LINEARITY, E_NAME_TYPE, E_NAME_UNDEF, OpResult};
use crate::list::{is_list_shallow, list_append, list_len, list_split};
use crate::namespace::{Resolution, resolve_name};
use crate::value::{Value, int_of_value, mk_pair, mk_register, mk_take_concat, mk_thunk};
use glas_core::alloc::AllocCursor;
use glas_core::cell::{TYPE_REGISTER, TYPE_TAKE_CONCAT, aggr_of, eph_level};
use glas_core::gc;
use glas_core::rt::rt;
use std::sync::atomic::Ordering;

const W_CONTENT: usize = 0;

#[inline]
fn car(list: Value) -> Value {
    unsafe { (*list).data.branch }.l
}

#[inline]
fn cdr(list: Value) -> Value {
    unsafe { (*list).data.branch }.r
}

/// Current content pointer of a register.
#[inline]
pub(crate) fn reg_content(reg: Value) -> Value {
    unsafe { (*reg).load_ptr(W_CONTENT) }
}

// Log entry shapes, all cons pairs:
//   reads:   (reg, (observed, ()))
//   writes:  (reg, (observed, (pending, ())))
//   qreads:  (reg, (observed, (rest, ())))
//   qwrites: (reg, (tail, ()))

fn entry2(alloc: &mut AllocCursor, reg: Value, a: Value) -> OpResult<Value> {
    let t = mk_pair(alloc, a, std::ptr::null_mut())?;
    mk_pair(alloc, reg, t)
}

fn entry3(alloc: &mut AllocCursor, reg: Value, a: Value, b: Value) -> OpResult<Value> {
    let t = mk_pair(alloc, b, std::ptr::null_mut())?;
    let t = mk_pair(alloc, a, t)?;
    mk_pair(alloc, reg, t)
}

/// Find the newest entry for `reg` in a log list.
fn log_find(log: Value, reg: Value) -> Option<Value> {
    let mut cur = log;
    while !cur.is_null() {
        let entry = car(cur);
        if car(entry) == reg {
            return Some(entry);
        }
        cur = cdr(cur);
    }
    None
}

fn entry_field(entry: Value, i: usize) -> Value {
    let mut cur = cdr(entry);
    for _ in 0..i {
        cur = cdr(cur);
    }
    car(cur)
}

impl Glas {
    /// In-step view of a register: pending write if any, else current
    /// content (recording the read).
    fn reg_view(&mut self, reg: Value) -> OpResult<Value> {
        if let Some(entry) = log_find(self.roots.log_writes, reg) {
            return Ok(entry_field(entry, 1));
        }
        let observed = reg_content(reg);
        if log_find(self.roots.log_reads, reg).is_none() {
            let e = entry2(&mut self.alloc, reg, observed)?;
            self.roots.log_reads = mk_pair(&mut self.alloc, e, self.roots.log_reads)?;
        }
        Ok(observed)
    }

    /// Record a pending write, keeping the first-observed version.
    fn reg_record_write(&mut self, reg: Value, pending: Value) -> OpResult<()> {
        if eph_level(aggr_of(pending)) >= 3 {
            return Err(E_EPHEMERALITY);
        }
        let observed = match log_find(self.roots.log_writes, reg) {
            Some(entry) => entry_field(entry, 0),
            None => match log_find(self.roots.log_reads, reg) {
                Some(entry) => entry_field(entry, 0),
                None => reg_content(reg),
            },
        };
        let e = entry3(&mut self.alloc, reg, observed, pending)?;
        self.roots.log_writes = mk_pair(&mut self.alloc, e, self.roots.log_writes)?;
        Ok(())
    }

    fn resolve_register(&mut self, name: &str) -> OpResult<Value> {
        match resolve_name(self, name.as_bytes())? {
            Resolution::Register(reg) => Ok(reg),
            Resolution::NotFound => Err(E_NAME_UNDEF),
            _ => Err(E_NAME_TYPE),
        }
    }

    /// Introduce a register family bound to `prefix`.
    pub fn reg_new(&mut self, prefix: &str) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            crate::namespace::check_shadow(self, prefix.as_bytes())?;
            let vol = mk_register(&mut self.alloc, std::ptr::null_mut())?;
            crate::namespace::define(self, prefix.as_bytes(), crate::namespace::DefKind::Volume, vol)
        })();
        self.finish_op(r)
    }

    /// Bind `prefix` to the runtime-global register volume, forcing its
    /// lazy initialization.
    pub fn reg_new_global(&mut self, prefix: &str) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            crate::namespace::check_shadow(self, prefix.as_bytes())?;
            let vol = globals_volume(&mut self.alloc)?;
            crate::namespace::define(self, prefix.as_bytes(), crate::namespace::DefKind::Volume, vol)
        })();
        self.finish_op(r)
    }

    /// Swap the top of the data stack with a register.
    pub fn reg_rw(&mut self, name: &str) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let reg = self.resolve_register(name)?;
            let v = self.peek_at(0)?;
            if eph_level(aggr_of(v)) >= 3 {
                return Err(E_EPHEMERALITY);
            }
            let old = self.reg_view(reg)?;
            self.reg_record_write(reg, v)?;
            let _ = self.pop_value()?;
            self.push_value(old)
        })();
        self.finish_op(r)
    }

    /// Copy a register's value onto the stack.
    pub fn reg_get(&mut self, name: &str) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let reg = self.resolve_register(name)?;
            let v = self.reg_view(reg)?;
            if !self.linearity_unchecked && !v.is_null() && unsafe { (*v).is_linear() } {
                return Err(E_LINEARITY);
            }
            self.push_value(v)
        })();
        self.finish_op(r)
    }

    /// Replace a register's value from the stack, dropping the old one.
    pub fn reg_set(&mut self, name: &str) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let reg = self.resolve_register(name)?;
            let old = self.reg_view(reg)?;
            if !self.linearity_unchecked && !old.is_null() && unsafe { (*old).is_linear() } {
                return Err(E_LINEARITY);
            }
            let v = self.peek_at(0)?;
            if eph_level(aggr_of(v)) >= 3 {
                return Err(E_EPHEMERALITY);
            }
            self.reg_record_write(reg, v)?;
            let _ = self.pop_value()?;
            Ok(())
        })();
        self.finish_op(r)
    }

    pub(crate) fn finish_op(&mut self, r: OpResult<()>) -> bool {
        match r {
            Ok(()) => true,
            Err(flag) => {
                self.flag(flag);
                false
            }
        }
    }

    // -----------------------------------------------------------------
    // Queue views
    // -----------------------------------------------------------------

    /// Reader's current view of the queue: post-read remainder when a
    /// read already happened this step, else the observed content.
    fn queue_view(&mut self, reg: Value) -> OpResult<(Value, Value)> {
        if let Some(entry) = log_find(self.roots.log_qreads, reg) {
            return Ok((entry_field(entry, 0), entry_field(entry, 1)));
        }
        let observed = reg_content(reg);
        Ok((observed, observed))
    }

    fn queue_update(&mut self, reg: Value, observed: Value, rest: Value) -> OpResult<()> {
        let e = entry3(&mut self.alloc, reg, observed, rest)?;
        self.roots.log_qreads = mk_pair(&mut self.alloc, e, self.roots.log_qreads)?;
        Ok(())
    }

    /// Read `amt` elements from the queue onto the stack as one list.
    /// Fails (false, no flags) when the queue holds fewer elements.
    pub fn queue_read_n(&mut self, name: &str, amt: u64) -> bool {
        let _b = self.busy();
        let reg = match self.resolve_register(name) {
            Ok(reg) => reg,
            Err(flag) => {
                self.flag(flag);
                return false;
            }
        };
        if amt == 0 {
            let r = self.push_value(std::ptr::null_mut());
            return self.finish_op(r);
        }
        let r: OpResult<bool> = (|| {
            let (observed, view) = self.queue_view(reg)?;
            let Some(len) = list_len(view) else {
                return Err(E_DATA_TYPE);
            };
            if len < amt {
                return Ok(false);
            }
            let (taken, rest) = list_split(&mut self.alloc, view, amt)?;
            self.queue_update(reg, observed, rest)?;
            self.push_value(taken)?;
            Ok(true)
        })();
        match r {
            Ok(done) => done,
            Err(flag) => {
                self.flag(flag);
                false
            }
        }
    }

    /// Read with the element count taken from the stack.
    pub fn queue_read(&mut self, name: &str) -> bool {
        let (nv, amt) = {
            let _b = self.busy();
            let nv = match self.pop_value() {
                Ok(v) => v,
                Err(flag) => {
                    self.flag(flag);
                    return false;
                }
            };
            match int_of_value(nv) {
                Some(n) if n >= 0 => (nv, n as u64),
                _ => {
                    let _ = self.push_value(nv);
                    self.flag(E_DATA_TYPE);
                    return false;
                }
            }
        };
        let ok = self.queue_read_n(name, amt);
        if !ok {
            let _b = self.busy();
            let _ = self.push_value(nv);
        }
        ok
    }

    /// Prepend a list back onto the head of the queue (reader side).
    pub fn queue_unread(&mut self, name: &str) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let reg = self.resolve_register(name)?;
            let l = self.pop_value()?;
            if list_len(l).is_none() {
                let _ = self.push_value(l);
                return Err(E_DATA_TYPE);
            }
            let (observed, view) = self.queue_view(reg)?;
            let rest = list_append(&mut self.alloc, l, view)?;
            self.queue_update(reg, observed, rest)
        })();
        self.finish_op(r)
    }

    /// Append a list to the tail of the queue (writer side). Writers
    /// never observe queue contents, so they never conflict.
    pub fn queue_write(&mut self, name: &str) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let reg = self.resolve_register(name)?;
            let l = self.pop_value()?;
            if list_len(l).is_none() {
                let _ = self.push_value(l);
                return Err(E_DATA_TYPE);
            }
            match log_find(self.roots.log_qwrites, reg) {
                Some(entry) => {
                    let merged = list_append(&mut self.alloc, entry_field(entry, 0), l)?;
                    let e = entry2(&mut self.alloc, reg, merged)?;
                    self.roots.log_qwrites = mk_pair(&mut self.alloc, e, self.roots.log_qwrites)?;
                }
                None => {
                    let e = entry2(&mut self.alloc, reg, l)?;
                    self.roots.log_qwrites = mk_pair(&mut self.alloc, e, self.roots.log_qwrites)?;
                }
            }
            Ok(())
        })();
        self.finish_op(r)
    }

    /// Copy the first `amt` elements without consuming them. Fails on
    /// linear contents unless checks are suppressed.
    pub fn queue_peek_n(&mut self, name: &str, amt: u64) -> bool {
        let _b = self.busy();
        let r: OpResult<bool> = (|| {
            let reg = self.resolve_register(name)?;
            let (_, view) = self.queue_view(reg)?;
            let Some(len) = list_len(view) else {
                return Err(E_DATA_TYPE);
            };
            if len < amt {
                return Ok(false);
            }
            let (taken, _) = list_split(&mut self.alloc, view, amt)?;
            if !self.linearity_unchecked
                && !taken.is_null()
                && unsafe { (*taken).is_linear() }
            {
                return Err(E_LINEARITY);
            }
            self.push_value(taken)?;
            Ok(true)
        })();
        match r {
            Ok(done) => done,
            Err(flag) => {
                self.flag(flag);
                false
            }
        }
    }

    /// Peek with the element count taken from the stack.
    pub fn queue_peek(&mut self, name: &str) -> bool {
        let (nv, amt) = {
            let _b = self.busy();
            let nv = match self.pop_value() {
                Ok(v) => v,
                Err(flag) => {
                    self.flag(flag);
                    return false;
                }
            };
            match int_of_value(nv) {
                Some(n) if n >= 0 => (nv, n as u64),
                _ => {
                    let _ = self.push_value(nv);
                    self.flag(E_DATA_TYPE);
                    return false;
                }
            }
        };
        let ok = self.queue_peek_n(name, amt);
        if !ok {
            let _b = self.busy();
            let _ = self.push_value(nv);
        }
        ok
    }
}

// ---------------------------------------------------------------------
// Commit-side validation and publication
// ---------------------------------------------------------------------

/// Appended tails behind the reader's observed list: walk the left spine
/// of `content` down to `observed`, collecting the concat rights (newest
/// outermost).
fn queue_suffix(content: Value, observed: Value) -> Option<Vec<Value>> {
    let mut extras = Vec::new();
    let mut v = content;
    loop {
        if v == observed {
            return Some(extras);
        }
        if v.is_null() || unsafe { (*v).hdr.type_id } != TYPE_TAKE_CONCAT {
            return None;
        }
        let t = unsafe { (*v).data.take_concat };
        extras.push(t.right);
        v = t.left;
    }
}

/// Check every recorded access against current register state. `false`
/// means a conflict.
pub(crate) fn validate_logs(g: &mut Glas) -> OpResult<bool> {
    let mut cur = g.roots.log_reads;
    while !cur.is_null() {
        let entry = car(cur);
        if reg_content(car(entry)) != entry_field(entry, 0) {
            return Ok(false);
        }
        cur = cdr(cur);
    }
    let mut seen: Vec<Value> = Vec::new();
    let mut cur = g.roots.log_writes;
    while !cur.is_null() {
        let entry = car(cur);
        let reg = car(entry);
        if !seen.contains(&reg) {
            seen.push(reg);
            if reg_content(reg) != entry_field(entry, 0) {
                return Ok(false);
            }
        }
        cur = cdr(cur);
    }
    let mut cur = g.roots.log_qreads;
    while !cur.is_null() {
        let entry = car(cur);
        if queue_suffix(reg_content(car(entry)), entry_field(entry, 0)).is_none() {
            return Ok(false);
        }
        cur = cdr(cur);
    }
    let mut cur = g.roots.log_qwrites;
    while !cur.is_null() {
        let entry = car(cur);
        if !is_list_shallow(reg_content(car(entry))) {
            return Err(E_DATA_TYPE);
        }
        cur = cdr(cur);
    }
    Ok(true)
}

/// Publish the validated logs. All new content values are computed first
/// so a late type error cannot leave a partial publish behind.
pub(crate) fn publish_logs(g: &mut Glas) -> OpResult<()> {
    let mut updates: Vec<(Value, Value)> = Vec::new();
    let mut written: Vec<Value> = Vec::new();

    // plain writes: newest entry per register wins
    let mut cur = g.roots.log_writes;
    while !cur.is_null() {
        let entry = car(cur);
        let reg = car(entry);
        if !written.contains(&reg) {
            written.push(reg);
            updates.push((reg, entry_field(entry, 1)));
        }
        cur = cdr(cur);
    }

    // queue reads: remainder plus whatever writers appended meanwhile
    let mut cur = g.roots.log_qreads;
    while !cur.is_null() {
        let entry = car(cur);
        let reg = car(entry);
        if !written.contains(&reg) {
            written.push(reg);
            let extras = queue_suffix(reg_content(reg), entry_field(entry, 0))
                .expect("validated before publish");
            let mut new_content = entry_field(entry, 1);
            for &e in extras.iter().rev() {
                new_content = list_append(&mut g.alloc, new_content, e)?;
            }
            updates.push((reg, new_content));
        }
        cur = cdr(cur);
    }

    // queue writes: tails appended in log order (oldest first)
    let mut tails: Vec<(Value, Value)> = Vec::new();
    let mut cur = g.roots.log_qwrites;
    while !cur.is_null() {
        let entry = car(cur);
        let reg = car(entry);
        if !tails.iter().any(|(r, _)| *r == reg) {
            tails.push((reg, entry_field(entry, 0)));
        }
        cur = cdr(cur);
    }
    for (reg, tail) in tails {
        if let Some(ix) = updates.iter().position(|(r, _)| *r == reg) {
            let merged = list_append(&mut g.alloc, updates[ix].1, tail)?;
            updates[ix].1 = merged;
        } else if written.contains(&reg) {
            // a plain write overrode the queue; drop the tail
        } else {
            // a bare append must keep the old content on the left spine:
            // an uncommitted reader revalidates by finding its observed
            // list there, so no flattening here
            let content = reg_content(reg);
            let left_len = list_len(content).ok_or(E_DATA_TYPE)?;
            let merged = mk_take_concat(&mut g.alloc, left_len, content, tail)?;
            updates.push((reg, merged));
        }
    }

    for (reg, content) in updates {
        unsafe { gc::write_ref(reg, W_CONTENT, content) };
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------

/// Look up (or lazily create) the register for `inner` within a volume.
/// Creation is a runtime-level CAS on the volume's content dict, outside
/// any step transaction.
pub(crate) fn volume_fetch(
    alloc: &mut AllocCursor,
    vol: Value,
    inner: &[u8],
) -> OpResult<Value> {
    debug_assert_eq!(unsafe { (*vol).hdr.type_id }, TYPE_REGISTER);
    let path = label_path(inner);
    loop {
        let content = reg_content(vol);
        if let Some(reg) = dict_get(alloc, content, &path)? {
            return Ok(reg);
        }
        let fresh = mk_register(alloc, std::ptr::null_mut())?;
        let (grown, _) = dict_insert(alloc, content, &path, fresh)?;
        let swapped = unsafe {
            (*vol).word_atomic(W_CONTENT).compare_exchange(
                content,
                grown,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
        };
        if swapped.is_ok() {
            gc::ref_published(vol, grown);
            return Ok(fresh);
        }
        // racing creator won; retry against the new dict
    }
}

/// Whether the volume has any created register under it.
pub(crate) fn volume_inuse(vol: Value) -> bool {
    !reg_content(vol).is_null()
}

/// The runtime-global register volume, created lazily through a thunk on
/// first access.
pub(crate) fn globals_volume(alloc: &mut AllocCursor) -> OpResult<Value> {
    let mut thunk = rt().globals.load(Ordering::Acquire);
    if thunk.is_null() {
        let fresh = mk_thunk(alloc, std::ptr::null_mut())?;
        match rt().globals.compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => thunk = fresh,
            Err(winner) => thunk = winner,
        }
    }
    crate::thunk::force(alloc, thunk, |alloc, _| {
        mk_register(alloc, std::ptr::null_mut())
    })
}
