//! The namespace: definitions, shadowing, and callback programs.
//!
//! A context's namespace is one dict cell mapping names to definition
//! records, so forks share it copy-on-write for free. A definition is
//! itself a tiny dict with exactly one of these labels:
//!
//! - `r`: a register cell
//! - `v`: a volume register whose content dict maps inner names to
//!   registers, created lazily
//! - `p`: a pair of (callback foreign cell, captured namespace)
//! - `e`: an environment mount: another namespace dict, consulted for
//!   names under the mount prefix
//!
//! Name resolution prefers an exact entry, then the longest defined
//! prefix carrying a volume or mount.

use crate::context::Glas;
use crate::dict::{dict_for_each_label, dict_get, dict_insert, label_path};
use crate::error::{
    E_NAME_SHADOW, E_NAME_TYPE, E_NAME_UNDEF, E_UNDERFLOW, OpResult,
};
use crate::registers::volume_fetch;
use crate::step::ForkLatch;
use crate::value::{Value, mk_foreign, mk_pair};
use glas_core::alloc::AllocCursor;
use glas_core::cell::TYPE_FOREIGN_PTR;
use std::sync::Arc;

/// A client-defined program: callback plus calling conventions.
pub struct ProgCb {
    /// The operation; false is failure (backtracked), not error.
    pub op: Box<dyn Fn(&mut Glas) -> bool + Send + Sync>,
    /// Prefix under which the callback context sees its caller's
    /// namespace, e.g. `"$"`.
    pub caller_prefix: Option<Vec<u8>>,
    /// Data stack arity: cells consumed and produced.
    pub ar_in: u8,
    pub ar_out: u8,
    /// Atomic callbacks cannot yield-commit.
    pub atomic: bool,
}

pub(crate) enum DefKind {
    Register,
    Volume,
    Prog,
    Mount,
}

impl DefKind {
    fn label(&self) -> &'static [u8] {
        match self {
            DefKind::Register => b"r",
            DefKind::Volume => b"v",
            DefKind::Prog => b"p",
            DefKind::Mount => b"e",
        }
    }
}

/// Outcome of resolving a name.
pub(crate) enum Resolution {
    NotFound,
    Register(Value),
    /// Callback def: the (foreign, captured-ns) pair cell.
    Prog(Value),
}

unsafe fn release_progcb(arg: *mut u8) {
    drop(unsafe { Box::from_raw(arg.cast::<ProgCb>()) });
}

/// Wrap a ProgCb in a foreign cell owned by the cell's finalizer.
fn progcb_cell(alloc: &mut AllocCursor, cb: ProgCb) -> OpResult<Value> {
    let arg = Box::into_raw(Box::new(cb)).cast::<u8>();
    mk_foreign(alloc, arg, Some(release_progcb), arg, 0)
}

pub(crate) unsafe fn progcb_of<'a>(foreign: Value) -> &'a ProgCb {
    debug_assert_eq!(unsafe { (*foreign).hdr.type_id }, TYPE_FOREIGN_PTR);
    unsafe { &*(*foreign).data.foreign.ptr.cast::<ProgCb>() }
}

/// Install a definition record at `name` in the context's namespace.
pub(crate) fn define(g: &mut Glas, name: &[u8], kind: DefKind, payload: Value) -> OpResult<()> {
    let def = crate::value::make_bits_then(&mut g.alloc, &label_path(kind.label()), payload)?;
    let path = label_path(name);
    let (ns, _) = dict_insert(&mut g.alloc, g.roots.ns, &path, def)?;
    g.roots.ns = ns;
    g.shadow_armed = false;
    Ok(())
}

fn def_lookup(
    alloc: &mut AllocCursor,
    def: Value,
    kind: &DefKind,
) -> OpResult<Option<Value>> {
    dict_get(alloc, def, &label_path(kind.label()))
}

/// Exact-entry lookup: the raw definition record, if any.
fn ns_entry(alloc: &mut AllocCursor, ns: Value, name: &[u8]) -> OpResult<Option<Value>> {
    dict_get(alloc, ns, &label_path(name))
}

/// Resolve a name to a register or program, descending through volumes
/// and environment mounts.
pub(crate) fn resolve_name(g: &mut Glas, name: &[u8]) -> OpResult<Resolution> {
    let ns = g.roots.ns;
    resolve_in(&mut g.alloc, ns, name)
}

fn resolve_in(alloc: &mut AllocCursor, ns: Value, name: &[u8]) -> OpResult<Resolution> {
    if let Some(def) = ns_entry(alloc, ns, name)? {
        if let Some(reg) = def_lookup(alloc, def, &DefKind::Register)? {
            return Ok(Resolution::Register(reg));
        }
        if let Some(prog) = def_lookup(alloc, def, &DefKind::Prog)? {
            return Ok(Resolution::Prog(prog));
        }
        if let Some(vol) = def_lookup(alloc, def, &DefKind::Volume)? {
            // bare use of a volume prefix is a kind error, but an empty
            // inner name is a legal register of the family
            let reg = volume_fetch(alloc, vol, b"")?;
            return Ok(Resolution::Register(reg));
        }
    }
    // longest defined prefix carrying a volume or mount
    for split in (0..name.len()).rev() {
        let (prefix, inner) = name.split_at(split);
        let Some(def) = ns_entry(alloc, ns, prefix)? else {
            continue;
        };
        if let Some(vol) = def_lookup(alloc, def, &DefKind::Volume)? {
            let reg = volume_fetch(alloc, vol, inner)?;
            return Ok(Resolution::Register(reg));
        }
        if let Some(mount) = def_lookup(alloc, def, &DefKind::Mount)? {
            return resolve_in(alloc, mount, inner);
        }
    }
    Ok(Resolution::NotFound)
}

/// Whether defining `name` would hide an existing visible name, and if
/// so whether the context has shadowing armed.
pub(crate) fn check_shadow(g: &mut Glas, name: &[u8]) -> OpResult<()> {
    let shadowed = name_visible(g, name)? || prefix_occupied(g, name)?;
    if shadowed && !g.shadow_armed {
        return Err(E_NAME_SHADOW);
    }
    Ok(())
}

fn name_visible(g: &mut Glas, name: &[u8]) -> OpResult<bool> {
    if ns_entry(&mut g.alloc, g.roots.ns, name)?.is_some() {
        return Ok(true);
    }
    // a name under a volume or mount prefix is visible too
    for split in (0..name.len()).rev() {
        let prefix = &name[..split];
        if let Some(def) = ns_entry(&mut g.alloc, g.roots.ns, prefix)? {
            if def_lookup(&mut g.alloc, def, &DefKind::Volume)?.is_some()
                || def_lookup(&mut g.alloc, def, &DefKind::Mount)?.is_some()
            {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Whether any existing entry sits at or under `prefix`.
fn prefix_occupied(g: &mut Glas, prefix: &[u8]) -> OpResult<bool> {
    let mut hit = false;
    let _ = dict_for_each_label(&mut g.alloc, g.roots.ns, &mut |label, _| {
        if label.starts_with(prefix) {
            hit = true;
        }
        Ok(())
    })?;
    Ok(hit)
}

impl Glas {
    /// Whether `name` is defined in view of this context.
    pub fn name_defined(&mut self, name: &str) -> bool {
        let _b = self.busy();
        matches!(name_visible(self, name.as_bytes()), Ok(true))
    }

    /// Whether at least one name lives under `prefix`.
    pub fn prefix_inuse(&mut self, prefix: &str) -> bool {
        let _b = self.busy();
        if matches!(prefix_occupied(self, prefix.as_bytes()), Ok(true)) {
            return true;
        }
        // a covering volume makes the prefix populated once registers
        // exist under it
        let bytes = prefix.as_bytes();
        for split in (0..=bytes.len()).rev() {
            let p = &bytes[..split];
            let Ok(Some(def)) = ns_entry(&mut self.alloc, self.roots.ns, p) else {
                continue;
            };
            if let Ok(Some(vol)) = def_lookup(&mut self.alloc, def, &DefKind::Volume) {
                if crate::registers::volume_inuse(vol) {
                    return true;
                }
            }
        }
        false
    }

    /// Arm shadowing for the next definition. Cleared when the next name
    /// or prefix is defined.
    pub fn name_shadow(&mut self) {
        self.shadow_armed = true;
    }

    /// Define `name` as a client callback program.
    pub fn define_by_callback(&mut self, name: &str, cb: ProgCb) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            check_shadow(self, name.as_bytes())?;
            let cb_cell = progcb_cell(&mut self.alloc, cb)?;
            let captured_ns = self.roots.ns;
            let payload = mk_pair(&mut self.alloc, cb_cell, captured_ns)?;
            define(self, name.as_bytes(), DefKind::Prog, payload)
        })();
        self.finish_op(r)
    }

    /// Invoke a defined program. Consumes `ar_in` cells, produces
    /// `ar_out`; a false return is failure (arguments restored), not
    /// error.
    pub fn call(&mut self, name: &str) -> bool {
        // resolve and set up inside a busy window
        let setup: OpResult<(Value, Value)> = {
            let _b = self.busy();
            (|| {
                match resolve_name(self, name.as_bytes())? {
                    Resolution::Prog(pair) => {
                        let p = unsafe { (*pair).data.branch };
                        Ok((p.l, p.r))
                    }
                    Resolution::NotFound => Err(E_NAME_UNDEF),
                    Resolution::Register(_) => Err(E_NAME_TYPE),
                }
            })()
        };
        let (cb_cell, captured_ns) = match setup {
            Ok(x) => x,
            Err(flag) => {
                self.flag(flag);
                return false;
            }
        };
        let cb = unsafe { progcb_of(cb_cell) };
        let n_in = cb.ar_in as usize;

        // build the callback context and transfer arguments
        let latch = Arc::new(ForkLatch::default());
        let mut cbx = {
            let _b = self.busy();
            if self.data_depth < n_in {
                self.flag(E_UNDERFLOW);
                return false;
            }
            let mut cbx = Glas::with_parts(captured_ns, None, None, None);
            // yield inside a callback is unsupported; commit attempts
            // fail with E_ATOMIC_CB whether or not the def is atomic
            cbx.atomic_cb = true;
            cbx.in_callback = true;
            cbx.fork_latch = Some(latch.clone());
            // the callback's register effects belong to the caller's step
            cbx.roots.log_reads = self.roots.log_reads;
            cbx.roots.log_writes = self.roots.log_writes;
            cbx.roots.log_qreads = self.roots.log_qreads;
            cbx.roots.log_qwrites = self.roots.log_qwrites;
            if let Some(prefix) = &cb.caller_prefix {
                let r = define(&mut cbx, prefix, DefKind::Mount, self.roots.ns);
                if let Err(flag) = r {
                    self.flag(flag);
                    return false;
                }
            }
            let mut run = Vec::with_capacity(n_in);
            for _ in 0..n_in {
                run.push(self.pop_value().expect("depth checked"));
            }
            for &v in run.iter().rev() {
                if cbx.push_value(v).is_err() {
                    // restore and bail
                    for &w in run.iter().rev() {
                        let _ = self.push_value(w);
                    }
                    self.flag(crate::error::E_QUOTA);
                    return false;
                }
            }
            cbx.roots.ckpt_data = cbx.roots.data;
            cbx.ckpt.data_depth = cbx.data_depth;
            cbx
        };

        // the callback runs outside the caller's busy window so the
        // collector is never blocked on host code
        let ok = (cb.op)(&mut cbx);
        latch.join();

        let _b = self.busy();
        if !ok {
            // failure: the arguments were never consumed
            let mut run = Vec::with_capacity(n_in);
            let mut src = cbx.roots.ckpt_data;
            for _ in 0..n_in {
                let b = unsafe { (*src).data.branch };
                run.push(b.l);
                src = b.r;
            }
            for &v in run.iter().rev() {
                let _ = self.push_value(v);
            }
            return false;
        }
        // merge errors and register effects back into the caller
        self.err.set(cbx.err.get());
        self.roots.log_reads = cbx.roots.log_reads;
        self.roots.log_writes = cbx.roots.log_writes;
        self.roots.log_qreads = cbx.roots.log_qreads;
        self.roots.log_qwrites = cbx.roots.log_qwrites;
        self.postops.append(&mut cbx.postops);
        if cbx.data_depth != cb.ar_out as usize {
            self.flag(E_NAME_TYPE);
            return false;
        }
        // move results onto the caller's stack, preserving order
        let mut run = Vec::with_capacity(cbx.data_depth);
        while cbx.data_depth > 0 {
            run.push(cbx.pop_value().expect("depth known"));
        }
        for &v in run.iter().rev() {
            if self.push_value(v).is_err() {
                self.flag(crate::error::E_QUOTA);
                return false;
            }
        }
        true
    }
}
