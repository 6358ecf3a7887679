//! Value construction and structural views over cells.
//!
//! A value is a finite binary tree: the null pointer is the unit leaf,
//! stem bits are unary paths (0 = left, 1 = right), and a pair is a node
//! with both children. Lists are right spines of pairs ending in unit;
//! binaries are lists of bytes. The cell variants are representation
//! choices over this one algebra, so every view here normalizes across
//! SMALL_BIN / BIG_BIN / SMALL_ARR / BIG_ARR / TAKE_CONCAT as needed.
//!
//! Constructors compute the monoidal aggregate join of their children and
//! publish fresh cells to the collector (relevant during concurrent mark).

use crate::bits::{BitStr, int_to_bits, stem_len};
use crate::error::{E_DATA_SEAL, E_DATA_TYPE, E_QUOTA, OpResult};
use glas_core::alloc::AllocCursor;
use glas_core::cell::{
    AGGR_ABSTRACT, AGGR_EPH_RUNTIME, AGGR_LINEAR, Cell, ReleaseFn, TYPE_BIG_ARR, TYPE_BIG_BIN,
    TYPE_BRANCH, TYPE_FOREIGN_PTR, TYPE_REGISTER, TYPE_SEAL, TYPE_SMALL_ARR, TYPE_SMALL_BIN,
    TYPE_STEM, TYPE_TAKE_CONCAT, TYPE_THUNK, TYPE_TOMBSTONE, aggr_of,
};
use glas_core::page::{CARD_FINALIZER, Page};
use glas_core::{gc, rt::rt};

/// A glas value: a possibly-null cell pointer. Null is unit.
pub type Value = *mut Cell;

/// Binaries at or below this length must use inline small form.
pub const SMALL_BIN_MAX: usize = 24;
/// Lists at or below this length may use the small array form.
pub const SMALL_ARR_MAX: usize = 3;

/// Allocate one zeroed cell. Exhaustion surfaces as E_QUOTA; the caller
/// cannot usefully distinguish it from any other kill.
pub(crate) fn new_cell(alloc: &mut AllocCursor) -> OpResult<*mut Cell> {
    let cell = alloc.alloc();
    if cell.is_null() {
        tracing::error!("cell allocation failed: address space exhausted");
        return Err(E_QUOTA);
    }
    Ok(cell)
}

/// Flag a cell for the weak/finalizer card pass.
fn note_finalizer(cell: *mut Cell) {
    let page = unsafe { &*Page::from_interior(cell.cast::<u8>()) };
    page.set_card(CARD_FINALIZER, cell as usize);
}

/// Whether a value's cell may be flat-copied: purely structural forms.
/// Identity-bearing and resource-bearing cells (registers, foreigns,
/// seals, tombstones, thunks) must be referenced, never cloned.
pub(crate) fn is_plain(v: Value) -> bool {
    if v.is_null() {
        return true;
    }
    matches!(
        unsafe { (*v).hdr.type_id },
        TYPE_STEM
            | TYPE_BRANCH
            | TYPE_SMALL_BIN
            | TYPE_SMALL_ARR
            | TYPE_BIG_BIN
            | TYPE_BIG_ARR
            | TYPE_TAKE_CONCAT
    )
}

/// Copy a plain structural cell, overriding its stem word. Shares all
/// payload structure.
pub(crate) fn clone_with_stem(
    alloc: &mut AllocCursor,
    src: *mut Cell,
    stem_h: u32,
) -> OpResult<Value> {
    debug_assert!(is_plain(src), "identity cells are never cloned");
    let cell = new_cell(alloc)?;
    unsafe {
        std::ptr::copy_nonoverlapping(src.cast::<u8>(), cell.cast::<u8>(), glas_core::CELL_SIZE);
        (*cell).hdr.gcbits.store(0, std::sync::atomic::Ordering::Relaxed);
        (*cell).stem_h = stem_h;
    }
    gc::publish_cell(cell);
    Ok(cell)
}

/// A pair with explicit side stem words: `(stem_l ++ l, stem_r ++ r)`.
pub fn mk_branch(
    alloc: &mut AllocCursor,
    stem_l: u32,
    l: Value,
    stem_r: u32,
    r: Value,
) -> OpResult<Value> {
    let cell = new_cell(alloc)?;
    unsafe {
        (*cell).hdr.type_id = TYPE_BRANCH;
        (*cell).hdr.type_aggr = aggr_of(l) | aggr_of(r);
        (*cell).data.branch.stem_l = stem_l;
        (*cell).data.branch.stem_r = stem_r;
        (*cell).data.branch.l = l;
        (*cell).data.branch.r = r;
    }
    gc::publish_cell(cell);
    Ok(cell)
}

/// A pair `(a, b)`.
pub fn mk_pair(alloc: &mut AllocCursor, a: Value, b: Value) -> OpResult<Value> {
    mk_branch(alloc, 0, a, 0, b)
}

/// `bits ++ tail`. The workhorse behind mkl/mkr, integer push, and dict
/// label paths: merges into the tail's stem word when everything fits,
/// otherwise builds a STEM chain.
pub fn make_bits_then(alloc: &mut AllocCursor, bits: &BitStr, tail: Value) -> OpResult<Value> {
    if bits.is_empty() {
        return Ok(tail);
    }
    // fast path: merge into a copy of the tail cell's stem word
    if !tail.is_null() && is_plain(tail) {
        let tail_stem = unsafe { (*tail).stem_h };
        let total = bits.len() + stem_len(tail_stem) as usize;
        if total <= 31 {
            let mut merged = bits.clone();
            merged.push_stem_word(tail_stem);
            let word = merged.stem_word_at(0, merged.len());
            return clone_with_stem(alloc, tail, word);
        }
    }
    // chain: a leading partial stem word, then full words in STEM cells
    let head_len = bits.len() % 32;
    let full_words = (bits.len() - head_len) / 32;
    let mut d = tail;
    let mut w = full_words;
    while w > 0 {
        let take = ((w - 1) % 4) + 1;
        w -= take;
        let cell = new_cell(alloc)?;
        unsafe {
            (*cell).hdr.type_id = TYPE_STEM;
            (*cell).hdr.type_arg = take as u8;
            (*cell).hdr.type_aggr = aggr_of(d);
            for i in 0..take {
                (*cell).data.stem.bits[i] = bits.full_word_at(head_len + (w + i) * 32);
            }
            (*cell).data.stem.d = d;
        }
        gc::publish_cell(cell);
        d = cell;
    }
    if head_len == 0 {
        // bits were a whole number of words, all carried by STEM cells
        return Ok(d);
    }
    let word = bits.stem_word_at(0, head_len);
    if d == tail {
        // no full words; need a carrier cell for the partial word
        let cell = new_cell(alloc)?;
        unsafe {
            (*cell).hdr.type_id = TYPE_STEM;
            (*cell).hdr.type_arg = 0;
            (*cell).hdr.type_aggr = aggr_of(d);
            (*cell).stem_h = word;
            (*cell).data.stem.d = d;
        }
        gc::publish_cell(cell);
        Ok(cell)
    } else {
        // the first STEM cell of the chain can carry it
        unsafe { (*d).stem_h = word };
        Ok(d)
    }
}

/// `word ++ tail` for a branch-side stem word.
pub fn stem_word_then(alloc: &mut AllocCursor, word: u32, tail: Value) -> OpResult<Value> {
    if word == 0 {
        return Ok(tail);
    }
    let mut bits = BitStr::new();
    bits.push_stem_word(word);
    make_bits_then(alloc, &bits, tail)
}

/// A short binary (0..=24 bytes); empty is unit.
pub fn mk_small_bin(alloc: &mut AllocCursor, bytes: &[u8]) -> OpResult<Value> {
    debug_assert!(bytes.len() <= SMALL_BIN_MAX);
    if bytes.is_empty() {
        return Ok(std::ptr::null_mut());
    }
    let cell = new_cell(alloc)?;
    unsafe {
        (*cell).hdr.type_id = TYPE_SMALL_BIN;
        (*cell).hdr.type_arg = bytes.len() as u8;
        (&mut (*cell).data.small_bin)[..bytes.len()].copy_from_slice(bytes);
    }
    Ok(cell)
}

/// A short list of 1..=3 cells.
pub fn mk_small_arr(alloc: &mut AllocCursor, elems: &[Value]) -> OpResult<Value> {
    debug_assert!((1..=SMALL_ARR_MAX).contains(&elems.len()));
    let cell = new_cell(alloc)?;
    unsafe {
        (*cell).hdr.type_id = TYPE_SMALL_ARR;
        (*cell).hdr.type_arg = elems.len() as u8;
        let mut aggr = 0;
        for (i, &e) in elems.iter().enumerate() {
            (*cell).data.small_arr[i] = e;
            aggr |= aggr_of(e);
        }
        (*cell).hdr.type_aggr = aggr;
    }
    gc::publish_cell(cell);
    Ok(cell)
}

/// A flat binary slice; `len` must exceed the small-binary bound.
pub(crate) fn mk_big_bin_slice(
    alloc: &mut AllocCursor,
    data: *const u8,
    len: usize,
    origin: Value,
) -> OpResult<Value> {
    debug_assert!(len > SMALL_BIN_MAX);
    let cell = new_cell(alloc)?;
    unsafe {
        (*cell).hdr.type_id = TYPE_BIG_BIN;
        (*cell).data.big_bin.data = data;
        (*cell).data.big_bin.len = len;
        (*cell).data.big_bin.origin = origin;
    }
    gc::publish_cell(cell);
    Ok(cell)
}

/// A flat cell-array slice; `len` must exceed the small-array bound.
pub(crate) fn mk_big_arr_slice(
    alloc: &mut AllocCursor,
    data: *const *mut Cell,
    len: usize,
    origin: Value,
    aggr: u8,
) -> OpResult<Value> {
    debug_assert!(len > SMALL_ARR_MAX);
    let cell = new_cell(alloc)?;
    unsafe {
        (*cell).hdr.type_id = TYPE_BIG_ARR;
        (*cell).hdr.type_aggr = aggr;
        (*cell).data.big_arr.data = data;
        (*cell).data.big_arr.len = len;
        (*cell).data.big_arr.origin = origin;
    }
    gc::publish_cell(cell);
    Ok(cell)
}

/// A host resource cell. Abstract and runtime-scoped; `extra_aggr` may add
/// linearity. The release callback runs exactly once, from the collector,
/// after the cell dies.
pub fn mk_foreign(
    alloc: &mut AllocCursor,
    ptr: *mut u8,
    release: Option<ReleaseFn>,
    arg: *mut u8,
    extra_aggr: u8,
) -> OpResult<Value> {
    let cell = new_cell(alloc)?;
    unsafe {
        (*cell).hdr.type_id = TYPE_FOREIGN_PTR;
        (*cell).hdr.type_aggr = AGGR_ABSTRACT | AGGR_EPH_RUNTIME | extra_aggr;
        (*cell).data.foreign.ptr = ptr;
        (*cell).data.foreign.release = release;
        (*cell).data.foreign.arg = arg;
    }
    if release.is_some() {
        note_finalizer(cell);
    }
    Ok(cell)
}

unsafe fn release_box_vec_u8(arg: *mut u8) {
    drop(unsafe { Box::from_raw(arg.cast::<Vec<u8>>()) });
}

unsafe fn release_box_vec_cell(arg: *mut u8) {
    drop(unsafe { Box::from_raw(arg.cast::<Vec<*mut Cell>>()) });
}

/// A binary owning its buffer: small inline form when short, otherwise a
/// BIG_BIN whose origin is a foreign cell that frees the buffer.
pub fn mk_bin_owned(alloc: &mut AllocCursor, bytes: Vec<u8>) -> OpResult<Value> {
    if bytes.len() <= SMALL_BIN_MAX {
        return mk_small_bin(alloc, &bytes);
    }
    let boxed = Box::new(bytes);
    let data = boxed.as_ptr();
    let len = boxed.len();
    let arg = Box::into_raw(boxed).cast::<u8>();
    let origin = mk_foreign(alloc, data.cast_mut(), Some(release_box_vec_u8), arg, 0)?;
    mk_big_bin_slice(alloc, data, len, origin)
}

/// A list owning a flat cell array; small form when short.
pub fn mk_arr_owned(alloc: &mut AllocCursor, elems: Vec<Value>) -> OpResult<Value> {
    if elems.is_empty() {
        return Ok(std::ptr::null_mut());
    }
    if elems.len() <= SMALL_ARR_MAX {
        return mk_small_arr(alloc, &elems);
    }
    let aggr = elems.iter().fold(0, |a, &e| a | aggr_of(e));
    let boxed = Box::new(elems);
    let data = boxed.as_ptr();
    let len = boxed.len();
    let arg = Box::into_raw(boxed).cast::<u8>();
    let origin = mk_foreign(alloc, data.cast_mut().cast(), Some(release_box_vec_cell), arg, 0)?;
    mk_big_arr_slice(alloc, data, len, origin, aggr)
}

/// Rope node: `left ++ right` with `left_len` elements on the left.
pub fn mk_take_concat(
    alloc: &mut AllocCursor,
    left_len: u64,
    left: Value,
    right: Value,
) -> OpResult<Value> {
    let cell = new_cell(alloc)?;
    unsafe {
        (*cell).hdr.type_id = TYPE_TAKE_CONCAT;
        (*cell).hdr.type_aggr = aggr_of(left) | aggr_of(right);
        (*cell).data.take_concat.left_len = left_len;
        (*cell).data.take_concat.left = left;
        (*cell).data.take_concat.right = right;
    }
    gc::publish_cell(cell);
    Ok(cell)
}

/// A fresh register holding `content`.
pub fn mk_register(alloc: &mut AllocCursor, content: Value) -> OpResult<Value> {
    let cell = new_cell(alloc)?;
    unsafe {
        (*cell).hdr.type_id = TYPE_REGISTER;
        (*cell).hdr.type_aggr = AGGR_ABSTRACT | AGGR_EPH_RUNTIME;
        (*cell).data.reg.content = content;
        (*cell).data.reg.tombstone = std::ptr::null_mut();
        (*cell).data.reg.assoc_lhs = std::ptr::null_mut();
    }
    gc::publish_cell(cell);
    Ok(cell)
}

/// A tombstone for `target` with a fresh stable id.
pub fn mk_tombstone(alloc: &mut AllocCursor, target: Value) -> OpResult<Value> {
    let cell = new_cell(alloc)?;
    unsafe {
        (*cell).hdr.type_id = TYPE_TOMBSTONE;
        (*cell).data.tombstone.target = target;
        (*cell).data.tombstone.id = rt().genid();
        (*cell).data.tombstone.meta = std::ptr::null_mut();
    }
    note_finalizer(cell);
    gc::publish_cell(cell);
    Ok(cell)
}

/// Seal `data` under the register `key`. The key reference is weak: once
/// the key register dies the sealed payload is collectable.
pub fn mk_seal(alloc: &mut AllocCursor, key: Value, data: Value, linear: bool) -> OpResult<Value> {
    let cell = new_cell(alloc)?;
    unsafe {
        (*cell).hdr.type_id = TYPE_SEAL;
        (*cell).hdr.type_aggr =
            AGGR_ABSTRACT | AGGR_EPH_RUNTIME | aggr_of(data) | if linear { AGGR_LINEAR } else { 0 };
        (*cell).data.seal.key = key;
        (*cell).data.seal.data = data;
        (*cell).data.seal.meta = std::ptr::null_mut();
    }
    note_finalizer(cell);
    gc::publish_cell(cell);
    Ok(cell)
}

/// A thunk over `computation` (itself a value, typically a foreign cell).
pub fn mk_thunk(alloc: &mut AllocCursor, computation: Value) -> OpResult<Value> {
    let cell = new_cell(alloc)?;
    unsafe {
        (*cell).hdr.type_id = TYPE_THUNK;
        (*cell).hdr.type_aggr = aggr_of(computation);
        (*cell).data.thunk.computation = computation;
        (*cell).data.thunk.result = std::ptr::null_mut();
        (*cell).data.thunk.signal = std::ptr::null_mut();
    }
    gc::publish_cell(cell);
    Ok(cell)
}

/// A byte as an integer value (bitstring form).
pub fn byte_cell(alloc: &mut AllocCursor, byte: u8) -> OpResult<Value> {
    make_bits_then(alloc, &int_to_bits(byte as i128), std::ptr::null_mut())
}

// ---------------------------------------------------------------------
// Structural views
// ---------------------------------------------------------------------

/// First bit of the value's leading bit run, if any. Pairs, lists, unit,
/// and opaque values have none.
pub fn first_bit(v: Value) -> Option<bool> {
    let mut v = v;
    loop {
        if v.is_null() {
            return None;
        }
        let c = unsafe { &*v };
        if stem_len(c.stem_h) > 0 {
            return Some(crate::bits::stem_bit(c.stem_h, 0));
        }
        if c.hdr.type_id == TYPE_STEM {
            if c.hdr.type_arg > 0 {
                return Some(unsafe { c.data.stem.bits[0] } & (1 << 31) != 0);
            }
            v = unsafe { c.data.stem.d };
            continue;
        }
        return None;
    }
}

/// Collect the whole leading bit run and the cell whose payload follows it
/// (null when the run ends at unit). The returned cell's own stem word is
/// already included in `out`.
pub fn leading_bits(v: Value, out: &mut BitStr) -> Value {
    let mut v = v;
    loop {
        if v.is_null() {
            return std::ptr::null_mut();
        }
        let c = unsafe { &*v };
        out.push_stem_word(c.stem_h);
        if c.hdr.type_id == TYPE_STEM {
            for i in 0..c.hdr.type_arg as usize {
                out.push_full_word(unsafe { c.data.stem.bits[i] });
            }
            v = unsafe { c.data.stem.d };
            continue;
        }
        return v;
    }
}

/// Number of bits in the leading run.
pub fn leading_len(v: Value) -> u64 {
    let mut v = v;
    let mut n = 0u64;
    loop {
        if v.is_null() {
            return n;
        }
        let c = unsafe { &*v };
        n += stem_len(c.stem_h) as u64;
        if c.hdr.type_id == TYPE_STEM {
            n += 32 * c.hdr.type_arg as u64;
            v = unsafe { c.data.stem.d };
            continue;
        }
        return n;
    }
}

/// The value after its first `k` leading bits. `k` must not exceed the
/// leading run length.
pub fn strip_bits(alloc: &mut AllocCursor, v: Value, k: u64) -> OpResult<Value> {
    let mut v = v;
    let mut k = k;
    loop {
        if k == 0 {
            return Ok(v);
        }
        debug_assert!(!v.is_null(), "strip past end of leading run");
        let c = unsafe { &*v };
        let sh = stem_len(c.stem_h) as u64;
        if k < sh {
            // shifting a stem word left drops leading bits, marker included
            return clone_with_stem(alloc, v, c.stem_h << k);
        }
        k -= sh;
        if c.hdr.type_id == TYPE_STEM {
            let total = 32 * c.hdr.type_arg as u64;
            if k > 0 && k < total {
                let mut rem = BitStr::new();
                for i in 0..c.hdr.type_arg as usize {
                    rem.push_full_word(unsafe { c.data.stem.bits[i] });
                }
                let rem = rem.slice(k as usize, total as usize);
                return make_bits_then(alloc, &rem, unsafe { c.data.stem.d });
            }
            k -= k.min(total);
            v = unsafe { c.data.stem.d };
            continue;
        }
        debug_assert_eq!(k, 0, "strip past end of leading run");
        return clone_with_stem(alloc, v, 0);
    }
}

/// Shallow pair check: no leading bits and a pair-shaped payload.
pub fn is_pair(v: Value) -> bool {
    if v.is_null() || first_bit(v).is_some() {
        return false;
    }
    let c = unsafe { &*v };
    match c.hdr.type_id {
        TYPE_BRANCH | TYPE_SMALL_BIN | TYPE_SMALL_ARR | TYPE_BIG_BIN | TYPE_BIG_ARR => true,
        TYPE_TAKE_CONCAT => true,
        _ => false,
    }
}

/// Destructure a pair into `(first, rest)`, normalizing across list
/// representations. `Ok(None)` means the value is not a pair; sealed and
/// abstract values error.
pub fn as_pair(alloc: &mut AllocCursor, v: Value) -> OpResult<Option<(Value, Value)>> {
    if v.is_null() || first_bit(v).is_some() {
        return Ok(None);
    }
    let c = unsafe { &*v };
    match c.hdr.type_id {
        TYPE_BRANCH => unsafe {
            let b = c.data.branch;
            let a = stem_word_then(alloc, b.stem_l, b.l)?;
            let d = stem_word_then(alloc, b.stem_r, b.r)?;
            Ok(Some((a, d)))
        },
        TYPE_SMALL_BIN => unsafe {
            let n = c.hdr.type_arg as usize;
            let bytes = &c.data.small_bin[..n];
            let a = byte_cell(alloc, bytes[0])?;
            let rest = mk_small_bin(alloc, &bytes[1..])?;
            Ok(Some((a, rest)))
        },
        TYPE_SMALL_ARR => unsafe {
            let n = c.hdr.type_arg as usize;
            let a = c.data.small_arr[0];
            let rest = if n == 1 {
                std::ptr::null_mut()
            } else {
                let elems: Vec<Value> = (1..n).map(|i| unsafe { c.data.small_arr[i] }).collect();
                mk_small_arr(alloc, &elems)?
            };
            Ok(Some((a, rest)))
        },
        TYPE_BIG_BIN => unsafe {
            let b = c.data.big_bin;
            let a = byte_cell(alloc, *b.data)?;
            let rest = bin_slice(alloc, b.data.add(1), b.len - 1, b.origin)?;
            Ok(Some((a, rest)))
        },
        TYPE_BIG_ARR => unsafe {
            let b = c.data.big_arr;
            let a = *b.data;
            let rest = arr_slice(alloc, b.data.add(1), b.len - 1, b.origin, c.hdr.type_aggr)?;
            Ok(Some((a, rest)))
        },
        TYPE_TAKE_CONCAT => unsafe {
            let t = c.data.take_concat;
            if t.left_len == 0 {
                return as_pair(alloc, t.right);
            }
            match as_pair(alloc, t.left)? {
                None => Err(E_DATA_TYPE),
                Some((a, lrest)) => {
                    let rest = if t.left_len == 1 {
                        t.right
                    } else {
                        mk_take_concat(alloc, t.left_len - 1, lrest, t.right)?
                    };
                    Ok(Some((a, rest)))
                }
            }
        },
        TYPE_SEAL => Err(E_DATA_SEAL),
        TYPE_FOREIGN_PTR | TYPE_REGISTER | TYPE_TOMBSTONE | TYPE_THUNK => Err(E_DATA_TYPE),
        _ => Ok(None),
    }
}

/// Binary slice respecting the small-form invariant.
pub(crate) fn bin_slice(
    alloc: &mut AllocCursor,
    data: *const u8,
    len: usize,
    origin: Value,
) -> OpResult<Value> {
    if len <= SMALL_BIN_MAX {
        let bytes = unsafe { std::slice::from_raw_parts(data, len) };
        mk_small_bin(alloc, bytes)
    } else {
        mk_big_bin_slice(alloc, data, len, origin)
    }
}

/// Array slice respecting the small-form invariant.
pub(crate) fn arr_slice(
    alloc: &mut AllocCursor,
    data: *const *mut Cell,
    len: usize,
    origin: Value,
    aggr: u8,
) -> OpResult<Value> {
    if len == 0 {
        return Ok(std::ptr::null_mut());
    }
    if len <= SMALL_ARR_MAX {
        let elems: Vec<Value> = (0..len).map(|i| unsafe { *data.add(i) }).collect();
        mk_small_arr(alloc, &elems)
    } else {
        mk_big_arr_slice(alloc, data, len, origin, aggr)
    }
}

/// Whether the value is a bitstring: a leading run ending at unit.
pub fn is_bitstr(v: Value) -> bool {
    let mut run = BitStr::new();
    leading_bits(v, &mut run).is_null()
}

/// Decode a value as an integer in `0..=255`.
pub fn cell_to_byte(v: Value) -> Option<u8> {
    let mut run = BitStr::new();
    let body = leading_bits(v, &mut run);
    if !body.is_null() || run.len() > 8 {
        return None;
    }
    let n = crate::bits::bits_to_int(&run)?;
    u8::try_from(n).ok()
}

/// Decode a value as an i64 integer (variable-width bitstring form).
pub fn int_of_value(v: Value) -> Option<i64> {
    let mut run = BitStr::new();
    let body = leading_bits(v, &mut run);
    if !body.is_null() {
        return None;
    }
    crate::bits::bits_to_int(&run).and_then(|n| i64::try_from(n).ok())
}

/// Decode a branch side (stem word + cell) as a byte without
/// materializing the side value.
pub fn side_to_byte(stem_word: u32, cell: Value) -> Option<u8> {
    let mut run = BitStr::new();
    run.push_stem_word(stem_word);
    let body = leading_bits(cell, &mut run);
    if !body.is_null() || run.len() > 8 {
        return None;
    }
    let n = crate::bits::bits_to_int(&run)?;
    u8::try_from(n).ok()
}

/// Opaque values refuse structural inspection; classify the refusal.
pub fn opaque_error(v: Value) -> Option<u32> {
    if v.is_null() {
        return None;
    }
    match unsafe { (*v).hdr.type_id } {
        TYPE_SEAL => Some(E_DATA_SEAL),
        TYPE_FOREIGN_PTR | TYPE_REGISTER | TYPE_TOMBSTONE | TYPE_THUNK => Some(E_DATA_TYPE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::bits_to_int;
    use crate::testutil::with_ctx;
    use serial_test::serial;

    #[test]
    #[serial]
    fn bits_round_trip_through_cells() {
        with_ctx(|g| {
            let _b = g.busy();
            // 5 bits: fits a stem word
            let mut short = BitStr::new();
            for bit in [true, false, true, true, false] {
                short.push(bit);
            }
            let v = make_bits_then(&mut g.alloc, &short, std::ptr::null_mut()).unwrap();
            let mut out = BitStr::new();
            assert!(leading_bits(v, &mut out).is_null());
            assert_eq!(out, short);

            // 200 bits: needs a STEM chain
            let mut long = BitStr::new();
            for i in 0..200 {
                long.push(i % 3 == 0);
            }
            let v = make_bits_then(&mut g.alloc, &long, std::ptr::null_mut()).unwrap();
            assert_eq!(leading_len(v), 200);
            let mut out = BitStr::new();
            assert!(leading_bits(v, &mut out).is_null());
            assert_eq!(out, long);
        });
    }

    #[test]
    #[serial]
    fn strip_bits_peels_the_run() {
        with_ctx(|g| {
            let _b = g.busy();
            let mut bits = BitStr::new();
            for i in 0..70 {
                bits.push(i % 2 == 0);
            }
            let v = make_bits_then(&mut g.alloc, &bits, std::ptr::null_mut()).unwrap();
            let stripped = strip_bits(&mut g.alloc, v, 3).unwrap();
            let mut out = BitStr::new();
            assert!(leading_bits(stripped, &mut out).is_null());
            assert_eq!(out, bits.slice(3, 70));
        });
    }

    #[test]
    #[serial]
    fn byte_cells_decode() {
        with_ctx(|g| {
            let _b = g.busy();
            for byte in [0u8, 1, 2, 127, 128, 255] {
                let v = byte_cell(&mut g.alloc, byte).unwrap();
                assert_eq!(cell_to_byte(v), Some(byte), "byte {byte}");
            }
            // 256 is out of byte range
            let v = make_bits_then(&mut g.alloc, &int_to_bits(256), std::ptr::null_mut()).unwrap();
            assert_eq!(cell_to_byte(v), None);
        });
    }

    #[test]
    #[serial]
    fn small_bin_destructures_as_pairs() {
        with_ctx(|g| {
            let _b = g.busy();
            let v = mk_small_bin(&mut g.alloc, &[7, 8, 9]).unwrap();
            let (a, rest) = as_pair(&mut g.alloc, v).unwrap().expect("pair");
            assert_eq!(cell_to_byte(a), Some(7));
            let (b, rest) = as_pair(&mut g.alloc, rest).unwrap().expect("pair");
            assert_eq!(cell_to_byte(b), Some(8));
            let (c, rest) = as_pair(&mut g.alloc, rest).unwrap().expect("pair");
            assert_eq!(cell_to_byte(c), Some(9));
            assert!(rest.is_null());
        });
    }

    #[test]
    #[serial]
    fn pairs_are_not_bitstrings() {
        with_ctx(|g| {
            let _b = g.busy();
            let p = mk_pair(&mut g.alloc, std::ptr::null_mut(), std::ptr::null_mut()).unwrap();
            assert!(is_pair(p));
            assert!(!is_bitstr(p));
            assert_eq!(first_bit(p), None);
            // 0b0.() is inl, not a pair
            let mut bit = BitStr::new();
            bit.push(false);
            let l = make_bits_then(&mut g.alloc, &bit, std::ptr::null_mut()).unwrap();
            assert!(!is_pair(l));
            assert_eq!(first_bit(l), Some(false));
            assert_eq!(bits_to_int(&bit), Some(-1));
        });
    }
}
