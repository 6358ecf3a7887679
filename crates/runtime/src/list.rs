//! List operations: length, split, append, byte streaming.
//!
//! Lists are right spines of pairs ending in unit, but the representation
//! is free to use inline binaries, flat slices, and TAKE_CONCAT rope
//! nodes. Split and append against the flat and rope forms are O(log n);
//! append of two aligned slices of one origin collapses back into a
//! single slice.

use crate::error::{E_DATA_TYPE, OpResult};
use crate::value::{
    SMALL_ARR_MAX, SMALL_BIN_MAX, Value, arr_slice, as_pair, bin_slice, cell_to_byte, first_bit,
    mk_arr_owned, mk_small_arr, mk_small_bin, mk_take_concat, opaque_error, side_to_byte,
};
use glas_core::alloc::AllocCursor;
use glas_core::cell::{
    TYPE_BIG_ARR, TYPE_BIG_BIN, TYPE_BRANCH, TYPE_SMALL_ARR, TYPE_SMALL_BIN, TYPE_TAKE_CONCAT,
};

/// Length of a list, or None when the value is not a list.
pub fn list_len(v: Value) -> Option<u64> {
    let mut v = v;
    let mut n = 0u64;
    loop {
        if v.is_null() {
            return Some(n);
        }
        if first_bit(v).is_some() {
            return None;
        }
        let c = unsafe { &*v };
        match c.hdr.type_id {
            TYPE_SMALL_BIN | TYPE_SMALL_ARR => return Some(n + c.hdr.type_arg as u64),
            TYPE_BIG_BIN => return Some(n + unsafe { c.data.big_bin.len } as u64),
            TYPE_BIG_ARR => return Some(n + unsafe { c.data.big_arr.len } as u64),
            TYPE_TAKE_CONCAT => {
                n += unsafe { c.data.take_concat.left_len };
                v = unsafe { c.data.take_concat.right };
            }
            TYPE_BRANCH => {
                let b = unsafe { c.data.branch };
                if b.stem_r != 0 {
                    return None;
                }
                n += 1;
                v = b.r;
            }
            _ => return None,
        }
    }
}

/// Shallow list check: the value could be a list at its top node. Deep
/// tails are validated lazily by the operations that walk them.
pub fn is_list_shallow(v: Value) -> bool {
    if v.is_null() {
        return true;
    }
    if first_bit(v).is_some() {
        return false;
    }
    matches!(
        unsafe { (*v).hdr.type_id },
        TYPE_SMALL_BIN | TYPE_SMALL_ARR | TYPE_BIG_BIN | TYPE_BIG_ARR | TYPE_TAKE_CONCAT
            | TYPE_BRANCH
    )
}

/// Full list check: a right spine of pairs ending in unit.
pub fn is_list(v: Value) -> bool {
    let mut v = v;
    loop {
        if v.is_null() {
            return true;
        }
        if first_bit(v).is_some() {
            return false;
        }
        let c = unsafe { &*v };
        match c.hdr.type_id {
            TYPE_SMALL_BIN | TYPE_SMALL_ARR | TYPE_BIG_BIN | TYPE_BIG_ARR => return true,
            TYPE_TAKE_CONCAT => {
                if !is_list(unsafe { c.data.take_concat.left }) {
                    return false;
                }
                v = unsafe { c.data.take_concat.right };
            }
            TYPE_BRANCH => {
                let b = unsafe { c.data.branch };
                if b.stem_r != 0 {
                    return false;
                }
                v = b.r;
            }
            _ => return false,
        }
    }
}

/// Whether every element is an integer in 0..=255.
pub fn is_binary(v: Value) -> bool {
    let mut v = v;
    loop {
        if v.is_null() {
            return true;
        }
        if first_bit(v).is_some() {
            return false;
        }
        let c = unsafe { &*v };
        match c.hdr.type_id {
            TYPE_SMALL_BIN | TYPE_BIG_BIN => return true,
            TYPE_SMALL_ARR => {
                let n = c.hdr.type_arg as usize;
                return (0..n).all(|i| cell_to_byte(unsafe { c.data.small_arr[i] }).is_some());
            }
            TYPE_BIG_ARR => {
                let b = unsafe { c.data.big_arr };
                return (0..b.len).all(|i| cell_to_byte(unsafe { *b.data.add(i) }).is_some());
            }
            TYPE_TAKE_CONCAT => {
                if !is_binary(unsafe { c.data.take_concat.left }) {
                    return false;
                }
                v = unsafe { c.data.take_concat.right };
            }
            TYPE_BRANCH => {
                let b = unsafe { c.data.branch };
                if b.stem_r != 0 || side_to_byte(b.stem_l, b.l).is_none() {
                    return false;
                }
                v = b.r;
            }
            _ => return false,
        }
    }
}

/// Build a canonical list from collected parts: a binary when every
/// element is a byte, the small array form when short, a flat array
/// otherwise.
pub fn build_list(alloc: &mut AllocCursor, elems: &[Value]) -> OpResult<Value> {
    if elems.is_empty() {
        return Ok(std::ptr::null_mut());
    }
    let bytes: Option<Vec<u8>> = elems.iter().map(|&e| cell_to_byte(e)).collect();
    if let Some(bytes) = bytes {
        if bytes.len() <= SMALL_BIN_MAX {
            return mk_small_bin(alloc, &bytes);
        }
        return crate::value::mk_bin_owned(alloc, bytes);
    }
    if elems.len() <= SMALL_ARR_MAX {
        return mk_small_arr(alloc, elems);
    }
    mk_arr_owned(alloc, elems.to_vec())
}

/// Split a list after its first `n` elements. Fails with E_DATA_TYPE when
/// the value is not a list or is shorter than `n`.
pub fn list_split(alloc: &mut AllocCursor, v: Value, n: u64) -> OpResult<(Value, Value)> {
    if n == 0 {
        return Ok((std::ptr::null_mut(), v));
    }
    // collect loose cons elements until a structured node can be split
    let mut prefix: Vec<Value> = Vec::new();
    let mut rest = v;
    let mut remaining = n;
    loop {
        if remaining == 0 {
            let left = build_list(alloc, &prefix)?;
            return Ok((left, rest));
        }
        if rest.is_null() || first_bit(rest).is_some() {
            return Err(E_DATA_TYPE);
        }
        let c = unsafe { &*rest };
        match c.hdr.type_id {
            TYPE_BRANCH => {
                let Some((a, b)) = as_pair(alloc, rest)? else {
                    return Err(E_DATA_TYPE);
                };
                prefix.push(a);
                rest = b;
                remaining -= 1;
            }
            _ => {
                let (l, r) = split_structured(alloc, rest, remaining)?;
                if prefix.is_empty() {
                    return Ok((l, r));
                }
                let head = build_list(alloc, &prefix)?;
                let left = list_append(alloc, head, l)?;
                return Ok((left, r));
            }
        }
    }
}

/// Split a flat or rope node after `n` elements.
fn split_structured(alloc: &mut AllocCursor, v: Value, n: u64) -> OpResult<(Value, Value)> {
    let c = unsafe { &*v };
    match c.hdr.type_id {
        TYPE_SMALL_BIN => {
            let len = c.hdr.type_arg as u64;
            if n > len {
                return Err(E_DATA_TYPE);
            }
            let bytes = unsafe { &c.data.small_bin[..len as usize] };
            let l = mk_small_bin(alloc, &bytes[..n as usize])?;
            let r = mk_small_bin(alloc, &bytes[n as usize..])?;
            Ok((l, r))
        }
        TYPE_SMALL_ARR => {
            let len = c.hdr.type_arg as u64;
            if n > len {
                return Err(E_DATA_TYPE);
            }
            let elems: Vec<Value> =
                (0..len as usize).map(|i| unsafe { c.data.small_arr[i] }).collect();
            let l = build_list(alloc, &elems[..n as usize])?;
            let r = build_list(alloc, &elems[n as usize..])?;
            Ok((l, r))
        }
        TYPE_BIG_BIN => {
            let b = unsafe { c.data.big_bin };
            if n > b.len as u64 {
                return Err(E_DATA_TYPE);
            }
            let n = n as usize;
            let l = bin_slice(alloc, b.data, n, b.origin)?;
            let r = bin_slice(alloc, unsafe { b.data.add(n) }, b.len - n, b.origin)?;
            Ok((l, r))
        }
        TYPE_BIG_ARR => {
            let b = unsafe { c.data.big_arr };
            if n > b.len as u64 {
                return Err(E_DATA_TYPE);
            }
            let n = n as usize;
            let l = arr_slice(alloc, b.data, n, b.origin, c.hdr.type_aggr)?;
            let r = arr_slice(alloc, unsafe { b.data.add(n) }, b.len - n, b.origin, c.hdr.type_aggr)?;
            Ok((l, r))
        }
        TYPE_TAKE_CONCAT => {
            let t = unsafe { c.data.take_concat };
            if n < t.left_len {
                let (a, b) = list_split(alloc, t.left, n)?;
                let r = mk_take_concat(alloc, t.left_len - n, b, t.right)?;
                Ok((a, r))
            } else if n == t.left_len {
                Ok((t.left, t.right))
            } else {
                let (a, b) = list_split(alloc, t.right, n - t.left_len)?;
                let l = mk_take_concat(alloc, t.left_len, t.left, a)?;
                Ok((l, b))
            }
        }
        _ => Err(opaque_error(v).unwrap_or(E_DATA_TYPE)),
    }
}

/// Append two lists. Adjacent slices of one origin rejoin into a single
/// slice; short pieces merge into inline forms; anything else becomes a
/// rope node.
pub fn list_append(alloc: &mut AllocCursor, a: Value, b: Value) -> OpResult<Value> {
    if a.is_null() {
        if !is_list_shallow(b) {
            return Err(opaque_error(b).unwrap_or(E_DATA_TYPE));
        }
        return Ok(b);
    }
    if b.is_null() {
        if !is_list_shallow(a) {
            return Err(opaque_error(a).unwrap_or(E_DATA_TYPE));
        }
        return Ok(a);
    }
    if !is_list_shallow(a) || !is_list_shallow(b) {
        return Err(opaque_error(a).or(opaque_error(b)).unwrap_or(E_DATA_TYPE));
    }
    let ca = unsafe { &*a };
    let cb = unsafe { &*b };
    match (ca.hdr.type_id, cb.hdr.type_id) {
        (TYPE_SMALL_BIN, TYPE_SMALL_BIN)
            if (ca.hdr.type_arg + cb.hdr.type_arg) as usize <= SMALL_BIN_MAX =>
        {
            let mut bytes = Vec::with_capacity((ca.hdr.type_arg + cb.hdr.type_arg) as usize);
            bytes.extend_from_slice(unsafe { &ca.data.small_bin[..ca.hdr.type_arg as usize] });
            bytes.extend_from_slice(unsafe { &cb.data.small_bin[..cb.hdr.type_arg as usize] });
            mk_small_bin(alloc, &bytes)
        }
        (TYPE_SMALL_ARR, TYPE_SMALL_ARR)
            if (ca.hdr.type_arg + cb.hdr.type_arg) as usize <= SMALL_ARR_MAX =>
        {
            let mut elems = Vec::new();
            for i in 0..ca.hdr.type_arg as usize {
                elems.push(unsafe { ca.data.small_arr[i] });
            }
            for i in 0..cb.hdr.type_arg as usize {
                elems.push(unsafe { cb.data.small_arr[i] });
            }
            mk_small_arr(alloc, &elems)
        }
        (TYPE_BIG_BIN, TYPE_BIG_BIN) => {
            let ba = unsafe { ca.data.big_bin };
            let bb = unsafe { cb.data.big_bin };
            if !ba.origin.is_null()
                && ba.origin == bb.origin
                && unsafe { ba.data.add(ba.len) } == bb.data
            {
                // aligned slices of one origin rejoin
                return crate::value::mk_big_bin_slice(alloc, ba.data, ba.len + bb.len, ba.origin);
            }
            rope(alloc, a, b)
        }
        (TYPE_BIG_ARR, TYPE_BIG_ARR) => {
            let ba = unsafe { ca.data.big_arr };
            let bb = unsafe { cb.data.big_arr };
            if !ba.origin.is_null()
                && ba.origin == bb.origin
                && unsafe { ba.data.add(ba.len) } == bb.data
            {
                return crate::value::mk_big_arr_slice(
                    alloc,
                    ba.data,
                    ba.len + bb.len,
                    ba.origin,
                    ca.hdr.type_aggr | cb.hdr.type_aggr,
                );
            }
            rope(alloc, a, b)
        }
        _ => rope(alloc, a, b),
    }
}

fn rope(alloc: &mut AllocCursor, a: Value, b: Value) -> OpResult<Value> {
    let len_a = list_len(a).ok_or(E_DATA_TYPE)?;
    mk_take_concat(alloc, len_a, a, b)
}

/// Streaming byte reader over a binary value.
///
/// `read` scans from `offset`, copying up to `max` bytes into `buf` when
/// provided. Returns the bytes consumed and whether end-of-list was
/// reached within the scan.
pub fn binary_read(
    v: Value,
    offset: u64,
    max: usize,
    mut buf: Option<&mut [u8]>,
) -> (usize, bool) {
    let mut pos = 0u64; // absolute element position
    let mut taken = 0usize;
    let mut stack: Vec<Value> = vec![v];
    while let Some(mut cur) = stack.pop() {
        loop {
            if taken >= max && max > 0 {
                return (taken, false);
            }
            if cur.is_null() {
                break;
            }
            if first_bit(cur).is_some() {
                return (taken, false);
            }
            let c = unsafe { &*cur };
            match c.hdr.type_id {
                TYPE_SMALL_BIN | TYPE_BIG_BIN => {
                    let (data, len): (*const u8, usize) = if c.hdr.type_id == TYPE_SMALL_BIN {
                        (unsafe { c.data.small_bin.as_ptr() }, c.hdr.type_arg as usize)
                    } else {
                        let b = unsafe { c.data.big_bin };
                        (b.data, b.len)
                    };
                    let end = pos + len as u64;
                    if offset < end {
                        let from = offset.saturating_sub(pos) as usize;
                        let want = (len - from).min(max.saturating_sub(taken));
                        if let Some(out) = buf.as_deref_mut() {
                            unsafe {
                                std::ptr::copy_nonoverlapping(
                                    data.add(from),
                                    out[taken..].as_mut_ptr(),
                                    want,
                                );
                            }
                        }
                        taken += want;
                        if from + want < len {
                            return (taken, false);
                        }
                    }
                    pos = end;
                    break;
                }
                TYPE_SMALL_ARR | TYPE_BIG_ARR => {
                    let (data, len): (*const *mut glas_core::cell::Cell, usize) =
                        if c.hdr.type_id == TYPE_SMALL_ARR {
                            (unsafe { c.data.small_arr.as_ptr() }, c.hdr.type_arg as usize)
                        } else {
                            let b = unsafe { c.data.big_arr };
                            (b.data, b.len)
                        };
                    for i in 0..len {
                        if pos >= offset {
                            if taken >= max {
                                return (taken, false);
                            }
                            let Some(byte) = cell_to_byte(unsafe { *data.add(i) }) else {
                                return (taken, false);
                            };
                            if let Some(out) = buf.as_deref_mut() {
                                out[taken] = byte;
                            }
                            taken += 1;
                        }
                        pos += 1;
                    }
                    break;
                }
                TYPE_TAKE_CONCAT => {
                    let t = unsafe { c.data.take_concat };
                    stack.push(t.right);
                    cur = t.left;
                }
                TYPE_BRANCH => {
                    let b = unsafe { c.data.branch };
                    if b.stem_r != 0 {
                        return (taken, false);
                    }
                    if pos >= offset {
                        if taken >= max {
                            return (taken, false);
                        }
                        let Some(byte) = side_to_byte(b.stem_l, b.l) else {
                            return (taken, false);
                        };
                        if let Some(out) = buf.as_deref_mut() {
                            out[taken] = byte;
                        }
                        taken += 1;
                    }
                    pos += 1;
                    cur = b.r;
                }
                _ => return (taken, false),
            }
        }
    }
    // end of list reached; done iff the offset itself was within range
    (taken, offset <= pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::with_ctx;
    use crate::value::{byte_cell, mk_bin_owned, mk_pair};
    use serial_test::serial;

    fn read_all(v: Value) -> Vec<u8> {
        let len = list_len(v).expect("list") as usize;
        let mut out = vec![0u8; len];
        let (n, done) = binary_read(v, 0, len, Some(&mut out));
        assert_eq!((n, done), (len, true));
        out
    }

    #[test]
    #[serial]
    fn cons_chains_are_binaries() {
        with_ctx(|g| {
            let _b = g.busy();
            let mut v: Value = std::ptr::null_mut();
            for byte in [3u8, 2, 1] {
                let elem = byte_cell(&mut g.alloc, byte).unwrap();
                v = mk_pair(&mut g.alloc, elem, v).unwrap();
            }
            assert!(is_list(v));
            assert!(is_binary(v));
            assert_eq!(list_len(v), Some(3));
            assert_eq!(read_all(v), vec![1, 2, 3]);
        });
    }

    #[test]
    #[serial]
    fn split_and_append_flat_binaries() {
        with_ctx(|g| {
            let _b = g.busy();
            let bytes: Vec<u8> = (0..100).collect();
            let v = mk_bin_owned(&mut g.alloc, bytes.clone()).unwrap();
            let (l, r) = list_split(&mut g.alloc, v, 40).unwrap();
            assert_eq!(read_all(l), &bytes[..40]);
            assert_eq!(read_all(r), &bytes[40..]);
            let joined = list_append(&mut g.alloc, l, r).unwrap();
            assert_eq!(read_all(joined), bytes);
            // adjacent slices of one origin rejoin flat
            assert_eq!(unsafe { (*joined).hdr.type_id }, TYPE_BIG_BIN);
        });
    }

    #[test]
    #[serial]
    fn small_splits_materialize_inline_forms() {
        with_ctx(|g| {
            let _b = g.busy();
            let bytes: Vec<u8> = (0..30).collect();
            let v = mk_bin_owned(&mut g.alloc, bytes.clone()).unwrap();
            let (l, r) = list_split(&mut g.alloc, v, 10).unwrap();
            // 10 bytes must not stay a BIG_BIN slice
            assert_eq!(unsafe { (*l).hdr.type_id }, TYPE_SMALL_BIN);
            assert_eq!(read_all(l), &bytes[..10]);
            assert_eq!(read_all(r), &bytes[10..]);
        });
    }

    #[test]
    #[serial]
    fn rope_appends_concatenate() {
        with_ctx(|g| {
            let _b = g.busy();
            let a: Vec<u8> = (0..40).collect();
            let b: Vec<u8> = (40..100).collect();
            let va = mk_bin_owned(&mut g.alloc, a.clone()).unwrap();
            let vb = mk_bin_owned(&mut g.alloc, b.clone()).unwrap();
            let joined = list_append(&mut g.alloc, va, vb).unwrap();
            assert_eq!(list_len(joined), Some(100));
            let want: Vec<u8> = (0..100).collect();
            assert_eq!(read_all(joined), want);
            // distinct origins: a rope node, not a flat copy
            assert_eq!(unsafe { (*joined).hdr.type_id }, TYPE_TAKE_CONCAT);
            // split inside the right half goes through the rope
            let (l, r) = list_split(&mut g.alloc, joined, 70).unwrap();
            assert_eq!(read_all(l), &want[..70]);
            assert_eq!(read_all(r), &want[70..]);
        });
    }

    #[test]
    #[serial]
    fn offset_reads_stream() {
        with_ctx(|g| {
            let _b = g.busy();
            let bytes: Vec<u8> = (0..50).collect();
            let v = mk_bin_owned(&mut g.alloc, bytes.clone()).unwrap();
            let mut buf = [0u8; 20];
            let (n, done) = binary_read(v, 10, 20, Some(&mut buf));
            assert_eq!((n, done), (20, false));
            assert_eq!(&buf[..], &bytes[10..30]);
            let (n, done) = binary_read(v, 30, 20, Some(&mut buf));
            assert_eq!((n, done), (20, true));
            assert_eq!(&buf[..], &bytes[30..50]);
            // offset past the end: nothing read, not at end
            let (n, done) = binary_read(v, 60, 5, Some(&mut buf[..5]));
            assert_eq!(n, 0);
            assert!(!done);
        });
    }

    #[test]
    #[serial]
    fn append_rejects_non_lists() {
        with_ctx(|g| {
            let _b = g.busy();
            let bits = crate::bits::int_to_bits(5);
            let not_list =
                crate::value::make_bits_then(&mut g.alloc, &bits, std::ptr::null_mut()).unwrap();
            let v = mk_bin_owned(&mut g.alloc, vec![1, 2, 3]).unwrap();
            assert!(list_append(&mut g.alloc, not_list, v).is_err());
        });
    }
}
