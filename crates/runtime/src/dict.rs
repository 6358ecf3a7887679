//! Dicts: byte-aligned radix trees with NUL-terminated labels.
//!
//! A dict is the value tree itself read as a radix tree: label bytes are
//! bit paths (0 left, 1 right), every label is terminated by a 0x00 byte
//! so labels are prefix-free, and the item sits immediately after the
//! terminator. Insert and remove re-thread the path, sharing every
//! untouched subtree.
//!
//! Intermediate side values are materialized during descent; the
//! throwaway cells become garbage for the next collection.

use crate::bits::BitStr;
use crate::error::{E_DATA_TYPE, OpResult};
use crate::value::{
    Value, first_bit, is_bitstr, leading_bits, make_bits_then, mk_branch, opaque_error,
    stem_word_then, strip_bits,
};
use glas_core::alloc::AllocCursor;
use glas_core::cell::TYPE_BRANCH;

/// Bit path of a label: its bytes followed by the NUL terminator.
pub fn label_path(label: &[u8]) -> BitStr {
    debug_assert!(!label.contains(&0), "labels must not contain NUL");
    let mut path = BitStr::from_bytes(label);
    path.push_byte(0);
    path
}

/// Look up a label. `Ok(None)` when absent.
pub fn dict_get(alloc: &mut AllocCursor, dict: Value, path: &BitStr) -> OpResult<Option<Value>> {
    let mut v = dict;
    let mut pos = 0usize;
    loop {
        if pos == path.len() {
            return Ok(Some(v));
        }
        if v.is_null() {
            return Ok(None);
        }
        let mut run = BitStr::new();
        let body = leading_bits(v, &mut run);
        let common = run.common_prefix(path, pos);
        if common < run.len() {
            return Ok(None);
        }
        pos += common;
        if pos == path.len() {
            // the item is whatever follows the run
            return Ok(Some(strip_bits(alloc, v, common as u64)?));
        }
        if body.is_null() {
            return Ok(None);
        }
        let c = unsafe { &*body };
        if c.hdr.type_id != TYPE_BRANCH {
            return Ok(None);
        }
        let b = unsafe { c.data.branch };
        let bit = path.get(pos);
        pos += 1;
        let (w, child) = if bit { (b.stem_r, b.r) } else { (b.stem_l, b.l) };
        v = stem_word_then(alloc, w, child)?;
    }
}

/// Insert `item` under a label path. Returns the new dict and the item it
/// replaced, if any.
pub fn dict_insert(
    alloc: &mut AllocCursor,
    dict: Value,
    path: &BitStr,
    item: Value,
) -> OpResult<(Value, Option<Value>)> {
    let mut replaced = None;
    let out = ins(alloc, dict, path, 0, item, &mut replaced)?;
    Ok((out, replaced))
}

fn ins(
    alloc: &mut AllocCursor,
    v: Value,
    path: &BitStr,
    pos: usize,
    item: Value,
    replaced: &mut Option<Value>,
) -> OpResult<Value> {
    if pos == path.len() {
        *replaced = Some(v);
        return Ok(item);
    }
    if v.is_null() {
        return make_bits_then(alloc, &path.slice(pos, path.len()), item);
    }
    if let Some(flag) = opaque_error(v) {
        return Err(flag);
    }
    let mut run = BitStr::new();
    let body = leading_bits(v, &mut run);
    let avail = path.len() - pos;
    let common = run.common_prefix(path, pos);
    if common < run.len() {
        if common == avail {
            // new label is a strict prefix of a stored edge
            return Err(E_DATA_TYPE);
        }
        // paths diverge at `common`: fork a pair there
        let new_bit = path.get(pos + common);
        let old_side = strip_bits(alloc, v, (common + 1) as u64)?;
        let new_side = make_bits_then(alloc, &path.slice(pos + common + 1, path.len()), item)?;
        let (l, r) = if new_bit { (old_side, new_side) } else { (new_side, old_side) };
        let pair = mk_branch(alloc, 0, l, 0, r)?;
        return make_bits_then(alloc, &run.slice(0, common), pair);
    }
    let pos2 = pos + run.len();
    if body.is_null() {
        // a stored label ends before ours: malformed relative to this path
        return Err(E_DATA_TYPE);
    }
    let c = unsafe { &*body };
    if c.hdr.type_id != TYPE_BRANCH {
        return Err(opaque_error(body).unwrap_or(E_DATA_TYPE));
    }
    let b = unsafe { c.data.branch };
    let bit = path.get(pos2);
    let (w, child) = if bit { (b.stem_r, b.r) } else { (b.stem_l, b.l) };
    let side_val = stem_word_then(alloc, w, child)?;
    let new_side = ins(alloc, side_val, path, pos2 + 1, item, replaced)?;
    let pair = if bit {
        mk_branch(alloc, b.stem_l, b.l, 0, new_side)?
    } else {
        mk_branch(alloc, 0, new_side, b.stem_r, b.r)?
    };
    make_bits_then(alloc, &run, pair)
}

/// Remove a label. `Ok(None)` when absent; otherwise the removed item and
/// the new dict (null when the dict empties).
pub fn dict_remove(
    alloc: &mut AllocCursor,
    dict: Value,
    path: &BitStr,
) -> OpResult<Option<(Value, Value)>> {
    match rem(alloc, dict, path, 0)? {
        None => Ok(None),
        Some((item, rest)) => Ok(Some((item, rest.unwrap_or(std::ptr::null_mut())))),
    }
}

#[allow(clippy::type_complexity)]
fn rem(
    alloc: &mut AllocCursor,
    v: Value,
    path: &BitStr,
    pos: usize,
) -> OpResult<Option<(Value, Option<Value>)>> {
    if pos == path.len() {
        // the item itself; the edge above it disappears
        return Ok(Some((v, None)));
    }
    if v.is_null() {
        return Ok(None);
    }
    if let Some(flag) = opaque_error(v) {
        return Err(flag);
    }
    let mut run = BitStr::new();
    let body = leading_bits(v, &mut run);
    let common = run.common_prefix(path, pos);
    if common < run.len() {
        return Ok(None);
    }
    let pos2 = pos + run.len();
    if body.is_null() {
        return Ok(None);
    }
    let c = unsafe { &*body };
    if c.hdr.type_id != TYPE_BRANCH {
        return Ok(None);
    }
    let b = unsafe { c.data.branch };
    let bit = path.get(pos2);
    let (w, child) = if bit { (b.stem_r, b.r) } else { (b.stem_l, b.l) };
    let side_val = stem_word_then(alloc, w, child)?;
    let Some((item, sub)) = rem(alloc, side_val, path, pos2 + 1)? else {
        return Ok(None);
    };
    let rebuilt = match sub {
        Some(new_side) => {
            let pair = if bit {
                mk_branch(alloc, b.stem_l, b.l, 0, new_side)?
            } else {
                mk_branch(alloc, 0, new_side, b.stem_r, b.r)?
            };
            make_bits_then(alloc, &run, pair)?
        }
        None => {
            // one side vanished: collapse the pair into the kept side's edge
            let (kw, kchild) = if bit { (b.stem_l, b.l) } else { (b.stem_r, b.r) };
            let kept = stem_word_then(alloc, kw, kchild)?;
            let mut edge = run.clone();
            edge.push(!bit);
            make_bits_then(alloc, &edge, kept)?
        }
    };
    Ok(Some((item, Some(rebuilt))))
}

/// Enumerate every `(label, item)` of the dict in tree order. Returns
/// false when the structure is not a well-formed dict.
pub fn dict_for_each_label(
    alloc: &mut AllocCursor,
    dict: Value,
    f: &mut impl FnMut(&[u8], Value) -> OpResult<()>,
) -> OpResult<bool> {
    if dict.is_null() {
        return Ok(true);
    }
    let mut acc = BitStr::new();
    walk_labels(alloc, dict, &mut acc, f)
}

fn walk_labels(
    alloc: &mut AllocCursor,
    v: Value,
    acc: &mut BitStr,
    f: &mut impl FnMut(&[u8], Value) -> OpResult<()>,
) -> OpResult<bool> {
    if v.is_null() {
        // a dangling edge mid-label
        return Ok(false);
    }
    let mut run = BitStr::new();
    let body = leading_bits(v, &mut run);
    for i in 0..run.len() {
        acc.push(run.get(i));
        if acc.len() % 8 == 0 {
            let octets = acc.as_octets().expect("byte-aligned");
            if octets[octets.len() - 1] == 0 {
                // terminator: the item is everything after these bits
                let item = strip_bits(alloc, v, (i + 1) as u64)?;
                let label = octets[..octets.len() - 1].to_vec();
                f(&label, item)?;
                for _ in 0..=i {
                    acc.pop();
                }
                return Ok(true);
            }
        }
    }
    let ok = 'walk: {
        if body.is_null() {
            break 'walk false;
        }
        let c = unsafe { &*body };
        if c.hdr.type_id != TYPE_BRANCH {
            break 'walk false;
        }
        let b = unsafe { c.data.branch };
        let left = stem_word_then(alloc, b.stem_l, b.l)?;
        acc.push(false);
        let lok = walk_labels(alloc, left, acc, f)?;
        acc.pop();
        if !lok {
            break 'walk false;
        }
        let right = stem_word_then(alloc, b.stem_r, b.r)?;
        acc.push(true);
        let rok = walk_labels(alloc, right, acc, f)?;
        acc.pop();
        rok
    };
    for _ in 0..run.len() {
        acc.pop();
    }
    Ok(ok)
}

/// Whether the value is a well-formed dict.
pub fn is_dict(alloc: &mut AllocCursor, v: Value) -> bool {
    if v.is_null() {
        return true;
    }
    if first_bit(v).is_none() && unsafe { (*v).hdr.type_id } != TYPE_BRANCH {
        return false;
    }
    matches!(dict_for_each_label(alloc, v, &mut |_, _| Ok(())), Ok(true))
}

/// Whether the value is a ratio: a dict of exactly `n` and `d`, both
/// bitstring integers.
pub fn is_ratio(alloc: &mut AllocCursor, v: Value) -> bool {
    if v.is_null() {
        return false;
    }
    let mut labels: Vec<(Vec<u8>, bool)> = Vec::new();
    let ok = dict_for_each_label(alloc, v, &mut |label, item| {
        labels.push((label.to_vec(), is_bitstr(item)));
        Ok(())
    });
    if !matches!(ok, Ok(true)) || labels.len() != 2 {
        return false;
    }
    labels.sort();
    labels[0].0 == b"d" && labels[0].1 && labels[1].0 == b"n" && labels[1].1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::int_to_bits;
    use crate::testutil::with_ctx;
    use crate::value::{cell_to_byte, byte_cell, make_bits_then};
    use serial_test::serial;

    #[test]
    #[serial]
    fn insert_get_remove_round_trip() {
        with_ctx(|g| {
            let _b = g.busy();
            let a = byte_cell(&mut g.alloc, 1).unwrap();
            let b = byte_cell(&mut g.alloc, 2).unwrap();
            let (d, _) =
                dict_insert(&mut g.alloc, std::ptr::null_mut(), &label_path(b"alpha"), a).unwrap();
            let (d, _) = dict_insert(&mut g.alloc, d, &label_path(b"beta"), b).unwrap();
            assert!(is_dict(&mut g.alloc, d));
            let got = dict_get(&mut g.alloc, d, &label_path(b"alpha")).unwrap().unwrap();
            assert_eq!(cell_to_byte(got), Some(1));
            let got = dict_get(&mut g.alloc, d, &label_path(b"beta")).unwrap().unwrap();
            assert_eq!(cell_to_byte(got), Some(2));
            assert!(dict_get(&mut g.alloc, d, &label_path(b"gamma")).unwrap().is_none());

            let (item, d) = dict_remove(&mut g.alloc, d, &label_path(b"alpha"))
                .unwrap()
                .expect("present");
            assert_eq!(cell_to_byte(item), Some(1));
            assert!(dict_get(&mut g.alloc, d, &label_path(b"alpha")).unwrap().is_none());
            let got = dict_get(&mut g.alloc, d, &label_path(b"beta")).unwrap().unwrap();
            assert_eq!(cell_to_byte(got), Some(2));
        });
    }

    #[test]
    #[serial]
    fn insert_replaces_and_reports_old_item() {
        with_ctx(|g| {
            let _b = g.busy();
            let a = byte_cell(&mut g.alloc, 1).unwrap();
            let b = byte_cell(&mut g.alloc, 2).unwrap();
            let (d, none) =
                dict_insert(&mut g.alloc, std::ptr::null_mut(), &label_path(b"k"), a).unwrap();
            assert!(none.is_none());
            let (d, old) = dict_insert(&mut g.alloc, d, &label_path(b"k"), b).unwrap();
            assert_eq!(old.map(cell_to_byte), Some(Some(1)));
            let got = dict_get(&mut g.alloc, d, &label_path(b"k")).unwrap().unwrap();
            assert_eq!(cell_to_byte(got), Some(2));
        });
    }

    #[test]
    #[serial]
    fn removing_last_label_collapses_to_empty() {
        with_ctx(|g| {
            let _b = g.busy();
            let a = byte_cell(&mut g.alloc, 9).unwrap();
            let (d, _) =
                dict_insert(&mut g.alloc, std::ptr::null_mut(), &label_path(b"only"), a).unwrap();
            let (item, d) = dict_remove(&mut g.alloc, d, &label_path(b"only"))
                .unwrap()
                .expect("present");
            assert_eq!(cell_to_byte(item), Some(9));
            assert!(d.is_null());
        });
    }

    #[test]
    #[serial]
    fn labels_enumerate_in_order() {
        with_ctx(|g| {
            let _b = g.busy();
            let mut d = std::ptr::null_mut();
            for (label, byte) in [(&b"x"[..], 1u8), (b"y", 2), (b"xx", 3)] {
                let item = byte_cell(&mut g.alloc, byte).unwrap();
                (d, _) = dict_insert(&mut g.alloc, d, &label_path(label), item).unwrap();
            }
            let mut seen = Vec::new();
            let ok = dict_for_each_label(&mut g.alloc, d, &mut |label, item| {
                seen.push((label.to_vec(), cell_to_byte(item)));
                Ok(())
            })
            .unwrap();
            assert!(ok);
            seen.sort();
            assert_eq!(
                seen,
                vec![
                    (b"x".to_vec(), Some(1)),
                    (b"xx".to_vec(), Some(3)),
                    (b"y".to_vec(), Some(2)),
                ]
            );
        });
    }

    #[test]
    #[serial]
    fn ratio_shape() {
        with_ctx(|g| {
            let _b = g.busy();
            let n = make_bits_then(&mut g.alloc, &int_to_bits(3), std::ptr::null_mut()).unwrap();
            let d = make_bits_then(&mut g.alloc, &int_to_bits(4), std::ptr::null_mut()).unwrap();
            let (r, _) = dict_insert(&mut g.alloc, std::ptr::null_mut(), &label_path(b"n"), n)
                .unwrap();
            let (r, _) = dict_insert(&mut g.alloc, r, &label_path(b"d"), d).unwrap();
            assert!(is_ratio(&mut g.alloc, r));
            assert!(is_dict(&mut g.alloc, r));
            // a third label breaks the shape
            let x = byte_cell(&mut g.alloc, 1).unwrap();
            let (r3, _) = dict_insert(&mut g.alloc, r, &label_path(b"x"), x).unwrap();
            assert!(!is_ratio(&mut g.alloc, r3));
        });
    }
}
