//! Data transfer and structural operations on the context.
//!
//! Everything here is a pure tree rewrite over the cell graph plus a
//! stack adjustment. Operations that cannot apply fail by returning
//! false; genuine errors (underflow, sealed data, type mismatches that
//! the program model calls divergence) also record an error flag.

use crate::bits::{BitStr, int_to_bits};
use crate::context::Glas;
use crate::dict;
use crate::error::{E_DATA_SEAL, E_DATA_TYPE, E_LINEARITY, E_UNDERFLOW, OpResult};
use crate::list::{binary_read, is_binary, is_list, list_append, list_len, list_split};
use crate::value::{
    Value, first_bit, int_of_value, is_bitstr, is_pair, leading_bits, leading_len, make_bits_then,
    mk_bin_owned, mk_pair, opaque_error, strip_bits,
};
use glas_core::cell::{TYPE_BIG_BIN, TYPE_SMALL_BIN};
use glas_core::rt::rt;

/// Binaries below this length are copied even on the zero-copy path.
const ZC_COPY_THRESHOLD: usize = 64;

/// Fixed-width integers transferable over the stack as variable-width
/// bitstrings.
pub trait GlasInt: Copy {
    fn into_i128(self) -> i128;
    fn from_i128(n: i128) -> Option<Self>;
}

macro_rules! glas_int {
    ($($t:ty),*) => {$(
        impl GlasInt for $t {
            fn into_i128(self) -> i128 {
                self as i128
            }
            fn from_i128(n: i128) -> Option<Self> {
                <$t>::try_from(n).ok()
            }
        }
    )*};
}

glas_int!(i8, i16, i32, i64, u8, u16, u32, u64);

/// A zero-copy view of a flattened binary. The backing cell stays pinned
/// against collection until this guard drops.
pub struct ZcRead {
    data: *const u8,
    len: usize,
    pinned: *mut glas_core::cell::Cell,
}

impl ZcRead {
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }
}

impl Drop for ZcRead {
    fn drop(&mut self) {
        if !self.pinned.is_null() {
            rt().unpin(self.pinned);
        }
    }
}

impl Glas {
    // -----------------------------------------------------------------
    // Binaries
    // -----------------------------------------------------------------

    /// Push a copy of a binary.
    pub fn binary_push(&mut self, buf: &[u8]) -> bool {
        let _b = self.busy();
        let r = mk_bin_owned(&mut self.alloc, buf.to_vec()).and_then(|v| self.push_value(v));
        self.finish_op(r)
    }

    /// Zero-copy push: the runtime slices `buf` in place and runs
    /// `release` when it lets go. Short binaries are copied and released
    /// before returning.
    ///
    /// # Safety
    /// `buf` must stay valid and unmodified until `release` runs.
    pub unsafe fn binary_push_zc(
        &mut self,
        buf: *const u8,
        len: usize,
        release: Option<glas_core::cell::ReleaseFn>,
        release_arg: *mut u8,
    ) -> bool {
        let _b = self.busy();
        if len < ZC_COPY_THRESHOLD {
            let bytes = unsafe { std::slice::from_raw_parts(buf, len) }.to_vec();
            let r = mk_bin_owned(&mut self.alloc, bytes).and_then(|v| self.push_value(v));
            if let Some(f) = release {
                unsafe { f(release_arg) };
            }
            return self.finish_op(r);
        }
        let r = (|| -> OpResult<()> {
            let origin =
                crate::value::mk_foreign(&mut self.alloc, buf.cast_mut(), release, release_arg, 0)?;
            let bin = crate::value::mk_big_bin_slice(&mut self.alloc, buf, len, origin)?;
            self.push_value(bin)
        })();
        self.finish_op(r)
    }

    /// Copy from the binary on top of the stack. Scans from
    /// `start_offset`, reading at most `max_read` bytes into `buf` when
    /// given (`buf.len()` must cover `max_read`). Returns the bytes read
    /// and true iff end-of-list was reached.
    pub fn binary_peek(
        &mut self,
        start_offset: usize,
        max_read: usize,
        buf: Option<&mut [u8]>,
    ) -> (usize, bool) {
        let _b = self.busy();
        let v = match self.peek_at(0) {
            Ok(v) => v,
            Err(flag) => {
                self.flag(flag);
                return (0, false);
            }
        };
        binary_read(v, start_offset as u64, max_read, buf)
    }

    /// Zero-copy read: flattens the binary on top of the stack (a stable,
    /// idempotent copy) and returns a pinned view of the requested range.
    pub fn binary_peek_zc(&mut self, start_offset: usize, max_read: usize) -> Option<ZcRead> {
        let _b = self.busy();
        let v = match self.peek_at(0) {
            Ok(v) => v,
            Err(flag) => {
                self.flag(flag);
                return None;
            }
        };
        let flat = match self.flatten_binary(v) {
            Ok(Some(flat)) => flat,
            Ok(None) => {
                self.flag(E_DATA_TYPE);
                return None;
            }
            Err(flag) => {
                self.flag(flag);
                return None;
            }
        };
        if flat.is_null() {
            // empty binary: a valid, empty view
            static EMPTY: [u8; 0] = [];
            return (start_offset == 0).then_some(ZcRead {
                data: EMPTY.as_ptr(),
                len: 0,
                pinned: std::ptr::null_mut(),
            });
        }
        let (data, len, pin) = unsafe {
            match (*flat).hdr.type_id {
                TYPE_SMALL_BIN => (
                    (*flat).data.small_bin.as_ptr(),
                    (*flat).hdr.type_arg as usize,
                    flat,
                ),
                TYPE_BIG_BIN => {
                    let b = (*flat).data.big_bin;
                    (b.data, b.len, b.origin)
                }
                _ => unreachable!("flatten produced a flat binary"),
            }
        };
        if start_offset > len {
            return None;
        }
        let take = (len - start_offset).min(max_read);
        rt().pin(pin);
        Some(ZcRead {
            data: unsafe { data.add(start_offset) },
            len: take,
            pinned: pin,
        })
    }

    /// Replace the binary on top with a flat representation; a no-op when
    /// it is already flat. `Ok(None)` when the top is not a binary (or
    /// the stack is empty: flag already set by peeks).
    fn flatten_binary(&mut self, v: Value) -> OpResult<Option<Value>> {
        if v.is_null() {
            // the empty binary is flat enough; keep unit, zero-length view
            return Ok(Some(v));
        }
        let t = unsafe { (*v).hdr.type_id };
        if t == TYPE_SMALL_BIN || t == TYPE_BIG_BIN {
            return Ok(Some(v));
        }
        if !is_binary(v) {
            return Ok(None);
        }
        let len = list_len(v).ok_or(E_DATA_TYPE)? as usize;
        let mut bytes = vec![0u8; len];
        let (n, done) = binary_read(v, 0, len, Some(&mut bytes));
        if n != len || !done {
            return Ok(None);
        }
        let flat = mk_bin_owned(&mut self.alloc, bytes)?;
        self.replace_top(flat)?;
        Ok(Some(flat))
    }

    // -----------------------------------------------------------------
    // Bitstrings and integers
    // -----------------------------------------------------------------

    /// Push a binary as a bitstring (full octets, msb-first).
    pub fn bits_push(&mut self, buf: &[u8]) -> bool {
        let _b = self.busy();
        let bits = BitStr::from_bytes(buf);
        let r = make_bits_then(&mut self.alloc, &bits, std::ptr::null_mut())
            .and_then(|v| self.push_value(v));
        self.finish_op(r)
    }

    /// Read the bitstring on top of the stack as bytes (full octets).
    pub fn bits_peek(
        &mut self,
        start_offset: usize,
        max_read: usize,
        buf: &mut [u8],
    ) -> (usize, bool) {
        let _b = self.busy();
        let v = match self.peek_at(0) {
            Ok(v) => v,
            Err(flag) => {
                self.flag(flag);
                return (0, false);
            }
        };
        let mut run = BitStr::new();
        if !leading_bits(v, &mut run).is_null() {
            return (0, false);
        }
        let whole_bytes = run.len() / 8;
        if start_offset >= whole_bytes {
            return (0, start_offset * 8 >= run.len());
        }
        let take = (whole_bytes - start_offset).min(max_read).min(buf.len());
        for i in 0..take {
            let mut byte = 0u8;
            for bit in 0..8 {
                byte = (byte << 1) | u8::from(run.get((start_offset + i) * 8 + bit));
            }
            buf[i] = byte;
        }
        let done = (start_offset + take) * 8 == run.len();
        (take, done)
    }

    /// Push an integer (variable-width bitstring form).
    pub fn int_push<T: GlasInt>(&mut self, n: T) -> bool {
        let _b = self.busy();
        let bits = int_to_bits(n.into_i128());
        let r = make_bits_then(&mut self.alloc, &bits, std::ptr::null_mut())
            .and_then(|v| self.push_value(v));
        self.finish_op(r)
    }

    /// Copy the integer on top of the stack. Fails when the top is not an
    /// integer or does not fit the requested width.
    pub fn int_peek<T: GlasInt>(&mut self) -> Option<T> {
        let _b = self.busy();
        let v = self.peek_at(0).ok()?;
        let mut run = BitStr::new();
        if !leading_bits(v, &mut run).is_null() {
            return None;
        }
        T::from_i128(crate::bits::bits_to_int(&run)?)
    }

    // -----------------------------------------------------------------
    // Primitive operations
    // -----------------------------------------------------------------

    /// `A B -- (A,B)`; B is top of stack.
    pub fn mkp(&mut self) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            if self.data_depth() < 2 {
                return Err(E_UNDERFLOW);
            }
            let b = self.pop_value()?;
            let a = self.pop_value()?;
            let p = mk_pair(&mut self.alloc, a, b)?;
            self.push_value(p)
        })();
        self.finish_op(r)
    }

    /// `X -- 0b0.X`
    pub fn mkl(&mut self) -> bool {
        self.mk_bit(false)
    }

    /// `X -- 0b1.X`
    pub fn mkr(&mut self) -> bool {
        self.mk_bit(true)
    }

    fn mk_bit(&mut self, bit: bool) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let v = self.peek_at(0)?;
            if let Some(flag) = opaque_error(v) {
                return Err(flag);
            }
            let mut bits = BitStr::new();
            bits.push(bit);
            let out = make_bits_then(&mut self.alloc, &bits, v)?;
            self.replace_top(out)
        })();
        self.finish_op(r)
    }

    /// `(A,B) -- A B | FAIL`
    pub fn unp(&mut self) -> bool {
        let _b = self.busy();
        let v = match self.peek_at(0) {
            Ok(v) => v,
            Err(flag) => {
                self.flag(flag);
                return false;
            }
        };
        match crate::value::as_pair(&mut self.alloc, v) {
            Ok(Some((a, b))) => {
                let r = (|| -> OpResult<()> {
                    let _ = self.pop_value()?;
                    self.push_value(a)?;
                    self.push_value(b)
                })();
                self.finish_op(r)
            }
            Ok(None) => false,
            Err(flag) => {
                self.flag(flag);
                false
            }
        }
    }

    /// `0b0.X -- X | FAIL`
    pub fn unl(&mut self) -> bool {
        self.un_bit(false)
    }

    /// `0b1.X -- X | FAIL`
    pub fn unr(&mut self) -> bool {
        self.un_bit(true)
    }

    fn un_bit(&mut self, bit: bool) -> bool {
        let _b = self.busy();
        let v = match self.peek_at(0) {
            Ok(v) => v,
            Err(flag) => {
                self.flag(flag);
                return false;
            }
        };
        if let Some(flag) = opaque_error(v) {
            if flag == E_DATA_SEAL {
                self.flag(flag);
            }
            return false;
        }
        if first_bit(v) != Some(bit) {
            return false;
        }
        let r = strip_bits(&mut self.alloc, v, 1).and_then(|out| self.replace_top(out));
        self.finish_op(r)
    }

    // -----------------------------------------------------------------
    // Shape predicates (non-modifying)
    // -----------------------------------------------------------------

    pub fn data_is_unit(&mut self) -> bool {
        self.predicate(|_, v| v.is_null())
    }

    pub fn data_is_pair(&mut self) -> bool {
        self.predicate(|_, v| is_pair(v))
    }

    pub fn data_is_inl(&mut self) -> bool {
        self.predicate(|_, v| first_bit(v) == Some(false))
    }

    pub fn data_is_inr(&mut self) -> bool {
        self.predicate(|_, v| first_bit(v) == Some(true))
    }

    pub fn data_is_list(&mut self) -> bool {
        self.predicate(|_, v| is_list(v))
    }

    pub fn data_is_binary(&mut self) -> bool {
        self.predicate(|_, v| is_binary(v))
    }

    pub fn data_is_bitstr(&mut self) -> bool {
        self.predicate(|_, v| is_bitstr(v))
    }

    pub fn data_is_dict(&mut self) -> bool {
        self.predicate(|g, v| dict::is_dict(&mut g.alloc, v))
    }

    pub fn data_is_ratio(&mut self) -> bool {
        self.predicate(|g, v| dict::is_ratio(&mut g.alloc, v))
    }

    fn predicate(&mut self, f: impl FnOnce(&mut Glas, Value) -> bool) -> bool {
        let _b = self.busy();
        match self.peek_at(0) {
            Ok(v) => f(self, v),
            Err(flag) => {
                self.flag(flag);
                false
            }
        }
    }

    // -----------------------------------------------------------------
    // List operations
    // -----------------------------------------------------------------

    /// `L -- L N`
    pub fn list_len(&mut self) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let v = self.peek_at(0)?;
            let len = list_len(v).ok_or(E_DATA_TYPE)?;
            let n = make_bits_then(&mut self.alloc, &int_to_bits(len as i128), std::ptr::null_mut())?;
            self.push_value(n)
        })();
        self.finish_op(r)
    }

    /// Length of the list on top, without pushing.
    pub fn list_len_peek(&mut self, out: &mut usize) -> bool {
        let _b = self.busy();
        match self.peek_at(0).ok().and_then(list_len) {
            Some(n) => {
                *out = n as usize;
                true
            }
            None => false,
        }
    }

    /// `(L++R) (L len) -- L R`
    pub fn list_split(&mut self) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let n = int_of_value(self.peek_at(0)?).ok_or(E_DATA_TYPE)?;
            let n = u64::try_from(n).map_err(|_| E_DATA_TYPE)?;
            let v = self.peek_at(1)?;
            let (l, rgt) = list_split(&mut self.alloc, v, n)?;
            let _ = self.pop_value()?;
            let _ = self.pop_value()?;
            self.push_value(l)?;
            self.push_value(rgt)
        })();
        self.finish_op(r)
    }

    /// Split the list on top after `n` elements.
    pub fn list_split_n(&mut self, n: usize) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let v = self.peek_at(0)?;
            let (l, rgt) = list_split(&mut self.alloc, v, n as u64)?;
            let _ = self.pop_value()?;
            self.push_value(l)?;
            self.push_value(rgt)
        })();
        self.finish_op(r)
    }

    /// `L R -- (L++R)`
    pub fn list_append(&mut self) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let rgt = self.peek_at(0)?;
            let l = self.peek_at(1)?;
            let joined = list_append(&mut self.alloc, l, rgt)?;
            let _ = self.pop_value()?;
            let _ = self.pop_value()?;
            self.push_value(joined)
        })();
        self.finish_op(r)
    }

    // -----------------------------------------------------------------
    // Bitstring operations
    // -----------------------------------------------------------------

    /// `B -- B N`
    pub fn bits_len(&mut self) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let v = self.peek_at(0)?;
            if !is_bitstr(v) {
                return Err(E_DATA_TYPE);
            }
            let len = leading_len(v);
            let n = make_bits_then(&mut self.alloc, &int_to_bits(len as i128), std::ptr::null_mut())?;
            self.push_value(n)
        })();
        self.finish_op(r)
    }

    /// Bit length of the bitstring on top, without pushing.
    pub fn bits_len_peek(&mut self, out: &mut usize) -> bool {
        let _b = self.busy();
        match self.peek_at(0) {
            Ok(v) if is_bitstr(v) => {
                *out = leading_len(v) as usize;
                true
            }
            _ => false,
        }
    }

    /// `(B++C) (B len) -- B C`
    pub fn bits_split(&mut self) -> bool {
        let _b = self.busy();
        let nv = match self.pop_value() {
            Ok(v) => v,
            Err(flag) => {
                self.flag(flag);
                return false;
            }
        };
        let n = match int_of_value(nv) {
            Some(n) if n >= 0 => n as u64,
            _ => {
                let _ = self.push_value(nv);
                self.flag(E_DATA_TYPE);
                return false;
            }
        };
        let r = self.bits_split_inner(n);
        if r.is_err() {
            let _ = self.push_value(nv);
        }
        self.finish_op(r)
    }

    /// Split the bitstring on top after `n` bits.
    pub fn bits_split_n(&mut self, n: usize) -> bool {
        let _b = self.busy();
        let r = self.bits_split_inner(n as u64);
        self.finish_op(r)
    }

    fn bits_split_inner(&mut self, n: u64) -> OpResult<()> {
        let v = self.peek_at(0)?;
        let mut run = BitStr::new();
        if !leading_bits(v, &mut run).is_null() {
            return Err(E_DATA_TYPE);
        }
        if (n as usize) > run.len() {
            return Err(E_DATA_TYPE);
        }
        let first = run.slice(0, n as usize);
        let rest = run.slice(n as usize, run.len());
        let l = make_bits_then(&mut self.alloc, &first, std::ptr::null_mut())?;
        let r = make_bits_then(&mut self.alloc, &rest, std::ptr::null_mut())?;
        let _ = self.pop_value()?;
        self.push_value(l)?;
        self.push_value(r)
    }

    /// `B C -- (B++C)`
    pub fn bits_append(&mut self) -> bool {
        let _b = self.busy();
        let r = (|| -> OpResult<()> {
            let c = self.peek_at(0)?;
            let b = self.peek_at(1)?;
            let mut run = BitStr::new();
            if !leading_bits(b, &mut run).is_null() {
                return Err(E_DATA_TYPE);
            }
            let mut crun = BitStr::new();
            if !leading_bits(c, &mut crun).is_null() {
                return Err(E_DATA_TYPE);
            }
            run.append(&crun);
            let joined = make_bits_then(&mut self.alloc, &run, std::ptr::null_mut())?;
            let _ = self.pop_value()?;
            let _ = self.pop_value()?;
            self.push_value(joined)
        })();
        self.finish_op(r)
    }

    // -----------------------------------------------------------------
    // Dict operations
    // -----------------------------------------------------------------

    /// `Item Record Label -- Record'` with the label on the stack.
    pub fn dict_insert(&mut self) -> bool {
        let _b = self.busy();
        let label = match self.label_from_stack() {
            Ok(l) => l,
            Err(flag) => {
                self.flag(flag);
                return false;
            }
        };
        let r = self.dict_insert_inner(&label, 1);
        self.finish_op(r)
    }

    /// `Item Record -- Record'` with the label given directly.
    pub fn dict_insert_l(&mut self, label: &str) -> bool {
        let _b = self.busy();
        let r = self.dict_insert_inner(label.as_bytes(), 0);
        self.finish_op(r)
    }

    fn dict_insert_inner(&mut self, label: &[u8], label_cells: usize) -> OpResult<()> {
        let record = self.peek_at(label_cells)?;
        let item = self.peek_at(label_cells + 1)?;
        let path = dict::label_path(label);
        let (out, replaced) = dict::dict_insert(&mut self.alloc, record, &path, item)?;
        if let Some(old) = replaced {
            if !self.linearity_unchecked && !old.is_null() && unsafe { (*old).is_linear() } {
                return Err(E_LINEARITY);
            }
        }
        for _ in 0..label_cells + 2 {
            let _ = self.pop_value()?;
        }
        self.push_value(out)
    }

    /// `Record Label -- Item Record' | FAIL` with the label on the stack.
    pub fn dict_remove(&mut self) -> bool {
        let _b = self.busy();
        let label = match self.label_from_stack() {
            Ok(l) => l,
            Err(flag) => {
                self.flag(flag);
                return false;
            }
        };
        self.dict_remove_inner(&label, 1)
    }

    /// `Record -- Item Record' | FAIL` with the label given directly.
    pub fn dict_remove_l(&mut self, label: &str) -> bool {
        let _b = self.busy();
        self.dict_remove_inner(label.as_bytes(), 0)
    }

    fn dict_remove_inner(&mut self, label: &[u8], label_cells: usize) -> bool {
        let r: OpResult<bool> = (|| {
            let record = self.peek_at(label_cells)?;
            let path = dict::label_path(label);
            let Some((item, rest)) = dict::dict_remove(&mut self.alloc, record, &path)? else {
                return Ok(false);
            };
            for _ in 0..label_cells + 1 {
                let _ = self.pop_value()?;
            }
            self.push_value(item)?;
            self.push_value(rest)?;
            Ok(true)
        })();
        match r {
            Ok(found) => found,
            Err(flag) => {
                self.flag(flag);
                false
            }
        }
    }

    /// Read the binary label on top of the stack (left there; callers
    /// account for its cell in stack offsets).
    fn label_from_stack(&mut self) -> OpResult<Vec<u8>> {
        let v = self.peek_at(0)?;
        let len = list_len(v).ok_or(E_DATA_TYPE)? as usize;
        let mut bytes = vec![0u8; len];
        let (n, done) = binary_read(v, 0, len, Some(&mut bytes));
        if n != len || !done || bytes.contains(&0) {
            return Err(E_DATA_TYPE);
        }
        Ok(bytes)
    }
}
