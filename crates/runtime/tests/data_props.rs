//! Property tests over the data transfer codecs and collection ops.

use glas_runtime::Glas;
use proptest::prelude::*;
use serial_test::serial;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[serial]
    fn int_push_peek_round_trips_i64(n in any::<i64>()) {
        let mut g = Glas::new();
        prop_assert!(g.int_push(n));
        prop_assert_eq!(g.int_peek::<i64>(), Some(n));
    }

    #[serial]
    fn int_push_peek_round_trips_u64(n in any::<u64>()) {
        let mut g = Glas::new();
        prop_assert!(g.int_push(n));
        prop_assert_eq!(g.int_peek::<u64>(), Some(n));
    }

    #[serial]
    fn narrow_peeks_enforce_range(n in any::<i64>()) {
        let mut g = Glas::new();
        prop_assert!(g.int_push(n));
        let narrow = g.int_peek::<i8>();
        if (i8::MIN as i64..=i8::MAX as i64).contains(&n) {
            prop_assert_eq!(narrow, Some(n as i8));
        } else {
            prop_assert_eq!(narrow, None);
        }
    }

    #[serial]
    fn binary_round_trips(bytes in proptest::collection::vec(any::<u8>(), 0..200)) {
        let mut g = Glas::new();
        prop_assert!(g.binary_push(&bytes));
        prop_assert!(g.data_is_list());
        let mut out = vec![0u8; bytes.len()];
        let (n, done) = g.binary_peek(0, bytes.len(), Some(&mut out));
        prop_assert_eq!((n, done), (bytes.len(), true));
        prop_assert_eq!(out, bytes);
    }

    #[serial]
    fn chunked_peeks_reassemble(
        bytes in proptest::collection::vec(any::<u8>(), 1..150),
        chunk in 1usize..40,
    ) {
        let mut g = Glas::new();
        prop_assert!(g.binary_push(&bytes));
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let mut buf = vec![0u8; chunk];
            let (n, done) = g.binary_peek(offset, chunk, Some(&mut buf));
            out.extend_from_slice(&buf[..n]);
            offset += n;
            if done {
                break;
            }
            prop_assert!(n > 0, "no progress at offset {}", offset);
        }
        prop_assert_eq!(out, bytes);
    }

    #[serial]
    fn split_append_is_identity(
        bytes in proptest::collection::vec(any::<u8>(), 0..120),
        split in 0usize..121,
    ) {
        let split = split.min(bytes.len());
        let mut g = Glas::new();
        prop_assert!(g.binary_push(&bytes));
        prop_assert!(g.list_split_n(split));
        prop_assert!(g.list_append());
        let mut out = vec![0u8; bytes.len()];
        let (n, done) = g.binary_peek(0, bytes.len(), Some(&mut out));
        prop_assert_eq!((n, done), (bytes.len(), true));
        prop_assert_eq!(out, bytes);
    }

    #[serial]
    fn bits_round_trips(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let mut g = Glas::new();
        prop_assert!(g.bits_push(&bytes));
        prop_assert!(g.data_is_bitstr());
        let mut len = 0usize;
        prop_assert!(g.bits_len_peek(&mut len));
        prop_assert_eq!(len, bytes.len() * 8);
        let mut out = vec![0u8; bytes.len()];
        let (n, done) = g.bits_peek(0, bytes.len(), &mut out);
        prop_assert_eq!((n, done), (bytes.len(), true));
        prop_assert_eq!(out, bytes);
    }

    #[serial]
    fn bits_split_append_is_identity(
        bytes in proptest::collection::vec(any::<u8>(), 1..32),
        cut in 0usize..256,
    ) {
        let cut = cut.min(bytes.len() * 8);
        let mut g = Glas::new();
        prop_assert!(g.bits_push(&bytes));
        prop_assert!(g.bits_split_n(cut));
        prop_assert!(g.bits_append());
        let mut out = vec![0u8; bytes.len()];
        let (n, done) = g.bits_peek(0, bytes.len(), &mut out);
        prop_assert_eq!((n, done), (bytes.len(), true));
        prop_assert_eq!(out, bytes);
    }

    #[serial]
    fn mk_un_primitives_invert(tag in any::<bool>(), byte in any::<u8>()) {
        let mut g = Glas::new();
        prop_assert!(g.int_push(byte));
        if tag {
            prop_assert!(g.mkr());
            prop_assert!(g.data_is_inr());
            prop_assert!(!g.data_is_inl());
            prop_assert!(g.unr());
        } else {
            prop_assert!(g.mkl());
            prop_assert!(g.data_is_inl());
            prop_assert!(g.unl());
        }
        prop_assert_eq!(g.int_peek::<u8>(), Some(byte));
    }

    #[serial]
    fn pairs_build_and_split(a in any::<i64>(), b in any::<i64>()) {
        let mut g = Glas::new();
        prop_assert!(g.int_push(a));
        prop_assert!(g.int_push(b));
        prop_assert!(g.mkp());
        prop_assert!(g.data_is_pair());
        prop_assert!(!g.data_is_unit());
        prop_assert!(g.unp());
        prop_assert_eq!(g.int_peek::<i64>(), Some(b));
        prop_assert!(g.data_drop(1));
        prop_assert_eq!(g.int_peek::<i64>(), Some(a));
    }
}

#[test]
#[serial]
fn dict_stack_ops_round_trip() {
    let mut g = Glas::new();
    // Item Record Label -- Record'
    assert!(g.int_push(42i64));
    assert!(g.binary_push(&[])); // empty record: unit
    assert!(g.data_is_unit());
    assert!(g.binary_push(b"key"));
    assert!(g.dict_insert());
    assert_eq!(g.data_depth(), 1);
    assert!(g.data_is_dict());
    assert!(!g.data_is_ratio());
    // Record -- Item Record'
    assert!(g.dict_remove_l("key"));
    assert!(g.data_is_unit());
    assert!(g.data_drop(1));
    assert_eq!(g.int_peek::<i64>(), Some(42));
    // removing from the now-empty dict fails without flags
    let flags = g.error_get();
    assert!(g.binary_push(&[]));
    assert!(!g.dict_remove_l("key"));
    assert_eq!(g.error_get(), flags);
}

#[test]
#[serial]
fn ratio_predicate_sees_n_and_d() {
    let mut g = Glas::new();
    assert!(g.int_push(3i64));
    assert!(g.binary_push(&[]));
    assert!(g.binary_push(b"n"));
    assert!(g.dict_insert());
    assert!(g.int_push(4i64));
    assert!(g.data_swap());
    assert!(g.binary_push(b"d"));
    assert!(g.dict_insert());
    assert!(g.data_is_dict());
    assert!(g.data_is_ratio());
}
