use std::io::Write;

use proptest::prelude::*;
use verifier::{
    verify_bytes, verify_file, verify_path, verify_string, Counting, GcPolicy, Heap, Host, Linked,
};

const EMPTY_MODULE: &[u8] = b"\0asm\x01\0\0\0";

fn through_heap(heap: &mut Heap, native: &Counting<Linked>, bytes: &[u8]) -> Option<Vec<u8>> {
    let data = heap.alloc_string(bytes).unwrap();
    let out = verify_string(heap, native, data).unwrap();
    heap.read_optional_string(out).unwrap().map(<[u8]>::to_vec)
}

#[test]
fn concrete_scenarios() {
    assert!(verify_bytes(&[]).is_some());
    assert!(verify_bytes(EMPTY_MODULE).is_none());

    let diag = verify_path("/nonexistent/path.wasm").unwrap();
    assert!(!diag.as_str().is_empty());
}

#[test]
fn file_and_buffer_entry_points_agree() {
    let module = wat::parse_str(
        r#"(module
            (global $g (mut i32) (i32.const 0))
            (func (export "bump")
                global.get $g
                i32.const 1
                i32.add
                global.set $g))"#,
    )
    .unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&module).unwrap();

    assert!(verify_bytes(&module).is_none());
    assert!(verify_path(file.path()).is_none());

    let mut heap = Heap::with_policy(GcPolicy::stress());
    let native = Counting::new(Linked);
    let path = heap
        .alloc_string(file.path().to_str().unwrap().as_bytes())
        .unwrap();
    let out = verify_file(&mut heap, &native, path).unwrap();
    assert_eq!(heap.read_optional_string(out).unwrap(), None);
}

#[test]
fn truncated_file_is_reported() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&EMPTY_MODULE[..4]).unwrap();

    let from_path = verify_path(file.path()).unwrap();
    let from_bytes = verify_bytes(&EMPTY_MODULE[..4]).unwrap();
    assert_eq!(from_path, from_bytes);
}

#[test]
fn heap_stays_small_across_many_calls() {
    let mut heap = Heap::with_policy(GcPolicy::new(8));
    let native = Counting::new(Linked);
    for _ in 0..100 {
        through_heap(&mut heap, &native, b"garbage");
    }
    assert_eq!(heap.roots_len(), 0);
    assert!(heap.live_objects() <= 8 + 3);
    assert!(heap.stats().collections > 0);
    assert_eq!(native.allocated(), 100);
    assert_eq!(native.released(), 100);
}

proptest! {
    #[test]
    fn verification_is_idempotent(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let mut heap = Heap::with_policy(GcPolicy::stress());
        let native = Counting::new(Linked);
        let first = through_heap(&mut heap, &native, &bytes);
        let second = through_heap(&mut heap, &native, &bytes);
        prop_assert_eq!(first, second);
        prop_assert_eq!(native.allocated(), native.released());
        prop_assert_eq!(native.rejected(), 0);
    }

    #[test]
    fn header_prefixed_bytes_never_leak(tail in proptest::collection::vec(any::<u8>(), 0..32)) {
        let mut bytes = EMPTY_MODULE.to_vec();
        bytes.extend_from_slice(&tail);
        let mut heap = Heap::with_policy(GcPolicy::stress());
        let native = Counting::new(Linked);
        let out = through_heap(&mut heap, &native, &bytes);
        prop_assert_eq!(out.is_some(), verify_bytes(&bytes).is_some());
        prop_assert_eq!(native.outstanding(), 0);
        prop_assert_eq!(heap.roots_len(), 0);
    }
}
