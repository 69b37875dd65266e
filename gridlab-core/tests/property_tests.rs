//! Property tests for data-plane invariants.
//!
//! Uses proptest to verify:
//! 1. Checksum determinism: identical payloads fingerprint identically,
//!    compressed or not
//! 2. FIFO eviction: a bounded cache keeps exactly the newest `cap` keys
//! 3. `first_present`: returns the first non-null synonym, and is unaffected
//!    by absent keys

use gridlab_core::data::mock::gzip_bytes;
use gridlab_core::data::{decode, first_present, ResultCache, Row, Value};
use proptest::prelude::*;

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_cell() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z]{1,6}",
        (0..10_000i32).prop_map(|n| n.to_string()),
        Just(String::new()),
        Just("NA".to_string()),
    ]
}

fn arb_table() -> impl Strategy<Value = String> {
    (1usize..6).prop_flat_map(|cols| {
        prop::collection::vec(prop::collection::vec(arb_cell(), cols), 0..20).prop_map(move |rows| {
            let header: Vec<String> = (0..cols).map(|c| format!("col{c}")).collect();
            let mut text = header.join(",");
            text.push('\n');
            for row in rows {
                text.push_str(&row.join(","));
                text.push('\n');
            }
            text
        })
    })
}

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        (-100i32..100).prop_map(|n| Value::Number(n as f64)),
        "[a-z]{1,4}".prop_map(Value::Text),
    ]
}

fn arb_row() -> impl Strategy<Value = Row> {
    prop::collection::btree_map("[a-e]", arb_value(), 0..5)
}

// ── 1. Checksum determinism ──────────────────────────────────────────

proptest! {
    #[test]
    fn decode_is_deterministic(table in arb_table()) {
        let a = decode("https://dl.test/t.csv", table.as_bytes()).unwrap();
        let b = decode("https://dl.test/t.csv", table.as_bytes()).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.checksum.len(), 64);
    }

    #[test]
    fn compression_does_not_change_fingerprint(table in arb_table()) {
        let plain = decode("https://dl.test/t.csv", table.as_bytes()).unwrap();
        let packed = decode("https://dl.test/t.csv.gz", &gzip_bytes(table.as_bytes())).unwrap();
        prop_assert_eq!(plain, packed);
    }
}

// ── 2. FIFO eviction ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn bounded_cache_keeps_newest_keys(cap in 1usize..8, inserts in 1usize..30) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let keys = runtime.block_on(async {
            let cache: ResultCache<usize, usize> = ResultCache::bounded("prop", cap);
            for key in 0..inserts {
                cache.get_or_load(key, move || async move { Ok(key * 2) }).await.unwrap();
            }
            cache.keys()
        });

        let expected: Vec<usize> = (inserts.saturating_sub(cap)..inserts).collect();
        prop_assert_eq!(keys, expected);
    }
}

// ── 3. first_present laws ────────────────────────────────────────────

proptest! {
    #[test]
    fn first_present_returns_first_non_null(row in arb_row(), keys in prop::collection::vec("[a-g]", 0..5)) {
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let expected = key_refs
            .iter()
            .find_map(|k| row.get(*k).filter(|v| !v.is_null()));
        prop_assert_eq!(first_present(&row, &key_refs), expected);
    }

    #[test]
    fn absent_keys_do_not_matter(row in arb_row(), keys in prop::collection::vec("[a-e]", 0..5)) {
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let mut padded = vec!["zz_missing"];
        padded.extend(key_refs.iter().copied());
        prop_assert_eq!(first_present(&row, &padded), first_present(&row, &key_refs));
    }

    #[test]
    fn no_keys_means_nothing(row in arb_row()) {
        prop_assert_eq!(first_present(&row, &[]), None);
    }
}
