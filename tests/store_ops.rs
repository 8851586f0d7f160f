//! End-to-end store operations against a real on-disk database.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use relkv::{Attributes, QuerySpec, Store, StoreConfig, StoreError, TextSearch};
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> Store {
    Store::open(StoreConfig::new(dir.path().join("store.db"))).expect("store should open")
}

fn collect(keys: relkv::Keys) -> Vec<String> {
    keys.map(|k| k.expect("key row should decode"))
        .collect::<Vec<_>>()
}

fn index_entry(
    store: &Store,
    key: &str,
    sorter: &[u8],
    secondary: Option<&str>,
    tags: &[&str],
) {
    let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
    store
        .put_index_entry("docs", key, &Attributes::new(), Some(sorter), secondary, &tags)
        .expect("index entry should store");
}

#[test]
fn value_round_trip() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir);

    store
        .put_value("docs", "a", b"payload bytes")
        .expect("put should succeed");
    let got = store.get("docs", "a").expect("get should succeed");
    assert_eq!(got.as_deref(), Some(&b"payload bytes"[..]));

    assert_eq!(store.get("docs", "missing").expect("get should succeed"), None);
}

#[test]
fn second_put_replaces_first() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir);

    store.put_value("docs", "a", b"one").expect("first put");
    store.put_value("docs", "a", b"two").expect("second put");

    let got = store.get("docs", "a").expect("get should succeed");
    assert_eq!(got.as_deref(), Some(&b"two"[..]));
    let total = store
        .count("docs", &QuerySpec::default())
        .expect("count should succeed");
    assert_eq!(total, 1);
}

#[test]
fn tag_fan_out_and_tag_query() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir);

    for (key, tags) in [("a", &["red", "blue"][..]), ("b", &["red"]), ("c", &["green"])] {
        store.put_value("docs", key, key.as_bytes()).expect("put");
        index_entry(&store, key, key.as_bytes(), None, tags);
    }

    let spec = QuerySpec {
        tags: Some(vec!["red".to_string()]),
        ..QuerySpec::default()
    };
    assert_eq!(collect(store.query_all("docs", &spec).expect("query")), ["a", "b"]);
    assert_eq!(store.count("docs", &spec).expect("count"), 2);

    // Matching more than one tag still yields the key once.
    let spec = QuerySpec {
        tags: Some(vec!["red".to_string(), "blue".to_string()]),
        ..QuerySpec::default()
    };
    assert_eq!(collect(store.query_all("docs", &spec).expect("query")), ["a", "b"]);
}

#[test]
fn sorter_bounds_are_inclusive_and_sides_optional() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir);

    for key in ["a", "b", "c", "d", "e"] {
        store.put_value("docs", key, key.as_bytes()).expect("put");
        index_entry(&store, key, key.as_bytes(), None, &[]);
    }

    let spec = QuerySpec {
        min_sorter: Some(b"b".to_vec()),
        max_sorter: Some(b"d".to_vec()),
        ..QuerySpec::default()
    };
    assert_eq!(collect(store.query_all("docs", &spec).expect("query")), ["b", "c", "d"]);

    let min_only = QuerySpec {
        min_sorter: Some(b"d".to_vec()),
        ..QuerySpec::default()
    };
    assert_eq!(collect(store.query_all("docs", &min_only).expect("query")), ["d", "e"]);

    let max_only = QuerySpec {
        max_sorter: Some(b"b".to_vec()),
        ascending: Some(false),
        ..QuerySpec::default()
    };
    assert_eq!(collect(store.query_all("docs", &max_only).expect("query")), ["b", "a"]);
}

#[test]
fn secondary_key_narrows_with_other_predicates() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir);

    index_entry(&store, "a", b"1", Some("east"), &["hot"]);
    index_entry(&store, "b", b"2", Some("east"), &["cold"]);
    index_entry(&store, "c", b"3", Some("west"), &["hot"]);

    let by_sec = QuerySpec {
        secondary: Some("east".to_string()),
        ..QuerySpec::default()
    };
    assert_eq!(collect(store.query_all("docs", &by_sec).expect("query")), ["a", "b"]);

    let combined = QuerySpec {
        secondary: Some("east".to_string()),
        min_sorter: Some(b"1".to_vec()),
        max_sorter: Some(b"9".to_vec()),
        tags: Some(vec!["hot".to_string()]),
        ..QuerySpec::default()
    };
    assert_eq!(collect(store.query_all("docs", &combined).expect("query")), ["a"]);
    assert_eq!(store.count("docs", &combined).expect("count"), 1);
}

#[test]
fn pagination_window_offsets_into_the_result() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir);

    for i in 0..10 {
        let key = format!("k{i}");
        store.put_value("docs", &key, key.as_bytes()).expect("put");
    }

    let page = store
        .query("docs", &QuerySpec::default(), 2, 3)
        .expect("query");
    assert_eq!(collect(page), ["k2", "k3", "k4"]);

    // A window past the end is empty, not an error.
    let past = store
        .query("docs", &QuerySpec::default(), 50, 3)
        .expect("query");
    assert!(collect(past).is_empty());
}

#[test]
fn closed_cursor_releases_its_connection() {
    let dir = TempDir::new().expect("temp dir");
    let mut config = StoreConfig::new(dir.path().join("store.db"));
    config.pool.max_active = 1;
    config.pool.initial_size = 0;
    let store = Store::open(config).expect("store should open");

    for i in 0..5 {
        let key = format!("k{i}");
        store.put_value("docs", &key, key.as_bytes()).expect("put");
    }

    let mut keys = store.query_all("docs", &QuerySpec::default()).expect("query");
    assert_eq!(
        keys.next().map(|k| k.expect("key")),
        Some("k0".to_string())
    );
    keys.close();

    // With the single connection back in the pool, other work proceeds.
    let got = store.get("docs", "k1").expect("get after close");
    assert_eq!(got.as_deref(), Some(&b"k1"[..]));
}

#[test]
fn remove_clears_value_and_index_rows() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir);

    store.put_value("docs", "a", b"payload").expect("put");
    index_entry(&store, "a", b"1", None, &["red"]);

    store.remove("docs", "a").expect("remove");
    assert_eq!(store.get("docs", "a").expect("get"), None);
    let spec = QuerySpec {
        tags: Some(vec!["red".to_string()]),
        ..QuerySpec::default()
    };
    assert_eq!(store.count("docs", &spec).expect("count"), 0);

    // Removing again is a no-op.
    store.remove("docs", "a").expect("second remove");
}

#[test]
fn remove_all_truncates_the_index() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir);

    for key in ["a", "b"] {
        store.put_value("docs", key, key.as_bytes()).expect("put");
        index_entry(&store, key, key.as_bytes(), None, &["t"]);
    }
    store.remove_all("docs").expect("remove_all");

    assert_eq!(store.count("docs", &QuerySpec::default()).expect("count"), 0);
    let spec = QuerySpec {
        tags: Some(vec!["t".to_string()]),
        ..QuerySpec::default()
    };
    assert_eq!(store.count("docs", &spec).expect("count"), 0);
}

#[test]
fn indices_recovered_from_table_names() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir);

    store.put_value("people", "a", b"1").expect("put");
    store.put_value("orders", "b", b"2").expect("put");

    let names = store.indices().expect("indices");
    assert_eq!(names, ["orders", "people"]);
}

#[test]
fn reopening_finds_existing_tables() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("store.db");

    let store = Store::open(StoreConfig::new(&path)).expect("first open");
    store.put_value("docs", "a", b"payload").expect("put");
    drop(store);

    let store = Store::open(StoreConfig::new(&path)).expect("reopen");
    store.put_value("docs", "b", b"more").expect("put after reopen");
    assert_eq!(
        store.get("docs", "a").expect("get").as_deref(),
        Some(&b"payload"[..])
    );
}

#[test]
fn template_override_changes_query_shape() {
    let dir = TempDir::new().expect("temp dir");
    let mut props = BTreeMap::new();
    props.insert(
        "path".to_string(),
        dir.path().join("store.db").display().to_string(),
    );
    props.insert(
        "queries.selectAll".to_string(),
        "SELECT id FROM {index}_main ORDER BY id DESC".to_string(),
    );
    let store = Store::open_from_properties(&props).expect("store should open");

    for key in ["a", "b", "c"] {
        store.put_value("docs", key, key.as_bytes()).expect("put");
    }
    assert_eq!(
        collect(store.query_all("docs", &QuerySpec::default()).expect("query")),
        ["c", "b", "a"]
    );
}

#[test]
fn write_hooks_run_in_order_around_the_commit() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir);

    let events = RefCell::new(Vec::new());
    store
        .put_value_with_hooks(
            "docs",
            "a",
            b"payload",
            || events.borrow_mut().push("pre"),
            || events.borrow_mut().push("post"),
        )
        .expect("put with hooks");
    assert_eq!(*events.borrow(), ["pre", "post"]);

    store
        .remove_with_hook("docs", "a", || events.borrow_mut().push("removed"))
        .expect("remove with hook");
    assert_eq!(*events.borrow(), ["pre", "post", "removed"]);
}

struct FixedText;

impl TextSearch for FixedText {
    fn query(
        &self,
        _index: &str,
        _spec: &QuerySpec,
        from: u64,
        size: u64,
    ) -> relkv::Result<Vec<String>> {
        let all = ["x", "y", "z"];
        Ok(all
            .iter()
            .skip(from as usize)
            .take(size as usize)
            .map(|k| k.to_string())
            .collect())
    }

    fn count(&self, _index: &str, _spec: &QuerySpec) -> relkv::Result<u64> {
        Ok(3)
    }
}

#[test]
fn text_queries_dispatch_to_the_extension() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir);

    let spec = QuerySpec {
        text: Some("anything".to_string()),
        ..QuerySpec::default()
    };
    let err = store.query_all("docs", &spec).unwrap_err();
    assert!(matches!(err, StoreError::TextSearchUnavailable));

    let store = store.with_text_search(Arc::new(FixedText));
    assert_eq!(collect(store.query("docs", &spec, 1, 5).expect("query")), ["y", "z"]);
    assert_eq!(store.count("docs", &spec).expect("count"), 3);
}
