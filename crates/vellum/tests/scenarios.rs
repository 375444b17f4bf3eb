//! End-to-end scenarios driven through the registry with the native
//! script host.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use vellum::{
    ChangesQuery, Config, Error, Kind, MapEmit, NativeHost, NewLink, Registry, ScriptSpec,
    SourceKind, ViewParams, ViewQuery,
};

fn host() -> Arc<NativeHost> {
    Arc::new(
        NativeHost::new()
            .with_map("by_t", |doc| {
                doc.get("t")
                    .map(|t| {
                        vec![MapEmit {
                            key: t.clone(),
                            value: json!(1),
                        }]
                    })
                    .unwrap_or_default()
            })
            .with_map("city_of", |doc| {
                match (doc.get("city"), doc.get("name")) {
                    (Some(city), Some(name)) => vec![MapEmit {
                        key: city.clone(),
                        value: json!({ "name": name }),
                    }],
                    _ => vec![],
                }
            })
            .with_map("by_key", |doc| {
                doc.get("key")
                    .map(|key| {
                        vec![MapEmit {
                            key: key.clone(),
                            value: json!(1),
                        }]
                    })
                    .unwrap_or_default()
            })
            .with_sum_reduce("sum"),
    )
}

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn registry(dir: &TempDir) -> Registry {
    init_tracing();
    Registry::init_with_host(dir.path(), Config::default(), host()).unwrap()
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn keys(rows: &[vellum::ViewRow]) -> Vec<Value> {
    rows.iter().map(|r| r.key.clone()).collect()
}

#[test]
fn document_round_trip() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);
    let docs = reg.create_docs("notes").unwrap();

    let (id, rev1) = docs.create(json!({"x": 1}), None).unwrap();
    assert!(rev1.starts_with("1-"));
    assert_eq!(docs.read(&id).unwrap().body, json!({"x": 1}));

    let (_, rev2) = docs.update(&id, &rev1, json!({"x": 2})).unwrap();
    assert!(rev2.starts_with("2-"));

    assert!(matches!(
        docs.update(&id, &rev1, json!({"x": 3})),
        Err(Error::Conflict(_))
    ));

    let rev3 = docs.delete(&id, &rev2).unwrap();
    assert!(rev3.starts_with("3-"));
    let tombstone = docs.read(&id).unwrap();
    assert!(tombstone.deleted);
}

#[test]
fn view_map_without_reduce() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);
    let docs = reg.create_docs("notes").unwrap();
    let view = reg
        .create_view(
            "by-t",
            ViewParams {
                parent_kind: SourceKind::Docs,
                parent: "notes".into(),
                map: ScriptSpec::native("by_t"),
                reduce: None,
                output: None,
            },
        )
        .unwrap();

    docs.create(json!({"t": "a"}), Some("d1")).unwrap();
    docs.create(json!({"t": "b"}), Some("d2")).unwrap();
    let (_, rev3) = docs.create(json!({"t": "a"}), Some("d3")).unwrap();

    view.sync_now().unwrap();
    let rows = view.get_list(&ViewQuery::default()).unwrap();
    assert_eq!(keys(&rows), vec![json!("a"), json!("a"), json!("b")]);
    assert_eq!(view.get_total().unwrap(), 3);

    docs.delete("d3", &rev3).unwrap();
    view.sync_now().unwrap();
    let rows = view.get_list(&ViewQuery::default()).unwrap();
    assert_eq!(keys(&rows), vec![json!("a"), json!("b")]);
    assert_eq!(view.get_total().unwrap(), 2);
}

// A reduced view folds each key to one row and keeps folding as new
// writes arrive.
#[test]
fn view_map_reduce_sum() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);
    let docs = reg.create_docs("notes").unwrap();
    let view = reg
        .create_view(
            "t-count",
            ViewParams {
                parent_kind: SourceKind::Docs,
                parent: "notes".into(),
                map: ScriptSpec::native("by_t"),
                reduce: Some(ScriptSpec::native("sum")),
                output: None,
            },
        )
        .unwrap();

    docs.create(json!({"t": "a"}), None).unwrap();
    docs.create(json!({"t": "b"}), None).unwrap();
    docs.create(json!({"t": "a"}), None).unwrap();

    view.sync_now().unwrap();
    let rows = view.get_list(&ViewQuery::default()).unwrap();
    assert_eq!(rows.len(), 2, "one row per key after reduce");
    assert_eq!(rows[0].key, json!("a"));
    assert_eq!(rows[0].value, json!(2));
    assert_eq!(rows[1].key, json!("b"));
    assert_eq!(rows[1].value, json!(1));

    docs.create(json!({"t": "a"}), None).unwrap();
    view.sync_now().unwrap();
    let rows = view.get_list(&ViewQuery::default()).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].value, json!(3));
    assert_eq!(rows[1].value, json!(1));
}

// A view reading another view forms a pipeline.
#[test]
fn cascading_views() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);
    let docs = reg.create_docs("people").unwrap();
    reg.create_view(
        "cities",
        ViewParams {
            parent_kind: SourceKind::Docs,
            parent: "people".into(),
            map: ScriptSpec::native("city_of"),
            reduce: None,
            output: None,
        },
    )
    .unwrap();
    let counts = reg
        .create_view(
            "city-counts",
            ViewParams {
                parent_kind: SourceKind::View,
                parent: "cities".into(),
                map: ScriptSpec::native("by_key"),
                reduce: Some(ScriptSpec::native("sum")),
                output: None,
            },
        )
        .unwrap();

    for (name, city) in [
        ("ada", "paris"),
        ("ben", "rome"),
        ("cia", "paris"),
        ("dan", "paris"),
        ("eva", "rome"),
    ] {
        docs.create(json!({ "name": name, "city": city }), None)
            .unwrap();
    }

    reg.sync_all().unwrap();
    let rows = counts.get_list(&ViewQuery::default()).unwrap();
    assert_eq!(rows.len(), 2);
    let total: i64 = rows.iter().filter_map(|r| r.value.as_i64()).sum();
    assert_eq!(total, 5);
    assert_eq!(rows[0].key, json!("paris"));
    assert_eq!(rows[0].value, json!(3));
    assert_eq!(rows[1].key, json!("rome"));
    assert_eq!(rows[1].value, json!(2));
}

// The checker retires links whose context vanished.
#[test]
fn dangling_link_check() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);
    let docs = reg.create_docs("notes").unwrap();
    let links = reg.create_links("edges", "notes", true).unwrap();

    let (doc_id, doc_rev) = docs.create(json!({"x": 1}), None).unwrap();
    let (link_id, _) = links
        .create(NewLink::new(doc_id.clone(), "x", "local:other"))
        .unwrap();
    assert!(!links.read(&link_id).unwrap().deleted);

    docs.delete(&doc_id, &doc_rev).unwrap();
    links.check();
    wait_for("link check", || !links.is_checking());

    let link = links.read(&link_id).unwrap();
    assert!(link.deleted, "dangling link is tombstoned after check()");
}

// Compaction drops superseded revisions and keeps the head.
#[test]
fn compaction_preserves_latest() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);
    let docs = reg.create_docs("notes").unwrap();

    let (id, mut rev) = docs.create(json!({"n": 0}), None).unwrap();
    for n in 1..10 {
        let (_, next) = docs.update(&id, &rev, json!({ "n": n })).unwrap();
        rev = next;
    }
    for n in 1..=10 {
        assert!(docs.read_rev(&id, n).is_ok(), "rev {n} present pre-compact");
    }

    docs.compact();
    wait_for("compaction", || !docs.is_compacting());

    for n in 1..10 {
        assert!(
            matches!(docs.read_rev(&id, n), Err(Error::NotFound(_))),
            "rev {n} compacted away"
        );
    }
    let head = docs.read(&id).unwrap();
    assert_eq!(head.rev, 10);
    assert_eq!(head.body, json!({"n": 9}));
}

// The change feed pages by strictly increasing sequence numbers.
#[test]
fn change_feed_pages_by_seq() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);
    let docs = reg.create_docs("notes").unwrap();

    let empty = docs.changes(&ChangesQuery::since(0)).unwrap();
    assert!(empty.items.is_empty());
    assert_eq!(empty.last_seq, 0);

    for n in 0..3 {
        docs.create(json!({ "n": n }), None).unwrap();
    }
    let page = docs.changes(&ChangesQuery::since(0)).unwrap();
    assert_eq!(page.items.len(), 3);
    let seqs: Vec<u64> = page.items.iter().map(|i| i.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    let tail = docs.changes(&ChangesQuery::since(seqs[1])).unwrap();
    assert_eq!(tail.items.len(), 1);
    assert_eq!(tail.items[0].seq, seqs[2]);
}

// Long-poll: a blocked feed wakes on the next write.
#[test]
fn long_poll_wakes_on_write() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);
    let docs = reg.create_docs("notes").unwrap();

    let waiter = {
        let docs = docs.clone();
        std::thread::spawn(move || {
            docs.changes_wait(&ChangesQuery::since(0), Duration::from_secs(10))
                .unwrap()
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    docs.create(json!({"x": 1}), None).unwrap();

    let page = waiter.join().unwrap();
    assert_eq!(page.items.len(), 1);
}

// Continuous subscribers observe each committed write.
#[test]
fn subscribers_see_writes() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);
    let docs = reg.create_docs("notes").unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sub = {
        let seen = seen.clone();
        docs.subscribe(move |item| {
            seen.lock().unwrap().push(item.seq);
        })
    };
    docs.create(json!({"a": 1}), None).unwrap();
    docs.create(json!({"b": 2}), None).unwrap();
    docs.unsubscribe(sub);
    docs.create(json!({"c": 3}), None).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0] < seen[1]);
}

// A reduce-less view with an output collection forwards into it.
#[test]
fn output_collection_pipeline() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);
    let docs = reg.create_docs("people").unwrap();
    reg.create_docs("sink").unwrap();
    let view = reg
        .create_view(
            "forwarder",
            ViewParams {
                parent_kind: SourceKind::Docs,
                parent: "people".into(),
                map: ScriptSpec::native("city_of"),
                reduce: None,
                output: Some("sink".into()),
            },
        )
        .unwrap();

    docs.create(json!({"name": "ada", "city": "paris"}), None)
        .unwrap();
    view.sync_now().unwrap();

    let sink = reg.open_docs("sink").unwrap();
    assert_eq!(sink.count(vellum::CountType::Live).unwrap(), 1);

    // The view row records the forward response.
    let rows = view.get_list(&ViewQuery::default()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value["ok"], json!(true));
    let forwarded_id = rows[0].value["id"].as_str().unwrap();
    assert_eq!(
        sink.read(forwarded_id).unwrap().body,
        json!({"name": "ada"})
    );
}

// Deleting a document cascades into attachments and owned links.
#[test]
fn delete_cascades_to_dependents() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);
    let docs = reg.create_docs("notes").unwrap();
    let links = reg.create_links("edges", "notes", true).unwrap();
    let files = reg.create_attachments("files", "notes").unwrap();

    let (id, rev) = docs.create(json!({"x": 1}), None).unwrap();
    links
        .create(NewLink::new(id.clone(), "self", "local:x"))
        .unwrap();
    files.put(&id, "data.bin", "application/octet-stream", b"...").unwrap();

    docs.delete(&id, &rev).unwrap();

    assert_eq!(links.count(None, vellum::CountType::Live).unwrap(), 0);
    assert_eq!(links.count(None, vellum::CountType::Deleted).unwrap(), 1);
    assert!(files.get(&id, "data.bin").is_err());
}

// Registry restart resumes views from their persisted watermarks.
#[test]
fn restart_resumes_view_sync() {
    let dir = TempDir::new().unwrap();
    {
        let reg = registry(&dir);
        let docs = reg.create_docs("notes").unwrap();
        reg.create_view(
            "by-t",
            ViewParams {
                parent_kind: SourceKind::Docs,
                parent: "notes".into(),
                map: ScriptSpec::native("by_t"),
                reduce: None,
                output: None,
            },
        )
        .unwrap();
        docs.create(json!({"t": "a"}), None).unwrap();
        reg.sync("by-t").unwrap();
        reg.shutdown();
    }

    let reg = registry(&dir);
    let docs = reg.open_docs("notes").unwrap();
    docs.create(json!({"t": "b"}), None).unwrap();
    let view = reg.open_view("by-t").unwrap();
    view.sync_now().unwrap();
    let rows = view.get_list(&ViewQuery::default()).unwrap();
    assert_eq!(keys(&rows), vec![json!("a"), json!("b")]);
    assert_eq!(reg.list(Kind::Views), vec!["by-t".to_owned()]);
    assert_eq!(
        view.watermarks().unwrap().sync_map_id,
        docs.max_seq().unwrap(),
        "map watermark caught up to the parent"
    );
}
