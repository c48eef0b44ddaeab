//! Behaviour suite for [`StorageBackend`] implementations.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tessera_domain::sort::parse_sort;
use tessera_domain::{Condition, Epoch, Filter, Object, Pagination, Path};
use tessera_storage::{
    CountOptions, Inclusion, ListOptions, StorageBackend, StorageError, StorageTransaction,
};

pub type Tx = Box<dyn StorageTransaction>;

/// Opens a transaction on an empty store.
pub async fn begin(backend: &dyn StorageBackend) -> Tx {
    let mut tx = backend.begin().await.expect("begin");
    tx.flush().await.expect("flush");
    tx
}

pub fn object(doc: Value) -> Object {
    Object::from_value(doc).expect("valid document")
}

pub async fn create(tx: &mut Tx, ns: &str, doc: Value) -> Object {
    let mut obj = object(doc);
    tx.create(&Path::new(ns), &mut obj).await.expect("create");
    obj
}

async fn must_delete(tx: &mut Tx, path: &str) -> Object {
    tx.delete(&Path::new(path)).await.expect("delete")
}

async fn num_entries(tx: &mut Tx) -> i64 {
    tx.num_entries().await.expect("num_entries")
}

fn ids(objs: &[Object]) -> Vec<String> {
    objs.iter().map(|o| o.id.clone()).collect()
}

fn etoa(epoch: Epoch) -> String {
    epoch.0.to_string()
}

/// Seeds two objects under `/objects/*`, `EPR.ID` first.
pub async fn std_seeds(tx: &mut Tx) -> (Object, Object) {
    let o1 = create(
        tx,
        "/objects/*",
        json!({
            "ary": ["x", 7, null, false, {"z": 8}],
            "mix": "val",
            "non": false,
            "num": 33,
            "str": "k",
            "sub": {"num": 11, "ok": true},
            "yes": true
        }),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(3)).await;
    let o2 = create(
        tx,
        "/objects/*",
        json!({
            "mix": true,
            "num": 66.0,
            "sub": {"ok": true}
        }),
    )
    .await;
    (o1, o2)
}

/// IDs of `/objects/*` listed with `opts`, in result order.
pub async fn list_scope(tx: &mut Tx, opts: ListOptions) -> Vec<String> {
    let objs = tx
        .list_all(&Path::new("/objects/*"), &opts)
        .await
        .expect("list_all");
    ids(&objs)
}

/// IDs matching a single filter, sorted.
pub async fn filter_scope(tx: &mut Tx, field: &str, value: &str) -> Vec<String> {
    let mut ids = list_scope(
        tx,
        ListOptions {
            condition: vec![Filter::parse(field, value)],
            ..Default::default()
        },
    )
    .await;
    ids.sort();
    ids
}

pub async fn sort_scope(tx: &mut Tx, order: &str) -> Vec<String> {
    list_scope(
        tx,
        ListOptions {
            sort: parse_sort(order),
            ..Default::default()
        },
    )
    .await
}

async fn paginate(tx: &mut Tx, pagination: Vec<Condition>) -> Vec<String> {
    let mut ids = list_scope(
        tx,
        ListOptions {
            pagination,
            ..Default::default()
        },
    )
    .await;
    ids.sort();
    ids
}

fn cond(pairs: &[(&str, &str)]) -> Condition {
    pairs.iter().map(|(k, v)| Filter::parse(k, v)).collect()
}

const NONE: [&str; 0] = [];
const BOTH: [&str; 2] = ["EPR.ID", "ITR.ID"];
const EPR: [&str; 1] = ["EPR.ID"];
const ITR: [&str; 1] = ["ITR.ID"];

// ============================================================================
// Basics
// ============================================================================

pub async fn pings(backend: &dyn StorageBackend) {
    backend.ping().await.unwrap();
}

pub async fn flushes(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    create(&mut tx, "/objects/*", json!({})).await;
    assert_eq!(num_entries(&mut tx).await, 1);

    tx.flush().await.unwrap();
    assert_eq!(num_entries(&mut tx).await, 0);
    tx.flush().await.unwrap();
    assert_eq!(num_entries(&mut tx).await, 0);
    tx.rollback().await.unwrap();
}

pub async fn gets_mod_times(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;

    // Test: only node paths are accepted
    let err = tx.mod_time(&Path::new("/objects/foo")).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidPath { .. }));

    let ns = Path::new("/objects/*");
    assert_eq!(tx.mod_time(&ns).await.unwrap(), Epoch::ZERO);

    let o1 = create(&mut tx, "/objects/*", json!({})).await;
    assert_eq!(tx.mod_time(&ns).await.unwrap(), o1.mod_time);
    assert_eq!(tx.mod_time(&ns).await.unwrap(), o1.mod_time);

    let o2 = must_delete(&mut tx, "/objects/EPR.ID").await;
    assert!(o2.mod_time > o1.mod_time);
    assert_eq!(tx.mod_time(&ns).await.unwrap(), o2.mod_time);
    tx.rollback().await.unwrap();
}

pub async fn checks_existence(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    create(&mut tx, "/objects/*", json!({})).await;

    assert!(tx.exists(&Path::new("/objects/EPR.ID")).await.unwrap());
    assert!(!tx.exists(&Path::new("/objects/missing")).await.unwrap());
    assert!(matches!(
        tx.exists(&Path::new("/objects/*")).await,
        Err(StorageError::InvalidPath { .. })
    ));
    tx.rollback().await.unwrap();
}

pub async fn gets_objects(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    let o1 = create(&mut tx, "/objects/*", json!({})).await;

    let o2 = tx.get(&Path::new("/objects/EPR.ID")).await.unwrap();
    assert_eq!(o2.id, o1.id);
    assert_eq!(o2.mod_time, o1.mod_time);
    assert!(o2.extra.is_empty());
    assert!(!o2.deleted);

    assert!(matches!(
        tx.get(&Path::new("/objects/*")).await,
        Err(StorageError::InvalidPath { .. })
    ));
    assert!(tx
        .get(&Path::new("/objects/missing-id"))
        .await
        .unwrap_err()
        .is_not_found());
    tx.rollback().await.unwrap();
}

pub async fn gets_objects_for_update(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    let o1 = create(&mut tx, "/objects/*", json!({"a": 1})).await;

    let handle = tx.get_for_update(&Path::new("/objects/EPR.ID")).await.unwrap();
    assert_eq!(handle.path().as_str(), "/objects/EPR.ID");
    assert_eq!(handle.object(), &o1);

    assert!(matches!(
        tx.get_for_update(&Path::new("/objects/*")).await,
        Err(StorageError::InvalidPath { .. })
    ));
    assert!(tx
        .get_for_update(&Path::new("/objects/missing-id"))
        .await
        .unwrap_err()
        .is_not_found());
    tx.rollback().await.unwrap();
}

pub async fn creates_objects(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;

    // Test: only node paths are accepted
    let mut leaf = Object::default();
    assert!(matches!(
        tx.create(&Path::new("/objects/foo"), &mut leaf).await,
        Err(StorageError::InvalidPath { .. })
    ));

    let o1 = create(&mut tx, "/objects/*", json!({})).await;
    assert_eq!(o1.id, "EPR.ID");
    assert!((Epoch::now().0 - o1.mod_time.0).abs() < 1000);
    assert!(o1.extra.is_empty());
    assert_eq!(num_entries(&mut tx).await, 1);
    assert_eq!(tx.mod_time(&Path::new("/objects/*")).await.unwrap(), o1.mod_time);

    // Test: a live ID cannot be created twice
    let mut o2 = Object::new("EPR.ID");
    let err = tx.create(&Path::new("/objects/*"), &mut o2).await.unwrap_err();
    assert!(matches!(err, StorageError::ObjectExists { ref path } if path == "/objects/EPR.ID"));

    // Test: a deleted ID can be created again
    must_delete(&mut tx, "/objects/EPR.ID").await;
    assert_eq!(num_entries(&mut tx).await, 0);

    tx.create(&Path::new("/objects/*"), &mut o2).await.unwrap();
    assert_eq!(num_entries(&mut tx).await, 1);
    assert!(o2.mod_time > o1.mod_time);
    assert!(!o2.deleted);
    tx.rollback().await.unwrap();
}

pub async fn creates_in_parallel(backend: Arc<dyn StorageBackend>) {
    let mut tx = begin(backend.as_ref()).await;
    tx.commit().await.unwrap();

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move {
                let mut tx = backend.begin().await.unwrap();
                for _ in 0..20 {
                    let mut obj = Object::default();
                    tx.create(&Path::new("/objects/*"), &mut obj).await.unwrap();
                }
                tx.commit().await.unwrap();
            })
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        handle.unwrap();
    }

    let mut tx = backend.begin().await.unwrap();
    let objs = tx
        .list_all(&Path::new("/objects/*"), &ListOptions::default())
        .await
        .unwrap();
    assert_eq!(objs.len(), 100);

    tx.flush().await.unwrap();
    tx.commit().await.unwrap();

    // Test: every create got its own epoch
    let epochs: HashSet<Epoch> = objs.iter().map(|o| o.mod_time).collect();
    assert_eq!(epochs.len(), 100);
}

pub async fn updates_objects(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    let obj = create(&mut tx, "/objects/*", json!({"a": 1})).await;
    let path = Path::new("/objects/EPR.ID");

    let mut h1 = tx.get_for_update(&path).await.unwrap();
    h1.object_mut().update(object(json!({"b": 2})));
    tx.update(&mut h1).await.unwrap();
    assert_eq!(num_entries(&mut tx).await, 1);

    let o1 = tx.get(&path).await.unwrap();
    assert!(o1.mod_time > obj.mod_time);
    assert_eq!(o1.mod_time, h1.object().mod_time);
    assert_eq!(Value::Object(o1.extra.clone()), json!({"b": 2}));

    // Test: timestamps always increment
    let mut h2 = tx.get_for_update(&path).await.unwrap();
    tx.update(&mut h2).await.unwrap();
    assert_eq!(num_entries(&mut tx).await, 1);

    let o2 = tx.get(&path).await.unwrap();
    assert!(o2.mod_time > o1.mod_time);
    tx.rollback().await.unwrap();
}

pub async fn deletes_objects(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    let o1 = create(&mut tx, "/objects/*", json!({"meta": true})).await; // EPR.ID
    create(&mut tx, "/objects/*", json!({})).await; // ITR.ID
    create(&mut tx, "/objects/*", json!({"id": "EPR.IDX"})).await;
    let n1 = create(&mut tx, "/objects/EPR.ID/nested/*", json!({})).await;
    create(&mut tx, "/objects/EPR.ID/nested/*", json!({})).await;
    create(&mut tx, "/objects/OTHER/nested/*", json!({})).await;

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(num_entries(&mut tx).await, 6);

    assert!(tx
        .delete(&Path::new("/objects/unknown"))
        .await
        .unwrap_err()
        .is_not_found());

    // Test: nested objects survive when the exact object is missing
    assert!(tx
        .delete(&Path::new("/objects/OTHER"))
        .await
        .unwrap_err()
        .is_not_found());
    assert_eq!(num_entries(&mut tx).await, 6);

    assert!(matches!(
        tx.delete(&Path::new("/objects/*")).await,
        Err(StorageError::InvalidPath { .. })
    ));

    // Test: deleting EPR.ID takes its two nested objects but not EPR.IDX
    let d1 = must_delete(&mut tx, "/objects/EPR.ID").await;
    assert!(d1.mod_time > o1.mod_time);
    assert!(d1.deleted);
    assert_eq!(Value::Object(d1.extra.clone()), json!({"meta": true}));
    assert_eq!(num_entries(&mut tx).await, 3);
    assert!(tx.exists(&Path::new("/objects/EPR.IDX")).await.unwrap());

    assert_eq!(tx.mod_time(&Path::new("/objects/*")).await.unwrap(), d1.mod_time);
    assert!(tx.mod_time(&Path::new("/objects/EPR.ID/nested/*")).await.unwrap() > n1.mod_time);

    // Test: tombstones are retained
    let all = tx
        .list_all(
            &Path::new("/objects/*"),
            &ListOptions {
                include: Inclusion::All,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.contains(&d1));
    tx.rollback().await.unwrap();
}

async fn seed_parents(tx: &mut Tx) {
    create(tx, "/parents/a/objects/*", json!({})).await;
    create(tx, "/parents/a/objects/*", json!({"x": 11, "y": 33})).await;
    create(tx, "/parents/b/objects/*", json!({"x": "v", "y": 22})).await;
    create(tx, "/others/*", json!({})).await;
}

async fn list_len(tx: &mut Tx, path: &str, opts: ListOptions) -> usize {
    tx.list_all(&Path::new(path), &opts).await.expect("list_all").len()
}

pub async fn counts_objects(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    seed_parents(&mut tx).await;

    let count = |cond: Condition| CountOptions { condition: cond };
    assert!(matches!(
        tx.count_all(&Path::new("/objects/foo"), &count(vec![])).await,
        Err(StorageError::InvalidPath { .. })
    ));

    assert_eq!(tx.count_all(&Path::new("/parents/a/objects/*"), &count(vec![])).await.unwrap(), 2);
    assert_eq!(tx.count_all(&Path::new("/objects/*"), &count(vec![])).await.unwrap(), 0);
    assert_eq!(tx.count_all(&Path::new("/parents/x/objects/*"), &count(vec![])).await.unwrap(), 0);
    assert_eq!(tx.count_all(&Path::new("/parents/a/unknowns/*"), &count(vec![])).await.unwrap(), 0);
    assert_eq!(
        tx.count_all(&Path::new("/parents/a/objects/*"), &count(cond(&[("has_x", "true")])))
            .await
            .unwrap(),
        1
    );
    tx.rollback().await.unwrap();
}

pub async fn lists_objects(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    seed_parents(&mut tx).await;

    assert!(matches!(
        tx.list_all(&Path::new("/objects/foo"), &ListOptions::default()).await,
        Err(StorageError::InvalidPath { .. })
    ));

    assert_eq!(list_len(&mut tx, "/parents/a/objects/*", ListOptions::default()).await, 2);
    assert_eq!(list_len(&mut tx, "/objects/*", ListOptions::default()).await, 0);
    assert_eq!(list_len(&mut tx, "/parents/x/objects/*", ListOptions::default()).await, 0);
    assert_eq!(list_len(&mut tx, "/parents/a/unknowns/*", ListOptions::default()).await, 0);

    let limited = ListOptions {
        limit: 1,
        ..Default::default()
    };
    assert_eq!(list_len(&mut tx, "/parents/a/objects/*", limited).await, 1);

    let filtered = ListOptions {
        condition: cond(&[("has_x", "true")]),
        ..Default::default()
    };
    assert_eq!(list_len(&mut tx, "/parents/a/objects/*", filtered).await, 1);
    tx.rollback().await.unwrap();
}

pub async fn deletes_multiple_objects(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    create(&mut tx, "/objects/*", json!({"meta": true})).await; // EPR.ID
    create(&mut tx, "/objects/*", json!({})).await; // ITR.ID
    let o2 = create(&mut tx, "/objects/*", json!({})).await; // MXR.ID
    create(&mut tx, "/others/*", json!({})).await; // Q3R.ID
    create(&mut tx, "/objects/*", json!({"id": "EPR.IDX"})).await;
    create(&mut tx, "/objects/MXR.ID/nested/*", json!({})).await;
    create(&mut tx, "/objects/MXR.ID/nested/*", json!({})).await;
    create(&mut tx, "/objects/OTHER/nested/*", json!({})).await;

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(num_entries(&mut tx).await, 8);

    // Test: missing and node paths are skipped
    let (epoch, deleted) = tx.delete_all(&[Path::new("/objects/foo")]).await.unwrap();
    assert_eq!(epoch, Epoch::ZERO);
    assert!(deleted.is_empty());
    let (epoch, _) = tx.delete_all(&[Path::new("/objects/*")]).await.unwrap();
    assert_eq!(epoch, Epoch::ZERO);
    assert_eq!(num_entries(&mut tx).await, 8);

    // Test: nested objects go even when the exact one is missing
    let (epoch, deleted) = tx.delete_all(&[Path::new("/objects/OTHER")]).await.unwrap();
    assert_eq!(epoch, Epoch::ZERO);
    assert!(deleted.is_empty());
    assert_eq!(num_entries(&mut tx).await, 7);

    let (mod_time1, deleted) = tx
        .delete_all(&[
            Path::new("/objects/ITR.ID"),
            Path::new("/objects/MISSING"),
            Path::new("/objects/MXR.ID"),
            Path::new("/objects/Q3R.ID"),
        ])
        .await
        .unwrap();
    assert!(mod_time1 > o2.mod_time);
    assert_eq!(deleted, vec![Path::new("/objects/ITR.ID"), Path::new("/objects/MXR.ID")]);
    assert_eq!(num_entries(&mut tx).await, 3);

    let (mod_time2, _) = tx.delete_all(&[Path::new("/objects/EPR.ID")]).await.unwrap();
    assert!(mod_time2 > mod_time1);
    assert_eq!(num_entries(&mut tx).await, 2);
    assert_eq!(tx.mod_time(&Path::new("/objects/*")).await.unwrap(), mod_time2);

    let all = tx
        .list_all(
            &Path::new("/objects/*"),
            &ListOptions {
                include: Inclusion::All,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(all.len(), 4);
    let mut expected = object(json!({"id": "EPR.ID", "meta": true}));
    expected.mod_time = mod_time2;
    expected.deleted = true;
    assert!(all.contains(&expected));
    tx.rollback().await.unwrap();
}

pub async fn deletes_orphaned_nested_objects(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    create(&mut tx, "/ghost/x/nested/*", json!({})).await;
    create(&mut tx, "/ghost/y/nested/*", json!({})).await;
    assert_eq!(num_entries(&mut tx).await, 2);

    // Test: neither /ghost nor /ghost/x holds an object
    let (epoch, deleted) = tx.delete_all(&[Path::new("/ghost/x")]).await.unwrap();
    assert_eq!(epoch, Epoch::ZERO);
    assert!(deleted.is_empty());
    assert_eq!(num_entries(&mut tx).await, 1);
    let all = CountOptions::default();
    assert_eq!(tx.count_all(&Path::new("/ghost/x/nested/*"), &all).await.unwrap(), 0);
    assert_eq!(tx.count_all(&Path::new("/ghost/y/nested/*"), &all).await.unwrap(), 1);

    // Test: a single delete still requires the object itself
    let err = tx.delete(&Path::new("/ghost/y")).await.unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    assert_eq!(num_entries(&mut tx).await, 1);
    tx.rollback().await.unwrap();
}

pub async fn purges_deleted(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    create(&mut tx, "/objects/*", json!({})).await;
    must_delete(&mut tx, "/objects/EPR.ID").await;

    tokio::time::sleep(Duration::from_millis(3)).await;
    let t1 = Epoch::now();

    create(&mut tx, "/objects/*", json!({})).await;
    must_delete(&mut tx, "/objects/ITR.ID").await;
    create(&mut tx, "/objects/*", json!({})).await;
    must_delete(&mut tx, "/objects/MXR.ID").await;

    let include_all = || ListOptions {
        include: Inclusion::All,
        ..Default::default()
    };
    assert_eq!(list_scope(&mut tx, include_all()).await.len(), 3);

    // Test: only tombstones older than the cutoff go
    assert_eq!(tx.purge(t1).await.unwrap(), 1);
    assert_eq!(list_scope(&mut tx, include_all()).await.len(), 2);

    assert_eq!(tx.purge(Epoch::ZERO).await.unwrap(), 2);
    assert!(list_scope(&mut tx, include_all()).await.is_empty());
    assert_eq!(tx.purge(Epoch::ZERO).await.unwrap(), 0);
    assert_eq!(num_entries(&mut tx).await, 0);
    tx.rollback().await.unwrap();
}

pub async fn rolls_back(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    create(&mut tx, "/objects/*", json!({})).await;
    tx.commit().await.unwrap();

    let mut tx = backend.begin().await.unwrap();
    create(&mut tx, "/objects/*", json!({})).await;
    must_delete(&mut tx, "/objects/EPR.ID").await;
    tx.rollback().await.unwrap();

    let mut tx = backend.begin().await.unwrap();
    assert_eq!(num_entries(&mut tx).await, 1);
    assert!(tx.exists(&Path::new("/objects/EPR.ID")).await.unwrap());
    assert!(!tx.exists(&Path::new("/objects/ITR.ID")).await.unwrap());
    tx.flush().await.unwrap();
    tx.commit().await.unwrap();
}

pub async fn rejects_reuse(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    tx.commit().await.unwrap();

    let node = Path::new("/objects/*");
    assert!(matches!(tx.commit().await, Err(StorageError::TxDone)));
    assert!(matches!(tx.rollback().await, Err(StorageError::TxDone)));
    assert!(matches!(tx.flush().await, Err(StorageError::TxDone)));
    assert!(matches!(tx.get(&Path::new("/objects/x")).await, Err(StorageError::TxDone)));
    assert!(matches!(
        tx.create(&node, &mut Object::default()).await,
        Err(StorageError::TxDone)
    ));
    assert!(matches!(
        tx.list_all(&node, &ListOptions::default()).await,
        Err(StorageError::TxDone)
    ));
    assert!(matches!(tx.num_entries().await, Err(StorageError::TxDone)));

    let mut tx = backend.begin().await.unwrap();
    tx.rollback().await.unwrap();
    assert!(matches!(tx.rollback().await, Err(StorageError::TxDone)));
}

// ============================================================================
// Listing
// ============================================================================

pub async fn lists_by_inclusion(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    let (_, o2) = std_seeds(&mut tx).await;
    must_delete(&mut tx, &format!("/objects/{}", o2.id)).await;

    assert_eq!(list_scope(&mut tx, ListOptions::default()).await, EPR);

    let mut all = list_scope(
        &mut tx,
        ListOptions {
            include: Inclusion::All,
            ..Default::default()
        },
    )
    .await;
    all.sort();
    assert_eq!(all, BOTH);
    tx.rollback().await.unwrap();
}

pub async fn sorts(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    std_seeds(&mut tx).await;
    let asc = ["EPR.ID", "ITR.ID"];
    let desc = ["ITR.ID", "EPR.ID"];

    assert_eq!(sort_scope(&mut tx, "id").await, asc);
    assert_eq!(sort_scope(&mut tx, "-id").await, desc);
    assert_eq!(sort_scope(&mut tx, "last_modified").await, asc);
    assert_eq!(sort_scope(&mut tx, "-last_modified").await, desc);
    assert_eq!(sort_scope(&mut tx, "num").await, asc);
    assert_eq!(sort_scope(&mut tx, "-num").await, desc);
    assert_eq!(sort_scope(&mut tx, "str").await, asc);
    assert_eq!(sort_scope(&mut tx, "-str").await, desc);

    // Test: missing values sort after present ones
    assert_eq!(sort_scope(&mut tx, "sub.num").await, asc);
    assert_eq!(sort_scope(&mut tx, "-sub.num").await, desc);

    // Test: mixed types order consistently in both directions
    let mix = sort_scope(&mut tx, "mix").await;
    let mut rev = sort_scope(&mut tx, "-mix").await;
    rev.reverse();
    assert_eq!(mix, rev);

    assert_eq!(sort_scope(&mut tx, "unk,sub.ok,-id").await, desc);
    tx.rollback().await.unwrap();
}

pub async fn paginates(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    let (o1, o2) = std_seeds(&mut tx).await;

    assert_eq!(paginate(&mut tx, vec![]).await, BOTH);
    assert_eq!(paginate(&mut tx, vec![vec![]]).await, BOTH);
    assert_eq!(
        paginate(&mut tx, vec![cond(&[("min_id", "AAA"), ("min_last_modified", "0")])]).await,
        BOTH
    );
    assert_eq!(
        paginate(
            &mut tx,
            vec![
                cond(&[("id", "EPR.ID"), ("last_modified", &etoa(o1.mod_time))]),
                cond(&[("id", "ITR.ID"), ("last_modified", &etoa(o2.mod_time))]),
            ]
        )
        .await,
        BOTH
    );
    assert_eq!(
        paginate(&mut tx, vec![cond(&[("id", "EPR.ID"), ("id", "ITR.ID")])]).await,
        NONE
    );
    assert_eq!(
        paginate(&mut tx, vec![cond(&[("id", "unknown")]), cond(&[("min_id", "ITR.ID")])]).await,
        ITR
    );
    assert_eq!(
        paginate(
            &mut tx,
            vec![cond(&[("id", "unknown")]), vec![], cond(&[("min_id", "ITR.ID")])]
        )
        .await,
        ITR
    );
    tx.rollback().await.unwrap();
}

/// Walks three objects page by page with cursor conditions.
pub async fn paginates_with_cursor(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    for title in ["alpha", "beta", "gamma"] {
        create(&mut tx, "/objects/*", json!({ "title": title })).await;
    }

    let sort = parse_sort("last_modified");
    let titles = |objs: &[Object]| -> Vec<String> {
        objs.iter()
            .map(|o| o.extra["title"].as_str().unwrap_or_default().to_string())
            .collect()
    };
    let ns = Path::new("/objects/*");

    let first = tx
        .list_all(
            &ns,
            &ListOptions {
                sort: sort.clone(),
                limit: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(titles(&first), ["alpha", "beta"]);

    let cursor = Pagination::new("nonce", &first[1], &sort);
    let token = cursor.encode().unwrap();
    let decoded = Pagination::decode(&token).unwrap().unwrap();

    let second = tx
        .list_all(
            &ns,
            &ListOptions {
                pagination: decoded.conditions(&sort),
                sort: sort.clone(),
                limit: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(titles(&second), ["gamma"]);

    let everything = tx
        .list_all(
            &ns,
            &ListOptions {
                sort,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let pages: Vec<Object> = first.into_iter().chain(second).collect();
    assert_eq!(pages, everything);
    tx.rollback().await.unwrap();
}

// ============================================================================
// Filters
// ============================================================================

/// Each case is `(field, value, expected IDs)`.
async fn check_filters(tx: &mut Tx, cases: &[(&str, &str, &[&str])]) {
    for (field, value, expected) in cases {
        assert_eq!(
            filter_scope(tx, field, value).await,
            *expected,
            "filter {field}={value}"
        );
    }
}

pub async fn ranks_json_null_as_missing(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    create(&mut tx, "/objects/*", json!({"nul": null})).await; // EPR.ID
    create(&mut tx, "/objects/*", json!({"nul": 1})).await; // ITR.ID
    create(&mut tx, "/objects/*", json!({})).await; // MXR.ID

    check_filters(
        &mut tx,
        &[
            ("nul", "null", &["EPR.ID", "MXR.ID"]),
            ("nul", "1", &ITR),
            ("not_nul", "null", &ITR),
            ("not_nul", "1", &["EPR.ID", "MXR.ID"]),
            ("gt_nul", "1", &["EPR.ID", "MXR.ID"]),
            ("lt_nul", "null", &ITR),
            ("min_nul", "null", &["EPR.ID", "MXR.ID"]),
            ("in_nul", "null", &["EPR.ID", "MXR.ID"]),
            ("has_nul", "true", &BOTH),
            ("has_nul", "false", &["MXR.ID"]),
        ],
    )
    .await;

    assert_eq!(sort_scope(&mut tx, "nul,id").await, ["ITR.ID", "EPR.ID", "MXR.ID"]);
    assert_eq!(sort_scope(&mut tx, "-nul,id").await, ["EPR.ID", "MXR.ID", "ITR.ID"]);
    tx.rollback().await.unwrap();
}

pub async fn filters(backend: &dyn StorageBackend) {
    let mut tx = begin(backend).await;
    let (o1, o2) = std_seeds(&mut tx).await;
    let m1 = etoa(o1.mod_time);
    let m2 = etoa(o2.mod_time);
    let m0 = etoa(Epoch(o1.mod_time.0 - 1));

    // EQ
    check_filters(
        &mut tx,
        &[
            ("id", "EPR.ID", &EPR),
            ("id", "ITR.ID", &ITR),
            ("id", "xx", &NONE),
            ("id", "33", &NONE),
            ("id", "null", &NONE),
            ("last_modified", &m1, &EPR),
            ("last_modified", &m2, &ITR),
            ("last_modified", &m0, &NONE),
            ("last_modified", "xx", &NONE),
            ("last_modified", "null", &NONE),
            ("str", "k", &EPR),
            ("mix", "val", &EPR),
            ("str", "null", &ITR),
            ("str", "xx", &NONE),
            ("str", "[]", &NONE),
            ("num", "33", &EPR),
            ("num", "66", &ITR),
            ("num", "99", &NONE),
            ("num", "null", &NONE),
            ("num", r#""xx""#, &NONE),
            ("sub.num", "11", &EPR),
            ("yes", "true", &EPR),
            ("mix", "true", &ITR),
            ("yes", "{}", &NONE),
            ("sub.ok", "true", &BOTH),
            ("sub", r#"{"ok": true}"#, &ITR),
            ("sub", "{}", &NONE),
            ("ary", r#"["x", 7, null, false, {"z": 8}]"#, &EPR),
            ("ary", "null", &ITR),
            ("ary", "[]", &NONE),
            ("unk", "33", &NONE),
            ("unk", "null", &BOTH),
            ("unk", "true", &NONE),
        ],
    )
    .await;

    // NOT
    check_filters(
        &mut tx,
        &[
            ("not_id", "EPR.ID", &ITR),
            ("not_id", "xx", &BOTH),
            ("not_id", "null", &BOTH),
            ("not_last_modified", &m1, &ITR),
            ("not_last_modified", "null", &BOTH),
            ("not_str", "k", &ITR),
            ("not_str", "xx", &BOTH),
            ("not_str", "null", &EPR),
            ("not_num", "33", &ITR),
            ("not_num", "null", &BOTH),
            ("not_sub", "[]", &BOTH),
            ("not_ary", "null", &EPR),
            ("not_unk", "33", &BOTH),
            ("not_unk", "null", &NONE),
        ],
    )
    .await;

    // LIKE
    check_filters(
        &mut tx,
        &[
            ("like_id", "EPR.ID", &EPR),
            ("like_id", "EPR*", &EPR),
            ("like_id", "*ID", &BOTH),
            ("like_id", "*R*ID", &BOTH),
            ("like_id", "R.", &BOTH),
            ("like_id", "IP*", &NONE),
            ("like_id", "xx", &NONE),
            ("like_id", "null", &NONE),
            ("like_last_modified", "*", &NONE),
            ("like_last_modified", "33", &NONE),
            ("like_str", "k", &EPR),
            ("like_mix", "*", &BOTH),
            ("like_mix", "v*", &EPR),
            ("like_str", "null", &NONE),
            ("like_num", "33", &EPR),
            ("like_unk", "xx", &NONE),
            ("like_unk", "null", &NONE),
        ],
    )
    .await;

    // HAS
    check_filters(
        &mut tx,
        &[
            ("has_id", "true", &BOTH),
            ("has_id", "false", &NONE),
            ("has_id", "0", &NONE),
            ("has_id", "1", &BOTH),
            ("has_last_modified", "true", &BOTH),
            ("has_last_modified", "xx", &NONE),
            ("has_str", "true", &EPR),
            ("has_str", "false", &ITR),
            ("has_num", "true", &BOTH),
            ("has_num", "false", &NONE),
            ("has_ary", "true", &EPR),
            ("has_ary", "false", &ITR),
            ("has_unk", "true", &NONE),
            ("has_unk", "false", &BOTH),
        ],
    )
    .await;

    // GT: nothing is greater than null, missing values rank as null
    check_filters(
        &mut tx,
        &[
            ("gt_id", "EPR.ID", &ITR),
            ("gt_id", "xx", &NONE),
            ("gt_id", "null", &NONE),
            ("gt_last_modified", &m1, &ITR),
            ("gt_last_modified", &m0, &BOTH),
            ("gt_last_modified", "null", &NONE),
            ("gt_str", "k", &ITR),
            ("gt_str", "a", &BOTH),
            ("gt_str", "z", &ITR),
            ("gt_str", "null", &NONE),
            ("gt_num", "33", &ITR),
            ("gt_num", "11", &BOTH),
            ("gt_num", "99", &NONE),
            ("gt_yes", "true", &ITR),
            ("gt_yes", "false", &BOTH),
            ("gt_non", "true", &ITR),
            ("gt_non", "false", &ITR),
            ("gt_ary", "null", &NONE),
            ("gt_sub", "null", &NONE),
        ],
    )
    .await;

    // LT: everything present is less than null
    check_filters(
        &mut tx,
        &[
            ("lt_id", "EPR.ID", &NONE),
            ("lt_id", "xx", &BOTH),
            ("lt_id", "null", &BOTH),
            ("lt_last_modified", &m1, &NONE),
            ("lt_last_modified", &m2, &EPR),
            ("lt_last_modified", "null", &BOTH),
            ("lt_str", "k", &NONE),
            ("lt_str", "z", &EPR),
            ("lt_str", "null", &EPR),
            ("lt_num", "33", &NONE),
            ("lt_num", "99", &BOTH),
            ("lt_num", "null", &BOTH),
            ("lt_yes", "true", &NONE),
            ("lt_yes", "false", &NONE),
            ("lt_non", "true", &EPR),
            ("lt_non", "false", &NONE),
            ("lt_ary", "null", &EPR),
            ("lt_sub", "null", &BOTH),
        ],
    )
    .await;

    // MIN and MAX
    check_filters(
        &mut tx,
        &[
            ("min_id", "EPR.ID", &BOTH),
            ("min_id", "H", &ITR),
            ("min_id", "null", &NONE),
            ("min_last_modified", &m1, &BOTH),
            ("min_str", "k", &BOTH),
            ("min_str", "null", &ITR),
            ("min_num", "33", &BOTH),
            ("min_num", "99", &NONE),
            ("min_num", "null", &NONE),
            ("max_id", "EPR.ID", &EPR),
            ("max_id", "null", &BOTH),
            ("max_last_modified", &m1, &EPR),
            ("max_str", "k", &EPR),
            ("max_str", "null", &BOTH),
            ("max_num", "33", &EPR),
            ("max_num", "11", &NONE),
            ("max_num", "99", &BOTH),
        ],
    )
    .await;

    // IN and EXCLUDE
    let in_m1 = format!("{m1},1");
    check_filters(
        &mut tx,
        &[
            ("in_id", "EPR.ID,ITR.ID", &BOTH),
            ("in_id", "X,EPR.ID,Z", &EPR),
            ("in_id", "X,Y,Z", &NONE),
            ("in_id", "", &NONE),
            ("in_last_modified", &in_m1, &EPR),
            ("in_last_modified", "a,b,c", &NONE),
            ("in_str", "k,l,m", &EPR),
            ("in_str", "null", &ITR),
            ("in_str", "k,null,m", &BOTH),
            ("in_num", "11,33,66", &BOTH),
            ("in_num", "null", &NONE),
            ("in_yes", "x,true,3", &EPR),
            ("in_non", "x,false,3", &EPR),
            ("in_ary", "null", &ITR),
            ("in_sub", "null", &NONE),
            ("in_unk", "x,null,z", &BOTH),
            ("exclude_id", "EPR.ID,ITR.ID", &NONE),
            ("exclude_id", "X,EPR.ID,Z", &ITR),
            ("exclude_id", "", &BOTH),
            ("exclude_last_modified", &m2, &EPR),
            ("exclude_str", "k,l,m", &ITR),
            ("exclude_str", "null", &EPR),
            ("exclude_str", "k,null,m", &NONE),
            ("exclude_num", "11,33,66", &NONE),
            ("exclude_num", "null", &BOTH),
            ("exclude_yes", "x,true,3", &ITR),
            ("exclude_non", "x,false,3", &ITR),
            ("exclude_ary", "null", &EPR),
            ("exclude_sub", "null", &BOTH),
            ("exclude_unk", "x,null,z", &NONE),
        ],
    )
    .await;

    // CONTAINS and CONTAINS_ANY never match reserved fields
    check_filters(
        &mut tx,
        &[
            ("contains_id", "EPR.ID", &NONE),
            ("contains_last_modified", &m1, &NONE),
            ("contains_str", "k", &EPR),
            ("contains_str", "123", &NONE),
            ("contains_str", "null", &NONE),
            ("contains_num", "33", &EPR),
            ("contains_num", "99", &NONE),
            ("contains_yes", "true", &EPR),
            ("contains_non", "false", &EPR),
            ("contains_ary", "x", &EPR),
            ("contains_sub", r#"{"ok": true}"#, &BOTH),
            ("contains_sub", r#"{"num": 11}"#, &EPR),
            ("contains_sub", r#"{"num": 12}"#, &NONE),
            ("contains_sub", "11", &NONE),
            ("contains_unk", "null", &NONE),
            ("contains_any_id", "EPR.ID,ITR.ID", &NONE),
            ("contains_any_str", "k", &NONE),
            ("contains_any_ary", "x", &EPR),
            ("contains_any_ary", "x,y,z", &EPR),
            ("contains_any_ary", "5,6,7", &EPR),
            ("contains_any_ary", "w,false", &EPR),
            ("contains_any_ary", r#"{"z":8}"#, &EPR),
            ("contains_any_ary", "null", &EPR),
            ("contains_any_ary", "8,9", &NONE),
            ("contains_any_ary", "true", &NONE),
            ("contains_any_sub", r#"{"ok": true}"#, &NONE),
            ("contains_any_unk", "xx", &NONE),
        ],
    )
    .await;

    tx.rollback().await.unwrap();
}
