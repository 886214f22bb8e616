//! End-to-end tests for reads, writes and listeners against an in-memory
//! server.

use docsync_engine::{
    ChangeType, Direction, DocumentKey, FieldPath, FilterOp, ListenOptions, Patch, Query, Source,
    SyncError, Value,
};
use docsync_testkit::{
    fields, init_tracing, next_snapshot, random_collection, random_key, snapshot_where,
    MemoryServer, TestDb,
};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn read_your_writes() {
    init_tracing();
    let db = TestDb::new().await;
    let key = random_key(&random_collection());

    db.set(&key, fields(json!({"name": "alice", "age": 30})))
        .await
        .unwrap();

    let snapshot = db.get(&key, Source::Cache).await.unwrap();
    assert!(snapshot.exists());
    assert_eq!(snapshot.data(), Some(&fields(json!({"name": "alice", "age": 30}))));

    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn server_read_after_commit() {
    init_tracing();
    let db = TestDb::new().await;
    let key = db.with_test_doc(json!({"value": 1})).await;

    let snapshot = db.get(&key, Source::Server).await.unwrap();
    assert!(snapshot.exists());
    assert!(!snapshot.from_cache());
    assert!(!snapshot.has_pending_writes());
    assert_eq!(snapshot.get("value"), Some(&Value::Integer(1)));

    let default = db.get(&key, Source::Default).await.unwrap();
    assert_eq!(default.data(), snapshot.data());

    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_document_does_not_exist() {
    let db = TestDb::new().await;
    let key = random_key(&random_collection());

    let cached = db.get(&key, Source::Cache).await.unwrap();
    assert!(!cached.exists());
    assert!(cached.data().is_none());
    assert_eq!(cached.reference(), &key);

    let remote = db.get(&key, Source::Server).await.unwrap();
    assert!(!remote.exists());
    assert!(!remote.from_cache());

    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn references_round_trip() {
    let db = TestDb::new().await;
    let target = db.with_test_doc(json!({"title": "target"})).await;
    let holder = random_key(&random_collection());

    let mut data = fields(json!({"note": "points elsewhere"}));
    data.insert("link".to_string(), Value::Reference(target.clone()));
    db.set(&holder, data).await.unwrap().committed().await.unwrap();

    let snapshot = db.get(&holder, Source::Server).await.unwrap();
    let link = snapshot
        .get("link")
        .and_then(Value::as_reference)
        .cloned()
        .expect("link is a reference");
    assert_eq!(link, target);
    assert_eq!(link, DocumentKey::parse(&target.path().to_string()).unwrap());

    // The reference is usable for reads and writes like any key.
    let followed = db.get(&link, Source::Default).await.unwrap();
    assert_eq!(followed.get("title"), Some(&Value::from("target")));
    db.set(&link, fields(json!({"title": "updated"})))
        .await
        .unwrap()
        .committed()
        .await
        .unwrap();
    assert_eq!(
        db.server.document(&target).unwrap().fields,
        fields(json!({"title": "updated"}))
    );

    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn writes_converge_across_clients() {
    init_tracing();
    let server = MemoryServer::new();
    let writer = TestDb::on(&server).await;
    let reader = TestDb::on(&server).await;
    let key = random_key(&random_collection());

    let mut stream = reader
        .listen_with_options(
            Query::document(&key),
            ListenOptions::new().with_metadata_changes(true),
        )
        .unwrap();
    let first = next_snapshot(&mut stream).await;
    assert!(first.is_empty());

    writer
        .set(&key, fields(json!({"from": "writer"})))
        .await
        .unwrap()
        .committed()
        .await
        .unwrap();

    let seen = snapshot_where(&mut stream, |s| !s.is_empty() && !s.from_cache()).await;
    let doc = seen.document_snapshot(&key);
    assert!(doc.exists());
    assert_eq!(doc.data(), Some(&fields(json!({"from": "writer"}))));
    assert!(!doc.has_pending_writes());

    drop(stream);
    writer.shutdown().await.unwrap();
    reader.shutdown().await.unwrap();
}

#[tokio::test]
async fn empty_collection_yields_one_snapshot() {
    let db = TestDb::new().await;
    let collection = random_collection();

    let mut stream = db.listen(Query::at_collection(collection)).unwrap();
    let snapshot = next_snapshot(&mut stream).await;
    assert!(snapshot.is_empty());
    assert_eq!(snapshot.len(), 0);
    assert!(snapshot.changes().is_empty());

    // Going in sync without any documents is not a change.
    assert!(stream
        .next_timeout(Duration::from_millis(200))
        .await
        .is_none());

    drop(stream);
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn query_results_are_filtered_and_ordered() {
    let db = TestDb::new().await;
    let collection = db
        .with_test_collection(&[
            ("a", json!({"rank": 2})),
            ("b", json!({"rank": 3})),
            ("c", json!({"rank": 1})),
            ("d", json!({"rank": 7})),
            ("e", json!({"other": true})),
        ])
        .await;

    let query = Query::at_collection(collection.clone())
        .filter("rank", FilterOp::LessThan, 5)
        .order_by("rank", Direction::Descending);
    let snapshot = db.get_query(query.clone(), Source::Server).await.unwrap();
    let ids: Vec<&str> = snapshot.iter().map(|doc| doc.key.id()).collect();
    assert_eq!(ids, vec!["b", "a", "c"]);

    // The cache evaluates the same query identically.
    let cached = db.get_query(query, Source::Cache).await.unwrap();
    assert_eq!(cached.documents(), snapshot.documents());

    let limited = Query::at_collection(collection)
        .order_by("rank", Direction::Ascending)
        .limit(2);
    let snapshot = db.get_query(limited, Source::Server).await.unwrap();
    let ids: Vec<&str> = snapshot.iter().map(|doc| doc.key.id()).collect();
    assert_eq!(ids, vec!["c", "a"]);

    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn listener_sees_added_modified_removed() {
    let db = TestDb::new().await;
    let collection = random_collection();
    let key = random_key(&collection);

    let mut stream = db.listen(Query::at_collection(collection)).unwrap();
    assert!(next_snapshot(&mut stream).await.is_empty());

    db.set(&key, fields(json!({"n": 1}))).await.unwrap();
    let added = next_snapshot(&mut stream).await;
    assert_eq!(added.changes().len(), 1);
    assert_eq!(added.changes()[0].kind, ChangeType::Added);
    assert!(added.has_pending_writes());

    db.update(&key, Patch::from([(FieldPath::from("n"), Some(Value::Integer(2)))]))
        .await
        .unwrap();
    let modified = next_snapshot(&mut stream).await;
    assert_eq!(modified.changes()[0].kind, ChangeType::Modified);
    assert_eq!(modified.documents()[0].get(&FieldPath::from("n")), Some(&Value::Integer(2)));

    db.delete(&key).await.unwrap();
    let removed = next_snapshot(&mut stream).await;
    assert_eq!(removed.changes()[0].kind, ChangeType::Removed);
    assert!(removed.is_empty());

    drop(stream);
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_query_fails_synchronously() {
    let db = TestDb::new().await;
    let query = Query::at_collection(random_collection())
        .filter("a", FilterOp::LessThan, 1)
        .filter("b", FilterOp::GreaterThan, 1);

    let err = db.listen(query.clone()).unwrap_err();
    assert!(matches!(err, SyncError::InvalidQuery(_)));
    assert!(matches!(
        db.get_query(query, Source::Cache).await,
        Err(SyncError::InvalidQuery(_))
    ));

    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn operations_after_shutdown_fail() {
    let db = TestDb::new().await;
    db.shutdown().await.unwrap();
    db.shutdown().await.unwrap();

    let key = random_key(&random_collection());
    assert!(matches!(
        db.set(&key, fields(json!({"a": 1}))).await,
        Err(SyncError::ClientShutdown)
    ));
    assert!(matches!(
        db.get(&key, Source::Cache).await,
        Err(SyncError::ClientShutdown)
    ));
}
