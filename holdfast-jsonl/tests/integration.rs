use holdfast::{
    Code, Operation, PersistenceSink, Record, RecordKey, Table, User, WriteBehindConfig,
    WriteBehindQueue,
};
use holdfast_jsonl::{JsonlError, JsonlStore};
use std::time::Duration;

fn code(id: i64, content: &str) -> Operation {
    Operation::upsert(Code { id, content: Some(content.into()), updated_at: Some(1) })
}

#[tokio::test]
async fn writes_one_line_per_merged_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("writes.jsonl");
    let store = JsonlStore::new(&path);

    store
        .commit(&[code(1, "a"), Operation::upsert(User { id: 2, auth: None }), code(1, "b")])
        .await
        .unwrap();

    let contents = std::fs::read_to_string(&path).expect("file");
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"op\":\"upsert\""));
    assert!(lines[0].contains("\"b\""));
    assert!(lines[1].contains("\"users\""));
}

#[tokio::test]
async fn load_replays_last_write_per_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = JsonlStore::new(dir.path().join("replay.jsonl"));

    store.commit(&[code(1, "first"), code(2, "other")]).await.unwrap();
    store.commit(&[code(1, "second")]).await.unwrap();

    let merged = store.load().await.unwrap();
    assert_eq!(merged.len(), 2);
    match merged.get(&RecordKey { table: Table::Codes, id: 1 }) {
        Some(Record::Code(c)) => assert_eq!(c.content.as_deref(), Some("second")),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn missing_file_loads_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = JsonlStore::new(dir.path().join("absent.jsonl"));
    assert!(store.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn corrupt_line_reports_its_number() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("corrupt.jsonl");
    let store = JsonlStore::new(&path);
    store.commit(&[code(1, "ok")]).await.unwrap();

    let mut contents = std::fs::read_to_string(&path).unwrap();
    contents.push_str("{not json\n");
    std::fs::write(&path, contents).unwrap();

    match store.load().await {
        Err(JsonlError::Decode { line, .. }) => assert_eq!(line, 2),
        other => panic!("expected decode error, got {:?}", other),
    }
}

#[tokio::test]
async fn unwritable_path_is_a_terminal_commit_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    // a directory cannot be opened for append
    let store = JsonlStore::new(dir.path());
    let err = store.commit(&[code(1, "x")]).await.unwrap_err();
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn queue_drains_into_file_on_stop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = JsonlStore::new(dir.path().join("queue.jsonl"));
    let config = WriteBehindConfig::new(Duration::from_secs(60), 4).unwrap();
    let queue = WriteBehindQueue::new(store.clone(), config);
    queue.start().unwrap();

    for id in 0..10 {
        queue.submit(code(id, "v")).unwrap();
    }
    let report = queue.stop(Duration::from_secs(5)).await;
    assert!(report.worker_exited);

    let merged = store.load().await.unwrap();
    assert_eq!(merged.len(), 10);
}

#[tokio::test]
async fn commit_after_torn_write_stays_readable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("torn.jsonl");
    let store = JsonlStore::new(&path);
    store.commit(&[code(1, "first")]).await.unwrap();

    let mut contents = std::fs::read_to_string(&path).unwrap();
    contents.push_str("{\"op\":\"upsert\",\"record\":{\"table\":\"co");
    std::fs::write(&path, contents).unwrap();

    // the fragment alone does not break replay
    assert_eq!(store.load().await.unwrap().len(), 1);

    store.commit(&[code(2, "second")]).await.unwrap();
    let merged = store.load().await.unwrap();
    assert_eq!(merged.len(), 2);
    match merged.get(&RecordKey { table: Table::Codes, id: 2 }) {
        Some(Record::Code(c)) => assert_eq!(c.content.as_deref(), Some("second")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
}
