use turngate_core::{SessionStore, ThinkingLevel, VerboseLevel};

#[tokio::test]
async fn test_get_or_create_persists_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    let created = {
        let store = SessionStore::open(&path).unwrap();
        store.get_or_create("discord:dm:alice").await
    };
    assert!(!created.session_id.is_empty());

    // A fresh store instance sees the persisted entry.
    let store = SessionStore::open(&path).unwrap();
    let loaded = store.get("discord:dm:alice").await.unwrap();
    assert_eq!(loaded.session_id, created.session_id);
    assert_eq!(loaded.thinking_level, ThinkingLevel::Off);
    assert_eq!(loaded.verbose_level, VerboseLevel::On);
}

#[tokio::test]
async fn test_saves_apply_in_call_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let store = SessionStore::open(&path).unwrap();

    store
        .save("s1", |entry| entry.model = Some("model-a".to_string()))
        .await;
    store
        .save("s1", |entry| entry.model = Some("model-b".to_string()))
        .await;

    assert_eq!(
        store.get("s1").await.unwrap().model.as_deref(),
        Some("model-b")
    );

    // The last call issued determines the persisted state.
    let reloaded = SessionStore::open(&path).unwrap();
    assert_eq!(
        reloaded.get("s1").await.unwrap().model.as_deref(),
        Some("model-b")
    );
}

#[tokio::test]
async fn test_updated_at_is_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path().join("state.db")).unwrap();

    let first = store.save("s1", |_| {}).await;
    let second = store.save("s1", |_| {}).await;
    assert!(second.updated_at >= first.updated_at);
}

#[tokio::test]
async fn test_token_counters_accumulate() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path().join("state.db")).unwrap();

    store
        .save("s1", |entry| {
            entry.input_tokens += 100;
            entry.output_tokens += 50;
        })
        .await;
    store
        .save("s1", |entry| {
            entry.input_tokens += 10;
            entry.output_tokens += 5;
        })
        .await;

    let entry = store.get("s1").await.unwrap();
    assert_eq!(entry.input_tokens, 110);
    assert_eq!(entry.output_tokens, 55);
}

#[tokio::test]
async fn test_reset_issues_new_session_id_and_clears_override() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path().join("state.db")).unwrap();

    let original = store.get_or_create("s1").await;
    store
        .save("s1", |entry| {
            entry.history_override = Some("forked-id".to_string())
        })
        .await;

    let reset = store.reset("s1").await;
    assert_ne!(reset.session_id, original.session_id);
    assert!(reset.history_override.is_none());
}

#[tokio::test]
async fn test_delete_removes_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let store = SessionStore::open(&path).unwrap();

    store.get_or_create("s1").await;
    assert!(store.delete("s1").await.unwrap());
    assert!(store.get("s1").await.is_none());
    assert!(!store.delete("s1").await.unwrap());

    let reloaded = SessionStore::open(&path).unwrap();
    assert!(reloaded.get("s1").await.is_none());
}

#[tokio::test]
async fn test_list_sorted_by_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path().join("state.db")).unwrap();

    store.get_or_create("b").await;
    store.get_or_create("a").await;

    let keys: Vec<String> = store
        .list()
        .await
        .into_iter()
        .map(|e| e.session_key)
        .collect();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
}
