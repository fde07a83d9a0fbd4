//! Integration tests against a live Redis instance.
//! All tests are `#[ignore]` — run with `cargo test -- --ignored` against a
//! local Redis (or set `REDIS_URL`).
use coordinator_store::{Batch, StoreClient};

async fn setup() -> StoreClient {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
    StoreClient::connect(&url).await.expect("failed to connect to redis")
}

#[tokio::test]
#[ignore]
async fn set_and_get_roundtrips() {
    let store = setup().await;
    store.set("coordinator:test:scalar", "hello").await.unwrap();
    let value = store.get("coordinator:test:scalar").await.unwrap();
    assert_eq!(value.as_deref(), Some("hello"));
    store.del("coordinator:test:scalar").await.unwrap();
}

#[tokio::test]
#[ignore]
async fn set_nx_ex_rejects_second_acquirer() {
    let store = setup().await;
    store.del("coordinator:test:lock").await.unwrap();

    let first = store.set_nx_ex("coordinator:test:lock", "holder-a", 5).await.unwrap();
    let second = store.set_nx_ex("coordinator:test:lock", "holder-b", 5).await.unwrap();

    assert!(first);
    assert!(!second);
    store.del("coordinator:test:lock").await.unwrap();
}

#[tokio::test]
#[ignore]
async fn commit_batch_rejects_when_precondition_violated() {
    let store = setup().await;
    store.set("coordinator:test:status", "idle").await.unwrap();

    // Precondition expects "processing", which is false — batch must abort.
    let batch = Batch::new()
        .expect_value("coordinator:test:status", "processing")
        .set("coordinator:test:status", "done");

    let result = store.commit_batch(&batch).await;
    assert!(result.is_err());

    let value = store.get("coordinator:test:status").await.unwrap();
    assert_eq!(value.as_deref(), Some("idle"));

    store.del("coordinator:test:status").await.unwrap();
}

#[tokio::test]
#[ignore]
async fn commit_batch_applies_all_ops_when_preconditions_hold() {
    let store = setup().await;
    store.del("coordinator:test:status").await.unwrap();

    let batch = Batch::new()
        .expect_absent("coordinator:test:status")
        .set("coordinator:test:status", "processing")
        .sadd("coordinator:test:processing_set", "issue-1");

    store.commit_batch(&batch).await.unwrap();

    let value = store.get("coordinator:test:status").await.unwrap();
    assert_eq!(value.as_deref(), Some("processing"));
    let members = store.smembers("coordinator:test:processing_set").await.unwrap();
    assert!(members.contains(&"issue-1".to_string()));

    store.del("coordinator:test:status").await.unwrap();
    store.del("coordinator:test:processing_set").await.unwrap();
}
