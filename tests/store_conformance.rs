//! Conformance suite for the queue store contract.
//!
//! Every scenario is written against `dyn PickupStore` and runs unchanged
//! for each backend. The in-memory backend runs always; the Postgres and
//! Redis backends run under the `integration` feature against the servers
//! named by `WAYSTATION_DATABASE_URL` and `WAYSTATION_REDIS_URL`.
//!
//! Connection ids are unique per test so suites can share a live server
//! without stepping on each other.

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;

use waystation::store::PickupStore;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn unique_connection() -> String {
    format!("conn-{}", Uuid::new_v4())
}

fn envelope(n: u32) -> serde_json::Value {
    json!({ "protected": "eyJ0eXAi", "ciphertext": format!("payload-{}", n) })
}

async fn enqueue(store: &dyn PickupStore, connection_id: &str, n: u32) -> Uuid {
    let (id, _) = store
        .add_message(connection_id, &[], &envelope(n), false)
        .await
        .unwrap();
    // Keep enqueue timestamps distinct so FIFO assertions are meaningful.
    tokio::time::sleep(Duration::from_millis(2)).await;
    id
}

async fn check_fifo_order_and_limit(store: &dyn PickupStore) {
    let conn = unique_connection();
    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(enqueue(store, &conn, n).await);
    }

    let taken = store.take_messages(&conn, Some(2), false, None).await.unwrap();
    assert_eq!(
        taken.iter().map(|m| m.id).collect::<Vec<_>>(),
        ids[..2].to_vec()
    );
    assert_eq!(store.pending_count(&conn, None).await.unwrap(), 1);
}

async fn check_reserve_then_requeue(store: &dyn PickupStore) {
    let conn = unique_connection();
    enqueue(store, &conn, 1).await;
    enqueue(store, &conn, 2).await;

    let taken = store.take_messages(&conn, None, false, None).await.unwrap();
    assert_eq!(taken.len(), 2);
    // Reserved messages are invisible to further takes and to the count.
    assert!(store.take_messages(&conn, None, false, None).await.unwrap().is_empty());
    assert_eq!(store.pending_count(&conn, None).await.unwrap(), 0);

    assert_eq!(store.requeue_in_flight(&conn).await.unwrap(), 2);
    assert_eq!(store.pending_count(&conn, None).await.unwrap(), 2);
}

async fn check_concurrent_takes_do_not_share(store: &dyn PickupStore) {
    let conn = unique_connection();
    for n in 0..4 {
        enqueue(store, &conn, n).await;
    }

    let (a, b) = tokio::join!(
        store.take_messages(&conn, None, false, None),
        store.take_messages(&conn, None, false, None),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // Every message reserved exactly once across the two takes.
    assert_eq!(a.len() + b.len(), 4);
    let mut ids: Vec<Uuid> = a.iter().chain(b.iter()).map(|m| m.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(store.pending_count(&conn, None).await.unwrap(), 0);
}

async fn check_take_with_delete_is_final(store: &dyn PickupStore) {
    let conn = unique_connection();
    enqueue(store, &conn, 1).await;

    let taken = store.take_messages(&conn, None, true, None).await.unwrap();
    assert_eq!(taken.len(), 1);
    assert_eq!(store.pending_count(&conn, None).await.unwrap(), 0);
    // Nothing to recover; delete means receipt was already confirmed.
    assert_eq!(store.requeue_in_flight(&conn).await.unwrap(), 0);
}

async fn check_remove_is_idempotent_and_scoped(store: &dyn PickupStore) {
    let conn = unique_connection();
    let other = unique_connection();
    let id = enqueue(store, &conn, 1).await;

    // Wrong connection: the message survives.
    store.remove_messages(&other, &[id]).await.unwrap();
    assert_eq!(store.pending_count(&conn, None).await.unwrap(), 1);

    store.remove_messages(&conn, &[id]).await.unwrap();
    assert_eq!(store.pending_count(&conn, None).await.unwrap(), 0);

    // Unknown ids are a no-op.
    store.remove_messages(&conn, &[id, Uuid::new_v4()]).await.unwrap();
}

async fn check_recipient_did_widens_the_query(store: &dyn PickupStore) {
    let conn = unique_connection();
    let other = unique_connection();
    let did = format!("did:peer:{}#key-1", Uuid::new_v4());
    let (id, _) = store
        .add_message(&conn, std::slice::from_ref(&did), &envelope(1), false)
        .await
        .unwrap();

    // Counting and polling as a different connection but the same
    // recipient key.
    assert_eq!(store.pending_count(&other, Some(&did)).await.unwrap(), 1);
    assert_eq!(store.pending_count(&other, None).await.unwrap(), 0);
    let taken = store
        .take_messages(&other, None, false, Some(&did))
        .await
        .unwrap();
    assert_eq!(taken.iter().map(|m| m.id).collect::<Vec<_>>(), vec![id]);
    assert_eq!(taken[0].recipient_dids, vec![did]);
}

async fn check_local_session_enqueue_starts_in_flight(store: &dyn PickupStore) {
    let conn = unique_connection();
    store
        .add_message(&conn, &[], &envelope(1), true)
        .await
        .unwrap();

    assert_eq!(store.pending_count(&conn, None).await.unwrap(), 0);
    assert!(store.take_messages(&conn, None, false, None).await.unwrap().is_empty());
    // Recovery applies to live-delivery hand-offs too.
    assert_eq!(store.requeue_in_flight(&conn).await.unwrap(), 1);
}

async fn check_live_session_lifecycle(store: &dyn PickupStore) {
    let conn = unique_connection();
    assert!(store.find_live_session(&conn).await.unwrap().is_none());

    store.save_live_session("s1", &conn, "instance-a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    store.save_live_session("s2", &conn, "instance-b").await.unwrap();

    // Duplicate records: the most recent wins.
    let found = store.find_live_session(&conn).await.unwrap().unwrap();
    assert_eq!(found.session_id, "s2");
    assert_eq!(found.instance, "instance-b");

    store.remove_live_session(&conn).await.unwrap();
    assert!(store.find_live_session(&conn).await.unwrap().is_none());
    // Removing again is a no-op.
    store.remove_live_session(&conn).await.unwrap();
}

async fn check_clear_instance_sessions_is_scoped(store: &dyn PickupStore) {
    let conn_a = unique_connection();
    let conn_b = unique_connection();
    let instance = format!("instance-{}", Uuid::new_v4());
    store.save_live_session("s1", &conn_a, &instance).await.unwrap();
    store.save_live_session("s2", &conn_b, "someone-else").await.unwrap();

    assert_eq!(store.clear_instance_sessions(&instance).await.unwrap(), 1);
    assert!(store.find_live_session(&conn_a).await.unwrap().is_none());
    assert!(store.find_live_session(&conn_b).await.unwrap().is_some());

    store.remove_live_session(&conn_b).await.unwrap();
}

macro_rules! conformance_tests {
    ($make_store:expr) => {
        #[tokio::test]
        async fn test_fifo_order_and_limit() {
            let store = $make_store.await;
            super::check_fifo_order_and_limit(&store).await;
        }

        #[tokio::test]
        async fn test_reserve_then_requeue() {
            let store = $make_store.await;
            super::check_reserve_then_requeue(&store).await;
        }

        #[tokio::test]
        async fn test_concurrent_takes_do_not_share() {
            let store = $make_store.await;
            super::check_concurrent_takes_do_not_share(&store).await;
        }

        #[tokio::test]
        async fn test_take_with_delete_is_final() {
            let store = $make_store.await;
            super::check_take_with_delete_is_final(&store).await;
        }

        #[tokio::test]
        async fn test_remove_is_idempotent_and_scoped() {
            let store = $make_store.await;
            super::check_remove_is_idempotent_and_scoped(&store).await;
        }

        #[tokio::test]
        async fn test_recipient_did_widens_the_query() {
            let store = $make_store.await;
            super::check_recipient_did_widens_the_query(&store).await;
        }

        #[tokio::test]
        async fn test_local_session_enqueue_starts_in_flight() {
            let store = $make_store.await;
            super::check_local_session_enqueue_starts_in_flight(&store).await;
        }

        #[tokio::test]
        async fn test_live_session_lifecycle() {
            let store = $make_store.await;
            super::check_live_session_lifecycle(&store).await;
        }

        #[tokio::test]
        async fn test_clear_instance_sessions_is_scoped() {
            let store = $make_store.await;
            super::check_clear_instance_sessions_is_scoped(&store).await;
        }
    };
}

mod in_memory {
    use waystation::store::{InMemoryStore, PickupStore};

    async fn make_store() -> InMemoryStore {
        super::init_tracing();
        let store = InMemoryStore::new();
        store.initialize().await.unwrap();
        store
    }

    conformance_tests!(make_store());
}

#[cfg(feature = "integration")]
mod postgres {
    use waystation::config::PostgresConfig;
    use waystation::store::{PickupStore, PostgresStore};

    async fn make_store() -> PostgresStore {
        super::init_tracing();
        dotenvy::dotenv().ok();
        let config = PostgresConfig {
            url: std::env::var("WAYSTATION_DATABASE_URL")
                .expect("WAYSTATION_DATABASE_URL must be set"),
            pool_size: 4,
        };
        let store = PostgresStore::new(&config).expect("postgres pool");
        store.initialize().await.expect("postgres schema bootstrap");
        store
    }

    conformance_tests!(make_store());
}

#[cfg(feature = "integration")]
mod redis {
    use waystation::config::RedisConfig;
    use waystation::store::{PickupStore, RedisStore};

    async fn make_store() -> RedisStore {
        super::init_tracing();
        dotenvy::dotenv().ok();
        let config = RedisConfig {
            url: std::env::var("WAYSTATION_REDIS_URL")
                .expect("WAYSTATION_REDIS_URL must be set"),
        };
        let store = RedisStore::connect(&config).await.expect("redis connection");
        store.initialize().await.expect("redis connection check");
        store
    }

    conformance_tests!(make_store());
}
