use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use linebus::storage::LogStore;
use linebus::Config;
use linebus::State;
use linestore::DiskStore;
use maplit::btreeset;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;

use fixtures::BrokerRouter;

mod fixtures;

/// Crash-restart recovery test.
///
/// What does this test do?
///
/// - runs a single-node broker on a real database file and commits a few
///   messages.
/// - stops the node without any orderly state transfer, as a kill would.
/// - boots a fresh node on the same file and asserts it reconstructs the
///   applied state, resumes leadership, and keeps the sequence counter
///   monotone.
///
/// RUST_LOG=linebus,restart_recovery=trace cargo test -p linebus --test restart_recovery
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_reconstructs_state_and_rejoins() -> Result<()> {
    fixtures::init_tracing();

    let dbfile = tempfile::NamedTempFile::new()?;
    let db_path = dbfile.path().to_path_buf();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));

    let (first_term, messages_before) = {
        let router = Arc::new(BrokerRouter::new(config.clone()));
        let store = Arc::new(DiskStore::open(&db_path).expect("open store"));
        router.new_broker_node_with_sto(0, store).await;
        router.seed_membership().await?;

        router
            .wait_for_state(&btreeset![0], State::Leader, Some(Duration::from_secs(2)), "n0 -> leader")
            .await?;
        router.client_publish(0, "news", "one").await;
        router.client_publish(0, "news", "two").await;
        router.client_publish(0, "news", "three").await;
        router.wait_for_log(&btreeset![0], 4, Some(Duration::from_secs(2)), "publishes applied").await?;

        let node = router.node(&0).await?;
        let metrics = node.raft.metrics().borrow().clone();
        let messages = node.store.read_messages(10).await?;

        // Stop the node abruptly; the store has everything it needs.
        node.raft.shutdown().await?;
        (metrics.current_term, messages)
    };
    assert_eq!(messages_before.len(), 3);

    tracing::info!("--- restarting on the same database");
    let router = Arc::new(BrokerRouter::new(config));
    let store = Arc::new(DiskStore::open(&db_path).expect("reopen store"));

    let state = store.get_initial_state().await?;
    assert_eq!(state.last_applied_log.index, 4, "applied state survives the restart");
    assert_eq!(state.last_log_id.index, 4);
    assert_eq!(state.hard_state.current_term, first_term);

    router.new_broker_node_with_sto(0, store).await;
    router.seed_membership().await?;
    router
        .wait_for_state(&btreeset![0], State::Leader, Some(Duration::from_secs(2)), "restarted n0 -> leader")
        .await?;

    // The new term opens with a noop at index 5; a fresh publish lands
    // after it and the sequence counter continues from the stored value.
    router.wait_for_log(&btreeset![0], 5, Some(Duration::from_secs(2)), "new term noop applied").await?;
    let resp = router.client_publish(0, "news", "four").await;
    assert_eq!(resp.index, 6);
    router.wait_for_log(&btreeset![0], 6, Some(Duration::from_secs(2)), "post-restart publish applied").await?;

    let node = router.node(&0).await?;
    let messages = node.store.read_messages(10).await?;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[..3], messages_before[..]);
    assert_eq!(messages[3].seq_no, 4);
    assert_eq!(messages[3].message.value, "four");

    let metrics = node.raft.metrics().borrow().clone();
    assert!(metrics.current_term > first_term);

    Ok(())
}
