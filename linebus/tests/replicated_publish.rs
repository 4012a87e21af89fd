use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use linebus::storage::LogStore;
use linebus::Config;
use maplit::btreeset;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;

use fixtures::BrokerRouter;

mod fixtures;

/// Replicated publish and fan-out test.
///
/// What does this test do?
///
/// - brings a three-node cluster online.
/// - registers a subscriber connection on a follower and replicates its
///   subscription.
/// - publishes through the leader and asserts the subscriber's outbound
///   queue receives exactly one frame for the message.
/// - asserts every node's store holds the same committed message.
///
/// RUST_LOG=linebus,replicated_publish=trace cargo test -p linebus --test replicated_publish
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn publish_reaches_follower_subscriber() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(BrokerRouter::new(config));
    router.new_broker_node(0).await;
    router.new_broker_node(1).await;
    router.new_broker_node(2).await;
    router.seed_membership().await?;

    let leader = router.wait_for_any_leader(Duration::from_secs(2), "initial election").await?;
    let all: BTreeSet<u64> = btreeset![0, 1, 2];
    router.wait_for_log(&all, 1, Some(Duration::from_secs(2)), "noop replicated").await?;

    let follower = all.iter().copied().find(|id| *id != leader).unwrap();
    tracing::info!("--- connecting subscriber on follower {}", follower);
    let follower_node = router.node(&follower).await?;
    let queue = follower_node.registry.register_connection("sub-1");

    // A subscribe frame received by a follower is relayed to the leader;
    // here the relay outcome is exercised through the router directly.
    router
        .client_subscribe(leader, "sub-1", follower, "news")
        .await
        .expect("subscribe through leader");
    router.wait_for_log(&all, 2, Some(Duration::from_secs(2)), "subscription applied").await?;

    tracing::info!("--- publishing through leader {}", leader);
    router.client_publish(leader, "news", "M").await;
    router.wait_for_log(&all, 3, Some(Duration::from_secs(2)), "publish applied").await?;

    // Exactly one frame for the publish lands on the subscriber's queue.
    let frame = queue.pop().await.expect("frame delivered");
    assert!(frame.starts_with("FORMAT:JSON|"), "got frame {}", frame);
    assert!(frame.contains(r#""Value":"M""#), "got frame {}", frame);

    // Every node's store converges to the same applied prefix.
    for id in all.iter() {
        let stored = router.node(id).await?.store.read_messages(10).await?;
        assert_eq!(stored.len(), 1, "node {} message count", id);
        assert_eq!(stored[0].message.topic, "news");
        assert_eq!(stored[0].message.value, "M");
        assert_eq!(stored[0].seq_no, 1);
    }

    // No duplicate delivery.
    assert!(queue.is_empty(), "subscriber received a duplicate frame");

    Ok(())
}

/// Apply order test.
///
/// What does this test do?
///
/// - brings a two-node cluster online.
/// - writes a stream of publishes to the leader.
/// - asserts the follower applies the full stream and both stores hold
///   identical, ordered message sequences.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publishes_apply_in_order_on_all_nodes() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(BrokerRouter::new(config));
    router.new_broker_node(0).await;
    router.new_broker_node(1).await;
    router.seed_membership().await?;

    let leader = router.wait_for_any_leader(Duration::from_secs(2), "initial election").await?;
    let all: BTreeSet<u64> = btreeset![0, 1];
    router.wait_for_log(&all, 1, Some(Duration::from_secs(2)), "noop replicated").await?;

    // Commits pace at the heartbeat interval when a write waits for its
    // follower ack, so keep the stream short enough to stay well inside
    // the wait budget.
    let n = 60;
    tracing::info!("--- publishing {} messages", n);
    router.client_publish_many(leader, "stream", n).await;

    // Log: 1 noop + n publishes.
    let want = 1 + n as u64;
    router.wait_for_log(&all, want, Some(Duration::from_secs(10)), "all publishes applied").await?;

    let leader_msgs = router.node(&leader).await?.store.read_messages(n + 10).await?;
    assert_eq!(leader_msgs.len(), n);
    for (idx, stored) in leader_msgs.iter().enumerate() {
        assert_eq!(stored.seq_no, idx as u64 + 1);
        assert_eq!(stored.message.value, format!("payload-{}", idx));
    }

    for id in all.iter() {
        let msgs = router.node(id).await?.store.read_messages(n + 10).await?;
        assert_eq!(msgs, leader_msgs, "node {} diverged from the leader", id);
    }

    Ok(())
}
