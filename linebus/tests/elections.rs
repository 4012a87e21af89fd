use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use linebus::storage::LogStore;
use linebus::Config;
use linebus::State;
use maplit::btreeset;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;

use fixtures::BrokerRouter;

mod fixtures;

/// Single-node cluster test.
///
/// What does this test do?
///
/// - brings one node online with an empty peer set.
/// - asserts it elects itself leader in term 1.
/// - publishes one message and asserts the log holds the term-opening
///   noop plus the publish, all applied.
///
/// RUST_LOG=linebus,elections=trace cargo test -p linebus --test elections
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_becomes_leader() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(BrokerRouter::new(config));
    router.new_broker_node(0).await;

    tracing::info!("--- seeding empty membership");
    router.seed_membership().await?;

    router
        .wait_for_state(&btreeset![0], State::Leader, Some(Duration::from_secs(2)), "n0 -> leader")
        .await?;
    let metrics = router.wait(&0, None).await?.log(1, "noop applied").await?;
    assert_eq!(metrics.current_term, 1);

    tracing::info!("--- publishing one message");
    let resp = router.client_publish(0, "news", "hello").await;
    assert_eq!(resp.index, 2);

    router.wait_for_log(&btreeset![0], 2, Some(Duration::from_secs(1)), "publish applied").await?;
    let stored = router.node(&0).await?.store.read_messages(10).await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message.topic, "news");
    assert_eq!(stored[0].message.value, "hello");

    Ok(())
}

/// Three-node election test.
///
/// What does this test do?
///
/// - brings three nodes online and feeds all of them the full membership.
/// - asserts that within the expected election time exactly one node is
///   leader and the others follow it in the same term.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn three_node_cluster_elects_single_leader() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(BrokerRouter::new(config));
    router.new_broker_node(0).await;
    router.new_broker_node(1).await;
    router.new_broker_node(2).await;

    tracing::info!("--- seeding full membership");
    router.seed_membership().await?;

    let leader = router.wait_for_any_leader(Duration::from_secs(2), "initial election").await?;
    let all: BTreeSet<u64> = btreeset![0, 1, 2];
    let followers: BTreeSet<u64> = all.iter().copied().filter(|id| *id != leader).collect();
    router
        .wait_for_state(&followers, State::Follower, Some(Duration::from_secs(2)), "others follow")
        .await?;

    // Let the opening noop settle everywhere, then check the cluster is
    // uniform: one leader, one term, one log.
    router.wait_for_log(&all, 1, Some(Duration::from_secs(2)), "noop replicated").await?;
    router.assert_stable_cluster(None, None).await;

    let metrics = router.latest_metrics().await;
    let leaders: Vec<_> = metrics.iter().filter(|m| m.state == State::Leader).collect();
    assert_eq!(leaders.len(), 1, "expected exactly one leader");
    let term = leaders[0].current_term;
    for m in metrics.iter() {
        assert_eq!(m.current_term, term, "node {} disagrees on the term", m.id);
    }

    Ok(())
}

/// Leader failure test.
///
/// What does this test do?
///
/// - brings a three-node cluster to steady state.
/// - kills the leader and shrinks the membership view, as the scanner
///   would after the grace window.
/// - asserts a new leader emerges among the survivors with a strictly
///   greater term.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn leader_failure_elects_new_leader_with_greater_term() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build config"));
    let router = Arc::new(BrokerRouter::new(config));
    router.new_broker_node(0).await;
    router.new_broker_node(1).await;
    router.new_broker_node(2).await;
    router.seed_membership().await?;

    let old_leader = router.wait_for_any_leader(Duration::from_secs(2), "initial election").await?;
    let all: BTreeSet<u64> = btreeset![0, 1, 2];
    router.wait_for_log(&all, 1, Some(Duration::from_secs(2)), "noop replicated").await?;
    let old_term = router.node(&old_leader).await?.raft.metrics().borrow().current_term;

    tracing::info!("--- killing leader {}", old_leader);
    router.remove_node(old_leader).await;
    let survivors: BTreeSet<u64> = all.iter().copied().filter(|id| *id != old_leader).collect();
    router.set_membership(survivors.clone()).await?;

    let new_leader = router.wait_for_any_leader(Duration::from_secs(2), "re-election").await?;
    assert!(survivors.contains(&new_leader));

    let metrics = router.node(&new_leader).await?.raft.metrics().borrow().clone();
    assert!(
        metrics.current_term > old_term,
        "new term {} should exceed old term {}",
        metrics.current_term,
        old_term
    );

    // Exactly one of the survivors leads.
    let leaders: Vec<_> = router
        .latest_metrics()
        .await
        .into_iter()
        .filter(|m| m.state == State::Leader)
        .collect();
    assert_eq!(leaders.len(), 1);

    Ok(())
}
