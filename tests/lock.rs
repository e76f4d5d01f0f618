mod common;

use std::time::Duration;

use raftlock::error::RaftError;
use raftlock::lock::DistributedLock;

use common::{eventually, TestCluster};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acquire_release_acquire() {
    let mut cluster = TestCluster::start(3);
    let leader = cluster.wait_for_leader().await;
    let node = cluster.node(&leader.id);
    let a = DistributedLock::new("resource", node.client(), node.locks.clone());
    let b = DistributedLock::new("resource", node.client(), node.locks.clone());

    assert!(a.acquire("A", TIMEOUT).await.unwrap());
    assert!(a.is_locked());
    assert_eq!(b.holder(), Some("A".to_string()));
    assert!(!b.acquire("B", TIMEOUT).await.unwrap());

    // every replica converges on the same holder
    let c = &cluster;
    eventually("A to hold the lock everywhere", TIMEOUT, || async move {
        c.nodes
            .values()
            .all(|node| node.locks.holder("resource").as_deref() == Some("A"))
    })
    .await;

    assert!(!b.release("B", TIMEOUT).await.unwrap());
    assert!(a.release("A", TIMEOUT).await.unwrap());
    assert!(!a.is_locked());
    assert!(b.acquire("B", TIMEOUT).await.unwrap());
    eventually("B to hold the lock everywhere", TIMEOUT, || async move {
        c.nodes
            .values()
            .all(|node| node.locks.holder("resource").as_deref() == Some("B"))
    })
    .await;

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_have_one_winner() {
    let mut cluster = TestCluster::start(3);
    let leader = cluster.wait_for_leader().await;
    let node = cluster.node(&leader.id);
    let a = DistributedLock::new("resource", node.client(), node.locks.clone());
    let b = DistributedLock::new("resource", node.client(), node.locks.clone());

    let (won_a, won_b) = tokio::join!(a.acquire("A", TIMEOUT), b.acquire("B", TIMEOUT));
    let (won_a, won_b) = (won_a.unwrap(), won_b.unwrap());
    assert!(won_a != won_b, "exactly one acquire wins");

    let winner = if won_a { "A" } else { "B" };
    assert_eq!(a.holder().as_deref(), Some(winner));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acquire_on_a_follower_is_redirected() {
    let mut cluster = TestCluster::start(3);
    let leader = cluster.wait_for_leader().await;
    let follower = cluster
        .ids()
        .into_iter()
        .find(|id| *id != leader.id)
        .unwrap();

    let c = &cluster;
    let follower_id = &follower;
    eventually("follower to learn the leader", TIMEOUT, || async move {
        c.status(follower_id).await.leader.is_some()
    })
    .await;

    let node = cluster.node(&follower);
    let lock = DistributedLock::new("resource", node.client(), node.locks.clone());
    assert_eq!(
        lock.acquire("A", TIMEOUT).await,
        Err(RaftError::NotLeader(Some(leader.id.clone())))
    );
    assert!(!lock.is_locked());
    cluster.shutdown().await;
}
