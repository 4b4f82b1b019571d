//! Log replication and state-machine safety (§8, properties 3 and 4): once a write commits on
//! the leader, every reachable follower eventually applies the identical value, and a follower
//! that was briefly partitioned catches back up rather than diverging.

mod fixtures;

use std::time::Duration;

use fixtures::members;
use fixtures::test_config;
use fixtures::TestRouter;

#[tokio::test]
async fn committed_write_replicates_to_every_follower() {
    let router = TestRouter::new();
    router.new_cluster(test_config(), members(&[1, 2, 3])).await;

    let leader = router.wait_for_metrics(1, Duration::from_secs(2), |m| m.current_leader.is_some()).await.unwrap().current_leader.unwrap();

    router.client_write(leader, "x", 42).await.unwrap();

    for id in [1, 2, 3] {
        router.wait_for_metrics(id, Duration::from_secs(2), |m| m.last_applied >= 1).await.unwrap();
        let storage = router.storage(id).await;
        assert_eq!(storage.get("x"), Some(42), "node {} did not apply the committed write", id);
    }
}

#[tokio::test]
async fn partitioned_follower_catches_up_after_rejoining() {
    let router = TestRouter::new();
    router.new_cluster(test_config(), members(&[1, 2, 3])).await;

    let leader = router.wait_for_metrics(1, Duration::from_secs(2), |m| m.current_leader.is_some()).await.unwrap().current_leader.unwrap();
    let follower = [1, 2, 3].into_iter().find(|id| *id != leader).unwrap();

    router.isolate(follower).await;
    router.client_write(leader, "a", 1).await.unwrap();
    router.client_write(leader, "b", 2).await.unwrap();

    router.restore(follower).await;
    router.wait_for_metrics(follower, Duration::from_secs(3), |m| m.last_applied >= 2).await.unwrap();

    let storage = router.storage(follower).await;
    assert_eq!(storage.get("a"), Some(1));
    assert_eq!(storage.get("b"), Some(2));
}
