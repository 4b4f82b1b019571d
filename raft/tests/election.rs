//! Election safety (§8, property 1): a freshly started static-membership cluster elects
//! exactly one leader, and losing contact with that leader causes a new, different leader to
//! take over without ever producing two leaders in the same term.

mod fixtures;

use std::collections::HashSet;
use std::time::Duration;

use fixtures::members;
use fixtures::test_config;
use fixtures::TestRouter;
use maplit::hashset;

#[tokio::test]
async fn cluster_elects_exactly_one_leader() {
    let router = TestRouter::new();
    router.new_cluster(test_config(), members(&[1, 2, 3])).await;

    let metrics = router.wait_for_metrics(1, Duration::from_secs(2), |m| m.current_leader.is_some()).await.unwrap();
    let leader_id = metrics.current_leader.unwrap();

    let all = router.latest_metrics().await;
    let leaders: Vec<_> = all.iter().filter(|m| m.state.is_leader()).collect();
    assert_eq!(leaders.len(), 1, "expected exactly one leader, got {:?}", leaders);
    assert_eq!(leaders[0].id, leader_id);

    for m in &all {
        assert_eq!(m.current_leader, Some(leader_id), "node {} disagrees on the leader", m.id);
        let voters: HashSet<_> = m.membership_config.iter().copied().collect();
        assert_eq!(voters, hashset! {1, 2, 3}, "node {} reports an unexpected voter set", m.id);
    }
}

#[tokio::test]
async fn isolating_the_leader_elects_a_new_one() {
    let router = TestRouter::new();
    router.new_cluster(test_config(), members(&[1, 2, 3])).await;

    let first_leader = router.wait_for_metrics(1, Duration::from_secs(2), |m| m.current_leader.is_some()).await.unwrap().current_leader.unwrap();
    router.isolate(first_leader).await;

    let survivor = [1, 2, 3].into_iter().find(|id| *id != first_leader).unwrap();
    let metrics = router
        .wait_for_metrics(survivor, Duration::from_secs(3), move |m| m.current_leader.is_some() && m.current_leader != Some(first_leader))
        .await
        .unwrap();
    let new_leader = metrics.current_leader.unwrap();
    assert_ne!(new_leader, first_leader);
    assert_eq!(router.leader().await, Some(new_leader));
}
