//! Integration test: waiting on many transfer handles at once.

use std::time::Duration;

use netting_integration_tests::{balance, connect, eventually, network};
use netting_network::DeliveryFaults;
use netting_node::{wait_all, FailureCause, TransferOutcome};

/// Node 0 reaches nodes 4, 5 and 6 over disjoint two-hop paths; node 7 is isolated.
async fn star() -> (netting_node::Network, netting_core::Address) {
    let (mut network, asset) = network(8, DeliveryFaults::default()).await;
    for (x, y) in [(0, 1), (0, 2), (0, 3), (1, 4), (2, 5), (3, 6)] {
        connect(&mut network, asset, x, y, 100).await;
    }
    network.wait_synced(Duration::from_secs(5)).await.unwrap();
    (network, asset)
}

#[tokio::test]
async fn test_wait_all_on_disjoint_paths() {
    let (network, asset) = star().await;
    let a = network.node(0);

    let mut handles = Vec::new();
    for target in [4, 5, 6] {
        handles.push(
            a.mediated_transfer_async(asset, 5, network.node(target).address())
                .await
                .unwrap(),
        );
    }
    let outcomes = wait_all(&handles).await;
    assert_eq!(outcomes, vec![TransferOutcome::Success; 3]);
    // outcomes are fixed once observed
    assert_eq!(wait_all(&handles).await, outcomes);
    assert!(handles.iter().all(|h| h.is_resolved()));

    for (mediator, target) in [(1, 4), (2, 5), (3, 6)] {
        let (m, t) = (network.node(mediator), network.node(target));
        eventually("target credited", || async move {
            balance(t, asset, m.address()).await == 105
        })
        .await;
    }
}

#[tokio::test]
async fn test_wait_all_keeps_order_with_failures() {
    let (network, asset) = star().await;
    let a = network.node(0);

    let reachable = a
        .mediated_transfer_async(asset, 5, network.node(4).address())
        .await
        .unwrap();
    let isolated = a
        .mediated_transfer_async(asset, 5, network.node(7).address())
        .await
        .unwrap();
    let too_large = a
        .mediated_transfer_async(asset, 500, network.node(5).address())
        .await
        .unwrap();

    let outcomes = wait_all(&[reachable, isolated, too_large]).await;
    assert_eq!(
        outcomes,
        vec![
            TransferOutcome::Success,
            TransferOutcome::Failed(FailureCause::NoPathFound),
            TransferOutcome::Failed(FailureCause::NoPathFound),
        ]
    );
}
