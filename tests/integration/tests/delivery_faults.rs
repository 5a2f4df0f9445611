//! Integration test: transfers over a transport that duplicates and reorders.

use std::time::Duration;

use netting_channel::LedgerEvent;
use netting_integration_tests::{balance, eventually, line, SETTLE_TIMEOUT};
use netting_network::DeliveryFaults;
use netting_node::{wait_all, TransferOutcome};

fn faulty() -> DeliveryFaults {
    DeliveryFaults {
        duplicate_probability: 1.0,
        max_jitter_ms: 5,
    }
}

#[tokio::test]
async fn test_direct_transfers_survive_duplicates_and_reordering() {
    let (network, asset) = line(2, 100, faulty()).await;
    let (a, b) = (network.node(0), network.node(1));

    let mut handles = Vec::new();
    for _ in 0..10 {
        handles.push(a.transfer_async(asset, 1, b.address()).await.unwrap());
    }
    assert_eq!(wait_all(&handles).await, vec![TransferOutcome::Success; 10]);

    eventually("every proof applied once", || async move {
        let channel = b.channel_snapshot(asset, a.address()).await.unwrap();
        channel.end(&a.address()).unwrap().nonce() == 10
            && channel.balance(&b.address()).unwrap() == 110
    })
    .await;
    // duplicates never close the channel
    let channel = b.channel_snapshot(asset, a.address()).await.unwrap();
    assert!(channel.state.is_usable());
}

#[tokio::test]
async fn test_mediated_transfers_survive_duplicates_and_reordering() {
    let (network, asset) = line(4, 100, faulty()).await;
    let (first, last) = (network.node(0), network.node(3));
    let penultimate = network.node(2);

    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(
            first
                .mediated_transfer_async(asset, 3, last.address())
                .await
                .unwrap(),
        );
    }
    assert_eq!(wait_all(&handles).await, vec![TransferOutcome::Success; 5]);
    eventually("target credited exactly once per transfer", || async move {
        balance(last, asset, penultimate.address()).await == 115
    })
    .await;
    let second = network.node(1);
    eventually("initiator unlocked every hop", || async move {
        balance(first, asset, second.address()).await == 85
    })
    .await;
}

#[tokio::test]
async fn test_contested_close_settles_with_latest_nonce() {
    let (network, asset) = line(2, 100, faulty()).await;
    let (a, b) = (network.node(0), network.node(1));

    for _ in 0..3 {
        let handle = a.transfer_async(asset, 5, b.address()).await.unwrap();
        assert_eq!(handle.wait().await, TransferOutcome::Success);
    }
    eventually("partner holds the third proof", || async move {
        let channel = b.channel_snapshot(asset, a.address()).await.unwrap();
        channel.end(&a.address()).unwrap().nonce() == 3
    })
    .await;

    let mut events = network.ledger().subscribe();
    a.close_channel(asset, b.address()).await.unwrap();
    let nonce = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(LedgerEvent::TransferUpdated { nonce, .. }) = events.recv().await {
                return nonce;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(nonce, 3);

    network.advance_blocks(SETTLE_TIMEOUT + 1);
    let net = &network;
    eventually("settled with the latest balances", || async move {
        net.ledger_balance(asset, 0) == 85 && net.ledger_balance(asset, 1) == 115
    })
    .await;
}
