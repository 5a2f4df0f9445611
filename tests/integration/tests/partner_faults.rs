//! Integration test: a node facing a partner that sends bad or excess proofs.

use std::time::Duration;

use netting_channel::LedgerEvent;
use netting_core::{Locksroot, Message, ProtocolConfig};
use netting_integration_tests::{
    balance, connect, eventually, inject, line, network_with, protocol, signed_proof,
    SETTLE_TIMEOUT,
};
use netting_network::DeliveryFaults;
use netting_node::{TransferOutcome, TransferStatus};

#[tokio::test]
async fn test_stale_proof_closes_only_that_channel() {
    let (network, asset) = line(3, 100, DeliveryFaults::default()).await;
    let (a, b, c) = (network.node(0), network.node(1), network.node(2));

    for _ in 0..2 {
        let handle = a.transfer_async(asset, 5, b.address()).await.unwrap();
        assert_eq!(handle.wait().await, TransferOutcome::Success);
    }
    eventually("both proofs applied", || async move {
        let view = b.channel_snapshot(asset, a.address()).await.unwrap();
        view.end(&a.address()).unwrap().nonce() == 2
    })
    .await;
    let channel = b.channel_snapshot(asset, a.address()).await.unwrap().address;

    let mut events = network.ledger().subscribe();
    let onward = b.transfer_async(asset, 10, c.address()).await.unwrap();
    // an older nonce carrying a different amount than the one applied
    let stale = signed_proof(0, channel, 1, 7, Locksroot::ZERO);
    inject(&network, 0, b.address(), Message::DirectTransfer { balance_proof: stale }).await;

    let closer = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(LedgerEvent::ChannelClosed {
                channel: closed,
                closing_participant,
                ..
            }) = events.recv().await
            {
                if closed == channel {
                    return closing_participant;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(closer, b.address());

    assert_eq!(onward.wait().await, TransferOutcome::Success);
    eventually("the other channel keeps working", || async move {
        balance(c, asset, b.address()).await == 110
    })
    .await;
    assert!(b
        .channel_snapshot(asset, c.address())
        .await
        .unwrap()
        .state
        .is_usable());

    network.advance_blocks(SETTLE_TIMEOUT + 1);
    let net = &network;
    eventually("settled with the applied proof", || async move {
        net.ledger_balance(asset, 0) == 90 && net.ledger_balance(asset, 1) == 110
    })
    .await;
}

#[tokio::test]
async fn test_far_ahead_proofs_are_dropped_and_held_ones_cleared_on_close() {
    let (network, asset) = line(2, 100, DeliveryFaults::default()).await;
    let (a, b) = (network.node(0), network.node(1));
    let channel = b.channel_snapshot(asset, a.address()).await.unwrap().address;

    for nonce in [1_000, u64::MAX, 3] {
        let proof = signed_proof(0, channel, nonce, 1, Locksroot::ZERO);
        inject(&network, 0, b.address(), Message::DirectTransfer { balance_proof: proof }).await;
    }
    // delivery is in order, so once nonce 3 is held the others were seen
    eventually("near proof held", || async move { b.held_proofs() == 1 }).await;

    let handle = a.transfer_async(asset, 5, b.address()).await.unwrap();
    assert_eq!(handle.wait().await, TransferOutcome::Success);
    eventually("first proof applied", || async move {
        balance(b, asset, a.address()).await == 105
    })
    .await;
    // nonce 2 is still missing
    assert_eq!(b.held_proofs(), 1);

    b.close_channel(asset, a.address()).await.unwrap();
    eventually("held proofs dropped with the channel", || async move {
        b.held_proofs() == 0
    })
    .await;
}

#[tokio::test]
async fn test_finished_records_are_forgotten() {
    let config = ProtocolConfig {
        record_retention: 5,
        ..protocol()
    };
    let (mut network, asset) = network_with(config, 2, DeliveryFaults::default()).await;
    connect(&mut network, asset, 0, 1, 100).await;
    network.wait_synced(Duration::from_secs(5)).await.unwrap();
    let (a, b) = (network.node(0), network.node(1));

    let handle = a.mediated_transfer_async(asset, 10, b.address()).await.unwrap();
    assert_eq!(handle.wait().await, TransferOutcome::Success);
    eventually("both sides completed", || async move {
        [a, b].iter().all(|node| {
            let records = node.transfer_records();
            records.len() == 1 && records[0].status == TransferStatus::Completed
        })
    })
    .await;
    assert!(a.transfer_records()[0].finished_at.is_some());

    network.advance_blocks(4);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.transfer_records().len(), 1);

    network.advance_blocks(1);
    eventually("records forgotten", || async move {
        a.transfer_records().is_empty() && b.transfer_records().is_empty()
    })
    .await;
}
