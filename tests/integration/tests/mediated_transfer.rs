//! Integration test: hash-locked transfers across several hops.

use std::time::Duration;

use netting_channel::LedgerEvent;
use netting_core::{Message, ProtocolConfig};
use netting_integration_tests::{
    balance, connect, distributable, eventually, inject, keypair, line, network, protocol,
    SETTLE_TIMEOUT,
};
use netting_network::DeliveryFaults;
use netting_node::{FailureCause, Network, NodeError, Role, TransferOutcome, TransferStatus};

#[tokio::test]
async fn test_mediated_transfer_moves_value_hop_by_hop() {
    let (network, asset) = line(3, 100, DeliveryFaults::default()).await;
    let (a, b, c) = (network.node(0), network.node(1), network.node(2));

    let handle = a
        .mediated_transfer_async(asset, 10, c.address())
        .await
        .unwrap();
    assert_eq!(handle.wait().await, TransferOutcome::Success);
    assert_eq!(handle.wait().await, TransferOutcome::Success);

    eventually("every hop settled off-chain", || async move {
        balance(a, asset, b.address()).await == 90
            && balance(b, asset, a.address()).await == 110
            && balance(b, asset, c.address()).await == 90
            && balance(c, asset, b.address()).await == 110
    })
    .await;

    // no value created or destroyed: the mediator nets to zero
    let mediator_net = balance(b, asset, a.address()).await + balance(b, asset, c.address()).await;
    assert_eq!(mediator_net, 200);
    assert_eq!(distributable(a, asset, b.address()).await, 90);

    let roles: Vec<(Role, TransferStatus)> = [a, b, c]
        .iter()
        .map(|node| {
            let records = node.transfer_records();
            assert_eq!(records.len(), 1);
            (records[0].role, records[0].status)
        })
        .collect();
    assert_eq!(roles[0], (Role::Initiator, TransferStatus::Completed));
    assert_eq!(roles[1].0, Role::Mediator);
    assert_eq!(roles[2].0, Role::Target);

    eventually("mediator and target complete", || async move {
        b.transfer_records()[0].status == TransferStatus::Completed
            && c.transfer_records()[0].status == TransferStatus::Completed
    })
    .await;
}

#[tokio::test]
async fn test_transfer_prefers_direct_channel() {
    let (network, asset) = line(2, 100, DeliveryFaults::default()).await;
    let (a, b) = (network.node(0), network.node(1));

    let handle = a.transfer_async(asset, 30, b.address()).await.unwrap();
    assert_eq!(handle.wait().await, TransferOutcome::Success);
    eventually("direct transfer received", || async move {
        balance(b, asset, a.address()).await == 130
    })
    .await;
    assert!(a.transfer_records().is_empty());
}

#[tokio::test]
async fn test_invalid_transfers_are_rejected_synchronously() {
    let (network, asset) = line(2, 100, DeliveryFaults::default()).await;
    let a = network.node(0);
    assert!(matches!(
        a.transfer_async(asset, 0, network.node(1).address()).await,
        Err(NodeError::InvalidTransfer(_))
    ));
    assert!(matches!(
        a.transfer_async(asset, 5, a.address()).await,
        Err(NodeError::InvalidTransfer(_))
    ));
}

/// Nodes A, B, C, D with channels A-B, A-C, B-D, C-D of 50 per side.
async fn diamond() -> (netting_node::Network, netting_core::Address) {
    let (mut network, asset) = network(4, DeliveryFaults::default()).await;
    for (x, y) in [(0, 1), (0, 2), (1, 3), (2, 3)] {
        connect(&mut network, asset, x, y, 50).await;
    }
    network.wait_synced(Duration::from_secs(5)).await.unwrap();
    (network, asset)
}

/// Spend a mediator's whole deposit towards D. Remote nodes keep seeing the deposit.
async fn drain_to_target(network: &netting_node::Network, asset: netting_core::Address, mediator: usize) {
    let (m, d) = (network.node(mediator), network.node(3));
    let handle = m.transfer_async(asset, 50, d.address()).await.unwrap();
    assert_eq!(handle.wait().await, TransferOutcome::Success);
    eventually("drain received", || async move {
        balance(d, asset, m.address()).await == 100
    })
    .await;
}

#[tokio::test]
async fn test_refusing_hop_is_routed_around() {
    let (network, asset) = diamond().await;
    drain_to_target(&network, asset, 1).await;
    let (a, c, d) = (network.node(0), network.node(2), network.node(3));

    let handle = a.mediated_transfer_async(asset, 10, d.address()).await.unwrap();
    assert_eq!(handle.wait().await, TransferOutcome::Success);
    eventually("paid through the funded mediator", || async move {
        balance(d, asset, c.address()).await == 60
    })
    .await;
}

#[tokio::test]
async fn test_failure_only_after_exhausting_paths() {
    let (network, asset) = diamond().await;
    drain_to_target(&network, asset, 1).await;
    drain_to_target(&network, asset, 2).await;
    let (a, b, c, d) = (network.node(0), network.node(1), network.node(2), network.node(3));

    let handle = a.mediated_transfer_async(asset, 10, d.address()).await.unwrap();
    assert_eq!(
        handle.wait().await,
        TransferOutcome::Failed(FailureCause::NoPathFound)
    );

    // both attempts were refused and their locks removed
    let records = a.transfer_records();
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r.status == TransferStatus::Failed));
    assert_eq!(distributable(a, asset, b.address()).await, 50);
    assert_eq!(distributable(a, asset, c.address()).await, 50);
    eventually("mediators dropped the removed locks", || async move {
        let from_b = b.channel_snapshot(asset, a.address()).await.unwrap();
        let from_c = c.channel_snapshot(asset, a.address()).await.unwrap();
        from_b.end(&a.address()).unwrap().locks.is_empty()
            && from_c.end(&a.address()).unwrap().locks.is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_every_candidate_route_is_tried() {
    // A (0) reaches T (11) through ten mediators, all but one already drained
    let (mut network, asset) = network(12, DeliveryFaults::default()).await;
    let mediators: Vec<usize> = (1..=10).collect();
    for &m in &mediators {
        connect(&mut network, asset, 0, m, 50).await;
        connect(&mut network, asset, m, 11, 50).await;
    }
    network.wait_synced(Duration::from_secs(5)).await.unwrap();

    // routes are tried in neighbour address order; fund only the last one
    let funded = mediators
        .iter()
        .copied()
        .max_by_key(|&m| network.node(m).address())
        .unwrap();
    let target = network.node(11);
    for &m in mediators.iter().filter(|&&m| m != funded) {
        let mediator = network.node(m);
        let handle = mediator.transfer_async(asset, 50, target.address()).await.unwrap();
        assert_eq!(handle.wait().await, TransferOutcome::Success);
        eventually("drain received", || async move {
            balance(target, asset, mediator.address()).await == 100
        })
        .await;
    }

    let (a, last) = (network.node(0), network.node(funded));
    let handle = a.mediated_transfer_async(asset, 10, target.address()).await.unwrap();
    assert_eq!(handle.wait().await, TransferOutcome::Success);
    eventually("paid through the last candidate", || async move {
        balance(target, asset, last.address()).await == 60
    })
    .await;
    let failed = a
        .transfer_records()
        .iter()
        .filter(|r| r.status == TransferStatus::Failed)
        .count();
    assert_eq!(failed, mediators.len() - 1);
}

#[tokio::test]
async fn test_short_lock_is_refused_and_rerouted() {
    // Diamond A, B, C, D where the mediator tried first wants a wider margin.
    let (b_addr, c_addr) = (keypair(1).address(), keypair(2).address());
    let strict = if b_addr < c_addr { 1 } else { 2 };
    let lenient = 3 - strict;

    let mut network = Network::new(protocol(), DeliveryFaults::default());
    let asset = network.register_asset("test-asset").await.unwrap();
    for i in 0..4 {
        let label = format!("node-{i}");
        if i == strict {
            let config = ProtocolConfig {
                reveal_timeout: 5,
                ..protocol()
            };
            network.add_node_with(&label, config).await.unwrap();
        } else {
            network.add_node(&label).await.unwrap();
        }
    }
    for (x, y) in [(0, 1), (0, 2), (1, 3), (2, 3)] {
        connect(&mut network, asset, x, y, 50).await;
    }
    network.wait_synced(Duration::from_secs(5)).await.unwrap();

    let (a, s, l, d) = (
        network.node(0),
        network.node(strict),
        network.node(lenient),
        network.node(3),
    );
    let handle = a.mediated_transfer_async(asset, 10, d.address()).await.unwrap();
    assert_eq!(handle.wait().await, TransferOutcome::Success);
    eventually("paid through the lenient mediator", || async move {
        balance(d, asset, l.address()).await == 60
    })
    .await;
    // the refused lock never moved value through the strict mediator
    eventually("refused lock removed", || async move {
        let view = s.channel_snapshot(asset, a.address()).await.unwrap();
        view.end(&a.address()).unwrap().locks.is_empty()
    })
    .await;
    assert_eq!(balance(s, asset, a.address()).await, 50);
    assert_eq!(balance(d, asset, s.address()).await, 50);
}

#[tokio::test]
async fn test_secret_after_outgoing_expiry_is_not_forwarded() {
    let (network, asset) = line(3, 100, DeliveryFaults::default()).await;
    let (a, b, c) = (network.node(0), network.node(1), network.node(2));
    network.hub().unregister(&c.address());

    let handle = a.mediated_transfer_async(asset, 10, c.address()).await.unwrap();
    eventually("mediator forwarded", || async move {
        b.transfer_records().len() == 1
    })
    .await;
    let forwarded = b.transfer_records()[0].clone();
    let outgoing = forwarded.outgoing.unwrap();
    let incoming = forwarded.incoming.unwrap();
    let secret = a.transfer_record(&forwarded.hashlock).unwrap().secret.unwrap();

    // past the lock towards C, still inside the lock from A
    network.advance_blocks(outgoing.expiration - network.clock().now());
    assert!(network.clock().now() < incoming.expiration);
    inject(&network, 2, b.address(), Message::RevealSecret { secret }).await;

    eventually("mediator gave up on the transfer", || async move {
        b.transfer_records()[0].status == TransferStatus::Expired
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.transfer_records()[0].secret.is_none());
    assert_eq!(
        a.transfer_record(&forwarded.hashlock).unwrap().status,
        TransferStatus::Pending
    );
    assert!(!handle.is_resolved());

    network.advance_blocks(20);
    assert_eq!(
        handle.wait().await,
        TransferOutcome::Failed(FailureCause::NoPathFound)
    );
}

#[tokio::test]
async fn test_unanswered_lock_expires_and_is_removed() {
    let (network, asset) = line(3, 100, DeliveryFaults::default()).await;
    let (a, b, c) = (network.node(0), network.node(1), network.node(2));
    network.hub().unregister(&c.address());

    let handle = a.mediated_transfer_async(asset, 10, c.address()).await.unwrap();
    eventually("mediator forwarded", || async move {
        b.transfer_records().len() == 1
    })
    .await;
    assert!(!handle.is_resolved());
    assert_eq!(distributable(a, asset, b.address()).await, 90);

    network.advance_blocks(20);
    assert_eq!(
        handle.wait().await,
        TransferOutcome::Failed(FailureCause::NoPathFound)
    );
    eventually("expired lock removed on both sides", || async move {
        let ours = distributable(a, asset, b.address()).await == 100;
        let theirs = b.channel_snapshot(asset, a.address()).await.unwrap();
        ours && theirs.end(&a.address()).unwrap().locks.is_empty()
    })
    .await;
    assert_eq!(a.transfer_records()[0].status, TransferStatus::Expired);
}

#[tokio::test]
async fn test_settlement_pays_out_off_chain_balances() {
    let (network, asset) = line(3, 100, DeliveryFaults::default()).await;
    let (a, b, c) = (network.node(0), network.node(1), network.node(2));

    let handle = a.mediated_transfer_async(asset, 10, c.address()).await.unwrap();
    assert_eq!(handle.wait().await, TransferOutcome::Success);
    eventually("mediator paid", || async move {
        balance(b, asset, a.address()).await == 110
    })
    .await;

    let mut events = network.ledger().subscribe();
    a.close_channel(asset, b.address()).await.unwrap();

    // settling inside the window is a ledger error surfaced unchanged
    assert!(matches!(
        a.settle_channel(asset, b.address()).await,
        Err(NodeError::Ledger(_))
    ));

    // the partner answers the close with the initiator's latest proof
    let updated = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(LedgerEvent::TransferUpdated { submitter, .. }) = events.recv().await {
                return submitter;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(updated, b.address());

    network.advance_blocks(SETTLE_TIMEOUT + 1);
    let net = &network;
    eventually("channel settled", || async move {
        net.ledger_balance(asset, 0) == 90 && net.ledger_balance(asset, 1) == 110
    })
    .await;
    // the untouched channel still holds its deposits
    assert_eq!(network.ledger_balance(asset, 2), 0);
    let total: u128 = (0..3).map(|i| network.ledger_balance(asset, i)).sum::<u128>() + 200;
    assert_eq!(total, 400);
    assert_eq!(balance(c, asset, b.address()).await, 110);
}
