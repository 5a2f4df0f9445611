//! Integration test: opening channels through nodes and the shared ledger.

use netting_channel::{ChannelError, LedgerError, LedgerEvent};
use netting_core::ChannelState;
use netting_integration_tests::{eventually, network};
use netting_network::DeliveryFaults;
use netting_node::NodeError;

#[tokio::test]
async fn test_open_channel_scenario() {
    let (network, asset) = network(4, DeliveryFaults::default()).await;
    let (a, b, c, d) = (network.node(0), network.node(1), network.node(2), network.node(3));
    let mut events = network.ledger().subscribe();

    let ch1 = a.open_channel(asset, b.address(), 30).await.unwrap();
    match events.recv().await.unwrap() {
        LedgerEvent::ChannelOpened {
            channel,
            participant1,
            participant2,
            settle_timeout,
            ..
        } => {
            assert_eq!(channel, ch1);
            assert_eq!(participant1, a.address());
            assert_eq!(participant2, b.address());
            assert_eq!(settle_timeout, 30);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let dup = a.open_channel(asset, b.address(), 30).await;
    assert!(matches!(
        dup,
        Err(NodeError::Channel(ChannelError::Ledger(LedgerError::ChannelExists { .. })))
    ));
    let low = a.open_channel(asset, b.address(), 5).await;
    assert!(matches!(
        low,
        Err(NodeError::Channel(ChannelError::Ledger(LedgerError::InvalidSettleTimeout {
            given: 5,
            min: 6
        })))
    ));
    // neither failure reached the ledger
    assert!(events.try_recv().is_err());

    let ch2 = a.open_channel(asset, c.address(), 30).await.unwrap();
    assert_ne!(ch1, ch2);

    let manager = a.asset_manager(&asset).unwrap();
    assert_eq!(manager.channels().channels_of(&a.address()).len(), 2);
    assert_eq!(manager.channels().channels_of(&b.address()).len(), 1);
    assert_eq!(manager.channels().channels_of(&d.address()).len(), 0);
    assert!(matches!(
        manager.channels().channel_with(&d.address()),
        Err(ChannelError::NoSuchChannel(_))
    ));

    // the original channel is unaffected by the rejected calls
    let info = network.ledger().channel_info(ch1).await.unwrap();
    assert_eq!(info.state, ChannelState::Open);
    assert_eq!(info.settle_timeout, 30);
    assert_eq!(
        network.ledger().channels_of(asset, a.address()).await.unwrap().len(),
        2
    );

    // other nodes mirror both channels from the ledger events
    eventually("partner mirrors channels", || async move {
        let manager = b.asset_manager(&asset).unwrap();
        manager.channels().channels_of(&a.address()).len() == 2
            && manager.channels().channel_with(&a.address()).is_ok()
    })
    .await;
}

#[tokio::test]
async fn test_low_settle_timeout_rejected_for_any_pair() {
    let (mut network, asset) = network(3, DeliveryFaults::default()).await;
    let other = network.register_asset("second-asset").await.unwrap();
    let a = network.node(0);
    eventually("second asset tracked", || async move { a.assets().contains(&other) }).await;

    for partner in [network.node(1).address(), network.node(2).address()] {
        for asset in [asset, other] {
            let result = a.open_channel(asset, partner, 5).await;
            assert!(matches!(
                result,
                Err(NodeError::Channel(ChannelError::Ledger(
                    LedgerError::InvalidSettleTimeout { .. }
                )))
            ));
        }
    }
    assert!(network
        .ledger()
        .channels_of(asset, a.address())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_unknown_asset_is_rejected() {
    let (network, _asset) = network(2, DeliveryFaults::default()).await;
    let unknown = netting_core::Address::derive("netting/asset", b"missing");
    let result = network
        .node(0)
        .open_channel(unknown, network.node(1).address(), 30)
        .await;
    assert!(matches!(result, Err(NodeError::UnknownAsset(_))));
}
