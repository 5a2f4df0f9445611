//! Fixtures shared by the integration tests.

use std::future::Future;
use std::time::Duration;

use netting_core::{Address, BalanceProof, Locksroot, Message, Nonce, ProtocolConfig, TokenAmount};
use netting_crypto::{sign_balance_proof, DefaultCrypto, KeyPair};
use netting_network::{DeliveryFaults, SignedMessage, Transport};
use netting_node::{Network, Node};

/// Settle timeout used by every fixture channel.
pub const SETTLE_TIMEOUT: u64 = 10;

pub fn protocol() -> ProtocolConfig {
    ProtocolConfig::default()
}

/// A network with one asset and `nodes` nodes, no channels yet.
pub async fn network(nodes: usize, faults: DeliveryFaults) -> (Network, Address) {
    network_with(protocol(), nodes, faults).await
}

/// Like [`network`] with a custom protocol configuration.
pub async fn network_with(
    config: ProtocolConfig,
    nodes: usize,
    faults: DeliveryFaults,
) -> (Network, Address) {
    let mut network = Network::new(config, faults);
    let asset = network.register_asset("test-asset").await.expect("register asset");
    for i in 0..nodes {
        network.add_node(&format!("node-{i}")).await.expect("add node");
    }
    (network, asset)
}

/// Open and fund `a <-> b` with `deposit` on both sides.
pub async fn connect(network: &mut Network, asset: Address, a: usize, b: usize, deposit: TokenAmount) {
    network
        .connect(asset, a, b, deposit, deposit, SETTLE_TIMEOUT)
        .await
        .expect("connect");
}

/// Nodes `0 - 1 - ... - (n-1)` in a line, every channel funded with `deposit` per side.
pub async fn line(nodes: usize, deposit: TokenAmount, faults: DeliveryFaults) -> (Network, Address) {
    let (mut network, asset) = network(nodes, faults).await;
    for i in 0..nodes.saturating_sub(1) {
        connect(&mut network, asset, i, i + 1, deposit).await;
    }
    network
        .wait_synced(Duration::from_secs(5))
        .await
        .expect("graphs converge");
    (network, asset)
}

/// Poll `check` until it holds, panicking after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// What `node` may still send to `partner`, per its own view.
pub async fn distributable(node: &Node, asset: Address, partner: Address) -> TokenAmount {
    let channel = node
        .channel_snapshot(asset, partner)
        .await
        .expect("channel exists");
    channel.distributable(&node.address()).expect("participant")
}

/// `node`'s balance in its channel with `partner`, ignoring pending locks.
pub async fn balance(node: &Node, asset: Address, partner: Address) -> TokenAmount {
    let channel = node
        .channel_snapshot(asset, partner)
        .await
        .expect("channel exists");
    channel.balance(&node.address()).expect("participant")
}

/// Key of the fixture node at `index`.
pub fn keypair(index: usize) -> KeyPair {
    KeyPair::from_label(&format!("node-{index}"))
}

/// A balance proof on `channel` signed by the fixture node at `signer`.
pub fn signed_proof(
    signer: usize,
    channel: Address,
    nonce: Nonce,
    transferred: TokenAmount,
    locksroot: Locksroot,
) -> BalanceProof {
    let mut proof = BalanceProof::new(channel, nonce, transferred, locksroot);
    sign_balance_proof(&mut proof, &keypair(signer));
    proof
}

/// Deliver `message` to `recipient` as if the fixture node at `sender` sent it.
pub async fn inject(network: &Network, sender: usize, recipient: Address, message: Message) {
    let payload = SignedMessage::sign(message, &keypair(sender), &DefaultCrypto)
        .and_then(|envelope| envelope.encode())
        .expect("encode message");
    network
        .hub()
        .send(recipient, payload)
        .await
        .expect("deliver message");
}
