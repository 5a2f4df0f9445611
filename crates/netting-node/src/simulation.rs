//! In-process network of netting nodes sharing one ledger, hub, and clock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;

use netting_channel::InMemoryLedger;
use netting_core::{Address, BlockClock, BlockNumber, BlockTimeout, ProtocolConfig, TokenAmount};
use netting_crypto::{Crypto, DefaultCrypto, KeyPair};
use netting_network::{DeliveryFaults, LocalHub};
use netting_routing::ExcludedEdges;

use crate::config::{NettingConfig, SimulationConfig, SimulationMode};
use crate::error::NodeError;
use crate::handle::{wait_all, AsyncTransferHandle, TransferOutcome};
use crate::node::{Node, NodeServices};

/// A channel opened through [`Network::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedChannel {
    pub asset: Address,
    pub address: Address,
    pub participants: [Address; 2],
    pub deposits: [TokenAmount; 2],
}

/// Result of a simulated workload.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub mode: SimulationMode,
    pub transfers: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u128,
    pub transfers_per_second: f64,
    /// Mean time per transfer; only measured in latency mode.
    pub mean_latency_ms: Option<f64>,
}

pub struct Network {
    config: ProtocolConfig,
    clock: BlockClock,
    crypto: Arc<dyn Crypto>,
    ledger: Arc<InMemoryLedger>,
    hub: Arc<LocalHub>,
    nodes: Vec<Node>,
    assets: Vec<Address>,
    channels: Vec<OpenedChannel>,
}

impl Network {
    pub fn new(config: ProtocolConfig, faults: DeliveryFaults) -> Self {
        let clock = BlockClock::new(1);
        let crypto: Arc<dyn Crypto> = Arc::new(DefaultCrypto);
        let ledger = Arc::new(InMemoryLedger::new(clock.clone(), &config, crypto.clone()));
        Self {
            config,
            clock,
            crypto,
            ledger,
            hub: LocalHub::with_faults(faults),
            nodes: Vec::new(),
            assets: Vec::new(),
            channels: Vec::new(),
        }
    }

    /// Build the network described by `config`: assets, nodes, and a ring of
    /// funded channels, synced into every node's graph.
    pub async fn from_config(config: &NettingConfig) -> Result<Self, NodeError> {
        let sim = &config.simulation;
        let mut network = Self::new(config.protocol.clone(), config.faults.clone());
        for i in 0..sim.assets {
            network.register_asset(&format!("asset-{i}")).await?;
        }
        for i in 0..sim.nodes {
            network.add_node(&format!("node-{i}")).await?;
        }

        let deposit = sim.deposit_per_channel();
        let assets = network.assets.clone();
        for asset in assets {
            let mut pairs = HashSet::new();
            for i in 0..sim.nodes {
                for k in 1..=sim.channels_per_node {
                    let j = (i + k) % sim.nodes;
                    if i == j || !pairs.insert((i.min(j), i.max(j))) {
                        continue;
                    }
                    network
                        .connect(asset, i, j, deposit, deposit, sim.settle_timeout)
                        .await?;
                }
            }
        }
        network.wait_synced(Duration::from_secs(10)).await?;
        tracing::info!(
            nodes = network.nodes.len(),
            assets = network.assets.len(),
            channels = network.channels.len(),
            "simulated network ready"
        );
        Ok(network)
    }

    pub fn ledger(&self) -> &Arc<InMemoryLedger> {
        &self.ledger
    }

    pub fn clock(&self) -> &BlockClock {
        &self.clock
    }

    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn assets(&self) -> &[Address] {
        &self.assets
    }

    pub fn channels(&self) -> &[OpenedChannel] {
        &self.channels
    }

    pub async fn register_asset(&mut self, label: &str) -> Result<Address, NodeError> {
        let asset = Address::derive("netting/asset", label.as_bytes());
        self.ledger.register_asset(asset).await?;
        self.assets.push(asset);
        Ok(asset)
    }

    /// Start a node with a key derived from `label`. Returns its index.
    pub async fn add_node(&mut self, label: &str) -> Result<usize, NodeError> {
        let config = self.config.clone();
        self.add_node_with(label, config).await
    }

    /// Like [`Network::add_node`], but the node runs with its own protocol parameters.
    pub async fn add_node_with(&mut self, label: &str, config: ProtocolConfig) -> Result<usize, NodeError> {
        let keypair = KeyPair::from_label(label);
        let address = keypair.address();
        let inbound = self.hub.register(address)?;
        let services = NodeServices {
            ledger: Arc::new(self.ledger.client(address)),
            transport: self.hub.clone(),
            inbound,
            clock: self.clock.clone(),
            crypto: self.crypto.clone(),
        };
        let node = Node::start(keypair, config, services).await?;
        tracing::debug!(label, node = %address, "node added");
        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }

    /// Mint the deposits, open a channel from node `a` to node `b`, and fund both sides.
    pub async fn connect(
        &mut self,
        asset: Address,
        a: usize,
        b: usize,
        deposit_a: TokenAmount,
        deposit_b: TokenAmount,
        settle_timeout: BlockTimeout,
    ) -> Result<Address, NodeError> {
        let (addr_a, addr_b) = (self.nodes[a].address(), self.nodes[b].address());
        let address = self.nodes[a]
            .open_channel(asset, addr_b, settle_timeout)
            .await?;
        // the partner learns of the channel from the ledger event
        self.wait_for_channel(b, asset, addr_a, Duration::from_secs(5)).await?;
        for (index, partner, amount) in [(a, addr_b, deposit_a), (b, addr_a, deposit_b)] {
            if amount > 0 {
                self.ledger.mint(asset, self.nodes[index].address(), amount);
                self.nodes[index].deposit(asset, partner, amount).await?;
            }
        }
        self.channels.push(OpenedChannel {
            asset,
            address,
            participants: [addr_a, addr_b],
            deposits: [deposit_a, deposit_b],
        });
        Ok(address)
    }

    async fn wait_for_channel(
        &self,
        index: usize,
        asset: Address,
        partner: Address,
        limit: Duration,
    ) -> Result<(), NodeError> {
        let manager = self.nodes[index].asset_manager(&asset)?;
        let ready = async {
            while manager.channels().channel_with(&partner).is_err() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        };
        tokio::time::timeout(limit, ready)
            .await
            .map_err(|_| NodeError::Timeout(format!("channel with {} never mirrored", partner)))
    }

    /// Wait until every node's graph shows every opened channel with its deposits.
    pub async fn wait_synced(&self, limit: Duration) -> Result<(), NodeError> {
        let synced = || {
            self.nodes.iter().all(|node| {
                self.channels.iter().all(|c| {
                    let Ok(manager) = node.asset_manager(&c.asset) else {
                        return false;
                    };
                    let graph = manager.graph();
                    graph.capacity(&c.participants[0], &c.participants[1]) == Some(c.deposits[0])
                        && graph.capacity(&c.participants[1], &c.participants[0]) == Some(c.deposits[1])
                })
            })
        };
        let ready = async {
            while !synced() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        };
        tokio::time::timeout(limit, ready)
            .await
            .map_err(|_| NodeError::Timeout("channel graphs did not converge".into()))
    }

    pub fn advance_blocks(&self, blocks: BlockNumber) -> BlockNumber {
        self.clock.advance(blocks)
    }

    /// Advance the clock by one block every `interval` until the task is aborted.
    pub fn start_block_production(&self, interval: Duration) -> JoinHandle<()> {
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                clock.advance(1);
            }
        })
    }

    /// Ledger token balance of node `index`.
    pub fn ledger_balance(&self, asset: Address, index: usize) -> TokenAmount {
        self.ledger.balance_of(asset, self.nodes[index].address())
    }

    /// Targets `hops` edges away from node `source`, preferring nodes it has
    /// no direct channel with.
    pub fn targets_at_distance(
        &self,
        source: usize,
        asset: Address,
        hops: usize,
        amount: TokenAmount,
    ) -> Result<Vec<Address>, NodeError> {
        let node = &self.nodes[source];
        let manager = node.asset_manager(&asset)?;
        let me = node.address();
        let mut targets: Vec<Address> = manager
            .graph()
            .paths_of_length(&me, hops, amount, &ExcludedEdges::new())
            .iter()
            .map(|path| path.target())
            .collect();
        targets.sort();
        targets.dedup();
        let remote: Vec<Address> = targets
            .iter()
            .copied()
            .filter(|t| manager.channels().channel_with(t).is_err())
            .collect();
        Ok(if remote.is_empty() { targets } else { remote })
    }

    /// Run the configured workload from node 0 on every asset.
    pub async fn run_workload(&self, sim: &SimulationConfig) -> Result<SimulationReport, NodeError> {
        let initiator = self
            .nodes
            .first()
            .ok_or_else(|| NodeError::InvalidTransfer("network has no nodes".into()))?;

        let mut outcomes: Vec<TransferOutcome> = Vec::new();
        let started = Instant::now();
        for asset in &self.assets {
            let targets = self.targets_at_distance(0, *asset, 2, sim.transfer_amount())?;
            if targets.is_empty() {
                return Err(NodeError::InvalidTransfer(format!(
                    "no targets two hops from {}",
                    initiator.address()
                )));
            }
            match sim.mode {
                SimulationMode::Throughput => {
                    let mut handles: Vec<AsyncTransferHandle> = Vec::with_capacity(sim.transfers);
                    for i in 0..sim.transfers {
                        let target = targets[i % targets.len()];
                        handles.push(initiator.transfer_async(*asset, sim.transfer_amount(), target).await?);
                    }
                    outcomes.extend(wait_all(&handles).await);
                }
                SimulationMode::Latency => {
                    for i in 0..sim.transfers {
                        let target = targets[i % targets.len()];
                        let handle = initiator.transfer_async(*asset, sim.transfer_amount(), target).await?;
                        outcomes.push(handle.wait().await);
                    }
                }
            }
        }
        let elapsed = started.elapsed();

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        let transfers = outcomes.len();
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let report = SimulationReport {
            mode: sim.mode,
            transfers,
            succeeded,
            failed: transfers - succeeded,
            elapsed_ms: elapsed.as_millis(),
            transfers_per_second: transfers as f64 / secs,
            mean_latency_ms: match sim.mode {
                SimulationMode::Latency if transfers > 0 => {
                    Some(elapsed.as_secs_f64() * 1000.0 / transfers as f64)
                }
                _ => None,
            },
        };
        tracing::info!(
            mode = %report.mode,
            transfers = report.transfers,
            succeeded = report.succeeded,
            elapsed_ms = report.elapsed_ms as u64,
            "workload finished"
        );
        Ok(report)
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}
