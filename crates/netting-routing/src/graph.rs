use std::collections::{BTreeMap, HashSet, VecDeque};

use dashmap::DashMap;

use netting_core::{Address, TokenAmount};

use crate::error::RoutingError;
use crate::path::Path;

/// Directed edges the search must not use.
pub type ExcludedEdges = HashSet<(Address, Address)>;

/// One direction of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub channel: Address,
    /// Amount the edge's source can currently send through the channel.
    pub capacity: TokenAmount,
}

/// Channel topology of one asset.
///
/// Each channel contributes two directed edges with independent capacities.
/// Neighbours are kept in address order, which makes every search below
/// deterministic: among equally short candidates the one reached through the
/// lowest addresses is found first.
pub struct ChannelGraph {
    asset: Address,
    adjacency: DashMap<Address, BTreeMap<Address, Edge>>,
}

impl ChannelGraph {
    pub fn new(asset: Address) -> Self {
        Self {
            asset,
            adjacency: DashMap::new(),
        }
    }

    pub fn asset(&self) -> Address {
        self.asset
    }

    /// Add both directions of a channel with zero capacity. Existing edges are kept.
    pub fn add_channel(&self, channel: Address, participant1: Address, participant2: Address) {
        for (from, to) in [(participant1, participant2), (participant2, participant1)] {
            self.adjacency
                .entry(from)
                .or_default()
                .entry(to)
                .or_insert(Edge {
                    channel,
                    capacity: 0,
                });
        }
        tracing::debug!(asset = %self.asset, channel = %channel, "channel added to graph");
    }

    pub fn set_capacity(
        &self,
        from: &Address,
        to: &Address,
        capacity: TokenAmount,
    ) -> Result<(), RoutingError> {
        let mut neighbours = self
            .adjacency
            .get_mut(from)
            .ok_or(RoutingError::UnknownEdge { from: *from, to: *to })?;
        let edge = neighbours
            .get_mut(to)
            .ok_or(RoutingError::UnknownEdge { from: *from, to: *to })?;
        edge.capacity = capacity;
        Ok(())
    }

    /// Remove both directions of a channel.
    pub fn remove_channel(&self, channel: &Address) {
        for mut neighbours in self.adjacency.iter_mut() {
            neighbours.retain(|_, edge| edge.channel != *channel);
        }
        self.adjacency.retain(|_, neighbours| !neighbours.is_empty());
        tracing::debug!(asset = %self.asset, channel = %channel, "channel removed from graph");
    }

    pub fn edge(&self, from: &Address, to: &Address) -> Option<Edge> {
        self.adjacency
            .get(from)
            .and_then(|neighbours| neighbours.get(to).copied())
    }

    pub fn capacity(&self, from: &Address, to: &Address) -> Option<TokenAmount> {
        self.edge(from, to).map(|e| e.capacity)
    }

    /// Outgoing edges of `node`, in address order.
    pub fn neighbours(&self, node: &Address) -> Vec<(Address, Edge)> {
        self.adjacency
            .get(node)
            .map(|neighbours| neighbours.iter().map(|(a, e)| (*a, *e)).collect())
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    /// Edges leaving `node` that a transfer of `min_capacity` may use.
    fn usable(
        &self,
        node: &Address,
        min_capacity: TokenAmount,
        excluded: &ExcludedEdges,
    ) -> Vec<Address> {
        self.neighbours(node)
            .into_iter()
            .filter(|(next, edge)| {
                edge.capacity >= min_capacity && !excluded.contains(&(*node, *next))
            })
            .map(|(next, _)| next)
            .collect()
    }

    /// Every simple path of exactly `num_hops` edges starting at `source`.
    ///
    /// An empty result is a valid outcome, not an error.
    pub fn paths_of_length(
        &self,
        source: &Address,
        num_hops: usize,
        min_capacity: TokenAmount,
        excluded: &ExcludedEdges,
    ) -> Vec<Path> {
        let mut found = Vec::new();
        if num_hops == 0 {
            return found;
        }
        let mut current = vec![*source];
        self.extend_paths(&mut current, num_hops, min_capacity, excluded, &mut found);
        found
    }

    fn extend_paths(
        &self,
        current: &mut Vec<Address>,
        num_hops: usize,
        min_capacity: TokenAmount,
        excluded: &ExcludedEdges,
        found: &mut Vec<Path>,
    ) {
        if current.len() == num_hops + 1 {
            found.push(Path::from_nodes_unchecked(current.clone()));
            return;
        }
        let Some(&last) = current.last() else {
            return;
        };
        for next in self.usable(&last, min_capacity, excluded) {
            if current.contains(&next) {
                continue;
            }
            current.push(next);
            self.extend_paths(current, num_hops, min_capacity, excluded, found);
            current.pop();
        }
    }

    /// All simple paths from `source` to `target` of at most `max_hops` edges,
    /// shortest first.
    pub fn find_paths(
        &self,
        source: &Address,
        target: &Address,
        min_capacity: TokenAmount,
        excluded: &ExcludedEdges,
        max_hops: usize,
    ) -> Result<Vec<Path>, RoutingError> {
        let mut found = Vec::new();
        let mut queue: VecDeque<Vec<Address>> = VecDeque::new();
        if source != target {
            queue.push_back(vec![*source]);
        }

        while let Some(partial) = queue.pop_front() {
            let Some(&last) = partial.last() else {
                continue;
            };
            if last == *target {
                found.push(Path::from_nodes_unchecked(partial));
                continue;
            }
            if partial.len() > max_hops {
                continue;
            }
            for next in self.usable(&last, min_capacity, excluded) {
                if partial.contains(&next) {
                    continue;
                }
                let mut extended = partial.clone();
                extended.push(next);
                queue.push_back(extended);
            }
        }

        if found.is_empty() {
            return Err(RoutingError::NoPathFound {
                from: *source,
                to: *target,
            });
        }
        Ok(found)
    }
}
