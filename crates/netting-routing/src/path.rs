use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use netting_core::Address;

use crate::error::RoutingError;

/// A simple path through the channel graph, listed node by node from the
/// payer to the payee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path {
    nodes: Vec<Address>,
}

impl Path {
    /// Build a path, rejecting ones with fewer than two nodes or a repeated node.
    pub fn new(nodes: Vec<Address>) -> Result<Self, RoutingError> {
        if nodes.len() < 2 {
            return Err(RoutingError::InvalidPath(
                "a path needs at least two nodes".into(),
            ));
        }
        let unique: HashSet<&Address> = nodes.iter().collect();
        if unique.len() != nodes.len() {
            return Err(RoutingError::InvalidPath("path revisits a node".into()));
        }
        Ok(Self { nodes })
    }

    pub(crate) fn from_nodes_unchecked(nodes: Vec<Address>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[Address] {
        &self.nodes
    }

    pub fn into_nodes(self) -> Vec<Address> {
        self.nodes
    }

    pub fn source(&self) -> Address {
        self.nodes[0]
    }

    pub fn target(&self) -> Address {
        self.nodes[self.nodes.len() - 1]
    }

    /// Number of channels the path crosses.
    pub fn hop_count(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Directed edges in order.
    pub fn edges(&self) -> impl Iterator<Item = (Address, Address)> + '_ {
        self.nodes.windows(2).map(|w| (w[0], w[1]))
    }

    pub fn position(&self, node: &Address) -> Option<usize> {
        self.nodes.iter().position(|n| n == node)
    }

    pub fn next_after(&self, node: &Address) -> Option<Address> {
        self.position(node).and_then(|i| self.nodes.get(i + 1).copied())
    }

    pub fn previous_before(&self, node: &Address) -> Option<Address> {
        match self.position(node) {
            Some(i) if i > 0 => Some(self.nodes[i - 1]),
            _ => None,
        }
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.nodes.iter().map(|n| n.to_string()).collect();
        write!(f, "{}", parts.join(" -> "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address([b; 32])
    }

    #[test]
    fn test_path_navigation() {
        let path = Path::new(vec![addr(1), addr(2), addr(3)]).unwrap();
        assert_eq!(path.hop_count(), 2);
        assert_eq!(path.source(), addr(1));
        assert_eq!(path.target(), addr(3));
        assert_eq!(path.next_after(&addr(2)), Some(addr(3)));
        assert_eq!(path.next_after(&addr(3)), None);
        assert_eq!(path.previous_before(&addr(2)), Some(addr(1)));
        assert_eq!(path.previous_before(&addr(1)), None);
        let edges: Vec<_> = path.edges().collect();
        assert_eq!(edges, vec![(addr(1), addr(2)), (addr(2), addr(3))]);
    }

    #[test]
    fn test_path_rejects_loops_and_short() {
        assert!(Path::new(vec![addr(1)]).is_err());
        assert!(Path::new(vec![addr(1), addr(2), addr(1)]).is_err());
    }

    #[test]
    fn test_display() {
        let path = Path::new(vec![addr(0x11), addr(0x22)]).unwrap();
        assert_eq!(path.to_string(), "0x11111111 -> 0x22222222");
    }
}
