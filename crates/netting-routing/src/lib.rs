//! Netting routing: per-asset channel graph and path discovery.

pub mod error;
pub mod graph;
pub mod path;

pub use error::RoutingError;
pub use graph::{ChannelGraph, Edge, ExcludedEdges};
pub use path::Path;
