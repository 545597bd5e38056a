//! Topology graph: schema and the validating wrapper that owns it.

pub mod model;
pub mod wrapper;

pub use model::{
    link_name, GolayIdx, Link, LinkType, Location, Node, NodeStatus, NodeType, Polarity, Site,
    Topology,
};
pub use wrapper::{standardize_mac, TopologyError, TopologyWrapper};
