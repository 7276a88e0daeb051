use std::fmt;

/// A member of the cluster, as published by discovery.
///
/// Fields a node did not publish are left empty/zero; matching treats
/// them as wildcards (see [`Node::is_superset`]).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub name: String,
    pub host: String,
    pub replication_port: u16,
}

impl Node {
    /// Whether `self` matches every field `other` actually specifies.
    pub fn is_superset(&self, other: &Node) -> bool {
        (other.name.is_empty() || self.name.eq_ignore_ascii_case(&other.name))
            && (other.host.is_empty() || self.host == other.host)
            && (other.replication_port == 0 || self.replication_port == other.replication_port)
    }

    pub fn replication_addr(&self) -> String {
        format!("{}:{}", self.host, self.replication_port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{})", self.name, self.host, self.replication_port)
    }
}

/// One end of a replication conversation: a shard directory on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub node: Node,
    pub path: String,
}

impl Endpoint {
    pub fn new(node: Node, path: impl Into<String>) -> Self {
        Self {
            node,
            path: path.into(),
        }
    }

    /// Whether this endpoint lives on `local` itself.
    pub fn is_local(&self, local: &Node) -> bool {
        !self.node.name.is_empty() && self.node.name.eq_ignore_ascii_case(&local.name)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.path)
    }
}

/// Resolves which nodes are expected to hold a replica of an index.
///
/// Backed by the cluster's discovery subsystem; the trigger only asks it
/// when the shard is not already present locally.
#[async_trait::async_trait]
pub trait NodeResolver: Send + Sync {
    async fn resolve_index_nodes(&self, path: &str) -> Vec<Node>;
}
