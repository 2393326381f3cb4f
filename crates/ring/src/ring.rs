//! Consistent hash ring with virtual nodes.
//!
//! Each physical node contributes `virtual_nodes` points at
//! `ring_hash("<addr>-<i>")`. A key is owned by the first point clockwise
//! from `ring_hash(key)`; replicas are the next distinct physical nodes.
//!
//! A `HashRing` is never patched in place. `add_node` / `remove_node` return
//! a fully rebuilt ring with the next version, so a snapshot handed to a
//! reader stays internally consistent for as long as it is held.

use catalogue_common::{ring_hash, virtual_point_hash, NodeAddr};

/// Default number of virtual points per physical node.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// One virtual point on the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingEntry {
    pub hash: u64,
    pub node: NodeAddr,
}

#[derive(Debug, Clone)]
pub struct HashRing {
    version: u64,
    virtual_nodes: usize,
    /// Sorted by hash; equal hashes keep insertion order.
    points: Vec<RingEntry>,
    /// Physical members in insertion order.
    members: Vec<NodeAddr>,
}

impl HashRing {
    /// An empty ring at version 0.
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            version: 0,
            virtual_nodes,
            points: Vec::new(),
            members: Vec::new(),
        }
    }

    /// Build a ring from scratch. Duplicate members are ignored.
    pub fn build<I>(members: I, virtual_nodes: usize, version: u64) -> Self
    where
        I: IntoIterator<Item = NodeAddr>,
    {
        let mut unique: Vec<NodeAddr> = Vec::new();
        for m in members {
            if !unique.contains(&m) {
                unique.push(m);
            }
        }

        let mut points = Vec::with_capacity(unique.len() * virtual_nodes);
        for member in &unique {
            for i in 0..virtual_nodes {
                points.push(RingEntry {
                    hash: virtual_point_hash(member, i),
                    node: member.clone(),
                });
            }
        }
        // Stable: ties keep member order, then virtual index order.
        points.sort_by_key(|p| p.hash);

        Self {
            version,
            virtual_nodes,
            points,
            members: unique,
        }
    }

    /// A new ring including `addr`, at `version + 1`. Returns an unchanged
    /// copy if `addr` is already a member.
    pub fn add_node(&self, addr: NodeAddr) -> Self {
        if self.contains(&addr) {
            return self.clone();
        }
        let members = self.members.iter().cloned().chain(std::iter::once(addr));
        Self::build(members, self.virtual_nodes, self.version + 1)
    }

    /// A new ring without `addr`, at `version + 1`. Returns an unchanged copy
    /// if `addr` is not a member.
    pub fn remove_node(&self, addr: &NodeAddr) -> Self {
        if !self.contains(addr) {
            return self.clone();
        }
        let members = self.members.iter().filter(|m| *m != addr).cloned();
        Self::build(members, self.virtual_nodes, self.version + 1)
    }

    /// Up to `n` distinct physical nodes for `key`, in clockwise order.
    ///
    /// Returns fewer than `n` only when the ring has fewer than `n` members,
    /// and an empty list on an empty ring.
    pub fn lookup(&self, key: &str, n: usize) -> Vec<NodeAddr> {
        let want = n.min(self.members.len());
        if want == 0 {
            return Vec::new();
        }

        let h = ring_hash(key.as_bytes());
        let start = self.points.partition_point(|p| p.hash < h);
        let len = self.points.len();

        let mut out: Vec<NodeAddr> = Vec::with_capacity(want);
        for step in 0..len {
            let node = &self.points[(start + step) % len].node;
            if !out.contains(node) {
                out.push(node.clone());
                if out.len() == want {
                    break;
                }
            }
        }
        debug_assert_eq!(out.len(), want, "ring walk must reach every member");
        out
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    pub fn members(&self) -> &[NodeAddr] {
        &self.members
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.members.contains(addr)
    }

    /// Number of physical members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn points(&self) -> &[RingEntry] {
        &self.points
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
