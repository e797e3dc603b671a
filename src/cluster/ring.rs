//! Consistent hash ring
//!
//! A pure function of the currently connected node set. Each node contributes
//! `virtual_nodes * weight` entries placed by the MD5 of `"<node_id>:<i>"`.
//! Snapshots are immutable; the registry swaps in a freshly built ring on any
//! membership change, so lookups never take a lock.

/// Default virtual node count per unit of weight.
pub const DEFAULT_VIRTUAL_NODES: usize = 160;

/// Immutable consistent-hash ring snapshot.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Sorted (hash, node_id) pairs; ties break by lexicographic node id
    entries: Vec<(u128, String)>,
}

impl HashRing {
    /// Build a ring from `(node_id, weight)` pairs of connected nodes.
    pub fn build(nodes: &[(String, u32)], virtual_nodes: usize) -> Self {
        let mut entries = Vec::new();
        for (node_id, weight) in nodes {
            let replicas = virtual_nodes * (*weight).max(1) as usize;
            for i in 0..replicas {
                let hash = hash_key(&format!("{node_id}:{i}"));
                entries.push((hash, node_id.clone()));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Owning node for a key: the first ring entry at or after the key's
    /// hash, wrapping to the start past the ring's end. O(log n).
    pub fn node_for(&self, key: &str) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        let idx = self.entries.partition_point(|(h, _)| *h < hash);
        let (_, node_id) = &self.entries[idx % self.entries.len()];
        Some(node_id)
    }

    /// Distinct nodes in ring order starting at the key's primary. This is
    /// the quorum traversal order.
    pub fn nodes_for(&self, key: &str) -> Vec<String> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        let hash = hash_key(key);
        let start = self.entries.partition_point(|(h, _)| *h < hash);
        let mut seen = std::collections::HashSet::new();
        let mut order = Vec::new();
        for offset in 0..self.entries.len() {
            let (_, node_id) = &self.entries[(start + offset) % self.entries.len()];
            if seen.insert(node_id.clone()) {
                order.push(node_id.clone());
            }
        }
        order
    }
}

/// MD5 low 128 bits as an unsigned big-endian integer.
pub fn hash_key(key: &str) -> u128 {
    u128::from_be_bytes(md5::compute(key.as_bytes()).0)
}
