use std::collections::HashMap;

use crate::types::{to_hex, Word256};

/// Every node read that fell through to the durable store during one
/// Get/Set, in traversal order. Lets a caller replay the exact database
/// state an operation depended on without re-querying live storage.
#[derive(Clone, Debug, Default)]
pub struct ReadLog {
    entries: Vec<(String, Vec<u64>)>,
}

impl ReadLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, key: &Word256, content: &[u64]) {
        self.entries.push((to_hex(key), content.to_vec()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in traversal order.
    pub fn entries(&self) -> &[(String, Vec<u64>)] {
        &self.entries
    }

    /// Keyed view; order is not semantically significant to callers.
    pub fn into_map(self) -> HashMap<String, Vec<u64>> {
        self.entries.into_iter().collect()
    }
}
