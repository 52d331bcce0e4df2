use std::collections::HashMap;

use crate::types::Word256;
use crate::Result;

/// Node reads as seen by the tree walker. The engine's implementation
/// layers the write buffer, the committed cache and the durable store,
/// recording durable fallthroughs in the active read log.
pub trait NodeSource {
    fn load(&mut self, key: &Word256) -> Result<Option<Vec<u64>>>;
}

/// Committed entries: flushed-and-acknowledged writes, durable reads
/// pulled in on miss, and cache-only (non-persistent) writes.
#[derive(Default)]
pub struct NodeCache {
    nodes: HashMap<Word256, Vec<u64>>,
    programs: HashMap<Word256, Vec<u8>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, key: &Word256) -> Option<&Vec<u64>> {
        self.nodes.get(key)
    }

    pub fn program(&self, key: &Word256) -> Option<&Vec<u8>> {
        self.programs.get(key)
    }

    pub fn has_node(&self, key: &Word256) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn has_program(&self, key: &Word256) -> bool {
        self.programs.contains_key(key)
    }

    pub fn insert_node(&mut self, key: Word256, content: Vec<u64>) {
        self.nodes.insert(key, content);
    }

    pub fn insert_program(&mut self, key: Word256, data: Vec<u8>) {
        self.programs.insert(key, data);
    }
}
