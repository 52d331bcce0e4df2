//! Durable backing-store boundary.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::flush::FlushData;
use crate::types::Word256;
use crate::Result;

/// Read side of the durable database holding flushed nodes and programs.
///
/// Writes happen outside the engine: a durable writer pulls sealed flush
/// batches via `StateKv::get_flush_data` and commits them on its own
/// schedule. Implementations own their retry and timeout policy; a
/// failed read surfaces as `StateKvError::Db` and aborts the whole
/// operation without staging partial mutations.
pub trait Database: Send + Sync {
    fn read_node(&self, key: &Word256) -> Result<Option<Vec<u64>>>;
    fn read_program(&self, key: &Word256) -> Result<Option<Vec<u8>>>;
}

/// In-memory durable store (tests and demos). Doubles as the commit
/// target when a test plays the durable-writer role.
#[derive(Clone, Default)]
pub struct InMemoryDb {
    nodes: Arc<RwLock<HashMap<Word256, Vec<u64>>>>,
    programs: Arc<RwLock<HashMap<Word256, Vec<u8>>>>,
}

impl InMemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&self, key: Word256, content: Vec<u64>) {
        self.nodes.write().unwrap().insert(key, content);
    }

    pub fn insert_program(&self, key: Word256, data: Vec<u8>) {
        self.programs.write().unwrap().insert(key, data);
    }

    /// Commit one pulled flush batch, as the external durable writer would.
    pub fn commit(&self, data: &FlushData) {
        let mut nodes = self.nodes.write().unwrap();
        for entry in data.node_inserts.iter().chain(&data.node_updates) {
            nodes.insert(entry.key, entry.content.clone());
        }
        let mut programs = self.programs.write().unwrap();
        for entry in data.program_inserts.iter().chain(&data.program_updates) {
            programs.insert(entry.key, entry.data.clone());
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn program_count(&self) -> usize {
        self.programs.read().unwrap().len()
    }
}

impl Database for InMemoryDb {
    fn read_node(&self, key: &Word256) -> Result<Option<Vec<u64>>> {
        Ok(self.nodes.read().unwrap().get(key).cloned())
    }

    fn read_program(&self, key: &Word256) -> Result<Option<Vec<u8>>> {
        Ok(self.programs.read().unwrap().get(key).cloned())
    }
}
