//! Write buffering and the flush queue.
//!
//! Persistent writes accumulate in an open buffer. `Flush` seals the
//! buffer into a numbered batch; the external durable writer pulls batch
//! contents with `GetFlushData` and reports the commit back, which
//! promotes the batch entries into the committed cache. Identifiers are
//! assigned from 1 and only grow, with
//! `stored_flush_id <= storing_flush_id <= last_flush_id` at all times.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::{Word256, ZERO};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BatchState {
    Pending,
    Storing,
}

/// One node destined for durable storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlushNode {
    pub key: Word256,
    pub content: Vec<u64>,
}

/// One program blob destined for durable storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlushProgram {
    pub key: Word256,
    pub data: Vec<u8>,
}

/// Contents of one sealed flush batch, as handed to the durable writer.
/// Immutable once sealed; repeated pulls return identical contents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlushData {
    pub flush_id: u64,
    pub stored_flush_id: u64,
    pub node_inserts: Vec<FlushNode>,
    pub node_updates: Vec<FlushNode>,
    pub program_inserts: Vec<FlushProgram>,
    pub program_updates: Vec<FlushProgram>,
    /// Canonical state root at seal time, to persist as "current root".
    pub state_root: Word256,
}

impl FlushData {
    pub(crate) fn empty(stored_flush_id: u64, state_root: Word256) -> Self {
        Self {
            flush_id: 0,
            stored_flush_id,
            node_inserts: Vec::new(),
            node_updates: Vec::new(),
            program_inserts: Vec::new(),
            program_updates: Vec::new(),
            state_root,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node_inserts.is_empty()
            && self.node_updates.is_empty()
            && self.program_inserts.is_empty()
            && self.program_updates.is_empty()
    }
}

/// Flush-queue snapshot for monitoring and backpressure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlushStatus {
    pub stored_flush_id: u64,
    pub storing_flush_id: u64,
    pub last_flush_id: u64,
    pub pending_nodes: u64,
    pub pending_programs: u64,
    pub storing_nodes: u64,
    pub storing_programs: u64,
    pub prover_id: String,
}

/// Open accumulation buffer. Inserts and updates are kept apart, keyed
/// by hash so re-staging the same content replaces the previous entry.
#[derive(Default)]
struct WriteBuffer {
    node_inserts: HashMap<Word256, Vec<u64>>,
    node_updates: HashMap<Word256, Vec<u64>>,
    program_inserts: HashMap<Word256, Vec<u8>>,
    program_updates: HashMap<Word256, Vec<u8>>,
}

impl WriteBuffer {
    fn stage_node(&mut self, key: Word256, content: Vec<u64>, update: bool) {
        if self.node_inserts.contains_key(&key) {
            self.node_inserts.insert(key, content);
        } else if update || self.node_updates.contains_key(&key) {
            self.node_updates.insert(key, content);
        } else {
            self.node_inserts.insert(key, content);
        }
    }

    fn stage_program(&mut self, key: Word256, data: Vec<u8>, update: bool) {
        if self.program_inserts.contains_key(&key) {
            self.program_inserts.insert(key, data);
        } else if update || self.program_updates.contains_key(&key) {
            self.program_updates.insert(key, data);
        } else {
            self.program_inserts.insert(key, data);
        }
    }

    fn node_count(&self) -> u64 {
        (self.node_inserts.len() + self.node_updates.len()) as u64
    }

    fn program_count(&self) -> u64 {
        (self.program_inserts.len() + self.program_updates.len()) as u64
    }
}

struct FlushBatch {
    state: BatchState,
    data: FlushData,
}

impl FlushBatch {
    fn node_count(&self) -> u64 {
        (self.data.node_inserts.len() + self.data.node_updates.len()) as u64
    }

    fn program_count(&self) -> u64 {
        (self.data.program_inserts.len() + self.data.program_updates.len()) as u64
    }
}

/// The whole buffering/flush state, owned by the engine behind a mutex.
pub(crate) struct FlushPipeline {
    buffer: WriteBuffer,
    /// Union of the open buffer and every unacknowledged batch, the
    /// first tier consulted by reads.
    uncommitted_nodes: HashMap<Word256, Vec<u64>>,
    uncommitted_programs: HashMap<Word256, Vec<u8>>,
    queue: VecDeque<FlushBatch>,
    last_flush_id: u64,
    storing_flush_id: u64,
    stored_flush_id: u64,
    state_root: Word256,
}

impl FlushPipeline {
    pub fn new() -> Self {
        Self {
            buffer: WriteBuffer::default(),
            uncommitted_nodes: HashMap::new(),
            uncommitted_programs: HashMap::new(),
            queue: VecDeque::new(),
            last_flush_id: 0,
            storing_flush_id: 0,
            stored_flush_id: 0,
            state_root: ZERO,
        }
    }

    pub fn uncommitted_node(&self, key: &Word256) -> Option<&Vec<u64>> {
        self.uncommitted_nodes.get(key)
    }

    pub fn uncommitted_program(&self, key: &Word256) -> Option<&Vec<u8>> {
        self.uncommitted_programs.get(key)
    }

    pub fn stage_node(&mut self, key: Word256, content: Vec<u64>, update: bool) {
        self.uncommitted_nodes.insert(key, content.clone());
        self.buffer.stage_node(key, content, update);
    }

    pub fn stage_program(&mut self, key: Word256, data: Vec<u8>, update: bool) {
        self.uncommitted_programs.insert(key, data.clone());
        self.buffer.stage_program(key, data, update);
    }

    pub fn state_root(&self) -> Word256 {
        self.state_root
    }

    pub fn set_state_root(&mut self, root: Word256) {
        self.state_root = root;
    }

    pub fn last_flush_id(&self) -> u64 {
        self.last_flush_id
    }

    pub fn stored_flush_id(&self) -> u64 {
        self.stored_flush_id
    }

    /// Seal the open buffer into the next numbered batch. A batch is
    /// created even when the buffer is empty so successive flush ids
    /// strictly increase.
    pub fn seal(&mut self) -> (u64, u64) {
        self.last_flush_id += 1;
        let buffer = std::mem::take(&mut self.buffer);
        let data = FlushData {
            flush_id: self.last_flush_id,
            stored_flush_id: self.stored_flush_id,
            node_inserts: into_nodes(buffer.node_inserts),
            node_updates: into_nodes(buffer.node_updates),
            program_inserts: into_programs(buffer.program_inserts),
            program_updates: into_programs(buffer.program_updates),
            state_root: self.state_root,
        };
        self.queue.push_back(FlushBatch {
            state: BatchState::Pending,
            data,
        });
        (self.last_flush_id, self.stored_flush_id)
    }

    /// Claim a batch for the durable writer. `flush_id` 0 selects the
    /// oldest unacknowledged batch. Claiming is idempotent: repeated
    /// pulls of a storing batch return identical contents.
    pub fn pull(&mut self, flush_id: u64) -> Option<FlushData> {
        let index = if flush_id == 0 {
            if self.queue.is_empty() {
                return None;
            }
            0
        } else {
            self.queue.iter().position(|b| b.data.flush_id == flush_id)?
        };
        let stored = self.stored_flush_id;
        let batch = &mut self.queue[index];
        batch.state = BatchState::Storing;
        self.storing_flush_id = self.storing_flush_id.max(batch.data.flush_id);
        let mut data = batch.data.clone();
        data.stored_flush_id = stored;
        Some(data)
    }

    /// Record the durable writer's commit of every batch up to and
    /// including `flush_id`. Returns the entries to promote into the
    /// committed cache. Idempotent for already-acknowledged ids.
    pub fn acknowledge(
        &mut self,
        flush_id: u64,
    ) -> (Vec<(Word256, Vec<u64>)>, Vec<(Word256, Vec<u8>)>) {
        let mut nodes = Vec::new();
        let mut programs = Vec::new();
        while matches!(self.queue.front(), Some(b) if b.data.flush_id <= flush_id) {
            if let Some(batch) = self.queue.pop_front() {
                for entry in batch.data.node_inserts.into_iter().chain(batch.data.node_updates) {
                    nodes.push((entry.key, entry.content));
                }
                for entry in batch
                    .data
                    .program_inserts
                    .into_iter()
                    .chain(batch.data.program_updates)
                {
                    programs.push((entry.key, entry.data));
                }
            }
        }
        self.stored_flush_id = self.stored_flush_id.max(flush_id);
        self.storing_flush_id = self.storing_flush_id.max(self.stored_flush_id);

        // drop promoted entries from the uncommitted view unless a later
        // batch or the open buffer staged the same hash again
        self.uncommitted_nodes.clear();
        self.uncommitted_programs.clear();
        for batch in &self.queue {
            for entry in batch.data.node_inserts.iter().chain(&batch.data.node_updates) {
                self.uncommitted_nodes
                    .insert(entry.key, entry.content.clone());
            }
            for entry in batch
                .data
                .program_inserts
                .iter()
                .chain(&batch.data.program_updates)
            {
                self.uncommitted_programs.insert(entry.key, entry.data.clone());
            }
        }
        for (key, content) in self
            .buffer
            .node_inserts
            .iter()
            .chain(&self.buffer.node_updates)
        {
            self.uncommitted_nodes.insert(*key, content.clone());
        }
        for (key, data) in self
            .buffer
            .program_inserts
            .iter()
            .chain(&self.buffer.program_updates)
        {
            self.uncommitted_programs.insert(*key, data.clone());
        }

        (nodes, programs)
    }

    pub fn status(&self, prover_id: &str) -> FlushStatus {
        let mut pending_nodes = self.buffer.node_count();
        let mut pending_programs = self.buffer.program_count();
        let mut storing_nodes = 0;
        let mut storing_programs = 0;
        for batch in &self.queue {
            match batch.state {
                BatchState::Pending => {
                    pending_nodes += batch.node_count();
                    pending_programs += batch.program_count();
                }
                BatchState::Storing => {
                    storing_nodes += batch.node_count();
                    storing_programs += batch.program_count();
                }
            }
        }
        FlushStatus {
            stored_flush_id: self.stored_flush_id,
            storing_flush_id: self.storing_flush_id,
            last_flush_id: self.last_flush_id,
            pending_nodes,
            pending_programs,
            storing_nodes,
            storing_programs,
            prover_id: prover_id.to_string(),
        }
    }
}

fn into_nodes(map: HashMap<Word256, Vec<u64>>) -> Vec<FlushNode> {
    map.into_iter()
        .map(|(key, content)| FlushNode { key, content })
        .collect()
}

fn into_programs(map: HashMap<Word256, Vec<u8>>) -> Vec<FlushProgram> {
    map.into_iter()
        .map(|(key, data)| FlushProgram { key, data })
        .collect()
}
