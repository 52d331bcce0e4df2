//! Content-addressed key/value engine backing a sparse Merkle tree.
//!
//! Serves tree nodes and opaque program blobs, produces Merkle
//! inclusion/exclusion proofs, optionally captures the storage reads a
//! query touched, and decouples in-memory tree evaluation from
//! asynchronous, batched persistence pulled by an external durable
//! writer.

mod crypto;
mod flush;
mod nodestore;
mod readlog;
mod smt;
mod storage;

pub mod api;
pub mod types;

pub use flush::{FlushData, FlushNode, FlushProgram, FlushStatus};
pub use readlog::ReadLog;
pub use smt::verify_proof;
pub use storage::{Database, InMemoryDb};
pub use types::{GetResult, SetMode, SetResult, Word256, ZERO};

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use flush::FlushPipeline;
use nodestore::{NodeCache, NodeSource};

#[derive(Debug, Error)]
pub enum StateKvError {
    /// A root, node hash, program hash or flush id could not be resolved.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Durable-store I/O failure, transient or permanent.
    #[error("backing store error: {0}")]
    Db(String),

    /// Stored node or bulk-load entry fails the expected shape on decode.
    #[error("invalid data size: {0}")]
    InvalidDataSize(String),

    /// Invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, StateKvError>;

/// The engine: SMT evaluation over a two-tier node store with a
/// write-buffering flush pipeline.
///
/// All methods take `&self`; shared state sits behind a pipeline mutex
/// and a cache lock, acquired in that order. Tree computation runs
/// outside both locks, so concurrent reads and mutations of divergent
/// roots proceed without coordination; only staging serializes.
pub struct StateKv<D: Database> {
    db: D,
    cache: RwLock<NodeCache>,
    pipeline: Mutex<FlushPipeline>,
    prover_id: String,
}

/// Walker's view of the store: write buffer, then committed cache, then
/// the durable database. A durable hit fills the cache and lands in the
/// active read log.
struct Source<'a, D: Database> {
    kv: &'a StateKv<D>,
    log: Option<&'a mut ReadLog>,
}

impl<'a, D: Database> NodeSource for Source<'a, D> {
    fn load(&mut self, key: &Word256) -> Result<Option<Vec<u64>>> {
        if let Some(content) = self.kv.pipeline.lock().unwrap().uncommitted_node(key) {
            return Ok(Some(content.clone()));
        }
        if let Some(content) = self.kv.cache.read().unwrap().node(key) {
            return Ok(Some(content.clone()));
        }
        let Some(content) = self.kv.db.read_node(key)? else {
            return Ok(None);
        };
        if let Some(log) = self.log.as_mut() {
            log.record(key, &content);
        }
        self.kv
            .cache
            .write()
            .unwrap()
            .insert_node(*key, content.clone());
        Ok(Some(content))
    }
}

impl<D: Database> StateKv<D> {
    pub fn new(db: D) -> Self {
        Self::with_prover_id(db, Uuid::new_v4().to_string())
    }

    /// Create with a fixed instance identifier (tests, recovery).
    pub fn with_prover_id(db: D, prover_id: String) -> Self {
        Self {
            db,
            cache: RwLock::new(NodeCache::new()),
            pipeline: Mutex::new(FlushPipeline::new()),
            prover_id,
        }
    }

    pub fn prover_id(&self) -> &str {
        &self.prover_id
    }

    /// Canonical state root: the root of the latest persistent mutation.
    pub fn state_root(&self) -> Word256 {
        self.pipeline.lock().unwrap().state_root()
    }

    /// Read `key` in the tree rooted at `root`, with proof.
    pub fn get(&self, root: &Word256, key: &Word256, with_read_log: bool) -> Result<GetResult> {
        let mut log = if with_read_log { Some(ReadLog::new()) } else { None };
        let mut result = {
            let mut src = Source {
                kv: self,
                log: log.as_mut(),
            };
            smt::get(&mut src, root, key)?
        };
        result.read_log = log;
        Ok(result)
    }

    /// Mutate `key` in the tree rooted at `old_root`. A zero value
    /// deletes. New nodes are staged for flush when `persistent`,
    /// otherwise kept cache-only.
    pub fn set(
        &self,
        old_root: &Word256,
        key: &Word256,
        value: &Word256,
        persistent: bool,
        with_read_log: bool,
    ) -> Result<SetResult> {
        let mut log = if with_read_log { Some(ReadLog::new()) } else { None };
        let outcome = {
            let mut src = Source {
                kv: self,
                log: log.as_mut(),
            };
            smt::set(&mut src, old_root, key, value)?
        };
        let smt::SetOutcome {
            mut result,
            new_nodes,
        } = outcome;

        if persistent {
            // staging is the only mutually exclusive part of a write
            let mut pipeline = self.pipeline.lock().unwrap();
            let cache = self.cache.read().unwrap();
            for (digest, content) in new_nodes {
                let update = cache.has_node(&digest);
                pipeline.stage_node(digest, content, update);
            }
            if result.mode != SetMode::NoOp {
                pipeline.set_state_root(result.new_root);
            }
        } else if !new_nodes.is_empty() {
            let mut cache = self.cache.write().unwrap();
            for (digest, content) in new_nodes {
                cache.insert_node(digest, content);
            }
        }

        result.read_log = log;
        Ok(result)
    }

    /// Store a program blob under a caller-supplied content hash.
    pub fn set_program(&self, key: &Word256, data: &[u8], persistent: bool) -> Result<()> {
        if persistent {
            let mut pipeline = self.pipeline.lock().unwrap();
            let update = self.cache.read().unwrap().has_program(key);
            pipeline.stage_program(*key, data.to_vec(), update);
        } else {
            self.cache
                .write()
                .unwrap()
                .insert_program(*key, data.to_vec());
        }
        Ok(())
    }

    pub fn get_program(&self, key: &Word256) -> Result<Vec<u8>> {
        if let Some(data) = self.pipeline.lock().unwrap().uncommitted_program(key) {
            return Ok(data.clone());
        }
        if let Some(data) = self.cache.read().unwrap().program(key) {
            return Ok(data.clone());
        }
        match self.db.read_program(key)? {
            Some(data) => {
                self.cache
                    .write()
                    .unwrap()
                    .insert_program(*key, data.clone());
                Ok(data)
            }
            None => Err(StateKvError::KeyNotFound(types::to_hex(key))),
        }
    }

    /// Bulk node import into the cache (and staging when `persistent`).
    /// Entries are validated first (12 limbs, recognized marker, key
    /// equal to the recomputed content digest); a failing entry rejects
    /// the whole call before anything is imported.
    pub fn load_db(&self, entries: &HashMap<Word256, Vec<u64>>, persistent: bool) -> Result<()> {
        for (key, content) in entries {
            smt::decode_node(content)?;
            let digest = crypto::node_digest(content);
            if digest != *key {
                return Err(StateKvError::Internal(format!(
                    "load entry {} does not match its content digest",
                    types::to_hex(key)
                )));
            }
        }
        let mut pipeline = if persistent {
            Some(self.pipeline.lock().unwrap())
        } else {
            None
        };
        let mut cache = self.cache.write().unwrap();
        for (key, content) in entries {
            let update = cache.has_node(key);
            cache.insert_node(*key, content.clone());
            if let Some(pipeline) = pipeline.as_mut() {
                pipeline.stage_node(*key, content.clone(), update);
            }
        }
        debug!(entries = entries.len(), persistent, "loaded node entries");
        Ok(())
    }

    /// Bulk program import. Program keys are accepted as supplied: the
    /// program digest scheme belongs to the caller.
    pub fn load_program_db(
        &self,
        entries: &HashMap<Word256, Vec<u8>>,
        persistent: bool,
    ) -> Result<()> {
        let mut pipeline = if persistent {
            Some(self.pipeline.lock().unwrap())
        } else {
            None
        };
        let mut cache = self.cache.write().unwrap();
        for (key, data) in entries {
            let update = cache.has_program(key);
            cache.insert_program(*key, data.clone());
            if let Some(pipeline) = pipeline.as_mut() {
                pipeline.stage_program(*key, data.clone(), update);
            }
        }
        debug!(entries = entries.len(), persistent, "loaded program entries");
        Ok(())
    }

    /// Seal the open write buffer into the next numbered batch and open
    /// a fresh one. No durable I/O happens here; the durable writer
    /// pulls the batch via `get_flush_data`. Returns the new batch id
    /// and the latest acknowledged id.
    pub fn flush(&self) -> (u64, u64) {
        let (flush_id, stored_flush_id) = self.pipeline.lock().unwrap().seal();
        debug!(flush_id, stored_flush_id, "sealed flush batch");
        (flush_id, stored_flush_id)
    }

    pub fn get_flush_status(&self) -> FlushStatus {
        self.pipeline.lock().unwrap().status(&self.prover_id)
    }

    /// Hand a sealed batch to the durable writer. `flush_id` 0 selects
    /// the oldest unacknowledged batch; with an empty queue that yields
    /// an empty payload. Pulls are idempotent until acknowledged.
    pub fn get_flush_data(&self, flush_id: u64) -> Result<FlushData> {
        let mut pipeline = self.pipeline.lock().unwrap();
        match pipeline.pull(flush_id) {
            Some(data) => {
                debug!(flush_id = data.flush_id, "flush batch claimed for storing");
                Ok(data)
            }
            None if flush_id == 0 => Ok(FlushData::empty(
                pipeline.stored_flush_id(),
                pipeline.state_root(),
            )),
            None => Err(StateKvError::KeyNotFound(format!("flush batch {flush_id}"))),
        }
    }

    /// The durable writer's out-of-band commit report: every batch up to
    /// and including `flush_id` becomes STORED, its entries move into
    /// the committed cache, and `stored_flush_id` advances. Idempotent
    /// for already-stored ids. Returns the new `stored_flush_id`.
    pub fn acknowledge_flush(&self, flush_id: u64) -> Result<u64> {
        let mut pipeline = self.pipeline.lock().unwrap();
        if flush_id == 0 || flush_id > pipeline.last_flush_id() {
            return Err(StateKvError::KeyNotFound(format!("flush batch {flush_id}")));
        }
        let (nodes, programs) = pipeline.acknowledge(flush_id);
        let mut cache = self.cache.write().unwrap();
        for (key, content) in nodes {
            cache.insert_node(key, content);
        }
        for (key, data) in programs {
            cache.insert_program(key, data);
        }
        debug!(
            flush_id,
            stored_flush_id = pipeline.stored_flush_id(),
            "flush batch stored"
        );
        Ok(pipeline.stored_flush_id())
    }
}
