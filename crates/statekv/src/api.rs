//! Request/response surface mirroring the wire contract.
//!
//! Roots, keys and sibling hashes travel as four 64-bit limb arrays,
//! leaf scalars as decimal strings, bulk-load and read-log keys as hex
//! strings, never raw binary. Transport framing is out of scope; an
//! RPC server wraps these handlers. Handlers never fail: every error
//! maps to a result code.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::storage::Database;
use crate::types::{self, Word256, ZERO};
use crate::{FlushData, StateKv, StateKvError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    #[default]
    Success,
    DbKeyNotFound,
    DbError,
    InternalError,
    SmtInvalidDataSize,
}

impl From<&StateKvError> for ResultCode {
    fn from(err: &StateKvError) -> Self {
        match err {
            StateKvError::KeyNotFound(_) => ResultCode::DbKeyNotFound,
            StateKvError::Db(_) => ResultCode::DbError,
            StateKvError::InvalidDataSize(_) => ResultCode::SmtInvalidDataSize,
            StateKvError::Internal(_) => ResultCode::InternalError,
        }
    }
}

fn default_details() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetRequest {
    pub old_root: Word256,
    pub key: Word256,
    /// Decimal scalar; "0" deletes.
    pub value: String,
    pub persistent: bool,
    #[serde(default = "default_details")]
    pub details: bool,
    #[serde(default)]
    pub get_db_read_log: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SetResponse {
    pub result: ResultCode,
    pub new_root: Word256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub siblings: Option<Vec<Word256>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ins_key: Option<Word256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ins_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_old0: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_hash_counter: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_read_log: Option<HashMap<String, Vec<u64>>>,
}

impl SetResponse {
    fn failed(result: ResultCode) -> Self {
        Self {
            result,
            new_root: ZERO,
            ..Self::default()
        }
    }
}

pub fn set<D: Database>(kv: &StateKv<D>, req: &SetRequest) -> SetResponse {
    let Some(value) = types::from_decimal(&req.value) else {
        return SetResponse::failed(ResultCode::SmtInvalidDataSize);
    };
    match kv.set(
        &req.old_root,
        &req.key,
        &value,
        req.persistent,
        req.get_db_read_log,
    ) {
        Ok(res) => {
            let mut resp = SetResponse {
                result: ResultCode::Success,
                new_root: res.new_root,
                ..SetResponse::default()
            };
            if req.details {
                resp.siblings = Some(res.siblings);
                resp.ins_key = Some(res.ins_key);
                resp.ins_value = Some(types::to_decimal(&res.ins_value));
                resp.is_old0 = Some(res.is_old0);
                resp.old_value = Some(types::to_decimal(&res.old_value));
                resp.new_value = Some(types::to_decimal(&res.new_value));
                resp.mode = Some(res.mode.to_string());
                resp.proof_hash_counter = Some(res.proof_hash_counter);
            }
            resp.db_read_log = res.read_log.map(|log| log.into_map());
            resp
        }
        Err(err) => SetResponse::failed(ResultCode::from(&err)),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetRequest {
    pub root: Word256,
    pub key: Word256,
    #[serde(default = "default_details")]
    pub details: bool,
    #[serde(default)]
    pub get_db_read_log: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetResponse {
    pub result: ResultCode,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub siblings: Option<Vec<Word256>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ins_key: Option<Word256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ins_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_old0: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_hash_counter: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_read_log: Option<HashMap<String, Vec<u64>>>,
}

impl GetResponse {
    fn failed(result: ResultCode) -> Self {
        Self {
            result,
            value: "0".to_string(),
            ..Self::default()
        }
    }
}

pub fn get<D: Database>(kv: &StateKv<D>, req: &GetRequest) -> GetResponse {
    match kv.get(&req.root, &req.key, req.get_db_read_log) {
        Ok(res) => {
            let mut resp = GetResponse {
                result: ResultCode::Success,
                value: types::to_decimal(&res.value),
                ..GetResponse::default()
            };
            if req.details {
                resp.siblings = Some(res.siblings);
                resp.ins_key = Some(res.ins_key);
                resp.ins_value = Some(types::to_decimal(&res.ins_value));
                resp.is_old0 = Some(res.is_old0);
                resp.proof_hash_counter = Some(res.proof_hash_counter);
            }
            resp.db_read_log = res.read_log.map(|log| log.into_map());
            resp
        }
        Err(err) => GetResponse::failed(ResultCode::from(&err)),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetProgramRequest {
    pub key: Word256,
    pub data: Vec<u8>,
    pub persistent: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetProgramResponse {
    pub result: ResultCode,
}

pub fn set_program<D: Database>(kv: &StateKv<D>, req: &SetProgramRequest) -> SetProgramResponse {
    let result = match kv.set_program(&req.key, &req.data, req.persistent) {
        Ok(()) => ResultCode::Success,
        Err(err) => ResultCode::from(&err),
    };
    SetProgramResponse { result }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetProgramRequest {
    pub key: Word256,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetProgramResponse {
    pub result: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

pub fn get_program<D: Database>(kv: &StateKv<D>, req: &GetProgramRequest) -> GetProgramResponse {
    match kv.get_program(&req.key) {
        Ok(data) => GetProgramResponse {
            result: ResultCode::Success,
            data: Some(data),
        },
        Err(err) => GetProgramResponse {
            result: ResultCode::from(&err),
            data: None,
        },
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadDbRequest {
    /// Hex node hash -> serialized limbs.
    pub input_db: HashMap<String, Vec<u64>>,
    pub persistent: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadDbResponse {
    pub result: ResultCode,
}

pub fn load_db<D: Database>(kv: &StateKv<D>, req: &LoadDbRequest) -> LoadDbResponse {
    let mut entries = HashMap::with_capacity(req.input_db.len());
    for (key, content) in &req.input_db {
        let Some(key) = types::from_hex(key) else {
            return LoadDbResponse {
                result: ResultCode::SmtInvalidDataSize,
            };
        };
        entries.insert(key, content.clone());
    }
    let result = match kv.load_db(&entries, req.persistent) {
        Ok(()) => ResultCode::Success,
        Err(err) => ResultCode::from(&err),
    };
    LoadDbResponse { result }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadProgramDbRequest {
    /// Hex program hash -> blob bytes.
    pub input_program_db: HashMap<String, Vec<u8>>,
    pub persistent: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadProgramDbResponse {
    pub result: ResultCode,
}

pub fn load_program_db<D: Database>(
    kv: &StateKv<D>,
    req: &LoadProgramDbRequest,
) -> LoadProgramDbResponse {
    let mut entries = HashMap::with_capacity(req.input_program_db.len());
    for (key, data) in &req.input_program_db {
        let Some(key) = types::from_hex(key) else {
            return LoadProgramDbResponse {
                result: ResultCode::SmtInvalidDataSize,
            };
        };
        entries.insert(key, data.clone());
    }
    let result = match kv.load_program_db(&entries, req.persistent) {
        Ok(()) => ResultCode::Success,
        Err(err) => ResultCode::from(&err),
    };
    LoadProgramDbResponse { result }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlushResponse {
    pub result: ResultCode,
    pub flush_id: u64,
    pub stored_flush_id: u64,
}

pub fn flush<D: Database>(kv: &StateKv<D>) -> FlushResponse {
    let (flush_id, stored_flush_id) = kv.flush();
    FlushResponse {
        result: ResultCode::Success,
        flush_id,
        stored_flush_id,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetFlushStatusResponse {
    pub result: ResultCode,
    pub stored_flush_id: u64,
    pub storing_flush_id: u64,
    pub last_flush_id: u64,
    pub pending_nodes: u64,
    pub pending_programs: u64,
    pub storing_nodes: u64,
    pub storing_programs: u64,
    pub prover_id: String,
}

pub fn get_flush_status<D: Database>(kv: &StateKv<D>) -> GetFlushStatusResponse {
    let status = kv.get_flush_status();
    GetFlushStatusResponse {
        result: ResultCode::Success,
        stored_flush_id: status.stored_flush_id,
        storing_flush_id: status.storing_flush_id,
        last_flush_id: status.last_flush_id,
        pending_nodes: status.pending_nodes,
        pending_programs: status.pending_programs,
        storing_nodes: status.storing_nodes,
        storing_programs: status.storing_programs,
        prover_id: status.prover_id,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetFlushDataRequest {
    /// 0 selects the oldest unacknowledged batch.
    pub flush_id: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlushNodeEntry {
    pub key: String,
    pub value: Vec<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlushProgramEntry {
    pub key: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetFlushDataResponse {
    pub result: ResultCode,
    pub flush_id: u64,
    pub stored_flush_id: u64,
    pub node_inserts: Vec<FlushNodeEntry>,
    pub node_updates: Vec<FlushNodeEntry>,
    pub program_inserts: Vec<FlushProgramEntry>,
    pub program_updates: Vec<FlushProgramEntry>,
    pub state_root: String,
}

pub fn get_flush_data<D: Database>(
    kv: &StateKv<D>,
    req: &GetFlushDataRequest,
) -> GetFlushDataResponse {
    match kv.get_flush_data(req.flush_id) {
        Ok(data) => flush_data_response(data),
        Err(err) => GetFlushDataResponse {
            result: ResultCode::from(&err),
            ..GetFlushDataResponse::default()
        },
    }
}

fn node_entries(entries: Vec<crate::FlushNode>) -> Vec<FlushNodeEntry> {
    entries
        .into_iter()
        .map(|n| FlushNodeEntry {
            key: types::to_hex(&n.key),
            value: n.content,
        })
        .collect()
}

fn program_entries(entries: Vec<crate::FlushProgram>) -> Vec<FlushProgramEntry> {
    entries
        .into_iter()
        .map(|p| FlushProgramEntry {
            key: types::to_hex(&p.key),
            data: p.data,
        })
        .collect()
}

fn flush_data_response(data: FlushData) -> GetFlushDataResponse {
    GetFlushDataResponse {
        result: ResultCode::Success,
        flush_id: data.flush_id,
        stored_flush_id: data.stored_flush_id,
        node_inserts: node_entries(data.node_inserts),
        node_updates: node_entries(data.node_updates),
        program_inserts: program_entries(data.program_inserts),
        program_updates: program_entries(data.program_updates),
        state_root: types::to_hex(&data.state_root),
    }
}
