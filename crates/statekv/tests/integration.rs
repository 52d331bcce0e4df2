use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;

use statekv::api;
use statekv::types;
use statekv::{
    verify_proof, Database, InMemoryDb, Result, SetMode, StateKv, StateKvError, Word256, ZERO,
};

fn w(n: u64) -> Word256 {
    [n, 0, 0, 0]
}

fn new_kv() -> StateKv<InMemoryDb> {
    StateKv::new(InMemoryDb::new())
}

#[test]
fn test_set_get_roundtrip() {
    let kv = new_kv();
    let key = w(42);
    let value = w(5);

    let set = kv.set(&ZERO, &key, &value, true, false).unwrap();
    assert_eq!(set.mode, SetMode::Insert);
    assert!(set.is_old0);
    assert_ne!(set.new_root, ZERO);

    let get = kv.get(&set.new_root, &key, false).unwrap();
    assert_eq!(get.value, value);
    assert_eq!(get.ins_key, key);

    // both proofs replay to the new root
    assert!(verify_proof(
        &set.new_root,
        &key,
        &get.value,
        &get.siblings,
        &get.ins_key,
        &get.ins_value,
    ));
    assert!(verify_proof(
        &set.new_root,
        &key,
        &set.new_value,
        &set.siblings,
        &set.ins_key,
        &set.ins_value,
    ));
}

#[test]
fn test_example_scenario() {
    // empty tree -> insert 5 -> update 9 -> read -> delete restores empty root
    let kv = new_kv();
    let key = w(7);

    let ins = kv.set(&ZERO, &key, &w(5), true, false).unwrap();
    assert_eq!(ins.mode, SetMode::Insert);
    assert!(ins.is_old0);
    let r1 = ins.new_root;

    let upd = kv.set(&r1, &key, &w(9), true, false).unwrap();
    assert_eq!(upd.mode, SetMode::Update);
    assert_eq!(upd.old_value, w(5));
    let r2 = upd.new_root;
    assert_ne!(r2, r1);

    let get = kv.get(&r2, &key, false).unwrap();
    assert_eq!(get.value, w(9));

    let del = kv.set(&r2, &key, &ZERO, true, false).unwrap();
    assert_eq!(del.mode, SetMode::Delete);
    assert_eq!(del.old_value, w(9));
    assert_eq!(del.new_root, ZERO);
}

#[test]
fn test_non_membership_proofs() {
    let kv = new_kv();
    let absent = w(1000);

    // entirely empty tree
    let empty = kv.get(&ZERO, &absent, false).unwrap();
    assert_eq!(empty.value, ZERO);
    assert!(empty.is_old0);
    assert!(empty.siblings.is_empty());
    assert_eq!(empty.proof_hash_counter, 0);
    assert!(verify_proof(
        &ZERO,
        &absent,
        &ZERO,
        &empty.siblings,
        &empty.ins_key,
        &empty.ins_value,
    ));

    // the search ends at a different leaf
    let key = w(42);
    let root = kv.set(&ZERO, &key, &w(5), true, false).unwrap().new_root;
    let miss = kv.get(&root, &absent, false).unwrap();
    assert_eq!(miss.value, ZERO);
    assert!(!miss.is_old0);
    assert_eq!(miss.ins_key, key);
    assert_eq!(miss.ins_value, w(5));
    assert!(verify_proof(
        &root,
        &absent,
        &ZERO,
        &miss.siblings,
        &miss.ins_key,
        &miss.ins_value,
    ));
}

#[test]
fn test_structural_sharing_keeps_old_roots_readable() {
    let kv = new_kv();
    let key = w(1);

    let r1 = kv.set(&ZERO, &key, &w(5), true, false).unwrap().new_root;
    let r2 = kv.set(&r1, &key, &w(9), true, false).unwrap().new_root;

    assert_eq!(kv.get(&r1, &key, false).unwrap().value, w(5));
    assert_eq!(kv.get(&r2, &key, false).unwrap().value, w(9));

    // divergent mutations of the same old root are independent versions
    let ra = kv.set(&r1, &w(2), &w(7), true, false).unwrap().new_root;
    let rb = kv.set(&r1, &w(3), &w(8), true, false).unwrap().new_root;
    assert_eq!(kv.get(&ra, &w(2), false).unwrap().value, w(7));
    assert_eq!(kv.get(&ra, &w(3), false).unwrap().value, ZERO);
    assert_eq!(kv.get(&rb, &w(3), false).unwrap().value, w(8));
    assert_eq!(kv.get(&rb, &w(2), false).unwrap().value, ZERO);
    assert_eq!(kv.get(&r1, &key, false).unwrap().value, w(5));
}

#[test]
fn test_delete_absent_key_is_noop() {
    let kv = new_kv();

    // empty tree
    let noop = kv.set(&ZERO, &w(9), &ZERO, true, false).unwrap();
    assert_eq!(noop.mode, SetMode::NoOp);
    assert_eq!(noop.new_root, ZERO);
    assert!(noop.is_old0);

    // populated tree, absent key colliding with an existing leaf
    let key = w(42);
    let root = kv.set(&ZERO, &key, &w(5), true, false).unwrap().new_root;
    let noop = kv.set(&root, &w(1000), &ZERO, true, false).unwrap();
    assert_eq!(noop.mode, SetMode::NoOp);
    assert_eq!(noop.new_root, root);
    assert_eq!(noop.ins_key, key);
}

#[test]
fn test_delete_pulls_sibling_leaf_up() {
    // keys share bit 0, diverge at bit 1
    let kv = new_kv();
    let k1 = w(1);
    let k2 = w(3);

    let r1 = kv.set(&ZERO, &k1, &w(10), true, false).unwrap().new_root;
    let ins = kv.set(&r1, &k2, &w(20), true, false).unwrap();
    assert_eq!(ins.mode, SetMode::Insert);
    assert!(!ins.is_old0);
    assert_eq!(ins.ins_key, k1);

    let del = kv.set(&ins.new_root, &k2, &ZERO, true, false).unwrap();
    assert_eq!(del.mode, SetMode::Delete);
    assert_eq!(del.ins_key, k1);
    assert_eq!(del.ins_value, w(10));
    // the lone remaining leaf collapses back to the single-key root
    assert_eq!(del.new_root, r1);
    assert!(verify_proof(
        &del.new_root,
        &k2,
        &ZERO,
        &del.siblings,
        &del.ins_key,
        &del.ins_value,
    ));
}

#[test]
fn test_delete_keeps_internal_sibling_in_place() {
    // k1 and k2 share bit 0 and diverge at bit 2; k3 branches off at bit 0
    let kv = new_kv();
    let k1 = w(1);
    let k2 = w(5);
    let k3 = w(2);

    let r1 = kv.set(&ZERO, &k1, &w(10), true, false).unwrap().new_root;
    let r2 = kv.set(&r1, &k2, &w(20), true, false).unwrap().new_root;
    let r3 = kv.set(&r2, &k3, &w(30), true, false).unwrap().new_root;

    let del = kv.set(&r3, &k3, &ZERO, true, false).unwrap();
    assert_eq!(del.mode, SetMode::Delete);
    assert_eq!(del.ins_key, ZERO);
    // the sibling subtree holds two leaves, so no pull-up happens and
    // the tree returns to its pre-k3 shape
    assert_eq!(del.new_root, r2);

    assert_eq!(kv.get(&del.new_root, &k1, false).unwrap().value, w(10));
    assert_eq!(kv.get(&del.new_root, &k2, false).unwrap().value, w(20));
    let gone = kv.get(&del.new_root, &k3, false).unwrap();
    assert_eq!(gone.value, ZERO);
    assert!(gone.is_old0);
    assert!(verify_proof(
        &del.new_root,
        &k3,
        &ZERO,
        &gone.siblings,
        &gone.ins_key,
        &gone.ins_value,
    ));
}

#[test]
fn test_insertion_order_does_not_change_root() {
    let mut rng = rand::thread_rng();
    let mut pairs: Vec<(Word256, Word256)> = (0..64)
        .map(|_| (rng.gen::<[u64; 4]>(), rng.gen::<[u64; 4]>()))
        .collect();

    let build = |pairs: &[(Word256, Word256)]| {
        let kv = new_kv();
        let mut root = ZERO;
        for (key, value) in pairs {
            root = kv.set(&root, key, value, true, false).unwrap().new_root;
        }
        root
    };

    let root_a = build(&pairs);
    pairs.shuffle(&mut rng);
    let root_b = build(&pairs);
    assert_eq!(root_a, root_b);
}

#[test]
fn test_randomized_operations() {
    let mut rng = rand::thread_rng();
    let kv = new_kv();
    let mut root = ZERO;
    let mut model: HashMap<Word256, Word256> = HashMap::new();

    let keys: Vec<Word256> = (0..200).map(|_| rng.gen::<[u64; 4]>()).collect();
    for key in &keys {
        let value: Word256 = [rng.gen::<u64>() | 1, 0, 0, 0];
        root = kv.set(&root, key, &value, true, false).unwrap().new_root;
        model.insert(*key, value);
    }

    // update a third, delete a third
    for key in keys.iter().step_by(3) {
        let value: Word256 = [rng.gen::<u64>() | 1, 0, 0, 0];
        root = kv.set(&root, key, &value, true, false).unwrap().new_root;
        model.insert(*key, value);
    }
    for key in keys.iter().skip(1).step_by(3) {
        root = kv.set(&root, key, &ZERO, true, false).unwrap().new_root;
        model.remove(key);
    }

    for key in &keys {
        let expected = model.get(key).copied().unwrap_or(ZERO);
        let get = kv.get(&root, key, false).unwrap();
        assert_eq!(get.value, expected);
        assert!(verify_proof(
            &root,
            key,
            &get.value,
            &get.siblings,
            &get.ins_key,
            &get.ins_value,
        ));
    }

    // replaying the surviving pairs from scratch reproduces the root
    let replay = new_kv();
    let mut replay_root = ZERO;
    for (key, value) in &model {
        replay_root = replay
            .set(&replay_root, key, value, true, false)
            .unwrap()
            .new_root;
    }
    assert_eq!(replay_root, root);
}

#[test]
fn test_proof_hash_counter_accounts_for_terminal_leaf() {
    let kv = new_kv();
    let key = w(42);
    let root = kv.set(&ZERO, &key, &w(5), true, false).unwrap().new_root;

    let hit = kv.get(&root, &key, false).unwrap();
    assert_eq!(hit.proof_hash_counter, hit.siblings.len() as u64 + 1);

    let empty = kv.get(&ZERO, &key, false).unwrap();
    assert_eq!(empty.proof_hash_counter, 0);
}

#[test]
fn test_get_unknown_root_fails() {
    let kv = new_kv();
    let err = kv.get(&w(12345), &w(1), false).unwrap_err();
    assert!(matches!(err, StateKvError::KeyNotFound(_)));
}

#[test]
fn test_flush_ids_strictly_increase() {
    let kv = new_kv();
    let (a, _) = kv.flush();
    kv.set(&ZERO, &w(1), &w(5), true, false).unwrap();
    let (b, _) = kv.flush();
    let (c, _) = kv.flush();
    assert!(a < b && b < c);

    let status = kv.get_flush_status();
    assert_eq!(status.last_flush_id, c);
    assert!(status.stored_flush_id <= status.storing_flush_id);
    assert!(status.storing_flush_id <= status.last_flush_id);
}

#[test]
fn test_flush_lifecycle() {
    let db = InMemoryDb::new();
    let kv = StateKv::new(db.clone());

    let root = kv.set(&ZERO, &w(1), &w(5), true, false).unwrap().new_root;
    let status = kv.get_flush_status();
    assert!(status.pending_nodes > 0);
    assert_eq!(status.storing_nodes, 0);

    let (flush_id, stored) = kv.flush();
    assert_eq!(flush_id, 1);
    assert_eq!(stored, 0);
    // sealed but unclaimed batches still count as pending
    assert!(kv.get_flush_status().pending_nodes > 0);

    let data = kv.get_flush_data(0).unwrap();
    assert_eq!(data.flush_id, flush_id);
    assert_eq!(data.state_root, root);
    assert!(!data.is_empty());
    // idempotent while storing
    assert_eq!(kv.get_flush_data(flush_id).unwrap(), data);

    let status = kv.get_flush_status();
    assert_eq!(status.pending_nodes, 0);
    assert!(status.storing_nodes > 0);
    assert_eq!(status.storing_flush_id, flush_id);

    db.commit(&data);
    let stored = kv.acknowledge_flush(flush_id).unwrap();
    assert_eq!(stored, flush_id);
    let status = kv.get_flush_status();
    assert_eq!(status.stored_flush_id, flush_id);
    assert_eq!(status.pending_nodes, 0);
    assert_eq!(status.storing_nodes, 0);

    // acknowledged batches are gone; repeat acks are harmless
    assert!(kv.get_flush_data(flush_id).is_err());
    assert_eq!(kv.acknowledge_flush(flush_id).unwrap(), flush_id);

    // empty queue: id 0 yields an empty payload with the canonical root
    let empty = kv.get_flush_data(0).unwrap();
    assert_eq!(empty.flush_id, 0);
    assert!(empty.is_empty());
    assert_eq!(empty.state_root, root);

    // unknown ids
    assert!(kv.get_flush_data(99).is_err());
    assert!(kv.acknowledge_flush(99).is_err());
}

#[test]
fn test_flush_replay_into_fresh_store() {
    let db = InMemoryDb::new();
    let kv = StateKv::new(db.clone());

    let mut root = ZERO;
    for n in 1..=20u64 {
        root = kv.set(&root, &w(n), &w(n * 100), true, false).unwrap().new_root;
    }
    let (flush_id, _) = kv.flush();
    let data = kv.get_flush_data(flush_id).unwrap();
    db.commit(&data);
    kv.acknowledge_flush(flush_id).unwrap();

    // a second engine over the committed store serves the same tree
    let fresh = StateKv::new(db);
    for n in 1..=20u64 {
        assert_eq!(fresh.get(&root, &w(n), false).unwrap().value, w(n * 100));
    }
}

#[test]
fn test_non_persistent_writes_stay_out_of_flush_batches() {
    let kv = new_kv();
    let root = kv.set(&ZERO, &w(1), &w(5), false, false).unwrap().new_root;

    assert_eq!(kv.get_flush_status().pending_nodes, 0);
    let (flush_id, _) = kv.flush();
    assert!(kv.get_flush_data(flush_id).unwrap().is_empty());

    // still readable within this process
    assert_eq!(kv.get(&root, &w(1), false).unwrap().value, w(5));
    // and the canonical root is untouched
    assert_eq!(kv.state_root(), ZERO);
}

#[test]
fn test_program_store_roundtrip() {
    let db = InMemoryDb::new();
    let kv = StateKv::new(db.clone());
    let key = w(77);
    let bytecode = vec![0x60, 0x00, 0x60, 0x00, 0xfd];

    kv.set_program(&key, &bytecode, true).unwrap();
    assert_eq!(kv.get_program(&key).unwrap(), bytecode);

    let missing = kv.get_program(&w(78)).unwrap_err();
    assert!(matches!(missing, StateKvError::KeyNotFound(_)));

    let (flush_id, _) = kv.flush();
    let data = kv.get_flush_data(flush_id).unwrap();
    assert_eq!(data.program_inserts.len(), 1);
    db.commit(&data);
    kv.acknowledge_flush(flush_id).unwrap();

    let fresh = StateKv::new(db);
    assert_eq!(fresh.get_program(&key).unwrap(), bytecode);
}

#[test]
fn test_load_db_warm_start() {
    let kv = new_kv();
    let mut root = ZERO;
    for n in 1..=10u64 {
        root = kv.set(&root, &w(n), &w(n), true, false).unwrap().new_root;
    }
    let (flush_id, _) = kv.flush();
    let data = kv.get_flush_data(flush_id).unwrap();

    let mut entries = HashMap::new();
    for node in data.node_inserts.iter().chain(&data.node_updates) {
        entries.insert(node.key, node.content.clone());
    }

    let warm = new_kv();
    warm.load_db(&entries, false).unwrap();
    for n in 1..=10u64 {
        assert_eq!(warm.get(&root, &w(n), false).unwrap().value, w(n));
    }
    // non-persistent load stays out of flush batches
    assert_eq!(warm.get_flush_status().pending_nodes, 0);

    // persistent load is staged for the durable writer
    let staged = new_kv();
    staged.load_db(&entries, true).unwrap();
    assert_eq!(staged.get_flush_status().pending_nodes, entries.len() as u64);
}

#[test]
fn test_load_db_rejects_malformed_entries() {
    let kv = new_kv();
    let root = kv.set(&ZERO, &w(1), &w(5), true, false).unwrap().new_root;
    let (flush_id, _) = kv.flush();
    let data = kv.get_flush_data(flush_id).unwrap();
    let good = &data.node_inserts[0];

    // wrong shape
    let mut entries = HashMap::new();
    entries.insert(w(1), vec![1, 2, 3]);
    let err = new_kv().load_db(&entries, false).unwrap_err();
    assert!(matches!(err, StateKvError::InvalidDataSize(_)));

    // key does not match the content digest; nothing is imported
    let target = new_kv();
    let mut entries = HashMap::new();
    entries.insert(good.key, good.content.clone());
    entries.insert(w(999), good.content.clone());
    let err = target.load_db(&entries, false).unwrap_err();
    assert!(matches!(err, StateKvError::Internal(_)));
    assert!(target.get(&root, &w(1), false).is_err());
}

#[test]
fn test_load_program_db() {
    let kv = new_kv();
    let mut entries = HashMap::new();
    entries.insert(w(1), vec![1u8, 2, 3]);
    entries.insert(w(2), vec![4u8, 5]);
    kv.load_program_db(&entries, true).unwrap();

    assert_eq!(kv.get_program(&w(1)).unwrap(), vec![1, 2, 3]);
    let status = kv.get_flush_status();
    assert_eq!(status.pending_programs, 2);
}

#[test]
fn test_read_log_captures_durable_reads_only() {
    let db = InMemoryDb::new();
    let kv = StateKv::new(db.clone());
    let mut root = ZERO;
    for n in 1..=5u64 {
        root = kv.set(&root, &w(n), &w(n), true, false).unwrap().new_root;
    }
    let (flush_id, _) = kv.flush();
    let data = kv.get_flush_data(flush_id).unwrap();
    db.commit(&data);

    // a fresh engine must hit the durable store
    let fresh = StateKv::new(db.clone());
    let first = fresh.get(&root, &w(3), true).unwrap();
    let log = first.read_log.expect("read log requested");
    assert!(!log.is_empty());
    for (key, content) in log.entries() {
        let key = types::from_hex(key).expect("hex hash key");
        assert_eq!(db.read_node(&key).unwrap().as_deref(), Some(content.as_slice()));
    }

    // the same query again is served from cache
    let second = fresh.get(&root, &w(3), true).unwrap();
    assert!(second.read_log.expect("read log requested").is_empty());

    // read log omitted unless asked for
    assert!(fresh.get(&root, &w(3), false).unwrap().read_log.is_none());
}

struct FailingDb;

impl Database for FailingDb {
    fn read_node(&self, _key: &Word256) -> Result<Option<Vec<u64>>> {
        Err(StateKvError::Db("disk offline".into()))
    }

    fn read_program(&self, _key: &Word256) -> Result<Option<Vec<u8>>> {
        Err(StateKvError::Db("disk offline".into()))
    }
}

#[test]
fn test_backing_store_failures_surface_as_db_errors() {
    let kv = StateKv::new(FailingDb);
    assert!(matches!(
        kv.get(&w(1), &w(2), false).unwrap_err(),
        StateKvError::Db(_)
    ));
    assert!(matches!(
        kv.set(&w(1), &w(2), &w(3), true, false).unwrap_err(),
        StateKvError::Db(_)
    ));
    assert!(matches!(
        kv.get_program(&w(1)).unwrap_err(),
        StateKvError::Db(_)
    ));
}

#[test]
fn test_api_set_get_roundtrip() {
    let kv = new_kv();
    let key = w(42);

    let set = api::set(
        &kv,
        &api::SetRequest {
            old_root: ZERO,
            key,
            value: "5".to_string(),
            persistent: true,
            details: true,
            get_db_read_log: false,
        },
    );
    assert_eq!(set.result, api::ResultCode::Success);
    assert_eq!(set.mode.as_deref(), Some("insert"));
    assert_eq!(set.is_old0, Some(true));
    assert_eq!(set.new_value.as_deref(), Some("5"));

    let get = api::get(
        &kv,
        &api::GetRequest {
            root: set.new_root,
            key,
            details: true,
            get_db_read_log: false,
        },
    );
    assert_eq!(get.result, api::ResultCode::Success);
    assert_eq!(get.value, "5");
    assert!(get.siblings.is_some());
}

#[test]
fn test_api_details_false_suppresses_proof_fields() {
    let kv = new_kv();
    let set = api::set(
        &kv,
        &api::SetRequest {
            old_root: ZERO,
            key: w(1),
            value: "5".to_string(),
            persistent: true,
            details: false,
            get_db_read_log: false,
        },
    );
    assert_eq!(set.result, api::ResultCode::Success);
    assert!(set.siblings.is_none());
    assert!(set.mode.is_none());

    let json = serde_json::to_value(&set).unwrap();
    assert_eq!(json["result"], "SUCCESS");
    assert!(json.get("siblings").is_none());
    assert!(json.get("mode").is_none());
}

#[test]
fn test_api_error_codes() {
    let kv = new_kv();

    let get = api::get(
        &kv,
        &api::GetRequest {
            root: w(12345),
            key: w(1),
            details: true,
            get_db_read_log: false,
        },
    );
    assert_eq!(get.result, api::ResultCode::DbKeyNotFound);
    assert_eq!(
        serde_json::to_value(&get.result).unwrap(),
        "DB_KEY_NOT_FOUND"
    );

    let set = api::set(
        &kv,
        &api::SetRequest {
            old_root: ZERO,
            key: w(1),
            value: "not-a-number".to_string(),
            persistent: true,
            details: true,
            get_db_read_log: false,
        },
    );
    assert_eq!(set.result, api::ResultCode::SmtInvalidDataSize);

    let failing = StateKv::new(FailingDb);
    let get = api::get(
        &failing,
        &api::GetRequest {
            root: w(1),
            key: w(2),
            details: false,
            get_db_read_log: false,
        },
    );
    assert_eq!(get.result, api::ResultCode::DbError);
}

#[test]
fn test_api_flush_surface() {
    let kv = new_kv();
    api::set(
        &kv,
        &api::SetRequest {
            old_root: ZERO,
            key: w(1),
            value: "5".to_string(),
            persistent: true,
            details: false,
            get_db_read_log: false,
        },
    );
    api::set_program(
        &kv,
        &api::SetProgramRequest {
            key: w(9),
            data: vec![1, 2, 3],
            persistent: true,
        },
    );

    let flush = api::flush(&kv);
    assert_eq!(flush.result, api::ResultCode::Success);
    assert_eq!(flush.flush_id, 1);

    let status = api::get_flush_status(&kv);
    assert_eq!(status.last_flush_id, 1);
    assert!(status.pending_nodes > 0);
    assert_eq!(status.pending_programs, 1);
    assert!(!status.prover_id.is_empty());

    let data = api::get_flush_data(&kv, &api::GetFlushDataRequest { flush_id: 0 });
    assert_eq!(data.result, api::ResultCode::Success);
    assert_eq!(data.flush_id, 1);
    assert_eq!(data.program_inserts.len(), 1);
    assert_eq!(data.state_root.len(), 64);
    for node in data.node_inserts.iter().chain(&data.node_updates) {
        assert!(types::from_hex(&node.key).is_some());
    }

    let program = api::get_program(&kv, &api::GetProgramRequest { key: w(9) });
    assert_eq!(program.result, api::ResultCode::Success);
    assert_eq!(program.data, Some(vec![1, 2, 3]));
}

#[test]
fn test_api_load_db_from_flush_data() {
    let kv = new_kv();
    let mut root = ZERO;
    for n in 1..=5u64 {
        root = kv.set(&root, &w(n), &w(n * 2), true, false).unwrap().new_root;
    }
    let (flush_id, _) = kv.flush();
    let data = api::get_flush_data(&kv, &api::GetFlushDataRequest { flush_id });

    let mut input_db = HashMap::new();
    for node in data.node_inserts.iter().chain(&data.node_updates) {
        input_db.insert(node.key.clone(), node.value.clone());
    }

    let warm = new_kv();
    let loaded = api::load_db(
        &warm,
        &api::LoadDbRequest {
            input_db,
            persistent: false,
        },
    );
    assert_eq!(loaded.result, api::ResultCode::Success);
    for n in 1..=5u64 {
        assert_eq!(warm.get(&root, &w(n), false).unwrap().value, w(n * 2));
    }
}
