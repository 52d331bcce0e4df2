//! Sparse Merkle tree traversal and mutation over a content-addressed
//! node store.
//!
//! Nodes are immutable: a mutation creates new nodes along the path from
//! the affected leaf up to the root and reuses every untouched sibling
//! subtree, so any number of historical roots stay readable. Path bits
//! are consumed least-significant first (`bit d` of the little-endian
//! 256-bit key, 0 = left). A leaf at depth `d` stores the key remainder
//! `key >> d` plus the 256-bit scalar value.

use crate::crypto::node_digest;
use crate::nodestore::NodeSource;
use crate::types::{self, GetResult, SetMode, SetResult, Word256, ZERO};
use crate::{Result, StateKvError};

/// Serialized node width in limbs: two 256-bit payload words plus a
/// 256-bit capacity marker separating leaf and internal content.
pub(crate) const NODE_WIDTH: usize = 12;

const LEAF_MARKER: u64 = 1;

pub(crate) enum Node {
    Internal { left: Word256, right: Word256 },
    Leaf { rkey: Word256, value: Word256 },
}

pub(crate) fn decode_node(content: &[u64]) -> Result<Node> {
    if content.len() != NODE_WIDTH {
        return Err(StateKvError::InvalidDataSize(format!(
            "node has {} limbs, expected {NODE_WIDTH}",
            content.len()
        )));
    }
    let a = [content[0], content[1], content[2], content[3]];
    let b = [content[4], content[5], content[6], content[7]];
    match &content[8..12] {
        [0, 0, 0, 0] => Ok(Node::Internal { left: a, right: b }),
        [LEAF_MARKER, 0, 0, 0] => Ok(Node::Leaf { rkey: a, value: b }),
        _ => Err(StateKvError::InvalidDataSize(
            "unrecognized node capacity marker".into(),
        )),
    }
}

pub(crate) fn encode_internal(left: &Word256, right: &Word256) -> Vec<u64> {
    let mut out = Vec::with_capacity(NODE_WIDTH);
    out.extend_from_slice(left);
    out.extend_from_slice(right);
    out.extend_from_slice(&[0, 0, 0, 0]);
    out
}

pub(crate) fn encode_leaf(rkey: &Word256, value: &Word256) -> Vec<u64> {
    let mut out = Vec::with_capacity(NODE_WIDTH);
    out.extend_from_slice(rkey);
    out.extend_from_slice(value);
    out.extend_from_slice(&[LEAF_MARKER, 0, 0, 0]);
    out
}

enum Terminal {
    Empty,
    Leaf { full_key: Word256, value: Word256 },
}

struct Walk {
    siblings: Vec<Word256>,
    terminal: Terminal,
}

fn walk<S: NodeSource>(src: &mut S, root: &Word256, key: &Word256) -> Result<Walk> {
    let mut siblings = Vec::new();
    let mut cursor = *root;
    loop {
        if types::is_zero(&cursor) {
            return Ok(Walk {
                siblings,
                terminal: Terminal::Empty,
            });
        }
        let content = src
            .load(&cursor)?
            .ok_or_else(|| StateKvError::KeyNotFound(types::to_hex(&cursor)))?;
        let depth = siblings.len();
        match decode_node(&content)? {
            Node::Internal { left, right } => {
                if depth >= 256 {
                    return Err(StateKvError::Internal(
                        "traversal exceeded the key width".into(),
                    ));
                }
                if types::bit(key, depth) == 1 {
                    siblings.push(left);
                    cursor = right;
                } else {
                    siblings.push(right);
                    cursor = left;
                }
            }
            Node::Leaf { rkey, value } => {
                let full_key = types::or(&types::shl(&rkey, depth), &types::low_bits(key, depth));
                return Ok(Walk {
                    siblings,
                    terminal: Terminal::Leaf { full_key, value },
                });
            }
        }
    }
}

pub(crate) fn get<S: NodeSource>(src: &mut S, root: &Word256, key: &Word256) -> Result<GetResult> {
    let walk = walk(src, root, key)?;
    let levels = walk.siblings.len() as u64;
    let (value, ins_key, ins_value, is_old0, leaf_hashes) = match walk.terminal {
        Terminal::Empty => (ZERO, ZERO, ZERO, true, 0),
        Terminal::Leaf { full_key, value } if full_key == *key => (value, *key, value, false, 1),
        Terminal::Leaf { full_key, value } => (ZERO, full_key, value, false, 1),
    };
    Ok(GetResult {
        root: *root,
        key: *key,
        value,
        siblings: walk.siblings,
        ins_key,
        ins_value,
        is_old0,
        proof_hash_counter: levels + leaf_hashes,
        read_log: None,
    })
}

pub(crate) struct SetOutcome {
    pub result: SetResult,
    /// Nodes created by the mutation, digest first, ready for staging.
    pub new_nodes: Vec<(Word256, Vec<u64>)>,
}

/// Collects new nodes bottom-up and counts digest evaluations.
#[derive(Default)]
struct Builder {
    nodes: Vec<(Word256, Vec<u64>)>,
    hashes: u64,
}

impl Builder {
    fn push(&mut self, content: Vec<u64>) -> Word256 {
        let digest = node_digest(&content);
        self.hashes += 1;
        self.nodes.push((digest, content));
        digest
    }

    fn leaf(&mut self, key: &Word256, depth: usize, value: &Word256) -> Word256 {
        self.push(encode_leaf(&types::shr(key, depth), value))
    }

    fn internal(&mut self, key_bit: u64, child: &Word256, sibling: &Word256) -> Word256 {
        if key_bit == 1 {
            self.push(encode_internal(sibling, child))
        } else {
            self.push(encode_internal(child, sibling))
        }
    }

    /// Rebuild internals from depth `siblings.len()` up to the root.
    fn ascend(&mut self, key: &Word256, siblings: &[Word256], mut current: Word256) -> Word256 {
        for h in (0..siblings.len()).rev() {
            current = self.internal(types::bit(key, h), &current, &siblings[h]);
        }
        current
    }
}

pub(crate) fn set<S: NodeSource>(
    src: &mut S,
    old_root: &Word256,
    key: &Word256,
    value: &Word256,
) -> Result<SetOutcome> {
    let walk = walk(src, old_root, key)?;
    let mut b = Builder::default();
    let depth = walk.siblings.len();
    let value_is_zero = types::is_zero(value);

    let (new_root, siblings, ins_key, ins_value, is_old0, old_value, mode) = match walk.terminal {
        Terminal::Leaf { full_key, value: old } if full_key == *key => {
            if !value_is_zero {
                let leaf = b.leaf(key, depth, value);
                let root = b.ascend(key, &walk.siblings, leaf);
                (root, walk.siblings, *key, old, false, old, SetMode::Update)
            } else {
                delete(src, &mut b, key, &walk.siblings, old)?
            }
        }
        Terminal::Leaf { full_key, value: other } => {
            if value_is_zero {
                // deleting an absent key leaves the tree untouched
                (
                    *old_root,
                    walk.siblings,
                    full_key,
                    other,
                    false,
                    ZERO,
                    SetMode::NoOp,
                )
            } else {
                insert_below(&mut b, key, value, &full_key, &other, &walk.siblings)?
            }
        }
        Terminal::Empty => {
            if value_is_zero {
                (
                    *old_root,
                    walk.siblings,
                    ZERO,
                    ZERO,
                    true,
                    ZERO,
                    SetMode::NoOp,
                )
            } else {
                let leaf = b.leaf(key, depth, value);
                let root = b.ascend(key, &walk.siblings, leaf);
                (root, walk.siblings, ZERO, ZERO, true, ZERO, SetMode::Insert)
            }
        }
    };

    Ok(SetOutcome {
        result: SetResult {
            old_root: *old_root,
            new_root,
            key: *key,
            siblings,
            ins_key,
            ins_value,
            is_old0,
            old_value,
            new_value: *value,
            mode,
            proof_hash_counter: b.hashes,
            read_log: None,
        },
        new_nodes: b.nodes,
    })
}

type CaseOutcome = (
    Word256,      // new_root
    Vec<Word256>, // siblings in the new tree
    Word256,      // ins_key
    Word256,      // ins_value
    bool,         // is_old0
    Word256,      // old_value
    SetMode,
);

/// Remove the leaf matching `key` at depth `siblings.len()` and compact:
/// a lone sibling leaf is pulled up past every empty sibling above it.
fn delete<S: NodeSource>(
    src: &mut S,
    b: &mut Builder,
    key: &Word256,
    siblings: &[Word256],
    old_value: Word256,
) -> Result<CaseOutcome> {
    let depth = siblings.len();

    // nearest non-empty sibling on the path, if any
    let mut t = depth;
    while t > 0 && types::is_zero(&siblings[t - 1]) {
        t -= 1;
    }
    if t == 0 {
        return Ok((ZERO, Vec::new(), ZERO, ZERO, false, old_value, SetMode::Delete));
    }

    let content = src
        .load(&siblings[t - 1])?
        .ok_or_else(|| StateKvError::KeyNotFound(types::to_hex(&siblings[t - 1])))?;
    match decode_node(&content)? {
        Node::Leaf { rkey, value } => {
            // the sibling leaf sits at depth t, on the path that shares
            // our first t-1 bits and flips bit t-1
            let prefix = types::flip_bit(types::low_bits(key, t), t - 1);
            let full_key = types::or(&types::shl(&rkey, t), &prefix);
            let mut up = t - 1;
            while up > 0 && types::is_zero(&siblings[up - 1]) {
                up -= 1;
            }
            let leaf = b.leaf(&full_key, up, &value);
            let kept = &siblings[..up];
            let root = b.ascend(key, kept, leaf);
            Ok((
                root,
                kept.to_vec(),
                full_key,
                value,
                false,
                old_value,
                SetMode::Delete,
            ))
        }
        Node::Internal { .. } => {
            // sibling subtree keeps its shape; the slot just becomes empty
            let kept = &siblings[..t];
            let root = b.ascend(key, kept, ZERO);
            Ok((
                root,
                kept.to_vec(),
                ZERO,
                ZERO,
                false,
                old_value,
                SetMode::Delete,
            ))
        }
    }
}

/// Insert `key` under a slot occupied by a different leaf: push the
/// existing leaf down to the first diverging bit and chain internals
/// back up to the traversal depth.
fn insert_below(
    b: &mut Builder,
    key: &Word256,
    value: &Word256,
    found_key: &Word256,
    found_value: &Word256,
    siblings: &[Word256],
) -> Result<CaseOutcome> {
    let depth = siblings.len();
    let mut j = depth;
    while j < 256 && types::bit(key, j) == types::bit(found_key, j) {
        j += 1;
    }
    if j >= 256 {
        return Err(StateKvError::Internal(
            "colliding leaf key does not diverge".into(),
        ));
    }

    let new_leaf = b.leaf(key, j + 1, value);
    let old_leaf = b.leaf(found_key, j + 1, found_value);
    let mut current = b.internal(types::bit(key, j), &new_leaf, &old_leaf);

    let mut path = siblings.to_vec();
    path.extend(std::iter::repeat(ZERO).take(j - depth));
    path.push(old_leaf);

    for h in (depth..j).rev() {
        current = b.internal(types::bit(key, h), &current, &ZERO);
    }
    let root = b.ascend(key, siblings, current);
    Ok((
        root,
        path,
        *found_key,
        *found_value,
        false,
        ZERO,
        SetMode::Insert,
    ))
}

/// Recompute a root from a proof.
///
/// The terminal node is the leaf for `(key, value)` when `value` is
/// non-zero, else the leaf reported by `ins_key`/`ins_value` when one is
/// present (exclusion via a colliding leaf), else the empty subtree.
pub fn verify_proof(
    root: &Word256,
    key: &Word256,
    value: &Word256,
    siblings: &[Word256],
    ins_key: &Word256,
    ins_value: &Word256,
) -> bool {
    let depth = siblings.len();
    let mut current = if !types::is_zero(value) {
        node_digest(&encode_leaf(&types::shr(key, depth), value))
    } else if !types::is_zero(ins_key) || !types::is_zero(ins_value) {
        node_digest(&encode_leaf(&types::shr(ins_key, depth), ins_value))
    } else {
        ZERO
    };
    for h in (0..depth).rev() {
        current = if types::bit(key, h) == 1 {
            node_digest(&encode_internal(&siblings[h], &current))
        } else {
            node_digest(&encode_internal(&current, &siblings[h]))
        };
    }
    current == *root
}
