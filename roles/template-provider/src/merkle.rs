//! Coinbase merkle-path arithmetic.
//!
//! The node hands templates over with a merkle path anchored at the
//! coinbase; the engine recomputes the same path from recorded txids and
//! folds a submitted coinbase back up to the root. Interior nodes use
//! double-SHA256 with the usual duplicate-last-node rule for odd levels.

use secp256k1::hashes::{sha256d::Hash as Sha256dHash, Hash};

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    Sha256dHash::hash(data).to_byte_array()
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut concat = [0u8; 64];
    concat[..32].copy_from_slice(left);
    concat[32..].copy_from_slice(right);
    sha256d(&concat)
}

/// The merkle path for the coinbase (leaf index 0), computed from the other
/// transactions' txids in template order. Empty when the coinbase is alone.
pub fn merkle_path_for_coinbase(txids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut path = Vec::new();
    if txids.is_empty() {
        return path;
    }
    // The coinbase's direct sibling is the first transaction; every later
    // path node is the root of the next subtree over, none of which contain
    // the coinbase.
    path.push(txids[0]);
    let mut level: Vec<[u8; 32]> = txids[1..].to_vec();
    while !level.is_empty() {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut i = 0;
        while i < level.len() {
            let left = level[i];
            let right = if i + 1 < level.len() { level[i + 1] } else { left };
            next.push(hash_pair(&left, &right));
            i += 2;
        }
        path.push(next[0]);
        level = next[1..].to_vec();
    }
    path
}

/// Folds a coinbase txid up its merkle path to the root. The coinbase is
/// always the left operand.
pub fn root_from_path(coinbase_txid: [u8; 32], path: &[[u8; 32]]) -> [u8; 32] {
    let mut cursor = coinbase_txid;
    for node in path {
        cursor = hash_pair(&cursor, node);
    }
    cursor
}
