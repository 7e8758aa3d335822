//! Concurrent transposition map: hash key to evaluated node.
//!
//! Shared by all workers of one search behind a single mutex; the two
//! critical sections (lookup during expansion, insert after result
//! assignment) are a handful of instructions each. Entries are inserted only
//! after their node carries network results, so any node another worker
//! obtains from the map is safe to alias.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use game_core::{Position, StateInfo};

use crate::node::Node;

/// Mutex-guarded key-to-node map.
pub struct TranspositionTable<P: Position> {
    map: Mutex<HashMap<u64, Arc<Node<P>>>>,
}

impl<P: Position> TranspositionTable<P> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Node registered for `key`, if any.
    pub fn lookup(&self, key: u64) -> Option<Arc<Node<P>>> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(Arc::clone)
    }

    /// Register `node` under `key`. An existing entry is kept: the first
    /// evaluated node for a key stays canonical.
    pub fn insert(&self, key: u64, node: Arc<Node<P>>) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert(node);
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<P: Position> Default for TranspositionTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a map hit may be used as a transposition for the state described
/// by `st`: the candidate must carry network results, sit at the same
/// distance from the last irreversible move, and the new state must not be a
/// repetition. Unverified hits are treated as misses.
pub fn is_transposition_verified<P: Position>(candidate: &Node<P>, st: &StateInfo) -> bool {
    candidate.has_nn_results()
        && candidate.plies_from_null() == st.plies_from_null
        && st.repetition == 0
}
