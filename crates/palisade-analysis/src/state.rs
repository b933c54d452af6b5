//! Joined abstract state, the hash-consed visited set, and the work list.
//!
//! One abstract program position is a basic block plus one value from each
//! domain. States are owned values: proposing a successor clones the
//! current state, and the interning set either accepts it (new position,
//! enqueued) or drops it (already explored). Cycles in the state graph
//! terminate through interning alone; there are no per-edge counters.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use palisade_ir::module::{BlockId, SlotId};

use crate::balance::Balance;
use crate::fresh_vars::FreshVars;
use crate::int_guards::IntGuards;
use crate::sexp_guards::SexpGuards;

/// One abstract program position.
///
/// Equality and hashing are structural over every domain, including the
/// protect stack's order and any pending delayed messages; two states that
/// differ only there are distinct positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbsState {
    pub block: BlockId,
    pub balance: Balance,
    pub int_guards: IntGuards,
    pub sexp_guards: SexpGuards,
    pub fresh: FreshVars,
}

impl AbsState {
    /// State at function entry.
    pub fn entry(block: BlockId) -> Self {
        AbsState {
            block,
            balance: Balance::default(),
            int_guards: IntGuards::default(),
            sexp_guards: SexpGuards::default(),
            fresh: FreshVars::default(),
        }
    }

    /// Clone this state for a successor block.
    pub fn fork(&self, block: BlockId) -> Self {
        let mut next = self.clone();
        next.block = block;
        next
    }
}

fn structural_hash(state: &AbsState) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    state.hash(&mut hasher);
    hasher.finish()
}

/// Interning set plus LIFO work list, bounded by a per-function state cap.
pub struct StateSet {
    /// Compare states structurally; when off, only 64-bit hashes are
    /// compared, trading precision for speed.
    full_comparison: bool,
    max_states: usize,
    seen: HashSet<AbsState>,
    seen_hashes: HashSet<u64>,
    work: Vec<AbsState>,
}

impl StateSet {
    pub fn new(max_states: usize, full_comparison: bool) -> Self {
        StateSet {
            full_comparison,
            max_states,
            seen: HashSet::new(),
            seen_hashes: HashSet::new(),
            work: Vec::new(),
        }
    }

    /// Intern `state`; enqueue and return true when it is a new position.
    pub fn add(&mut self, state: AbsState) -> bool {
        let fresh = if self.full_comparison {
            self.seen.insert(state.clone())
        } else {
            self.seen_hashes.insert(structural_hash(&state))
        };
        if fresh {
            self.work.push(state);
        }
        fresh
    }

    pub fn pop(&mut self) -> Option<AbsState> {
        self.work.pop()
    }

    /// Number of distinct positions interned so far.
    pub fn visited(&self) -> usize {
        if self.full_comparison {
            self.seen.len()
        } else {
            self.seen_hashes.len()
        }
    }

    pub fn over_budget(&self) -> bool {
        self.visited() > self.max_states
    }
}

/// Memoized per-slot predicate, shared by the recognizers.
///
/// Recognition walks a slot's whole use list, so every predicate is cached
/// on first query for the function being analyzed.
#[derive(Default)]
pub struct SlotPredicateCache {
    cache: RefCell<HashMap<SlotId, bool>>,
}

impl SlotPredicateCache {
    pub fn get_or_compute(&self, slot: SlotId, compute: impl FnOnce() -> bool) -> bool {
        if let Some(&cached) = self.cache.borrow().get(&slot) {
            return cached;
        }
        let result = compute();
        self.cache.borrow_mut().insert(slot, result);
        result
    }
}
