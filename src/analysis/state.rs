//! Abstract state of one explored path
//!
//! The state is a product of the four sub-analysis states plus the
//! current basic block. States are content-addressed: exploration keeps a
//! per-function done-set and a state that hashes and compares equal to an
//! already-explored one is discarded, which is what guarantees
//! termination together with the state ceiling.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};

use crate::diagnostics::DelayedMessages;
use crate::ir::{BlockId, VarId};

/// Tracking status of the protection counter variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CountState {
    /// No counter value known.
    #[default]
    None,
    /// `count` is the exact counter value.
    Exact,
    /// The counter was folded into `depth`; `depth` is now relative to
    /// an unknown number of counted protects.
    Diff,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BalanceState {
    /// Net protects minus unprotects along this path.
    pub depth: i32,
    /// Depth snapshot taken when the stack top was saved.
    pub saved_depth: Option<i32>,
    pub count_state: CountState,
    pub count: i64,
    pub counter_var: Option<VarId>,
    pub top_save_var: Option<VarId>,
    /// Latched on constructs the abstraction cannot model; silences
    /// further balance checks on this path.
    pub confused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntGuardState {
    Zero,
    NonZero,
}

/// Unknown guards are simply absent from the map.
pub type IntGuards = BTreeMap<VarId, IntGuardState>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SexpGuardState {
    Nil,
    Symbol(String),
    NonNil,
}

impl SexpGuardState {
    /// Whether the guarded value is known to differ from nil.
    pub fn known_non_nil(&self) -> bool {
        matches!(self, SexpGuardState::Symbol(_) | SexpGuardState::NonNil)
    }
}

pub type SexpGuards = BTreeMap<VarId, SexpGuardState>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FreshState {
    /// Tracked locals and their protection counts; fresh iff present
    /// with count zero.
    pub vars: BTreeMap<VarId, u32>,
    /// Model of the runtime protection stack; `None` entries are
    /// anonymous.
    pub pstack: Vec<Option<VarId>>,
    /// Buffered diagnostics emitted only if the keyed variable is read.
    pub cond_msgs: BTreeMap<VarId, DelayedMessages>,
    pub confused: bool,
}

impl FreshState {
    pub fn is_fresh(&self, var: VarId) -> bool {
        self.vars.get(&var) == Some(&0)
    }

    /// Empty the modeled stack and zero every protection count.
    pub fn unprotect_all(&mut self) {
        self.pstack.clear();
        for count in self.vars.values_mut() {
            *count = 0;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckState {
    pub bb: BlockId,
    pub balance: BalanceState,
    pub int_guards: IntGuards,
    pub sexp_guards: SexpGuards,
    pub fresh: FreshState,
}

impl CheckState {
    pub fn entry(bb: BlockId) -> CheckState {
        CheckState {
            bb,
            balance: BalanceState::default(),
            int_guards: IntGuards::new(),
            sexp_guards: SexpGuards::new(),
            fresh: FreshState::default(),
        }
    }

    /// Clone this state onto a successor block.
    pub fn fork(&self, bb: BlockId) -> CheckState {
        let mut next = self.clone();
        next.bb = bb;
        next
    }

    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Per-function set of explored states.
///
/// In full-comparison mode (the default) states are deduplicated by hash
/// plus structural equality; hash-only mode trades a sliver of precision
/// for memory, since two distinct states colliding on the hash will be
/// explored once.
pub struct DoneSet {
    full: HashSet<CheckState>,
    hashes: HashSet<u64>,
    full_comparison: bool,
}

impl DoneSet {
    pub fn new(full_comparison: bool) -> DoneSet {
        DoneSet {
            full: HashSet::new(),
            hashes: HashSet::new(),
            full_comparison,
        }
    }

    /// Record a state; returns false when an equal state was already
    /// explored.
    pub fn insert(&mut self, state: &CheckState) -> bool {
        if self.full_comparison {
            self.full.insert(state.clone())
        } else {
            self.hashes.insert(state.content_hash())
        }
    }

    pub fn len(&self) -> usize {
        if self.full_comparison {
            self.full.len()
        } else {
            self.hashes.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.full.clear();
        self.hashes.clear();
    }
}
