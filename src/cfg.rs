//! Control-flow graph construction and analysis
//!
//! Builds predecessor/successor maps and traversal orders from a function
//! body, and hosts the per-instruction liveness analysis used to prune
//! dead fresh variables.

use std::collections::{HashMap, HashSet};

use crate::ir::{BlockId, FunBody};

pub mod liveness;

pub use liveness::Liveness;

#[derive(Debug)]
pub struct Cfg {
    pub entry: BlockId,
    predecessors: HashMap<BlockId, Vec<BlockId>>,
    successors: HashMap<BlockId, Vec<BlockId>>,
    post_order: Vec<BlockId>,
    rpo: Vec<BlockId>,
}

impl Cfg {
    pub fn build(body: &FunBody) -> Cfg {
        let mut cfg = Cfg {
            entry: body.entry,
            predecessors: HashMap::new(),
            successors: HashMap::new(),
            post_order: Vec::new(),
            rpo: Vec::new(),
        };

        for bb in body.block_ids() {
            cfg.predecessors.insert(bb, Vec::new());
            cfg.successors.insert(bb, Vec::new());
        }

        for bb in body.block_ids() {
            let succs = body.block(bb).term.successors();
            for succ in &succs {
                cfg.predecessors.entry(*succ).or_default().push(bb);
            }
            cfg.successors.insert(bb, succs);
        }

        cfg.compute_post_order(body);
        cfg
    }

    fn compute_post_order(&mut self, body: &FunBody) {
        let mut visited = HashSet::new();
        let mut post_order = Vec::new();
        self.dfs(body.entry, &mut visited, &mut post_order);
        self.rpo = post_order.iter().rev().copied().collect();
        self.post_order = post_order;
    }

    fn dfs(&self, bb: BlockId, visited: &mut HashSet<BlockId>, post_order: &mut Vec<BlockId>) {
        if !visited.insert(bb) {
            return;
        }
        if let Some(succs) = self.successors.get(&bb) {
            for succ in succs.clone() {
                self.dfs(succ, visited, post_order);
            }
        }
        post_order.push(bb);
    }

    pub fn successors(&self, bb: BlockId) -> &[BlockId] {
        self.successors.get(&bb).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, bb: BlockId) -> &[BlockId] {
        self.predecessors
            .get(&bb)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Blocks in post order (used by backward dataflow).
    pub fn post_order(&self) -> &[BlockId] {
        &self.post_order
    }

    pub fn rpo(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Blocks reachable from the entry.
    pub fn reachable(&self) -> HashSet<BlockId> {
        self.post_order.iter().copied().collect()
    }
}
