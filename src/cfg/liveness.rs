//! Per-instruction liveness of local variables
//!
//! Backward dataflow over the CFG, computed once per function. Two
//! flavors are tracked: may-use (the variable is possibly read later on
//! some path) and must-use (the variable is read later on every path
//! before being overwritten). The freshness analysis prunes dead entries
//! with the former and promotes conditional messages with the latter.

use std::collections::{BTreeSet, HashMap};

use super::Cfg;
use crate::ir::{BlockId, Exp, FunBody, InstKind, Term, VarId};

pub type VarSet = BTreeSet<VarId>;

/// Position of an instruction within a body; the terminator sits at
/// `block.insts.len()`.
pub type InstPos = (BlockId, usize);

#[derive(Debug, Default, Clone)]
pub struct InstLiveness {
    /// Possibly read at or after this instruction on some path.
    pub possibly_used: VarSet,
    /// Read at or after this instruction on every path, before any
    /// overwrite.
    pub definitely_used: VarSet,
    /// Overwritten by this instruction.
    pub killed: VarSet,
}

#[derive(Debug)]
pub struct Liveness {
    per_inst: HashMap<InstPos, InstLiveness>,
}

impl Liveness {
    pub fn compute(body: &FunBody, cfg: &Cfg) -> Liveness {
        let universe: VarSet = (0..body.locals.len() as u32).map(VarId).collect();

        // Block-level fixpoints, may and must.
        let mut may_in: HashMap<BlockId, VarSet> = HashMap::new();
        let mut must_in: HashMap<BlockId, VarSet> = HashMap::new();
        for bb in body.block_ids() {
            may_in.insert(bb, VarSet::new());
            must_in.insert(bb, universe.clone());
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &bb in cfg.post_order() {
                let succs = cfg.successors(bb);

                let mut may_out = VarSet::new();
                for succ in succs {
                    may_out.extend(may_in[succ].iter().copied());
                }
                let must_out = match succs {
                    [] => VarSet::new(),
                    [first, rest @ ..] => {
                        let mut acc = must_in[first].clone();
                        for succ in rest {
                            acc = acc.intersection(&must_in[succ]).copied().collect();
                        }
                        acc
                    }
                };

                let (new_may, new_must) = transfer_block(body, bb, may_out, must_out);
                if new_may != may_in[&bb] {
                    may_in.insert(bb, new_may);
                    changed = true;
                }
                if new_must != must_in[&bb] {
                    must_in.insert(bb, new_must);
                    changed = true;
                }
            }
        }

        // Per-instruction sets from the stable block-out values.
        let mut per_inst = HashMap::new();
        for bb in body.block_ids() {
            let succs = cfg.successors(bb);
            let mut may = VarSet::new();
            for succ in succs {
                may.extend(may_in[succ].iter().copied());
            }
            let mut must = match succs {
                [] => VarSet::new(),
                [first, rest @ ..] => {
                    let mut acc = must_in[first].clone();
                    for succ in rest {
                        acc = acc.intersection(&must_in[succ]).copied().collect();
                    }
                    acc
                }
            };

            let block = body.block(bb);
            let nterm = block.insts.len();
            let term_uses = term_uses(&block.term);
            may.extend(term_uses.iter().copied());
            must.extend(term_uses.iter().copied());
            per_inst.insert(
                (bb, nterm),
                InstLiveness {
                    possibly_used: may.clone(),
                    definitely_used: must.clone(),
                    killed: VarSet::new(),
                },
            );

            for (idx, inst) in block.insts.iter().enumerate().rev() {
                let (uses, defs) = inst_uses_defs(&inst.kind);
                for def in &defs {
                    may.remove(def);
                    must.remove(def);
                }
                may.extend(uses.iter().copied());
                must.extend(uses.iter().copied());
                per_inst.insert(
                    (bb, idx),
                    InstLiveness {
                        possibly_used: may.clone(),
                        definitely_used: must.clone(),
                        killed: defs,
                    },
                );
            }
        }

        Liveness { per_inst }
    }

    /// Liveness at an instruction. Every reachable instruction has an
    /// entry; a miss is a bug in the analysis setup.
    pub fn at(&self, bb: BlockId, idx: usize) -> &InstLiveness {
        self.per_inst
            .get(&(bb, idx))
            .unwrap_or_else(|| panic!("no liveness entry for {bb} instruction {idx}"))
    }

    /// Liveness at a position that may be past the end of the block.
    pub fn try_at(&self, bb: BlockId, idx: usize) -> Option<&InstLiveness> {
        self.per_inst.get(&(bb, idx))
    }
}

fn transfer_block(
    body: &FunBody,
    bb: BlockId,
    may_out: VarSet,
    must_out: VarSet,
) -> (VarSet, VarSet) {
    let block = body.block(bb);
    let mut may = may_out;
    let mut must = must_out;

    let term_uses = term_uses(&block.term);
    may.extend(term_uses.iter().copied());
    must.extend(term_uses.iter().copied());

    for inst in block.insts.iter().rev() {
        let (uses, defs) = inst_uses_defs(&inst.kind);
        for def in &defs {
            may.remove(def);
            must.remove(def);
        }
        may.extend(uses.iter().copied());
        must.extend(uses);
    }
    (may, must)
}

fn inst_uses_defs(kind: &InstKind) -> (VarSet, VarSet) {
    let mut uses = VarSet::new();
    let mut defs = VarSet::new();
    match kind {
        InstKind::Store { var, value } => {
            exp_uses(value, &mut uses, &mut defs);
            defs.insert(*var);
        }
        InstKind::StoreGlobal { value, .. } => exp_uses(value, &mut uses, &mut defs),
        InstKind::StoreField { base, value, .. } => {
            exp_uses(base, &mut uses, &mut defs);
            exp_uses(value, &mut uses, &mut defs);
        }
        InstKind::Eval(value) => exp_uses(value, &mut uses, &mut defs),
    }
    (uses, defs)
}

fn term_uses(term: &Term) -> VarSet {
    let mut uses = VarSet::new();
    let mut defs = VarSet::new();
    match term {
        Term::Branch { cond, .. } => exp_uses(cond, &mut uses, &mut defs),
        Term::Ret(Some(value)) => exp_uses(value, &mut uses, &mut defs),
        _ => {}
    }
    uses
}

fn exp_uses(exp: &Exp, uses: &mut VarSet, defs: &mut VarSet) {
    match exp {
        Exp::Const(_) | Exp::Str(_) | Exp::Global(_) | Exp::Arg(_) | Exp::Unknown => {}
        // taking the address counts as a use for liveness purposes
        Exp::Local(var) | Exp::AddrLocal(var) => {
            uses.insert(*var);
        }
        Exp::Call(call) => {
            for arg in &call.args {
                exp_uses(arg, uses, defs);
            }
        }
        Exp::Assign(var, value) => {
            exp_uses(value, uses, defs);
            defs.insert(*var);
        }
        Exp::Select {
            cond,
            then_val,
            else_val,
        } => {
            exp_uses(cond, uses, defs);
            exp_uses(then_val, uses, defs);
            exp_uses(else_val, uses, defs);
        }
        Exp::Cmp { lhs, rhs, .. } | Exp::Add { lhs, rhs } => {
            exp_uses(lhs, uses, defs);
            exp_uses(rhs, uses, defs);
        }
        Exp::Phi(args) => {
            for arg in args {
                exp_uses(arg, uses, defs);
            }
        }
        Exp::AddrField { base, .. } => exp_uses(base, uses, defs),
    }
}
