//! Integer guard tracking
//!
//! Certain local integers only ever gate control flow on zero/non-zero;
//! tracking them three-valued lets the executor prune branches that a
//! path cannot take. Recognition is deliberately narrow to keep the
//! state space small.

use tracing::debug;

use super::patterns;
use super::state::{CheckState, IntGuards, IntGuardState};
use super::Ctx;
use crate::ir::{visit, CmpOp, Exp, FunBody, Term};

pub fn transfer_inst(ctx: &mut Ctx, guards: &mut IntGuards, events: &[visit::Event<'_>]) {
    for event in events {
        let visit::Event::StoreLocal { var, value } = event else {
            continue;
        };
        if !ctx.rec.is_int_guard(*var) {
            continue;
        }
        match value {
            Exp::Const(0) => {
                debug!("integer guard {} set to zero", ctx.var_name(*var));
                guards.insert(*var, IntGuardState::Zero);
            }
            Exp::Const(_) => {
                debug!("integer guard {} set to nonzero", ctx.var_name(*var));
                guards.insert(*var, IntGuardState::NonZero);
            }
            Exp::Local(src) if ctx.rec.is_int_guard(*src) => {
                match guards.get(src).copied() {
                    Some(gs) => {
                        guards.insert(*var, gs);
                    }
                    None => {
                        guards.remove(var);
                    }
                }
            }
            _ => {
                guards.remove(var);
            }
        }
    }
}

/// Prune a branch on `guard == 0` / `guard != 0`. Successor states carry
/// the guard value the taken edge implies.
pub fn handle_terminator(
    ctx: &mut Ctx,
    state: &CheckState,
    body: &FunBody,
) -> Option<Vec<CheckState>> {
    let Term::Branch {
        cond,
        then_bb,
        else_bb,
    } = &body.block(state.bb).term
    else {
        return None;
    };
    let (var, op) = patterns::cmp_local_against_zero(cond)?;
    if !ctx.rec.is_int_guard(var) {
        return None;
    }

    let known = state.int_guards.get(&var).copied();
    // the value each successor implies for the guard
    let (then_implies, else_implies) = match op {
        CmpOp::Eq => (IntGuardState::Zero, IntGuardState::NonZero),
        CmpOp::Ne => (IntGuardState::NonZero, IntGuardState::Zero),
    };

    let mut successors = Vec::new();
    if known != Some(else_implies) {
        let mut next = state.fork(*then_bb);
        next.int_guards.insert(var, then_implies);
        successors.push(next);
    }
    if known != Some(then_implies) {
        let mut next = state.fork(*else_bb);
        next.int_guards.insert(var, else_implies);
        successors.push(next);
    }
    if successors.len() == 1 {
        debug!(
            "taking the only feasible branch on integer guard {}",
            ctx.var_name(var)
        );
    }
    Some(successors)
}
