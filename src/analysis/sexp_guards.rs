//! SEXP guard tracking
//!
//! Local SEXP variables compared against nil or specific symbols act as
//! guards; tracking them four-valued (nil, a known symbol, non-nil,
//! unknown) prunes nil-check branches. Marking allocator results non-nil
//! is optional and not strictly correct — an allocator may return nil —
//! but pays off in practice.

use tracing::debug;

use super::patterns;
use super::state::{CheckState, SexpGuards, SexpGuardState};
use super::Ctx;
use crate::ir::{visit, CallExp, CmpOp, Exp, FunBody, Term, VarId};

pub fn transfer_inst(ctx: &mut Ctx, guards: &mut SexpGuards, events: &[visit::Event<'_>]) {
    for event in events {
        let visit::Event::StoreLocal { var, value } = event else {
            continue;
        };
        if !ctx.rec.is_sexp_guard(*var) {
            continue;
        }
        handle_guard_store(ctx, guards, *var, value);
    }
}

fn handle_guard_store(ctx: &mut Ctx, guards: &mut SexpGuards, var: VarId, value: &Exp) {
    // guard = PROTECT(e) passes e through
    let value = match value {
        Exp::Call(call) if ctx.oracles.runtime.is_protect(call.callee) => {
            call.args.first().unwrap_or(value)
        }
        other => other,
    };

    match value {
        Exp::Global(g) if Some(*g) == ctx.oracles.runtime.nil => {
            debug!("sexp guard {} set to nil", ctx.var_name(var));
            guards.insert(var, SexpGuardState::Nil);
        }
        Exp::Global(g) => match ctx.oracles.symbols.symbol_name(*g) {
            Some(name) => {
                debug!("sexp guard {} set to symbol {name}", ctx.var_name(var));
                guards.insert(var, SexpGuardState::Symbol(name.to_string()));
            }
            None => {
                guards.remove(&var);
            }
        },
        Exp::Local(src) if ctx.rec.is_sexp_guard(*src) => match guards.get(src).cloned() {
            Some(gs) => {
                guards.insert(var, gs);
            }
            None => {
                guards.remove(&var);
            }
        },
        Exp::Call(call) => handle_guard_call_store(ctx, guards, var, call),
        _ => {
            guards.remove(&var);
        }
    }
}

fn handle_guard_call_store(ctx: &mut Ctx, guards: &mut SexpGuards, var: VarId, call: &CallExp) {
    // guard = install("name")
    if Some(call.callee) == ctx.oracles.runtime.install {
        if let Some(Exp::Str(name)) = call.args.first() {
            debug!("sexp guard {} set to installed symbol {name}", ctx.var_name(var));
            guards.insert(var, SexpGuardState::Symbol(name.clone()));
            return;
        }
    }
    // guard = alloc(...)
    if ctx.config.use_allocator_detection
        && ctx.oracles.allocators.is_possible_allocator(call.callee)
    {
        debug!("sexp guard {} set to non-nil (allocated)", ctx.var_name(var));
        guards.insert(var, SexpGuardState::NonNil);
        return;
    }
    guards.remove(&var);
}

/// Prune branches on nil checks and symbol identity checks.
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

    // isNull(g), g == R_NilValue, g != R_NilValue
    if let Some((var, positive)) = nil_check(ctx, cond) {
        if !ctx.rec.is_sexp_guard(var) {
            return None;
        }
        return Some(prune_nil_check(ctx, state, var, positive, *then_bb, *else_bb));
    }

    // g == @symbol, g != @symbol
    if let Some((var, op, global)) = patterns::cmp_local_against_global(cond) {
        let name = ctx.oracles.symbols.symbol_name(global)?;
        if !ctx.rec.is_sexp_guard(var) {
            return None;
        }
        let name = name.to_string();
        return Some(prune_symbol_check(
            ctx, state, var, op, name, *then_bb, *else_bb,
        ));
    }

    None
}

/// `(guard, positive)` where positive means the true edge is the nil
/// edge.
fn nil_check(ctx: &Ctx, cond: &Exp) -> Option<(VarId, bool)> {
    if let Exp::Call(call) = cond {
        if Some(call.callee) == ctx.oracles.runtime.is_null {
            if let Some(Exp::Local(var)) = call.args.first() {
                return Some((*var, true));
            }
        }
        return None;
    }
    let (var, op, global) = patterns::cmp_local_against_global(cond)?;
    if Some(global) == ctx.oracles.runtime.nil {
        return Some((var, op == CmpOp::Eq));
    }
    None
}

fn prune_nil_check(
    ctx: &mut Ctx,
    state: &CheckState,
    var: VarId,
    positive: bool,
    then_bb: crate::ir::BlockId,
    else_bb: crate::ir::BlockId,
) -> Vec<CheckState> {
    let known = state.sexp_guards.get(&var);
    // a symbol is never nil, so Symbol and NonNil both decide the check
    let is_nil = known.map(|gs| !gs.known_non_nil());
    let nil_succ = if positive { then_bb } else { else_bb };
    let non_nil_succ = if positive { else_bb } else { then_bb };

    let mut successors = Vec::new();
    if is_nil != Some(false) {
        let mut next = state.fork(nil_succ);
        next.sexp_guards.insert(var, SexpGuardState::Nil);
        successors.push(next);
    }
    if is_nil != Some(true) {
        let mut next = state.fork(non_nil_succ);
        // never weaken a known symbol to plain non-nil
        if !matches!(state.sexp_guards.get(&var), Some(SexpGuardState::Symbol(_))) {
            next.sexp_guards.insert(var, SexpGuardState::NonNil);
        }
        successors.push(next);
    }
    if successors.len() == 1 {
        debug!(
            "taking the only feasible branch on nil check of {}",
            ctx.var_name(var)
        );
    }
    successors
}

fn prune_symbol_check(
    ctx: &mut Ctx,
    state: &CheckState,
    var: VarId,
    op: CmpOp,
    name: String,
    then_bb: crate::ir::BlockId,
    else_bb: crate::ir::BlockId,
) -> Vec<CheckState> {
    // does the guard equal this symbol?
    let equal = match state.sexp_guards.get(&var) {
        Some(SexpGuardState::Symbol(known)) => Some(known == &name),
        // nil is not a symbol
        Some(SexpGuardState::Nil) => Some(false),
        Some(SexpGuardState::NonNil) | None => None,
    };
    let equal_succ = if op == CmpOp::Eq { then_bb } else { else_bb };
    let other_succ = if op == CmpOp::Eq { else_bb } else { then_bb };

    let mut successors = Vec::new();
    if equal != Some(false) {
        let mut next = state.fork(equal_succ);
        next.sexp_guards
            .insert(var, SexpGuardState::Symbol(name.clone()));
        successors.push(next);
    }
    if equal != Some(true) {
        // knowing the value is not one particular symbol is not
        // representable; the state is left as is
        successors.push(state.fork(other_succ));
    }
    if successors.len() == 1 {
        debug!(
            "taking the only feasible branch on symbol check of {}",
            ctx.var_name(var)
        );
    }
    successors
}

#[cfg(test)]
mod tests;
