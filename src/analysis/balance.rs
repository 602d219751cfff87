//! Protection-stack balance tracking
//!
//! Counts PROTECT/UNPROTECT along each path and recognizes the two
//! idioms C code uses to restore balance wholesale: an `nprotect`
//! counter variable handed to UNPROTECT, and saving/restoring the stack
//! top. Constructs outside the abstraction latch `confused`, which
//! silences further balance findings on that path.

use tracing::{debug, trace};

use super::patterns::{self, UnprotectArg};
use super::state::{BalanceState, CheckState, CountState, IntGuards, IntGuardState};
use super::Ctx;
use crate::diagnostics::Kind;
use crate::ir::{visit, CallExp, CmpOp, Exp, FunBody, Term, VarId};

/// Whether the freshness tracker matched an `UNPROTECT_PTR` argument to
/// the top of its modeled stack this instruction.
pub type UnprotectPtrHint = Option<bool>;

pub fn transfer_inst(
    ctx: &mut Ctx,
    b: &mut BalanceState,
    int_guards: Option<&IntGuards>,
    events: &[visit::Event<'_>],
    unprotect_ptr_top: UnprotectPtrHint,
) {
    if b.count_state != CountState::Diff && b.depth < 0 {
        // a negative-depth report was already made on this path
        return;
    }

    for event in events {
        if b.confused {
            return;
        }
        match event {
            visit::Event::Call { call, .. } => {
                handle_call(ctx, b, int_guards, call, unprotect_ptr_top)
            }
            visit::Event::StoreLocal { var, value } => handle_store(ctx, b, *var, value),
            visit::Event::StoreGlobal { global, value } => {
                if Some(*global) == ctx.oracles.runtime.pp_stack_top {
                    handle_stack_top_restore(ctx, b, value);
                }
            }
            _ => {}
        }
    }
}

fn confuse(ctx: &mut Ctx, b: &mut BalanceState, message: String) {
    ctx.reporter.info(Kind::Balance, ctx.line, message);
    b.confused = true;
    trace!("balance confused, silencing further checks on this path");
}

fn report_negative_depth(ctx: &mut Ctx, b: &BalanceState, message: &str) {
    if b.count_state != CountState::Diff && b.depth < 0 {
        ctx.reporter
            .info(Kind::Balance, ctx.line, message.to_string());
        *ctx.refinable += 1;
    }
}

fn handle_call(
    ctx: &mut Ctx,
    b: &mut BalanceState,
    int_guards: Option<&IntGuards>,
    call: &CallExp,
    unprotect_ptr_top: UnprotectPtrHint,
) {
    let rt = &ctx.oracles.runtime;

    if rt.is_protect(call.callee) {
        if b.depth > ctx.config.max_depth {
            confuse(ctx, b, "has too high protection stack depth".into());
        } else {
            b.depth += 1;
        }
        return;
    }

    if Some(call.callee) == rt.unprotect {
        let Some(arg) = call.args.first() else { return };
        match patterns::unprotect_arg(arg) {
            UnprotectArg::Const(k) => {
                b.depth -= k as i32;
                debug!("unprotect by constant {k}");
                report_negative_depth(ctx, b, "has negative depth");
            }
            UnprotectArg::Counter { var, addend } => {
                handle_unprotect_counter(ctx, b, var, addend)
            }
            UnprotectArg::GuardSelect {
                guard,
                true_when_zero,
                then_val,
                else_val,
            } => {
                let known = int_guards
                    .filter(|_| ctx.rec.is_int_guard(guard))
                    .and_then(|g| g.get(&guard).copied());
                match known {
                    Some(gs) => {
                        let zero = gs == IntGuardState::Zero;
                        let taken = if zero == true_when_zero {
                            then_val
                        } else {
                            else_val
                        };
                        b.depth -= taken as i32;
                        debug!("unprotect through guard conditional, taking {taken}");
                        report_negative_depth(ctx, b, "has negative depth");
                    }
                    None => {
                        if int_guards.is_none() {
                            // integer guards would resolve this form
                            *ctx.refinable += 1;
                        }
                        confuse(
                            ctx,
                            b,
                            "has an unsupported form of unprotect (conditional count)".into(),
                        );
                    }
                }
            }
            UnprotectArg::UnsupportedAdd => confuse(
                ctx,
                b,
                "has an unsupported form of unprotect with a variable (binary add)".into(),
            ),
            UnprotectArg::Unsupported => confuse(
                ctx,
                b,
                "has an unsupported form of unprotect (not constant, not variable)".into(),
            ),
        }
        return;
    }

    if Some(call.callee) == rt.unprotect_ptr {
        if unprotect_ptr_top == Some(false) {
            confuse(
                ctx,
                b,
                "unprotect_ptr of a value not on top of the protection stack".into(),
            );
            return;
        }
        b.depth -= 1;
        report_negative_depth(ctx, b, "has negative depth");
    }
}

fn handle_unprotect_counter(ctx: &mut Ctx, b: &mut BalanceState, var: VarId, addend: i64) {
    if !ctx.rec.is_counter_var(var) {
        confuse(
            ctx,
            b,
            "has an unsupported form of unprotect with a variable".into(),
        );
        return;
    }
    if !bind_counter(ctx, b, var) {
        return;
    }
    match b.count_state {
        CountState::None => {
            ctx.reporter.info(
                Kind::Balance,
                ctx.line,
                "passes an uninitialized protection counter to unprotect".into(),
            );
            *ctx.refinable += 1;
        }
        CountState::Exact => {
            b.depth -= (b.count + addend) as i32;
            debug!("unprotect by counter in exact state");
            report_negative_depth(ctx, b, "has negative depth");
        }
        CountState::Diff => {
            // the depth delta absorbs the counter; it is exact again
            b.count_state = CountState::None;
            b.depth -= addend as i32;
            debug!("unprotect by counter in differential state");
            report_negative_depth(ctx, b, "has negative depth after unprotect by counter");
        }
    }
}

fn bind_counter(ctx: &mut Ctx, b: &mut BalanceState, var: VarId) -> bool {
    match b.counter_var {
        None => {
            b.counter_var = Some(var);
            true
        }
        Some(bound) if bound == var => true,
        Some(_) => {
            confuse(
                ctx,
                b,
                "uses multiple protection counter variables".into(),
            );
            false
        }
    }
}

fn handle_store(ctx: &mut Ctx, b: &mut BalanceState, var: VarId, value: &Exp) {
    // savestack = R_PPStackTop
    if matches!(value, Exp::Global(g) if Some(*g) == ctx.oracles.runtime.pp_stack_top) {
        if ctx.rec.is_top_save_var(var) {
            if b.count_state == CountState::Diff {
                *ctx.refinable += 1;
                confuse(
                    ctx,
                    b,
                    "saves the protection stack top while in differential count state".into(),
                );
                return;
            }
            b.saved_depth = Some(b.depth);
            b.top_save_var = Some(var);
            debug!("saved protection stack top into {}", ctx.var_name(var));
        }
        return;
    }

    if !ctx.rec.is_counter_var(var) {
        return;
    }
    if !bind_counter(ctx, b, var) {
        return;
    }

    match value {
        Exp::Const(c) => {
            if b.count_state == CountState::Diff {
                ctx.reporter.info(
                    Kind::Balance,
                    ctx.line,
                    "sets the protection counter while in differential state (forgetting protects?)"
                        .into(),
                );
                *ctx.refinable += 1;
                return;
            }
            if *c > ctx.config.max_count {
                debug!("large constant counter value, switching to differential state");
                b.count_state = CountState::Diff;
                b.depth -= *c as i32;
                b.count = 0;
            } else {
                b.count_state = CountState::Exact;
                b.count = *c;
                if *c < 0 {
                    ctx.reporter.info(
                        Kind::Balance,
                        ctx.line,
                        "protection counter set to a negative value".into(),
                    );
                }
            }
        }
        Exp::Add { lhs, rhs } => {
            let addend = match (lhs.as_ref(), rhs.as_ref()) {
                (Exp::Local(v), Exp::Const(c)) | (Exp::Const(c), Exp::Local(v)) if *v == var => *c,
                _ => return,
            };
            match b.count_state {
                CountState::None => {
                    ctx.reporter.info(
                        Kind::Balance,
                        ctx.line,
                        "adds a constant to an uninitialized protection counter".into(),
                    );
                    *ctx.refinable += 1;
                }
                CountState::Exact => {
                    b.count += addend;
                    if b.count < 0 {
                        ctx.reporter.info(
                            Kind::Balance,
                            ctx.line,
                            "protection counter went negative after add".into(),
                        );
                        *ctx.refinable += 1;
                    } else if b.count > ctx.config.max_count {
                        b.count_state = CountState::Diff;
                        b.depth -= b.count as i32;
                        b.count = 0;
                    }
                }
                CountState::Diff => {
                    // fewer protects on top of the counter than before
                    b.depth -= addend as i32;
                }
            }
        }
        _ => {}
    }
}

fn handle_stack_top_restore(ctx: &mut Ctx, b: &mut BalanceState, value: &Exp) {
    // R_PPStackTop = savestack
    if let Exp::Local(var) = value {
        if Some(*var) == b.top_save_var {
            if b.count_state == CountState::Diff {
                confuse(
                    ctx,
                    b,
                    "restores the protection stack top while in differential count state".into(),
                );
                return;
            }
            match b.saved_depth {
                Some(depth) => {
                    debug!("restored protection stack top");
                    b.depth = depth;
                }
                None => {
                    ctx.reporter.info(
                        Kind::Balance,
                        ctx.line,
                        "restores the protection stack top from an uninitialized variable".into(),
                    );
                    *ctx.refinable += 1;
                }
            }
            return;
        }
    }
    confuse(
        ctx,
        b,
        "manipulates the protection stack top directly".into(),
    );
}

/// Terminator handling: imbalance at return, and branch folding on a
/// known counter. Returns the successor states when this tracker owns
/// the terminator.
pub fn handle_terminator(
    ctx: &mut Ctx,
    state: &mut CheckState,
    body: &FunBody,
) -> Option<Vec<CheckState>> {
    if state.balance.confused {
        // keep generating states, the other trackers are not confused
        return None;
    }
    let term = &body.block(state.bb).term;

    if let Term::Ret(_) = term {
        let b = &state.balance;
        if b.count_state == CountState::Diff || b.depth != 0 {
            ctx.reporter.info(
                Kind::Balance,
                ctx.line,
                "has possible protection stack imbalance".into(),
            );
            *ctx.refinable += 1;
        }
        return Some(Vec::new());
    }

    let Term::Branch {
        cond,
        then_bb,
        else_bb,
    } = term
    else {
        return None;
    };
    let (then_bb, else_bb) = (*then_bb, *else_bb);
    let (var, op, constant) = patterns::cmp_local_against_const(cond)?;
    if !ctx.rec.is_counter_var(var) {
        return None;
    }
    if !bind_counter(ctx, &mut state.balance, var) {
        *ctx.refinable += 1;
        return None;
    }

    match state.balance.count_state {
        CountState::None => {
            ctx.reporter.info(
                Kind::Balance,
                ctx.line,
                "branches on an uninitialized protection counter".into(),
            );
            *ctx.refinable += 1;
            None
        }
        CountState::Exact => {
            let holds = match op {
                CmpOp::Eq => state.balance.count == constant,
                CmpOp::Ne => state.balance.count != constant,
            };
            let succ = if holds { then_bb } else { else_bb };
            debug!("folding branch on known counter value");
            Some(vec![state.fork(succ)])
        }
        CountState::Diff => {
            if constant != 0 {
                return None;
            }
            // `if (counter) UNPROTECT(counter);` — UNPROTECT(0) is a
            // no-op, so only the unprotecting successor matters
            let (unprotect_succ, join) = match op {
                CmpOp::Eq => (else_bb, then_bb),
                CmpOp::Ne => (then_bb, else_bb),
            };
            let unprotect = ctx.oracles.runtime.unprotect?;
            if !patterns::is_unprotect_counter_block(body, unprotect_succ, join, unprotect, var) {
                return None;
            }
            debug!("simplifying conditional unprotect on counter in differential state");
            Some(vec![state.fork(unprotect_succ)])
        }
    }
}

#[cfg(test)]
mod tests;
