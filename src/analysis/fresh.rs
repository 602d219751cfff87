//! Freshness and protect-stack tracking
//!
//! Tracks locals holding freshly allocated, unprotected objects, and a
//! model of the runtime protection stack so protection counts survive
//! push/pop sequences. Warnings about fresh pointers live across
//! allocating calls start out conditional and are only emitted once the
//! pointer is actually read again; liveness kills them when the variable
//! is dead.

use std::collections::BTreeSet;

use tracing::debug;

use super::patterns::{self, UnprotectArg};
use super::state::{BalanceState, CountState, FreshState};
use super::Ctx;
use crate::cfg::liveness::InstPos;
use crate::diagnostics::Kind;
use crate::ir::{visit, CallExp, Exp, VarId};

/// What the transfer learned that other trackers consume.
#[derive(Debug, Default)]
pub struct FreshOutcome {
    /// For an `UNPROTECT_PTR(x)` call: whether `x` matched the top of
    /// the modeled stack.
    pub unprotect_ptr_top: Option<bool>,
}

pub fn transfer_inst(
    ctx: &mut Ctx,
    fresh: &mut FreshState,
    balance: Option<&BalanceState>,
    events: &[visit::Event<'_>],
    pos: InstPos,
) -> FreshOutcome {
    let mut outcome = FreshOutcome::default();
    if fresh.confused {
        return outcome;
    }
    for event in events {
        if fresh.confused {
            break;
        }
        match event {
            visit::Event::Call {
                call,
                assigned_to,
                arg_of,
            } => handle_call(ctx, fresh, balance, call, *assigned_to, *arg_of, pos, &mut outcome),
            visit::Event::Load { var, arg_of } => handle_load(ctx, fresh, *var, *arg_of, pos),
            visit::Event::StoreLocal { var, value } => handle_store(ctx, fresh, *var, value),
            visit::Event::StoreGlobal { global, value } => {
                handle_store_global(ctx, fresh, balance, *global, value)
            }
            visit::Event::StoreField { base, value } => handle_store_field(ctx, fresh, base, value),
        }
    }
    outcome
}

fn erase(fresh: &mut FreshState, var: VarId) {
    fresh.vars.remove(&var);
    fresh.cond_msgs.remove(&var);
}

/// Pop one entry, decrementing the protection count of a named one.
fn pop_entry(ctx: &mut Ctx, fresh: &mut FreshState) {
    let Some(entry) = fresh.pstack.pop() else {
        return;
    };
    let Some(var) = entry else {
        return;
    };
    if let Some(count) = fresh.vars.get_mut(&var) {
        if *count == 0 {
            let name = ctx.var_name(var);
            ctx.reporter.info(
                Kind::Unprotected,
                ctx.line,
                format!("protect count of variable {name} went negative, set to zero"),
            );
            *ctx.refinable += 1;
        } else {
            *count -= 1;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_call(
    ctx: &mut Ctx,
    fresh: &mut FreshState,
    balance: Option<&BalanceState>,
    call: &CallExp,
    assigned_to: Option<VarId>,
    arg_of: Option<(&CallExp, usize)>,
    pos: InstPos,
    outcome: &mut FreshOutcome,
) {
    let rt = &ctx.oracles.runtime;

    if Some(call.callee) == rt.preserve_object {
        // long-lived preservation ends freshness tracking
        if let Some(var) = patterns::protected_var(call, assigned_to) {
            debug!("variable {} given to PreserveObject", ctx.var_name(var));
            erase(fresh, var);
        }
        return;
    }

    if rt.is_protect(call.callee) {
        handle_protect(ctx, fresh, call, assigned_to, arg_of);
        return;
    }

    if Some(call.callee) == rt.reprotect {
        if let Some(var) = patterns::protected_var(call, assigned_to) {
            if ctx.rec.is_tracked_var(var) {
                let count = fresh.vars.entry(var).or_insert(0);
                if *count == 0 {
                    *count = 1;
                }
            }
        }
        return;
    }

    if Some(call.callee) == rt.unprotect {
        handle_unprotect(ctx, fresh, balance, call);
        return;
    }

    if Some(call.callee) == rt.unprotect_ptr {
        let arg = call.args.first().and_then(Exp::as_local);
        let matched = match (arg, fresh.pstack.last()) {
            (Some(var), Some(Some(top))) if var == *top => true,
            _ => false,
        };
        outcome.unprotect_ptr_top = Some(matched);
        if matched {
            pop_entry(ctx, fresh);
        } else {
            fresh.confused = true;
        }
        return;
    }

    if ctx.oracles.allocators.is_allocating(call.callee) {
        handle_allocating_call(ctx, fresh, call, pos);
    }
}

fn handle_protect(
    ctx: &mut Ctx,
    fresh: &mut FreshState,
    call: &CallExp,
    assigned_to: Option<VarId>,
    arg_of: Option<(&CallExp, usize)>,
) {
    if fresh.pstack.len() >= ctx.config.max_pstack_size {
        ctx.reporter.info(
            Kind::Unprotected,
            ctx.line,
            "protect stack is too deep, unprotecting all variables".into(),
        );
        *ctx.refinable += 1;
        fresh.unprotect_all();
        fresh.confused = true;
        return;
    }

    // setter(a, PROTECT(b = e)) protects both a's referent and b
    if let (Some((parent, index)), Some(Exp::Assign(b, _))) = (arg_of, call.args.first()) {
        if index >= 1 && ctx.oracles.is_setter(parent.callee) {
            let first = patterns::arg_var(parent, 0);
            if first.is_some_and(|a| !fresh.vars.contains_key(&a)) {
                debug!(
                    "variable {} implicitly protected through setter argument",
                    ctx.var_name(*b)
                );
                erase(fresh, *b);
                fresh.pstack.push(None);
                return;
            }
        }
    }

    let var = patterns::protected_var(call, assigned_to).filter(|v| ctx.rec.is_tracked_var(*v));
    let Some(var) = var else {
        fresh.pstack.push(None);
        return;
    };

    if let Some(count) = fresh.vars.get_mut(&var) {
        *count += 1;
        fresh.pstack.push(Some(var));
        debug!("pushed variable {} onto the protect stack", ctx.var_name(var));
    } else if ctx.config.treat_protected_as_fresh {
        // being protected suggests there is a reason: treat the variable
        // as fresh-but-protected so a later pop re-freshens it
        fresh.vars.insert(var, 1);
        fresh.pstack.push(Some(var));
    } else {
        fresh.pstack.push(None);
    }
}

fn handle_unprotect(
    ctx: &mut Ctx,
    fresh: &mut FreshState,
    balance: Option<&BalanceState>,
    call: &CallExp,
) {
    let Some(arg) = call.args.first() else { return };
    let count = match patterns::unprotect_arg(arg) {
        UnprotectArg::Const(k) => Some(k),
        UnprotectArg::Counter { var, addend } => match balance {
            Some(b)
                if b.counter_var == Some(var) && b.count_state == CountState::Exact =>
            {
                Some(b.count + addend)
            }
            _ => None,
        },
        _ => None,
    };

    let Some(count) = count else {
        ctx.reporter.info(
            Kind::Unprotected,
            ctx.line,
            "unsupported form of unprotect, unprotecting all variables".into(),
        );
        fresh.unprotect_all();
        fresh.confused = true;
        return;
    };
    let count = count.max(0) as usize;

    if count > fresh.pstack.len() {
        ctx.reporter.info(
            Kind::Unprotected,
            ctx.line,
            format!(
                "attempt to unprotect more items ({count}) than protected ({})",
                fresh.pstack.len()
            ),
        );
        *ctx.refinable += 1;
        fresh.confused = true;
        return;
    }
    for _ in 0..count {
        pop_entry(ctx, fresh);
    }
}

fn handle_allocating_call(ctx: &mut Ctx, fresh: &mut FreshState, call: &CallExp, pos: InstPos) {
    let callee_protect = ctx.oracles.cprotect.is_callee_protect(call.callee);

    // arguments allocated by a nested call can be collected while the
    // remaining arguments are evaluated
    if ctx.config.report_fresh_arguments && !callee_protect {
        for (index, arg) in call.args.iter().enumerate() {
            let Some(inner) = arg.as_call() else { continue };
            if !ctx.oracles.allocators.is_possible_allocator(inner.callee) {
                continue;
            }
            if ctx.oracles.cprotect.is_callee_safe_param(call.callee, index) {
                continue;
            }
            let callee = ctx.fun_name(call.callee);
            let source = ctx.fun_name(inner.callee);
            ctx.reporter.info(
                Kind::Unprotected,
                ctx.line,
                format!("calling allocating function {callee} with argument allocated using {source}"),
            );
            *ctx.refinable += 1;
        }
    }

    // locals passed directly to the call are not reported at this site
    let params = &ctx.oracles.module.function(call.callee).params;
    let mut passed: BTreeSet<VarId> = BTreeSet::new();
    for (index, _) in call.args.iter().enumerate() {
        if let Some(ty) = params.get(index) {
            if *ty != crate::ir::VarType::Sexp {
                continue;
            }
        }
        if let Some(var) = patterns::arg_var(call, index) {
            passed.insert(var);
        }
    }

    let live = ctx.liveness.at(pos.0, pos.1);

    // drop dead entries; flush messages of variables certainly read later
    let dead: Vec<VarId> = fresh
        .vars
        .keys()
        .copied()
        .filter(|var| !live.possibly_used.contains(var))
        .collect();
    for var in dead {
        erase(fresh, var);
    }
    let promoted: Vec<VarId> = fresh
        .cond_msgs
        .keys()
        .copied()
        .filter(|var| live.definitely_used.contains(var))
        .collect();
    for var in promoted {
        if let Some(msgs) = fresh.cond_msgs.remove(&var) {
            for id in msgs {
                ctx.reporter.emit_interned(id);
            }
            *ctx.refinable += 1;
        }
    }

    let fresh_unprotected: Vec<VarId> = fresh
        .vars
        .iter()
        .filter(|&(_, &count)| count == 0)
        .map(|(&var, _)| var)
        .filter(|var| !passed.contains(var))
        .collect();
    for var in fresh_unprotected {
        let name = ctx.var_name(var);
        let callee = ctx.fun_name(call.callee);
        let message = format!("unprotected variable {name} while calling allocating function {callee}");
        if live.definitely_used.contains(&var) {
            ctx.reporter.info(Kind::Unprotected, ctx.line, message);
            *ctx.refinable += 1;
        } else {
            let id = ctx.reporter.intern(Kind::Unprotected, ctx.line, message);
            fresh.cond_msgs.entry(var).or_default().insert(id);
            debug!("buffered conditional message for variable {name}");
        }
    }
}

fn handle_load(
    ctx: &mut Ctx,
    fresh: &mut FreshState,
    var: VarId,
    arg_of: Option<(&CallExp, usize)>,
    pos: InstPos,
) {
    // the variable is being read: its buffered messages become real
    if let Some(msgs) = fresh.cond_msgs.remove(&var) {
        for id in msgs {
            ctx.reporter.emit_interned(id);
        }
        *ctx.refinable += 1;
        debug!(
            "flushed conditional messages on use of variable {}",
            ctx.var_name(var)
        );
    }

    let Some(&count) = fresh.vars.get(&var) else {
        return;
    };

    let Some((parent, index)) = arg_of else {
        return;
    };

    // setter(x, ..., v) with a non-fresh x usually protects v through x
    if index >= 1 && ctx.oracles.is_setter(parent.callee) {
        if let Some(first) = patterns::arg_var(parent, 0) {
            if !fresh.vars.contains_key(&first) {
                debug!(
                    "variable {} passed to setter with protected target, no longer fresh",
                    ctx.var_name(var)
                );
                erase(fresh, var);
                return;
            }
        }
    }

    if !ctx.config.report_fresh_arguments {
        return;
    }
    if !ctx.oracles.allocators.is_allocating(parent.callee)
        || ctx.oracles.cprotect.is_callee_protect(parent.callee)
    {
        return;
    }
    if count > 0 {
        return;
    }

    let name = ctx.var_name(var);
    let callee = ctx.fun_name(parent.callee);
    if !ctx.oracles.cprotect.is_callee_safe_param(parent.callee, index) {
        ctx.reporter.info(
            Kind::Unprotected,
            ctx.line,
            format!("calling allocating function {callee} with a fresh pointer ({name})"),
        );
        *ctx.refinable += 1;
    } else if ctx
        .liveness
        .try_at(pos.0, pos.1 + 1)
        .is_some_and(|live| live.possibly_used.contains(&var))
    {
        // consumed before any allocation, but the object may be gone by
        // the time the variable is read again
        let id = ctx.reporter.intern(
            Kind::Unprotected,
            ctx.line,
            format!("fresh argument {name} to allocating function {callee} may be destroyed before later use"),
        );
        fresh.cond_msgs.entry(var).or_default().insert(id);
    }
}

fn handle_store(ctx: &mut Ctx, fresh: &mut FreshState, var: VarId, value: &Exp) {
    // whatever was pending about the old value is moot
    fresh.cond_msgs.remove(&var);

    if let Exp::Call(call) = value {
        let rt = &ctx.oracles.runtime;
        if rt.is_protect(call.callee)
            || Some(call.callee) == rt.reprotect
            || Some(call.callee) == rt.preserve_object
        {
            // handled at the call event
            return;
        }
        if ctx.oracles.allocators.is_possible_allocator(call.callee)
            && ctx.rec.is_tracked_var(var)
        {
            debug!(
                "fresh variable {} initialized from possible allocator",
                ctx.var_name(var)
            );
            fresh.vars.insert(var, 0);
            return;
        }
        // x = ATTRIB(y) aliases into y's object; while y is fresh the
        // attribute list is just as collectable (this can over-report
        // when the attribute is protected elsewhere)
        if Some(call.callee) == rt.attrib {
            if let Some(Exp::Local(src)) = call.args.first() {
                if fresh.is_fresh(*src) && ctx.rec.is_tracked_var(var) {
                    fresh.vars.insert(var, 0);
                    return;
                }
            }
        }
    }

    if fresh.vars.contains_key(&var) {
        debug!("variable {} rewritten, no longer fresh", ctx.var_name(var));
        erase(fresh, var);
    }
}

fn handle_store_global(
    ctx: &mut Ctx,
    fresh: &mut FreshState,
    balance: Option<&BalanceState>,
    global: crate::ir::GlobalId,
    value: &Exp,
) {
    if Some(global) == ctx.oracles.runtime.pp_stack_top {
        handle_stack_top_restore(ctx, fresh, balance, value);
        return;
    }
    // storing into a global reaches the new location before any further
    // allocation, which protects the object
    if let Exp::Local(var) = value {
        if fresh.vars.contains_key(var) {
            debug!(
                "variable {} stored into a global, no longer fresh",
                ctx.var_name(*var)
            );
            erase(fresh, *var);
        }
    }
}

fn handle_stack_top_restore(
    ctx: &mut Ctx,
    fresh: &mut FreshState,
    balance: Option<&BalanceState>,
    value: &Exp,
) {
    let target = balance.and_then(|b| {
        let var = value.as_local()?;
        if b.top_save_var == Some(var) {
            b.saved_depth
        } else {
            None
        }
    });
    let Some(target) = target else {
        fresh.unprotect_all();
        fresh.confused = true;
        return;
    };
    let target = target.max(0) as usize;
    if target > fresh.pstack.len() {
        ctx.reporter.info(
            Kind::Unprotected,
            ctx.line,
            "restores the protection stack top above its current depth".into(),
        );
        fresh.confused = true;
        return;
    }
    while fresh.pstack.len() > target {
        pop_entry(ctx, fresh);
    }
}

fn handle_store_field(ctx: &mut Ctx, fresh: &mut FreshState, base: &Exp, value: &Exp) {
    let Exp::Local(var) = value else { return };
    if let Some(node_stack) = ctx.oracles.runtime.node_stack_top {
        if patterns::mentions_global(base, node_stack) {
            // the engine's node stack roots its entries; one level of
            // aliasing is walked so a copied handle is released too
            debug!(
                "variable {} stored onto the node stack, no longer fresh",
                ctx.var_name(*var)
            );
            let alias = ctx.rec.unique_copy_source(*var);
            erase(fresh, *var);
            if let Some(alias) = alias {
                erase(fresh, alias);
            }
            return;
        }
    }
    // a store through a derived location usually parks the object in an
    // already-reachable structure
    if fresh.vars.contains_key(var) {
        debug!(
            "variable {} stored into a derived location, no longer fresh",
            ctx.var_name(*var)
        );
        erase(fresh, *var);
    }
}
