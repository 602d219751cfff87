//! Event-order traversal of instruction operands
//!
//! Operand trees are walked in evaluation order (arguments before the
//! call consuming them, right-hand sides before the store). Each analysis
//! consumes the same event stream and reacts to the events it models.

use super::{CallExp, Exp, GlobalId, InstKind, Term, VarId};

/// One evaluation-order event within an instruction.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// A local is read. When the read is directly an argument of a call,
    /// `arg_of` carries the call and the argument position.
    Load {
        var: VarId,
        arg_of: Option<(&'a CallExp, usize)>,
    },
    /// A call, after its arguments. `assigned_to` is set when the call is
    /// directly the right-hand side of a store, `arg_of` when the call is
    /// itself directly an argument of an enclosing call.
    Call {
        call: &'a CallExp,
        assigned_to: Option<VarId>,
        arg_of: Option<(&'a CallExp, usize)>,
    },
    /// A local is written, after the value's events.
    StoreLocal { var: VarId, value: &'a Exp },
    /// A global is written.
    StoreGlobal { global: GlobalId, value: &'a Exp },
    /// A store through a derived location.
    StoreField { base: &'a Exp, value: &'a Exp },
}

pub fn walk_inst<'a, F: FnMut(Event<'a>)>(kind: &'a InstKind, f: &mut F) {
    match kind {
        InstKind::Store { var, value } => {
            walk_exp(value, None, Some(*var), f);
            f(Event::StoreLocal { var: *var, value });
        }
        InstKind::StoreGlobal { global, value } => {
            walk_exp(value, None, None, f);
            f(Event::StoreGlobal {
                global: *global,
                value,
            });
        }
        InstKind::StoreField { base, value, .. } => {
            walk_exp(base, None, None, f);
            walk_exp(value, None, None, f);
            f(Event::StoreField { base, value });
        }
        InstKind::Eval(value) => walk_exp(value, None, None, f),
    }
}

/// Events of a terminator's operand expression, if it has one.
pub fn walk_term<'a, F: FnMut(Event<'a>)>(term: &'a Term, f: &mut F) {
    match term {
        Term::Branch { cond, .. } => walk_exp(cond, None, None, f),
        Term::Ret(Some(value)) => walk_exp(value, None, None, f),
        Term::Jump(_) | Term::Ret(None) | Term::Unreachable => {}
    }
}

fn walk_exp<'a, F: FnMut(Event<'a>)>(
    exp: &'a Exp,
    arg_of: Option<(&'a CallExp, usize)>,
    assigned_to: Option<VarId>,
    f: &mut F,
) {
    match exp {
        Exp::Const(_) | Exp::Str(_) | Exp::Global(_) | Exp::Arg(_) | Exp::Unknown => {}
        Exp::AddrLocal(_) => {}
        Exp::Local(var) => f(Event::Load { var: *var, arg_of }),
        Exp::Call(call) => {
            for (i, arg) in call.args.iter().enumerate() {
                walk_exp(arg, Some((call, i)), None, f);
            }
            f(Event::Call {
                call,
                assigned_to,
                arg_of,
            });
        }
        Exp::Assign(var, value) => {
            walk_exp(value, None, Some(*var), f);
            f(Event::StoreLocal { var: *var, value });
        }
        Exp::Select {
            cond,
            then_val,
            else_val,
        } => {
            walk_exp(cond, None, None, f);
            walk_exp(then_val, None, None, f);
            walk_exp(else_val, None, None, f);
        }
        Exp::Cmp { lhs, rhs, .. } | Exp::Add { lhs, rhs } => {
            walk_exp(lhs, None, None, f);
            walk_exp(rhs, None, None, f);
        }
        Exp::Phi(args) => {
            for arg in args {
                walk_exp(arg, None, None, f);
            }
        }
        Exp::AddrField { base, .. } => walk_exp(base, None, None, f),
    }
}

/// All events of an instruction, in evaluation order.
pub fn inst_events(kind: &InstKind) -> Vec<Event<'_>> {
    let mut out = Vec::new();
    walk_inst(kind, &mut |ev| out.push(ev));
    out
}

/// All events of a terminator's operand expression.
pub fn term_events(term: &Term) -> Vec<Event<'_>> {
    let mut out = Vec::new();
    walk_term(term, &mut |ev| out.push(ev));
    out
}

/// All call expressions in an instruction, in evaluation order.
pub fn calls_in_inst(kind: &InstKind) -> Vec<&CallExp> {
    let mut out = Vec::new();
    walk_inst(kind, &mut |ev| {
        if let Event::Call { call, .. } = ev {
            out.push(call);
        }
    });
    out
}
