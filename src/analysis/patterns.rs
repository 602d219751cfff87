//! Named instruction matchers
//!
//! Each source-level shape the checker recognizes is one small function
//! over the operand tree: the protect-argument forms, the unprotect
//! operand forms, and the per-function variable roles (protection
//! counter, stack-top save variable, trackable pointer, guards). Role
//! recognition scans the whole body once per variable and is memoized.

use std::collections::HashMap;

use crate::ir::{visit, CallExp, CmpOp, Exp, FunBody, GlobalId, InstKind, Term, VarId, VarType};
use crate::oracles::Runtime;

/// The variable a protect-family call protects, in pattern priority:
/// `PROTECT(v)`, then `PROTECT(v = e)`, then `v = PROTECT(e)`.
pub fn protected_var(call: &CallExp, assigned_to: Option<VarId>) -> Option<VarId> {
    match call.args.first() {
        Some(Exp::Local(var)) => Some(*var),
        Some(Exp::Assign(var, _)) => Some(*var),
        _ => assigned_to,
    }
}

/// The local a call argument passes directly: `f(v)` or `f(v = e)`.
pub fn arg_var(call: &CallExp, index: usize) -> Option<VarId> {
    match call.args.get(index)? {
        Exp::Local(var) => Some(*var),
        Exp::Assign(var, _) => Some(*var),
        _ => None,
    }
}

/// Decoded operand of an `UNPROTECT` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnprotectArg {
    Const(i64),
    /// `UNPROTECT(counter)` or `UNPROTECT(counter + addend)`.
    Counter { var: VarId, addend: i64 },
    /// `UNPROTECT(guard ? a : b)` with both arms constant and the
    /// condition an equality test of a local against zero.
    GuardSelect {
        guard: VarId,
        true_when_zero: bool,
        then_val: i64,
        else_val: i64,
    },
    /// An addition that is not counter-plus-constant.
    UnsupportedAdd,
    Unsupported,
}

pub fn unprotect_arg(exp: &Exp) -> UnprotectArg {
    match exp {
        Exp::Const(k) => UnprotectArg::Const(*k),
        Exp::Local(var) => UnprotectArg::Counter {
            var: *var,
            addend: 0,
        },
        Exp::Add { lhs, rhs } => match (lhs.as_ref(), rhs.as_ref()) {
            (Exp::Local(var), Exp::Const(c)) | (Exp::Const(c), Exp::Local(var)) => {
                UnprotectArg::Counter {
                    var: *var,
                    addend: *c,
                }
            }
            _ => UnprotectArg::UnsupportedAdd,
        },
        Exp::Select {
            cond,
            then_val,
            else_val,
        } => {
            let (Exp::Const(a), Exp::Const(b)) = (then_val.as_ref(), else_val.as_ref()) else {
                return UnprotectArg::Unsupported;
            };
            let Some((guard, op)) = cmp_local_against_zero(cond) else {
                return UnprotectArg::Unsupported;
            };
            UnprotectArg::GuardSelect {
                guard,
                true_when_zero: op == CmpOp::Eq,
                then_val: *a,
                else_val: *b,
            }
        }
        _ => UnprotectArg::Unsupported,
    }
}

/// `v == 0` / `v != 0` (either operand order).
pub fn cmp_local_against_zero(exp: &Exp) -> Option<(VarId, CmpOp)> {
    let Exp::Cmp { op, lhs, rhs } = exp else {
        return None;
    };
    match (lhs.as_ref(), rhs.as_ref()) {
        (Exp::Local(var), Exp::Const(0)) | (Exp::Const(0), Exp::Local(var)) => Some((*var, *op)),
        _ => None,
    }
}

/// `v ⋈ c` against any constant (either operand order).
pub fn cmp_local_against_const(exp: &Exp) -> Option<(VarId, CmpOp, i64)> {
    let Exp::Cmp { op, lhs, rhs } = exp else {
        return None;
    };
    match (lhs.as_ref(), rhs.as_ref()) {
        (Exp::Local(var), Exp::Const(c)) | (Exp::Const(c), Exp::Local(var)) => {
            Some((*var, *op, *c))
        }
        _ => None,
    }
}

/// `v ⋈ @g` against a global (either operand order).
pub fn cmp_local_against_global(exp: &Exp) -> Option<(VarId, CmpOp, GlobalId)> {
    let Exp::Cmp { op, lhs, rhs } = exp else {
        return None;
    };
    match (lhs.as_ref(), rhs.as_ref()) {
        (Exp::Local(var), Exp::Global(g)) | (Exp::Global(g), Exp::Local(var)) => {
            Some((*var, *op, *g))
        }
        _ => None,
    }
}

/// Whether an expression mentions the given global anywhere.
pub fn mentions_global(exp: &Exp, global: GlobalId) -> bool {
    match exp {
        Exp::Global(g) => *g == global,
        Exp::AddrField { base, .. } => mentions_global(base, global),
        Exp::Add { lhs, rhs } => mentions_global(lhs, global) || mentions_global(rhs, global),
        _ => false,
    }
}

/// The block shape `{ UNPROTECT(counter); goto join; }` used to simplify
/// `if (counter) UNPROTECT(counter)` in differential state.
pub fn is_unprotect_counter_block(
    body: &FunBody,
    bb: crate::ir::BlockId,
    join: crate::ir::BlockId,
    unprotect: crate::ir::FunId,
    counter: VarId,
) -> bool {
    let block = body.block(bb);
    let [inst] = block.insts.as_slice() else {
        return false;
    };
    let InstKind::Eval(Exp::Call(call)) = &inst.kind else {
        return false;
    };
    if call.callee != unprotect {
        return false;
    }
    if !matches!(call.args.as_slice(), [Exp::Local(v)] if *v == counter) {
        return false;
    }
    matches!(block.term, Term::Jump(target) if target == join)
}

/// Memoized per-function variable role recognition.
pub struct Recognizer<'m> {
    body: &'m FunBody,
    runtime: &'m Runtime,
    counter_cache: HashMap<VarId, bool>,
    top_save_cache: HashMap<VarId, bool>,
    tracked_cache: HashMap<VarId, bool>,
    int_guard_cache: HashMap<VarId, bool>,
    sexp_guard_cache: HashMap<VarId, bool>,
}

impl<'m> Recognizer<'m> {
    pub fn new(body: &'m FunBody, runtime: &'m Runtime) -> Recognizer<'m> {
        Recognizer {
            body,
            runtime,
            counter_cache: HashMap::new(),
            top_save_cache: HashMap::new(),
            tracked_cache: HashMap::new(),
            int_guard_cache: HashMap::new(),
            sexp_guard_cache: HashMap::new(),
        }
    }

    pub fn body(&self) -> &'m FunBody {
        self.body
    }

    /// A protection counter: an integer only ever assigned constants or
    /// itself-plus-a-constant, passed to UNPROTECT at least once.
    pub fn is_counter_var(&mut self, var: VarId) -> bool {
        if let Some(cached) = self.counter_cache.get(&var) {
            return *cached;
        }
        let result = self.scan_counter_var(var);
        self.counter_cache.insert(var, result);
        result
    }

    fn scan_counter_var(&self, var: VarId) -> bool {
        let Some(unprotect) = self.runtime.unprotect else {
            return false;
        };
        if self.body.local(var).ty != VarType::Int || self.address_taken(var) {
            return false;
        }
        let mut passed_to_unprotect = false;
        let mut stores_ok = true;
        self.scan_events(&mut |ev| match ev {
            visit::Event::StoreLocal { var: dst, value } if dst == var => {
                let ok = match value {
                    Exp::Const(_) => true,
                    Exp::Add { lhs, rhs } => matches!(
                        (lhs.as_ref(), rhs.as_ref()),
                        (Exp::Local(v), Exp::Const(_)) | (Exp::Const(_), Exp::Local(v)) if *v == var
                    ),
                    _ => false,
                };
                if !ok {
                    stores_ok = false;
                }
            }
            visit::Event::Call { call, .. } if call.callee == unprotect => {
                if let Some(arg) = call.args.first() {
                    if let UnprotectArg::Counter { var: v, .. } = unprotect_arg(arg) {
                        if v == var {
                            passed_to_unprotect = true;
                        }
                    }
                }
            }
            _ => {}
        });
        stores_ok && passed_to_unprotect
    }

    /// A stack-top save variable: only ever assigned the value of
    /// `R_PPStackTop`, and assigned back to it at least once overall.
    pub fn is_top_save_var(&mut self, var: VarId) -> bool {
        if let Some(cached) = self.top_save_cache.get(&var) {
            return *cached;
        }
        let result = self.scan_top_save_var(var);
        self.top_save_cache.insert(var, result);
        result
    }

    fn scan_top_save_var(&self, var: VarId) -> bool {
        let Some(pp) = self.runtime.pp_stack_top else {
            return false;
        };
        if self.address_taken(var) {
            return false;
        }
        let mut uses_stack_top = false;
        let mut stores_ok = true;
        self.scan_events(&mut |ev| match ev {
            visit::Event::StoreLocal { var: dst, value } if dst == var => {
                if matches!(value, Exp::Global(g) if *g == pp) {
                    uses_stack_top = true;
                } else {
                    stores_ok = false;
                }
            }
            visit::Event::StoreGlobal { global, value } if global == pp => {
                if matches!(value, Exp::Local(v) if *v == var) {
                    uses_stack_top = true;
                }
            }
            _ => {}
        });
        stores_ok && uses_stack_top
    }

    /// Freshness-trackable pointer: an SEXP local whose address is never
    /// taken (every occurrence is a plain load or store).
    pub fn is_tracked_var(&mut self, var: VarId) -> bool {
        if let Some(cached) = self.tracked_cache.get(&var) {
            return *cached;
        }
        let result =
            self.body.local(var).ty == VarType::Sexp && !self.address_taken(var);
        self.tracked_cache.insert(var, result);
        result
    }

    /// Integer guard: equality-compared against zero and nothing else,
    /// with enough compares/assignments that tracking it can pay off.
    pub fn is_int_guard(&mut self, var: VarId) -> bool {
        if let Some(cached) = self.int_guard_cache.get(&var) {
            return *cached;
        }
        let result = self.scan_int_guard(var);
        self.int_guard_cache.insert(var, result);
        result
    }

    fn scan_int_guard(&self, var: VarId) -> bool {
        if self.body.local(var).ty != VarType::Int || self.address_taken(var) {
            return false;
        }
        let mut comparisons = 0u32;
        let mut nonzero_compare = false;
        let mut const_stores = 0u32;
        let mut copy_stores = 0u32;
        self.scan_exprs(&mut |exp| {
            if let Some((v, _, c)) = cmp_local_against_const(exp) {
                if v == var {
                    if c == 0 {
                        comparisons += 1;
                    } else {
                        nonzero_compare = true;
                    }
                }
            }
        });
        self.scan_events(&mut |ev| {
            if let visit::Event::StoreLocal { var: dst, value } = ev {
                if dst == var {
                    match value {
                        Exp::Const(_) => const_stores += 1,
                        Exp::Local(_) => copy_stores += 1,
                        _ => {}
                    }
                }
            }
        });
        if nonzero_compare {
            return false;
        }
        comparisons >= 2 || (comparisons == 1 && const_stores + copy_stores > 0)
    }

    /// SEXP guard: an SEXP local used in nil/identity tests, with value
    /// sources the tracker can model.
    pub fn is_sexp_guard(&mut self, var: VarId) -> bool {
        if let Some(cached) = self.sexp_guard_cache.get(&var) {
            return *cached;
        }
        let result = self.scan_sexp_guard(var);
        self.sexp_guard_cache.insert(var, result);
        result
    }

    fn scan_sexp_guard(&self, var: VarId) -> bool {
        if self.body.local(var).ty != VarType::Sexp || self.address_taken(var) {
            return false;
        }
        let mut comparisons = 0u32;
        let mut field_accesses = 0u32;
        let mut escapes = 0u32;
        let mut nil_stores = 0u32;
        let mut copy_stores = 0u32;
        let mut arg_stores = 0u32;
        let mut call_stores = 0u32;
        let mut copies_out = 0u32;

        self.scan_exprs(&mut |exp| {
            if let Some((v, _, _)) = cmp_local_against_global(exp) {
                if v == var {
                    comparisons += 1;
                }
            }
            if let Exp::AddrField { base, .. } = exp {
                if matches!(base.as_ref(), Exp::Local(v) if *v == var) {
                    field_accesses += 1;
                }
            }
        });
        self.scan_events(&mut |ev| match ev {
            visit::Event::Call { call, .. } => {
                if Some(call.callee) == self.runtime.is_null
                    && matches!(call.args.as_slice(), [Exp::Local(v)] if *v == var)
                {
                    comparisons += 1;
                } else if call
                    .args
                    .iter()
                    .any(|a| matches!(a, Exp::Local(v) if *v == var))
                {
                    escapes += 1;
                }
            }
            visit::Event::StoreLocal { var: dst, value } => {
                if dst == var {
                    match value {
                        Exp::Global(g) if Some(*g) == self.runtime.nil => nil_stores += 1,
                        Exp::Local(_) => copy_stores += 1,
                        Exp::Arg(_) => arg_stores += 1,
                        Exp::Call(_) => call_stores += 1,
                        _ => {}
                    }
                } else if matches!(value, Exp::Local(v) if *v == var) {
                    copies_out += 1;
                }
            }
            _ => {}
        });

        let sources = nil_stores + copy_stores + arg_stores + call_stores + copies_out;
        comparisons >= 2 || ((comparisons == 1 || field_accesses > 0 || escapes > 0) && sources > 0)
    }

    /// The source local when `var` has exactly one store and it copies
    /// another local.
    pub fn unique_copy_source(&self, var: VarId) -> Option<VarId> {
        let mut sources = Vec::new();
        self.scan_events(&mut |ev| {
            if let visit::Event::StoreLocal { var: dst, value } = ev {
                if dst == var {
                    sources.push(value.as_local());
                }
            }
        });
        match sources.as_slice() {
            [Some(src)] => Some(*src),
            _ => None,
        }
    }

    fn address_taken(&self, var: VarId) -> bool {
        let mut taken = false;
        self.scan_exprs(&mut |exp| {
            if matches!(exp, Exp::AddrLocal(v) if *v == var) {
                taken = true;
            }
        });
        taken
    }

    fn scan_events<F: for<'a> FnMut(visit::Event<'a>)>(&self, f: &mut F) {
        for bb in self.body.block_ids() {
            for inst in &self.body.block(bb).insts {
                visit::walk_inst(&inst.kind, f);
            }
            visit::walk_term(&self.body.block(bb).term, f);
        }
    }

    fn scan_exprs<F: FnMut(&Exp)>(&self, f: &mut F) {
        fn walk<F: FnMut(&Exp)>(exp: &Exp, f: &mut F) {
            f(exp);
            match exp {
                Exp::Call(call) => call.args.iter().for_each(|a| walk(a, f)),
                Exp::Assign(_, value) => walk(value, f),
                Exp::Select {
                    cond,
                    then_val,
                    else_val,
                } => {
                    walk(cond, f);
                    walk(then_val, f);
                    walk(else_val, f);
                }
                Exp::Cmp { lhs, rhs, .. } | Exp::Add { lhs, rhs } => {
                    walk(lhs, f);
                    walk(rhs, f);
                }
                Exp::Phi(args) => args.iter().for_each(|a| walk(a, f)),
                Exp::AddrField { base, .. } => walk(base, f),
                _ => {}
            }
        }
        for bb in self.body.block_ids() {
            for inst in &self.body.block(bb).insts {
                match &inst.kind {
                    InstKind::Store { value, .. } | InstKind::StoreGlobal { value, .. } => {
                        walk(value, f)
                    }
                    InstKind::StoreField { base, value, .. } => {
                        walk(base, f);
                        walk(value, f);
                    }
                    InstKind::Eval(value) => walk(value, f),
                }
            }
            match &self.body.block(bb).term {
                Term::Branch { cond, .. } => walk(cond, f),
                Term::Ret(Some(value)) => walk(value, f),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests;
