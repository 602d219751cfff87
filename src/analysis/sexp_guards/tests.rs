use crate::analysis::testutil::{messages, TestModule};
use crate::analysis::CheckMode;
use crate::config::AnalysisConfig;
use crate::ir::{CmpOp, Exp, FunBody, InstKind, Term, VarType};

/// A protect gated on `g != R_NilValue` with the matching unprotect
/// gated the same way. Needs SEXP guard tracking to rule out the
/// mismatched paths.
fn nil_guarded_pair_body(tm: &TestModule, guard_init: Exp) -> FunBody {
    let mut body = FunBody::new();
    let x = body.add_local("x", VarType::Sexp);
    let g = body.add_local("g", VarType::Sexp);
    let protect_bb = body.add_block();
    let mid = body.add_block();
    let unprotect_bb = body.add_block();
    let exit = body.add_block();

    body.push(body.entry, InstKind::Store { var: g, value: guard_init });
    body.set_term(
        body.entry,
        Term::Branch {
            cond: Exp::cmp(CmpOp::Ne, Exp::Local(g), Exp::Global(tm.nil)),
            then_bb: protect_bb,
            else_bb: mid,
        },
    );
    body.push(
        protect_bb,
        InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(x)])),
    );
    body.set_term(protect_bb, Term::Jump(mid));
    body.set_term(
        mid,
        Term::Branch {
            cond: Exp::cmp(CmpOp::Ne, Exp::Local(g), Exp::Global(tm.nil)),
            then_bb: unprotect_bb,
            else_bb: exit,
        },
    );
    body.push(
        unprotect_bb,
        InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Const(1)])),
    );
    body.set_term(unprotect_bb, Term::Jump(exit));
    body.set_term(exit, Term::Ret(None));
    body
}

#[test]
fn test_nil_guard_pruning_removes_false_imbalance() {
    let mut tm = TestModule::new();
    let body = nil_guarded_pair_body(&tm, Exp::Unknown);
    tm.define("f", body);

    assert!(messages(&tm.check(CheckMode::BalanceOnly)).is_empty());
}

#[test]
fn test_known_nil_guard_folds_both_branches() {
    let mut tm = TestModule::new();
    let nil = tm.nil;
    let body = nil_guarded_pair_body(&tm, Exp::Global(nil));
    tm.define("f", body);

    assert!(messages(&tm.check(CheckMode::BalanceOnly)).is_empty());
}

#[test]
fn test_allocator_result_treated_non_nil() {
    // g = allocVector(...): with allocator detection the guard is
    // non-nil and only the protecting path survives
    let mut tm = TestModule::new();
    let alloc = tm.alloc;
    let body = nil_guarded_pair_body(&tm, Exp::call(alloc, vec![Exp::Const(1)]));
    tm.define("f", body);

    assert!(messages(&tm.check(CheckMode::BalanceOnly)).is_empty());
}

#[test]
fn test_allocator_detection_can_be_disabled() {
    let mut tm = TestModule::new();
    let alloc = tm.alloc;
    let body = nil_guarded_pair_body(&tm, Exp::call(alloc, vec![Exp::Const(1)]));
    tm.define("f", body);

    let mut config = AnalysisConfig::default();
    config.use_allocator_detection = false;
    // without the (unsound) non-nil assumption the guard stays unknown,
    // and the guard value does not change between the two tests either
    // way, so pruning still pairs the branches through Nil/NonNil
    // refinement on the surviving paths
    assert!(messages(&tm.check_with(&config, CheckMode::BalanceOnly)).is_empty());
}

#[test]
fn test_is_null_call_prunes() {
    // if (isNull(g)) return; PROTECT(x); if (isNull(g)) UNPROTECT(2);
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let x = body.add_local("x", VarType::Sexp);
    let g = body.add_local("g", VarType::Sexp);
    let work = body.add_block();
    let bad = body.add_block();
    let exit = body.add_block();

    body.push(
        body.entry,
        InstKind::Store {
            var: g,
            value: Exp::Arg(0),
        },
    );
    body.set_term(
        body.entry,
        Term::Branch {
            cond: Exp::call(tm.is_null, vec![Exp::Local(g)]),
            then_bb: exit,
            else_bb: work,
        },
    );
    body.push(work, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(x)])));
    body.push(work, InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Const(1)])));
    body.set_term(
        work,
        Term::Branch {
            cond: Exp::call(tm.is_null, vec![Exp::Local(g)]),
            then_bb: bad,
            else_bb: exit,
        },
    );
    // reachable only if the guard changed from non-nil to nil
    body.push(bad, InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Const(2)])));
    body.set_term(bad, Term::Jump(exit));
    body.set_term(exit, Term::Ret(None));
    tm.define("f", body);

    assert!(messages(&tm.check(CheckMode::BalanceOnly)).is_empty());
}

#[test]
fn test_symbol_identity_pruning() {
    // g = R_DimSymbol; if (g == R_DimSymbol) {} else { UNPROTECT(1); }
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let g = body.add_local("g", VarType::Sexp);
    let dead = body.add_block();
    let exit = body.add_block();
    body.push(
        body.entry,
        InstKind::Store {
            var: g,
            value: Exp::Global(tm.dim_sym),
        },
    );
    body.set_term(
        body.entry,
        Term::Branch {
            cond: Exp::cmp(CmpOp::Eq, Exp::Local(g), Exp::Global(tm.dim_sym)),
            then_bb: exit,
            else_bb: dead,
        },
    );
    body.push(dead, InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Const(1)])));
    body.set_term(dead, Term::Jump(exit));
    // one more comparison so the variable counts as a guard
    body.push(
        dead,
        InstKind::Store {
            var: g,
            value: Exp::Global(tm.nil),
        },
    );
    body.set_term(exit, Term::Ret(None));
    tm.define("f", body);

    assert!(messages(&tm.check(CheckMode::BalanceOnly)).is_empty());
}

#[test]
fn test_install_result_is_symbol() {
    // g = install("dim"); if (g == R_NilValue) UNPROTECT(1);
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let g = body.add_local("g", VarType::Sexp);
    let dead = body.add_block();
    let exit = body.add_block();
    body.push(
        body.entry,
        InstKind::Store {
            var: g,
            value: Exp::call(tm.install, vec![Exp::Str("dim".into())]),
        },
    );
    body.set_term(
        body.entry,
        Term::Branch {
            cond: Exp::cmp(CmpOp::Eq, Exp::Local(g), Exp::Global(tm.nil)),
            then_bb: dead,
            else_bb: exit,
        },
    );
    body.push(dead, InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Const(1)])));
    body.set_term(dead, Term::Jump(exit));
    body.set_term(exit, Term::Ret(None));
    tm.define("f", body);

    assert!(messages(&tm.check(CheckMode::BalanceOnly)).is_empty());
}
