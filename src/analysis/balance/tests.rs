use crate::analysis::testutil::{has_message, messages, TestModule};
use crate::analysis::CheckMode;
use crate::config::AnalysisConfig;
use crate::ir::{CmpOp, Exp, FunBody, InstKind, Term, VarType};

fn balance_findings(tm: &TestModule) -> Vec<String> {
    messages(&tm.check(CheckMode::BalanceOnly))
}

#[test]
fn test_matched_pair_is_silent() {
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let x = body.add_local("x", VarType::Sexp);
    let bb = body.entry;
    body.push(
        bb,
        InstKind::Store {
            var: x,
            value: Exp::call(tm.alloc, vec![Exp::Const(1)]),
        },
    );
    body.push(bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(x)])));
    body.push(bb, InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Const(1)])));
    body.set_term(bb, Term::Ret(Some(Exp::Local(x))));
    tm.define("f", body);

    assert!(balance_findings(&tm).is_empty());
}

#[test]
fn test_negative_depth_reported() {
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let x = body.add_local("x", VarType::Sexp);
    let bb = body.entry;
    body.push(
        bb,
        InstKind::Store {
            var: x,
            value: Exp::call(tm.alloc, vec![Exp::Const(1)]),
        },
    );
    body.push(bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(x)])));
    body.push_at(bb, InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Const(2)])), 7);
    tm.define("f", body);

    let findings = tm.check(CheckMode::BalanceOnly);
    assert!(has_message(&findings, "has negative depth"));
    assert_eq!(findings.iter().filter(|f| f.record.message == "has negative depth").count(), 1);
}

#[test]
fn test_imbalance_at_return() {
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let x = body.add_local("x", VarType::Sexp);
    body.push(
        body.entry,
        InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(x)])),
    );
    tm.define("f", body);

    assert!(has_message(
        &tm.check(CheckMode::BalanceOnly),
        "has possible protection stack imbalance"
    ));
}

#[test]
fn test_counter_tracks_exact_value() {
    // nprotect = 0; PROTECT(x); nprotect += 1; UNPROTECT(nprotect);
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let x = body.add_local("x", VarType::Sexp);
    let np = body.add_local("nprotect", VarType::Int);
    let bb = body.entry;
    body.push(bb, InstKind::Store { var: np, value: Exp::Const(0) });
    body.push(bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(x)])));
    body.push(
        bb,
        InstKind::Store {
            var: np,
            value: Exp::add(Exp::Local(np), Exp::Const(1)),
        },
    );
    body.push(bb, InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Local(np)])));
    tm.define("f", body);

    assert!(balance_findings(&tm).is_empty());
}

#[test]
fn test_counter_plus_constant_unprotect() {
    // nprotect = 1 after one protect; UNPROTECT(nprotect + 1) with a
    // second protect outstanding
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let x = body.add_local("x", VarType::Sexp);
    let np = body.add_local("nprotect", VarType::Int);
    let bb = body.entry;
    body.push(bb, InstKind::Store { var: np, value: Exp::Const(0) });
    body.push(bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(x)])));
    body.push(bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(x)])));
    body.push(
        bb,
        InstKind::Store {
            var: np,
            value: Exp::add(Exp::Local(np), Exp::Const(1)),
        },
    );
    body.push(
        bb,
        InstKind::Eval(Exp::call(
            tm.unprotect,
            vec![Exp::add(Exp::Local(np), Exp::Const(1))],
        )),
    );
    tm.define("f", body);

    assert!(balance_findings(&tm).is_empty());
}

#[test]
fn test_uninitialized_counter_unprotect() {
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let np = body.add_local("nprotect", VarType::Int);
    let later = body.add_block();
    // the counter is only initialized on a path that never runs first
    body.set_term(
        body.entry,
        Term::Branch {
            cond: Exp::Unknown,
            then_bb: later,
            else_bb: later,
        },
    );
    body.push(later, InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Local(np)])));
    body.push(later, InstKind::Store { var: np, value: Exp::Const(0) });
    tm.define("f", body);

    assert!(has_message(
        &tm.check(CheckMode::BalanceOnly),
        "passes an uninitialized protection counter"
    ));
}

#[test]
fn test_stack_top_save_restore() {
    // save = R_PPStackTop; PROTECT(a); PROTECT(b); R_PPStackTop = save;
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let a = body.add_local("a", VarType::Sexp);
    let b = body.add_local("b", VarType::Sexp);
    let save = body.add_local("save", VarType::Int);
    let bb = body.entry;
    body.push(bb, InstKind::Store { var: save, value: Exp::Global(tm.pp_top) });
    body.push(bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(a)])));
    body.push(bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(b)])));
    body.push(
        bb,
        InstKind::StoreGlobal {
            global: tm.pp_top,
            value: Exp::Local(save),
        },
    );
    tm.define("f", body);

    assert!(messages(&tm.check(CheckMode::Joint)).is_empty());
}

#[test]
fn test_direct_stack_top_manipulation_confuses() {
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let bb = body.entry;
    body.push(bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Unknown])));
    body.push(
        bb,
        InstKind::StoreGlobal {
            global: tm.pp_top,
            value: Exp::Const(0),
        },
    );
    tm.define("f", body);

    let findings = tm.check(CheckMode::BalanceOnly);
    assert!(has_message(&findings, "manipulates the protection stack top directly"));
    // the dangling protect is not reported once confused
    assert!(!has_message(&findings, "imbalance"));
}

#[test]
fn test_branch_folds_on_exact_counter() {
    // nprotect = 0; if (c) { PROTECT(x); nprotect += 1; }
    // if (nprotect != 0) UNPROTECT(nprotect);
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let x = body.add_local("x", VarType::Sexp);
    let np = body.add_local("nprotect", VarType::Int);
    let protect_bb = body.add_block();
    let check_bb = body.add_block();
    let unprotect_bb = body.add_block();
    let exit_bb = body.add_block();

    body.push(body.entry, InstKind::Store { var: np, value: Exp::Const(0) });
    body.set_term(
        body.entry,
        Term::Branch {
            cond: Exp::Unknown,
            then_bb: protect_bb,
            else_bb: check_bb,
        },
    );
    body.push(protect_bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(x)])));
    body.push(
        protect_bb,
        InstKind::Store {
            var: np,
            value: Exp::add(Exp::Local(np), Exp::Const(1)),
        },
    );
    body.set_term(protect_bb, Term::Jump(check_bb));
    body.set_term(
        check_bb,
        Term::Branch {
            cond: Exp::cmp(CmpOp::Ne, Exp::Local(np), Exp::Const(0)),
            then_bb: unprotect_bb,
            else_bb: exit_bb,
        },
    );
    body.push(
        unprotect_bb,
        InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Local(np)])),
    );
    body.set_term(unprotect_bb, Term::Jump(exit_bb));
    body.set_term(exit_bb, Term::Ret(None));
    tm.define("f", body);

    assert!(balance_findings(&tm).is_empty());
}

#[test]
fn test_large_counter_switches_to_differential() {
    // a counter constant beyond the exact range folds into the depth;
    // a matched unprotect-by-counter balances out again
    let mut config = AnalysisConfig::default();
    config.max_count = 2;

    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let x = body.add_local("x", VarType::Sexp);
    let np = body.add_local("nprotect", VarType::Int);
    let bb = body.entry;
    for _ in 0..5 {
        body.push(bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(x)])));
    }
    body.push(bb, InstKind::Store { var: np, value: Exp::Const(5) });
    body.push(bb, InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Local(np)])));
    tm.define("f", body);

    let findings = tm.check_with(&config, CheckMode::BalanceOnly);
    assert!(messages(&findings).is_empty());
}

#[test]
fn test_unprotect_through_guard_select() {
    // guard = 1; PROTECT(x); PROTECT(y); UNPROTECT(guard == 0 ? 1 : 2);
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let x = body.add_local("x", VarType::Sexp);
    let y = body.add_local("y", VarType::Sexp);
    let g = body.add_local("guard", VarType::Int);
    let after = body.add_block();
    let bb = body.entry;
    body.push(bb, InstKind::Store { var: g, value: Exp::Const(1) });
    body.push(bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(x)])));
    body.push(bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(y)])));
    body.push(
        bb,
        InstKind::Eval(Exp::call(
            tm.unprotect,
            vec![Exp::select(
                Exp::cmp(CmpOp::Eq, Exp::Local(g), Exp::Const(0)),
                Exp::Const(1),
                Exp::Const(2),
            )],
        )),
    );
    // the guard must be compared once more to be recognized
    body.set_term(
        bb,
        Term::Branch {
            cond: Exp::cmp(CmpOp::Eq, Exp::Local(g), Exp::Const(0)),
            then_bb: after,
            else_bb: after,
        },
    );
    body.set_term(after, Term::Ret(None));
    tm.define("f", body);

    // resolvable only with integer guards; the refinement loop gets
    // there on its own
    assert!(balance_findings(&tm).is_empty());
}

#[test]
fn test_unprotect_ptr_balances() {
    let mut tm = TestModule::new();
    let mut body = FunBody::new();
    let x = body.add_local("x", VarType::Sexp);
    let bb = body.entry;
    body.push(
        bb,
        InstKind::Store {
            var: x,
            value: Exp::call(tm.alloc, vec![Exp::Const(1)]),
        },
    );
    body.push(bb, InstKind::Eval(Exp::call(tm.protect, vec![Exp::Local(x)])));
    body.push(
        bb,
        InstKind::Eval(Exp::call(tm.unprotect_ptr, vec![Exp::Local(x)])),
    );
    tm.define("f", body);

    assert!(messages(&tm.check(CheckMode::Joint)).is_empty());
}
