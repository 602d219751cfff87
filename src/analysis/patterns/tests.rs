use super::*;
use crate::ir::{CallExp, FunId, Term};

fn call(callee: u32, args: Vec<Exp>) -> CallExp {
    CallExp {
        callee: FunId(callee),
        args,
    }
}

#[test]
fn test_protected_var_priority() {
    // PROTECT(v)
    let c = call(0, vec![Exp::Local(VarId(3))]);
    assert_eq!(protected_var(&c, None), Some(VarId(3)));

    // PROTECT(v = e)
    let c = call(0, vec![Exp::assign(VarId(4), Exp::Unknown)]);
    assert_eq!(protected_var(&c, None), Some(VarId(4)));

    // the direct argument wins over the assignment target
    assert_eq!(protected_var(&c, Some(VarId(9))), Some(VarId(4)));

    // v = PROTECT(e)
    let c = call(0, vec![Exp::Unknown]);
    assert_eq!(protected_var(&c, Some(VarId(9))), Some(VarId(9)));
    assert_eq!(protected_var(&c, None), None);
}

#[test]
fn test_unprotect_arg_shapes() {
    assert_eq!(unprotect_arg(&Exp::Const(3)), UnprotectArg::Const(3));
    assert_eq!(
        unprotect_arg(&Exp::Local(VarId(1))),
        UnprotectArg::Counter {
            var: VarId(1),
            addend: 0
        }
    );
    assert_eq!(
        unprotect_arg(&Exp::add(Exp::Const(2), Exp::Local(VarId(1)))),
        UnprotectArg::Counter {
            var: VarId(1),
            addend: 2
        }
    );
    assert_eq!(
        unprotect_arg(&Exp::add(Exp::Unknown, Exp::Const(2))),
        UnprotectArg::UnsupportedAdd
    );
    assert_eq!(unprotect_arg(&Exp::Unknown), UnprotectArg::Unsupported);

    let select = Exp::select(
        Exp::cmp(CmpOp::Eq, Exp::Local(VarId(7)), Exp::Const(0)),
        Exp::Const(1),
        Exp::Const(2),
    );
    assert_eq!(
        unprotect_arg(&select),
        UnprotectArg::GuardSelect {
            guard: VarId(7),
            true_when_zero: true,
            then_val: 1,
            else_val: 2
        }
    );
}

#[test]
fn test_cmp_matchers_accept_swapped_operands() {
    let swapped = Exp::cmp(CmpOp::Ne, Exp::Const(0), Exp::Local(VarId(2)));
    assert_eq!(cmp_local_against_zero(&swapped), Some((VarId(2), CmpOp::Ne)));
    assert_eq!(
        cmp_local_against_const(&swapped),
        Some((VarId(2), CmpOp::Ne, 0))
    );
    assert_eq!(cmp_local_against_zero(&Exp::cmp(
        CmpOp::Eq,
        Exp::Local(VarId(2)),
        Exp::Const(1)
    )), None);
}

#[test]
fn test_counter_recognition() {
    use crate::analysis::testutil::TestModule;
    use crate::ir::{FunBody, InstKind, VarType};

    let tm = TestModule::new();
    let mut body = FunBody::new();
    let np = body.add_local("nprotect", VarType::Int);
    let other = body.add_local("other", VarType::Int);
    let sexp = body.add_local("s", VarType::Sexp);
    let bb = body.entry;
    body.push(bb, InstKind::Store { var: np, value: Exp::Const(0) });
    body.push(
        bb,
        InstKind::Store {
            var: np,
            value: Exp::add(Exp::Local(np), Exp::Const(1)),
        },
    );
    body.push(
        bb,
        InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Local(np)])),
    );
    // `other` is stored from an unsupported shape
    body.push(bb, InstKind::Store { var: other, value: Exp::Unknown });
    body.push(
        bb,
        InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Local(other)])),
    );

    let runtime = crate::oracles::Runtime::resolve(&tm.module);
    let mut rec = Recognizer::new(&body, &runtime);
    assert!(rec.is_counter_var(np));
    assert!(!rec.is_counter_var(other));
    assert!(!rec.is_counter_var(sexp));
}

#[test]
fn test_top_save_recognition() {
    use crate::analysis::testutil::TestModule;
    use crate::ir::{FunBody, InstKind, VarType};

    let tm = TestModule::new();
    let mut body = FunBody::new();
    let save = body.add_local("save", VarType::Int);
    let tainted = body.add_local("tainted", VarType::Int);
    let bb = body.entry;
    body.push(bb, InstKind::Store { var: save, value: Exp::Global(tm.pp_top) });
    body.push(
        bb,
        InstKind::StoreGlobal {
            global: tm.pp_top,
            value: Exp::Local(save),
        },
    );
    // also written from elsewhere, so not a dedicated save slot
    body.push(bb, InstKind::Store { var: tainted, value: Exp::Global(tm.pp_top) });
    body.push(bb, InstKind::Store { var: tainted, value: Exp::Const(0) });

    let runtime = crate::oracles::Runtime::resolve(&tm.module);
    let mut rec = Recognizer::new(&body, &runtime);
    assert!(rec.is_top_save_var(save));
    assert!(!rec.is_top_save_var(tainted));
}

#[test]
fn test_tracked_var_rejects_address_taken() {
    use crate::analysis::testutil::TestModule;
    use crate::ir::{FunBody, InstKind, VarType};

    let tm = TestModule::new();
    let mut body = FunBody::new();
    let plain = body.add_local("plain", VarType::Sexp);
    let escaped = body.add_local("escaped", VarType::Sexp);
    let number = body.add_local("number", VarType::Int);
    body.push(
        body.entry,
        InstKind::Eval(Exp::call(
            tm.protect_with_index,
            vec![Exp::Local(plain), Exp::AddrLocal(escaped)],
        )),
    );

    let runtime = crate::oracles::Runtime::resolve(&tm.module);
    let mut rec = Recognizer::new(&body, &runtime);
    assert!(rec.is_tracked_var(plain));
    assert!(!rec.is_tracked_var(escaped));
    assert!(!rec.is_tracked_var(number));
}

#[test]
fn test_unprotect_counter_block_shape() {
    use crate::analysis::testutil::TestModule;
    use crate::ir::{FunBody, InstKind, VarType};

    let tm = TestModule::new();
    let mut body = FunBody::new();
    let np = body.add_local("nprotect", VarType::Int);
    let unp = body.add_block();
    let join = body.add_block();
    body.push(unp, InstKind::Eval(Exp::call(tm.unprotect, vec![Exp::Local(np)])));
    body.set_term(unp, Term::Jump(join));

    let unprotect = tm.module.find_function("Rf_unprotect").unwrap();
    assert!(is_unprotect_counter_block(&body, unp, join, unprotect, np));
    // wrong join target
    assert!(!is_unprotect_counter_block(&body, unp, body.entry, unprotect, np));
    // wrong counter
    assert!(!is_unprotect_counter_block(&body, unp, join, unprotect, VarId(9)));
}
