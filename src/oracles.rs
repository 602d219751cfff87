//! Whole-module oracles
//!
//! Read-only queries the per-function executor consults: allocator
//! classification, error (no-return) functions and the blocks that only
//! lead to them, callee-protect facts, the symbol table, and by-name
//! resolution of the R API entry points.
//!
//! Base facts are declared on external functions in the module; the
//! closures here widen them over the call graph for defined functions.
//! Calls sitting on error-only paths do not propagate allocation.

use std::collections::HashSet;

use crate::cfg::Cfg;
use crate::ir::{visit, BlockId, Exp, FunBody, FunId, GlobalId, Module, Term};

/// By-name resolution of the runtime entry points the checker models.
/// Any of them may be absent from a given module.
#[derive(Debug, Default)]
pub struct Runtime {
    pub protect: Option<FunId>,
    pub protect_with_index: Option<FunId>,
    pub unprotect: Option<FunId>,
    pub unprotect_ptr: Option<FunId>,
    pub reprotect: Option<FunId>,
    pub preserve_object: Option<FunId>,
    pub install: Option<FunId>,
    pub is_null: Option<FunId>,
    pub attrib: Option<FunId>,
    pub pp_stack_top: Option<GlobalId>,
    pub nil: Option<GlobalId>,
    pub node_stack_top: Option<GlobalId>,
}

impl Runtime {
    pub fn resolve(module: &Module) -> Runtime {
        Runtime {
            protect: module.find_function("Rf_protect"),
            protect_with_index: module.find_function("R_ProtectWithIndex"),
            unprotect: module.find_function("Rf_unprotect"),
            unprotect_ptr: module.find_function("Rf_unprotect_ptr"),
            reprotect: module.find_function("R_Reprotect"),
            preserve_object: module.find_function("R_PreserveObject"),
            install: module.find_function("Rf_install"),
            is_null: module.find_function("Rf_isNull"),
            attrib: module.find_function("ATTRIB"),
            pp_stack_top: module.find_global("R_PPStackTop"),
            nil: module.find_global("R_NilValue"),
            node_stack_top: module.find_global("R_BCNodeStackTop"),
        }
    }

    pub fn is_protect(&self, f: FunId) -> bool {
        self.protect == Some(f) || self.protect_with_index == Some(f)
    }

    /// The protection primitives themselves; imbalanced by design and
    /// excluded from checking.
    pub fn is_protection_primitive(&self, f: FunId) -> bool {
        self.is_protect(f) || self.unprotect == Some(f) || self.unprotect_ptr == Some(f)
    }
}

const SETTER_NAMES: &[&str] = &[
    "Rf_setAttrib",
    "Rf_setVar",
    "Rf_defineVar",
    "SET_ATTRIB",
    "SET_VECTOR_ELT",
    "SET_STRING_ELT",
    "SET_TAG",
    "SETCAR",
    "SETCDR",
    "SETCADR",
];

/// Allocator classification with call-graph closure over defined
/// functions.
#[derive(Debug)]
pub struct AllocatorInfo {
    allocating: HashSet<FunId>,
    possible_allocators: HashSet<FunId>,
    fresh_returners: HashSet<FunId>,
}

impl AllocatorInfo {
    pub fn compute(module: &Module, errors: &ErrorInfo) -> AllocatorInfo {
        let mut allocating: HashSet<FunId> = module
            .fun_ids()
            .filter(|f| module.function(*f).facts.allocating)
            .collect();

        // May-allocate propagates through calls, skipping error paths.
        let mut changed = true;
        while changed {
            changed = false;
            for f in module.fun_ids() {
                if allocating.contains(&f) {
                    continue;
                }
                let Some(body) = &module.function(f).body else {
                    continue;
                };
                let error_blocks = errors.error_blocks(module, f);
                let calls_allocating = live_calls(body, &error_blocks)
                    .into_iter()
                    .any(|callee| allocating.contains(&callee));
                if calls_allocating {
                    allocating.insert(f);
                    changed = true;
                }
            }
        }

        // May-return-fresh propagates through returned call results and
        // locals fed from them.
        let mut possible: HashSet<FunId> = module
            .fun_ids()
            .filter(|f| module.function(*f).facts.possible_allocator)
            .collect();
        let mut changed = true;
        while changed {
            changed = false;
            for f in module.fun_ids() {
                if possible.contains(&f) {
                    continue;
                }
                let Some(body) = &module.function(f).body else {
                    continue;
                };
                if returns_possible_allocation(body, &possible) {
                    possible.insert(f);
                    changed = true;
                }
            }
        }

        let fresh_returners = module
            .fun_ids()
            .filter(|f| module.function(*f).facts.fresh_returner)
            .collect();

        AllocatorInfo {
            allocating,
            possible_allocators: possible,
            fresh_returners,
        }
    }

    pub fn is_allocating(&self, f: FunId) -> bool {
        self.allocating.contains(&f)
    }

    pub fn is_possible_allocator(&self, f: FunId) -> bool {
        self.possible_allocators.contains(&f)
    }

    pub fn is_possible_fresh_returner(&self, f: FunId) -> bool {
        self.fresh_returners.contains(&f) || self.possible_allocators.contains(&f)
    }
}

fn live_calls(body: &FunBody, error_blocks: &HashSet<BlockId>) -> Vec<FunId> {
    let mut out = Vec::new();
    for bb in body.block_ids() {
        if error_blocks.contains(&bb) {
            continue;
        }
        for inst in &body.block(bb).insts {
            for call in visit::calls_in_inst(&inst.kind) {
                out.push(call.callee);
            }
        }
    }
    out
}

fn returns_possible_allocation(body: &FunBody, possible: &HashSet<FunId>) -> bool {
    // Locals whose stores include a possible-allocator result.
    let mut tainted: HashSet<crate::ir::VarId> = HashSet::new();
    for bb in body.block_ids() {
        for inst in &body.block(bb).insts {
            visit::walk_inst(&inst.kind, &mut |ev| {
                if let visit::Event::StoreLocal { var, value } = ev {
                    if exp_is_possible_allocation(value, possible, &HashSet::new()) {
                        tainted.insert(var);
                    }
                }
            });
        }
    }
    for bb in body.block_ids() {
        if let Term::Ret(Some(value)) = &body.block(bb).term {
            if exp_is_possible_allocation(value, possible, &tainted) {
                return true;
            }
        }
    }
    false
}

fn exp_is_possible_allocation(
    exp: &Exp,
    possible: &HashSet<FunId>,
    tainted: &HashSet<crate::ir::VarId>,
) -> bool {
    match exp {
        Exp::Call(call) => possible.contains(&call.callee),
        Exp::Local(var) => tainted.contains(var),
        Exp::Assign(_, value) => exp_is_possible_allocation(value, possible, tainted),
        Exp::Phi(args) => args
            .iter()
            .any(|a| exp_is_possible_allocation(a, possible, tainted)),
        _ => false,
    }
}

/// No-return functions and the basic blocks that only lead to them.
#[derive(Debug)]
pub struct ErrorInfo {
    no_return: HashSet<FunId>,
}

impl ErrorInfo {
    pub fn compute(module: &Module) -> ErrorInfo {
        let no_return: HashSet<FunId> = module
            .fun_ids()
            .filter(|f| module.function(*f).facts.no_return)
            .collect();
        let mut info = ErrorInfo { no_return };

        // A defined function whose entry block only leads to no-return
        // calls is itself a no-return function.
        let mut changed = true;
        while changed {
            changed = false;
            for f in module.fun_ids() {
                if info.no_return.contains(&f) {
                    continue;
                }
                let Some(body) = &module.function(f).body else {
                    continue;
                };
                if info.error_blocks_of(body).contains(&body.entry) {
                    info.no_return.insert(f);
                    changed = true;
                }
            }
        }
        info
    }

    pub fn is_error_function(&self, f: FunId) -> bool {
        self.no_return.contains(&f)
    }

    /// Blocks from which every path ends in a call to a no-return
    /// function (or falls off an unreachable terminator).
    pub fn error_blocks(&self, module: &Module, f: FunId) -> HashSet<BlockId> {
        match &module.function(f).body {
            Some(body) => self.error_blocks_of(body),
            None => HashSet::new(),
        }
    }

    fn error_blocks_of(&self, body: &FunBody) -> HashSet<BlockId> {
        let cfg = Cfg::build(body);
        let mut error_blocks: HashSet<BlockId> = HashSet::new();

        let calls_no_return = |bb: BlockId| {
            body.block(bb).insts.iter().any(|inst| {
                visit::calls_in_inst(&inst.kind)
                    .iter()
                    .any(|call| self.no_return.contains(&call.callee))
            })
        };

        let mut changed = true;
        while changed {
            changed = false;
            for bb in body.block_ids() {
                if error_blocks.contains(&bb) {
                    continue;
                }
                let is_error = match &body.block(bb).term {
                    Term::Unreachable => true,
                    Term::Ret(_) => calls_no_return(bb),
                    _ => {
                        calls_no_return(bb)
                            || cfg
                                .successors(bb)
                                .iter()
                                .all(|succ| error_blocks.contains(succ))
                    }
                };
                if is_error {
                    error_blocks.insert(bb);
                    changed = true;
                }
            }
        }
        error_blocks
    }
}

/// Per-parameter callee-protect and callee-safe facts.
#[derive(Debug)]
pub struct CalleeProtectInfo<'m> {
    module: &'m Module,
}

impl<'m> CalleeProtectInfo<'m> {
    pub fn new(module: &'m Module) -> CalleeProtectInfo<'m> {
        CalleeProtectInfo { module }
    }

    pub fn is_callee_protect(&self, f: FunId) -> bool {
        self.module.function(f).facts.callee_protect
    }

    pub fn is_callee_safe(&self, f: FunId) -> bool {
        let facts = &self.module.function(f).facts;
        facts.callee_safe || facts.callee_protect
    }

    pub fn is_callee_safe_param(&self, f: FunId, param: usize) -> bool {
        let facts = &self.module.function(f).facts;
        facts.callee_safe
            || facts.callee_protect
            || facts.callee_safe_params.contains(&(param as u32))
    }
}

/// Globals holding interned symbols.
#[derive(Debug)]
pub struct SymbolTable<'m> {
    module: &'m Module,
}

impl<'m> SymbolTable<'m> {
    pub fn new(module: &'m Module) -> SymbolTable<'m> {
        SymbolTable { module }
    }

    pub fn symbol_name(&self, global: GlobalId) -> Option<&'m str> {
        self.module.global(global).symbol.as_deref()
    }
}

/// Everything the executor consults, bundled.
pub struct Oracles<'m> {
    pub module: &'m Module,
    pub runtime: Runtime,
    pub allocators: AllocatorInfo,
    pub errors: ErrorInfo,
    pub cprotect: CalleeProtectInfo<'m>,
    pub symbols: SymbolTable<'m>,
}

impl<'m> Oracles<'m> {
    pub fn build(module: &'m Module) -> Oracles<'m> {
        let runtime = Runtime::resolve(module);
        let errors = ErrorInfo::compute(module);
        let allocators = AllocatorInfo::compute(module, &errors);
        Oracles {
            module,
            runtime,
            allocators,
            errors,
            cprotect: CalleeProtectInfo::new(module),
            symbols: SymbolTable::new(module),
        }
    }

    /// Setter-shaped functions (store later arguments into the first).
    pub fn is_setter(&self, f: FunId) -> bool {
        let fun = self.module.function(f);
        fun.facts.setter || SETTER_NAMES.contains(&fun.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunFacts, InstKind, VarType};

    fn alloc_facts() -> FunFacts {
        FunFacts {
            allocating: true,
            possible_allocator: true,
            ..FunFacts::default()
        }
    }

    #[test]
    fn test_allocating_closure() {
        let mut module = Module::default();
        let alloc = module.declare("Rf_allocVector", alloc_facts());
        let mut body = FunBody::new();
        body.push(body.entry, InstKind::Eval(Exp::call(alloc, vec![])));
        let wrapper = module.define("wrapper", body);

        let errors = ErrorInfo::compute(&module);
        let info = AllocatorInfo::compute(&module, &errors);
        assert!(info.is_allocating(wrapper));
        // wrapper discards the result, so it cannot return a fresh object
        assert!(!info.is_possible_allocator(wrapper));
    }

    #[test]
    fn test_possible_allocator_through_return() {
        let mut module = Module::default();
        let alloc = module.declare("Rf_allocVector", alloc_facts());
        let mut body = FunBody::new();
        let x = body.add_local("x", VarType::Sexp);
        body.push(
            body.entry,
            InstKind::Store {
                var: x,
                value: Exp::call(alloc, vec![]),
            },
        );
        body.set_term(body.entry, Term::Ret(Some(Exp::Local(x))));
        let wrapper = module.define("wrap_alloc", body);

        let errors = ErrorInfo::compute(&module);
        let info = AllocatorInfo::compute(&module, &errors);
        assert!(info.is_possible_allocator(wrapper));
    }

    #[test]
    fn test_error_blocks_and_no_return_closure() {
        let mut module = Module::default();
        let error = module.declare(
            "Rf_error",
            FunFacts {
                no_return: true,
                ..FunFacts::default()
            },
        );

        let mut body = FunBody::new();
        let entry = body.entry;
        let fail = body.add_block();
        let ok = body.add_block();
        body.set_term(
            entry,
            Term::Branch {
                cond: Exp::Unknown,
                then_bb: fail,
                else_bb: ok,
            },
        );
        body.push(fail, InstKind::Eval(Exp::call(error, vec![])));
        body.set_term(fail, Term::Unreachable);
        body.set_term(ok, Term::Ret(None));
        let f = module.define("may_fail", body);

        let info = ErrorInfo::compute(&module);
        let blocks = info.error_blocks(&module, f);
        assert!(blocks.contains(&fail));
        assert!(!blocks.contains(&entry));
        assert!(!blocks.contains(&ok));
        assert!(!info.is_error_function(f));

        // a function that always errors is itself an error function
        let mut body = FunBody::new();
        body.push(body.entry, InstKind::Eval(Exp::call(error, vec![])));
        body.set_term(body.entry, Term::Unreachable);
        let always = module.define("always_fails", body);
        let info = ErrorInfo::compute(&module);
        assert!(info.is_error_function(always));
    }
}
