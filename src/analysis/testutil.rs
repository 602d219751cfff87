//! Shared fixtures for the analysis tests: a module pre-populated with
//! the runtime entry points and a handful of classified externals, in
//! the shape the loader would produce.

use crate::analysis::{check_module, CheckMode};
use crate::config::AnalysisConfig;
use crate::diagnostics::Finding;
use crate::ir::{FunBody, FunFacts, FunId, GlobalId, Module};

pub struct TestModule {
    pub module: Module,
    pub protect: FunId,
    pub protect_with_index: FunId,
    pub unprotect: FunId,
    pub unprotect_ptr: FunId,
    pub reprotect: FunId,
    pub preserve: FunId,
    pub install: FunId,
    pub is_null: FunId,
    pub attrib: FunId,
    /// Allocates and may return a fresh object.
    pub alloc: FunId,
    /// A second such allocator.
    pub alloc_list: FunId,
    /// Allocating, does not protect its arguments.
    pub cons: FunId,
    /// Allocating setter.
    pub set_attrib: FunId,
    /// Allocating but consumes its first argument before allocating.
    pub safe_consumer: FunId,
    /// Plain function, neither allocating nor protecting.
    pub use_value: FunId,
    pub error_fun: FunId,
    pub nil: GlobalId,
    pub pp_top: GlobalId,
    pub node_stack: GlobalId,
    /// Global carrying the interned symbol "dim".
    pub dim_sym: GlobalId,
}

impl TestModule {
    pub fn new() -> TestModule {
        let mut module = Module::default();
        let alloc_facts = FunFacts {
            allocating: true,
            possible_allocator: true,
            fresh_returner: true,
            ..FunFacts::default()
        };

        let protect = module.declare("Rf_protect", FunFacts::default());
        let protect_with_index = module.declare("R_ProtectWithIndex", FunFacts::default());
        let unprotect = module.declare("Rf_unprotect", FunFacts::default());
        let unprotect_ptr = module.declare("Rf_unprotect_ptr", FunFacts::default());
        let reprotect = module.declare("R_Reprotect", FunFacts::default());
        let preserve = module.declare("R_PreserveObject", FunFacts::default());
        let install = module.declare(
            "Rf_install",
            FunFacts {
                allocating: true,
                ..FunFacts::default()
            },
        );
        let is_null = module.declare("Rf_isNull", FunFacts::default());
        let attrib = module.declare("ATTRIB", FunFacts::default());
        let alloc = module.declare("Rf_allocVector", alloc_facts.clone());
        let alloc_list = module.declare("Rf_allocList", alloc_facts.clone());
        let cons = module.declare(
            "Rf_cons",
            FunFacts {
                allocating: true,
                possible_allocator: true,
                ..FunFacts::default()
            },
        );
        let set_attrib = module.declare(
            "Rf_setAttrib",
            FunFacts {
                allocating: true,
                ..FunFacts::default()
            },
        );
        let safe_consumer = module.declare(
            "Rf_namesgets",
            FunFacts {
                allocating: true,
                callee_safe_params: vec![0],
                ..FunFacts::default()
            },
        );
        let use_value = module.declare("use_value", FunFacts::default());
        let error_fun = module.declare(
            "Rf_error",
            FunFacts {
                no_return: true,
                ..FunFacts::default()
            },
        );

        let nil = module.add_global("R_NilValue");
        let pp_top = module.add_global("R_PPStackTop");
        let node_stack = module.add_global("R_BCNodeStackTop");
        let dim_sym = module.add_symbol_global("R_DimSymbol", "dim");

        TestModule {
            module,
            protect,
            protect_with_index,
            unprotect,
            unprotect_ptr,
            reprotect,
            preserve,
            install,
            is_null,
            attrib,
            alloc,
            alloc_list,
            cons,
            set_attrib,
            safe_consumer,
            use_value,
            error_fun,
            nil,
            pp_top,
            node_stack,
            dim_sym,
        }
    }

    pub fn define(&mut self, name: &str, body: FunBody) -> FunId {
        self.module.define(name, body)
    }

    pub fn check(&self, mode: CheckMode) -> Vec<Finding> {
        self.check_with(&AnalysisConfig::default(), mode)
    }

    pub fn check_with(&self, config: &AnalysisConfig, mode: CheckMode) -> Vec<Finding> {
        check_module(&self.module, config, None, mode).0
    }
}

pub fn messages(findings: &[Finding]) -> Vec<String> {
    findings.iter().map(|f| f.record.message.clone()).collect()
}

pub fn has_message(findings: &[Finding], needle: &str) -> bool {
    findings.iter().any(|f| f.record.message.contains(needle))
}
