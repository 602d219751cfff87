//! The per-function symbolic executor and its sub-analyses
//!
//! Four cooperating trackers share one abstract state: protection-stack
//! balance, integer guards, SEXP guards, and freshness. The executor
//! drives them over the CFG with a worklist and a done-set of explored
//! states; the driver re-runs a function with sharper precision while
//! refinable findings remain.

use crate::cfg::Liveness;
use crate::config::AnalysisConfig;
use crate::diagnostics::Reporter;
use crate::oracles::Oracles;

pub mod balance;
pub mod driver;
pub mod executor;
pub mod fresh;
pub mod int_guards;
pub mod patterns;
pub mod sexp_guards;
pub mod state;

#[cfg(test)]
pub(crate) mod testutil;

pub use driver::{check_module, CheckMode, ModuleStats};
pub use executor::{FunctionAnalysis, RunOutcome};

/// Which sub-analyses run, and at what precision.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    pub int_guards: bool,
    pub sexp_guards: bool,
    pub balance: bool,
    pub fresh: bool,
}

/// Per-instruction context handed to the transfer functions.
pub(crate) struct Ctx<'a, 'm> {
    pub oracles: &'a Oracles<'m>,
    pub config: &'a AnalysisConfig,
    pub rec: &'a mut patterns::Recognizer<'m>,
    pub reporter: &'a mut Reporter,
    pub refinable: &'a mut u32,
    pub liveness: &'a Liveness,
    /// Source line of the instruction being transferred.
    pub line: Option<u32>,
}

impl<'a, 'm> Ctx<'a, 'm> {
    pub fn var_name(&self, var: crate::ir::VarId) -> String {
        self.rec.body().var_name(var).to_string()
    }

    pub fn fun_name(&self, f: crate::ir::FunId) -> String {
        self.oracles.module.fun_name(f).to_string()
    }
}
