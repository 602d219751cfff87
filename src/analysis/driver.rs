//! Refinement driver
//!
//! Checks every function of interest, re-running the executor with
//! sharper precision while refinable findings remain: guards off first,
//! then integer guards, then SEXP guards. Per-function blacklists pin a
//! knob off for code known to blow up under it, and the protection
//! primitives themselves are never checked.

use tracing::{debug, info};

use super::{executor::FunctionAnalysis, Flags};
use crate::config::AnalysisConfig;
use crate::diagnostics::{Finding, Reporter};
use crate::ir::Module;
use crate::oracles::Oracles;

/// Which checks a binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Balance and freshness under one joint state (or two passes when
    /// separate checking is configured).
    Joint,
    BalanceOnly,
    FreshOnly,
}

#[derive(Debug, Default)]
pub struct ModuleStats {
    pub functions_analyzed: usize,
    pub states_explored: usize,
}

pub fn check_module(
    module: &Module,
    config: &AnalysisConfig,
    targets: Option<&[String]>,
    mode: CheckMode,
) -> (Vec<Finding>, ModuleStats) {
    let oracles = Oracles::build(module);
    let mut reporter = Reporter::new();
    let mut stats = ModuleStats::default();

    for fun in module.fun_ids() {
        let function = module.function(fun);
        if function.body.is_none() {
            continue;
        }
        if let Some(targets) = targets {
            if !targets.iter().any(|t| *t == function.name) {
                continue;
            }
        }
        // protect/unprotect are imbalanced by design
        if oracles.runtime.is_protection_primitive(fun) {
            continue;
        }

        let Some(mut analysis) = FunctionAnalysis::new(&oracles, config, fun) else {
            continue;
        };
        stats.functions_analyzed += 1;

        match mode {
            CheckMode::Joint if config.separate_checking => {
                check_function(&mut analysis, true, false, &mut reporter, &mut stats);
                check_function(&mut analysis, false, true, &mut reporter, &mut stats);
            }
            CheckMode::Joint => {
                check_function(&mut analysis, true, true, &mut reporter, &mut stats);
            }
            CheckMode::BalanceOnly => {
                check_function(&mut analysis, true, false, &mut reporter, &mut stats);
            }
            CheckMode::FreshOnly => {
                check_function(&mut analysis, false, true, &mut reporter, &mut stats);
            }
        }
    }

    (reporter.into_findings(), stats)
}

/// Run one function to a fixed precision, restarting with more while
/// findings remain refinable.
fn check_function(
    analysis: &mut FunctionAnalysis,
    balance: bool,
    fresh: bool,
    reporter: &mut Reporter,
    stats: &mut ModuleStats,
) {
    let name = analysis.fun_name().to_string();
    let file = analysis.file().to_string();
    reporter.begin_function(&name, &file);
    info!("checking function {name}");

    let config = analysis.config();
    let avoid_int = config.avoid_int_guards_for(&name);
    let avoid_sexp = config.avoid_sexp_guards_for(&name);

    let mut int_on = false;
    let mut sexp_on = false;
    loop {
        let flags = Flags {
            int_guards: int_on,
            sexp_guards: sexp_on,
            balance,
            fresh,
        };
        let outcome = analysis.run(flags, reporter);
        stats.states_explored += outcome.states;
        if outcome.aborted {
            break;
        }
        let restartable = (!int_on && !avoid_int) || (!sexp_on && !avoid_sexp);
        if restartable && outcome.refinable > 0 {
            // retry with more precise checking
            reporter.clear();
            if !int_on && !avoid_int {
                debug!("restarting {name} with integer guards");
                int_on = true;
            } else if !sexp_on && !avoid_sexp {
                debug!("restarting {name} with SEXP guards");
                sexp_on = true;
            }
        } else {
            break;
        }
    }
}
