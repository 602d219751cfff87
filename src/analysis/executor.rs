//! Per-function worklist executor
//!
//! Pops abstract states, transfers them across the instructions of their
//! block in the fixed sub-analysis order (freshness, balance, integer
//! guards, SEXP guards), and lets the terminator handlers prune
//! infeasible successors. Freshness runs first because it reads the
//! balance tracker's pre-transfer view of the counter and save
//! variables. Newly forked states are canonicalized through the
//! done-set; an equal state is never explored twice.

use std::collections::HashSet;

use tracing::{debug, trace};

use super::patterns::Recognizer;
use super::state::{CheckState, DoneSet};
use super::{balance, fresh, int_guards, sexp_guards, Ctx, Flags};
use crate::cfg::{Cfg, Liveness};
use crate::config::AnalysisConfig;
use crate::diagnostics::{Kind, Reporter};
use crate::ir::{visit, BlockId, FunBody, FunId};
use crate::oracles::Oracles;

#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Findings that more precision might eliminate.
    pub refinable: u32,
    /// The state ceiling was hit and the function abandoned.
    pub aborted: bool,
    /// States explored by this run.
    pub states: usize,
}

/// One function's worth of analysis machinery: recognition caches,
/// liveness, error-path blocks, and the executor itself. The worklist
/// and done-set live inside [`run`], so re-running with different flags
/// starts from a clean slate.
pub struct FunctionAnalysis<'m> {
    oracles: &'m Oracles<'m>,
    config: &'m AnalysisConfig,
    fun: FunId,
    body: &'m FunBody,
    recognizer: Recognizer<'m>,
    liveness: Liveness,
    error_blocks: HashSet<BlockId>,
}

impl<'m> FunctionAnalysis<'m> {
    pub fn new(oracles: &'m Oracles<'m>, config: &'m AnalysisConfig, fun: FunId) -> Option<Self> {
        let body = oracles.module.function(fun).body.as_ref()?;
        let cfg = Cfg::build(body);
        let liveness = Liveness::compute(body, &cfg);
        let error_blocks = oracles.errors.error_blocks(oracles.module, fun);
        Some(FunctionAnalysis {
            oracles,
            config,
            fun,
            body,
            recognizer: Recognizer::new(body, &oracles.runtime),
            liveness,
            error_blocks,
        })
    }

    pub fn fun_name(&self) -> &str {
        self.oracles.module.fun_name(self.fun)
    }

    pub fn file(&self) -> &str {
        self.oracles
            .module
            .function(self.fun)
            .file
            .as_deref()
            .unwrap_or("<unknown>")
    }

    pub fn config(&self) -> &'m AnalysisConfig {
        self.config
    }

    pub fn run(&mut self, flags: Flags, reporter: &mut Reporter) -> RunOutcome {
        let mut refinable = 0u32;
        let name = self.oracles.module.fun_name(self.fun);
        let restartable = (!flags.int_guards && !self.config.avoid_int_guards_for(name))
            || (!flags.sexp_guards && !self.config.avoid_sexp_guards_for(name));

        let mut done = DoneSet::new(self.config.full_comparison);
        let mut worklist: Vec<CheckState> = Vec::new();
        let init = CheckState::entry(self.body.entry);
        done.insert(&init);
        worklist.push(init);

        while let Some(mut state) = worklist.pop() {
            if restartable && refinable > 0 {
                // the driver will retry with sharper precision
                return RunOutcome {
                    refinable,
                    aborted: false,
                    states: done.len(),
                };
            }
            if self.error_blocks.contains(&state.bb) {
                trace!("ignoring basic block on error path");
                continue;
            }
            if done.len() > self.config.max_states {
                reporter.info(
                    Kind::Error,
                    None,
                    format!("too many states, giving up on function {name}"),
                );
                return RunOutcome {
                    refinable,
                    aborted: true,
                    states: done.len(),
                };
            }

            let block = self.body.block(state.bb);
            for (idx, inst) in block.insts.iter().enumerate() {
                let mut ctx = Ctx {
                    oracles: self.oracles,
                    config: self.config,
                    rec: &mut self.recognizer,
                    reporter,
                    refinable: &mut refinable,
                    liveness: &self.liveness,
                    line: inst.line,
                };
                let events = visit::inst_events(&inst.kind);
                let pos = (state.bb, idx);

                let outcome = if flags.fresh {
                    let balance_view = flags.balance.then_some(&state.balance);
                    fresh::transfer_inst(&mut ctx, &mut state.fresh, balance_view, &events, pos)
                } else {
                    fresh::FreshOutcome::default()
                };
                if flags.balance {
                    let int_view = flags.int_guards.then_some(&state.int_guards);
                    balance::transfer_inst(
                        &mut ctx,
                        &mut state.balance,
                        int_view,
                        &events,
                        outcome.unprotect_ptr_top,
                    );
                }
                if flags.int_guards {
                    int_guards::transfer_inst(&mut ctx, &mut state.int_guards, &events);
                }
                if flags.sexp_guards {
                    sexp_guards::transfer_inst(&mut ctx, &mut state.sexp_guards, &events);
                }
                if restartable && refinable > 0 {
                    return RunOutcome {
                        refinable,
                        aborted: false,
                        states: done.len(),
                    };
                }
            }

            // operand reads of the terminator go through the ordinary
            // transfers before the terminator itself is interpreted
            let term_events = visit::term_events(&block.term);
            if !term_events.is_empty() {
                let mut ctx = Ctx {
                    oracles: self.oracles,
                    config: self.config,
                    rec: &mut self.recognizer,
                    reporter,
                    refinable: &mut refinable,
                    liveness: &self.liveness,
                    line: block.term_line,
                };
                let pos = (state.bb, block.insts.len());
                let outcome = if flags.fresh {
                    let balance_view = flags.balance.then_some(&state.balance);
                    fresh::transfer_inst(&mut ctx, &mut state.fresh, balance_view, &term_events, pos)
                } else {
                    fresh::FreshOutcome::default()
                };
                if flags.balance {
                    let int_view = flags.int_guards.then_some(&state.int_guards);
                    balance::transfer_inst(
                        &mut ctx,
                        &mut state.balance,
                        int_view,
                        &term_events,
                        outcome.unprotect_ptr_top,
                    );
                }
                if flags.int_guards {
                    int_guards::transfer_inst(&mut ctx, &mut state.int_guards, &term_events);
                }
                if flags.sexp_guards {
                    sexp_guards::transfer_inst(&mut ctx, &mut state.sexp_guards, &term_events);
                }
            }

            let mut ctx = Ctx {
                oracles: self.oracles,
                config: self.config,
                rec: &mut self.recognizer,
                reporter,
                refinable: &mut refinable,
                liveness: &self.liveness,
                line: block.term_line,
            };

            let successors = if flags.balance {
                balance::handle_terminator(&mut ctx, &mut state, self.body)
            } else {
                None
            };
            let successors = successors.or_else(|| {
                if flags.sexp_guards {
                    sexp_guards::handle_terminator(&mut ctx, &state, self.body)
                } else {
                    None
                }
            });
            // guard pruning on the counter must lose to balance, so that
            // `if (nprotect) UNPROTECT(nprotect)` is folded there first
            let successors = successors.or_else(|| {
                if flags.int_guards {
                    int_guards::handle_terminator(&mut ctx, &state, self.body)
                } else {
                    None
                }
            });

            match successors {
                Some(children) => {
                    for child in children {
                        if done.insert(&child) {
                            worklist.push(child);
                        }
                    }
                }
                None => {
                    // conservatively enqueue every CFG successor
                    for succ in block.term.successors() {
                        let child = state.fork(succ);
                        if done.insert(&child) {
                            worklist.push(child);
                        }
                    }
                }
            }
        }

        debug!("explored {} states in {name}", done.len());
        RunOutcome {
            refinable,
            aborted: false,
            states: done.len(),
        }
    }
}
