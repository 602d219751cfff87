//! Multiple-allocating-arguments scanner
//!
//! A call like `cons(install("x"), ScalarInt(1))` is a classic defect:
//! if the scalar is allocated first, the subsequent install may collect
//! it before `cons` ever sees it — even when `cons` protects its
//! arguments. This lightweight module-level scan flags call sites whose
//! direct arguments contain at least two allocating subexpressions, at
//! least one of which returns a fresh object. Error paths are ignored.

use std::fmt;

use crate::ir::{Exp, FunId, Module};
use crate::oracles::Oracles;

/// How an argument expression relates to allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ArgKind {
    NoAlloc,
    /// Allocates, but does not hand back a fresh object.
    Allocating,
    /// Allocates and possibly returns a fresh object.
    Fresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspiciousCall {
    pub caller: String,
    pub callee: String,
    pub file: String,
    pub line: u32,
}

impl fmt::Display for SuspiciousCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WARNING suspicious call (two or more unprotected arguments) to {} at {} {}:{}",
            self.callee, self.caller, self.file, self.line
        )
    }
}

pub fn scan_module(module: &Module, targets: Option<&[String]>) -> Vec<SuspiciousCall> {
    let oracles = Oracles::build(module);
    let mut findings = Vec::new();

    for fun in module.fun_ids() {
        let function = module.function(fun);
        let Some(body) = &function.body else { continue };
        if let Some(targets) = targets {
            if !targets.iter().any(|t| *t == function.name) {
                continue;
            }
        }
        let error_blocks = oracles.errors.error_blocks(module, fun);
        let file = function.file.as_deref().unwrap_or("<unknown>");

        for bb in body.block_ids() {
            if error_blocks.contains(&bb) {
                continue;
            }
            for inst in &body.block(bb).insts {
                for call in crate::ir::visit::calls_in_inst(&inst.kind) {
                    let mut allocating = 0u32;
                    let mut fresh = 0u32;
                    for arg in &call.args {
                        let kind = classify_arg(arg, &oracles);
                        if kind >= ArgKind::Allocating {
                            allocating += 1;
                        }
                        if kind >= ArgKind::Fresh {
                            fresh += 1;
                        }
                    }
                    if allocating >= 2 && fresh >= 1 {
                        findings.push(SuspiciousCall {
                            caller: function.name.clone(),
                            callee: module.fun_name(call.callee).to_string(),
                            file: file.to_string(),
                            line: inst.line.unwrap_or(0),
                        });
                    }
                }
            }
        }
    }
    findings
}

fn classify_arg(arg: &Exp, oracles: &Oracles) -> ArgKind {
    match arg {
        Exp::Call(call) => classify_call(call.callee, oracles),
        // a merged value is as bad as its worst input
        Exp::Phi(inputs) => inputs
            .iter()
            .map(|input| classify_arg(input, oracles))
            .max()
            .unwrap_or(ArgKind::NoAlloc),
        Exp::Assign(_, value) => classify_arg(value, oracles),
        _ => ArgKind::NoAlloc,
    }
}

fn classify_call(callee: FunId, oracles: &Oracles) -> ArgKind {
    if !oracles.allocators.is_allocating(callee) {
        return ArgKind::NoAlloc;
    }
    if oracles.allocators.is_possible_fresh_returner(callee) {
        return ArgKind::Fresh;
    }
    ArgKind::Allocating
}
