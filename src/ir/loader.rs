//! Module loading and validation
//!
//! Modules are stored as JSON. Validation catches dangling ids and
//! malformed bodies up front so the analyses can index without checks.

use std::fs;
use std::path::Path;

use thiserror::Error;

use super::{BlockId, Exp, FunBody, FunId, GlobalId, InstKind, Module, Term, VarId};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read module file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse module: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("function {function}: entry block {entry} out of range")]
    BadEntry { function: String, entry: BlockId },

    #[error("function {function}: block {block} references block {target} out of range")]
    BadBlockRef {
        function: String,
        block: BlockId,
        target: BlockId,
    },

    #[error("function {function}: local {var} out of range")]
    BadLocal { function: String, var: VarId },

    #[error("function {function}: callee {callee} out of range")]
    BadCallee { function: String, callee: FunId },

    #[error("function {function}: global {global} out of range")]
    BadGlobal { function: String, global: GlobalId },
}

pub fn load_module(path: &Path) -> Result<Module, LoadError> {
    let text = fs::read_to_string(path)?;
    let module: Module = serde_json::from_str(&text)?;
    validate(&module)?;
    Ok(module)
}

pub fn validate(module: &Module) -> Result<(), LoadError> {
    for fun in &module.functions {
        let Some(body) = &fun.body else { continue };
        validate_body(module, &fun.name, body)?;
    }
    Ok(())
}

fn validate_body(module: &Module, name: &str, body: &FunBody) -> Result<(), LoadError> {
    let nblocks = body.blocks.len() as u32;
    if body.entry.0 >= nblocks {
        return Err(LoadError::BadEntry {
            function: name.to_string(),
            entry: body.entry,
        });
    }
    for (i, block) in body.blocks.iter().enumerate() {
        let block_id = BlockId(i as u32);
        for target in block.term.successors() {
            if target.0 >= nblocks {
                return Err(LoadError::BadBlockRef {
                    function: name.to_string(),
                    block: block_id,
                    target,
                });
            }
        }
        for inst in &block.insts {
            validate_inst(module, name, body, &inst.kind)?;
        }
        match &block.term {
            Term::Branch { cond, .. } => validate_exp(module, name, body, cond)?,
            Term::Ret(Some(value)) => validate_exp(module, name, body, value)?,
            _ => {}
        }
    }
    Ok(())
}

fn validate_inst(
    module: &Module,
    name: &str,
    body: &FunBody,
    kind: &InstKind,
) -> Result<(), LoadError> {
    match kind {
        InstKind::Store { var, value } => {
            validate_var(name, body, *var)?;
            validate_exp(module, name, body, value)
        }
        InstKind::StoreGlobal { global, value } => {
            validate_global(module, name, *global)?;
            validate_exp(module, name, body, value)
        }
        InstKind::StoreField { base, value, .. } => {
            validate_exp(module, name, body, base)?;
            validate_exp(module, name, body, value)
        }
        InstKind::Eval(value) => validate_exp(module, name, body, value),
    }
}

fn validate_exp(module: &Module, name: &str, body: &FunBody, exp: &Exp) -> Result<(), LoadError> {
    match exp {
        Exp::Const(_) | Exp::Str(_) | Exp::Arg(_) | Exp::Unknown => Ok(()),
        Exp::Global(global) => validate_global(module, name, *global),
        Exp::Local(var) | Exp::AddrLocal(var) => validate_var(name, body, *var),
        Exp::Call(call) => {
            if call.callee.0 >= module.functions.len() as u32 {
                return Err(LoadError::BadCallee {
                    function: name.to_string(),
                    callee: call.callee,
                });
            }
            for arg in &call.args {
                validate_exp(module, name, body, arg)?;
            }
            Ok(())
        }
        Exp::Assign(var, value) => {
            validate_var(name, body, *var)?;
            validate_exp(module, name, body, value)
        }
        Exp::Select {
            cond,
            then_val,
            else_val,
        } => {
            validate_exp(module, name, body, cond)?;
            validate_exp(module, name, body, then_val)?;
            validate_exp(module, name, body, else_val)
        }
        Exp::Cmp { lhs, rhs, .. } | Exp::Add { lhs, rhs } => {
            validate_exp(module, name, body, lhs)?;
            validate_exp(module, name, body, rhs)
        }
        Exp::Phi(args) => {
            for arg in args {
                validate_exp(module, name, body, arg)?;
            }
            Ok(())
        }
        Exp::AddrField { base, .. } => validate_exp(module, name, body, base),
    }
}

fn validate_var(name: &str, body: &FunBody, var: VarId) -> Result<(), LoadError> {
    if var.0 >= body.locals.len() as u32 {
        return Err(LoadError::BadLocal {
            function: name.to_string(),
            var,
        });
    }
    Ok(())
}

fn validate_global(module: &Module, name: &str, global: GlobalId) -> Result<(), LoadError> {
    if global.0 >= module.globals.len() as u32 {
        return Err(LoadError::BadGlobal {
            function: name.to_string(),
            global,
        });
    }
    Ok(())
}
