//! Static checker for PROTECT/UNPROTECT misuse in R native extensions
//!
//! The R C API requires callers to pin garbage-collected objects on a
//! protection stack in matching PROTECT/UNPROTECT pairs. This crate
//! analyzes an IR module of one extension and reports protection-stack
//! imbalance and fresh, unprotected pointers held live across allocating
//! calls.
//!
//! The checking is path-sensitive and adaptive: each function is
//! symbolically executed over its control-flow graph, and precision is
//! raised (integer guards, then SEXP guards) while findings remain
//! refinable. It is a heuristic bug-finder, not a verifier — some
//! functions are imbalanced by design, and unmodeled constructs make the
//! checker go quiet rather than guess.

pub mod analysis;
pub mod cfg;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod ir;
pub mod maacheck;
pub mod oracles;

pub use analysis::{check_module, CheckMode};
pub use config::AnalysisConfig;
pub use diagnostics::Finding;
