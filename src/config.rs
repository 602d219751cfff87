//! Analysis configuration
//!
//! Limits and heuristic toggles, overridable from a JSON config file.
//! Defaults match the behavior the checker ships with; the toggles exist
//! because several heuristics are deliberately unsound and sometimes need
//! to be turned off when triaging a new code base.

use std::fs;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Per-function ceiling on explored abstract states.
    pub max_states: usize,
    /// Modeled protect-stack depth bound per state.
    pub max_pstack_size: usize,
    /// Balance depth beyond which the tracker assumes it is lost.
    pub max_depth: i32,
    /// Counter value beyond which exact tracking switches to
    /// differential.
    pub max_count: i64,
    /// Treat allocator results stored to SEXP guards as non-nil. Unsound
    /// when an allocator can legitimately return nil.
    pub use_allocator_detection: bool,
    /// Structural state comparison in the done-set; hash-only when off.
    pub full_comparison: bool,
    /// Run balance and freshness in independent passes instead of one
    /// joint state.
    pub separate_checking: bool,
    /// Report fresh pointers passed to allocating functions.
    pub report_fresh_arguments: bool,
    /// Protecting an untracked variable inserts it as fresh with one
    /// protection, so a later pop re-freshens it.
    pub treat_protected_as_fresh: bool,
    /// Functions never given integer-guard precision (known to blow up
    /// the state space).
    pub int_guard_blacklist: Vec<String>,
    /// Functions never given SEXP-guard precision (parsers and
    /// protection-manipulating code).
    pub sexp_guard_blacklist: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            max_states: 3_000_000,
            max_pstack_size: 64,
            max_depth: 64,
            max_count: 1000,
            use_allocator_detection: true,
            full_comparison: true,
            separate_checking: false,
            report_fresh_arguments: true,
            treat_protected_as_fresh: true,
            int_guard_blacklist: Vec::new(),
            sexp_guard_blacklist: Vec::new(),
        }
    }
}

impl AnalysisConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<AnalysisConfig> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn avoid_int_guards_for(&self, name: &str) -> bool {
        self.int_guard_blacklist.iter().any(|n| n == name)
    }

    pub fn avoid_sexp_guards_for(&self, name: &str) -> bool {
        self.sexp_guard_blacklist.iter().any(|n| n == name)
    }
}
