//! Shared command-line surface of the checker binaries
//!
//! Every binary takes one IR module path and an optional list of
//! function names restricting the analysis, and exits 0 regardless of
//! findings.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::analysis::{check_module, CheckMode};
use crate::config::AnalysisConfig;
use crate::ir::{loader, Module};

#[derive(Debug, Parser)]
pub struct CheckArgs {
    /// IR module to analyze.
    pub module: PathBuf,

    /// Restrict analysis to these functions.
    pub functions: Vec<String>,

    /// Configuration file overriding the built-in defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();
}

impl CheckArgs {
    pub fn init_logging(&self) {
        init_logging(self.verbose);
    }

    pub fn load_module(&self) -> anyhow::Result<Module> {
        loader::load_module(&self.module)
            .with_context(|| format!("loading module {}", self.module.display()))
    }

    pub fn load_config(&self) -> anyhow::Result<AnalysisConfig> {
        match &self.config {
            Some(path) => AnalysisConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display())),
            None => Ok(AnalysisConfig::default()),
        }
    }

    fn targets(&self) -> Option<&[String]> {
        if self.functions.is_empty() {
            None
        } else {
            Some(&self.functions)
        }
    }
}

/// Run one of the per-function checkers and print its findings.
pub fn run_check(mode: CheckMode) -> anyhow::Result<()> {
    let args = CheckArgs::parse();
    args.init_logging();
    let module = args.load_module()?;
    let config = args.load_config()?;

    let (findings, stats) = check_module(&module, &config, args.targets(), mode);
    for finding in &findings {
        println!("{finding}");
    }
    eprintln!(
        "Analyzed {} functions, traversed {} states.",
        stats.functions_analyzed, stats.states_explored
    );
    Ok(())
}

/// Arguments of the maacheck scanner; it has no tunable configuration,
/// so no `--config` flag.
#[derive(Debug, Parser)]
pub struct ScanArgs {
    /// IR module to analyze.
    pub module: PathBuf,

    /// Restrict analysis to these functions.
    pub functions: Vec<String>,

    /// Verbose logging (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Run the multiple-allocating-arguments scanner.
pub fn run_maacheck() -> anyhow::Result<()> {
    let args = ScanArgs::parse();
    init_logging(args.verbose);
    let module = loader::load_module(&args.module)
        .with_context(|| format!("loading module {}", args.module.display()))?;
    let targets = if args.functions.is_empty() {
        None
    } else {
        Some(args.functions.as_slice())
    };

    let findings = crate::maacheck::scan_module(&module, targets);
    for finding in &findings {
        println!("{finding}");
    }
    Ok(())
}
