//! Unprotected-fresh-pointer checker.

use protcheck::CheckMode;

fn main() -> anyhow::Result<()> {
    protcheck::cli::run_check(CheckMode::FreshOnly)
}
