//! Joint protection-balance and unprotected-pointer checker.

use protcheck::CheckMode;

fn main() -> anyhow::Result<()> {
    protcheck::cli::run_check(CheckMode::Joint)
}
