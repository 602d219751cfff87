//! Protection-balance-only checker.

use protcheck::CheckMode;

fn main() -> anyhow::Result<()> {
    protcheck::cli::run_check(CheckMode::BalanceOnly)
}
