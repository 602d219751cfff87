//! Multiple-allocating-arguments scanner.

fn main() -> anyhow::Result<()> {
    protcheck::cli::run_maacheck()
}
