//! `gantry` CLI entry point.

use anyhow::Result;

fn main() -> Result<()> {
    gantry::cli::run()?;
    Ok(())
}
