//! Command line interface.

use std::path::PathBuf;

use clap::Parser;

/// Metamodel-driven reconciliation engine running the Value/Operator demo.
#[derive(Debug, Parser)]
#[command(name = "drover", version, about)]
pub struct Cli {
    /// Engine configuration (TOML or JSON). Defaults come from `DROVER_*`
    /// environment variables.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write the sample objects `a = 5`, `b = 6` and `c = a + b` into this
    /// namespace on startup.
    #[arg(long, value_name = "NAMESPACE")]
    pub seed: Option<String>,

    /// Print every watch event as a JSON line on stdout.
    #[arg(long)]
    pub watch: bool,

    /// Print the compiled metamodel and exit.
    #[arg(long)]
    pub dump_metamodel: bool,
}
