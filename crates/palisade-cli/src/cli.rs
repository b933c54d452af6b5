//! CLI argument definitions: top-level `Cli` struct and `Commands` enum.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub(crate) const CLI_LONG_ABOUT: &str =
    "Static checker for pointer-protection bugs in C programs written against a \
    garbage-collected runtime with an explicit protect/unprotect stack.\n\n\
    Typical use:\n  \
    1. palisade check program.ir.json\n  \
    2. palisade check program.ir.json --function do_subset --format json\n  \
    3. palisade scan-args program.ir.json\n\n\
    The exit code is zero whenever the input loads, regardless of findings.";

#[derive(Parser)]
#[command(name = "palisade")]
#[command(about = "Static checker for protection-stack bugs")]
#[command(long_about = CLI_LONG_ABOUT)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Check protection-stack balance and unprotected fresh pointers
    #[command(display_order = 10)]
    Check {
        /// Path to the whole-program IR file (JSON)
        file: PathBuf,

        /// Only check the named function
        #[arg(long)]
        function: Option<String>,

        /// Output format: text | json
        #[arg(long, default_value = "text")]
        format: String,

        /// Run balance and fresh-pointer checking as separate passes
        #[arg(long, default_value_t = false)]
        separate: bool,

        /// Per-function cap on visited abstract states
        #[arg(long, default_value_t = 100_000)]
        max_states: usize,

        /// Compare states by hash only (faster, may lose precision)
        #[arg(long, default_value_t = false)]
        hash_only: bool,
    },

    /// Flag calls whose arguments are themselves allocating calls
    #[command(display_order = 20)]
    ScanArgs {
        /// Path to the whole-program IR file (JSON)
        file: PathBuf,

        /// Only scan the named function
        #[arg(long)]
        function: Option<String>,

        /// Output format: text | json
        #[arg(long, default_value = "text")]
        format: String,
    },
}
