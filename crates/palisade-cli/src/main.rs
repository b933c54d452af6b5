#![doc = include_str!("../README.md")]

use clap::Parser;
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use palisade_analysis::arg_scan;
use palisade_analysis::diagnostics::Diagnostic;
use palisade_analysis::engine::{analyze_module, AnalysisConfig};
use palisade_ir::loader::load_module;

mod cli;
use cli::{Cli, Commands};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

fn parse_output_format(raw: &str) -> miette::Result<OutputFormat> {
    match raw {
        "text" => Ok(OutputFormat::Text),
        "json" => Ok(OutputFormat::Json),
        other => Err(miette::miette!(
            "unknown output format '{other}' (expected text or json)"
        )),
    }
}

fn render(diagnostics: &[Diagnostic], format: OutputFormat) -> miette::Result<()> {
    match format {
        OutputFormat::Text => {
            for d in diagnostics {
                println!("{d}");
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(diagnostics).into_diagnostic()?;
            println!("{json}");
        }
    }
    Ok(())
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Check {
            file,
            function,
            format,
            separate,
            max_states,
            hash_only,
        } => {
            let format = parse_output_format(&format)?;
            let module = load_module(&file)?;
            let config = AnalysisConfig {
                separate_checking: separate,
                max_states,
                full_comparison: !hash_only,
                ..AnalysisConfig::default()
            };
            let report = analyze_module(&module, &config, function.as_deref());
            render(&report.diagnostics, format)?;
            info!(
                "analyzed {} functions, traversed {} states ({} abandoned)",
                report.functions_analyzed, report.states_visited, report.functions_aborted
            );
        }
        Commands::ScanArgs {
            file,
            function,
            format,
        } => {
            let format = parse_output_format(&format)?;
            let module = load_module(&file)?;
            let findings = arg_scan::scan_module(&module, function.as_deref());
            render(&findings, format)?;
        }
    }
    Ok(())
}
