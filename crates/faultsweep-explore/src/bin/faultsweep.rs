//! CLI for inspecting faultsweep analysis configurations and reports.
//!
//! # Usage
//!
//! ```bash
//! # Write the default gRPC/HTTP analysis configuration
//! faultsweep init --output analysis.json
//!
//! # Check a configuration and list what it injects
//! faultsweep validate --config analysis.json
//!
//! # Render a saved execution report and run the analyzers over it
//! faultsweep analyze --report checkout-3.json
//!
//! # Show which faults a configuration would assign to each call of a report
//! faultsweep candidates --report checkout-0.json --config analysis.json
//! ```
//!
//! Set `RUST_LOG=debug` for orchestrator and analyzer logging.

use clap::{Parser, Subcommand};
use faultsweep_fault::AnalysisConfigurationFile;
use faultsweep_trace::analyze_all;
use faultsweep_trace::serialize::{format_report, format_warnings, load_report};
use faultsweep_trace::TestExecutionReport;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "faultsweep")]
#[command(about = "Fault-space exploration for instrumented RPC systems")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default analysis configuration.
    Init {
        /// Where to write the configuration.
        #[arg(short, long, default_value = "analysis.json")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Load an analysis configuration and print what it contains.
    Validate {
        /// Path to the analysis configuration (JSON).
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print a saved execution report and its analyzer warnings.
    Analyze {
        /// Path to the execution report (JSON).
        #[arg(short, long)]
        report: PathBuf,

        /// Exit with status 1 if any analyzer warns.
        #[arg(long)]
        strict: bool,
    },

    /// List the candidate faults for every call in a report.
    Candidates {
        /// Path to the execution report (JSON).
        #[arg(short, long)]
        report: PathBuf,

        /// Path to the analysis configuration (JSON).
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output, force } => cmd_init(&output, force),
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Analyze { report, strict } => cmd_analyze(&report, strict),
        Commands::Candidates { report, config } => cmd_candidates(&report, &config),
    }
}

fn cmd_init(output: &Path, force: bool) {
    if output.exists() && !force {
        eprintln!(
            "Error: {} already exists (use --force to overwrite)",
            output.display()
        );
        std::process::exit(1);
    }

    let config = match AnalysisConfigurationFile::grpc_default() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.save(output) {
        eprintln!("Error: failed to write {}: {}", output.display(), e);
        std::process::exit(1);
    }
    eprintln!("Wrote default analysis configuration to: {}", output.display());
}

fn cmd_validate(path: &Path) {
    let config = load_config(path);
    let policy = config.policy();

    println!("═══════════════════════════════════════════════════════════════════════");
    println!("  Analysis configuration {}", path.display());
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();
    println!("Policy:");
    println!("  Strategy:       {:?}", policy.strategy);
    println!("  Combinatorial:  {}", policy.combinatorial);
    match policy.max_faults_per_execution {
        Some(max) => println!("  Max faults:     {}", max),
        None => println!("  Max faults:     unbounded"),
    }
    match policy.max_executions {
        Some(max) => println!("  Max executions: {}", max),
        None => println!("  Max executions: unbounded"),
    }
    match policy.execution_timeout() {
        Some(timeout) => println!("  Timeout:        {:?}", timeout),
        None => println!("  Timeout:        none"),
    }
    println!("  Skip organic:   {}", policy.avoid_redundant_injections);
    println!();

    println!("─── Configurations ────────────────────────────────────────────────────");
    for configuration in config.configurations() {
        let source = configuration.to_serializable();
        println!("  {} /{}/", configuration.name(), configuration.pattern());
        if let Some(rpc_type) = source.rpc_type {
            println!("      rpc type:   {}", rpc_type);
        }
        for exception in &source.exceptions {
            println!("      exception:  {} {:?}", exception.name, exception.metadata);
        }
        for errors in &source.errors {
            println!(
                "      errors:     {} type(s) for services /{}/",
                errors.types.len(),
                errors.service_pattern
            );
        }
        for latency in &source.latencies {
            println!("      latency:    +{}ms", latency);
        }
        for rule in &source.byzantines {
            println!("      byzantine:  {} (seed {:#x})", rule.transformer, rule.seed);
        }
    }
}

fn cmd_analyze(path: &Path, strict: bool) {
    let report = load(path);
    let warnings = analyze_all(&report);

    println!("{}", format_report(&report));
    print!("{}", format_warnings(&warnings));

    if strict && !warnings.is_empty() {
        std::process::exit(1);
    }
}

fn cmd_candidates(report_path: &Path, config_path: &Path) {
    let report = load(report_path);
    let config = load_config(config_path);

    let mut total = 0;
    for entry in report.entries() {
        let faults = config.candidate_faults(&entry.callsite);
        println!("{}", entry.callsite.rpc_method());
        println!("  at {}", entry.index);
        if faults.is_empty() {
            println!("    (no candidate faults)");
        }
        for fault in &faults {
            println!("    {}", fault);
        }
        total += faults.len();
    }
    eprintln!();
    eprintln!(
        "{} calls, {} candidate single-fault executions",
        report.len(),
        total
    );
}

fn load(path: &Path) -> TestExecutionReport {
    match load_report(path) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: failed to load report {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

fn load_config(path: &Path) -> AnalysisConfigurationFile {
    match AnalysisConfigurationFile::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: failed to load configuration {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}
