//! Execution reports and report analyzers for faultsweep.
//!
//! Every execution of a test produces one [`TestExecutionReport`]: the
//! calls it made in invocation order, what each call returned, and which
//! faults were injected where.
//!
//! ```text
//! orchestrator                       this crate
//! ────────────                       ──────────
//! record_invocation()  ──→  ReportBuilder::record_invocation()
//! record_completion()  ──→  ReportBuilder::record_completion()
//! finalize_execution() ──→  ReportBuilder::seal() ──→ TestExecutionReport
//!                                                      │
//!                                  analyzers::analyze_all()
//!                                                      ↓
//!                                                  Vec<Warning>
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use faultsweep_trace::analyzers::analyze_all;
//! use faultsweep_trace::serialize::{format_warnings, load_report};
//! use std::path::Path;
//!
//! let report = load_report(Path::new("report.json")).unwrap();
//! print!("{}", format_warnings(&analyze_all(&report)));
//! ```

pub mod analyzers;
pub mod report;
pub mod serialize;

pub use analyzers::{analyze_all, AnalyzerKind, Warning};
pub use report::{
    Completion, ExecutionStatus, Outcome, ReportBuilder, ReportEntry, ReportError,
    TestExecutionReport,
};
