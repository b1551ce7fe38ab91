//! Persistence and text rendering for execution reports.

use crate::analyzers::Warning;
use crate::report::TestExecutionReport;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during serialization.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Save a sealed report to a JSON file.
pub fn save_report(report: &TestExecutionReport, path: &Path) -> Result<(), SerializeError> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

/// Load a sealed report from a JSON file.
pub fn load_report(path: &Path) -> Result<TestExecutionReport, SerializeError> {
    let file = File::open(path)?;
    let report = serde_json::from_reader(file)?;
    Ok(report)
}

/// Format a report for human consumption.
pub fn format_report(report: &TestExecutionReport) -> String {
    let mut output = String::new();

    output.push_str("═══════════════════════════════════════════════════════════════════════\n");
    output.push_str(&format!("  Execution {}\n", report.execution));
    output.push_str("═══════════════════════════════════════════════════════════════════════\n\n");

    output.push_str(&format!("Status:          {}\n", report.status));
    output.push_str(&format!("Duration:        {:?}\n", report.duration));
    output.push_str(&format!("Calls recorded:  {}\n", report.len()));
    output.push_str(&format!("Faults assigned: {}\n", report.assignment.len()));
    output.push_str(&format!("Faults injected: {}\n", report.injected().count()));
    output.push('\n');

    if !report.assignment.is_empty() {
        output.push_str("─── Fault Assignment ──────────────────────────────────────────────────\n");
        for (index, fault) in report.assignment.iter() {
            let marker = if report.entry(index).is_some() { "✓" } else { "✗" };
            output.push_str(&format!("  {marker} {fault}\n      at {index}\n"));
        }
        output.push('\n');
    }

    output.push_str("─── Calls ─────────────────────────────────────────────────────────────\n");
    for (i, entry) in report.entries().iter().enumerate() {
        output.push_str(&format!(
            "  [{i:>4}] {} #{}\n",
            entry.callsite.rpc_method(),
            entry.index.ordinal().unwrap_or(0)
        ));
        output.push_str(&format!("         request: {}\n", entry.request));
        if let Some(fault) = &entry.fault {
            output.push_str(&format!("         fault:   {fault}\n"));
        }
        match entry.outcome() {
            Some(outcome) => output.push_str(&format!("         outcome: {outcome}\n")),
            None => output.push_str("         outcome: <none>\n"),
        }
    }

    output
}

/// Format analyzer warnings, one block per warning.
pub fn format_warnings(warnings: &[Warning]) -> String {
    if warnings.is_empty() {
        return "No warnings.\n".to_string();
    }

    let mut output = String::new();
    output.push_str(&format!("{} warning(s):\n", warnings.len()));
    for warning in warnings {
        output.push_str(&format!("\n  {warning}\n"));
        output.push_str(&format!("    at:      {}\n", warning.index));
        if let Some(related) = &warning.related {
            output.push_str(&format!("    related: {related}\n"));
        }
        output.push_str(&format!("    → {}\n", warning.recommendation));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::analyze_all;
    use crate::report::tests::{callsite, index, text};
    use crate::report::{ExecutionStatus, Outcome, ReportBuilder};
    use faultsweep_fault::{CompositeFaultSpecification, Fault};
    use tempfile::TempDir;

    fn test_report() -> TestExecutionReport {
        let fault = Fault::error("Status", [("code", "UNAVAILABLE")]);
        let mut builder = ReportBuilder::new(
            "checkout/3",
            CompositeFaultSpecification::single(index("Get", 1), fault.clone()),
        );
        builder
            .record_invocation(index("Get", 1), callsite("Get"), text("a"), Some(fault))
            .unwrap();
        builder
            .record_completion(&index("Get", 1), Outcome::raised("Status", [("code", "UNAVAILABLE")]))
            .unwrap();
        builder
            .record_invocation(index("Put", 1), callsite("Put"), text("b"), None)
            .unwrap();
        builder.seal(ExecutionStatus::Completed)
    }

    #[test]
    fn test_save_and_load_report() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("report.json");

        let report = test_report();
        save_report(&report, &path).unwrap();
        let loaded = load_report(&path).unwrap();
        assert_eq!(loaded, report);
        assert_eq!(analyze_all(&loaded), analyze_all(&report));
    }

    #[test]
    fn test_load_report_not_found() {
        let result = load_report(Path::new("/nonexistent/report.json"));
        assert!(matches!(result, Err(SerializeError::Io(_))));
    }

    #[test]
    fn test_format_report() {
        let text = format_report(&test_report());
        assert!(text.contains("Execution checkout/3"));
        assert!(text.contains("Status:          completed"));
        assert!(text.contains("Faults injected: 1"));
        assert!(text.contains("─── Fault Assignment"));
        assert!(text.contains("raised Status [UNAVAILABLE]"));
        assert!(text.contains("outcome: dropped"));
    }

    #[test]
    fn test_format_warnings() {
        assert_eq!(format_warnings(&[]), "No warnings.\n");
        let warnings = analyze_all(&test_report());
        let text = format_warnings(&warnings);
        assert!(text.starts_with("1 warning(s):"));
        assert!(text.contains("[incomplete-rpc]"));
    }
}
