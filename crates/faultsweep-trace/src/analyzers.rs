//! Static analysis over sealed execution reports.
//!
//! Every analyzer is a pure function from a [`TestExecutionReport`] to a
//! list of [`Warning`]s.  [`ANALYZERS`] is the fixed registry;
//! [`analyze_all`] runs each one in registry order.  Findings are advisory
//! and never influence scheduling.

use crate::report::{Outcome, ReportEntry, TestExecutionReport};
use faultsweep_fault::{DistributedExecutionIndex, Fault, Payload};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Shortest shared run of characters that makes two requests "variations"
/// of one another.
pub const SIMILARITY_THRESHOLD: usize = 10;

/// Status code of an unimplemented method.
pub const UNIMPLEMENTED_CODE: &str = "UNIMPLEMENTED";

/// Signature shared by every analyzer.
pub type Analyzer = fn(&TestExecutionReport) -> Vec<Warning>;

/// The analyzer registry, in the order [`analyze_all`] runs it.
pub const ANALYZERS: [(AnalyzerKind, Analyzer); 5] = [
    (AnalyzerKind::RedundantRpc, redundant_rpcs),
    (AnalyzerKind::IncompleteRpc, incomplete_rpcs),
    (AnalyzerKind::ResponseBecomesRequest, responses_become_requests),
    (
        AnalyzerKind::MultipleInvocationsForIndividualMutations,
        multiple_invocations_for_mutations,
    ),
    (AnalyzerKind::UnimplementedFailure, unimplemented_failures),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    RedundantRpc,
    IncompleteRpc,
    ResponseBecomesRequest,
    MultipleInvocationsForIndividualMutations,
    UnimplementedFailure,
}

impl fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalyzerKind::RedundantRpc => write!(f, "redundant-rpc"),
            AnalyzerKind::IncompleteRpc => write!(f, "incomplete-rpc"),
            AnalyzerKind::ResponseBecomesRequest => write!(f, "response-becomes-request"),
            AnalyzerKind::MultipleInvocationsForIndividualMutations => {
                write!(f, "multiple-invocations-for-individual-mutations")
            }
            AnalyzerKind::UnimplementedFailure => write!(f, "unimplemented-failure"),
        }
    }
}

/// One analyzer finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub analyzer: AnalyzerKind,
    /// Call the warning is about.
    pub index: DistributedExecutionIndex,
    /// Earlier call involved in the finding, if any.
    pub related: Option<DistributedExecutionIndex>,
    pub description: String,
    pub recommendation: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.analyzer, self.description)
    }
}

/// Run every registered analyzer over `report`.
pub fn analyze_all(report: &TestExecutionReport) -> Vec<Warning> {
    let warnings: Vec<Warning> = ANALYZERS
        .iter()
        .flat_map(|(_, analyze)| analyze(report))
        .collect();
    if !warnings.is_empty() {
        debug!("{}: {} analyzer warnings", report.execution, warnings.len());
    }
    warnings
}

// ── Analyzers ───────────────────────────────────────────────────────

/// Same parent, call site and request issued again under a new ordinal.
///
/// Repeats after an injected fault or an error are retries and are not
/// flagged.
pub fn redundant_rpcs(report: &TestExecutionReport) -> Vec<Warning> {
    let mut first_seen: BTreeMap<(DistributedExecutionIndex, String, String), &ReportEntry> =
        BTreeMap::new();
    let mut warnings = Vec::new();

    for entry in report.entries() {
        let key = (
            entry.parent(),
            entry.callsite.signature(),
            payload_key(&entry.request),
        );
        match first_seen.get(&key) {
            Some(first) => {
                let retried = first.fault.is_some()
                    || !matches!(first.outcome(), Some(Outcome::Returned { .. }));
                if !retried {
                    warnings.push(Warning {
                        analyzer: AnalyzerKind::RedundantRpc,
                        index: entry.index.clone(),
                        related: Some(first.index.clone()),
                        description: format!(
                            "{} called again with an identical request",
                            entry.callsite.rpc_method()
                        ),
                        recommendation: "Cache the first response or remove the repeated call."
                            .to_string(),
                    });
                }
            }
            None => {
                first_seen.insert(key, entry);
            }
        }
    }
    warnings
}

/// Calls issued but never observed to complete.
///
/// Open entries of a timed-out execution were cut off by the timeout and
/// are not flagged.
pub fn incomplete_rpcs(report: &TestExecutionReport) -> Vec<Warning> {
    report
        .entries()
        .iter()
        .filter(|entry| match entry.outcome() {
            Some(Outcome::Dropped) => true,
            None => !report.is_timed_out(),
            Some(_) => false,
        })
        .map(|entry| Warning {
            analyzer: AnalyzerKind::IncompleteRpc,
            index: entry.index.clone(),
            related: None,
            description: format!(
                "{} was issued but its outcome was never observed",
                entry.callsite.rpc_method()
            ),
            recommendation: "Make sure the caller awaits or cancels the call before finishing."
                .to_string(),
        })
        .collect()
}

/// A later request that is structurally identical to an earlier response.
pub fn responses_become_requests(report: &TestExecutionReport) -> Vec<Warning> {
    let entries = report.entries();
    let mut warnings = Vec::new();

    for (position, later) in entries.iter().enumerate() {
        if is_trivial(&later.request) {
            continue;
        }
        for earlier in &entries[..position] {
            let Some(completion) = &earlier.completion else {
                continue;
            };
            if completion.completed_at > later.invoked_at {
                continue;
            }
            if completion.outcome.response() == Some(&later.request) {
                warnings.push(Warning {
                    analyzer: AnalyzerKind::ResponseBecomesRequest,
                    index: later.index.clone(),
                    related: Some(earlier.index.clone()),
                    description: format!(
                        "request to {} reuses the response from {} verbatim",
                        later.callsite.rpc_method(),
                        earlier.callsite.rpc_method()
                    ),
                    recommendation:
                        "Check whether the response should be processed before it is sent on."
                            .to_string(),
                });
            }
        }
    }
    warnings
}

/// Back-to-back calls to one call site with similar but different requests
/// in an execution that corrupted a response.
pub fn multiple_invocations_for_mutations(report: &TestExecutionReport) -> Vec<Warning> {
    let byzantine = report
        .assignment
        .iter()
        .any(|(_, fault)| matches!(fault, Fault::Byzantine { .. }));
    if !byzantine {
        return Vec::new();
    }

    report
        .entries()
        .windows(2)
        .filter_map(|pair| {
            let (previous, current) = (&pair[0], &pair[1]);
            if previous.callsite != current.callsite || previous.request == current.request {
                return None;
            }
            let shared =
                longest_common_substring(&previous.request.render(), &current.request.render());
            if shared.chars().count() < SIMILARITY_THRESHOLD {
                return None;
            }
            Some(Warning {
                analyzer: AnalyzerKind::MultipleInvocationsForIndividualMutations,
                index: current.index.clone(),
                related: Some(previous.index.clone()),
                description: format!(
                    "{shared:?} was sent to {} and again, varied, in the next call",
                    current.callsite.rpc_method()
                ),
                recommendation:
                    "One corrupted response fanned out into several calls; expect more executions."
                        .to_string(),
            })
        })
        .collect()
}

/// Unimplemented-status errors that were not the injected fault.
pub fn unimplemented_failures(report: &TestExecutionReport) -> Vec<Warning> {
    report
        .entries()
        .iter()
        .filter(|entry| {
            let unimplemented = entry
                .outcome()
                .and_then(Outcome::code)
                .is_some_and(|code| code == UNIMPLEMENTED_CODE);
            let injected = entry
                .fault
                .as_ref()
                .and_then(Fault::code)
                .is_some_and(|code| code == UNIMPLEMENTED_CODE);
            unimplemented && !injected
        })
        .map(|entry| Warning {
            analyzer: AnalyzerKind::UnimplementedFailure,
            index: entry.index.clone(),
            related: None,
            description: format!(
                "{} failed with {UNIMPLEMENTED_CODE} without an injected fault",
                entry.callsite.rpc_method()
            ),
            recommendation: "Implement the method or stub it before trusting other results."
                .to_string(),
        })
        .collect()
}

// ── Helpers ─────────────────────────────────────────────────────────

fn payload_key(payload: &Payload) -> String {
    format!("{}:{}", payload.kind(), payload.render())
}

fn is_trivial(payload: &Payload) -> bool {
    match payload {
        Payload::Bytes(bytes) => bytes.is_empty(),
        Payload::Text(text) => text.is_empty(),
        Payload::Structured(value) => match value {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            serde_json::Value::Array(items) => items.is_empty(),
            _ => false,
        },
    }
}

/// Longest run of characters shared by `a` and `b`.
pub fn longest_common_substring(a: &str, b: &str) -> String {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous = vec![0usize; b.len() + 1];
    let mut best_len = 0;
    let mut best_end = 0;

    for i in 1..=a.len() {
        let mut current = vec![0usize; b.len() + 1];
        for j in 1..=b.len() {
            if a[i - 1] == b[j - 1] {
                current[j] = previous[j - 1] + 1;
                if current[j] > best_len {
                    best_len = current[j];
                    best_end = i;
                }
            }
        }
        previous = current;
    }
    a[best_end - best_len..best_end].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::{callsite, index, text};
    use crate::report::{ExecutionStatus, ReportBuilder};
    use faultsweep_fault::{CompositeFaultSpecification, Transformer};

    fn returned(s: &str) -> Outcome {
        Outcome::Returned { payload: text(s) }
    }

    #[test]
    fn test_lcs() {
        assert_eq!(longest_common_substring("xxhello worldyy", "hello world!"), "hello world");
        assert_eq!(longest_common_substring("abc", "xyz"), "");
        assert_eq!(longest_common_substring("", "abc"), "");
    }

    #[test]
    fn test_response_becomes_request_scenario() {
        let mut builder = ReportBuilder::new("t/0", CompositeFaultSpecification::new());
        let r1 = index("Lookup", 1);
        let r2 = index("Reserve", 1);
        builder
            .record_invocation(r1.clone(), callsite("Lookup"), text("sku-1"), None)
            .unwrap();
        builder
            .record_completion(&r1, returned("{\"item\":\"sku-1\",\"qty\":3}"))
            .unwrap();
        builder
            .record_invocation(
                r2.clone(),
                callsite("Reserve"),
                text("{\"item\":\"sku-1\",\"qty\":3}"),
                None,
            )
            .unwrap();
        builder.record_completion(&r2, returned("ok")).unwrap();
        let report = builder.seal(ExecutionStatus::Completed);

        let warnings = responses_become_requests(&report);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].index, r2);
        assert_eq!(warnings[0].related, Some(r1));
    }

    #[test]
    fn test_response_becomes_request_skips_trivial_and_unrelated() {
        let mut builder = ReportBuilder::new("t/0", CompositeFaultSpecification::new());
        builder
            .record_invocation(index("A", 1), callsite("A"), text("q"), None)
            .unwrap();
        builder.record_completion(&index("A", 1), returned("")).unwrap();
        builder
            .record_invocation(index("B", 1), callsite("B"), text(""), None)
            .unwrap();
        builder.record_completion(&index("B", 1), returned("x")).unwrap();
        builder
            .record_invocation(index("C", 1), callsite("C"), text("different"), None)
            .unwrap();
        builder.record_completion(&index("C", 1), returned("y")).unwrap();
        let report = builder.seal(ExecutionStatus::Completed);
        assert!(responses_become_requests(&report).is_empty());
    }

    #[test]
    fn test_redundant_rpc() {
        let mut builder = ReportBuilder::new("t/0", CompositeFaultSpecification::new());
        for ordinal in 1..=2 {
            let i = index("Get", ordinal);
            builder
                .record_invocation(i.clone(), callsite("Get"), text("same"), None)
                .unwrap();
            builder.record_completion(&i, returned("v")).unwrap();
        }
        builder
            .record_invocation(index("Get", 3), callsite("Get"), text("other"), None)
            .unwrap();
        builder.record_completion(&index("Get", 3), returned("v")).unwrap();
        let report = builder.seal(ExecutionStatus::Completed);

        let warnings = redundant_rpcs(&report);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].index, index("Get", 2));
        assert_eq!(warnings[0].related, Some(index("Get", 1)));
    }

    #[test]
    fn test_redundant_rpc_ignores_retry_after_fault() {
        let fault = Fault::error("Status", [("code", "UNAVAILABLE")]);
        let mut builder = ReportBuilder::new(
            "t/1",
            CompositeFaultSpecification::single(index("Get", 1), fault.clone()),
        );
        builder
            .record_invocation(index("Get", 1), callsite("Get"), text("same"), Some(fault))
            .unwrap();
        builder
            .record_completion(&index("Get", 1), Outcome::raised("Status", [("code", "UNAVAILABLE")]))
            .unwrap();
        builder
            .record_invocation(index("Get", 2), callsite("Get"), text("same"), None)
            .unwrap();
        builder.record_completion(&index("Get", 2), returned("v")).unwrap();
        let report = builder.seal(ExecutionStatus::Completed);
        assert!(redundant_rpcs(&report).is_empty());
    }

    #[test]
    fn test_incomplete_rpc() {
        let mut builder = ReportBuilder::new("t/0", CompositeFaultSpecification::new());
        builder
            .record_invocation(index("Get", 1), callsite("Get"), text("a"), None)
            .unwrap();
        builder
            .record_invocation(index("Put", 1), callsite("Put"), text("b"), None)
            .unwrap();
        builder.record_completion(&index("Put", 1), returned("ok")).unwrap();
        let report = builder.seal(ExecutionStatus::Completed);

        let warnings = incomplete_rpcs(&report);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].index, index("Get", 1));
    }

    #[test]
    fn test_incomplete_rpc_skips_timeout() {
        let mut builder = ReportBuilder::new("t/0", CompositeFaultSpecification::new());
        builder
            .record_invocation(index("Get", 1), callsite("Get"), text("a"), None)
            .unwrap();
        let report = builder.seal(ExecutionStatus::TimedOut);
        assert!(incomplete_rpcs(&report).is_empty());
    }

    #[test]
    fn test_unimplemented_failures() {
        let injected = Fault::error("Status", [("code", UNIMPLEMENTED_CODE)]);
        let mut builder = ReportBuilder::new(
            "t/1",
            CompositeFaultSpecification::single(index("A", 1), injected.clone()),
        );
        builder
            .record_invocation(index("A", 1), callsite("A"), text("x"), Some(injected))
            .unwrap();
        builder
            .record_completion(&index("A", 1), Outcome::raised("Status", [("code", UNIMPLEMENTED_CODE)]))
            .unwrap();
        builder
            .record_invocation(index("B", 1), callsite("B"), text("y"), None)
            .unwrap();
        builder
            .record_completion(&index("B", 1), Outcome::raised("Status", [("code", UNIMPLEMENTED_CODE)]))
            .unwrap();
        let report = builder.seal(ExecutionStatus::Completed);

        let warnings = unimplemented_failures(&report);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].index, index("B", 1));
    }

    #[test]
    fn test_multiple_invocations_for_mutations() {
        let byzantine = Fault::byzantine(Transformer::CharShift, 0);
        let mut builder = ReportBuilder::new(
            "t/2",
            CompositeFaultSpecification::single(index("Lookup", 1), byzantine.clone()),
        );
        builder
            .record_invocation(index("Lookup", 1), callsite("Lookup"), text("q"), Some(byzantine))
            .unwrap();
        builder
            .record_completion(
                &index("Lookup", 1),
                Outcome::Transformed {
                    original: text("customer-00042"),
                    mutated: text("customer-00043"),
                },
            )
            .unwrap();
        for (ordinal, request) in [(1, "customer-00042/profile"), (2, "customer-00043/profile")] {
            let i = index("Profile", ordinal);
            builder
                .record_invocation(i.clone(), callsite("Profile"), text(request), None)
                .unwrap();
            builder.record_completion(&i, returned("p")).unwrap();
        }
        let report = builder.seal(ExecutionStatus::Completed);

        let warnings = multiple_invocations_for_mutations(&report);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].index, index("Profile", 2));
        assert_eq!(warnings[0].related, Some(index("Profile", 1)));
    }

    #[test]
    fn test_multiple_invocations_needs_byzantine_assignment() {
        let mut builder = ReportBuilder::new("t/0", CompositeFaultSpecification::new());
        for (ordinal, request) in [(1, "customer-00042/profile"), (2, "customer-00043/profile")] {
            let i = index("Profile", ordinal);
            builder
                .record_invocation(i.clone(), callsite("Profile"), text(request), None)
                .unwrap();
            builder.record_completion(&i, returned("p")).unwrap();
        }
        let report = builder.seal(ExecutionStatus::Completed);
        assert!(multiple_invocations_for_mutations(&report).is_empty());
    }

    #[test]
    fn test_analyze_all_is_idempotent() {
        let mut builder = ReportBuilder::new("t/0", CompositeFaultSpecification::new());
        for ordinal in 1..=2 {
            let i = index("Get", ordinal);
            builder
                .record_invocation(i.clone(), callsite("Get"), text("same"), None)
                .unwrap();
            builder.record_completion(&i, returned("same")).unwrap();
        }
        builder
            .record_invocation(index("Put", 1), callsite("Put"), text("x"), None)
            .unwrap();
        let report = builder.seal(ExecutionStatus::Completed);

        let first = analyze_all(&report);
        let second = analyze_all(&report);
        assert_eq!(first, second);
        assert!(!first.is_empty());
        assert_eq!(ANALYZERS.len(), 5);
    }
}
