//! Candidate generation: which executions a finished report leads to.
//!
//! Given the sealed report of an execution and the analysis configuration,
//! [`propose_executions`] lists the abstract executions worth running next:
//!
//! - **Single-fault** (default): every index seen for the first time gets
//!   one proposal per candidate fault, each assigning just that fault.
//! - **Combinatorial**: every index not already faulted extends the
//!   source execution's assignment by one fault, up to
//!   `max_faults_per_execution`.
//! - **Byzantine progression**: a transformed call whose transformer has
//!   further mutations is proposed again with the next accumulator.
//!
//! Deduplication against executions already scheduled happens in the
//! caller; proposals here may repeat earlier ones.

use crate::execution::{AbstractTestExecution, ConcreteTestExecution};
use faultsweep_fault::{
    AnalysisConfigurationFile, CompositeFaultSpecification, DistributedExecutionIndex, Fault,
};
use faultsweep_trace::{Outcome, ReportEntry, TestExecutionReport};
use log::debug;
use std::collections::HashSet;

/// Abstract executions derived from `report`, the report of `source`.
///
/// `fresh` holds the indices of `report` that no earlier report contained.
pub fn propose_executions(
    report: &TestExecutionReport,
    source: &ConcreteTestExecution,
    config: &AnalysisConfigurationFile,
    fresh: &HashSet<DistributedExecutionIndex>,
) -> Vec<AbstractTestExecution> {
    if report.is_failed() {
        return Vec::new();
    }

    let policy = config.policy();
    let base = if policy.combinatorial {
        source.assignment().clone()
    } else {
        CompositeFaultSpecification::new()
    };

    let mut proposals = Vec::new();
    if base.len() < policy.fault_limit() {
        for entry in report.entries() {
            if source.assignment().contains(&entry.index) {
                continue;
            }
            if !policy.combinatorial && !fresh.contains(&entry.index) {
                continue;
            }
            for fault in config.candidate_faults(&entry.callsite) {
                if policy.avoid_redundant_injections && fails_organically(entry, &fault) {
                    debug!(
                        "{} already fails with {fault} on its own, skipping",
                        entry.callsite.rpc_method()
                    );
                    continue;
                }
                match base.with(entry.index.clone(), fault) {
                    Ok(assignment) => proposals.push(AbstractTestExecution::new(
                        assignment,
                        Some(source.id().clone()),
                    )),
                    Err(e) => debug!("Skipping proposal: {e}"),
                }
            }
        }
    }

    proposals.extend(byzantine_progressions(report, source));
    proposals
}

/// Proposals that advance each transformed call to its next mutation.
fn byzantine_progressions(
    report: &TestExecutionReport,
    source: &ConcreteTestExecution,
) -> Vec<AbstractTestExecution> {
    let mut proposals = Vec::new();
    for entry in report.injected() {
        let (
            Some(Fault::Byzantine {
                transformer,
                accumulator,
            }),
            Some(Outcome::Transformed { original, .. }),
        ) = (&entry.fault, entry.outcome())
        else {
            continue;
        };
        let Ok((_, next)) = transformer.transform(original, accumulator) else {
            continue;
        };
        if !transformer.has_next(original, &next) {
            debug!("{transformer} exhausted at {}", entry.index);
            continue;
        }
        let assignment = source.assignment().with_replaced(
            entry.index.clone(),
            Fault::Byzantine {
                transformer: *transformer,
                accumulator: next,
            },
        );
        proposals.push(AbstractTestExecution::new(
            assignment,
            Some(source.id().clone()),
        ));
    }
    proposals
}

/// Whether the call already raised exactly what `fault` would raise,
/// without anything being injected.
fn fails_organically(entry: &ReportEntry, fault: &Fault) -> bool {
    entry.fault.is_none()
        && entry
            .outcome()
            .is_some_and(|outcome| outcome.matches_fault(fault))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionId, TestId};
    use faultsweep_fault::{
        AnalysisConfiguration, Callsite, ExplorationPolicy, Payload, Transformer,
    };
    use faultsweep_trace::{ExecutionStatus, ReportBuilder};

    fn callsite(method: &str) -> Callsite {
        Callsite::new("api", "shop.Cart", method, ["shop.Req"]).unwrap()
    }

    fn index(method: &str) -> DistributedExecutionIndex {
        DistributedExecutionIndex::root().extend(&callsite(method), 1)
    }

    fn unavailable() -> Fault {
        Fault::error("Status", [("code", "UNAVAILABLE")])
    }

    fn config(policy: ExplorationPolicy) -> AnalysisConfigurationFile {
        AnalysisConfigurationFile::new(policy)
            .unwrap()
            .with(
                AnalysisConfiguration::builder("all")
                    .pattern(".*")
                    .exception("Status", [("code", "UNAVAILABLE")])
                    .latency(10)
                    .build()
                    .unwrap(),
            )
            .unwrap()
    }

    fn execution(sequence: u64, assignment: CompositeFaultSpecification) -> ConcreteTestExecution {
        let observed = assignment.indices().cloned().collect();
        AbstractTestExecution::new(assignment, None)
            .promote(&observed, ExecutionId::new(TestId::from("t"), sequence))
            .unwrap()
    }

    fn report_for(source: &ConcreteTestExecution, calls: &[(&str, Outcome)]) -> TestExecutionReport {
        let mut builder = ReportBuilder::new(source.id().to_string(), source.assignment().clone());
        for (method, outcome) in calls {
            let i = index(method);
            builder
                .record_invocation(
                    i.clone(),
                    callsite(method),
                    Payload::Text("req".into()),
                    source.fault_for(&i).cloned(),
                )
                .unwrap();
            builder.record_completion(&i, outcome.clone()).unwrap();
        }
        builder.seal(ExecutionStatus::Completed)
    }

    fn ok() -> Outcome {
        Outcome::Returned {
            payload: Payload::Text("ok".into()),
        }
    }

    #[test]
    fn test_single_fault_proposals_for_fresh_indices() {
        let baseline = execution(0, CompositeFaultSpecification::new());
        let report = report_for(&baseline, &[("A", ok()), ("B", ok())]);
        let fresh: HashSet<_> = [index("A")].into_iter().collect();

        let proposals =
            propose_executions(&report, &baseline, &config(ExplorationPolicy::default()), &fresh);
        assert_eq!(proposals.len(), 2);
        for proposal in &proposals {
            assert_eq!(proposal.assignment().len(), 1);
            assert!(proposal.assignment().contains(&index("A")));
            assert_eq!(proposal.source(), Some(baseline.id()));
        }
    }

    #[test]
    fn test_single_fault_never_composes() {
        let faulted = execution(1, CompositeFaultSpecification::single(index("A"), unavailable()));
        let report = report_for(
            &faulted,
            &[("A", Outcome::raised("Status", [("code", "UNAVAILABLE")])), ("B", ok())],
        );
        let fresh: HashSet<_> = [index("B")].into_iter().collect();

        let proposals =
            propose_executions(&report, &faulted, &config(ExplorationPolicy::default()), &fresh);
        assert_eq!(proposals.len(), 2);
        assert!(proposals.iter().all(|p| p.assignment().len() == 1));
        assert!(proposals.iter().all(|p| !p.assignment().contains(&index("A"))));
    }

    #[test]
    fn test_combinatorial_extends_source_assignment() {
        let policy = ExplorationPolicy {
            combinatorial: true,
            ..Default::default()
        };
        let faulted = execution(1, CompositeFaultSpecification::single(index("A"), unavailable()));
        let report = report_for(
            &faulted,
            &[("A", Outcome::raised("Status", [("code", "UNAVAILABLE")])), ("B", ok())],
        );

        let proposals = propose_executions(&report, &faulted, &config(policy), &HashSet::new());
        assert_eq!(proposals.len(), 2);
        for proposal in &proposals {
            assert_eq!(proposal.assignment().len(), 2);
            assert_eq!(proposal.assignment().get(&index("A")), Some(&unavailable()));
        }
    }

    #[test]
    fn test_combinatorial_respects_fault_limit() {
        let policy = ExplorationPolicy {
            combinatorial: true,
            max_faults_per_execution: Some(1),
            ..Default::default()
        };
        let faulted = execution(1, CompositeFaultSpecification::single(index("A"), unavailable()));
        let report = report_for(&faulted, &[("A", ok()), ("B", ok())]);
        assert!(propose_executions(&report, &faulted, &config(policy), &HashSet::new()).is_empty());
    }

    #[test]
    fn test_organic_failure_bypass() {
        let baseline = execution(0, CompositeFaultSpecification::new());
        let report = report_for(
            &baseline,
            &[("A", Outcome::raised("Status", [("code", "UNAVAILABLE")]))],
        );
        let fresh: HashSet<_> = [index("A")].into_iter().collect();

        let proposals =
            propose_executions(&report, &baseline, &config(ExplorationPolicy::default()), &fresh);
        assert_eq!(proposals.len(), 1);
        assert_eq!(
            proposals[0].assignment().get(&index("A")),
            Some(&Fault::latency(10))
        );

        let keep_all = ExplorationPolicy {
            avoid_redundant_injections: false,
            ..Default::default()
        };
        assert_eq!(
            propose_executions(&report, &baseline, &config(keep_all), &fresh).len(),
            2
        );
    }

    #[test]
    fn test_failed_reports_propose_nothing() {
        let baseline = execution(0, CompositeFaultSpecification::new());
        let mut builder = ReportBuilder::new("t/0", CompositeFaultSpecification::new());
        builder
            .record_invocation(index("A"), callsite("A"), Payload::Text("r".into()), None)
            .unwrap();
        let report = builder.seal(ExecutionStatus::Failed {
            reason: "duplicate completion".into(),
        });
        let fresh: HashSet<_> = [index("A")].into_iter().collect();
        assert!(propose_executions(
            &report,
            &baseline,
            &config(ExplorationPolicy::default()),
            &fresh
        )
        .is_empty());
    }

    #[test]
    fn test_byzantine_progression() {
        let fault = Fault::byzantine(Transformer::CharShift, 0);
        let faulted = execution(2, CompositeFaultSpecification::single(index("A"), fault));
        let original = Payload::Text("abc".into());
        let report = report_for(
            &faulted,
            &[(
                "A",
                Outcome::Transformed {
                    original: original.clone(),
                    mutated: Payload::Text("xbc".into()),
                },
            )],
        );

        let proposals = propose_executions(
            &report,
            &faulted,
            &config(ExplorationPolicy::default()),
            &HashSet::new(),
        );
        assert_eq!(proposals.len(), 1);
        match proposals[0].assignment().get(&index("A")) {
            Some(Fault::Byzantine { accumulator, .. }) => assert_eq!(accumulator.step, 1),
            other => panic!("expected byzantine fault, got {other:?}"),
        }
    }
}
