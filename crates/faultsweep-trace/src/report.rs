//! Execution reports.
//!
//! A [`ReportBuilder`] collects the calls of one running execution in
//! invocation order, append-only.  [`ReportBuilder::seal`] turns it into
//! an immutable [`TestExecutionReport`], which is what analyzers and the
//! scheduler consume.

use faultsweep_fault::{
    Callsite, CompositeFaultSpecification, DistributedExecutionIndex, Fault, Payload,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Instrumentation protocol violations.  Fatal to one execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("index {index} invoked twice")]
    DuplicateInvocation { index: DistributedExecutionIndex },

    #[error("unknown index {index}")]
    UnknownIndex { index: DistributedExecutionIndex },

    #[error("index {index} completed twice")]
    DuplicateCompletion { index: DistributedExecutionIndex },
}

// ═══════════════════════════════════════════════════════════════════════
//  Entries
// ═══════════════════════════════════════════════════════════════════════

/// What came back from a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The call returned normally.
    Returned { payload: Payload },
    /// The call raised an error, injected or organic.
    Raised {
        name: String,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
    },
    /// The call returned and a byzantine fault corrupted the response.
    Transformed { original: Payload, mutated: Payload },
    /// The execution ended without the call ever completing.
    Dropped,
}

impl Outcome {
    pub fn raised<K, V>(name: impl Into<String>, metadata: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Outcome::Raised {
            name: name.into(),
            metadata: metadata
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Payload the caller actually received.
    pub fn response(&self) -> Option<&Payload> {
        match self {
            Outcome::Returned { payload } => Some(payload),
            Outcome::Transformed { mutated, .. } => Some(mutated),
            Outcome::Raised { .. } | Outcome::Dropped => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Raised { .. })
    }

    /// Status code of a raised error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Outcome::Raised { metadata, .. } => metadata.get("code").map(String::as_str),
            _ => None,
        }
    }

    /// Whether this outcome is exactly what `fault` raises.
    pub fn matches_fault(&self, fault: &Fault) -> bool {
        match (self, fault) {
            (
                Outcome::Raised { name, metadata },
                Fault::Error {
                    name: fault_name,
                    metadata: fault_metadata,
                },
            ) => name == fault_name && metadata == fault_metadata,
            _ => false,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Returned { payload } => write!(f, "returned {payload}"),
            Outcome::Raised { name, metadata } => match metadata.get("code") {
                Some(code) if !code.is_empty() => write!(f, "raised {name} [{code}]"),
                _ => write!(f, "raised {name}"),
            },
            Outcome::Transformed { original, mutated } => {
                write!(f, "transformed {original} → {mutated}")
            }
            Outcome::Dropped => write!(f, "dropped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub outcome: Outcome,
    /// Offset from the start of the execution.
    pub completed_at: Duration,
}

/// One call made during an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub index: DistributedExecutionIndex,
    pub callsite: Callsite,
    pub request: Payload,
    /// Fault injected at this call, if any.
    pub fault: Option<Fault>,
    /// Offset from the start of the execution.
    pub invoked_at: Duration,
    pub completion: Option<Completion>,
}

impl ReportEntry {
    /// Index of the enclosing call (the root for top-level calls).
    pub fn parent(&self) -> DistributedExecutionIndex {
        self.index.parent().unwrap_or_default()
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.completion.as_ref().map(|c| &c.outcome)
    }

    /// Whether a real outcome was observed for this call.
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome(), Some(outcome) if *outcome != Outcome::Dropped)
    }

    /// Whether the call failed without an injected fault explaining it.
    pub fn is_organic_failure(&self) -> bool {
        match (self.outcome(), &self.fault) {
            (Some(outcome), None) => outcome.is_error(),
            (Some(outcome), Some(fault)) => outcome.is_error() && !outcome.matches_fault(fault),
            (None, _) => false,
        }
    }

    pub fn latency(&self) -> Option<Duration> {
        self.completion
            .as_ref()
            .map(|c| c.completed_at.saturating_sub(self.invoked_at))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Status and sealed report
// ═══════════════════════════════════════════════════════════════════════

/// Terminal (or current) state of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed { reason: String },
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed { reason } => write!(f, "failed: {reason}"),
            ExecutionStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Immutable record of one finished execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestExecutionReport {
    /// Execution token this report belongs to.
    pub execution: String,
    /// Fault assignment the execution ran under.
    pub assignment: CompositeFaultSpecification,
    pub status: ExecutionStatus,
    /// Wall-clock duration of the execution.
    pub duration: Duration,
    entries: Vec<ReportEntry>,
}

impl TestExecutionReport {
    /// Calls in invocation order.
    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn entry(&self, index: &DistributedExecutionIndex) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| &e.index == index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries where a fault was actually injected.
    pub fn injected(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.fault.is_some())
    }

    /// Assigned faults whose index never showed up in this execution.
    pub fn uninjected(&self) -> Vec<&DistributedExecutionIndex> {
        self.assignment
            .indices()
            .filter(|index| self.entry(index).is_none())
            .collect()
    }

    pub fn is_timed_out(&self) -> bool {
        self.status == ExecutionStatus::TimedOut
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ExecutionStatus::Failed { .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Builder
// ═══════════════════════════════════════════════════════════════════════

/// Append-only report of an execution in progress.
#[derive(Debug)]
pub struct ReportBuilder {
    execution: String,
    assignment: CompositeFaultSpecification,
    started: Instant,
    entries: Vec<ReportEntry>,
    positions: HashMap<DistributedExecutionIndex, usize>,
}

impl ReportBuilder {
    pub fn new(execution: impl Into<String>, assignment: CompositeFaultSpecification) -> Self {
        Self {
            execution: execution.into(),
            assignment,
            started: Instant::now(),
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn assignment(&self) -> &CompositeFaultSpecification {
        &self.assignment
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record_invocation(
        &mut self,
        index: DistributedExecutionIndex,
        callsite: Callsite,
        request: Payload,
        fault: Option<Fault>,
    ) -> Result<(), ReportError> {
        if self.positions.contains_key(&index) {
            return Err(ReportError::DuplicateInvocation { index });
        }
        self.positions.insert(index.clone(), self.entries.len());
        self.entries.push(ReportEntry {
            index,
            callsite,
            request,
            fault,
            invoked_at: self.elapsed(),
            completion: None,
        });
        Ok(())
    }

    pub fn record_completion(
        &mut self,
        index: &DistributedExecutionIndex,
        outcome: Outcome,
    ) -> Result<(), ReportError> {
        let completed_at = self.elapsed();
        let Some(&position) = self.positions.get(index) else {
            return Err(ReportError::UnknownIndex {
                index: index.clone(),
            });
        };
        let entry = &mut self.entries[position];
        if entry.completion.is_some() {
            return Err(ReportError::DuplicateCompletion {
                index: index.clone(),
            });
        }
        entry.completion = Some(Completion {
            outcome,
            completed_at,
        });
        Ok(())
    }

    pub fn entry(&self, index: &DistributedExecutionIndex) -> Option<&ReportEntry> {
        self.positions.get(index).map(|&p| &self.entries[p])
    }

    /// Entries recorded so far that carried a fault.
    pub fn injected(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.fault.is_some())
    }

    /// Seal the report.
    ///
    /// Calls still in flight are recorded as [`Outcome::Dropped`], except
    /// for timed-out executions, whose partial entries stay open.
    pub fn seal(self, status: ExecutionStatus) -> TestExecutionReport {
        let duration = self.elapsed();
        let mut entries = self.entries;
        if status != ExecutionStatus::TimedOut {
            for entry in entries.iter_mut().filter(|e| e.completion.is_none()) {
                entry.completion = Some(Completion {
                    outcome: Outcome::Dropped,
                    completed_at: duration,
                });
            }
        }
        TestExecutionReport {
            execution: self.execution,
            assignment: self.assignment,
            status,
            duration,
            entries,
        }
    }
}
