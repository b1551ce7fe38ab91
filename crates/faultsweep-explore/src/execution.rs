//! Planned and runnable test executions.
//!
//! The scheduler proposes [`AbstractTestExecution`]s: fault assignments
//! not yet known to be injectable.  Promotion checks every assigned index
//! against the indices observed so far and yields a
//! [`ConcreteTestExecution`], which is what gets queued and run.

use crate::error::ExploreError;
use faultsweep_fault::{CompositeFaultSpecification, DistributedExecutionIndex, Fault};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of one logical test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one execution; token form `test/sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId {
    pub test: TestId,
    pub sequence: u64,
}

impl ExecutionId {
    pub fn new(test: TestId, sequence: u64) -> Self {
        Self { test, sequence }
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.test, self.sequence)
    }
}

impl FromStr for ExecutionId {
    type Err = ExploreError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| ExploreError::MalformedToken {
            token: token.to_string(),
            reason: reason.to_string(),
        };
        let (test, sequence) = token
            .rsplit_once('/')
            .ok_or_else(|| malformed("expected test/sequence"))?;
        if test.is_empty() {
            return Err(malformed("empty test id"));
        }
        let sequence = sequence
            .parse()
            .map_err(|_| malformed("sequence is not a number"))?;
        Ok(Self::new(TestId::from(test), sequence))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("index {index} has never been observed")]
pub struct PromotionError {
    pub index: DistributedExecutionIndex,
}

// ── Abstract executions ─────────────────────────────────────────────

/// A proposed fault assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbstractTestExecution {
    assignment: CompositeFaultSpecification,
    /// Execution whose report this proposal was derived from.
    source: Option<ExecutionId>,
}

impl AbstractTestExecution {
    pub fn new(assignment: CompositeFaultSpecification, source: Option<ExecutionId>) -> Self {
        Self { assignment, source }
    }

    /// The fault-free first execution of a test.
    pub fn baseline() -> Self {
        Self::new(CompositeFaultSpecification::new(), None)
    }

    pub fn assignment(&self) -> &CompositeFaultSpecification {
        &self.assignment
    }

    pub fn source(&self) -> Option<&ExecutionId> {
        self.source.as_ref()
    }

    /// Dedup key: the full fault assignment.
    pub fn fingerprint(&self) -> String {
        self.assignment.fingerprint()
    }

    /// Confirm every assigned index has been observed, and assign an id.
    pub fn promote(
        self,
        observed: &HashSet<DistributedExecutionIndex>,
        id: ExecutionId,
    ) -> Result<ConcreteTestExecution, PromotionError> {
        if let Some(index) = self.assignment.indices().find(|i| !observed.contains(*i)) {
            return Err(PromotionError {
                index: index.clone(),
            });
        }
        Ok(ConcreteTestExecution {
            id,
            assignment: self.assignment,
            source: self.source,
        })
    }
}

// ── Concrete executions ─────────────────────────────────────────────

/// A runnable fault assignment with its execution id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcreteTestExecution {
    id: ExecutionId,
    assignment: CompositeFaultSpecification,
    source: Option<ExecutionId>,
}

impl ConcreteTestExecution {
    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    pub fn assignment(&self) -> &CompositeFaultSpecification {
        &self.assignment
    }

    pub fn source(&self) -> Option<&ExecutionId> {
        self.source.as_ref()
    }

    pub fn is_baseline(&self) -> bool {
        self.assignment.is_empty()
    }

    /// Fault to inject at `index`, if any.
    pub fn fault_for(&self, index: &DistributedExecutionIndex) -> Option<&Fault> {
        self.assignment.get(index)
    }

    pub fn fingerprint(&self) -> String {
        self.assignment.fingerprint()
    }
}

impl fmt::Display for ConcreteTestExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.assignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultsweep_fault::Callsite;

    fn index(method: &str) -> DistributedExecutionIndex {
        let callsite = Callsite::new("svc", "pkg.Api", method, ["pkg.Req"]).unwrap();
        DistributedExecutionIndex::root().extend(&callsite, 1)
    }

    #[test]
    fn test_execution_id_token_round_trip() {
        let id = ExecutionId::new(TestId::from("suite/checkout"), 12);
        assert_eq!(id.to_string(), "suite/checkout/12");
        assert_eq!("suite/checkout/12".parse::<ExecutionId>().unwrap(), id);
        assert!("no-sequence".parse::<ExecutionId>().is_err());
        assert!("t/x".parse::<ExecutionId>().is_err());
        assert!("/3".parse::<ExecutionId>().is_err());
    }

    #[test]
    fn test_promote_requires_observed_indices() {
        let proposal = AbstractTestExecution::new(
            CompositeFaultSpecification::single(index("A"), Fault::latency(5)),
            None,
        );
        let id = ExecutionId::new(TestId::from("t"), 1);

        let empty = HashSet::new();
        assert_eq!(
            proposal.clone().promote(&empty, id.clone()),
            Err(PromotionError { index: index("A") })
        );

        let observed: HashSet<_> = [index("A")].into_iter().collect();
        let concrete = proposal.promote(&observed, id.clone()).unwrap();
        assert_eq!(concrete.id(), &id);
        assert_eq!(concrete.fault_for(&index("A")), Some(&Fault::latency(5)));
        assert!(!concrete.is_baseline());
    }

    #[test]
    fn test_baseline_promotes_trivially() {
        let concrete = AbstractTestExecution::baseline()
            .promote(&HashSet::new(), ExecutionId::new(TestId::from("t"), 0))
            .unwrap();
        assert!(concrete.is_baseline());
        assert_eq!(concrete.fingerprint(), "");
    }
}
