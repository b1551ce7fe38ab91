//! Registry of running tests.
//!
//! The test-integration layer talks to one [`Orchestrator`]:
//!
//! ```text
//!  test harness                         instrumented clients
//!      │                                        │
//!      │ start_execution_cycle ──→ ExecutionCycle (iterator)
//!      │                                        │
//!      │   for each execution:                  │ record_invocation → (index, decision)
//!      │     run the test ─────────────────────→│ record_completion / transform_response
//!      │     finalize_execution                 │
//!      │                                        │
//!      │ teardown                               │
//! ```
//!
//! Instrumented clients in other processes carry execution ids and
//! indices as string tokens; [`Orchestrator::report_invocation`] and
//! [`Orchestrator::report_outcome`] accept those directly.

use crate::context::{ExplorationSummary, TestContext};
use crate::error::ExploreError;
use crate::execution::{ConcreteTestExecution, ExecutionId, TestId};
use faultsweep_fault::{
    AnalysisConfigurationFile, Callsite, DeiError, DistributedExecutionIndex, FaultDecision,
    Payload, RpcType,
};
use faultsweep_trace::{Outcome, TestExecutionReport, Warning};
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Iterator over the executions of one test.
///
/// Yields `None` once the queue is empty.  Executions are expected to be
/// finalized before the next one is requested; a harness running several
/// executions concurrently should poll [`Orchestrator::is_drained`]
/// instead of stopping at the first `None`.
#[derive(Debug, Clone)]
pub struct ExecutionCycle {
    context: Arc<TestContext>,
}

impl ExecutionCycle {
    pub fn test_id(&self) -> &TestId {
        self.context.test_id()
    }

    pub fn context(&self) -> &TestContext {
        &self.context
    }
}

impl Iterator for ExecutionCycle {
    type Item = ConcreteTestExecution;

    fn next(&mut self) -> Option<Self::Item> {
        self.context.next_execution()
    }
}

/// Call-site metadata as reported by an instrumented client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallsiteDescriptor {
    pub service: String,
    pub declaring_type: String,
    pub method: String,
    #[serde(default)]
    pub parameter_types: Vec<String>,
    #[serde(default)]
    pub rpc_type: RpcType,
}

impl CallsiteDescriptor {
    pub fn resolve(&self) -> Result<Callsite, DeiError> {
        Ok(Callsite::new(
            self.service.as_str(),
            self.declaring_type.as_str(),
            self.method.as_str(),
            self.parameter_types.iter().map(String::as_str),
        )?
        .with_rpc_type(self.rpc_type))
    }
}

/// Answer to a token-form invocation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationTicket {
    /// Token of the index assigned to the call; the parent of any call
    /// made while serving it.
    pub index: String,
    pub decision: FaultDecision,
}

/// Registry of the tests currently being explored.
#[derive(Debug, Default)]
pub struct Orchestrator {
    tests: RwLock<HashMap<TestId, Arc<TestContext>>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `test` and queue its baseline execution.
    pub fn start_execution_cycle(
        &self,
        test: impl Into<TestId>,
        config: AnalysisConfigurationFile,
    ) -> Result<ExecutionCycle, ExploreError> {
        let test = test.into();
        let mut tests = self.tests.write();
        if tests.contains_key(&test) {
            return Err(ExploreError::TestAlreadyStarted(test));
        }
        let context = Arc::new(TestContext::new(test.clone(), config)?);
        tests.insert(test, Arc::clone(&context));
        Ok(ExecutionCycle { context })
    }

    /// Index and fault decision for a call about to be made.
    pub fn record_invocation(
        &self,
        execution: &ExecutionId,
        parent: &DistributedExecutionIndex,
        callsite: &Callsite,
        request: Payload,
    ) -> Result<(DistributedExecutionIndex, FaultDecision), ExploreError> {
        self.context(&execution.test)?
            .record_invocation(execution, parent, callsite, request)
    }

    pub fn record_completion(
        &self,
        execution: &ExecutionId,
        index: &DistributedExecutionIndex,
        outcome: Outcome,
    ) -> Result<(), ExploreError> {
        self.context(&execution.test)?
            .record_completion(execution, index, outcome)
    }

    /// Corrupt the real response of a call assigned a byzantine fault.
    pub fn transform_response(
        &self,
        execution: &ExecutionId,
        index: &DistributedExecutionIndex,
        response: Payload,
    ) -> Result<Payload, ExploreError> {
        self.context(&execution.test)?
            .transform_response(execution, index, response)
    }

    pub fn finalize_execution(
        &self,
        execution: &ExecutionId,
    ) -> Result<TestExecutionReport, ExploreError> {
        self.context(&execution.test)?.finalize_execution(execution)
    }

    pub fn is_drained(&self, test: &TestId) -> Result<bool, ExploreError> {
        Ok(self.context(test)?.is_drained())
    }

    pub fn report(&self, execution: &ExecutionId) -> Option<TestExecutionReport> {
        self.context(&execution.test).ok()?.report(execution)
    }

    pub fn warnings(&self, execution: &ExecutionId) -> Option<Vec<Warning>> {
        self.context(&execution.test).ok()?.warnings(execution)
    }

    /// Whether `execution` has had any fault injected so far.
    pub fn fault_injected(&self, execution: &ExecutionId) -> Result<bool, ExploreError> {
        self.context(&execution.test)?.fault_injected(execution)
    }

    pub fn fault_injected_on_service(
        &self,
        execution: &ExecutionId,
        service: &str,
    ) -> Result<bool, ExploreError> {
        self.context(&execution.test)?
            .fault_injected_on_service(execution, service)
    }

    pub fn fault_injected_on_method(
        &self,
        execution: &ExecutionId,
        declaring_type: &str,
        method: &str,
    ) -> Result<bool, ExploreError> {
        self.context(&execution.test)?
            .fault_injected_on_method(execution, declaring_type, method)
    }

    pub fn summary(&self, test: &TestId) -> Result<ExplorationSummary, ExploreError> {
        Ok(self.context(test)?.summary())
    }

    /// Drop all state of `test`.
    pub fn teardown(&self, test: &TestId) -> Result<ExplorationSummary, ExploreError> {
        let context = self
            .tests
            .write()
            .remove(test)
            .ok_or_else(|| ExploreError::UnknownTest(test.clone()))?;
        if !context.is_drained() {
            warn!("Tearing down test {test} before exploration drained");
        }
        let summary = context.summary();
        info!(
            "Test {test} torn down after {} executions ({} failed, {} timed out)",
            summary.finished, summary.failed, summary.timed_out
        );
        Ok(summary)
    }

    // ── Token interface ─────────────────────────────────────────────

    /// [`record_invocation`](Self::record_invocation) with the execution
    /// and parent given as tokens.
    pub fn report_invocation(
        &self,
        execution: &str,
        parent: &str,
        callsite: &CallsiteDescriptor,
        request: Payload,
    ) -> Result<InvocationTicket, ExploreError> {
        let execution: ExecutionId = execution.parse()?;
        let parent = parse_index(parent)?;
        let callsite = callsite
            .resolve()
            .map_err(|source| ExploreError::IndexGeneration {
                execution: execution.clone(),
                source,
            })?;
        let (index, decision) = self.record_invocation(&execution, &parent, &callsite, request)?;
        Ok(InvocationTicket {
            index: index.to_token(),
            decision,
        })
    }

    pub fn report_outcome(
        &self,
        execution: &str,
        index: &str,
        outcome: Outcome,
    ) -> Result<(), ExploreError> {
        let execution: ExecutionId = execution.parse()?;
        let index = parse_index(index)?;
        self.record_completion(&execution, &index, outcome)
    }

    pub fn report_response(
        &self,
        execution: &str,
        index: &str,
        response: Payload,
    ) -> Result<Payload, ExploreError> {
        let execution: ExecutionId = execution.parse()?;
        let index = parse_index(index)?;
        self.transform_response(&execution, &index, response)
    }

    fn context(&self, test: &TestId) -> Result<Arc<TestContext>, ExploreError> {
        self.tests
            .read()
            .get(test)
            .cloned()
            .ok_or_else(|| ExploreError::UnknownTest(test.clone()))
    }
}

fn parse_index(token: &str) -> Result<DistributedExecutionIndex, ExploreError> {
    token.parse().map_err(|e: DeiError| ExploreError::MalformedToken {
        token: token.to_string(),
        reason: e.to_string(),
    })
}
