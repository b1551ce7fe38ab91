//! Per-test exploration state.
//!
//! A [`TestContext`] owns everything one logical test accumulates while
//! its fault space is explored:
//!
//! ```text
//!  TestExecutionQueue ──pop──→ running executions ──finalize──→ reports
//!         ↑                     (stack, counter,                  │
//!         │                      report builder)                  │
//!         └──push── TestExecutionCollection ←──dedup── proposals ←┘
//! ```
//!
//! It is created when a test starts its execution cycle and dropped on
//! teardown.  Each running execution sits behind its own lock, so
//! concurrent calls within one execution contend only with each other;
//! the queue and the dedup collection have separate locks shared by the
//! dequeuer and candidate generation.
//!
//! An execution counts as in flight from the moment it is dequeued until
//! its candidates are queued.  The queue and that count share one lock,
//! and the test is drained only when both are empty under it.

use crate::error::ExploreError;
use crate::execution::{AbstractTestExecution, ConcreteTestExecution, ExecutionId, TestId};
use crate::scheduler::propose_executions;
use faultsweep_fault::{
    AnalysisConfigurationFile, Callsite, DistributedExecutionIndex, Fault, FaultDecision,
    OccurrenceCounter, Payload, SearchStrategy,
};
use faultsweep_trace::{
    analyze_all, ExecutionStatus, Outcome, ReportBuilder, ReportError, TestExecutionReport,
    Warning,
};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of one test's exploration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplorationState {
    /// The fault-free baseline has not finished yet.
    CollectingBaseline,
    /// Running queued executions and generating new ones.
    Exploring,
    /// Nothing queued, nothing running, nothing left to propose.
    Drained,
}

impl fmt::Display for ExplorationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExplorationState::CollectingBaseline => write!(f, "collecting-baseline"),
            ExplorationState::Exploring => write!(f, "exploring"),
            ExplorationState::Drained => write!(f, "drained"),
        }
    }
}

// ── Stack ───────────────────────────────────────────────────────────

/// Calls of one execution that have been invoked but not completed.
///
/// A completion pops the most recent matching invocation.
#[derive(Debug, Clone, Default)]
pub struct TestExecutionStack {
    in_flight: Vec<DistributedExecutionIndex>,
}

impl TestExecutionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: DistributedExecutionIndex) {
        self.in_flight.push(index);
    }

    /// Remove `index`, searching from the top.  Returns whether it was in flight.
    pub fn pop(&mut self, index: &DistributedExecutionIndex) -> bool {
        match self.in_flight.iter().rposition(|i| i == index) {
            Some(position) => {
                self.in_flight.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn top(&self) -> Option<&DistributedExecutionIndex> {
        self.in_flight.last()
    }

    pub fn in_flight(&self) -> &[DistributedExecutionIndex] {
        &self.in_flight
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

// ── Queue ───────────────────────────────────────────────────────────

/// Executions waiting to run, ordered by the search strategy.
#[derive(Debug)]
pub struct TestExecutionQueue {
    strategy: SearchStrategy,
    pending: VecDeque<ConcreteTestExecution>,
}

impl TestExecutionQueue {
    pub fn new(strategy: SearchStrategy) -> Self {
        Self {
            strategy,
            pending: VecDeque::new(),
        }
    }

    pub fn push(&mut self, execution: ConcreteTestExecution) {
        self.pending.push_back(execution);
    }

    /// Next execution: oldest first for breadth-first, newest first for
    /// depth-first.
    pub fn pop(&mut self) -> Option<ConcreteTestExecution> {
        match self.strategy {
            SearchStrategy::BreadthFirst => self.pending.pop_front(),
            SearchStrategy::DepthFirst => self.pending.pop_back(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ── Collection ──────────────────────────────────────────────────────

/// Every execution ever scheduled, keyed by full fault assignment.
#[derive(Debug, Default)]
pub struct TestExecutionCollection {
    scheduled: BTreeMap<String, ExecutionId>,
}

impl TestExecutionCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.scheduled.contains_key(fingerprint)
    }

    /// Record `execution`; `false` if its assignment was already scheduled.
    pub fn insert(&mut self, execution: &ConcreteTestExecution) -> bool {
        let fingerprint = execution.fingerprint();
        if self.scheduled.contains_key(&fingerprint) {
            return false;
        }
        self.scheduled.insert(fingerprint, execution.id().clone());
        true
    }

    /// Execution scheduled for this assignment fingerprint.
    pub fn get(&self, fingerprint: &str) -> Option<&ExecutionId> {
        self.scheduled.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }
}

// ── Backlog ─────────────────────────────────────────────────────────

/// Queued executions and the number dequeued but not yet finalized.
#[derive(Debug)]
struct Backlog {
    queue: TestExecutionQueue,
    in_flight: usize,
}

impl Backlog {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight == 0
    }
}

// ── Running executions ──────────────────────────────────────────────

#[derive(Debug)]
struct RunningExecution {
    execution: ConcreteTestExecution,
    counter: OccurrenceCounter,
    stack: TestExecutionStack,
    /// `None` once sealed.
    report: Option<ReportBuilder>,
    timeout: Option<Duration>,
    failure: Option<String>,
    timed_out: bool,
}

impl RunningExecution {
    fn new(execution: ConcreteTestExecution, timeout: Option<Duration>) -> Self {
        let report = ReportBuilder::new(execution.id().to_string(), execution.assignment().clone());
        Self {
            execution,
            counter: OccurrenceCounter::new(),
            stack: TestExecutionStack::new(),
            report: Some(report),
            timeout,
            failure: None,
            timed_out: false,
        }
    }

    fn id(&self) -> &ExecutionId {
        self.execution.id()
    }

    /// Whether the wall-clock budget is spent; latches once true.
    fn check_timeout(&mut self) -> bool {
        if !self.timed_out {
            if let (Some(timeout), Some(report)) = (self.timeout, &self.report) {
                if report.elapsed() > timeout {
                    self.timed_out = true;
                    warn!(
                        "Execution {} exceeded its {:?} budget after {} calls",
                        self.id(),
                        timeout,
                        report.len()
                    );
                }
            }
        }
        self.timed_out
    }

    fn ensure_healthy(&self) -> Result<(), ExploreError> {
        match &self.failure {
            Some(reason) => Err(ExploreError::ExecutionFailed {
                execution: self.id().clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn report_mut(&mut self) -> Result<&mut ReportBuilder, ExploreError> {
        let id = self.execution.id().clone();
        self.report
            .as_mut()
            .ok_or(ExploreError::ExecutionFinalized(id))
    }

    /// Mark the execution failed; the first failure wins.
    fn fail(&mut self, reason: String) {
        warn!("Execution {} failed: {reason}", self.id());
        if self.failure.is_none() {
            self.failure = Some(reason);
        }
    }

    fn protocol_failure(
        &mut self,
        index: DistributedExecutionIndex,
        source: ReportError,
    ) -> ExploreError {
        self.fail(source.to_string());
        ExploreError::Protocol {
            execution: self.id().clone(),
            index,
            source,
        }
    }

    fn status(&self) -> ExecutionStatus {
        match (&self.failure, self.timed_out) {
            (Some(reason), _) => ExecutionStatus::Failed {
                reason: reason.clone(),
            },
            (None, true) => ExecutionStatus::TimedOut,
            (None, false) => ExecutionStatus::Completed,
        }
    }
}

// ── Summary ─────────────────────────────────────────────────────────

/// Counters describing a test's exploration so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExplorationSummary {
    pub scheduled: usize,
    pub finished: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub queued: usize,
    pub observed_indices: usize,
    pub warnings: usize,
}

impl fmt::Display for ExplorationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Executions scheduled:   {}", self.scheduled)?;
        writeln!(f, "Executions finished:    {}", self.finished)?;
        writeln!(f, "  completed:            {}", self.completed)?;
        writeln!(f, "  failed:               {}", self.failed)?;
        writeln!(f, "  timed out:            {}", self.timed_out)?;
        writeln!(f, "Still queued:           {}", self.queued)?;
        writeln!(f, "Distinct calls seen:    {}", self.observed_indices)?;
        write!(f, "Analyzer warnings:      {}", self.warnings)
    }
}

// ── Context ─────────────────────────────────────────────────────────

/// Exploration state of one logical test.
pub struct TestContext {
    test: TestId,
    config: Arc<AnalysisConfigurationFile>,
    state: Mutex<ExplorationState>,
    backlog: Mutex<Backlog>,
    collection: Mutex<TestExecutionCollection>,
    /// Every index seen in any finished execution.
    observed: RwLock<HashSet<DistributedExecutionIndex>>,
    running: RwLock<HashMap<ExecutionId, Arc<Mutex<RunningExecution>>>>,
    reports: RwLock<BTreeMap<ExecutionId, TestExecutionReport>>,
    warnings: RwLock<BTreeMap<ExecutionId, Vec<Warning>>>,
    /// Advanced only under the collection lock.
    next_sequence: AtomicU64,
}

impl TestContext {
    /// Create the context and queue the fault-free baseline execution.
    pub fn new(test: TestId, config: AnalysisConfigurationFile) -> Result<Self, ExploreError> {
        config.policy().validate()?;
        let strategy = config.policy().strategy;
        let context = Self {
            test,
            config: Arc::new(config),
            state: Mutex::new(ExplorationState::CollectingBaseline),
            backlog: Mutex::new(Backlog {
                queue: TestExecutionQueue::new(strategy),
                in_flight: 0,
            }),
            collection: Mutex::new(TestExecutionCollection::new()),
            observed: RwLock::new(HashSet::new()),
            running: RwLock::new(HashMap::new()),
            reports: RwLock::new(BTreeMap::new()),
            warnings: RwLock::new(BTreeMap::new()),
            next_sequence: AtomicU64::new(0),
        };
        context.schedule(AbstractTestExecution::baseline());
        info!(
            "Test {}: {} analysis configurations, strategy {:?}",
            context.test,
            context.config.len(),
            strategy
        );
        Ok(context)
    }

    pub fn test_id(&self) -> &TestId {
        &self.test
    }

    pub fn config(&self) -> &AnalysisConfigurationFile {
        &self.config
    }

    pub fn state(&self) -> ExplorationState {
        *self.state.lock()
    }

    pub fn is_drained(&self) -> bool {
        self.state() == ExplorationState::Drained
    }

    /// Dequeue the next execution and start tracking it.
    ///
    /// `None` when nothing is queued.  Executions still running may queue
    /// more once they are finalized.
    pub fn next_execution(&self) -> Option<ConcreteTestExecution> {
        let execution = {
            let mut backlog = self.backlog.lock();
            match backlog.queue.pop() {
                Some(execution) => {
                    backlog.in_flight += 1;
                    execution
                }
                None => {
                    self.update_drained(&backlog);
                    return None;
                }
            }
        };
        let running =
            RunningExecution::new(execution.clone(), self.config.policy().execution_timeout());
        self.running
            .write()
            .insert(execution.id().clone(), Arc::new(Mutex::new(running)));
        info!("Starting execution {execution}");
        Some(execution)
    }

    // ── Instrumentation calls ───────────────────────────────────────

    /// Index and fault decision for a call about to be made.
    ///
    /// Calls made after the execution's time budget is spent are indexed
    /// but not recorded, and always proceed.
    pub fn record_invocation(
        &self,
        execution: &ExecutionId,
        parent: &DistributedExecutionIndex,
        callsite: &Callsite,
        request: Payload,
    ) -> Result<(DistributedExecutionIndex, FaultDecision), ExploreError> {
        let running = self.running_execution(execution)?;
        let mut run = running.lock();
        run.ensure_healthy()?;

        let index = run.counter.assign(parent, callsite);
        if run.check_timeout() {
            debug!("{execution}: past timeout, not recording {index}");
            return Ok((index, FaultDecision::Proceed));
        }

        let parent_known = parent.is_root() || run.report_mut()?.entry(parent).is_some();
        if !parent_known {
            return Err(run.protocol_failure(
                parent.clone(),
                ReportError::UnknownIndex {
                    index: parent.clone(),
                },
            ));
        }

        let fault = run.execution.fault_for(&index).cloned();
        let decision = fault
            .as_ref()
            .map(Fault::decision)
            .unwrap_or(FaultDecision::Proceed);
        match &fault {
            Some(fault) => debug!("{execution}: injecting {fault} at {}", callsite.rpc_method()),
            None => debug!("{execution}: {} proceeds", callsite.rpc_method()),
        }

        let recorded =
            run.report_mut()?
                .record_invocation(index.clone(), callsite.clone(), request, fault);
        if let Err(source) = recorded {
            return Err(run.protocol_failure(index, source));
        }
        run.stack.push(index.clone());
        Ok((index, decision))
    }

    /// Record the outcome of a call.
    pub fn record_completion(
        &self,
        execution: &ExecutionId,
        index: &DistributedExecutionIndex,
        outcome: Outcome,
    ) -> Result<(), ExploreError> {
        let running = self.running_execution(execution)?;
        let mut run = running.lock();
        run.ensure_healthy()?;

        if run.check_timeout() {
            debug!("{execution}: past timeout, dropping outcome for {index}");
            return Ok(());
        }

        let recorded = run.report_mut()?.record_completion(index, outcome);
        match recorded {
            Ok(()) => {
                run.stack.pop(index);
                Ok(())
            }
            Err(source) => Err(run.protocol_failure(index.clone(), source)),
        }
    }

    /// Apply the byzantine fault assigned at `index` to the real response
    /// and record the completion.  Returns the corrupted payload.
    pub fn transform_response(
        &self,
        execution: &ExecutionId,
        index: &DistributedExecutionIndex,
        original: Payload,
    ) -> Result<Payload, ExploreError> {
        let running = self.running_execution(execution)?;
        let mut run = running.lock();
        run.ensure_healthy()?;

        if run.check_timeout() {
            return Ok(original);
        }

        let Some(Fault::Byzantine {
            transformer,
            accumulator,
        }) = run.execution.fault_for(index).cloned()
        else {
            run.fail(format!("no byzantine fault assigned at {index}"));
            return Err(ExploreError::NoTransformAssigned {
                execution: execution.clone(),
                index: index.clone(),
            });
        };

        let mutated = match transformer.transform(&original, &accumulator) {
            Ok((mutated, _)) => mutated,
            Err(source) => {
                run.fail(source.to_string());
                return Err(ExploreError::Transform {
                    execution: execution.clone(),
                    index: index.clone(),
                    source,
                });
            }
        };
        debug!("{execution}: {transformer} turned {original} into {mutated}");

        let outcome = Outcome::Transformed {
            original,
            mutated: mutated.clone(),
        };
        match run.report_mut()?.record_completion(index, outcome) {
            Ok(()) => {
                run.stack.pop(index);
                Ok(mutated)
            }
            Err(source) => Err(run.protocol_failure(index.clone(), source)),
        }
    }

    // ── Finalization ────────────────────────────────────────────────

    /// Seal the execution's report, run the analyzers and schedule the
    /// executions it leads to.
    ///
    /// Returns once candidate generation is done, so [`is_drained`]
    /// reflects this execution afterwards.
    ///
    /// [`is_drained`]: TestContext::is_drained
    pub fn finalize_execution(
        &self,
        execution: &ExecutionId,
    ) -> Result<TestExecutionReport, ExploreError> {
        let running = self.running_execution(execution)?;

        // Sealed and stored under the execution's lock, so a concurrent
        // call sees either the open report or the finished one.
        let (report, source) = {
            let mut run = running.lock();
            run.check_timeout();
            let status = run.status();
            if status == ExecutionStatus::Completed && !run.stack.is_empty() {
                warn!(
                    "Execution {execution} finished with {} calls in flight",
                    run.stack.len()
                );
            }
            let builder = run
                .report
                .take()
                .ok_or_else(|| ExploreError::ExecutionFinalized(execution.clone()))?;
            let report = builder.seal(status);
            self.reports.write().insert(execution.clone(), report.clone());
            (report, run.execution.clone())
        };
        self.running.write().remove(execution);
        info!(
            "Execution {execution} {}: {} calls, {} faults injected",
            report.status,
            report.len(),
            report.injected().count()
        );

        let warnings = analyze_all(&report);
        for warning in &warnings {
            debug!("{execution}: {warning}");
        }

        self.warnings.write().insert(execution.clone(), warnings);

        if !report.is_failed() {
            self.generate_candidates(&report, &source);
        }
        self.retire();
        Ok(report)
    }

    /// Drop one execution from the in-flight count once its candidates
    /// are queued.
    fn retire(&self) {
        let mut backlog = self.backlog.lock();
        backlog.in_flight = backlog.in_flight.saturating_sub(1);
        {
            let mut state = self.state.lock();
            if *state == ExplorationState::CollectingBaseline {
                *state = ExplorationState::Exploring;
            }
        }
        self.update_drained(&backlog);
    }

    fn generate_candidates(&self, report: &TestExecutionReport, source: &ConcreteTestExecution) {
        let fresh: HashSet<DistributedExecutionIndex> = {
            let mut observed = self.observed.write();
            report
                .entries()
                .iter()
                .filter(|entry| observed.insert(entry.index.clone()))
                .map(|entry| entry.index.clone())
                .collect()
        };

        let proposals = propose_executions(report, source, &self.config, &fresh);
        let proposed = proposals.len();
        let scheduled = proposals
            .into_iter()
            .filter(|proposal| self.schedule(proposal.clone()))
            .count();
        info!(
            "Execution {}: {} new calls, {scheduled}/{proposed} proposals scheduled, {} queued",
            source.id(),
            fresh.len(),
            self.queued()
        );
    }

    /// Promote and queue `proposal` unless its assignment was scheduled
    /// before or the execution cap is reached.
    fn schedule(&self, proposal: AbstractTestExecution) -> bool {
        let mut collection = self.collection.lock();
        if collection.contains(&proposal.fingerprint()) {
            debug!("Already scheduled: {}", proposal.assignment());
            return false;
        }
        if let Some(max) = self.config.policy().max_executions {
            if collection.len() >= max {
                debug!("Execution cap {max} reached, dropping {}", proposal.assignment());
                return false;
            }
        }

        let id = ExecutionId::new(self.test.clone(), self.next_sequence.load(Ordering::Relaxed));
        let promoted = {
            let observed = self.observed.read();
            proposal.promote(&observed, id)
        };
        match promoted {
            Ok(execution) => {
                self.next_sequence.fetch_add(1, Ordering::Relaxed);
                collection.insert(&execution);
                self.backlog.lock().queue.push(execution);
                true
            }
            Err(e) => {
                debug!("Not scheduling: {e}");
                false
            }
        }
    }

    /// Called with the backlog locked, so nothing can be queued or
    /// dequeued between the check and the transition.
    fn update_drained(&self, backlog: &Backlog) {
        let mut state = self.state.lock();
        if backlog.is_idle() && *state == ExplorationState::Exploring {
            *state = ExplorationState::Drained;
            info!("Test {} drained", self.test);
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn report(&self, execution: &ExecutionId) -> Option<TestExecutionReport> {
        self.reports.read().get(execution).cloned()
    }

    pub fn warnings(&self, execution: &ExecutionId) -> Option<Vec<Warning>> {
        self.warnings.read().get(execution).cloned()
    }

    /// Reports of every finished execution, in execution order.
    pub fn reports(&self) -> Vec<TestExecutionReport> {
        self.reports.read().values().cloned().collect()
    }

    pub fn queued(&self) -> usize {
        self.backlog.lock().queue.len()
    }

    /// Executions dequeued whose finalization has not completed.
    pub fn in_flight(&self) -> usize {
        self.backlog.lock().in_flight
    }

    /// Whether any fault was injected so far in `execution`.
    pub fn fault_injected(&self, execution: &ExecutionId) -> Result<bool, ExploreError> {
        self.injected_where(execution, |_| true)
    }

    /// Whether a fault was injected on a call to `service`.
    pub fn fault_injected_on_service(
        &self,
        execution: &ExecutionId,
        service: &str,
    ) -> Result<bool, ExploreError> {
        self.injected_where(execution, |callsite| callsite.service() == service)
    }

    /// Whether a fault was injected on `declaring_type`'s `method`,
    /// e.g. `("shop.Cart", "Get")`.
    pub fn fault_injected_on_method(
        &self,
        execution: &ExecutionId,
        declaring_type: &str,
        method: &str,
    ) -> Result<bool, ExploreError> {
        self.injected_where(execution, |callsite| {
            callsite.declaring_type() == declaring_type && callsite.method() == method
        })
    }

    /// Answered from the open report while the execution runs, from the
    /// sealed one afterwards.
    fn injected_where(
        &self,
        execution: &ExecutionId,
        matches: impl Fn(&Callsite) -> bool,
    ) -> Result<bool, ExploreError> {
        let running = self.running.read().get(execution).cloned();
        if let Some(running) = running {
            let run = running.lock();
            if let Some(report) = &run.report {
                return Ok(report.injected().any(|entry| matches(&entry.callsite)));
            }
        }
        let found = self
            .reports
            .read()
            .get(execution)
            .map(|report| report.injected().any(|entry| matches(&entry.callsite)));
        found.ok_or_else(|| self.missing(execution))
    }

    pub fn scheduled(&self) -> usize {
        self.collection.lock().len()
    }

    pub fn summary(&self) -> ExplorationSummary {
        let reports = self.reports.read();
        ExplorationSummary {
            scheduled: self.scheduled(),
            finished: reports.len(),
            completed: reports
                .values()
                .filter(|r| r.status == ExecutionStatus::Completed)
                .count(),
            failed: reports.values().filter(|r| r.is_failed()).count(),
            timed_out: reports.values().filter(|r| r.is_timed_out()).count(),
            queued: self.queued(),
            observed_indices: self.observed.read().len(),
            warnings: self.warnings.read().values().map(Vec::len).sum(),
        }
    }

    fn running_execution(
        &self,
        execution: &ExecutionId,
    ) -> Result<Arc<Mutex<RunningExecution>>, ExploreError> {
        let running = self.running.read().get(execution).cloned();
        running.ok_or_else(|| self.missing(execution))
    }

    fn missing(&self, execution: &ExecutionId) -> ExploreError {
        if self.reports.read().contains_key(execution) {
            ExploreError::ExecutionFinalized(execution.clone())
        } else {
            ExploreError::UnknownExecution(execution.clone())
        }
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("test", &self.test)
            .field("state", &self.state())
            .field("queued", &self.queued())
            .field("scheduled", &self.scheduled())
            .finish()
    }
}
