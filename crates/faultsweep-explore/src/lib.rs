//! Fault-space exploration for instrumented RPC systems.
//!
//! A test is first run fault-free.  Every remote call it makes is reported
//! by instrumentation, named by a [distributed execution index], and
//! recorded in a report.  From each finished report the orchestrator
//! proposes further executions of the same test, each assigning faults to
//! indices already observed, and runs them until nothing new is left:
//!
//! ```text
//! 1. Queue the baseline (empty assignment)
//! 2. Dequeue an execution, run the test
//!      every call → record_invocation → (index, fault decision)
//!                 → record_completion / transform_response
//! 3. Finalize: seal the report, run the analyzers
//! 4. Propose executions for the calls it saw (scheduler)
//! 5. Drop assignments scheduled before, promote and queue the rest
//! 6. Repeat from 2 until the queue is empty and nothing runs
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use faultsweep_explore::Orchestrator;
//! use faultsweep_fault::{AnalysisConfigurationFile, Callsite, DistributedExecutionIndex, Payload};
//! use faultsweep_trace::Outcome;
//!
//! let orchestrator = Orchestrator::new();
//! let config = AnalysisConfigurationFile::grpc_default().unwrap();
//! let cycle = orchestrator.start_execution_cycle("checkout", config).unwrap();
//!
//! for execution in cycle {
//!     let callsite = Callsite::new("frontend", "shop.Cart", "Get", ["shop.CartRequest"]).unwrap();
//!     let (index, decision) = orchestrator
//!         .record_invocation(
//!             execution.id(),
//!             &DistributedExecutionIndex::root(),
//!             &callsite,
//!             Payload::Text("cart-1".into()),
//!         )
//!         .unwrap();
//!     // ... act on `decision`, make the call ...
//!     orchestrator
//!         .record_completion(
//!             execution.id(),
//!             &index,
//!             Outcome::Returned { payload: Payload::Text("ok".into()) },
//!         )
//!         .unwrap();
//!     orchestrator.finalize_execution(execution.id()).unwrap();
//! }
//! ```
//!
//! # Module Structure
//!
//! - [`execution`]: Test and execution ids, abstract and concrete executions
//! - [`scheduler`]: Candidate executions derived from a finished report
//! - [`context`]: Per-test queue, dedup collection and running executions
//! - [`orchestrator`]: Registry of tests and the token-based interface
//! - [`error`]: Errors and how far they reach
//!
//! # Determinism
//!
//! Indices depend only on the call structure of an execution, so the same
//! test run twice under the same assignment yields the same indices and
//! the same faults at the same calls.
//!
//! [distributed execution index]: faultsweep_fault::DistributedExecutionIndex

pub mod context;
pub mod error;
pub mod execution;
pub mod orchestrator;
pub mod scheduler;

pub use context::{
    ExplorationState, ExplorationSummary, TestContext, TestExecutionCollection,
    TestExecutionQueue, TestExecutionStack,
};
pub use error::{ErrorKind, ExploreError};
pub use execution::{
    AbstractTestExecution, ConcreteTestExecution, ExecutionId, PromotionError, TestId,
};
pub use orchestrator::{CallsiteDescriptor, ExecutionCycle, InvocationTicket, Orchestrator};
pub use scheduler::propose_executions;
