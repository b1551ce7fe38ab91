//! Execution indices, faults and analysis configuration for faultsweep.
//!
//! This crate holds the leaf data model the orchestrator is built on:
//!
//! 1. **[`dei`]**: Distributed execution indices: stable names for
//!    logical calls across repeated executions of a test
//! 2. **[`faults`]**: The closed set of faults (clean error, latency,
//!    byzantine) and the decision handed to an instrumented client
//! 3. **[`transformer`]**: Byzantine payload transformers with
//!    reproducible mutation progressions
//! 4. **[`spec`]**: Per-execution fault assignments and fault keys
//! 5. **[`config`]**: Analysis configuration: which faults apply to
//!    which call sites, and the exploration policy
//!
//! # Flow
//!
//! ```text
//! instrumented client        orchestrator                 this crate
//! ───────────────────        ────────────                 ──────────
//! about to call      ──→  record_invocation()  ──→  OccurrenceCounter::assign()
//!                                              ──→  CompositeFaultSpecification::get()
//!                    ←──  FaultDecision
//! execution done     ──→  finalize_execution() ──→  AnalysisConfigurationFile::candidate_faults()
//! ```

pub mod config;
pub mod dei;
pub mod faults;
pub mod spec;
pub mod transformer;

pub use config::{
    AnalysisConfiguration, AnalysisConfigurationFile, ConfigError, ExplorationPolicy,
    SearchStrategy,
};
pub use dei::{Callsite, CallsiteKey, DeiError, DistributedExecutionIndex, OccurrenceCounter, RpcType};
pub use faults::{Fault, FaultCategory, FaultDecision};
pub use spec::{CompositeFaultKey, CompositeFaultSpecification, FaultKey, SingleFaultKey, SpecError};
pub use transformer::{Accumulator, Payload, PayloadKind, TransformError, Transformer};
