//! Fault type definitions.
//!
//! Each fault variant is one way an instrumented call can be made to
//! misbehave.  Clean faults are deterministic: the same DEI and fault
//! always raise the same error.  Byzantine faults never raise; they hand
//! back a corrupted copy of the real response.

use crate::transformer::{Accumulator, Transformer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A fault that can be assigned to one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fault {
    // ── Clean faults ────────────────────────────────────────────
    /// Raise an error (exception or error status) instead of calling.
    Error {
        /// Error type, e.g. `io.grpc.StatusRuntimeException`.
        name: String,
        /// Error details such as `code` and `cause`.
        #[serde(default)]
        metadata: BTreeMap<String, String>,
    },

    /// Delay the call, then let it proceed.
    Latency {
        /// Added delay in milliseconds.
        milliseconds: u64,
    },

    // ── Byzantine faults ────────────────────────────────────────
    /// Corrupt the real response payload.
    Byzantine {
        transformer: Transformer,
        #[serde(default)]
        accumulator: Accumulator,
    },
}

impl Fault {
    /// Convenience constructor for an error fault.
    pub fn error<K, V>(name: impl Into<String>, metadata: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Fault::Error {
            name: name.into(),
            metadata: metadata
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn latency(milliseconds: u64) -> Self {
        Fault::Latency { milliseconds }
    }

    pub fn byzantine(transformer: Transformer, seed: u64) -> Self {
        Fault::Byzantine {
            transformer,
            accumulator: Accumulator::new(seed),
        }
    }

    /// Classify this fault by category.
    pub fn category(&self) -> FaultCategory {
        match self {
            Fault::Error { .. } => FaultCategory::Clean,
            Fault::Latency { .. } => FaultCategory::Latency,
            Fault::Byzantine { .. } => FaultCategory::Byzantine,
        }
    }

    /// Status code carried in the metadata, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Fault::Error { metadata, .. } => metadata
                .get("code")
                .map(String::as_str)
                .filter(|code| !code.is_empty()),
            _ => None,
        }
    }

    /// What the instrumented client has to do for this fault.
    pub fn decision(&self) -> FaultDecision {
        match self {
            Fault::Error { name, metadata } => FaultDecision::Raise {
                name: name.clone(),
                metadata: metadata.clone(),
            },
            Fault::Latency { milliseconds } => FaultDecision::Delay {
                milliseconds: *milliseconds,
            },
            Fault::Byzantine {
                transformer,
                accumulator,
            } => FaultDecision::Transform {
                transformer: *transformer,
                accumulator: accumulator.clone(),
            },
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Error { name, metadata } => {
                write!(f, "error({name}")?;
                for (key, value) in metadata {
                    write!(f, ", {key}={value}")?;
                }
                write!(f, ")")
            }
            Fault::Latency { milliseconds } => write!(f, "latency(+{milliseconds}ms)"),
            Fault::Byzantine {
                transformer,
                accumulator,
            } => write!(f, "byzantine({transformer}, {accumulator})"),
        }
    }
}

/// Broad category for a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCategory {
    Clean,
    Latency,
    Byzantine,
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCategory::Clean => write!(f, "clean"),
            FaultCategory::Latency => write!(f, "latency"),
            FaultCategory::Byzantine => write!(f, "byzantine"),
        }
    }
}

/// Answer to "what happens to this call?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum FaultDecision {
    /// Make the call untouched.
    Proceed,
    /// Do not call; raise this error.
    Raise {
        name: String,
        metadata: BTreeMap<String, String>,
    },
    /// Sleep, then make the call.
    Delay { milliseconds: u64 },
    /// Make the call, then corrupt the response.
    Transform {
        transformer: Transformer,
        accumulator: Accumulator,
    },
}

impl FaultDecision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, FaultDecision::Proceed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unavailable() -> Fault {
        Fault::error(
            "io.grpc.StatusRuntimeException",
            [("code", "UNAVAILABLE"), ("cause", "")],
        )
    }

    #[test]
    fn test_fault_category_classification() {
        assert_eq!(unavailable().category(), FaultCategory::Clean);
        assert_eq!(Fault::latency(50).category(), FaultCategory::Latency);
        assert_eq!(
            Fault::byzantine(Transformer::BitFlip, 1).category(),
            FaultCategory::Byzantine
        );
    }

    #[test]
    fn test_fault_display() {
        assert_eq!(
            unavailable().to_string(),
            "error(io.grpc.StatusRuntimeException, cause=, code=UNAVAILABLE)"
        );
        assert_eq!(Fault::latency(250).to_string(), "latency(+250ms)");
        assert_eq!(
            Fault::byzantine(Transformer::CharShift, 16).to_string(),
            "byzantine(char-shift, seed=0x10, step=0)"
        );
    }

    #[test]
    fn test_fault_code() {
        assert_eq!(unavailable().code(), Some("UNAVAILABLE"));
        assert_eq!(Fault::error("Timeout", [("code", "")]).code(), None);
        assert_eq!(Fault::latency(1).code(), None);
    }

    #[test]
    fn test_fault_decision_mapping() {
        match unavailable().decision() {
            FaultDecision::Raise { name, metadata } => {
                assert_eq!(name, "io.grpc.StatusRuntimeException");
                assert_eq!(metadata["code"], "UNAVAILABLE");
            }
            other => panic!("unexpected decision {other:?}"),
        }
        assert_eq!(
            Fault::latency(10).decision(),
            FaultDecision::Delay { milliseconds: 10 }
        );
        assert!(FaultDecision::Proceed.is_proceed());
    }

    #[test]
    fn test_fault_serde_shape() {
        let json = serde_json::to_value(Fault::latency(5)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "latency", "milliseconds": 5}));
        let parsed: Fault = serde_json::from_value(serde_json::json!({
            "type": "byzantine",
            "transformer": "bit_flip"
        }))
        .unwrap();
        assert_eq!(parsed, Fault::byzantine(Transformer::BitFlip, 0));
    }
}
