//! Distributed execution indices.
//!
//! A [`DistributedExecutionIndex`] names "the same logical call" across
//! repeated executions of one test.  It is a chain of
//! `(call-site key, occurrence ordinal)` pairs, one per hop from the test
//! root down to the call, so two executions that follow identical control
//! flow up to a call assign it the identical index no matter which faults
//! were injected elsewhere.
//!
//! ```text
//! test root
//!  └─ Frontend/get(Request)          [["V1-aa..-11..", 1]]
//!      ├─ Store/read(Key)  #1        [["V1-aa..-11..", 1], ["V1-bb..-22..", 1]]
//!      └─ Store/read(Key)  #2        [["V1-aa..-11..", 1], ["V1-bb..-22..", 2]]
//! ```
//!
//! Indices cross process boundaries as stable string tokens (see
//! [`DistributedExecutionIndex::to_token`]).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of hex characters kept from each SHA-256 digest in a key.
const DIGEST_HEX_LEN: usize = 16;

/// Version tag prefixed to every call-site key.
const KEY_VERSION: &str = "V1";

/// Errors raised while building or parsing indices.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeiError {
    #[error("call-site metadata missing: {field}")]
    MissingCallsiteMetadata { field: &'static str },

    #[error("malformed execution index token: {reason}")]
    MalformedToken { reason: String },
}

/// Transport family of an instrumented call.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RpcType {
    #[default]
    Grpc,
    Http,
}

impl fmt::Display for RpcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcType::Grpc => write!(f, "grpc"),
            RpcType::Http => write!(f, "http"),
        }
    }
}

// ── Call sites ──────────────────────────────────────────────────────

/// Static description of the place a call is made from.
///
/// Supplied by the instrumentation layer for every outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Callsite {
    service: String,
    declaring_type: String,
    method: String,
    parameter_types: Vec<String>,
    rpc_type: RpcType,
}

impl Callsite {
    /// Build a call site, rejecting absent metadata.
    ///
    /// An empty service, declaring type or method means signature
    /// resolution failed at the instrumentation boundary.
    pub fn new<I, S>(
        service: impl Into<String>,
        declaring_type: impl Into<String>,
        method: impl Into<String>,
        parameter_types: I,
    ) -> Result<Self, DeiError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let service = service.into();
        let declaring_type = declaring_type.into();
        let method = method.into();
        if service.trim().is_empty() {
            return Err(DeiError::MissingCallsiteMetadata { field: "service" });
        }
        if declaring_type.trim().is_empty() {
            return Err(DeiError::MissingCallsiteMetadata {
                field: "declaring_type",
            });
        }
        if method.trim().is_empty() {
            return Err(DeiError::MissingCallsiteMetadata { field: "method" });
        }
        Ok(Self {
            service,
            declaring_type,
            method,
            parameter_types: parameter_types.into_iter().map(Into::into).collect(),
            rpc_type: RpcType::default(),
        })
    }

    /// Set the transport family.
    pub fn with_rpc_type(mut self, rpc_type: RpcType) -> Self {
        self.rpc_type = rpc_type;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn declaring_type(&self) -> &str {
        &self.declaring_type
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn parameter_types(&self) -> &[String] {
        &self.parameter_types
    }

    pub fn rpc_type(&self) -> RpcType {
        self.rpc_type
    }

    /// Fully qualified RPC method, the text analysis patterns match against.
    ///
    /// gRPC methods read `package.Service/Method`, HTTP client calls read
    /// `Client.VERB`.
    pub fn rpc_method(&self) -> String {
        match self.rpc_type {
            RpcType::Grpc => format!("{}/{}", self.declaring_type, self.method),
            RpcType::Http => format!("{}.{}", self.declaring_type, self.method),
        }
    }

    /// Signature including argument shapes.
    pub fn signature(&self) -> String {
        format!("{}({})", self.rpc_method(), self.parameter_types.join(","))
    }

    /// Compact, stable key for this call site.
    pub fn key(&self) -> CallsiteKey {
        CallsiteKey(format!(
            "{KEY_VERSION}-{}-{}",
            digest(&self.service),
            digest(&self.signature())
        ))
    }
}

impl fmt::Display for Callsite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.signature(), self.service)
    }
}

fn digest(text: &str) -> String {
    let hash = Sha256::digest(text.as_bytes());
    let mut encoded = hex::encode(hash);
    encoded.truncate(DIGEST_HEX_LEN);
    encoded
}

/// Opaque identifier of a call site inside an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallsiteKey(String);

impl CallsiteKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallsiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Indices ─────────────────────────────────────────────────────────

/// Deterministic fingerprint of one logical call.
///
/// Ordering and hashing are structural over the chain, so indices can key
/// ordered and hashed maps alike.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(try_from = "Vec<(String, u32)>", into = "Vec<(String, u32)>")]
pub struct DistributedExecutionIndex {
    chain: Vec<(CallsiteKey, u32)>,
}

impl DistributedExecutionIndex {
    /// The index of the test itself; parent of every top-level call.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.chain.is_empty()
    }

    /// Index of the `ordinal`-th call from `callsite` under `self`.
    ///
    /// Pure: the result depends only on the arguments.  Ordinals start at 1.
    pub fn extend(&self, callsite: &Callsite, ordinal: u32) -> Self {
        debug_assert!(ordinal >= 1, "occurrence ordinals start at 1");
        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.extend(self.chain.iter().cloned());
        chain.push((callsite.key(), ordinal));
        Self { chain }
    }

    /// Index of the enclosing call, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.chain.is_empty() {
            return None;
        }
        Some(Self {
            chain: self.chain[..self.chain.len() - 1].to_vec(),
        })
    }

    /// Innermost hop.
    pub fn last(&self) -> Option<(&CallsiteKey, u32)> {
        self.chain.last().map(|(key, ordinal)| (key, *ordinal))
    }

    pub fn ordinal(&self) -> Option<u32> {
        self.last().map(|(_, ordinal)| ordinal)
    }

    /// Number of hops from the root.
    pub fn depth(&self) -> usize {
        self.chain.len()
    }

    /// Whether `self` lies strictly above `other` in the call tree.
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.chain.len() < other.chain.len() && other.chain.starts_with(&self.chain)
    }

    /// Stable string form, `[["<key>",<ordinal>],...]`.
    pub fn to_token(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DistributedExecutionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = serde_json::to_string(&self.chain).map_err(|_| fmt::Error)?;
        f.write_str(&token)
    }
}

impl FromStr for DistributedExecutionIndex {
    type Err = DeiError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let chain: Vec<(String, u32)> =
            serde_json::from_str(token).map_err(|e| DeiError::MalformedToken {
                reason: e.to_string(),
            })?;
        Self::try_from(chain)
    }
}

impl TryFrom<Vec<(String, u32)>> for DistributedExecutionIndex {
    type Error = DeiError;

    fn try_from(chain: Vec<(String, u32)>) -> Result<Self, Self::Error> {
        let mut parsed = Vec::with_capacity(chain.len());
        for (key, ordinal) in chain {
            if key.is_empty() {
                return Err(DeiError::MalformedToken {
                    reason: "empty call-site key".to_string(),
                });
            }
            if ordinal == 0 {
                return Err(DeiError::MalformedToken {
                    reason: format!("ordinal 0 for key {key}"),
                });
            }
            parsed.push((CallsiteKey(key), ordinal));
        }
        Ok(Self { chain: parsed })
    }
}

impl From<DistributedExecutionIndex> for Vec<(String, u32)> {
    fn from(index: DistributedExecutionIndex) -> Self {
        index
            .chain
            .into_iter()
            .map(|(key, ordinal)| (key.0, ordinal))
            .collect()
    }
}

// ── Occurrence counting ─────────────────────────────────────────────

/// Per-execution counter that hands out occurrence ordinals.
///
/// Ordinals count calls from the same call site under the same parent, so
/// loop iterations get distinct indices while sibling scopes stay
/// independent.
#[derive(Debug, Clone, Default)]
pub struct OccurrenceCounter {
    seen: BTreeMap<(DistributedExecutionIndex, CallsiteKey), u32>,
}

impl OccurrenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the index for the next call from `callsite` under `parent`.
    pub fn assign(
        &mut self,
        parent: &DistributedExecutionIndex,
        callsite: &Callsite,
    ) -> DistributedExecutionIndex {
        let count = self
            .seen
            .entry((parent.clone(), callsite.key()))
            .or_insert(0);
        *count += 1;
        parent.extend(callsite, *count)
    }

    /// Number of distinct `(parent, call site)` scopes seen.
    pub fn scopes(&self) -> usize {
        self.seen.len()
    }
}
