//! Fault assignments for one execution.
//!
//! A [`CompositeFaultSpecification`] maps execution indices to the fault
//! injected there.  It is consulted on every instrumented call, so lookup
//! goes through a hash map; insertion order is kept for reporting.

use crate::dei::DistributedExecutionIndex;
use crate::faults::Fault;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("index {index} already has fault {existing}")]
    DuplicateIndex {
        index: DistributedExecutionIndex,
        existing: Fault,
    },
}

// ── Fault keys ──────────────────────────────────────────────────────

/// Key naming one faulted call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SingleFaultKey {
    pub index: DistributedExecutionIndex,
}

/// Key naming several faulted calls at once; order-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeFaultKey {
    indices: Vec<DistributedExecutionIndex>,
}

impl CompositeFaultKey {
    pub fn new(indices: impl IntoIterator<Item = DistributedExecutionIndex>) -> Self {
        let mut indices: Vec<_> = indices.into_iter().collect();
        indices.sort();
        indices.dedup();
        Self { indices }
    }

    pub fn indices(&self) -> &[DistributedExecutionIndex] {
        &self.indices
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKey {
    Single(SingleFaultKey),
    Composite(CompositeFaultKey),
}

impl FaultKey {
    /// Whether `index` is one of the faulted calls this key names.
    pub fn covers(&self, index: &DistributedExecutionIndex) -> bool {
        match self {
            FaultKey::Single(key) => &key.index == index,
            FaultKey::Composite(key) => key.indices.binary_search(index).is_ok(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FaultKey::Single(_) => 1,
            FaultKey::Composite(key) => key.indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Specifications ──────────────────────────────────────────────────

/// One `(index, fault)` pair, the serialized form of a specification entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub index: DistributedExecutionIndex,
    pub fault: Fault,
}

/// Assignment of at most one fault per index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Assignment>", into = "Vec<Assignment>")]
pub struct CompositeFaultSpecification {
    faults: IndexMap<DistributedExecutionIndex, Fault>,
}

impl CompositeFaultSpecification {
    /// The empty assignment, used by baseline executions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assignment of a single fault.
    pub fn single(index: DistributedExecutionIndex, fault: Fault) -> Self {
        let mut faults = IndexMap::with_capacity(1);
        faults.insert(index, fault);
        Self { faults }
    }

    /// Add a fault, rejecting a second fault at the same index.
    pub fn insert(&mut self, index: DistributedExecutionIndex, fault: Fault) -> Result<(), SpecError> {
        if let Some(existing) = self.faults.get(&index) {
            return Err(SpecError::DuplicateIndex {
                index,
                existing: existing.clone(),
            });
        }
        self.faults.insert(index, fault);
        Ok(())
    }

    /// Copy of `self` extended with one more fault.
    pub fn with(&self, index: DistributedExecutionIndex, fault: Fault) -> Result<Self, SpecError> {
        let mut extended = self.clone();
        extended.insert(index, fault)?;
        Ok(extended)
    }

    /// Copy of `self` with the fault at an already-assigned index swapped.
    ///
    /// Unassigned indices are added.
    pub fn with_replaced(&self, index: DistributedExecutionIndex, fault: Fault) -> Self {
        let mut replaced = self.clone();
        replaced.faults.insert(index, fault);
        replaced
    }

    pub fn get(&self, index: &DistributedExecutionIndex) -> Option<&Fault> {
        self.faults.get(index)
    }

    pub fn contains(&self, index: &DistributedExecutionIndex) -> bool {
        self.faults.contains_key(index)
    }

    pub fn len(&self) -> usize {
        self.faults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DistributedExecutionIndex, &Fault)> {
        self.faults.iter()
    }

    pub fn indices(&self) -> impl Iterator<Item = &DistributedExecutionIndex> {
        self.faults.keys()
    }

    /// Key covering every faulted index, `None` for the empty assignment.
    pub fn key(&self) -> Option<FaultKey> {
        match self.faults.len() {
            0 => None,
            1 => self.faults.keys().next().map(|index| {
                FaultKey::Single(SingleFaultKey {
                    index: index.clone(),
                })
            }),
            _ => Some(FaultKey::Composite(CompositeFaultKey::new(
                self.faults.keys().cloned(),
            ))),
        }
    }

    /// Canonical form of the full assignment, independent of insertion order.
    ///
    /// Two specifications have equal fingerprints exactly when they assign
    /// the same faults to the same indices.
    pub fn fingerprint(&self) -> String {
        let mut entries: Vec<String> = self
            .faults
            .iter()
            .map(|(index, fault)| format!("{index}={fault:?}"))
            .collect();
        entries.sort();
        entries.join(";")
    }
}

impl fmt::Display for CompositeFaultSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.faults.is_empty() {
            return write!(f, "{{no faults}}");
        }
        write!(f, "{{")?;
        for (i, (index, fault)) in self.faults.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{index} → {fault}")?;
        }
        write!(f, "}}")
    }
}

impl TryFrom<Vec<Assignment>> for CompositeFaultSpecification {
    type Error = SpecError;

    fn try_from(assignments: Vec<Assignment>) -> Result<Self, Self::Error> {
        let mut spec = Self::new();
        for Assignment { index, fault } in assignments {
            spec.insert(index, fault)?;
        }
        Ok(spec)
    }
}

impl From<CompositeFaultSpecification> for Vec<Assignment> {
    fn from(spec: CompositeFaultSpecification) -> Self {
        spec.faults
            .into_iter()
            .map(|(index, fault)| Assignment { index, fault })
            .collect()
    }
}
