//! Byzantine payload transformers.
//!
//! A [`Transformer`] corrupts a real response payload instead of
//! suppressing it.  Transformation is a pure function of
//! `(original, accumulator)`:
//!
//! ```text
//! transform(original, acc₀) → (mutation₀, acc₁)
//! transform(original, acc₁) → (mutation₁, acc₂)   mutation₁ ≠ mutation₀
//! transform(original, acc₀) → (mutation₀, acc₁)   same input, same output
//! ```
//!
//! Successive accumulators walk a progression of distinct mutations (a new
//! bit, a new character position, ...) until the payload has none left.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Mixes the step into the accumulator seed so each step draws a fresh stream.
const STEP_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Lowest and highest printable ASCII characters used as replacements.
const PRINTABLE_LOW: u8 = 33;
const PRINTABLE_HIGH: u8 = 126;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("{transformer} expects a {expected} payload, got {found}")]
    PayloadMismatch {
        transformer: Transformer,
        expected: PayloadKind,
        found: PayloadKind,
    },

    #[error("{transformer} cannot transform this value: {reason}")]
    UnsupportedValue {
        transformer: Transformer,
        reason: String,
    },

    #[error("{transformer} given an empty payload")]
    EmptyPayload { transformer: Transformer },

    #[error("{transformer} has no mutation left at step {step}")]
    Exhausted { transformer: Transformer, step: u32 },
}

// ── Payloads ────────────────────────────────────────────────────────

/// A request or response body as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    Structured(serde_json::Value),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Bytes(_) => PayloadKind::Bytes,
            Payload::Text(_) => PayloadKind::Text,
            Payload::Structured(_) => PayloadKind::Structured,
        }
    }

    /// Flat text rendering, used for similarity checks and reports.
    pub fn render(&self) -> String {
        match self {
            Payload::Bytes(bytes) => hex::encode(bytes),
            Payload::Text(text) => text.clone(),
            Payload::Structured(value) => value.to_string(),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bytes(bytes) => write!(f, "bytes[{}]", bytes.len()),
            Payload::Text(text) => write!(f, "{text:?}"),
            Payload::Structured(value) => write!(f, "{value}"),
        }
    }
}

/// Shape of a payload, as declared by a transformer's capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Bytes,
    Text,
    Structured,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Bytes => write!(f, "bytes"),
            PayloadKind::Text => write!(f, "text"),
            PayloadKind::Structured => write!(f, "structured"),
        }
    }
}

// ── Accumulator ─────────────────────────────────────────────────────

/// Progression state carried between applications of one transformer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Accumulator {
    /// Seed for every random choice in the progression.
    pub seed: u64,
    /// How many mutations have been produced so far.
    pub step: u32,
    /// Positions (bits, characters, fields) already mutated, in order.
    pub applied: Vec<u64>,
}

impl Accumulator {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            step: 0,
            applied: Vec::new(),
        }
    }

    fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed ^ u64::from(self.step).wrapping_mul(STEP_MIX))
    }

    fn advanced(&self, position: u64) -> Self {
        let mut applied = self.applied.clone();
        applied.push(position);
        Self {
            seed: self.seed,
            step: self.step + 1,
            applied,
        }
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Display for Accumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seed={:#x}, step={}", self.seed, self.step)
    }
}

// ── Transformers ────────────────────────────────────────────────────

/// Closed set of byzantine transformers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transformer {
    /// Flip one bit not flipped before.
    BitFlip,
    /// Shift the character at position `step`.
    CharShift,
    /// Replace a random, not yet replaced character with a random one.
    RandomChar,
    /// Swap `"true"` and `"false"`.
    BooleanFlip,
    /// Null out the `step`-th field of an object, in key order.
    NullField,
}

impl Transformer {
    /// Payload shape this transformer accepts.
    pub fn accepts(&self) -> PayloadKind {
        match self {
            Transformer::BitFlip => PayloadKind::Bytes,
            Transformer::CharShift | Transformer::RandomChar | Transformer::BooleanFlip => {
                PayloadKind::Text
            }
            Transformer::NullField => PayloadKind::Structured,
        }
    }

    /// Produce the mutation for `acc` and the accumulator for the next one.
    pub fn transform(
        &self,
        original: &Payload,
        acc: &Accumulator,
    ) -> Result<(Payload, Accumulator), TransformError> {
        let transformer = *self;
        match (self, original) {
            (Transformer::BitFlip, Payload::Bytes(bytes)) => {
                if bytes.is_empty() {
                    return Err(TransformError::EmptyPayload { transformer });
                }
                let total = bytes.len() as u64 * 8;
                let bit = pick_unapplied(&mut acc.rng(), total, &acc.applied)
                    .ok_or(self.exhausted(acc))?;
                let mut mutated = bytes.clone();
                mutated[(bit / 8) as usize] ^= 1 << (bit % 8);
                Ok((Payload::Bytes(mutated), acc.advanced(bit)))
            }
            (Transformer::CharShift, Payload::Text(text)) => {
                let mut chars: Vec<char> = text.chars().collect();
                if chars.is_empty() {
                    return Err(TransformError::EmptyPayload { transformer });
                }
                let position = acc.step as usize;
                let Some(c) = chars.get(position).copied() else {
                    return Err(self.exhausted(acc));
                };
                let shifted = (c as u32).wrapping_add(1) % 127 + u32::from(PRINTABLE_LOW);
                chars[position] = char::from_u32(shifted).unwrap_or('!');
                Ok((
                    Payload::Text(chars.into_iter().collect()),
                    acc.advanced(position as u64),
                ))
            }
            (Transformer::RandomChar, Payload::Text(text)) => {
                let mut chars: Vec<char> = text.chars().collect();
                if chars.is_empty() {
                    return Err(TransformError::EmptyPayload { transformer });
                }
                let mut rng = acc.rng();
                let position = pick_unapplied(&mut rng, chars.len() as u64, &acc.applied)
                    .ok_or(self.exhausted(acc))?;
                let current = chars[position as usize];
                let replacement = loop {
                    let candidate = char::from(rng.gen_range(PRINTABLE_LOW..=PRINTABLE_HIGH));
                    if candidate != current {
                        break candidate;
                    }
                };
                chars[position as usize] = replacement;
                Ok((
                    Payload::Text(chars.into_iter().collect()),
                    acc.advanced(position),
                ))
            }
            (Transformer::BooleanFlip, Payload::Text(text)) => {
                if acc.step > 0 {
                    return Err(self.exhausted(acc));
                }
                let flipped = match text.trim().to_ascii_lowercase().as_str() {
                    "true" => "false",
                    "false" => "true",
                    other => {
                        return Err(TransformError::UnsupportedValue {
                            transformer,
                            reason: format!("{other:?} is not a boolean"),
                        })
                    }
                };
                Ok((Payload::Text(flipped.to_string()), acc.advanced(0)))
            }
            (Transformer::NullField, Payload::Structured(value)) => {
                let serde_json::Value::Object(fields) = value else {
                    return Err(TransformError::UnsupportedValue {
                        transformer,
                        reason: "not an object".to_string(),
                    });
                };
                if fields.is_empty() {
                    return Err(TransformError::EmptyPayload { transformer });
                }
                let mut keys: Vec<&String> = fields.keys().collect();
                keys.sort();
                let position = acc.step as usize;
                let Some(key) = keys.get(position) else {
                    return Err(self.exhausted(acc));
                };
                let mut mutated = fields.clone();
                mutated.insert((*key).clone(), serde_json::Value::Null);
                Ok((
                    Payload::Structured(serde_json::Value::Object(mutated)),
                    acc.advanced(position as u64),
                ))
            }
            (_, other) => Err(TransformError::PayloadMismatch {
                transformer,
                expected: self.accepts(),
                found: other.kind(),
            }),
        }
    }

    /// Whether `transform(original, acc)` yields a further mutation.
    pub fn has_next(&self, original: &Payload, acc: &Accumulator) -> bool {
        self.transform(original, acc).is_ok()
    }

    fn exhausted(&self, acc: &Accumulator) -> TransformError {
        TransformError::Exhausted {
            transformer: *self,
            step: acc.step,
        }
    }
}

impl fmt::Display for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transformer::BitFlip => write!(f, "bit-flip"),
            Transformer::CharShift => write!(f, "char-shift"),
            Transformer::RandomChar => write!(f, "random-char"),
            Transformer::BooleanFlip => write!(f, "boolean-flip"),
            Transformer::NullField => write!(f, "null-field"),
        }
    }
}

/// Pick uniformly among positions in `0..total` not yet in `applied`.
fn pick_unapplied(rng: &mut ChaCha8Rng, total: u64, applied: &[u64]) -> Option<u64> {
    let used: BTreeSet<u64> = applied.iter().copied().filter(|p| *p < total).collect();
    let remaining = total - used.len() as u64;
    if remaining == 0 {
        return None;
    }
    let mut skip = rng.gen_range(0..remaining);
    for position in 0..total {
        if used.contains(&position) {
            continue;
        }
        if skip == 0 {
            return Some(position);
        }
        skip -= 1;
    }
    None
}
