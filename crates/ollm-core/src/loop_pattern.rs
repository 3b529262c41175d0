//! Loop pattern type emitted by the loop detector.

use serde::{Deserialize, Serialize};

/// The kind of repetition the loop detector caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopPatternKind {
    /// The same `(name, canonical args)` fingerprint repeated `count` times in a row.
    RepeatedTool,
    /// The same output string repeated `count` times in a row.
    RepeatedOutput,
    /// The turn counter reached the configured maximum.
    TurnLimit,
}

/// A one-shot stop signal emitted by the loop detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopPattern {
    /// Which rule tripped.
    #[serde(rename = "type")]
    pub kind: LoopPatternKind,
    /// Human-readable explanation.
    pub details: String,
    /// The integer that crossed the threshold.
    pub count: usize,
}
