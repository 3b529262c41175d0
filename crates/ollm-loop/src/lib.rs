//! Online loop detector.
//!
//! A small state machine over the stream of tool calls, tool outputs, and
//! turns an agent loop produces. Detects three patterns — repeated tool
//! calls, repeated outputs, and turn-limit exhaustion — and emits an
//! at-most-one stop signal per conversation.
//!
//! Must be driven from a single logical agent loop; it does not serialize
//! concurrent callers itself (see the crate's concurrency notes upstream).

#![deny(unsafe_code)]
#![warn(clippy::all)]

use ollm_core::message::canonical_json;
use ollm_core::{LoopPattern, LoopPatternKind};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::debug;

/// Tunable thresholds for the detector.
#[derive(Debug, Clone, Copy)]
pub struct LoopThresholds {
    /// Turn count at which `turn-limit` fires.
    pub max_turns: usize,
    /// Consecutive repeat count at which `repeated-tool` / `repeated-output` fire.
    pub repeat_threshold: usize,
}

impl Default for LoopThresholds {
    fn default() -> Self {
        Self {
            max_turns: 50,
            repeat_threshold: 3,
        }
    }
}

/// Partial update applied by [`LoopDetector::configure`].
#[derive(Debug, Clone, Default)]
pub struct LoopConfig {
    /// New `enabled` flag, if present.
    pub enabled: Option<bool>,
    /// New maximum turn count, if present.
    pub max_turns: Option<usize>,
    /// New repeat threshold, if present.
    pub repeat_threshold: Option<usize>,
}

type Listener = Box<dyn FnMut(&LoopPattern) + Send>;

/// Detects repeated-tool, repeated-output, and turn-limit loop patterns.
pub struct LoopDetector {
    enabled: bool,
    thresholds: LoopThresholds,
    tool_fingerprints: VecDeque<(String, String)>,
    outputs: VecDeque<String>,
    turn_count: usize,
    stopped: Option<LoopPattern>,
    listeners: Vec<Listener>,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(LoopThresholds::default())
    }
}

impl LoopDetector {
    /// Construct a detector with the given thresholds, enabled by default.
    #[must_use]
    pub fn new(thresholds: LoopThresholds) -> Self {
        Self {
            enabled: true,
            thresholds,
            tool_fingerprints: VecDeque::new(),
            outputs: VecDeque::new(),
            turn_count: 0,
            stopped: None,
            listeners: Vec::new(),
        }
    }

    /// Record that a new turn started.
    pub fn record_turn(&mut self) {
        self.turn_count = self.turn_count.saturating_add(1);
    }

    /// Record a tool call by name and arguments.
    pub fn record_tool_call(&mut self, name: &str, args: &Value) {
        let fingerprint = (name.to_string(), canonical_json(args));
        self.tool_fingerprints.push_back(fingerprint);
        let cap = self.thresholds.repeat_threshold.max(1);
        while self.tool_fingerprints.len() > cap {
            self.tool_fingerprints.pop_front();
        }
    }

    /// Record a tool or assistant output string.
    pub fn record_output(&mut self, text: &str) {
        self.outputs.push_back(text.to_string());
        let cap = self.thresholds.repeat_threshold.max(1);
        while self.outputs.len() > cap {
            self.outputs.pop_front();
        }
    }

    /// Evaluate detection rules in priority order: turn-limit, then
    /// repeated-tool, then repeated-output.
    ///
    /// Returns the same [`LoopPattern`] on every call after the first
    /// detection without re-invoking listeners, until [`Self::reset`].
    pub fn check_for_loop(&mut self) -> Option<LoopPattern> {
        if !self.enabled {
            return None;
        }

        if let Some(pattern) = &self.stopped {
            return Some(pattern.clone());
        }

        let detected = self.evaluate();

        if let Some(pattern) = detected {
            self.stopped = Some(pattern.clone());
            for listener in &mut self.listeners {
                // Listener panics must not prevent the remaining listeners
                // from running; std::panic::catch_unwind would require
                // UnwindSafe bounds we don't want to impose, so detector
                // listeners are expected to be infallible closures that log
                // their own errors instead of panicking.
                listener(&pattern);
            }
            return Some(pattern);
        }

        None
    }

    fn evaluate(&self) -> Option<LoopPattern> {
        if self.turn_count >= self.thresholds.max_turns {
            return Some(LoopPattern {
                kind: LoopPatternKind::TurnLimit,
                details: format!(
                    "reached turn limit ({} >= {})",
                    self.turn_count, self.thresholds.max_turns
                ),
                count: self.turn_count,
            });
        }

        if all_equal_and_full(&self.tool_fingerprints, self.thresholds.repeat_threshold) {
            return Some(LoopPattern {
                kind: LoopPatternKind::RepeatedTool,
                details: format!(
                    "same tool call repeated {} times in a row",
                    self.thresholds.repeat_threshold
                ),
                count: self.thresholds.repeat_threshold,
            });
        }

        if all_equal_and_full(&self.outputs, self.thresholds.repeat_threshold) {
            return Some(LoopPattern {
                kind: LoopPatternKind::RepeatedOutput,
                details: format!(
                    "same output repeated {} times in a row",
                    self.thresholds.repeat_threshold
                ),
                count: self.thresholds.repeat_threshold,
            });
        }

        None
    }

    /// Clear buffers, turn counter, and the stop flag. Listeners and
    /// configured thresholds survive a reset.
    pub fn reset(&mut self) {
        self.tool_fingerprints.clear();
        self.outputs.clear();
        self.turn_count = 0;
        self.stopped = None;
    }

    /// Register a listener invoked exactly once when a loop is first detected.
    pub fn on_loop_detected<F>(&mut self, listener: F)
    where
        F: FnMut(&LoopPattern) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Drop every registered listener.
    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }

    /// Whether a loop has been detected and execution should stop.
    #[must_use]
    pub fn is_execution_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    /// Current turn count.
    #[must_use]
    pub fn turn_count(&self) -> usize {
        self.turn_count
    }

    /// Apply a partial configuration update.
    pub fn configure(&mut self, update: LoopConfig) {
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(max_turns) = update.max_turns {
            self.thresholds.max_turns = max_turns;
        }
        if let Some(repeat_threshold) = update.repeat_threshold {
            self.thresholds.repeat_threshold = repeat_threshold;
            debug!(repeat_threshold, "loop detector repeat threshold updated");
        }
    }
}

fn all_equal_and_full<T: PartialEq>(buf: &VecDeque<T>, threshold: usize) -> bool {
    if threshold == 0 || buf.len() < threshold {
        return false;
    }
    let first = &buf[0];
    buf.iter().all(|item| item == first)
}
