//! Reconciliation primitives.
//!
//! Helpers shared by the loops that converge a remote node's actual state to
//! the desired state held for it:
//!
//! - **Desired state**: what the orchestrator pushed.
//! - **Actual state**: what the node reports on each tick.
//! - **Convergence**: issuing the minimal calls that make actual match desired.
//!
//! # Invariants
//!
//! - Matching is one-directional: only keys present in the desired value are
//!   compared, so implicit defaults on the remote side never cause a loop.
//! - Hashes are deterministic regardless of object key order.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Tolerance when comparing numbers that went through a float round-trip.
const FLOAT_EPSILON: f64 = 1e-6;

/// Convergence status for a reconciled object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Actual matches desired; nothing was done.
    Converged,

    /// Corrective calls were issued this pass.
    Converging,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// A content hash for change detection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a hash from canonical JSON.
    pub fn from_json(json: &Value) -> Self {
        let canonical = canonical_json(json);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize with sorted keys and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Whether `actual` satisfies `desired`.
///
/// Every key of a desired object must be present in the actual object with a
/// matching value; keys only present in `actual` are ignored. Numbers compare
/// by value, so `-6` matches `-6.0`.
pub fn settings_match(desired: &Value, actual: &Value) -> bool {
    match (desired, actual) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|a| settings_match(v, a))),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len()
                && want.iter().zip(have).all(|(w, h)| settings_match(w, h))
        }
        (Value::Number(w), Value::Number(h)) => match (w.as_f64(), h.as_f64()) {
            (Some(w), Some(h)) => (w - h).abs() < FLOAT_EPSILON,
            _ => w == h,
        },
        _ => desired == actual,
    }
}

/// Consecutive-failure tracker for loops that retry every tick.
///
/// It never stops a retry; callers use [`FailureTracker::is_exhausted`] to
/// escalate how loudly they log.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: u32,
    window: Duration,
    /// key -> (count, first failure in the current streak)
    failures: BTreeMap<String, (u32, Instant)>,
}

impl FailureTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure. Returns the length of the current streak.
    pub fn record_failure(&mut self, key: &str) -> u32 {
        let now = Instant::now();
        let (count, first) = self.failures.entry(key.to_string()).or_insert((0, now));

        // A streak older than the window starts over.
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count
    }

    /// Whether `key` has failed more than the threshold within the window.
    pub fn is_exhausted(&self, key: &str) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };
        Instant::now().duration_since(*first) <= self.window && *count > self.threshold
    }

    /// Forget `key` after a success. Returns the streak that just ended.
    pub fn clear(&mut self, key: &str) -> u32 {
        self.failures.remove(key).map_or(0, |(count, _)| count)
    }
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_FAILURE_WINDOW)
    }
}

/// Failures tolerated before a loop escalates to error-level logs.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Window in which consecutive failures count toward the threshold.
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(10 * 60);
