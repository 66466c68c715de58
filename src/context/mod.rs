//! Per-instance Context: an immutable snapshot plus deltas (§9).
//!
//! A Context is a persistent map; each step receives a read-only snapshot
//! (`Context::clone` is cheap — an `Arc`-free `HashMap` clone, acceptable at this
//! scale) and returns a `ContextDelta` that the scenario runner applies before
//! the next step. This removes accidental cross-step aliasing and makes replay
//! deterministic. Branch sub-flows see their parent's context at the branch
//! point; deltas from inside the branch flow outward to the parent.

use std::collections::HashMap;

use serde_json::Value;

use crate::pathutil;

/// Per-instance key/value snapshot consulted by templates and the sandbox.
///
/// Reserved top-level keys: `run_id`, `instance_id`, `correlation_id`,
/// `iteration`, `entry` (holding `entry.seed_data`). Extracted values are
/// inserted directly under their declared names; name collisions overwrite.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: HashMap<String, Value>,
}

/// A set of additions/overwrites produced by one step's execution, applied to
/// the next Context snapshot. Never removes keys.
#[derive(Debug, Clone, Default)]
pub struct ContextDelta {
    values: HashMap<String, Value>,
}

impl ContextDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn merge(mut self, other: ContextDelta) -> ContextDelta {
        self.values.extend(other.values);
        self
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the initial Context for an Instance (§4.6 step 1).
    pub fn initial(
        run_id: &str,
        instance_id: &str,
        correlation_id: &str,
        iteration: usize,
        seed_data: Value,
    ) -> Self {
        let mut values = HashMap::new();
        values.insert("run_id".to_string(), Value::String(run_id.to_string()));
        values.insert("instance_id".to_string(), Value::String(instance_id.to_string()));
        values.insert(
            "correlation_id".to_string(),
            Value::String(correlation_id.to_string()),
        );
        values.insert("iteration".to_string(), Value::Number(iteration.into()));
        let mut entry = serde_json::Map::new();
        entry.insert("seed_data".to_string(), seed_data);
        values.insert("entry".to_string(), Value::Object(entry));
        Self { values }
    }

    /// Applies a delta, returning the next snapshot. The receiver is left
    /// untouched — callers hold the returned value as the new "current" Context.
    pub fn apply(&self, delta: &ContextDelta) -> Context {
        let mut values = self.values.clone();
        for (k, v) in &delta.values {
            values.insert(k.clone(), v.clone());
        }
        Context { values }
    }

    /// Looks up a dotted/indexed path (`entry.seed_data.customer_id`) or a bare
    /// reserved identifier (`correlation_id`).
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = pathutil::split_path(path);
        if segments.is_empty() {
            return None;
        }
        let head = segments.remove(0);
        let root = self.values.get(&head)?;
        if segments.is_empty() {
            Some(root)
        } else {
            pathutil::navigate(root, &segments)
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get_path("correlation_id").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initial_context_exposes_reserved_identifiers() {
        let ctx = Context::initial("run-1", "inst-1", "corr-1", 0, json!({"customer_id": 42}));
        assert_eq!(ctx.get_path("run_id"), Some(&json!("run-1")));
        assert_eq!(
            ctx.get_path("entry.seed_data.customer_id"),
            Some(&json!(42))
        );
    }

    #[test]
    fn apply_is_immutable_and_overwrites_on_collision() {
        let base = Context::initial("r", "i", "c", 0, Value::Null);
        let mut delta = ContextDelta::new();
        delta.insert("id", json!(7));
        let next = base.apply(&delta);

        assert_eq!(base.get_path("id"), None);
        assert_eq!(next.get_path("id"), Some(&json!(7)));

        let mut delta2 = ContextDelta::new();
        delta2.insert("id", json!(9));
        let next2 = next.apply(&delta2);
        assert_eq!(next2.get_path("id"), Some(&json!(9)));
    }

    #[test]
    fn missing_path_returns_none() {
        let ctx = Context::initial("r", "i", "c", 0, Value::Null);
        assert_eq!(ctx.get_path("nonexistent.key"), None);
    }
}
