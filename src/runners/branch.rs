//! # Branch runner (§4.4)
//!
//! Evaluates `condition` via the sandbox and reports which sub-flow the
//! scenario runner should walk next. The actual execution of the chosen
//! sub-flow's steps is the scenario runner's job (it already knows how to
//! dispatch every Step variant and track `max_steps`); this module only
//! decides the branch and produces the synthetic Observation §4.4 requires.

use crate::context::Context;
use crate::model::Observation;
use crate::sandbox;

pub struct BranchDecision {
    pub took_true: bool,
    pub observation: Observation,
}

pub fn decide(name: &str, condition: &str, ctx: &Context) -> BranchDecision {
    match sandbox::eval_bool(condition, ctx) {
        Ok(took_true) => {
            let mut obs = Observation::passed(name.to_string(), 0.0);
            obs.body = Some(serde_json::json!({ "condition": condition, "took": if took_true { "if_true" } else { "if_false" } }));
            BranchDecision { took_true, observation: obs }
        }
        Err(e) => BranchDecision {
            took_true: false,
            observation: Observation::failed(name.to_string(), 0.0, e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextDelta;
    use serde_json::json;

    fn ctx_with(key: &str, value: serde_json::Value) -> Context {
        let base = Context::initial("r", "i", "c", 0, serde_json::Value::Null);
        let mut delta = ContextDelta::new();
        delta.insert(key, value);
        base.apply(&delta)
    }

    #[test]
    fn true_condition_selects_if_true_branch() {
        let ctx = ctx_with("payment_status", json!("declined"));
        let decision = decide("route", "payment_status == 'declined'", &ctx);
        assert!(decision.took_true);
        assert!(decision.observation.ok);
    }

    #[test]
    fn false_condition_selects_if_false_branch() {
        let ctx = ctx_with("payment_status", json!("captured"));
        let decision = decide("route", "payment_status == 'declined'", &ctx);
        assert!(!decision.took_true);
    }

    #[test]
    fn sandbox_error_surfaces_as_failed_observation() {
        let ctx = Context::new();
        let decision = decide("route", "eval('1')", &ctx);
        assert!(!decision.observation.ok);
    }
}
