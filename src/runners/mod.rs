//! # Action runners (§4.4)
//!
//! Three leaf operations — Http call, poll-until, assert — plus Branch, which
//! picks a sub-flow rather than producing protocol-level data of its own. Each
//! runner consumes `(step, ctx, sut)` and returns `(Observation, ContextDelta)`;
//! turbulence wraps the Http runner's call site (§9), not the runner itself.

pub mod assert;
pub mod branch;
pub mod http;
pub mod wait;

use std::collections::HashMap;

use crate::model::Service;

/// Merges headers in declared precedence order (later wins): SUT default,
/// then service-level, then action-level (§4.4 "later wins").
pub fn merge_headers(
    sut_default: &HashMap<String, String>,
    service: &Service,
    action: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = sut_default.clone();
    merged.extend(service.headers.clone());
    merged.extend(action.clone());
    merged
}
