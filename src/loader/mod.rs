// Module: Loader
// Responsible for reading SUT declarations and scenario files off disk.

use crate::model::{Scenario, SutConfig};
use anyhow::{Context, Result};
use std::path::Path;

/// Loads a `SutConfig` from `path`. Dispatches on extension: `.yaml`/`.yml`
/// via `serde_yaml`, anything else via `serde_json`.
pub fn load_sut_from_file<P: AsRef<Path>>(path: P) -> Result<SutConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read SUT file {}", path.display()))?;
    parse_by_extension(path, &content).context("failed to parse SUT declaration")
}

/// Loads a `Scenario` from `path`, same extension dispatch as `load_sut_from_file`.
pub fn load_scenario_from_file<P: AsRef<Path>>(path: P) -> Result<Scenario> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario file {}", path.display()))?;
    parse_by_extension(path, &content).context("failed to parse scenario")
}

fn parse_by_extension<T: serde::de::DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(content).context("invalid YAML")
        }
        _ => serde_json::from_str(content).context("invalid JSON"),
    }
}
