//! Session scripts
//!
//! A script is a JSON array of steps ordered by `at_ms`:
//!
//! ```json
//! [
//!   { "at_ms": 0,    "state": "startup" },
//!   { "at_ms": 800,  "state": "playing" },
//!   { "at_ms": 5000, "state": "pause", "position_ms": 4200 },
//!   { "at_ms": 6000, "error": { "code": 3001, "message": "decoder failure" } },
//!   { "at_ms": 7000, "detach": true }
//! ]
//! ```

use anyhow::{bail, Context};
use kino_collector::{Collector, CustomData, ErrorCode, PlayerState};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptStep {
    /// Offset from the start of the replay
    pub at_ms: u64,
    #[serde(default)]
    pub position_ms: u64,
    #[serde(default)]
    pub state: Option<PlayerState>,
    #[serde(default)]
    pub error: Option<ErrorCode>,
    #[serde(default)]
    pub custom_data: Option<CustomData>,
    #[serde(default)]
    pub detach: bool,
}

impl ScriptStep {
    fn is_empty(&self) -> bool {
        self.state.is_none() && self.error.is_none() && self.custom_data.is_none() && !self.detach
    }

    /// Drive the collector with this step
    pub fn apply(&self, collector: &Collector) {
        if let Some(data) = &self.custom_data {
            collector.change_custom_data(self.position_ms, data.clone());
        }
        let machine = collector.machine();
        if let Some(error) = &self.error {
            machine.error(self.position_ms, error.clone());
        } else if let Some(state) = self.state {
            machine.transition(state, self.position_ms);
        }
        if self.detach {
            collector.detach();
        }
    }
}

/// Parse and check a script
pub fn parse(json: &str) -> anyhow::Result<Vec<ScriptStep>> {
    let steps: Vec<ScriptStep> = serde_json::from_str(json).context("Invalid session script")?;

    for (index, pair) in steps.windows(2).enumerate() {
        if pair[1].at_ms < pair[0].at_ms {
            bail!("Step {} goes back in time ({} ms < {} ms)", index + 1, pair[1].at_ms, pair[0].at_ms);
        }
    }
    if let Some(index) = steps.iter().position(ScriptStep::is_empty) {
        bail!("Step {index} does nothing; set state, error, custom_data or detach");
    }
    Ok(steps)
}

pub fn load(path: &Path) -> anyhow::Result<Vec<ScriptStep>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    parse(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script() {
        let steps = parse(
            r#"[
                { "at_ms": 0, "state": "startup" },
                { "at_ms": 500, "state": "playing" },
                { "at_ms": 900, "error": { "code": 1, "message": "boom" } }
            ]"#,
        )
        .unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1].state, Some(PlayerState::Playing));
        assert_eq!(steps[2].error.as_ref().map(|e| e.code), Some(1));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let result = parse(r#"[{ "at_ms": 10, "state": "startup" }, { "at_ms": 5, "state": "playing" }]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_step_rejected() {
        assert!(parse(r#"[{ "at_ms": 0 }]"#).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(parse(r#"[{ "at_ms": 0, "state": "startup", "speed": 2 }]"#).is_err());
    }
}
