use std::collections::BTreeMap;

use cp_core::{Configuration, EnvironmentOverlay, det64_label};
use serde::Serialize;
use serde_json::Value;

pub const RUN_LOG_SCHEMA_VERSION: &str = "cp-conformance.run-log.v1";

/// One JSON-lines record per scenario gate decision, configuration run, or
/// scenario verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuredRunLog {
    pub schema_version: &'static str,
    pub ts_unix_ms: u64,
    pub suite_id: &'static str,
    pub scenario_id: String,
    pub configuration_id: Option<String>,
    pub compile_level: Option<&'static str>,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: &'static str,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredRunLog {
    #[must_use]
    pub fn new(
        suite_id: &'static str,
        scenario_id: impl Into<String>,
        replay_command: impl Into<String>,
        outcome: &'static str,
        reason_code: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: RUN_LOG_SCHEMA_VERSION,
            ts_unix_ms: now_unix_ms(),
            suite_id,
            scenario_id: scenario_id.into(),
            configuration_id: None,
            compile_level: None,
            env_fingerprint: det64_label(EnvironmentOverlay::new().fingerprint64()),
            artifact_refs: Vec::new(),
            replay_command: replay_command.into(),
            outcome,
            reason_code: reason_code.into(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_configuration(mut self, configuration: &Configuration) -> Self {
        self.configuration_id = Some(configuration.id());
        self.compile_level = Some(configuration.level().label());
        self.env_fingerprint = det64_label(configuration.overlay().fingerprint64());
        self
    }

    #[must_use]
    pub fn with_artifact_refs(mut self, artifact_refs: Vec<String>) -> Self {
        self.artifact_refs = artifact_refs;
        self
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        // Flattened extras must not shadow envelope fields.
        for (key, value) in extra_fields {
            if !ENVELOPE_FIELDS.contains(&key.as_str()) {
                self.extra_fields.insert(key, value);
            }
        }
        self
    }
}

const ENVELOPE_FIELDS: [&str; 12] = [
    "schema_version",
    "ts_unix_ms",
    "suite_id",
    "scenario_id",
    "configuration_id",
    "compile_level",
    "env_fingerprint",
    "artifact_refs",
    "replay_command",
    "outcome",
    "reason_code",
    "extra_fields",
];

fn now_unix_ms() -> u64 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use cp_core::{CompilationLevel, Configuration, EnvironmentOverlay};
    use serde_json::{Value, json};

    use super::{RUN_LOG_SCHEMA_VERSION, StructuredRunLog};

    #[test]
    fn log_serializes_flat_with_extras() {
        let config = Configuration::new(
            "org_model/pp1-tp1/flash_attn",
            CompilationLevel::TraceOnce,
            vec!["--enforce-eager".to_string()],
            EnvironmentOverlay::new().with_var("COMPILE_LEVEL", "2"),
        );
        let mut extras = BTreeMap::new();
        extras.insert("output_digest".to_string(), json!("det64:00"));
        extras.insert("outcome".to_string(), json!("shadowed"));

        let log = StructuredRunLog::new(
            "compile_correctness",
            config.scenario_id(),
            "run_compile_matrix --scenario org/model",
            "pass",
            "run_ok",
        )
        .with_configuration(&config)
        .with_extra_fields(extras);

        let value: Value = serde_json::to_value(&log).expect("log serializes");
        assert_eq!(value["schema_version"], json!(RUN_LOG_SCHEMA_VERSION));
        assert_eq!(value["compile_level"], json!("trace_once"));
        assert_eq!(
            value["configuration_id"],
            json!("org_model/pp1-tp1/flash_attn@trace_once")
        );
        assert_eq!(value["output_digest"], json!("det64:00"));
        assert_eq!(value["outcome"], json!("pass"));
        assert!(
            value["env_fingerprint"]
                .as_str()
                .is_some_and(|fp| fp.starts_with("det64:"))
        );
    }
}
