#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ATTENTION_BACKEND_VAR: &str = "ATTENTION_BACKEND";
pub const COMPILE_LEVEL_VAR: &str = "COMPILE_LEVEL";
pub const FULLGRAPH_CAPTURE_OVERRIDE_VAR: &str = "FULLGRAPH_CAPTURE_OVERRIDE";
/// Value written to [`FULLGRAPH_CAPTURE_OVERRIDE_VAR`] to turn full-graph capture off.
pub const FULLGRAPH_CAPTURE_DISABLED: &str = "0";

pub const ENFORCE_EAGER_FLAG: &str = "--enforce-eager";
pub const PIPELINE_PARALLEL_FLAG: &str = "-pp";
pub const TENSOR_PARALLEL_FLAG: &str = "-tp";

/// Compilation strategy the engine applies to the model graph before running it.
///
/// Declaration order is the order configurations are expanded and reported in.
/// Whether a level takes part in output comparison is decided by
/// [`CompilationLevel::classification`], never by its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilationLevel {
    NoCompilation,
    TraceAsIs,
    TraceOnce,
    FullOptimizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelClass {
    Comparable,
    /// Output may legitimately differ from the other levels; never compared.
    ExpectedDivergent,
}

impl CompilationLevel {
    pub const ALL: [Self; 4] = [
        Self::NoCompilation,
        Self::TraceAsIs,
        Self::TraceOnce,
        Self::FullOptimizing,
    ];

    /// Integer written to the engine's compile-level variable.
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::NoCompilation => 0,
            Self::TraceAsIs => 1,
            Self::TraceOnce => 2,
            Self::FullOptimizing => 3,
        }
    }

    #[must_use]
    pub fn from_value(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.value() == value)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::NoCompilation => "no_compilation",
            Self::TraceAsIs => "trace_as_is",
            Self::TraceOnce => "trace_once",
            Self::FullOptimizing => "full_optimizing",
        }
    }

    // The optimizing compiler rewrites numerics (fusion, reordering), so its
    // output is not expected to match the other levels bit for bit.
    #[must_use]
    pub const fn classification(self) -> LevelClass {
        match self {
            Self::NoCompilation | Self::TraceAsIs | Self::TraceOnce => LevelClass::Comparable,
            Self::FullOptimizing => LevelClass::ExpectedDivergent,
        }
    }

    /// Levels that always capture the whole forward pass as one graph, whatever
    /// the scenario declares.
    #[must_use]
    pub const fn forces_fullgraph(self) -> bool {
        matches!(self, Self::TraceOnce)
    }
}

impl fmt::Display for CompilationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMethod {
    Generate,
    Encode,
}

impl InvocationMethod {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Encode => "encode",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "generate" => Some(Self::Generate),
            "encode" => Some(Self::Encode),
            _ => None,
        }
    }
}

impl fmt::Display for InvocationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScenarioError {
    #[error("scenario {model}: {axis} degree must be at least 1")]
    ZeroParallelDegree { model: String, axis: &'static str },
    #[error("scenario model identifier must not be empty")]
    EmptyModel,
}

/// One logical correctness question: does this model, split this way, on this
/// attention backend, produce the same output under every comparable level?
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scenario {
    model: String,
    base_args: Vec<String>,
    pipeline_parallel: usize,
    tensor_parallel: usize,
    attention_backend: String,
    method: InvocationMethod,
    fullgraph: bool,
}

impl Scenario {
    /// Both parallel degrees must be non-zero: a zero-unit scenario would be
    /// admitted by a host with no visible devices.
    pub fn new(
        model: impl Into<String>,
        pipeline_parallel: usize,
        tensor_parallel: usize,
        attention_backend: impl Into<String>,
        method: InvocationMethod,
        fullgraph: bool,
    ) -> Result<Self, ScenarioError> {
        let model = model.into();
        if model.is_empty() {
            return Err(ScenarioError::EmptyModel);
        }
        for (axis, degree) in [
            ("pipeline_parallel", pipeline_parallel),
            ("tensor_parallel", tensor_parallel),
        ] {
            if degree == 0 {
                return Err(ScenarioError::ZeroParallelDegree { model, axis });
            }
        }
        Ok(Self {
            model,
            base_args: Vec::new(),
            pipeline_parallel,
            tensor_parallel,
            attention_backend: attention_backend.into(),
            method,
            fullgraph,
        })
    }

    #[must_use]
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn base_args(&self) -> &[String] {
        &self.base_args
    }

    #[must_use]
    pub fn pipeline_parallel(&self) -> usize {
        self.pipeline_parallel
    }

    #[must_use]
    pub fn tensor_parallel(&self) -> usize {
        self.tensor_parallel
    }

    #[must_use]
    pub fn attention_backend(&self) -> &str {
        &self.attention_backend
    }

    #[must_use]
    pub fn method(&self) -> InvocationMethod {
        self.method
    }

    #[must_use]
    pub fn fullgraph(&self) -> bool {
        self.fullgraph
    }

    /// Devices the scenario occupies: one per pipeline stage per tensor shard.
    #[must_use]
    pub fn required_units(&self) -> usize {
        self.pipeline_parallel.saturating_mul(self.tensor_parallel)
    }

    /// Path-safe identity covering every field that shapes a configuration:
    /// `{model}/pp{P}-tp{T}/{backend}/{method}-{fullgraph|piecewise}/args-{digest}`.
    #[must_use]
    pub fn id(&self) -> String {
        format!(
            "{}/pp{}-tp{}/{}/{}-{}/args-{:08x}",
            canonical_component(&self.model),
            self.pipeline_parallel,
            self.tensor_parallel,
            canonical_component(&self.attention_backend),
            self.method.label(),
            if self.fullgraph { "fullgraph" } else { "piecewise" },
            self.base_args_digest() >> 32,
        )
    }

    #[must_use]
    pub fn base_args_digest(&self) -> u64 {
        let mut hasher = Det64::new();
        for arg in &self.base_args {
            hasher.write(arg.as_bytes());
            hasher.write(&[0]);
        }
        hasher.finish()
    }
}

/// Environment variables one run sets and then reverts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentOverlay {
    vars: BTreeMap<String, String>,
}

impl EnvironmentOverlay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// `NAME=value` pairs separated by spaces, in name order.
    #[must_use]
    pub fn describe(&self) -> String {
        self.iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = Det64::new();
        for (name, value) in self.iter() {
            hasher.write(name.as_bytes());
            hasher.write(&[0]);
            hasher.write(value.as_bytes());
            hasher.write(&[0xff]);
        }
        hasher.finish()
    }
}

/// One concrete execution strategy derived from a [`Scenario`] and a level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    scenario_id: String,
    level: CompilationLevel,
    args: Vec<String>,
    overlay: EnvironmentOverlay,
}

impl Configuration {
    #[must_use]
    pub fn new(
        scenario_id: impl Into<String>,
        level: CompilationLevel,
        args: Vec<String>,
        overlay: EnvironmentOverlay,
    ) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            level,
            args,
            overlay,
        }
    }

    #[must_use]
    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    #[must_use]
    pub fn level(&self) -> CompilationLevel {
        self.level
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn overlay(&self) -> &EnvironmentOverlay {
        &self.overlay
    }

    #[must_use]
    pub fn id(&self) -> String {
        format!("{}@{}", self.scenario_id, self.level.label())
    }

    /// Whether the engine will capture the full graph under this configuration.
    #[must_use]
    pub fn effective_fullgraph(&self) -> bool {
        self.level.forces_fullgraph()
            || self.overlay.get(FULLGRAPH_CAPTURE_OVERRIDE_VAR) != Some(FULLGRAPH_CAPTURE_DISABLED)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub label: String,
    pub value: Value,
}

impl OutputRecord {
    #[must_use]
    pub fn new(label: impl Into<String>, value: Value) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

/// What one run produced. Only exact structural equality is meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub records: Vec<OutputRecord>,
}

impl RunOutput {
    #[must_use]
    pub fn new(records: Vec<OutputRecord>) -> Self {
        Self { records }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn digest64(&self) -> u64 {
        let mut hasher = Det64::new();
        for record in &self.records {
            hasher.write(record.label.as_bytes());
            hasher.write(&[0]);
            hasher.write(record.value.to_string().as_bytes());
            hasher.write(&[0xff]);
        }
        hasher.finish()
    }

    /// First point at which `candidate` stops matching `self`, if any.
    #[must_use]
    pub fn first_divergence(&self, candidate: &Self) -> Option<MismatchDetail> {
        for (index, (lhs, rhs)) in self.records.iter().zip(&candidate.records).enumerate() {
            if lhs.label != rhs.label {
                return Some(MismatchDetail::Record {
                    index,
                    label: lhs.label.clone(),
                    path: "$label".to_string(),
                    reference: Value::String(lhs.label.clone()),
                    candidate: Value::String(rhs.label.clone()),
                });
            }
            if let Some((path, reference, observed)) =
                first_value_divergence(&lhs.value, &rhs.value, String::from("$"))
            {
                return Some(MismatchDetail::Record {
                    index,
                    label: lhs.label.clone(),
                    path,
                    reference,
                    candidate: observed,
                });
            }
        }

        if self.records.len() != candidate.records.len() {
            return Some(MismatchDetail::RecordCount {
                reference: self.records.len(),
                candidate: candidate.records.len(),
            });
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MismatchDetail {
    RecordCount {
        reference: usize,
        candidate: usize,
    },
    Record {
        index: usize,
        label: String,
        path: String,
        reference: Value,
        candidate: Value,
    },
}

impl fmt::Display for MismatchDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecordCount {
                reference,
                candidate,
            } => write!(
                f,
                "record count differs: reference={reference} candidate={candidate}"
            ),
            Self::Record {
                index,
                label,
                path,
                reference,
                candidate,
            } => write!(
                f,
                "record {index} ({label}) differs at {path}: reference={reference} candidate={candidate}"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub reference: Configuration,
    pub candidate: Configuration,
    pub equal: bool,
    pub mismatch: Option<MismatchDetail>,
}

fn first_value_divergence(
    reference: &Value,
    candidate: &Value,
    path: String,
) -> Option<(String, Value, Value)> {
    match (reference, candidate) {
        (Value::Array(lhs), Value::Array(rhs)) => {
            for (index, (lhs_item, rhs_item)) in lhs.iter().zip(rhs).enumerate() {
                if let Some(found) =
                    first_value_divergence(lhs_item, rhs_item, format!("{path}[{index}]"))
                {
                    return Some(found);
                }
            }
            (lhs.len() != rhs.len()).then(|| {
                (
                    format!("{path}.length"),
                    Value::from(lhs.len()),
                    Value::from(rhs.len()),
                )
            })
        }
        (Value::Object(lhs), Value::Object(rhs)) => {
            for (key, lhs_item) in lhs {
                let child = format!("{path}.{key}");
                match rhs.get(key) {
                    Some(rhs_item) => {
                        if let Some(found) = first_value_divergence(lhs_item, rhs_item, child) {
                            return Some(found);
                        }
                    }
                    None => return Some((child, lhs_item.clone(), Value::Null)),
                }
            }
            rhs.iter()
                .find(|(key, _)| !lhs.contains_key(*key))
                .map(|(key, rhs_item)| (format!("{path}.{key}"), Value::Null, rhs_item.clone()))
        }
        _ => (reference != candidate).then(|| (path, reference.clone(), candidate.clone())),
    }
}

/// FNV-1a, stable across processes and platforms.
#[derive(Debug, Clone, Copy)]
pub struct Det64(u64);

impl Det64 {
    #[must_use]
    pub const fn new() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }

    #[must_use]
    pub const fn finish(self) -> u64 {
        self.0
    }
}

impl Default for Det64 {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use]
pub fn det64_label(digest: u64) -> String {
    format!("det64:{digest:016x}")
}

fn canonical_component(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
