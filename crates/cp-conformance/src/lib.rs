#![forbid(unsafe_code)]

mod logging;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use cp_core::{
    CompilationLevel, ComparisonResult, Configuration, InvocationMethod, MismatchDetail,
    RunOutput, Scenario, ScenarioError, det64_label,
};
use cp_device::{DeviceGate, DeviceQuery, GateDecision};
use cp_engine::{
    CommandEngine, DEFAULT_INVOCATION_TIMEOUT_MILLIS, Engine, ExecuteError, RequestPlan,
    RunOrchestrator,
};
use cp_matrix::expand;
use cp_runtime::{EvidenceEntry, EvidenceKind};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use logging::{RUN_LOG_SCHEMA_VERSION, StructuredRunLog};

pub const SUITE_ID: &str = "compile_correctness";
pub const SUITE_REPORT_SCHEMA_VERSION: &str = "cp-conformance.suite-report.v1";
pub const ENGINE_PROGRAM_ENV: &str = "CP_ENGINE_PROGRAM";
const DEFAULT_ENGINE_PROGRAM: &str = "parity-engine";
const MAX_CONFIG_BYTES: u64 = 1_048_576;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error("config error: {0}")]
    Config(String),
    #[error("artifact error: {0}")]
    Artifact(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub artifact_root: PathBuf,
    pub engine_program: PathBuf,
    pub engine_prefix_args: Vec<String>,
    pub invocation_timeout_millis: u64,
    pub request: RequestPlan,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        Self {
            artifact_root: repo_root.join("artifacts/compile_parity"),
            engine_program: default_engine_program(),
            engine_prefix_args: Vec::new(),
            invocation_timeout_millis: DEFAULT_INVOCATION_TIMEOUT_MILLIS,
            request: RequestPlan::default(),
        }
    }

    #[must_use]
    pub fn command_engine(&self) -> CommandEngine {
        CommandEngine::new(&self.engine_program)
            .with_prefix_args(self.engine_prefix_args.iter().cloned())
            .with_timeout_millis(self.invocation_timeout_millis)
    }

    #[must_use]
    pub fn default_matrix_log_path(&self) -> PathBuf {
        self.artifact_root.join("e2e_matrix.jsonl")
    }

    #[must_use]
    pub fn default_report_path(&self) -> PathBuf {
        self.artifact_root.join("suite_report_v1.json")
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HarnessConfigFile {
    artifact_root: Option<PathBuf>,
    engine_program: Option<PathBuf>,
    engine_prefix_args: Option<Vec<String>>,
    invocation_timeout_millis: Option<u64>,
    prompts: Option<Vec<String>>,
    max_tokens: Option<u32>,
}

/// Reads a JSON config file; keys it leaves out keep their
/// [`HarnessConfig::default_paths`] values.
pub fn load_harness_config(path: &Path) -> Result<HarnessConfig, HarnessError> {
    let metadata = fs::metadata(path).map_err(|error| {
        HarnessError::Config(format!(
            "failed reading config metadata {}: {error}",
            path.display()
        ))
    })?;
    let size = metadata.len();
    if size > MAX_CONFIG_BYTES {
        return Err(HarnessError::Config(format!(
            "config {} exceeds max bytes: actual={size} max={MAX_CONFIG_BYTES}",
            path.display()
        )));
    }

    let raw = fs::read_to_string(path).map_err(|error| {
        HarnessError::Config(format!("failed reading config {}: {error}", path.display()))
    })?;
    let file: HarnessConfigFile = serde_json::from_str(&raw).map_err(|error| {
        HarnessError::Config(format!("failed parsing config {}: {error}", path.display()))
    })?;

    let mut config = HarnessConfig::default_paths();
    if let Some(root) = file.artifact_root {
        config.artifact_root = root;
    }
    if let Some(program) = file.engine_program {
        config.engine_program = program;
    }
    if let Some(prefix) = file.engine_prefix_args {
        config.engine_prefix_args = prefix;
    }
    if let Some(timeout) = file.invocation_timeout_millis {
        if timeout == 0 {
            return Err(HarnessError::Config(
                "invocation_timeout_millis must be positive".to_string(),
            ));
        }
        config.invocation_timeout_millis = timeout;
    }
    if let Some(prompts) = file.prompts {
        if prompts.is_empty() {
            return Err(HarnessError::Config("prompts must not be empty".to_string()));
        }
        config.request.prompts = prompts;
    }
    if let Some(max_tokens) = file.max_tokens {
        config.request.max_tokens = max_tokens;
    }
    Ok(config)
}

fn default_engine_program() -> PathBuf {
    std::env::var_os(ENGINE_PROGRAM_ENV)
        .map_or_else(|| PathBuf::from(DEFAULT_ENGINE_PROGRAM), PathBuf::from)
}

/// Static declaration of one scenario row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioRow {
    pub model: &'static str,
    pub base_args: &'static [&'static str],
    pub pipeline_parallel: usize,
    pub tensor_parallel: usize,
    pub attention_backend: &'static str,
    pub method: InvocationMethod,
    pub fullgraph: bool,
}

impl ScenarioRow {
    pub fn to_scenario(&self) -> Result<Scenario, ScenarioError> {
        Ok(Scenario::new(
            self.model,
            self.pipeline_parallel,
            self.tensor_parallel,
            self.attention_backend,
            self.method,
            self.fullgraph,
        )?
        .with_base_args(self.base_args.iter().copied()))
    }
}

// The full product of models and levels is too expensive to run, so each row
// pins one parallel split and one backend.
pub const COMPILE_CORRECTNESS_TABLE: &[ScenarioRow] = &[
    ScenarioRow {
        model: "meta-llama/Llama-3.2-1B",
        base_args: &[],
        pipeline_parallel: 2,
        tensor_parallel: 2,
        attention_backend: "FLASHINFER",
        method: InvocationMethod::Generate,
        fullgraph: true,
    },
    ScenarioRow {
        model: "nm-testing/Meta-Llama-3-8B-Instruct-W8A8-Dyn-Per-Token-2048-Samples",
        base_args: &["--quantization", "compressed-tensors"],
        pipeline_parallel: 1,
        tensor_parallel: 1,
        attention_backend: "FLASH_ATTN",
        method: InvocationMethod::Generate,
        fullgraph: true,
    },
    ScenarioRow {
        model: "ibm/PowerMoE-3b",
        base_args: &[],
        pipeline_parallel: 1,
        tensor_parallel: 2,
        attention_backend: "FLASH_ATTN",
        method: InvocationMethod::Generate,
        fullgraph: true,
    },
    // TODO: add a multi-modal input scenario for llava once the request plan
    // can carry image inputs.
    ScenarioRow {
        model: "llava-hf/llava-1.5-7b-hf",
        base_args: &[],
        pipeline_parallel: 2,
        tensor_parallel: 1,
        attention_backend: "FLASHINFER",
        method: InvocationMethod::Generate,
        fullgraph: false,
    },
];

pub fn compile_correctness_scenarios() -> Result<Vec<Scenario>, HarnessError> {
    COMPILE_CORRECTNESS_TABLE
        .iter()
        .map(|row| row.to_scenario().map_err(HarnessError::from))
        .collect()
}

/// Scenarios whose id or model contains `filter`; all of them when `None`.
pub fn select_scenarios(filter: Option<&str>) -> Result<Vec<Scenario>, HarnessError> {
    let mut scenarios = compile_correctness_scenarios()?;
    if let Some(needle) = filter {
        scenarios
            .retain(|scenario| scenario.model().contains(needle) || scenario.id().contains(needle));
    }
    Ok(scenarios)
}

/// Compares every output against the first one, which is the reference.
#[must_use]
pub fn compare(outputs: &[(Configuration, RunOutput)]) -> Vec<ComparisonResult> {
    let Some((reference_config, reference_output)) = outputs.first() else {
        return Vec::new();
    };

    outputs[1..]
        .iter()
        .map(|(candidate_config, candidate_output)| {
            let mismatch = if candidate_output == reference_output {
                None
            } else {
                Some(
                    reference_output
                        .first_divergence(candidate_output)
                        .unwrap_or(MismatchDetail::RecordCount {
                            reference: reference_output.len(),
                            candidate: candidate_output.len(),
                        }),
                )
            };
            ComparisonResult {
                reference: reference_config.clone(),
                candidate: candidate_config.clone(),
                equal: mismatch.is_none(),
                mismatch,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    DeviceCountMismatch { required: usize, available: usize },
    EnvironmentUnavailable { detail: String },
    NoComparableConfigurations,
}

impl SkipReason {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::DeviceCountMismatch { .. } => "skip_device_count_mismatch",
            Self::EnvironmentUnavailable { .. } => "skip_environment_unavailable",
            Self::NoComparableConfigurations => "skip_no_comparable_configurations",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MismatchSummary {
    pub reference_level: CompilationLevel,
    pub candidate_level: CompilationLevel,
    pub candidate_configuration_id: String,
    pub message: String,
    pub detail: MismatchDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    InvocationFailure {
        configuration_id: String,
        level: CompilationLevel,
        detail: String,
    },
    OutputMismatch { mismatches: Vec<MismatchSummary> },
}

impl FailureReason {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvocationFailure { .. } => "fail_invocation",
            Self::OutputMismatch { .. } => "fail_output_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ScenarioVerdict {
    Passed,
    Failed(FailureReason),
    Skipped(SkipReason),
}

impl ScenarioVerdict {
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Passed => "pass",
            Self::Failed(_) => "fail",
            Self::Skipped(_) => "skip",
        }
    }

    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Passed => "parity_ok",
            Self::Failed(reason) => reason.reason_code(),
            Self::Skipped(reason) => reason.reason_code(),
        }
    }

    #[must_use]
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutedRun {
    pub configuration: Configuration,
    pub output_digest: String,
    pub output_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub scenario_id: String,
    pub required_units: usize,
    pub gate: GateDecision,
    pub verdict: ScenarioVerdict,
    pub runs: Vec<ExecutedRun>,
    pub comparisons: Vec<ComparisonResult>,
    /// Evidence recorded while this scenario ran, and nothing else.
    pub evidence: Vec<EvidenceEntry>,
    #[serde(skip)]
    pub forensic_logs: Vec<StructuredRunLog>,
}

impl ScenarioReport {
    #[must_use]
    pub fn executed_configurations(&self) -> usize {
        self.runs.len()
    }
}

/// Runs one scenario end to end: gate, expand, execute each configuration in
/// declared order, then compare everything against the first run.
///
/// Engine failures and mismatches become a failed verdict; gate rejection
/// becomes a skip with nothing executed. Only harness defects (overlay leaks,
/// malformed overlays) are returned as errors.
pub fn run_scenario<Q, E>(
    scenario: &Scenario,
    gate: &DeviceGate<Q>,
    orchestrator: &mut RunOrchestrator<E>,
) -> Result<ScenarioReport, HarnessError>
where
    Q: DeviceQuery,
    E: Engine,
{
    // Entries recorded between scenarios belong to none of them.
    orchestrator.drain_evidence();

    let scenario_id = scenario.id();
    let replay = replay_command(scenario);
    let decision = gate.check_scenario(scenario);
    orchestrator.evidence_mut().record(
        EvidenceKind::Gate,
        format!(
            "gate {} required={} {}",
            scenario_id,
            scenario.required_units(),
            decision.reason_code()
        ),
    );

    let mut logs = vec![
        StructuredRunLog::new(
            SUITE_ID,
            scenario_id.clone(),
            replay.clone(),
            if decision.is_admitted() { "pass" } else { "skip" },
            decision.reason_code(),
        )
        .with_extra_fields(gate_fields(scenario, &decision)),
    ];

    let skip = match &decision {
        GateDecision::Admit { .. } => None,
        GateDecision::DeviceCountMismatch {
            required,
            available,
        } => Some(SkipReason::DeviceCountMismatch {
            required: *required,
            available: *available,
        }),
        GateDecision::EnvironmentUnavailable { detail } => {
            Some(SkipReason::EnvironmentUnavailable {
                detail: detail.clone(),
            })
        }
    };
    let configurations = if skip.is_none() {
        expand(scenario)
    } else {
        Vec::new()
    };
    let skip = skip.or_else(|| {
        configurations
            .is_empty()
            .then_some(SkipReason::NoComparableConfigurations)
    });

    if let Some(reason) = skip {
        let verdict = ScenarioVerdict::Skipped(reason);
        let evidence = orchestrator.drain_evidence();
        logs.push(verdict_log(scenario, &verdict, &replay, &[], &evidence));
        return Ok(ScenarioReport {
            scenario: scenario.clone(),
            scenario_id,
            required_units: scenario.required_units(),
            gate: decision,
            verdict,
            runs: Vec::new(),
            comparisons: Vec::new(),
            evidence,
            forensic_logs: logs,
        });
    }

    let mut outputs: Vec<(Configuration, RunOutput)> = Vec::with_capacity(configurations.len());
    let mut failure = None;
    for configuration in configurations {
        match orchestrator.execute(scenario, &configuration) {
            Ok(output) => {
                logs.push(run_log(&configuration, &output, &replay));
                outputs.push((configuration, output));
            }
            Err(ExecuteError::Invocation {
                configuration_id,
                level,
                source,
            }) => {
                logs.push(
                    StructuredRunLog::new(
                        SUITE_ID,
                        scenario_id.clone(),
                        replay.clone(),
                        "fail",
                        "invocation_failed",
                    )
                    .with_configuration(&configuration)
                    .with_extra_fields(BTreeMap::from([(
                        "engine_error".to_string(),
                        json!(source.to_string()),
                    )])),
                );
                failure = Some(FailureReason::InvocationFailure {
                    configuration_id,
                    level,
                    detail: source.to_string(),
                });
                break;
            }
            Err(defect) => return Err(HarnessError::Execute(defect)),
        }
    }

    let comparisons = if failure.is_some() {
        Vec::new()
    } else {
        compare(&outputs)
    };
    for comparison in &comparisons {
        orchestrator.evidence_mut().record(
            EvidenceKind::Comparison,
            format!(
                "compare {} vs {} equal={}",
                comparison.reference.level(),
                comparison.candidate.level(),
                comparison.equal
            ),
        );
    }

    let verdict = match failure {
        Some(reason) => ScenarioVerdict::Failed(reason),
        None => {
            let mismatches: Vec<MismatchSummary> = comparisons
                .iter()
                .filter(|comparison| !comparison.equal)
                .map(|comparison| mismatch_summary(scenario, comparison))
                .collect();
            if mismatches.is_empty() {
                ScenarioVerdict::Passed
            } else {
                ScenarioVerdict::Failed(FailureReason::OutputMismatch { mismatches })
            }
        }
    };
    let evidence = orchestrator.drain_evidence();
    logs.push(verdict_log(
        scenario,
        &verdict,
        &replay,
        &comparisons,
        &evidence,
    ));

    let runs = outputs
        .into_iter()
        .map(|(configuration, output)| ExecutedRun {
            configuration,
            output_digest: det64_label(output.digest64()),
            output_records: output.len(),
        })
        .collect();

    Ok(ScenarioReport {
        scenario: scenario.clone(),
        scenario_id,
        required_units: scenario.required_units(),
        gate: decision,
        verdict,
        runs,
        comparisons,
        evidence,
        forensic_logs: logs,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteReport {
    pub schema_version: &'static str,
    pub suite: &'static str,
    pub scenarios_total: usize,
    pub scenarios_passed: usize,
    pub scenarios_failed: usize,
    pub scenarios_skipped: usize,
    pub scenarios: Vec<ScenarioReport>,
}

impl SuiteReport {
    #[must_use]
    pub fn from_scenarios(scenarios: Vec<ScenarioReport>) -> Self {
        let count = |pred: fn(&ScenarioVerdict) -> bool| {
            scenarios
                .iter()
                .filter(|report| pred(&report.verdict))
                .count()
        };
        let scenarios_passed = count(ScenarioVerdict::is_passed);
        let scenarios_failed = count(ScenarioVerdict::is_failed);
        let scenarios_skipped = count(ScenarioVerdict::is_skipped);
        Self {
            schema_version: SUITE_REPORT_SCHEMA_VERSION,
            suite: SUITE_ID,
            scenarios_total: scenarios.len(),
            scenarios_passed,
            scenarios_failed,
            scenarios_skipped,
            scenarios,
        }
    }

    /// `fail` if anything failed, `skip` if nothing ran at all, else `pass`.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        if self.scenarios_failed > 0 {
            "fail"
        } else if self.scenarios_passed == 0 {
            "skip"
        } else {
            "pass"
        }
    }

    #[must_use]
    pub fn summary_line(&self) -> String {
        format!(
            "{}: {} (passed={} failed={} skipped={} total={})",
            self.suite,
            self.outcome(),
            self.scenarios_passed,
            self.scenarios_failed,
            self.scenarios_skipped,
            self.scenarios_total
        )
    }

    /// Points every scenario verdict at the artifacts this report is about to
    /// be written to.
    #[must_use]
    pub fn with_artifact_refs(mut self, matrix_log: &Path, report: &Path) -> Self {
        let refs = vec![
            matrix_log.display().to_string(),
            report.display().to_string(),
        ];
        for scenario in &mut self.scenarios {
            // `run_scenario` always pushes the verdict log last.
            if let Some(verdict) = scenario.forensic_logs.last_mut() {
                verdict.artifact_refs.clone_from(&refs);
            }
        }
        self
    }

    pub fn forensic_logs(&self) -> impl Iterator<Item = &StructuredRunLog> {
        self.scenarios
            .iter()
            .flat_map(|report| report.forensic_logs.iter())
    }
}

/// Runs each scenario in turn against one engine and one device query.
pub fn run_compile_correctness_suite<Q, E>(
    scenarios: &[Scenario],
    query: Q,
    engine: E,
    plan: RequestPlan,
) -> Result<SuiteReport, HarnessError>
where
    Q: DeviceQuery,
    E: Engine,
{
    let gate = DeviceGate::new(query);
    let mut orchestrator = RunOrchestrator::new(engine, plan);
    let mut reports = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        reports.push(run_scenario(scenario, &gate, &mut orchestrator)?);
    }
    Ok(SuiteReport::from_scenarios(reports))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct E2EForensicsSummary {
    pub output_path: PathBuf,
    pub log_entries: usize,
    pub failed_entries: usize,
    pub skipped_entries: usize,
}

/// Writes every structured log of `report` to `output_path` as JSON lines.
pub fn emit_e2e_forensics_matrix(
    report: &SuiteReport,
    output_path: &Path,
) -> Result<E2EForensicsSummary, HarnessError> {
    let mut lines = String::new();
    let mut log_entries = 0usize;
    let mut failed_entries = 0usize;
    let mut skipped_entries = 0usize;
    for entry in report.forensic_logs() {
        let line = serde_json::to_string(entry).map_err(|error| {
            HarnessError::Artifact(format!("failed to serialize structured log entry: {error}"))
        })?;
        lines.push_str(&line);
        lines.push('\n');
        log_entries += 1;
        match entry.outcome {
            "fail" => failed_entries += 1,
            "skip" => skipped_entries += 1,
            _ => {}
        }
    }

    write_artifact(output_path, lines.as_bytes(), "e2e forensics log")?;
    Ok(E2EForensicsSummary {
        output_path: output_path.to_path_buf(),
        log_entries,
        failed_entries,
        skipped_entries,
    })
}

pub fn emit_suite_report(report: &SuiteReport, output_path: &Path) -> Result<(), HarnessError> {
    let body = serde_json::to_string_pretty(report).map_err(|error| {
        HarnessError::Artifact(format!("failed to serialize suite report: {error}"))
    })?;
    write_artifact(output_path, body.as_bytes(), "suite report")
}

fn write_artifact(path: &Path, body: &[u8], what: &str) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            HarnessError::Artifact(format!(
                "failed to create {what} dir {}: {error}",
                parent.display()
            ))
        })?;
    }
    fs::write(path, body).map_err(|error| {
        HarnessError::Artifact(format!("failed to write {what} {}: {error}", path.display()))
    })
}

fn replay_command(scenario: &Scenario) -> String {
    format!(
        "cargo run -p cp-conformance --bin run_compile_matrix -- --scenario {}",
        scenario.model()
    )
}

fn gate_fields(scenario: &Scenario, decision: &GateDecision) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    fields.insert("model".to_string(), json!(scenario.model()));
    fields.insert(
        "pipeline_parallel".to_string(),
        json!(scenario.pipeline_parallel()),
    );
    fields.insert(
        "tensor_parallel".to_string(),
        json!(scenario.tensor_parallel()),
    );
    fields.insert(
        "required_units".to_string(),
        json!(scenario.required_units()),
    );
    fields.insert(
        "gate".to_string(),
        serde_json::to_value(decision).unwrap_or(Value::Null),
    );
    fields
}

fn run_log(configuration: &Configuration, output: &RunOutput, replay: &str) -> StructuredRunLog {
    let mut fields = BTreeMap::new();
    fields.insert("args".to_string(), json!(configuration.args()));
    fields.insert("overlay".to_string(), json!(configuration.overlay()));
    fields.insert(
        "effective_fullgraph".to_string(),
        json!(configuration.effective_fullgraph()),
    );
    fields.insert(
        "output_digest".to_string(),
        json!(det64_label(output.digest64())),
    );
    fields.insert("output_records".to_string(), json!(output.len()));

    StructuredRunLog::new(
        SUITE_ID,
        configuration.scenario_id(),
        replay,
        "pass",
        "run_ok",
    )
    .with_configuration(configuration)
    .with_extra_fields(fields)
}

fn verdict_log(
    scenario: &Scenario,
    verdict: &ScenarioVerdict,
    replay: &str,
    comparisons: &[ComparisonResult],
    evidence: &[EvidenceEntry],
) -> StructuredRunLog {
    let mut fields = BTreeMap::new();
    fields.insert("model".to_string(), json!(scenario.model()));
    fields.insert(
        "verdict".to_string(),
        serde_json::to_value(verdict).unwrap_or(Value::Null),
    );
    fields.insert(
        "comparisons_total".to_string(),
        json!(comparisons.len()),
    );
    fields.insert(
        "comparisons_equal".to_string(),
        json!(comparisons.iter().filter(|c| c.equal).count()),
    );
    fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_field(evidence),
    );

    StructuredRunLog::new(
        SUITE_ID,
        scenario.id(),
        replay,
        verdict.outcome(),
        verdict.reason_code(),
    )
    .with_extra_fields(fields)
}

fn mismatch_summary(scenario: &Scenario, comparison: &ComparisonResult) -> MismatchSummary {
    let reference = &comparison.reference;
    let candidate = &comparison.candidate;
    let detail = comparison
        .mismatch
        .clone()
        .unwrap_or(MismatchDetail::RecordCount {
            reference: 0,
            candidate: 0,
        });
    MismatchSummary {
        reference_level: reference.level(),
        candidate_level: candidate.level(),
        candidate_configuration_id: candidate.id(),
        message: format!(
            "results for model={} are not the same with ref_args={:?} ref_envs={{{}}} and compare_args={:?} compare_envs={{{}}}: {detail}",
            scenario.model(),
            reference.args(),
            reference.overlay().describe(),
            candidate.args(),
            candidate.overlay().describe(),
        ),
        detail,
    }
}

fn runtime_evidence_field(evidence: &[EvidenceEntry]) -> Value {
    let mut by_kind = BTreeMap::<&'static str, usize>::new();
    for entry in evidence {
        *by_kind.entry(entry.kind.label()).or_default() += 1;
    }
    json!({
        "total_entries": evidence.len(),
        "kind_counts": by_kind,
        "entries": evidence,
    })
}
