#![forbid(unsafe_code)]

mod supervise;

use std::borrow::Cow;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use cp_core::{CompilationLevel, Configuration, InvocationMethod, RunOutput, Scenario, det64_label};
use cp_runtime::{
    EnvironmentComposer, EnvironmentLeak, EvidenceEntry, EvidenceKind, EvidenceLedger,
    InvalidOverlay,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const DEFAULT_INVOCATION_TIMEOUT_MILLIS: u64 = 1_800_000;
const MAX_ENGINE_STDIN_BYTES: usize = 1_048_576;
const ENGINE_STDERR_DIAGNOSTIC_BYTES: usize = 512;
const ENGINE_RAW_DIAGNOSTIC_BYTES: usize = 256;

/// Fixed request replayed under every configuration. Greedy decoding keeps the
/// engine deterministic, so any difference is attributable to the strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPlan {
    pub prompts: Vec<String>,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for RequestPlan {
    fn default() -> Self {
        Self {
            prompts: vec![
                "Hello, my name is".to_string(),
                "The capital of France is".to_string(),
                "The future of AI is".to_string(),
            ],
            max_tokens: 5,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineRequest<'a> {
    pub model: &'a str,
    pub method: InvocationMethod,
    pub args: &'a [String],
    pub plan: &'a RequestPlan,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("failed to spawn engine {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("engine i/o failure: {0}")]
    Io(String),
    #[error("engine timed out after {millis}ms")]
    Timeout { millis: u64 },
    #[error("engine exited with status {status}: {stderr}")]
    NonZeroExit { status: String, stderr: String },
    #[error("engine {stream} exceeds max bytes: actual={actual} max={max}")]
    StreamOverflow {
        stream: &'static str,
        actual: usize,
        max: usize,
    },
    #[error("engine output malformed: {0}")]
    MalformedOutput(String),
    #[error("engine failed: {0}")]
    Failed(String),
}

/// The product under test, seen as one blocking call per configuration.
pub trait Engine {
    fn invoke(&self, request: &EngineRequest<'_>) -> Result<RunOutput, EngineError>;
}

impl<T: Engine + ?Sized> Engine for &T {
    fn invoke(&self, request: &EngineRequest<'_>) -> Result<RunOutput, EngineError> {
        (**self).invoke(request)
    }
}

impl<T: Engine + ?Sized> Engine for Box<T> {
    fn invoke(&self, request: &EngineRequest<'_>) -> Result<RunOutput, EngineError> {
        (**self).invoke(request)
    }
}

/// Runs the engine as a child process:
/// `<program> [prefix args] --model <model> --method <method> <args...>`.
///
/// The request plan goes in on stdin as JSON; the last non-empty stdout line
/// must be `{"records": [...]}`. The child inherits the process environment,
/// which is where the active overlay lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEngine {
    program: PathBuf,
    prefix_args: Vec<String>,
    timeout_millis: u64,
}

impl CommandEngine {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            timeout_millis: DEFAULT_INVOCATION_TIMEOUT_MILLIS,
        }
    }

    #[must_use]
    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_timeout_millis(mut self, timeout_millis: u64) -> Self {
        self.timeout_millis = timeout_millis;
        self
    }

    #[must_use]
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    #[must_use]
    pub fn command_line(&self, request: &EngineRequest<'_>) -> Vec<String> {
        let mut line = vec![self.program.display().to_string()];
        line.extend(self.prefix_args.iter().cloned());
        line.extend([
            "--model".to_string(),
            request.model.to_string(),
            "--method".to_string(),
            request.method.label().to_string(),
        ]);
        line.extend(request.args.iter().cloned());
        line
    }
}

impl CommandEngine {
    fn request_body(request: &EngineRequest<'_>) -> Result<Vec<u8>, EngineError> {
        let body = serde_json::to_vec(&json!({
            "model": request.model,
            "method": request.method.label(),
            "args": request.args,
            "prompts": request.plan.prompts,
            "max_tokens": request.plan.max_tokens,
            "temperature": request.plan.temperature,
        }))
        .map_err(|error| EngineError::Io(format!("failed to serialize request: {error}")))?;
        if body.len() > MAX_ENGINE_STDIN_BYTES {
            return Err(EngineError::StreamOverflow {
                stream: "stdin",
                actual: body.len(),
                max: MAX_ENGINE_STDIN_BYTES,
            });
        }
        Ok(body)
    }
}

impl Engine for CommandEngine {
    fn invoke(&self, request: &EngineRequest<'_>) -> Result<RunOutput, EngineError> {
        let body = Self::request_body(request)?;
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix_args)
            .arg("--model")
            .arg(request.model)
            .arg("--method")
            .arg(request.method.label())
            .args(request.args);

        let completed = supervise::run_to_completion(
            command,
            body,
            Duration::from_millis(self.timeout_millis),
        )?;
        if !completed.status.success() {
            let stderr = String::from_utf8_lossy(&completed.stderr);
            return Err(EngineError::NonZeroExit {
                status: completed.status.to_string(),
                stderr: clip_for_log(stderr.trim(), ENGINE_STDERR_DIAGNOSTIC_BYTES).into_owned(),
            });
        }

        let stdout = String::from_utf8(completed.stdout).map_err(|error| {
            EngineError::MalformedOutput(format!("stdout was not utf8: {error}"))
        })?;
        parse_engine_stdout(&stdout)
    }
}

/// The engine may log freely; only its final non-blank stdout line is the
/// result.
fn parse_engine_stdout(stdout: &str) -> Result<RunOutput, EngineError> {
    let Some(result_line) = stdout.lines().rev().map(str::trim).find(|line| !line.is_empty()) else {
        return Err(EngineError::MalformedOutput(
            "engine produced empty stdout".to_string(),
        ));
    };
    serde_json::from_str::<RunOutput>(result_line).map_err(|error| {
        EngineError::MalformedOutput(format!(
            "{error}; last line: {}",
            clip_for_log(result_line, ENGINE_RAW_DIAGNOSTIC_BYTES)
        ))
    })
}

fn clip_for_log(text: &str, max_bytes: usize) -> Cow<'_, str> {
    if text.len() <= max_bytes {
        return Cow::Borrowed(text);
    }
    let cut = (0..=max_bytes)
        .rev()
        .find(|index| text.is_char_boundary(*index))
        .unwrap_or(0);
    Cow::Owned(format!("{}...", &text[..cut]))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    #[error("configuration {configuration_id} does not belong to scenario {scenario_id}")]
    ForeignConfiguration {
        scenario_id: String,
        configuration_id: String,
    },
    #[error("configuration {configuration_id} has an invalid overlay: {source}")]
    InvalidOverlay {
        configuration_id: String,
        source: InvalidOverlay,
    },
    #[error("engine invocation failed for {configuration_id} (level {level}): {source}")]
    Invocation {
        configuration_id: String,
        level: CompilationLevel,
        source: EngineError,
    },
    #[error("harness bug: overlay for {configuration_id} leaked: {source}")]
    EnvironmentLeak {
        configuration_id: String,
        source: EnvironmentLeak,
    },
}

impl ExecuteError {
    /// Leaks and malformed overlays are defects of the harness itself rather
    /// than of the engine under test.
    #[must_use]
    pub fn is_harness_defect(&self) -> bool {
        !matches!(self, Self::Invocation { .. })
    }
}

/// Executes one configuration at a time: apply overlay, invoke, release.
#[derive(Debug)]
pub struct RunOrchestrator<E> {
    engine: E,
    composer: EnvironmentComposer,
    plan: RequestPlan,
}

impl<E: Engine> RunOrchestrator<E> {
    #[must_use]
    pub fn new(engine: E, plan: RequestPlan) -> Self {
        Self {
            engine,
            composer: EnvironmentComposer::new(),
            plan,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    #[must_use]
    pub fn plan(&self) -> &RequestPlan {
        &self.plan
    }

    pub fn execute(
        &mut self,
        scenario: &Scenario,
        configuration: &Configuration,
    ) -> Result<RunOutput, ExecuteError> {
        let configuration_id = configuration.id();
        if configuration.scenario_id() != scenario.id() {
            return Err(ExecuteError::ForeignConfiguration {
                scenario_id: scenario.id(),
                configuration_id,
            });
        }

        let guard = self
            .composer
            .apply(configuration.overlay())
            .map_err(|source| ExecuteError::InvalidOverlay {
                configuration_id: configuration_id.clone(),
                source,
            })?;

        let request = EngineRequest {
            model: scenario.model(),
            method: scenario.method(),
            args: configuration.args(),
            plan: &self.plan,
        };
        let invoked = self.engine.invoke(&request);

        self.composer
            .release(guard)
            .map_err(|source| ExecuteError::EnvironmentLeak {
                configuration_id: configuration_id.clone(),
                source,
            })?;

        match invoked {
            Ok(output) => {
                self.composer.ledger_mut().record(
                    EvidenceKind::Invocation,
                    format!(
                        "invoke_ok {configuration_id} records={} digest={}",
                        output.len(),
                        det64_label(output.digest64())
                    ),
                );
                Ok(output)
            }
            Err(source) => {
                self.composer.ledger_mut().record(
                    EvidenceKind::Invocation,
                    format!("invoke_failed {configuration_id}: {source}"),
                );
                Err(ExecuteError::Invocation {
                    configuration_id,
                    level: configuration.level(),
                    source,
                })
            }
        }
    }

    #[must_use]
    pub fn evidence(&self) -> &EvidenceLedger {
        self.composer.ledger()
    }

    pub fn evidence_mut(&mut self) -> &mut EvidenceLedger {
        self.composer.ledger_mut()
    }

    /// Hands over the evidence recorded since the previous drain.
    pub fn drain_evidence(&mut self) -> Vec<EvidenceEntry> {
        self.composer.ledger_mut().drain()
    }
}
