#![forbid(unsafe_code)]

use std::path::PathBuf;

use cp_conformance::{
    HarnessConfig, emit_e2e_forensics_matrix, emit_suite_report, load_harness_config,
    run_compile_correctness_suite, select_scenarios,
};
use cp_device::{FixedDeviceCount, VisibleDeviceQuery};
use cp_matrix::expand;
use serde_json::json;

const USAGE: &str = "usage: run_compile_matrix [--scenario model-substring] [--devices N] [--config path] [--output path] [--report path] [--list] [--print-full-log]";

fn main() -> Result<(), String> {
    let mut scenario: Option<String> = None;
    let mut devices: Option<usize> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut report: Option<PathBuf> = None;
    let mut list_only = false;
    let mut print_full_log = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--scenario" => {
                let value = args.next().ok_or_else(|| {
                    "--scenario requires a model substring (e.g., PowerMoE)".to_string()
                })?;
                scenario = Some(value);
            }
            "--devices" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--devices requires a device count".to_string())?;
                let count = value
                    .parse::<usize>()
                    .map_err(|error| format!("invalid --devices value '{value}': {error}"))?;
                devices = Some(count);
            }
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--config requires a file path".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--report" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--report requires a file path".to_string())?;
                report = Some(PathBuf::from(value));
            }
            "--list" => {
                list_only = true;
            }
            "--print-full-log" => {
                print_full_log = true;
            }
            other => {
                return Err(format!("unknown arg '{other}'. {USAGE}"));
            }
        }
    }

    let config = match config_path {
        Some(path) => load_harness_config(path.as_path()).map_err(|error| error.to_string())?,
        None => HarnessConfig::default_paths(),
    };

    let scenarios = select_scenarios(scenario.as_deref()).map_err(|error| error.to_string())?;
    if scenarios.is_empty() {
        return Err(format!(
            "no scenario matches '{}'",
            scenario.unwrap_or_default()
        ));
    }

    if list_only {
        let listing: Vec<_> = scenarios
            .iter()
            .map(|scenario| {
                json!({
                    "scenario_id": scenario.id(),
                    "model": scenario.model(),
                    "required_units": scenario.required_units(),
                    "configurations": expand(scenario)
                        .iter()
                        .map(|configuration| json!({
                            "configuration_id": configuration.id(),
                            "args": configuration.args(),
                            "overlay": configuration.overlay(),
                        }))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&listing)
                .map_err(|error| format!("failed to serialize listing: {error}"))?
        );
        return Ok(());
    }

    let engine = config.command_engine();
    let suite = match devices {
        Some(count) => run_compile_correctness_suite(
            &scenarios,
            FixedDeviceCount(count),
            engine,
            config.request.clone(),
        ),
        None => run_compile_correctness_suite(
            &scenarios,
            VisibleDeviceQuery::new(),
            engine,
            config.request.clone(),
        ),
    }
    .map_err(|error| error.to_string())?;

    let output_path = output.unwrap_or_else(|| config.default_matrix_log_path());
    let report_path = report.unwrap_or_else(|| config.default_report_path());
    let suite = suite.with_artifact_refs(&output_path, &report_path);
    let summary =
        emit_e2e_forensics_matrix(&suite, output_path.as_path()).map_err(|error| error.to_string())?;
    emit_suite_report(&suite, report_path.as_path()).map_err(|error| error.to_string())?;

    if print_full_log {
        let raw = std::fs::read_to_string(summary.output_path.as_path()).map_err(|error| {
            format!(
                "failed to read generated e2e log {}: {error}",
                summary.output_path.display()
            )
        })?;
        print!("{raw}");
    } else {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": suite.outcome(),
                "output_path": summary.output_path.display().to_string(),
                "report_path": report_path.display().to_string(),
                "log_entries": summary.log_entries,
                "failed_entries": summary.failed_entries,
                "skipped_entries": summary.skipped_entries,
                "scenarios_passed": suite.scenarios_passed,
                "scenarios_failed": suite.scenarios_failed,
                "scenarios_skipped": suite.scenarios_skipped,
                "scenario_filter": scenario,
            }))
            .map_err(|error| format!("failed to serialize summary: {error}"))?
        );
    }

    if suite.scenarios_failed > 0 {
        return Err(suite.summary_line());
    }
    Ok(())
}
