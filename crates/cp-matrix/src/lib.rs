#![forbid(unsafe_code)]

use cp_core::{
    ATTENTION_BACKEND_VAR, COMPILE_LEVEL_VAR, CompilationLevel, Configuration,
    ENFORCE_EAGER_FLAG, EnvironmentOverlay, FULLGRAPH_CAPTURE_DISABLED,
    FULLGRAPH_CAPTURE_OVERRIDE_VAR, PIPELINE_PARALLEL_FLAG, Scenario, TENSOR_PARALLEL_FLAG,
};

/// Levels whose outputs are compared against each other, in expansion order.
///
/// `FullOptimizing` is left out on purpose: the optimizing compiler is allowed
/// to change numerics, so its output cannot be held to exact equality. New
/// levels must be added here explicitly once they are known to be comparable.
pub const COMPARED_LEVELS: [CompilationLevel; 3] = [
    CompilationLevel::NoCompilation,
    CompilationLevel::TraceAsIs,
    CompilationLevel::TraceOnce,
];

/// Every configuration a scenario is checked under. The first entry is the
/// reference the comparator measures the others against.
#[must_use]
pub fn expand(scenario: &Scenario) -> Vec<Configuration> {
    let scenario_id = scenario.id();
    let args = engine_args(scenario);
    COMPARED_LEVELS
        .iter()
        .map(|level| {
            Configuration::new(
                scenario_id.clone(),
                *level,
                args.clone(),
                level_overlay(scenario, *level),
            )
        })
        .collect()
}

/// Engine arguments shared by every level of a scenario.
#[must_use]
pub fn engine_args(scenario: &Scenario) -> Vec<String> {
    let mut args = scenario.base_args().to_vec();
    args.push(ENFORCE_EAGER_FLAG.to_string());
    args.push(PIPELINE_PARALLEL_FLAG.to_string());
    args.push(scenario.pipeline_parallel().to_string());
    args.push(TENSOR_PARALLEL_FLAG.to_string());
    args.push(scenario.tensor_parallel().to_string());
    args
}

#[must_use]
pub fn level_overlay(scenario: &Scenario, level: CompilationLevel) -> EnvironmentOverlay {
    let overlay = EnvironmentOverlay::new()
        .with_var(ATTENTION_BACKEND_VAR, scenario.attention_backend())
        .with_var(COMPILE_LEVEL_VAR, level.value().to_string());

    // TraceOnce always captures one contiguous graph, so the override is
    // never written for it.
    if !level.forces_fullgraph() && !scenario.fullgraph() {
        overlay.with_var(FULLGRAPH_CAPTURE_OVERRIDE_VAR, FULLGRAPH_CAPTURE_DISABLED)
    } else {
        overlay
    }
}

#[cfg(test)]
mod tests {
    use cp_core::{
        ATTENTION_BACKEND_VAR, COMPILE_LEVEL_VAR, CompilationLevel, FULLGRAPH_CAPTURE_OVERRIDE_VAR,
        InvocationMethod, LevelClass, Scenario,
    };
    use proptest::prelude::*;

    use super::{COMPARED_LEVELS, expand};

    fn llama_scenario(fullgraph: bool) -> Scenario {
        Scenario::new(
            "meta-llama/Llama-3.2-1B",
            2,
            2,
            "FLASHINFER",
            InvocationMethod::Generate,
            fullgraph,
        )
        .expect("valid scenario")
    }

    #[test]
    fn compared_levels_exclude_divergent_levels() {
        assert!(
            COMPARED_LEVELS
                .iter()
                .all(|level| level.classification() == LevelClass::Comparable)
        );
        assert!(!COMPARED_LEVELS.contains(&CompilationLevel::FullOptimizing));
    }

    #[test]
    fn expansion_yields_one_configuration_per_compared_level() {
        let configs = expand(&llama_scenario(true));
        let levels: Vec<CompilationLevel> = configs.iter().map(|c| c.level()).collect();
        assert_eq!(
            levels,
            vec![
                CompilationLevel::NoCompilation,
                CompilationLevel::TraceAsIs,
                CompilationLevel::TraceOnce,
            ]
        );
    }

    #[test]
    fn args_carry_eager_and_parallel_flags() {
        let scenario = Scenario::new(
            "nm-testing/Meta-Llama-3-8B-Instruct-W8A8-Dyn-Per-Token-2048-Samples",
            1,
            1,
            "FLASH_ATTN",
            InvocationMethod::Generate,
            true,
        )
        .expect("valid scenario")
        .with_base_args(["--quantization", "compressed-tensors"]);
        let configs = expand(&scenario);
        assert_eq!(
            configs[0].args(),
            [
                "--quantization",
                "compressed-tensors",
                "--enforce-eager",
                "-pp",
                "1",
                "-tp",
                "1",
            ]
        );
    }

    #[test]
    fn every_configuration_traces_back_to_its_scenario() {
        let scenario = llama_scenario(true);
        for config in expand(&scenario) {
            assert_eq!(config.scenario_id(), scenario.id());
        }
    }

    #[test]
    fn overlay_sets_compile_level_and_backend() {
        for config in expand(&llama_scenario(true)) {
            let level = config.level().value().to_string();
            assert_eq!(config.overlay().get(COMPILE_LEVEL_VAR), Some(level.as_str()));
            assert_eq!(config.overlay().get(ATTENTION_BACKEND_VAR), Some("FLASHINFER"));
        }
    }

    #[test]
    fn fullgraph_preference_true_writes_no_override() {
        for config in expand(&llama_scenario(true)) {
            assert!(!config.overlay().contains(FULLGRAPH_CAPTURE_OVERRIDE_VAR));
            assert!(config.effective_fullgraph());
        }
    }

    #[test]
    fn fullgraph_preference_false_disables_capture_except_trace_once() {
        let configs = expand(&llama_scenario(false));
        for config in &configs {
            let override_value = config.overlay().get(FULLGRAPH_CAPTURE_OVERRIDE_VAR);
            if config.level() == CompilationLevel::TraceOnce {
                assert_eq!(override_value, None);
                assert!(config.effective_fullgraph());
            } else {
                assert_eq!(override_value, Some("0"));
                assert!(!config.effective_fullgraph());
            }
        }
    }

    fn arb_scenario() -> impl Strategy<Value = Scenario> {
        (
            1usize..=4,
            1usize..=4,
            prop::sample::select(vec!["FLASH_ATTN", "FLASHINFER", "XFORMERS"]),
            any::<bool>(),
            prop::collection::vec("--[a-z]{1,8}", 0..3),
        )
            .prop_map(|(pp, tp, backend, fullgraph, base)| {
                Scenario::new("org/model", pp, tp, backend, InvocationMethod::Generate, fullgraph)
                    .expect("degrees are drawn from 1..=4")
                    .with_base_args(base)
            })
    }

    proptest! {
        #[test]
        fn prop_args_identical_across_levels(scenario in arb_scenario()) {
            let configs = expand(&scenario);
            prop_assert_eq!(configs.len(), COMPARED_LEVELS.len());
            for config in &configs[1..] {
                prop_assert_eq!(config.args(), configs[0].args());
            }
        }

        #[test]
        fn prop_overlays_differ_only_in_level_driven_entries(scenario in arb_scenario()) {
            let configs = expand(&scenario);
            for config in &configs {
                let backend = config.overlay().get(ATTENTION_BACKEND_VAR);
                prop_assert_eq!(backend, Some(scenario.attention_backend()));
                for name in config.overlay().names() {
                    prop_assert!(
                        [ATTENTION_BACKEND_VAR, COMPILE_LEVEL_VAR, FULLGRAPH_CAPTURE_OVERRIDE_VAR]
                            .contains(&name)
                    );
                }
            }
        }

        #[test]
        fn prop_fullgraph_rule(scenario in arb_scenario()) {
            for config in expand(&scenario) {
                let has_override = config.overlay().contains(FULLGRAPH_CAPTURE_OVERRIDE_VAR);
                if config.level() == CompilationLevel::TraceOnce {
                    prop_assert!(!has_override);
                    prop_assert!(config.effective_fullgraph());
                } else {
                    prop_assert_eq!(has_override, !scenario.fullgraph());
                    prop_assert_eq!(config.effective_fullgraph(), scenario.fullgraph());
                }
            }
        }

        #[test]
        fn prop_expansion_is_deterministic(scenario in arb_scenario()) {
            prop_assert_eq!(expand(&scenario), expand(&scenario));
        }
    }
}
