#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::Command;

use cp_core::Scenario;
use serde::Serialize;

pub const DEFAULT_DEVICE_TOOL: &str = "nvidia-smi";
pub const DEFAULT_VISIBILITY_MASK_VAR: &str = "CUDA_VISIBLE_DEVICES";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceQueryError {
    #[error("device tool {tool} could not be launched: {reason}")]
    ToolUnavailable { tool: String, reason: String },
    #[error("device tool {tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },
    #[error("device query unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of how many execution devices this process may use.
pub trait DeviceQuery {
    fn visible_device_count(&self) -> Result<usize, DeviceQueryError>;
}

impl<T: DeviceQuery + ?Sized> DeviceQuery for &T {
    fn visible_device_count(&self) -> Result<usize, DeviceQueryError> {
        (**self).visible_device_count()
    }
}

/// Counts physical devices with the vendor tool, then narrows the count to the
/// process visibility mask the same way the driver does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleDeviceQuery {
    tool: PathBuf,
    mask_var: String,
}

impl VisibleDeviceQuery {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tool: PathBuf::from(DEFAULT_DEVICE_TOOL),
            mask_var: DEFAULT_VISIBILITY_MASK_VAR.to_string(),
        }
    }

    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.tool = tool.into();
        self
    }

    #[must_use]
    pub fn with_mask_var(mut self, mask_var: impl Into<String>) -> Self {
        self.mask_var = mask_var.into();
        self
    }

    pub fn count_with_mask(&self, mask: Option<&str>) -> Result<usize, DeviceQueryError> {
        if let Some(raw) = mask {
            if mask_entries(raw).next().is_none() {
                return Ok(0);
            }
        }

        let physical = self.physical_device_count()?;
        Ok(match mask {
            Some(raw) => visible_under_mask(raw, physical),
            None => physical,
        })
    }

    pub fn physical_device_count(&self) -> Result<usize, DeviceQueryError> {
        let tool = self.tool.display().to_string();
        let output = Command::new(&self.tool)
            .arg("--query-gpu=index")
            .arg("--format=csv,noheader")
            .output()
            .map_err(|error| DeviceQueryError::ToolUnavailable {
                tool: tool.clone(),
                reason: error.to_string(),
            })?;

        if !output.status.success() {
            return Err(DeviceQueryError::ToolFailed {
                tool,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(count_listing_lines(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl Default for VisibleDeviceQuery {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceQuery for VisibleDeviceQuery {
    fn visible_device_count(&self) -> Result<usize, DeviceQueryError> {
        let mask = std::env::var(&self.mask_var).ok();
        self.count_with_mask(mask.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDeviceCount(pub usize);

impl DeviceQuery for FixedDeviceCount {
    fn visible_device_count(&self) -> Result<usize, DeviceQueryError> {
        Ok(self.0)
    }
}

/// A host whose device layer cannot be queried at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnavailableDevices {
    pub reason: String,
}

impl DeviceQuery for UnavailableDevices {
    fn visible_device_count(&self) -> Result<usize, DeviceQueryError> {
        Err(DeviceQueryError::Unavailable(self.reason.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Admit { units: usize },
    DeviceCountMismatch { required: usize, available: usize },
    EnvironmentUnavailable { detail: String },
}

impl GateDecision {
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit { .. })
    }

    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Admit { .. } => "device_count_exact",
            Self::DeviceCountMismatch { .. } => "device_count_mismatch",
            Self::EnvironmentUnavailable { .. } => "device_environment_unavailable",
        }
    }
}

/// Admits a scenario only when the visible device count equals its
/// requirement exactly. Over-provisioned hosts are rejected too: extra devices
/// change placement and timing, and the same scenario must not run twice
/// across suites provisioned with different device counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGate<Q> {
    query: Q,
}

impl<Q: DeviceQuery> DeviceGate<Q> {
    #[must_use]
    pub fn new(query: Q) -> Self {
        Self { query }
    }

    #[must_use]
    pub fn query(&self) -> &Q {
        &self.query
    }

    #[must_use]
    pub fn check(&self, required_units: usize) -> GateDecision {
        match self.query.visible_device_count() {
            Ok(available) if available == required_units => GateDecision::Admit {
                units: available,
            },
            Ok(available) => GateDecision::DeviceCountMismatch {
                required: required_units,
                available,
            },
            Err(error) => GateDecision::EnvironmentUnavailable {
                detail: error.to_string(),
            },
        }
    }

    #[must_use]
    pub fn can_satisfy(&self, required_units: usize) -> bool {
        self.check(required_units).is_admitted()
    }

    #[must_use]
    pub fn check_scenario(&self, scenario: &Scenario) -> GateDecision {
        self.check(scenario.required_units())
    }
}

fn mask_entries(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|entry| !entry.is_empty())
}

/// Devices reachable through a visibility mask. Entries are consumed left to
/// right and the first invalid one ends the list.
#[must_use]
pub fn visible_under_mask(raw: &str, physical: usize) -> usize {
    let mut seen = Vec::new();
    for entry in mask_entries(raw) {
        let valid = if let Ok(index) = entry.parse::<i64>() {
            usize::try_from(index).is_ok_and(|index| index < physical)
        } else {
            entry.starts_with("GPU-") || entry.starts_with("MIG-")
        };
        if !valid || seen.contains(&entry) {
            break;
        }
        seen.push(entry);
    }
    seen.len().min(physical)
}

fn count_listing_lines(stdout: &str) -> usize {
    stdout.lines().filter(|line| !line.trim().is_empty()).count()
}

#[cfg(test)]
mod tests {
    use cp_core::{InvocationMethod, Scenario};
    use proptest::prelude::*;

    use super::{
        DeviceGate, DeviceQuery, DeviceQueryError, FixedDeviceCount, GateDecision,
        UnavailableDevices, VisibleDeviceQuery, count_listing_lines, visible_under_mask,
    };

    #[test]
    fn gate_admits_exact_count() {
        let gate = DeviceGate::new(FixedDeviceCount(4));
        assert_eq!(gate.check(4), GateDecision::Admit { units: 4 });
        assert!(gate.can_satisfy(4));
    }

    #[test]
    fn gate_rejects_under_and_over_provisioned_hosts() {
        let gate = DeviceGate::new(FixedDeviceCount(4));
        assert_eq!(
            gate.check(8),
            GateDecision::DeviceCountMismatch {
                required: 8,
                available: 4
            }
        );
        assert_eq!(
            gate.check(2),
            GateDecision::DeviceCountMismatch {
                required: 2,
                available: 4
            }
        );
    }

    #[test]
    fn query_failure_is_reported_separately() {
        let gate = DeviceGate::new(UnavailableDevices {
            reason: "driver not loaded".to_string(),
        });
        let decision = gate.check(1);
        assert_eq!(decision.reason_code(), "device_environment_unavailable");
        match decision {
            GateDecision::EnvironmentUnavailable { detail } => {
                assert!(detail.contains("driver not loaded"));
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn scenario_requirement_is_pp_times_tp() {
        let scenario = Scenario::new(
            "meta-llama/Llama-3.2-1B",
            2,
            2,
            "FLASHINFER",
            InvocationMethod::Generate,
            true,
        )
        .expect("valid scenario");
        assert!(DeviceGate::new(FixedDeviceCount(4)).check_scenario(&scenario).is_admitted());
        assert!(!DeviceGate::new(FixedDeviceCount(2)).check_scenario(&scenario).is_admitted());
    }

    #[test]
    fn gate_works_through_trait_objects() {
        let query: &dyn DeviceQuery = &FixedDeviceCount(1);
        assert!(DeviceGate::new(query).can_satisfy(1));
    }

    #[test]
    fn mask_counts_valid_prefix() {
        assert_eq!(visible_under_mask("0,1", 4), 2);
        assert_eq!(visible_under_mask("0, 2 ,3", 4), 3);
        assert_eq!(visible_under_mask("0,-1,2", 4), 1);
        assert_eq!(visible_under_mask("0,7,1", 4), 1);
        assert_eq!(visible_under_mask("1,1", 4), 1);
        assert_eq!(visible_under_mask("GPU-8a1f,GPU-9b2e", 4), 2);
        assert_eq!(visible_under_mask("bogus,0", 4), 0);
        assert_eq!(visible_under_mask("0,1,2", 2), 2);
    }

    #[test]
    fn empty_mask_short_circuits_without_tool() {
        let query = VisibleDeviceQuery::new().with_tool("/nonexistent/device-tool");
        assert_eq!(query.count_with_mask(Some("")), Ok(0));
        assert_eq!(query.count_with_mask(Some(" , ")), Ok(0));
    }

    #[test]
    fn missing_tool_is_tool_unavailable() {
        let query = VisibleDeviceQuery::new().with_tool("/nonexistent/device-tool");
        let err = query
            .count_with_mask(None)
            .expect_err("missing tool should fail");
        assert!(matches!(err, DeviceQueryError::ToolUnavailable { .. }));
        assert!(err.to_string().contains("/nonexistent/device-tool"));
    }

    #[test]
    fn tool_listing_ignores_blank_lines() {
        assert_eq!(count_listing_lines("0\n1\n\n2\n"), 3);
        assert_eq!(count_listing_lines(""), 0);
    }

    proptest! {
        #[test]
        fn prop_gate_admits_only_exact_match(available in 0usize..16, pp in 1usize..=4, tp in 1usize..=4) {
            let gate = DeviceGate::new(FixedDeviceCount(available));
            prop_assert_eq!(gate.can_satisfy(pp * tp), available == pp * tp);
        }

        #[test]
        fn prop_mask_never_exceeds_physical(indices in prop::collection::vec(0i64..8, 0..8), physical in 0usize..8) {
            let raw = indices.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
            prop_assert!(visible_under_mask(&raw, physical) <= physical);
        }
    }
}
