//! Load flow parameters.
//!
//! [`AcLoadFlowParameters`] selects which outer loops run and tunes them.
//! Every section uses `#[serde(default)]`, so partial TOML or JSON documents
//! only need the values that differ from the defaults.
//!
//! ```toml
//! max_outer_loop_iterations = 30
//!
//! [slack]
//! balance_type = "proportional_to_generation_p"
//! failure_behavior = "fail"
//!
//! [voltage_control]
//! transformer_voltage_control = true
//! transformer_mode = "incremental"
//! ```

use std::path::Path;

use acflow_core::{AcFlowError, AcFlowResult, BASE_MVA};
use serde::{Deserialize, Serialize};

use crate::solver::VoltageInitializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoltageInitMode {
    /// Flat start: 1 p.u., 0 rad
    UniformValues,
    /// Start from the voltages stored in the network
    PreviousValues,
}

impl VoltageInitMode {
    pub fn initializer(self) -> VoltageInitializer {
        match self {
            VoltageInitMode::UniformValues => VoltageInitializer::Uniform,
            VoltageInitMode::PreviousValues => VoltageInitializer::Previous,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceType {
    ProportionalToGenerationP,
    ProportionalToGenerationPMax,
    ProportionalToGenerationRemainingMargin,
    ProportionalToLoad,
}

/// What to do when active power cannot be fully distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlackDistributionFailureBehavior {
    /// Abort the session with an error
    Throw,
    /// Keep the residual on the slack bus
    LeaveOnSlackBus,
    /// Report `Failed` and roll the attempt back
    Fail,
}

/// Simple controls round once; incremental controls step with sensitivities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Simple,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvdcFreezeMode {
    /// No warm-start freezing
    None,
    /// Freeze every AC emulation link
    AllLinks,
    /// Freeze only links whose limits or losses differ per direction
    Asymmetric,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonRaphsonParameters {
    pub max_iterations: usize,
    /// Largest acceptable equation mismatch (p.u.)
    pub tolerance: f64,
    pub min_realistic_voltage: f64,
    pub max_realistic_voltage: f64,
}

impl Default for NewtonRaphsonParameters {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            tolerance: 1e-6,
            min_realistic_voltage: 0.5,
            max_realistic_voltage: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackParameters {
    pub distributed_slack: bool,
    pub balance_type: BalanceType,
    /// Tolerated slack bus mismatch (MW)
    pub max_mismatch_mw: f64,
    pub failure_behavior: SlackDistributionFailureBehavior,
}

impl Default for SlackParameters {
    fn default() -> Self {
        Self {
            distributed_slack: true,
            balance_type: BalanceType::ProportionalToGenerationPMax,
            max_mismatch_mw: 1.0,
            failure_behavior: SlackDistributionFailureBehavior::LeaveOnSlackBus,
        }
    }
}

impl SlackParameters {
    pub fn max_mismatch_pu(&self) -> f64 {
        self.max_mismatch_mw / BASE_MVA
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaInterchangeParameters {
    pub enabled: bool,
    /// Absolute tolerance on an area interchange (MW)
    pub max_mismatch_mw: f64,
    /// Tolerance relative to the area target
    pub relative_mismatch: f64,
}

impl Default for AreaInterchangeParameters {
    fn default() -> Self {
        Self {
            enabled: false,
            max_mismatch_mw: 2.0,
            relative_mismatch: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactiveLimitsParameters {
    pub enabled: bool,
    /// PQ to PV switches allowed per bus and session
    pub max_pq_pv_switch: usize,
    /// Switch PQ buses back to PV when their voltage leaves its limits
    pub voltage_monitoring: bool,
}

impl Default for ReactiveLimitsParameters {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pq_pv_switch: 3,
            voltage_monitoring: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoltageControlParameters {
    pub transformer_voltage_control: bool,
    pub transformer_mode: ControlMode,
    pub transformer_reactive_power_control: bool,
    pub shunt_voltage_control: bool,
    pub shunt_mode: ControlMode,
    /// Tap moves allowed per controller and pass in incremental mode
    pub max_tap_shift: usize,
    pub phase_shifter_control: bool,
    pub secondary_voltage_control: bool,
    /// Pilot deviation below which a zone is left alone (p.u.)
    pub secondary_voltage_deadband: f64,
}

impl Default for VoltageControlParameters {
    fn default() -> Self {
        Self {
            transformer_voltage_control: false,
            transformer_mode: ControlMode::Incremental,
            transformer_reactive_power_control: false,
            shunt_voltage_control: false,
            shunt_mode: ControlMode::Incremental,
            max_tap_shift: 3,
            phase_shifter_control: false,
            secondary_voltage_control: false,
            secondary_voltage_deadband: 1e-4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HvdcParameters {
    pub ac_emulation: bool,
    /// Mode switches allowed per link and session
    pub max_mode_switch: usize,
    pub freeze_mode: HvdcFreezeMode,
}

impl Default for HvdcParameters {
    fn default() -> Self {
        Self {
            ac_emulation: true,
            max_mode_switch: 2,
            freeze_mode: HvdcFreezeMode::None,
        }
    }
}

/// Full parameter set of an AC load flow session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcLoadFlowParameters {
    pub voltage_init_mode: VoltageInitMode,
    pub max_outer_loop_iterations: usize,
    /// Run overload-management automata
    pub overload_management: bool,
    pub newton_raphson: NewtonRaphsonParameters,
    pub slack: SlackParameters,
    pub area_interchange: AreaInterchangeParameters,
    pub reactive_limits: ReactiveLimitsParameters,
    pub voltage_control: VoltageControlParameters,
    pub hvdc: HvdcParameters,
}

impl Default for AcLoadFlowParameters {
    fn default() -> Self {
        Self {
            voltage_init_mode: VoltageInitMode::UniformValues,
            max_outer_loop_iterations: 20,
            overload_management: false,
            newton_raphson: NewtonRaphsonParameters::default(),
            slack: SlackParameters::default(),
            area_interchange: AreaInterchangeParameters::default(),
            reactive_limits: ReactiveLimitsParameters::default(),
            voltage_control: VoltageControlParameters::default(),
            hvdc: HvdcParameters::default(),
        }
    }
}

impl AcLoadFlowParameters {
    pub fn from_toml_str(contents: &str) -> AcFlowResult<Self> {
        let parameters: Self = toml::from_str(contents)?;
        parameters.validate()?;
        Ok(parameters)
    }

    pub fn from_json_str(contents: &str) -> AcFlowResult<Self> {
        let parameters: Self = serde_json::from_str(contents)?;
        parameters.validate()?;
        Ok(parameters)
    }

    /// Load parameters from a `.toml` or `.json` file.
    pub fn from_path(path: impl AsRef<Path>) -> AcFlowResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            Some("toml") => Self::from_toml_str(&contents),
            other => Err(AcFlowError::Config(format!(
                "unsupported parameter file extension {other:?} for {}",
                path.display()
            ))),
        }
    }

    pub fn to_toml_string(&self) -> AcFlowResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> AcFlowResult<()> {
        let nr = &self.newton_raphson;
        if nr.max_iterations == 0 {
            return Err(AcFlowError::Config(
                "newton_raphson.max_iterations must be positive".into(),
            ));
        }
        if !(nr.tolerance > 0.0) {
            return Err(AcFlowError::Config(format!(
                "newton_raphson.tolerance must be positive, got {}",
                nr.tolerance
            )));
        }
        if nr.min_realistic_voltage >= nr.max_realistic_voltage {
            return Err(AcFlowError::Config(format!(
                "realistic voltage range [{}, {}] is empty",
                nr.min_realistic_voltage, nr.max_realistic_voltage
            )));
        }
        if self.max_outer_loop_iterations == 0 {
            return Err(AcFlowError::Config("max_outer_loop_iterations must be positive".into()));
        }
        if self.slack.max_mismatch_mw < 0.0 || self.area_interchange.max_mismatch_mw < 0.0 {
            return Err(AcFlowError::Config("mismatch thresholds must not be negative".into()));
        }
        if self.area_interchange.relative_mismatch < 0.0 {
            return Err(AcFlowError::Config(
                "area_interchange.relative_mismatch must not be negative".into(),
            ));
        }
        if self.voltage_control.max_tap_shift == 0 {
            return Err(AcFlowError::Config(
                "voltage_control.max_tap_shift must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters() {
        let parameters = AcLoadFlowParameters::default();
        assert_eq!(parameters.newton_raphson.max_iterations, 15);
        assert_eq!(parameters.max_outer_loop_iterations, 20);
        assert_eq!(parameters.reactive_limits.max_pq_pv_switch, 3);
        assert_eq!(parameters.hvdc.max_mode_switch, 2);
        assert!((parameters.slack.max_mismatch_pu() - 0.01).abs() < 1e-12);
        assert!(parameters.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
            max_outer_loop_iterations = 7

            [slack]
            failure_behavior = "fail"

            [voltage_control]
            transformer_voltage_control = true
            transformer_mode = "simple"
        "#;
        let parameters = AcLoadFlowParameters::from_toml_str(toml).unwrap();
        assert_eq!(parameters.max_outer_loop_iterations, 7);
        assert_eq!(parameters.slack.failure_behavior, SlackDistributionFailureBehavior::Fail);
        assert!(parameters.slack.distributed_slack);
        assert_eq!(parameters.voltage_control.transformer_mode, ControlMode::Simple);
        assert_eq!(parameters.voltage_control.shunt_mode, ControlMode::Incremental);
    }

    #[test]
    fn test_json_and_validation() {
        let parameters =
            AcLoadFlowParameters::from_json_str(r#"{"hvdc": {"freeze_mode": "all_links"}}"#)
                .unwrap();
        assert_eq!(parameters.hvdc.freeze_mode, HvdcFreezeMode::AllLinks);

        let err = AcLoadFlowParameters::from_json_str(r#"{"newton_raphson": {"tolerance": 0.0}}"#);
        assert!(matches!(err, Err(AcFlowError::Config(_))));

        let err = AcLoadFlowParameters::from_toml_str("max_outer_loop_iterations = \"many\"");
        assert!(matches!(err, Err(AcFlowError::Parse(_))));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut parameters = AcLoadFlowParameters::default();
        parameters.voltage_control.max_tap_shift = 5;
        let text = parameters.to_toml_string().unwrap();
        let parsed = AcLoadFlowParameters::from_toml_str(&text).unwrap();
        assert_eq!(parsed.voltage_control.max_tap_shift, 5);
    }
}
