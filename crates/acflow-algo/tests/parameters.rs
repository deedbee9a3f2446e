//! Parameter file loading

use std::io::Write;

use acflow_algo::parameters::{BalanceType, ControlMode, HvdcFreezeMode};
use acflow_algo::{AcLoadFlowEngine, AcLoadFlowParameters};
use acflow_core::AcFlowError;
use tempfile::{tempdir, Builder};

#[test]
fn test_toml_file_drives_engine_assembly() {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
max_outer_loop_iterations = 12

[slack]
balance_type = "proportional_to_load"

[area_interchange]
enabled = true
max_mismatch_mw = 5.0

[voltage_control]
shunt_voltage_control = true
shunt_mode = "simple"

[hvdc]
freeze_mode = "asymmetric"
"#
    )
    .unwrap();

    let parameters = AcLoadFlowParameters::from_path(file.path()).unwrap();
    assert_eq!(parameters.max_outer_loop_iterations, 12);
    assert_eq!(parameters.slack.balance_type, BalanceType::ProportionalToLoad);
    assert_eq!(parameters.voltage_control.shunt_mode, ControlMode::Simple);
    assert_eq!(parameters.hvdc.freeze_mode, HvdcFreezeMode::Asymmetric);

    let engine = AcLoadFlowEngine::new(parameters).unwrap();
    assert_eq!(
        engine.build_outer_loops().loop_names(),
        vec![
            "area_interchange_control",
            "reactive_limits",
            "shunt_voltage_control",
            "ac_emulation_freeze",
            "ac_emulation",
        ]
    );
}

#[test]
fn test_json_file_round_trip_through_toml() {
    let dir = tempdir().unwrap();
    let json_path = dir.path().join("loadflow.json");
    std::fs::write(&json_path, r#"{"reactive_limits": {"max_pq_pv_switch": 5}}"#).unwrap();
    let parameters = AcLoadFlowParameters::from_path(&json_path).unwrap();
    assert_eq!(parameters.reactive_limits.max_pq_pv_switch, 5);

    let toml_path = dir.path().join("loadflow.toml");
    std::fs::write(&toml_path, parameters.to_toml_string().unwrap()).unwrap();
    let reloaded = AcLoadFlowParameters::from_path(&toml_path).unwrap();
    assert_eq!(reloaded.reactive_limits.max_pq_pv_switch, 5);
    assert!(reloaded.slack.distributed_slack);
}

#[test]
fn test_unsupported_extension_rejected() {
    let file = Builder::new().suffix(".yaml").tempfile().unwrap();
    let err = AcLoadFlowParameters::from_path(file.path()).unwrap_err();
    assert!(matches!(err, AcFlowError::Config(_)));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempdir().unwrap();
    let err = AcLoadFlowParameters::from_path(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, AcFlowError::Io(_)));
}

#[test]
fn test_invalid_values_rejected_on_load() {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[voltage_control]\nmax_tap_shift = 0").unwrap();
    let err = AcLoadFlowParameters::from_path(file.path()).unwrap_err();
    assert!(matches!(err, AcFlowError::Config(_)));
}
