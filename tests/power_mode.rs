//! DPMS and display mode selection across device API versions

mod common;

use common::backend;
use hwc_backend::device::headless::{HeadlessConfig, HeadlessOutput, PowerCall};
use hwc_backend::device::{DisplayAttributes, HwPowerMode, HWC_DEVICE_API_VERSION_1_3};
use hwc_backend::{ErrorKind, OutputId, PowerState};

const OUTPUT: OutputId = OutputId(0);

fn attrs(width: u32, height: u32, vsync_period_ns: u64) -> DisplayAttributes {
    DisplayAttributes {
        width,
        height,
        vsync_period_ns,
        dpi_x: 320_000,
        dpi_y: 320_000,
        secure: false,
    }
}

fn two_modes(api_version: u32) -> HeadlessConfig {
    HeadlessConfig {
        api_version,
        outputs: vec![HeadlessOutput {
            modes: vec![attrs(1080, 1920, 16_666_667), attrs(720, 1280, 16_666_667)],
            ..HeadlessOutput::default()
        }],
        ..HeadlessConfig::default()
    }
}

fn legacy() -> HeadlessConfig {
    HeadlessConfig {
        api_version: HWC_DEVICE_API_VERSION_1_3,
        ..HeadlessConfig::default()
    }
}

#[test]
fn test_dpms_sequence_keeps_state_on_failure() {
    let (mut backend, probe) = backend(HeadlessConfig::default());
    assert_eq!(backend.power_state(OUTPUT).unwrap(), PowerState::Off);

    backend.set_power_state(OUTPUT, PowerState::On).unwrap();
    assert_eq!(backend.power_state(OUTPUT).unwrap(), PowerState::On);

    probe.fail_next_power(1);
    let err = backend
        .set_power_state(OUTPUT, PowerState::Standby)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert_eq!(backend.power_state(OUTPUT).unwrap(), PowerState::On);

    backend.set_power_state(OUTPUT, PowerState::On).unwrap();
    backend.set_power_state(OUTPUT, PowerState::Off).unwrap();
    assert_eq!(backend.power_state(OUTPUT).unwrap(), PowerState::Off);

    let modes: Vec<PowerCall> = probe.power_calls().into_iter().map(|(_, c)| c).collect();
    assert_eq!(
        modes,
        vec![
            PowerCall::Mode(HwPowerMode::Off),
            PowerCall::Mode(HwPowerMode::Normal),
            PowerCall::Mode(HwPowerMode::Normal),
            PowerCall::Mode(HwPowerMode::Off),
        ]
    );
}

#[test]
fn test_unified_power_modes() {
    let (mut backend, probe) = backend(HeadlessConfig::default());
    for state in [PowerState::On, PowerState::Standby, PowerState::Suspend] {
        backend.set_power_state(OUTPUT, state).unwrap();
    }

    let calls = probe.power_calls();
    assert_eq!(
        calls[1..],
        [
            (0, PowerCall::Mode(HwPowerMode::Normal)),
            (0, PowerCall::Mode(HwPowerMode::Doze)),
            (0, PowerCall::Mode(HwPowerMode::DozeSuspend)),
        ]
    );
}

#[test]
fn test_legacy_device_blanks() {
    let (mut backend, probe) = backend(legacy());
    for state in [
        PowerState::On,
        PowerState::Standby,
        PowerState::Suspend,
        PowerState::Off,
    ] {
        backend.set_power_state(OUTPUT, state).unwrap();
        assert_eq!(backend.power_state(OUTPUT).unwrap(), state);
    }

    let calls: Vec<PowerCall> = probe.power_calls().into_iter().map(|(_, c)| c).collect();
    assert_eq!(
        calls,
        vec![
            PowerCall::Blank(true),
            PowerCall::Blank(false),
            PowerCall::Blank(false),
            PowerCall::Blank(false),
            PowerCall::Blank(true),
        ]
    );
}

#[test]
fn test_vsync_follows_power() {
    let (mut backend, probe) = backend(HeadlessConfig::default());
    assert!(probe.vsync_enabled(0));

    backend.set_power_state(OUTPUT, PowerState::On).unwrap();
    assert!(probe.vsync_enabled(0));

    backend.set_power_state(OUTPUT, PowerState::Off).unwrap();
    assert!(!probe.vsync_enabled(0));

    backend.set_power_state(OUTPUT, PowerState::Suspend).unwrap();
    assert!(probe.vsync_enabled(0));
}

#[test]
fn test_mode_out_of_range() {
    let (mut backend, _probe) = backend(two_modes(HeadlessConfig::default().api_version));
    backend.set_mode(OUTPUT, 0).unwrap();

    let err = backend.set_mode(OUTPUT, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    assert_eq!(backend.mode(OUTPUT).unwrap().unwrap().width, 1080);
}

#[test]
fn test_mode_switch_reaches_device() {
    let (mut backend, probe) = backend(two_modes(HeadlessConfig::default().api_version));
    assert_eq!(backend.mode(OUTPUT).unwrap(), None);
    assert_eq!(probe.active_config(0), Some(0));

    let modes = backend.output(OUTPUT).unwrap().modes().to_vec();
    assert_eq!(modes.len(), 2);
    assert!(modes[0].preferred);
    assert!(!modes[1].preferred);
    assert_eq!(modes[1].name, "720x1280@60");

    backend.set_mode(OUTPUT, 1).unwrap();
    assert_eq!(probe.active_config(0), Some(1));
    let current = backend.mode(OUTPUT).unwrap().unwrap();
    assert_eq!((current.width, current.height), (720, 1280));
}

#[test]
fn test_legacy_mode_is_fixed() {
    let (mut backend, probe) = backend(two_modes(HWC_DEVICE_API_VERSION_1_3));

    let err = backend.set_mode(OUTPUT, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert_eq!(backend.mode(OUTPUT).unwrap(), None);
    assert_eq!(probe.active_config(0), Some(0));

    backend.set_mode(OUTPUT, 0).unwrap();
    assert_eq!(backend.mode(OUTPUT).unwrap().unwrap().width, 1080);
}

#[test]
fn test_disconnected_output_has_no_modes() {
    let (mut backend, _probe) = backend(HeadlessConfig {
        outputs: vec![
            HeadlessOutput::default(),
            HeadlessOutput {
                connected: false,
                ..HeadlessOutput::default()
            },
        ],
        ..HeadlessConfig::default()
    });
    let external = OutputId(1);

    let cap = backend.output_capability(external).unwrap();
    assert!(cap.modes.is_empty());
    assert_eq!(
        backend.set_mode(external, 0).unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
    assert_eq!(backend.capability().output_count, 2);
}
