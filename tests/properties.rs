//! Property tests for layer enumeration and power state tracking

mod common;

use common::backend;
use hwc_backend::device::headless::{HeadlessConfig, HeadlessOutput};
use hwc_backend::{ErrorKind, LayerId, LayerInfo, LayerRole, OutputId, PowerState, Rect, Transform};
use proptest::prelude::*;

const OUTPUT: OutputId = OutputId(0);

fn with_layers(layers: usize) -> HeadlessConfig {
    HeadlessConfig {
        outputs: vec![HeadlessOutput {
            layers,
            ..HeadlessOutput::default()
        }],
        ..HeadlessConfig::default()
    }
}

fn power_state() -> impl Strategy<Value = PowerState> {
    prop_oneof![
        Just(PowerState::On),
        Just(PowerState::Standby),
        Just(PowerState::Suspend),
        Just(PowerState::Off),
    ]
}

fn transform() -> impl Strategy<Value = Transform> {
    prop_oneof![
        Just(Transform::Normal),
        Just(Transform::Rot90),
        Just(Transform::Rot180),
        Just(Transform::Rot270),
        Just(Transform::Flipped),
        Just(Transform::Flipped90),
        Just(Transform::Flipped180),
        Just(Transform::Flipped270),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Asking for the layer list again hands back the same layers.
    #[test]
    fn layers_are_created_once(count in 1usize..9, calls in 1usize..5) {
        let (mut backend, _probe) = backend(with_layers(count));
        let first: Vec<LayerId> = backend.layers(OUTPUT).unwrap().iter().map(|l| l.id()).collect();
        prop_assert_eq!(first.len(), count);

        for _ in 0..calls {
            let again: Vec<LayerId> =
                backend.layers(OUTPUT).unwrap().iter().map(|l| l.id()).collect();
            prop_assert_eq!(&again, &first);
        }

        let layers = backend.layers(OUTPUT).unwrap();
        for (index, layer) in layers.iter().enumerate() {
            let expected = if index == count - 1 {
                LayerRole::PrimaryTarget
            } else {
                LayerRole::Overlay
            };
            prop_assert_eq!(layer.role(), expected);
        }
    }

    /// The recorded power state is always the last one the device accepted.
    #[test]
    fn power_state_tracks_last_success(
        steps in prop::collection::vec((power_state(), any::<bool>()), 1..24)
    ) {
        let (mut backend, probe) = backend(HeadlessConfig::default());
        let mut expected = PowerState::Off;

        for (state, fail) in steps {
            if fail {
                probe.fail_next_power(1);
            }
            let result = backend.set_power_state(OUTPUT, state);
            if fail {
                prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::OperationFailed);
            } else {
                prop_assert!(result.is_ok());
                expected = state;
            }
            prop_assert_eq!(backend.power_state(OUTPUT).unwrap(), expected);
        }
    }

    /// No geometry update turns the framebuffer target into something else.
    #[test]
    fn primary_role_is_fixed(
        count in 1usize..6,
        updates in prop::collection::vec((transform(), 0i32..100, 1u32..500), 1..16)
    ) {
        let (mut backend, _probe) = backend(with_layers(count));
        let primary = LayerId { output: OUTPUT, index: (count - 1) as u32 };

        for (transform, offset, extent) in updates {
            let info = LayerInfo {
                dst: Rect::new(offset, offset, extent, extent),
                transform,
                ..LayerInfo::default()
            };
            let result = backend.set_layer_info(primary, info);
            if transform == Transform::Normal {
                prop_assert!(result.is_ok());
                prop_assert_eq!(backend.layer_info(primary).unwrap().dst, info.dst);
            } else {
                prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidParameter);
            }
            prop_assert_eq!(backend.layer(primary).unwrap().role(), LayerRole::PrimaryTarget);
        }
    }
}
