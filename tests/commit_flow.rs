//! Commit, completion and hardware event delivery through the public API

mod common;

use std::sync::{Arc, Mutex};
use std::thread;

use common::{argb, backend, backend_with, readable, recorder};
use hwc_backend::device::headless::HeadlessConfig;
use hwc_backend::device::{CompletionMode, CompositionType, DisplayFrame};
use hwc_backend::{
    BackendConfig, ConnectionStatus, Error, ErrorKind, Fence, LayerId, OutputId, PowerState,
    Rect,
};

const OUTPUT: OutputId = OutputId(0);

fn layer(index: u32) -> LayerId {
    LayerId {
        output: OUTPUT,
        index,
    }
}

fn callback_config() -> HeadlessConfig {
    HeadlessConfig {
        completion: CompletionMode::VsyncCallback,
        ..HeadlessConfig::default()
    }
}

#[test]
fn test_overlay_geometry_reaches_device() {
    let (mut backend, probe) = backend(HeadlessConfig::default());
    assert_eq!(backend.layers(OUTPUT).unwrap().len(), 4);

    backend.bind_buffer(layer(0), argb(0xa0, 100, 100)).unwrap();
    backend
        .set_geometry(layer(0), Rect::new(0, 0, 100, 100), Rect::new(10, 10, 50, 50))
        .unwrap();
    backend.set_power_state(OUTPUT, PowerState::On).unwrap();
    backend.commit(OUTPUT, true, 0).unwrap();

    let frame = probe.last_submission().unwrap();
    assert_eq!(frame.layers.len(), 4);
    assert!(frame.geometry_changed);

    let overlay = &frame.layers[0];
    assert_eq!(overlay.composition, CompositionType::Overlay);
    assert_eq!(overlay.handle, Some(0xa0));
    assert_eq!(
        overlay.display_frame,
        DisplayFrame {
            left: 10,
            top: 10,
            right: 60,
            bottom: 60
        }
    );
    assert_eq!((overlay.source_crop.right, overlay.source_crop.bottom), (100.0, 100.0));

    for empty in &frame.layers[1..3] {
        assert_eq!(empty.composition, CompositionType::Disabled);
    }

    let target = &frame.layers[3];
    assert_eq!(target.composition, CompositionType::FramebufferTarget);
    assert_eq!(target.handle, None);
    assert!(!target.had_acquire_fence);
}

#[test]
fn test_geometry_flag_clears_after_commit() {
    let (mut backend, probe) = backend(HeadlessConfig::default());
    backend.set_power_state(OUTPUT, PowerState::On).unwrap();
    backend.commit(OUTPUT, true, 0).unwrap();
    backend.commit(OUTPUT, true, 0).unwrap();
    backend
        .set_geometry(layer(3), Rect::default(), Rect::new(0, 0, 540, 960))
        .unwrap();
    backend.commit(OUTPUT, true, 0).unwrap();

    let flags: Vec<bool> = probe
        .submissions()
        .iter()
        .map(|f| f.geometry_changed)
        .collect();
    assert_eq!(flags, vec![true, false, true]);
    let target = &probe.last_submission().unwrap().layers[3];
    assert_eq!(target.display_frame.right, 540);
}

#[test]
fn test_fences_do_not_outlive_two_generations() {
    let (mut backend, probe) = backend(HeadlessConfig::default());
    backend.set_power_state(OUTPUT, PowerState::On).unwrap();
    backend.bind_buffer(layer(1), argb(0xb0, 64, 64)).unwrap();

    let mut created_before = 0;
    for generation in 0..5u64 {
        backend.commit(OUTPUT, false, generation).unwrap();
        let created = probe.fences_created();
        // Only the newest frame's fences may still be open
        assert_eq!(probe.open_fences(), created - created_before);
        created_before = created;
    }

    drop(backend);
    assert_eq!(probe.open_fences(), 0);
}

#[test]
fn test_async_fence_commit_completes_in_handle_events() {
    let (mut backend, _probe) = backend(HeadlessConfig::default());
    let (seen, handler) = recorder();
    backend.set_commit_handler(OUTPUT, handler).unwrap();
    backend.set_power_state(OUTPUT, PowerState::On).unwrap();

    let sequence = backend.commit(OUTPUT, false, 99).unwrap();
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(backend.output(OUTPUT).unwrap().pending_commits(), 1);

    assert_eq!(backend.handle_events().unwrap(), 0);
    let events = seen.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].sequence, sequence);
    assert_eq!(events[0].user_data, 99);
    assert_eq!(events[0].output, OUTPUT);
}

#[test]
fn test_stalled_fence_reports_timeout() {
    let config = BackendConfig {
        fence_timeout_ms: 20,
        ..BackendConfig::default()
    };
    let (mut backend, probe) = backend_with(
        HeadlessConfig {
            signal_fences: false,
            ..HeadlessConfig::default()
        },
        config,
    );
    backend.set_power_state(OUTPUT, PowerState::On).unwrap();

    let err = backend.commit(OUTPUT, true, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert!(matches!(err, Error::FenceTimeout { .. }));

    probe.signal_fences();
    backend.handle_events().unwrap();
    assert_eq!(backend.output(OUTPUT).unwrap().pending_commits(), 0);
}

#[test]
fn test_vsync_from_foreign_thread_runs_handler_on_owner() {
    let (mut backend, probe) = backend(callback_config());
    let owner = thread::current().id();
    let ran_on = Arc::new(Mutex::new(Vec::new()));
    let ran = ran_on.clone();
    backend
        .set_commit_handler(OUTPUT, move |event| {
            ran.lock().unwrap().push((thread::current().id(), event.user_data));
        })
        .unwrap();
    backend.set_power_state(OUTPUT, PowerState::On).unwrap();

    backend.commit(OUTPUT, false, 5).unwrap();
    assert_eq!(backend.output(OUTPUT).unwrap().pending_commits(), 1);

    let timestamp = probe.vsync_from_thread(0).join().unwrap();
    assert!(timestamp.is_some());
    assert!(ran_on.lock().unwrap().is_empty());
    assert!(readable(backend.event_fd()));

    assert_eq!(backend.handle_events().unwrap(), 1);
    assert_eq!(*ran_on.lock().unwrap(), vec![(owner, 5)]);
    assert_eq!(backend.output(OUTPUT).unwrap().pending_commits(), 0);
    assert!(!readable(backend.event_fd()));
}

#[test]
fn test_vsync_without_handler_is_dropped() {
    let (mut backend, probe) = backend(callback_config());
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    backend
        .set_status_handler(OUTPUT, move |id, status| sink.lock().unwrap().push((id, status)))
        .unwrap();

    // Before any commit, and with no commit or vblank handler
    probe.vsync(0).unwrap();
    assert_eq!(backend.handle_events().unwrap(), 1);

    backend.set_power_state(OUTPUT, PowerState::On).unwrap();
    backend.commit(OUTPUT, false, 0).unwrap();
    probe.vsync(0).unwrap();
    assert_eq!(backend.handle_events().unwrap(), 1);

    assert_eq!(backend.output(OUTPUT).unwrap().pending_commits(), 0);
    assert!(statuses.lock().unwrap().is_empty());
}

#[test]
fn test_sync_commit_waits_for_vsync() {
    let (mut backend, _probe) = backend(HeadlessConfig {
        vsync_thread: true,
        ..callback_config()
    });
    let (seen, handler) = recorder();
    backend.set_commit_handler(OUTPUT, handler).unwrap();
    backend.set_power_state(OUTPUT, PowerState::On).unwrap();

    backend.commit(OUTPUT, true, 11).unwrap();
    let events = seen.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].user_data, 11);
    assert!(events[0].sequence >= 1);
}

#[test]
fn test_vblank_after_interval() {
    let (mut backend, probe) = backend(callback_config());
    let (seen, handler) = recorder();
    backend.set_vblank_handler(OUTPUT, handler).unwrap();
    backend.set_power_state(OUTPUT, PowerState::On).unwrap();

    backend.wait_vblank(OUTPUT, 2, false, 42).unwrap();
    probe.vsync(0).unwrap();
    backend.handle_events().unwrap();
    assert!(seen.lock().unwrap().is_empty());

    probe.vsync(0).unwrap();
    backend.handle_events().unwrap();
    let events = seen.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].user_data, 42);
    assert_eq!(events[0].sequence, 2);
}

#[test]
fn test_sync_vblank_with_vsync_thread() {
    let (mut backend, _probe) = backend(HeadlessConfig {
        vsync_thread: true,
        ..HeadlessConfig::default()
    });
    let (seen, handler) = recorder();
    backend.set_vblank_handler(OUTPUT, handler).unwrap();
    backend.set_power_state(OUTPUT, PowerState::On).unwrap();

    backend.wait_vblank(OUTPUT, 1, true, 3).unwrap();
    assert_eq!(seen.lock().unwrap()[0].user_data, 3);
}

#[test]
fn test_hotplug_updates_status_once() {
    let (mut backend, probe) = backend(HeadlessConfig::default());
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    backend
        .set_status_handler(OUTPUT, move |id, status| sink.lock().unwrap().push((id, status)))
        .unwrap();

    assert!(probe.hotplug(0, false));
    assert!(probe.hotplug(0, false));
    assert!(probe.hotplug(7, true));
    assert_eq!(backend.handle_events().unwrap(), 3);

    assert_eq!(
        *statuses.lock().unwrap(),
        vec![(OUTPUT, ConnectionStatus::Disconnected)]
    );
    assert_eq!(
        backend.output(OUTPUT).unwrap().status(),
        ConnectionStatus::Disconnected
    );
}

#[test]
fn test_failed_submit_is_operation_failed() {
    let (mut backend, probe) = backend(HeadlessConfig::default());
    backend.set_power_state(OUTPUT, PowerState::On).unwrap();
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
    let acquire = unsafe { Fence::from_raw(fds[0]) };
    let _write = unsafe { Fence::from_raw(fds[1]) };
    backend
        .bind_buffer_with_fence(layer(0), argb(0xc0, 32, 32), acquire)
        .unwrap();
    probe.fail_next_submit(1);

    let err = backend.commit(OUTPUT, true, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert!(backend.layer(layer(0)).unwrap().is_bound());

    // The retry still carries the buffer's acquire fence
    backend.commit(OUTPUT, true, 0).unwrap();
    let frame = probe.last_submission().unwrap();
    assert_eq!(frame.layers[0].handle, Some(0xc0));
    assert!(frame.layers[0].had_acquire_fence);
}

#[test]
fn test_long_run_keeps_descriptors_bounded() {
    let (mut backend, probe) = backend(HeadlessConfig::default());
    let (seen, handler) = recorder();
    backend.set_commit_handler(OUTPUT, handler).unwrap();
    backend.set_power_state(OUTPUT, PowerState::On).unwrap();
    backend.bind_buffer(layer(0), argb(0xd0, 64, 64)).unwrap();

    for frame in 0..2000u64 {
        backend.commit(OUTPUT, false, frame).unwrap();
        assert!(probe.open_fences() <= 4);
    }
    backend.handle_events().unwrap();
    assert_eq!(probe.fences_created(), 2000 * 3);
    assert_eq!(seen.lock().unwrap().len(), 2000);
}
