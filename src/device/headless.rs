//! Software composition device
//!
//! Behaves like a hwcomposer without touching any hardware: displays and
//! their configurations come from [`HeadlessConfig`], every submission is
//! recorded, and fences are real pipe descriptors so the fence discipline is
//! exercised exactly as on a device. A [`HeadlessProbe`] lets the owner look
//! at what was submitted, raise hardware events and inject failures.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{
    CompletionMode, ComposerDevice, CompositionType, ConfigId, DeviceInfo, DisplayAttributes,
    DisplayFrame, HwPowerMode, SourceCrop, HWC_DEVICE_API_VERSION_1_4,
};
use crate::dispatch::{monotonic_nanos, EventSink, HwEvent};
use crate::error::DeviceError;
use crate::fence::Fence;
use crate::layer::{BlendMode, Transform};
use crate::output::OutputId;

/// One simulated display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessOutput {
    pub connected: bool,
    /// Hardware layers, framebuffer target included
    pub layers: usize,
    pub modes: Vec<DisplayAttributes>,
    /// Index into `modes` the display starts with
    pub active: usize,
}

impl Default for HeadlessOutput {
    fn default() -> Self {
        Self {
            connected: true,
            layers: 4,
            modes: vec![DisplayAttributes {
                width: 1080,
                height: 1920,
                vsync_period_ns: 16_666_667,
                dpi_x: 400_000,
                dpi_y: 400_000,
                secure: false,
            }],
            active: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessConfig {
    pub name: String,
    pub api_version: u32,
    pub completion: CompletionMode,
    /// Hand out fences that are already signaled. When false they stay
    /// pending until [`HeadlessProbe::signal_fences`].
    pub signal_fences: bool,
    /// Raise vsync from a timer thread on every display with vsync enabled
    pub vsync_thread: bool,
    pub outputs: Vec<HeadlessOutput>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            name: "headless".into(),
            api_version: HWC_DEVICE_API_VERSION_1_4,
            completion: CompletionMode::RetireFence,
            signal_fences: true,
            vsync_thread: false,
            outputs: vec![HeadlessOutput::default()],
        }
    }
}

/// A power call as the device received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCall {
    Mode(HwPowerMode),
    Blank(bool),
}

/// One layer slot of a recorded submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedLayer {
    pub composition: CompositionType,
    pub handle: Option<u64>,
    pub source_crop: SourceCrop,
    pub display_frame: DisplayFrame,
    pub blend: BlendMode,
    pub transform: Transform,
    pub plane_alpha: u8,
    pub had_acquire_fence: bool,
}

/// One display's part of a recorded submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedFrame {
    pub output: OutputId,
    pub geometry_changed: bool,
    pub layers: Vec<SubmittedLayer>,
}

#[derive(Debug, Default)]
struct DeviceState {
    active: Vec<usize>,
    vsync_enabled: Vec<bool>,
    power_calls: Vec<(usize, PowerCall)>,
    submissions: Vec<SubmittedFrame>,
    /// Write ends of the fences the backend may still hold, to signal them
    /// and to tell whether the backend closed the read end
    fences: Vec<OwnedFd>,
    fences_created: usize,
    fail_power: usize,
    fail_submit: usize,
    sink: Option<EventSink>,
}

type Shared = Arc<Mutex<DeviceState>>;

fn lock(state: &Shared) -> MutexGuard<'_, DeviceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct HeadlessComposer {
    config: HeadlessConfig,
    state: Shared,
    vsync: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl HeadlessComposer {
    pub fn new(config: HeadlessConfig) -> Self {
        let state = DeviceState {
            active: config.outputs.iter().map(|o| o.active).collect(),
            vsync_enabled: vec![false; config.outputs.len()],
            ..DeviceState::default()
        };
        let mut composer = Self {
            config,
            state: Arc::new(Mutex::new(state)),
            vsync: None,
        };
        if composer.config.vsync_thread {
            composer.start_vsync_thread();
        }
        debug!(
            name = %composer.config.name,
            displays = composer.config.outputs.len(),
            "headless composer created"
        );
        composer
    }

    pub fn probe(&self) -> HeadlessProbe {
        HeadlessProbe {
            state: self.state.clone(),
        }
    }

    fn start_vsync_thread(&mut self) {
        let period = self
            .config
            .outputs
            .first()
            .and_then(|o| o.modes.get(o.active))
            .map(|m| m.vsync_period_ns)
            .filter(|p| *p > 0)
            .unwrap_or(16_666_667);
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let state = self.state.clone();

        let handle = thread::spawn(move || {
            while flag.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_nanos(period));
                let guard = lock(&state);
                let Some(sink) = guard.sink.clone() else {
                    continue;
                };
                let enabled: Vec<usize> = guard
                    .vsync_enabled
                    .iter()
                    .enumerate()
                    .filter_map(|(d, on)| (*on).then_some(d))
                    .collect();
                drop(guard);
                let timestamp_ns = monotonic_nanos();
                for display in enabled {
                    sink.send(HwEvent::Vsync {
                        display,
                        timestamp_ns,
                    });
                }
            }
        });
        self.vsync = Some((running, handle));
    }

    fn output(&self, display: usize, op: &'static str) -> Result<&HeadlessOutput, DeviceError> {
        self.config
            .outputs
            .get(display)
            .ok_or(DeviceError::new(op, -libc::EINVAL))
    }

    /// A pipe read end standing in for a sync fence.
    fn new_fence(&self, state: &mut DeviceState) -> Result<Fence, DeviceError> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            return Err(DeviceError::new("create_fence", -libc::EMFILE));
        }
        let read = unsafe { Fence::from_raw(fds[0]) };
        let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        if self.config.signal_fences {
            signal(&write);
        }
        state.fences.push(write);
        state.fences_created += 1;
        Ok(read)
    }
}

impl Drop for HeadlessComposer {
    fn drop(&mut self) {
        if let Some((running, handle)) = self.vsync.take() {
            running.store(false, Ordering::Relaxed);
            if handle.join().is_err() {
                warn!("vsync thread panicked");
            }
        }
    }
}

fn signal(write: &OwnedFd) {
    let byte = 1u8;
    unsafe { libc::write(write.as_raw_fd(), &byte as *const u8 as *const libc::c_void, 1) };
}

/// The read end of this pipe has been closed.
fn reader_closed(write: &OwnedFd) -> bool {
    let mut pfd = libc::pollfd {
        fd: write.as_raw_fd(),
        events: 0,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
    ret > 0 && pfd.revents & libc::POLLERR != 0
}

impl ComposerDevice for HeadlessComposer {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.config.name.clone(),
            api_version: self.config.api_version,
            completion: self.config.completion,
        }
    }

    fn display_count(&self) -> usize {
        self.config.outputs.len()
    }

    fn max_layers(&self, display: usize) -> usize {
        self.config.outputs.get(display).map_or(0, |o| o.layers)
    }

    fn display_configs(&mut self, display: usize) -> Result<Vec<ConfigId>, DeviceError> {
        let output = self.output(display, "get_display_configs")?;
        if !output.connected {
            return Err(DeviceError::new("get_display_configs", -libc::ENODEV));
        }
        Ok((0..output.modes.len() as ConfigId).collect())
    }

    fn display_attributes(
        &mut self,
        display: usize,
        config: ConfigId,
    ) -> Result<DisplayAttributes, DeviceError> {
        self.output(display, "get_display_attributes")?
            .modes
            .get(config as usize)
            .copied()
            .ok_or(DeviceError::new("get_display_attributes", -libc::EINVAL))
    }

    fn active_config(&mut self, display: usize) -> Result<ConfigId, DeviceError> {
        self.output(display, "get_active_config")?;
        lock(&self.state)
            .active
            .get(display)
            .map(|c| *c as ConfigId)
            .ok_or(DeviceError::new("get_active_config", -libc::EINVAL))
    }

    fn set_active_config(&mut self, display: usize, config: ConfigId) -> Result<(), DeviceError> {
        if self.config.api_version < HWC_DEVICE_API_VERSION_1_4 {
            return Err(DeviceError::new("set_active_config", -libc::ENOSYS));
        }
        let modes = self.output(display, "set_active_config")?.modes.len();
        if config as usize >= modes {
            return Err(DeviceError::new("set_active_config", -libc::EINVAL));
        }
        lock(&self.state).active[display] = config as usize;
        Ok(())
    }

    fn set_power_mode(&mut self, display: usize, mode: HwPowerMode) -> Result<(), DeviceError> {
        if self.config.api_version < HWC_DEVICE_API_VERSION_1_4 {
            return Err(DeviceError::new("set_power_mode", -libc::ENOSYS));
        }
        self.output(display, "set_power_mode")?;
        let mut state = lock(&self.state);
        if state.fail_power > 0 {
            state.fail_power -= 1;
            return Err(DeviceError::new("set_power_mode", -libc::EIO));
        }
        state.power_calls.push((display, PowerCall::Mode(mode)));
        Ok(())
    }

    fn blank(&mut self, display: usize, blank: bool) -> Result<(), DeviceError> {
        self.output(display, "blank")?;
        let mut state = lock(&self.state);
        if state.fail_power > 0 {
            state.fail_power -= 1;
            return Err(DeviceError::new("blank", -libc::EIO));
        }
        state.power_calls.push((display, PowerCall::Blank(blank)));
        Ok(())
    }

    fn set_vsync_enabled(&mut self, index: usize, enabled: bool) -> Result<(), DeviceError> {
        self.output(index, "event_control")?;
        lock(&self.state).vsync_enabled[index] = enabled;
        trace!(display = index, enabled, "vsync control");
        Ok(())
    }

    fn register_events(&mut self, sink: EventSink) {
        lock(&self.state).sink = Some(sink);
    }

    fn submit(
        &mut self,
        displays: &mut [Option<super::CompositionRequest>],
    ) -> Result<(), DeviceError> {
        let state_arc = self.state.clone();
        let mut state = lock(&state_arc);
        if state.fail_submit > 0 {
            state.fail_submit -= 1;
            return Err(DeviceError::new("set", -libc::EIO));
        }
        // Fences the backend has closed can never be waited on again
        state.fences.retain(|f| !reader_closed(f));

        for request in displays.iter_mut().flatten() {
            let mut frame = SubmittedFrame {
                output: request.output,
                geometry_changed: request.geometry_changed,
                layers: Vec::with_capacity(request.layers.len()),
            };
            for layer in request.layers.iter_mut() {
                // The device consumes acquire fences
                let acquire = layer.acquire_fence.take();
                frame.layers.push(SubmittedLayer {
                    composition: layer.composition,
                    handle: layer.handle.as_ref().map(|h| h.raw()),
                    source_crop: layer.source_crop,
                    display_frame: layer.display_frame,
                    blend: layer.blend,
                    transform: layer.transform,
                    plane_alpha: layer.plane_alpha,
                    had_acquire_fence: !acquire.is_none(),
                });
                if self.config.completion == CompletionMode::RetireFence
                    && layer.composition != CompositionType::Disabled
                {
                    layer.release_fence = self.new_fence(&mut state)?;
                }
            }
            if self.config.completion == CompletionMode::RetireFence {
                request.retire_fence = self.new_fence(&mut state)?;
            }
            trace!(output = ?request.output, layers = frame.layers.len(), "frame submitted");
            state.submissions.push(frame);
        }
        Ok(())
    }
}

/// Observation and fault-injection handle for a [`HeadlessComposer`].
#[derive(Clone)]
pub struct HeadlessProbe {
    state: Shared,
}

impl HeadlessProbe {
    pub fn submissions(&self) -> Vec<SubmittedFrame> {
        lock(&self.state).submissions.clone()
    }

    pub fn last_submission(&self) -> Option<SubmittedFrame> {
        lock(&self.state).submissions.last().cloned()
    }

    pub fn power_calls(&self) -> Vec<(usize, PowerCall)> {
        lock(&self.state).power_calls.clone()
    }

    pub fn vsync_enabled(&self, display: usize) -> bool {
        lock(&self.state)
            .vsync_enabled
            .get(display)
            .copied()
            .unwrap_or(false)
    }

    pub fn active_config(&self, display: usize) -> Option<usize> {
        lock(&self.state).active.get(display).copied()
    }

    /// Fail the next `count` power calls (either power mode or blank).
    pub fn fail_next_power(&self, count: usize) {
        lock(&self.state).fail_power = count;
    }

    pub fn fail_next_submit(&self, count: usize) {
        lock(&self.state).fail_submit = count;
    }

    /// Signal every fence handed out so far.
    pub fn signal_fences(&self) {
        for fence in lock(&self.state).fences.iter().filter(|f| !reader_closed(f)) {
            signal(fence);
        }
    }

    pub fn fences_created(&self) -> usize {
        lock(&self.state).fences_created
    }

    /// Fences the backend still holds open.
    pub fn open_fences(&self) -> usize {
        lock(&self.state)
            .fences
            .iter()
            .filter(|f| !reader_closed(f))
            .count()
    }

    fn emit(&self, event: HwEvent) -> bool {
        let sink = lock(&self.state).sink.clone();
        match sink {
            Some(sink) => {
                sink.send(event);
                true
            }
            None => false,
        }
    }

    /// Raise a vsync as the hardware would, stamped now. Returns the
    /// timestamp, or `None` when no backend is listening.
    pub fn vsync(&self, display: usize) -> Option<u64> {
        let timestamp_ns = monotonic_nanos();
        self.emit(HwEvent::Vsync {
            display,
            timestamp_ns,
        })
        .then_some(timestamp_ns)
    }

    /// Raise a vsync from a thread of its own.
    pub fn vsync_from_thread(&self, display: usize) -> thread::JoinHandle<Option<u64>> {
        let probe = self.clone();
        thread::spawn(move || probe.vsync(display))
    }

    pub fn hotplug(&self, display: usize, connected: bool) -> bool {
        self.emit(HwEvent::Hotplug { display, connected })
    }

    pub fn refresh(&self, display: usize) -> bool {
        self.emit(HwEvent::Refresh { display })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CompositionRequest, RequestLayer};

    fn request(layers: usize) -> CompositionRequest {
        let mut list: Vec<RequestLayer> = (0..layers).map(|_| RequestLayer::disabled()).collect();
        list[layers - 1].composition = CompositionType::FramebufferTarget;
        CompositionRequest {
            output: OutputId(0),
            layers: list,
            geometry_changed: true,
            retire_fence: Fence::none(),
        }
    }

    #[test]
    fn test_submit_hands_out_fences() {
        let mut device = HeadlessComposer::new(HeadlessConfig::default());
        let probe = device.probe();
        let mut displays = vec![Some(request(4))];
        device.submit(&mut displays).unwrap();

        let done = displays[0].take().unwrap();
        assert!(!done.retire_fence.is_none());
        assert!(done.retire_fence.is_signaled().unwrap());
        // Only the framebuffer target is enabled
        assert_eq!(done.layers.iter().filter(|l| !l.release_fence.is_none()).count(), 1);
        assert_eq!(probe.fences_created(), 2);
        assert_eq!(probe.open_fences(), 2);

        drop(done);
        assert_eq!(probe.open_fences(), 0);
    }

    #[test]
    fn test_closed_fences_are_pruned() {
        let mut device = HeadlessComposer::new(HeadlessConfig::default());
        let probe = device.probe();
        for _ in 0..2000 {
            let mut displays = vec![Some(request(4))];
            device.submit(&mut displays).unwrap();
        }
        assert_eq!(probe.fences_created(), 4000);
        // Only the last frame's write ends are still around
        assert!(lock(&device.state).fences.len() <= 2);
        assert_eq!(probe.open_fences(), 0);
    }

    #[test]
    fn test_pending_fences_until_signaled() {
        let mut device = HeadlessComposer::new(HeadlessConfig {
            signal_fences: false,
            ..HeadlessConfig::default()
        });
        let probe = device.probe();
        let mut displays = vec![Some(request(2))];
        device.submit(&mut displays).unwrap();

        let done = displays[0].take().unwrap();
        assert!(!done.retire_fence.is_signaled().unwrap());
        probe.signal_fences();
        assert!(done.retire_fence.is_signaled().unwrap());
    }

    #[test]
    fn test_old_devices_have_no_power_mode() {
        let mut device = HeadlessComposer::new(HeadlessConfig {
            api_version: crate::device::HWC_DEVICE_API_VERSION_1_3,
            ..HeadlessConfig::default()
        });
        assert!(device.set_power_mode(0, HwPowerMode::Normal).is_err());
        assert!(device.blank(0, false).is_ok());
        assert_eq!(device.probe().power_calls(), vec![(0, PowerCall::Blank(false))]);
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let mut device = HeadlessComposer::new(HeadlessConfig::default());
        let probe = device.probe();
        probe.fail_next_power(1);
        assert!(device.set_power_mode(0, HwPowerMode::Normal).is_err());
        assert!(device.set_power_mode(0, HwPowerMode::Normal).is_ok());
        assert_eq!(probe.power_calls().len(), 1);
    }

    #[test]
    fn test_config_from_toml() {
        let config: HeadlessConfig = toml::from_str(
            r#"
            completion = "vsync-callback"

            [[outputs]]
            layers = 3

            [[outputs]]
            connected = false
            "#,
        )
        .unwrap();
        assert_eq!(config.completion, CompletionMode::VsyncCallback);
        assert_eq!(config.outputs.len(), 2);
        assert_eq!(config.outputs[0].layers, 3);
        assert_eq!(config.outputs[0].modes.len(), 1);
        assert!(!config.outputs[1].connected);
    }
}
