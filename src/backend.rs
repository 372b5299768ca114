//! The backend context
//!
//! [`Backend`] owns the composition device and everything known about its
//! outputs and layers. All front-end operations go through it, on the thread
//! that owns it; hardware events are queued by the device and only acted on
//! when that thread calls [`Backend::handle_events`] or blocks in a
//! synchronous commit or vblank wait.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::buffer::GraphicsBuffer;
use crate::commit::CommitEngine;
use crate::config::BackendConfig;
use crate::device::{CompletionMode, ComposerDevice, DeviceInfo};
use crate::dispatch::{
    fire_hotplug, fire_vblanks, EventQueue, FrameEvent, HwEvent, Timestamp, UserData, VblankWait,
};
use crate::fence::Fence;
use crate::layer::{Layer, LayerCaps, LayerId, LayerInfo, LayerRegistry, Rect};
use crate::output::{self, ConnectionStatus, Output, OutputCapability, OutputId, OutputMode};
use crate::power::{Capabilities, PowerState};
use crate::{Error, Result};

/// Display-wide capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayCapability {
    pub output_count: usize,
    /// Most hardware layers any output offers
    pub max_layer_count: usize,
}

pub struct Backend {
    device: Box<dyn ComposerDevice>,
    info: DeviceInfo,
    caps: Capabilities,
    engine: CommitEngine,
    outputs: Vec<Output>,
    events: EventQueue,
    config: BackendConfig,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("device", &self.info.name)
            .field("caps", &self.caps)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

fn output_entry(outputs: &mut [Output], id: OutputId) -> Result<&mut Output> {
    outputs
        .get_mut(id.index())
        .ok_or_else(|| Error::invalid(format!("no output {:?}", id)))
}

impl Backend {
    /// Take over an open composition device.
    ///
    /// Fails with `NotFound` when the device reports no display.
    pub fn new(mut device: Box<dyn ComposerDevice>, config: BackendConfig) -> Result<Self> {
        let info = device.info();
        let caps = Capabilities::resolve(&info);
        info!(
            device = %info.name,
            api_version = %format!("{:#010x}", caps.api_version),
            power = ?caps.power,
            mode = ?caps.mode,
            completion = ?caps.completion,
            "initializing hwcomposer backend"
        );

        let mut outputs = output::enumerate(device.as_mut())?;
        let events = EventQueue::new()?;
        device.register_events(events.sink());

        for output in outputs.iter_mut() {
            let display = output.id().index();
            if config.enable_vsync && output.status() == ConnectionStatus::Connected {
                if let Err(e) = device.set_vsync_enabled(display, true) {
                    warn!(output = ?output.id(), "failed to enable vsync: {}", e);
                }
            }
            if config.power_off_on_init {
                // The recorded state is already Off; a failure here only
                // means the panel stays as the bootloader left it
                let _ = caps
                    .power
                    .transition(device.as_mut(), output, PowerState::Off, config.enable_vsync);
            }
        }

        let engine = CommitEngine::new(caps.completion, config.fence_timeout());
        info!(outputs = outputs.len(), "hwcomposer backend ready");
        Ok(Self {
            device,
            info,
            caps,
            engine,
            outputs,
            events,
            config,
        })
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn capability(&self) -> DisplayCapability {
        DisplayCapability {
            output_count: self.outputs.len(),
            max_layer_count: self
                .outputs
                .iter()
                .map(|o| o.max_layers())
                .max()
                .unwrap_or(0),
        }
    }

    /// Every output, in hardware order. The list never changes.
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn output(&self, id: OutputId) -> Result<&Output> {
        self.outputs
            .get(id.index())
            .ok_or_else(|| Error::invalid(format!("no output {:?}", id)))
    }

    pub fn output_capability(&self, id: OutputId) -> Result<OutputCapability> {
        Ok(self.output(id)?.capability())
    }

    fn registry(&mut self, id: OutputId) -> Result<&mut LayerRegistry> {
        output_entry(&mut self.outputs, id)?.layers_mut()
    }

    /// The output's layers, created on first call.
    pub fn layers(&mut self, id: OutputId) -> Result<&[Layer]> {
        Ok(self.registry(id)?.layers())
    }

    pub fn layer(&mut self, layer: LayerId) -> Result<&Layer> {
        self.registry(layer.output)?.get(layer.index as usize)
    }

    pub fn layer_capability(&mut self, layer: LayerId) -> Result<LayerCaps> {
        Ok(self.layer(layer)?.capability())
    }

    pub fn set_layer_info(&mut self, layer: LayerId, info: LayerInfo) -> Result<()> {
        self.registry(layer.output)?
            .set_info(layer.index as usize, info)
    }

    pub fn layer_info(&mut self, layer: LayerId) -> Result<LayerInfo> {
        Ok(*self.layer(layer)?.info())
    }

    pub fn set_geometry(&mut self, layer: LayerId, src: Rect, dst: Rect) -> Result<()> {
        self.registry(layer.output)?
            .set_geometry(layer.index as usize, src, dst)
    }

    /// Bind a buffer whose contents are ready.
    pub fn bind_buffer(&mut self, layer: LayerId, buffer: Arc<dyn GraphicsBuffer>) -> Result<()> {
        self.bind_buffer_with_fence(layer, buffer, Fence::none())
    }

    /// Bind a buffer whose contents are ready once `acquire` signals.
    pub fn bind_buffer_with_fence(
        &mut self,
        layer: LayerId,
        buffer: Arc<dyn GraphicsBuffer>,
        acquire: Fence,
    ) -> Result<()> {
        self.registry(layer.output)?
            .bind_buffer(layer.index as usize, buffer, acquire)
    }

    pub fn unbind_buffer(&mut self, layer: LayerId) -> Result<()> {
        self.registry(layer.output)?
            .unbind_buffer(layer.index as usize)
    }

    /// No output property is writable; this only validates the output.
    pub fn set_output_property(&mut self, id: OutputId, property: u32, value: u64) -> Result<()> {
        self.output(id)?;
        debug!(output = ?id, property, value, "ignoring output property");
        Ok(())
    }

    pub fn output_property(&self, id: OutputId, _property: u32) -> Result<Option<u64>> {
        self.output(id)?;
        Ok(None)
    }

    pub fn set_layer_property(&mut self, layer: LayerId, property: u32, value: u64) -> Result<()> {
        self.layer(layer)?;
        debug!(?layer, property, value, "ignoring layer property");
        Ok(())
    }

    pub fn layer_property(&mut self, layer: LayerId, _property: u32) -> Result<Option<u64>> {
        self.layer(layer)?;
        Ok(None)
    }

    pub fn set_commit_handler<F>(&mut self, id: OutputId, handler: F) -> Result<()>
    where
        F: FnMut(&FrameEvent) + Send + 'static,
    {
        output_entry(&mut self.outputs, id)?.commit_handler = Some(Box::new(handler));
        Ok(())
    }

    pub fn clear_commit_handler(&mut self, id: OutputId) -> Result<()> {
        output_entry(&mut self.outputs, id)?.commit_handler = None;
        Ok(())
    }

    /// Submit the output's current layer state. Returns the frame's sequence
    /// number.
    ///
    /// With `sync` the call returns after the frame is on screen and the
    /// commit handler has run. The output should be powered on first.
    pub fn commit(&mut self, id: OutputId, sync: bool, user_data: UserData) -> Result<u32> {
        let output = output_entry(&mut self.outputs, id)?;
        let sequence = self
            .engine
            .commit(self.device.as_mut(), output, sync, user_data)?;

        if sync && self.engine.completion() == CompletionMode::VsyncCallback {
            let timeout = self.engine.fence_timeout();
            self.wait_until(timeout, "vsync completing the commit", |backend| {
                backend.outputs[id.index()]
                    .in_flight
                    .iter()
                    .all(|c| c.sequence != sequence)
            })?;
        }
        Ok(sequence)
    }

    pub fn set_vblank_handler<F>(&mut self, id: OutputId, handler: F) -> Result<()>
    where
        F: FnMut(&FrameEvent) + Send + 'static,
    {
        output_entry(&mut self.outputs, id)?.vblank_handler = Some(Box::new(handler));
        Ok(())
    }

    /// Ask for the vblank handler to run after `interval` vblanks.
    pub fn wait_vblank(
        &mut self,
        id: OutputId,
        interval: u32,
        sync: bool,
        user_data: UserData,
    ) -> Result<()> {
        if interval == 0 {
            return Err(Error::invalid("vblank interval must be at least 1"));
        }
        let output = output_entry(&mut self.outputs, id)?;
        if output.power_state() == PowerState::Off {
            return Err(Error::failed(format!("{:?} is powered off", id)));
        }

        let wait_id = output.next_vblank_id;
        output.next_vblank_id = output.next_vblank_id.wrapping_add(1);
        output.vblank_waits.push_back(VblankWait {
            id: wait_id,
            remaining: interval,
            user_data,
        });
        debug!(output = ?id, interval, sync, "vblank requested");

        if sync {
            let timeout = self
                .engine
                .fence_timeout()
                .checked_mul(interval)
                .unwrap_or(Duration::MAX);
            let result = self.wait_until(timeout, "vblank", |backend| {
                backend.outputs[id.index()]
                    .vblank_waits
                    .iter()
                    .all(|w| w.id != wait_id)
            });
            if result.is_err() {
                self.outputs[id.index()]
                    .vblank_waits
                    .retain(|w| w.id != wait_id);
            }
            result?;
        }
        Ok(())
    }

    pub fn set_status_handler<F>(&mut self, id: OutputId, handler: F) -> Result<()>
    where
        F: FnMut(OutputId, ConnectionStatus) + Send + 'static,
    {
        output_entry(&mut self.outputs, id)?.status_handler = Some(Box::new(handler));
        Ok(())
    }

    /// DPMS. On failure the previous state is kept.
    pub fn set_power_state(&mut self, id: OutputId, state: PowerState) -> Result<()> {
        let output = output_entry(&mut self.outputs, id)?;
        self.caps
            .power
            .transition(self.device.as_mut(), output, state, self.config.enable_vsync)
    }

    pub fn power_state(&self, id: OutputId) -> Result<PowerState> {
        Ok(self.output(id)?.power_state())
    }

    pub fn set_mode(&mut self, id: OutputId, mode_index: usize) -> Result<()> {
        let output = output_entry(&mut self.outputs, id)?;
        self.caps.mode.set_mode(self.device.as_mut(), output, mode_index)
    }

    /// Last successfully applied mode
    pub fn mode(&self, id: OutputId) -> Result<Option<OutputMode>> {
        Ok(self.output(id)?.current_mode().cloned())
    }

    /// Becomes readable when hardware events are waiting for
    /// [`Backend::handle_events`].
    pub fn event_fd(&self) -> RawFd {
        self.events.fd()
    }

    /// Act on queued hardware events and retired frames, running handlers on
    /// this thread. Returns the number of hardware events handled.
    pub fn handle_events(&mut self) -> Result<usize> {
        self.events.clear_wake();
        let mut handled = 0;
        while let Some(event) = self.events.try_next() {
            self.dispatch(event);
            handled += 1;
        }
        for output in self.outputs.iter_mut() {
            self.engine.poll_retired(output);
        }
        Ok(handled)
    }

    /// Pump hardware events until `done` holds or `timeout` runs out.
    fn wait_until<F>(&mut self, timeout: Duration, what: &'static str, mut done: F) -> Result<()>
    where
        F: FnMut(&Backend) -> bool,
    {
        let deadline = Instant::now().checked_add(timeout);
        while !done(self) {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                warn!(timeout = ?timeout, "timed out waiting for {}", what);
                return Err(Error::FenceTimeout { what, timeout });
            }
            if let Some(event) = self.events.next_timeout(remaining) {
                self.dispatch(event);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, event: HwEvent) {
        match event {
            HwEvent::Vsync {
                display: index,
                timestamp_ns,
            } => {
                let Some(output) = self.outputs.get_mut(index) else {
                    debug!(display = index, "vsync for unknown display");
                    return;
                };
                output.vsync_sequence = output.vsync_sequence.wrapping_add(1);
                let sequence = output.vsync_sequence;
                let timestamp = Timestamp::from_nanos(timestamp_ns);
                self.engine
                    .complete_on_vsync(output, timestamp_ns, sequence, timestamp);
                fire_vblanks(output, sequence, timestamp);
            }
            HwEvent::Hotplug {
                display: index,
                connected,
            } => match self.outputs.get_mut(index) {
                Some(output) => fire_hotplug(output, connected),
                None => warn!(display = index, connected, "hotplug for unknown display"),
            },
            HwEvent::Refresh { display: index } => {
                debug!(display = index, "device asked for a refresh");
            }
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if !self.config.enable_vsync {
            return;
        }
        for output in &self.outputs {
            if output.status() != ConnectionStatus::Connected {
                continue;
            }
            if let Err(e) = self.device.set_vsync_enabled(output.id().index(), false) {
                debug!(output = ?output.id(), "failed to disable vsync: {}", e);
            }
        }
    }
}
