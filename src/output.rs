//! Output registry
//!
//! One [`Output`] per hardware display, created once when the backend starts
//! and kept until it is dropped. Outputs are addressed by their hardware
//! display index.

use std::collections::VecDeque;
use std::fmt;

use tracing::{debug, info, warn};

use crate::commit::InFlightCommit;
use crate::device::{ComposerDevice, ConfigId, DisplayAttributes};
use crate::dispatch::{CommitHandler, StatusHandler, VblankHandler, VblankWait};
use crate::layer::LayerRegistry;
use crate::power::PowerState;
use crate::{Error, Result};

/// Identifies an output by hardware display index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OutputId(pub u32);

impl OutputId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputId({})", self.0)
    }
}

/// Display types from hwcomposer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Primary,
    External,
    Virtual,
}

impl OutputKind {
    fn from_index(index: usize) -> Self {
        match index {
            0 => OutputKind::Primary,
            1 => OutputKind::External,
            _ => OutputKind::Virtual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// A display configuration the output can be switched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMode {
    pub width: u32,
    pub height: u32,
    /// Hz
    pub refresh: u32,
    pub vsync_period_ns: u64,
    /// The configuration the hardware was running when we started
    pub preferred: bool,
    pub name: String,
    pub config: ConfigId,
}

impl OutputMode {
    fn from_attributes(config: ConfigId, attrs: &DisplayAttributes, preferred: bool) -> Self {
        let refresh = attrs.refresh_hz();
        Self {
            width: attrs.width,
            height: attrs.height,
            refresh,
            vsync_period_ns: attrs.vsync_period_ns,
            preferred,
            name: format!("{}x{}@{}", attrs.width, attrs.height, refresh),
            config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputCapability {
    pub kind: OutputKind,
    pub status: ConnectionStatus,
    pub modes: Vec<OutputMode>,
    pub mm_width: u32,
    pub mm_height: u32,
    pub max_layers: usize,
    pub secure: bool,
}

pub struct Output {
    id: OutputId,
    kind: OutputKind,
    pub(crate) status: ConnectionStatus,
    modes: Vec<OutputMode>,
    physical_size_mm: (u32, u32),
    secure: bool,
    max_layers: usize,
    pub(crate) current_mode: Option<usize>,
    pub(crate) power: PowerState,
    pub(crate) layers: Option<LayerRegistry>,
    pub(crate) commit_handler: Option<CommitHandler>,
    pub(crate) vblank_handler: Option<VblankHandler>,
    pub(crate) status_handler: Option<StatusHandler>,
    pub(crate) vblank_waits: VecDeque<VblankWait>,
    pub(crate) in_flight: VecDeque<InFlightCommit>,
    pub(crate) vsync_sequence: u32,
    pub(crate) commit_sequence: u32,
    pub(crate) next_vblank_id: u64,
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("modes", &self.modes.len())
            .field("current_mode", &self.current_mode)
            .field("power", &self.power)
            .field("layers", &self.layers.as_ref().map(|l| l.len()))
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl Output {
    fn new(id: OutputId, max_layers: usize) -> Self {
        Self {
            id,
            kind: OutputKind::from_index(id.index()),
            status: ConnectionStatus::Disconnected,
            modes: Vec::new(),
            physical_size_mm: (0, 0),
            secure: false,
            max_layers,
            current_mode: None,
            power: PowerState::Off,
            layers: None,
            commit_handler: None,
            vblank_handler: None,
            status_handler: None,
            vblank_waits: VecDeque::new(),
            in_flight: VecDeque::new(),
            vsync_sequence: 0,
            commit_sequence: 0,
            next_vblank_id: 0,
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn modes(&self) -> &[OutputMode] {
        &self.modes
    }

    /// Last successfully applied mode
    pub fn current_mode(&self) -> Option<&OutputMode> {
        self.current_mode.and_then(|i| self.modes.get(i))
    }

    pub fn power_state(&self) -> PowerState {
        self.power
    }

    pub fn physical_size_mm(&self) -> (u32, u32) {
        self.physical_size_mm
    }

    pub fn max_layers(&self) -> usize {
        self.max_layers
    }

    /// Commits submitted but not yet reported complete
    pub fn pending_commits(&self) -> usize {
        self.in_flight.iter().filter(|c| !c.delivered).count()
    }

    pub fn capability(&self) -> OutputCapability {
        OutputCapability {
            kind: self.kind,
            status: self.status,
            modes: self.modes.clone(),
            mm_width: self.physical_size_mm.0,
            mm_height: self.physical_size_mm.1,
            max_layers: self.max_layers,
            secure: self.secure,
        }
    }

    /// Screen size the framebuffer target covers when the caller gave no
    /// destination: the applied mode, else the preferred one.
    pub(crate) fn screen_size(&self) -> (u32, u32) {
        self.current_mode()
            .or_else(|| self.modes.iter().find(|m| m.preferred))
            .or_else(|| self.modes.first())
            .map_or((0, 0), |m| (m.width, m.height))
    }

    pub fn layers(&self) -> Option<&LayerRegistry> {
        self.layers.as_ref()
    }

    /// The layer list, created on first use.
    pub(crate) fn layers_mut(&mut self) -> Result<&mut LayerRegistry> {
        if self.layers.is_none() {
            self.layers = Some(LayerRegistry::new(self.id, self.max_layers)?);
        }
        self.layers
            .as_mut()
            .ok_or_else(|| Error::failed("layer list missing after creation"))
    }
}

/// Build the output list from what the device reports.
///
/// A display whose configurations cannot be read is kept, marked disconnected.
pub(crate) fn enumerate(device: &mut dyn ComposerDevice) -> Result<Vec<Output>> {
    let count = device.display_count();
    if count == 0 {
        return Err(Error::NotFound("device reports no displays".into()));
    }

    let mut outputs = Vec::new();
    outputs
        .try_reserve_exact(count)
        .map_err(Error::oom("output list"))?;

    for display in 0..count {
        let id = OutputId(display as u32);
        let mut output = Output::new(id, device.max_layers(display));

        let configs = match device.display_configs(display) {
            Ok(configs) if !configs.is_empty() => configs,
            Ok(_) => {
                debug!(output = ?id, "no configurations, treating as disconnected");
                outputs.push(output);
                continue;
            }
            Err(e) => {
                debug!(
                    output = ?id,
                    "cannot read configurations ({}), treating as disconnected", e
                );
                outputs.push(output);
                continue;
            }
        };

        let active = device.active_config(display).unwrap_or(configs[0]);
        let mut modes = Vec::new();
        modes
            .try_reserve_exact(configs.len())
            .map_err(Error::oom("mode list"))?;

        for config in configs {
            match device.display_attributes(display, config) {
                Ok(attrs) => {
                    if config == active {
                        output.physical_size_mm = attrs.physical_size_mm();
                        output.secure = attrs.secure;
                    }
                    modes.push(OutputMode::from_attributes(config, &attrs, config == active));
                }
                Err(e) => warn!(output = ?id, config, "skipping configuration: {}", e),
            }
        }

        if modes.is_empty() {
            warn!(output = ?id, "no usable configuration, treating as disconnected");
        } else {
            output.status = ConnectionStatus::Connected;
            info!(
                output = ?id,
                kind = ?output.kind,
                modes = modes.len(),
                layers = output.max_layers,
                "output found"
            );
        }
        output.modes = modes;
        outputs.push(output);
    }

    Ok(outputs)
}
