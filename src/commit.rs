//! Commit engine
//!
//! Turns an output's layer state into a [`CompositionRequest`], submits it,
//! and tracks the submitted frame until the hardware reports it done.
//!
//! With retire fences, at most one frame per output is outstanding: before a
//! new frame goes down, the fences of the previous one are waited (bounded)
//! and closed. With vsync callbacks nothing blocks; a vsync stamped at or
//! after a frame's submit time completes it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::buffer::GraphicsBuffer;
use crate::device::{
    CompletionMode, ComposerDevice, CompositionRequest, CompositionType, RequestLayer,
};
use crate::dispatch::{fire_commit, monotonic_nanos, FrameEvent, Timestamp, UserData};
use crate::fence::{Fence, FenceWait};
use crate::layer::{Layer, Rect, Transform};
use crate::output::{Output, OutputId};
use crate::power::PowerState;
use crate::{Error, Result};

/// A submitted frame the front end has not been told about yet, or whose
/// buffers the device may still be reading.
pub(crate) struct InFlightCommit {
    pub(crate) sequence: u32,
    pub(crate) user_data: UserData,
    pub(crate) submitted_ns: u64,
    /// Completion already handed to the commit handler
    pub(crate) delivered: bool,
    retire: Fence,
    releases: Vec<Fence>,
    _buffers: Vec<Arc<dyn GraphicsBuffer>>,
}

impl InFlightCommit {
    fn frame_event(&self, output: OutputId, timestamp: Timestamp) -> FrameEvent {
        FrameEvent {
            output,
            sequence: self.sequence,
            timestamp,
            user_data: self.user_data,
        }
    }
}

impl fmt::Debug for InFlightCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightCommit")
            .field("sequence", &self.sequence)
            .field("delivered", &self.delivered)
            .field("retire", &self.retire.as_raw())
            .field("releases", &self.releases.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CommitEngine {
    completion: CompletionMode,
    fence_timeout: Duration,
}

impl CommitEngine {
    pub(crate) fn new(completion: CompletionMode, fence_timeout: Duration) -> Self {
        Self {
            completion,
            fence_timeout,
        }
    }

    pub(crate) fn completion(&self) -> CompletionMode {
        self.completion
    }

    pub(crate) fn fence_timeout(&self) -> Duration {
        self.fence_timeout
    }

    /// Submit the output's current layer state. Returns the commit's sequence
    /// number.
    ///
    /// A synchronous commit in fence mode returns once the frame has retired
    /// and the handler has run; in callback mode the caller waits for the
    /// vsync that completes it.
    pub(crate) fn commit(
        &self,
        device: &mut dyn ComposerDevice,
        output: &mut Output,
        sync: bool,
        user_data: UserData,
    ) -> Result<u32> {
        let id = output.id();
        let count = device.display_count();
        if id.index() >= count {
            return Err(Error::invalid(format!("{:?} unknown to the device", id)));
        }
        if output.power == PowerState::Off {
            warn!(output = ?id, "commit while powered off");
        }

        if self.completion == CompletionMode::RetireFence {
            self.retire_previous(output)?;
        }

        let (request, buffers) = build_request(output)?;
        let mut displays = Vec::new();
        displays
            .try_reserve_exact(count)
            .map_err(Error::oom("display request list"))?;
        displays.resize_with(count, || None);
        displays[id.index()] = Some(request);

        let submitted_ns = monotonic_nanos();
        if let Err(e) = device.submit(&mut displays) {
            warn!(output = ?id, "submit rejected: {}", e);
            return Err(e.into());
        }
        let Some(mut request) = displays[id.index()].take() else {
            return Err(Error::failed("device dropped the composition request"));
        };
        consume_acquire_fences(output);

        let releases: Vec<Fence> = request
            .layers
            .iter_mut()
            .map(|layer| layer.release_fence.take())
            .filter(|fence| !fence.is_none())
            .collect();
        if let Some(layers) = output.layers.as_mut() {
            layers.geometry_changed = false;
        }
        output.commit_sequence = output.commit_sequence.wrapping_add(1);
        let sequence = output.commit_sequence;
        debug!(
            output = ?id,
            sequence,
            releases = releases.len(),
            retire = request.retire_fence.as_raw(),
            "frame submitted"
        );
        output.in_flight.push_back(InFlightCommit {
            sequence,
            user_data,
            submitted_ns,
            delivered: false,
            retire: request.retire_fence.take(),
            releases,
            _buffers: buffers,
        });

        if sync && self.completion == CompletionMode::RetireFence {
            self.wait_retired(output)?;
        }
        Ok(sequence)
    }

    /// Wait out and close every fence of earlier frames, delivering any
    /// completion not yet reported. On timeout the frame stays tracked.
    pub(crate) fn retire_previous(&self, output: &mut Output) -> Result<()> {
        let deadline = Instant::now() + self.fence_timeout;
        let id = output.id();

        while let Some(entry) = output.in_flight.front() {
            self.wait(&entry.retire, deadline, "retire fence")?;
            for release in &entry.releases {
                self.wait(release, deadline, "release fence")?;
            }
            let Some(entry) = output.in_flight.pop_front() else {
                break;
            };
            if !entry.delivered {
                fire_commit(output, &entry.frame_event(id, Timestamp::now()));
            }
            trace!(output = ?id, sequence = entry.sequence, "frame fences closed");
        }
        Ok(())
    }

    /// Block on the retire fence of the newest frame and deliver it.
    fn wait_retired(&self, output: &mut Output) -> Result<()> {
        let deadline = Instant::now() + self.fence_timeout;
        let id = output.id();
        let Some(entry) = output.in_flight.back_mut() else {
            return Ok(());
        };
        self.wait(&entry.retire, deadline, "retire fence")?;
        entry.retire = Fence::none();
        entry.delivered = true;
        let event = entry.frame_event(id, Timestamp::now());
        fire_commit(output, &event);
        Ok(())
    }

    /// Deliver frames whose retire fence has signaled, without blocking.
    pub(crate) fn poll_retired(&self, output: &mut Output) {
        if self.completion != CompletionMode::RetireFence {
            return;
        }
        let id = output.id();
        let mut done = Vec::new();
        for entry in output.in_flight.iter_mut().filter(|e| !e.delivered) {
            match entry.retire.is_signaled() {
                Ok(true) => {
                    entry.retire = Fence::none();
                    entry.delivered = true;
                    done.push(entry.frame_event(id, Timestamp::now()));
                }
                Ok(false) => {}
                Err(e) => warn!(
                    output = ?id,
                    sequence = entry.sequence,
                    "retire fence poll failed: {}", e
                ),
            }
        }
        for event in done {
            fire_commit(output, &event);
        }
    }

    /// Complete every frame submitted no later than a vsync stamped
    /// `timestamp_ns`.
    pub(crate) fn complete_on_vsync(
        &self,
        output: &mut Output,
        timestamp_ns: u64,
        sequence: u32,
        timestamp: Timestamp,
    ) {
        if self.completion != CompletionMode::VsyncCallback {
            return;
        }
        let mut done = VecDeque::new();
        while output
            .in_flight
            .front()
            .is_some_and(|c| c.submitted_ns <= timestamp_ns)
        {
            if let Some(commit) = output.in_flight.pop_front() {
                done.push_back(commit);
            }
        }

        let id = output.id();
        for commit in done {
            let event = FrameEvent {
                sequence,
                ..commit.frame_event(id, timestamp)
            };
            fire_commit(output, &event);
        }
    }

    fn wait(&self, fence: &Fence, deadline: Instant, what: &'static str) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match fence.wait(remaining)? {
            FenceWait::Signaled => Ok(()),
            FenceWait::TimedOut => {
                warn!(fd = fence.as_raw(), timeout = ?self.fence_timeout, "{} stalled", what);
                Err(Error::FenceTimeout {
                    what,
                    timeout: self.fence_timeout,
                })
            }
        }
    }
}

/// Snapshot the output's layers into a request covering every hardware slot.
///
/// Bound buffers are referenced for as long as the frame is in flight.
fn build_request(
    output: &mut Output,
) -> Result<(CompositionRequest, Vec<Arc<dyn GraphicsBuffer>>)> {
    let (screen_w, screen_h) = output.screen_size();
    let screen = Rect::new(0, 0, screen_w, screen_h);
    let id = output.id();
    let registry = output.layers_mut()?;

    let mut layers = Vec::new();
    layers
        .try_reserve_exact(registry.len())
        .map_err(Error::oom("composition request"))?;
    let mut buffers: Vec<Arc<dyn GraphicsBuffer>> = Vec::new();
    buffers
        .try_reserve_exact(registry.len())
        .map_err(Error::oom("composition request"))?;

    let primary = registry.primary_index();
    for (index, layer) in registry.layers.iter().enumerate() {
        let slot = if index == primary {
            target_slot(layer, screen)
        } else {
            overlay_slot(layer)?
        };
        if let Some(binding) = layer.binding.as_ref() {
            buffers.push(binding.buffer.clone());
        }
        layers.push(slot);
    }

    Ok((
        CompositionRequest {
            output: id,
            layers,
            geometry_changed: registry.geometry_changed,
            retire_fence: Fence::none(),
        },
        buffers,
    ))
}

/// The framebuffer target: full alpha, premultiplied, untransformed, and
/// covering the screen unless told otherwise.
fn target_slot(layer: &Layer, screen: Rect) -> RequestLayer {
    let dst = if layer.info.dst.is_empty() {
        screen
    } else {
        layer.info.dst
    };
    let mut slot = RequestLayer {
        composition: CompositionType::FramebufferTarget,
        display_frame: dst.to_display_frame(),
        source_crop: screen.to_source_crop(),
        blend: layer.blend,
        transform: Transform::Normal,
        plane_alpha: 0xff,
        ..RequestLayer::disabled()
    };

    // No acquire fence: the target is already composited when handed over
    if let Some(binding) = layer.binding.as_ref() {
        let src = source_rect(layer.info.src, binding.handle.width, binding.handle.height);
        slot.source_crop = src.to_source_crop();
        slot.handle = Some(binding.handle.clone());
    }
    slot
}

fn overlay_slot(layer: &Layer) -> Result<RequestLayer> {
    let Some(binding) = layer.binding.as_ref() else {
        return Ok(RequestLayer::disabled());
    };
    let (width, height) = (binding.handle.width, binding.handle.height);
    let src = source_rect(layer.info.src, width, height);
    let dst = if layer.info.dst.is_empty() {
        Rect::new(0, 0, src.w, src.h)
    } else {
        layer.info.dst
    };

    Ok(RequestLayer {
        composition: CompositionType::Overlay,
        handle: Some(binding.handle.clone()),
        source_crop: src.to_source_crop(),
        display_frame: dst.to_display_frame(),
        blend: layer.blend,
        transform: layer.info.transform,
        plane_alpha: layer.plane_alpha,
        // A duplicate: the binding keeps its fence until the device accepts
        // the frame
        acquire_fence: binding.acquire.try_clone()?,
        release_fence: Fence::none(),
    })
}

/// The device took the frame, so every bound buffer's acquire fence has
/// been handed over. Later frames reuse those buffers without one.
fn consume_acquire_fences(output: &mut Output) {
    let Some(registry) = output.layers.as_mut() else {
        return;
    };
    for binding in registry.layers.iter_mut().filter_map(|l| l.binding.as_mut()) {
        binding.acquire = Fence::none();
    }
}

fn source_rect(src: Rect, width: u32, height: u32) -> Rect {
    if src.is_empty() {
        Rect::new(0, 0, width, height)
    } else {
        src
    }
}
