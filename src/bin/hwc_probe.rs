//! Drives a composition device end to end: enumerate, power on, commit a few
//! frames, wait for vblanks, power off. Runs against the headless composer by
//! default, or the real HAL with `--hwc2`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hwc_backend::buffer::fourcc;
use hwc_backend::device::headless::HeadlessComposer;
use hwc_backend::device::ComposerDevice;
use hwc_backend::{
    Backend, BackendConfig, GraphicsBuffer, ImportedBuffer, LayerId, OutputId, PowerState, Rect,
};

#[derive(Parser, Debug)]
#[command(name = "hwc-probe")]
#[command(
    about = "Exercise a hwcomposer device through the composition backend",
    long_about = None
)]
struct Args {
    /// Backend configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Open the hwcomposer2 HAL instead of the headless composer
    #[arg(long)]
    hwc2: bool,

    /// Frames to commit
    #[arg(short, long, default_value_t = 10)]
    frames: u32,

    /// Block in commit until each frame is on screen
    #[arg(short, long)]
    sync: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn open_device(args: &Args, config: &BackendConfig) -> Result<Box<dyn ComposerDevice>> {
    if args.hwc2 {
        #[cfg(feature = "hwcomposer2")]
        {
            let layers = config.headless.outputs.first().map_or(4, |o| o.layers);
            let device = hwc_backend::device::hwc2::Hwc2Device::open(layers)
                .context("opening hwcomposer2")?;
            return Ok(Box::new(device));
        }
        #[cfg(not(feature = "hwcomposer2"))]
        bail!("built without the hwcomposer2 feature");
    }
    Ok(Box::new(HeadlessComposer::new(config.headless.clone())))
}

/// Block on the backend's event fd, then dispatch.
fn pump(backend: &mut Backend, timeout_ms: i32) -> Result<usize> {
    let mut pfd = libc::pollfd {
        fd: backend.event_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error()).context("polling event fd");
    }
    Ok(backend.handle_events()?)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "debug,hwc_backend=debug"
    } else {
        "warn,hwc_backend=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &args.config {
        Some(path) => BackendConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BackendConfig::default(),
    };

    let device = open_device(&args, &config)?;
    let mut backend = Backend::new(device, config).context("initializing backend")?;
    let info = backend.device_info().clone();
    info!(
        device = %info.name,
        api_version = %format!("{:#010x}", info.api_version),
        capability = ?backend.capability(),
        "device opened"
    );

    for output in backend.outputs() {
        let cap = output.capability();
        info!(
            output = ?output.id(),
            kind = ?cap.kind,
            status = ?cap.status,
            size_mm = ?(cap.mm_width, cap.mm_height),
            modes = ?cap.modes.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            "output"
        );
    }

    let output = OutputId(0);
    let completed = Arc::new(AtomicU32::new(0));
    let vblanks = Arc::new(AtomicU32::new(0));
    {
        let completed = completed.clone();
        backend.set_commit_handler(output, move |event| {
            completed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(sequence = event.sequence, ts = ?event.timestamp, "commit done");
        })?;
        let vblanks = vblanks.clone();
        backend.set_vblank_handler(output, move |_| {
            vblanks.fetch_add(1, Ordering::Relaxed);
        })?;
    }
    backend.set_status_handler(output, |id, status| {
        info!(output = ?id, ?status, "hotplug");
    })?;

    let layer_count = backend.layers(output)?.len();
    info!(layers = layer_count, "layers created");
    backend.set_power_state(output, PowerState::On)?;
    if backend.output(output)?.current_mode().is_none() {
        let preferred = backend
            .output(output)?
            .modes()
            .iter()
            .position(|m| m.preferred)
            .unwrap_or(0);
        if let Err(e) = backend.set_mode(output, preferred) {
            warn!("could not select mode {}: {}", preferred, e);
        }
    }

    // Fake buffers only make sense on the headless composer
    let overlay = LayerId { output, index: 0 };
    let buffer: Option<Arc<dyn GraphicsBuffer>> = (!args.hwc2 && layer_count > 1).then(|| {
        Arc::new(ImportedBuffer::single_plane(0x1000, 256, 256, fourcc::ARGB8888))
            as Arc<dyn GraphicsBuffer>
    });

    for frame in 0..args.frames {
        if let Some(buffer) = &buffer {
            backend.bind_buffer(overlay, buffer.clone())?;
            let x = (frame * 16) as i32;
            backend.set_geometry(overlay, Rect::new(0, 0, 256, 256), Rect::new(x, x, 256, 256))?;
        }
        let sequence = backend.commit(output, args.sync, frame as u64)?;
        if !args.sync {
            pump(&mut backend, 16)?;
        }
        tracing::debug!(frame, sequence, "committed");
    }

    match backend.wait_vblank(output, 1, true, 0) {
        Ok(()) => info!("vblank received"),
        Err(e) => warn!("vblank wait failed: {}", e),
    }

    backend.set_power_state(output, PowerState::Off)?;
    // Frames still in flight retire on the way down
    pump(&mut backend, 0)?;

    let completed = completed.load(Ordering::Relaxed);
    info!(
        frames = args.frames,
        completed,
        vblanks = vblanks.load(Ordering::Relaxed),
        "probe finished"
    );
    if completed == 0 && args.frames > 0 {
        bail!("no frame completed");
    }
    Ok(())
}
