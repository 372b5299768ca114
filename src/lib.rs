//! Display composition backend for Android hwcomposer devices
//!
//! Binds a display-management front end to a hardware composer: outputs and
//! their layers are enumerated once, buffers and geometry accumulate on layers
//! between commits, and a commit hands the whole layer set of an output to the
//! hardware in one submission. Completion comes back either through retire
//! fences or through vsync callbacks, and is reported to the front end's
//! handlers on the thread that owns the [`Backend`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Display front end                              │
//! │   (outputs, layers, commit/vblank/status handlers, DPMS)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    Backend (owner thread)
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ┌──────────┐ ┌──────────┐ ┌────────────┐ ┌──────────────┐  │
//! │  │ Outputs  │ │ Layers   │ │ Commit     │ │ Power / Mode │  │
//! │  │          │ │ Buffers  │ │ Engine     │ │ Control      │  │
//! │  └──────────┘ └──────────┘ └────────────┘ └──────────────┘  │
//! │           ▲ event queue + eventfd (Completion Dispatch)      │
//! └───────────┼─────────────────────────────────────────────────┘
//!             │ vsync / hotplug / refresh (any thread)
//! ┌─────────────────────────────────────────────────────────────┐
//! │   ComposerDevice: headless, or hwcomposer2 via libhybris    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use hwc_backend::{Backend, BackendConfig, OutputId, PowerState};
//! use hwc_backend::device::headless::{HeadlessComposer, HeadlessConfig};
//!
//! let device = HeadlessComposer::new(HeadlessConfig::default());
//! let mut backend = Backend::new(Box::new(device), BackendConfig::default())?;
//! let output = OutputId(0);
//!
//! backend.set_commit_handler(output, |event| println!("frame {} done", event.sequence))?;
//! backend.set_power_state(output, PowerState::On)?;
//! backend.commit(output, true, 0)?;
//! ```

pub mod backend;
pub mod buffer;
mod commit;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod fence;
pub mod layer;
pub mod output;
pub mod power;

#[cfg(feature = "hwcomposer2")]
pub mod ffi;

pub use backend::{Backend, DisplayCapability};
pub use buffer::{BufferHandle, GraphicsBuffer, ImportedBuffer};
pub use config::BackendConfig;
pub use dispatch::{FrameEvent, Timestamp, UserData};
pub use error::{Error, ErrorKind};
pub use fence::Fence;
pub use layer::{LayerCapability, LayerId, LayerInfo, LayerRole, Rect, Size, Transform};
pub use output::{ConnectionStatus, OutputCapability, OutputId, OutputKind, OutputMode};
pub use power::PowerState;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
