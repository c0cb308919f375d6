//! Egret
//!
//! Windowing, compositing and event-dispatch core for embedded Linux
//! touchscreen UIs. Windows composite in software into a primary screen
//! (framebuffer or heap memory) or bind to a dedicated KMS overlay plane,
//! repainting only damaged regions; a single-threaded cooperative reactor
//! drives timers, input sources and the per-iteration draw cycle.
//!
//! All UI state lives in an explicitly constructed [`Ui`] context. The only
//! cross-thread traffic is the flip-completion queue a display device's
//! worker feeds back into the loop.

pub mod compositor;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod geometry;
pub mod input;
pub mod object;
pub mod screen;
pub mod ui;
pub mod window;

pub use compositor::Compositor;
pub use config::Config;
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopState, QuitSignal, TimerId};
pub use geometry::{DamageArray, Point, Rect, Size};
pub use input::InputQueue;
pub use object::{Event, EventId, Handle, Object};
pub use screen::{
    FlipNotifier, FramebufferScreen, KmsScreen, MemoryScreen, PixelFormat, PlaneDevice, PlaneId,
    PlaneKind, Screen, SharedPlaneDevice, SurfaceMut,
};
pub use ui::Ui;
pub use window::{BackendHint, Widget, Window, WindowFlags, WindowId};

#[cfg(feature = "kms")]
pub use screen::DrmPlaneDevice;

#[cfg(feature = "evdev-input")]
pub use input::EvdevSource;
