//! Error Module
//!
//! Error taxonomy for screen/plane construction and per-frame presentation.
//!
//! Construction-time resource errors propagate immediately to the caller and
//! stop that subsystem's setup. Per-frame present errors are local to the
//! frame: the caller keeps its damage and retries on the next cycle.
//! Contract violations (using the event loop after `close`, flipping an
//! uninitialized screen) are debug assertions, not `Err` values.

use std::io;
use std::path::PathBuf;

use crate::screen::{PixelFormat, PlaneKind};

/// Errors surfaced by screen, plane and window construction or presentation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device node could not be opened or queried (open/ioctl failure)
    #[error("device {path:?}: {source}")]
    Device {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Buffer could not be memory-mapped
    #[error("failed to map buffer: {0}")]
    Map(#[source] io::Error),

    /// No free hardware plane of the requested kind
    ///
    /// Reportable, not fatal: with an `Automatic` hint the window backend
    /// negotiation falls back to software compositing.
    #[error("no free {0:?} plane available")]
    PlaneExhausted(PlaneKind),

    /// The backend cannot produce the requested pixel format
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),

    /// The device reports a color depth the toolkit has no format for
    #[error("unsupported color depth: {0} bpp")]
    UnsupportedDepth(u32),

    /// A single flip/present submission failed; damage is retained and the
    /// next draw cycle retries
    #[error("present failed: {0}")]
    Present(#[source] io::Error),

    /// Configuration file could not be read or parsed
    #[error("config: {0}")]
    Config(String),

    /// The reactor's poll or source registration failed
    #[error("event loop: {0}")]
    Loop(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
