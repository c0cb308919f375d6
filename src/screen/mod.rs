//! Screen Module
//!
//! The polymorphic surface target behind every window: a heap-backed memory
//! screen, the Linux framebuffer device, or a KMS hardware overlay plane.
//! All variants expose the same contract: draw into the current back buffer,
//! accumulate damage, present/flip.

#[cfg(feature = "kms")]
pub mod drm_device;
pub mod framebuffer;
pub mod kms;
pub mod memory;

#[cfg(feature = "kms")]
pub use drm_device::DrmPlaneDevice;

pub use framebuffer::FramebufferScreen;
pub use kms::{
    FlipNotifier, KmsScreen, PlaneDevice, PlaneId, PlaneKind, PlaneReport, PlaneRequest,
    SharedPlaneDevice,
};
pub use memory::MemoryScreen;

use crate::error::Result;
use crate::geometry::{DamageArray, Rect, Size};

/// Pixel formats the toolkit can negotiate with its backends
///
/// The toolkit never interprets pixel contents; the format only determines
/// buffer sizing and the descriptor handed to the external drawing library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 => 4,
            PixelFormat::Rgb565 => 2,
        }
    }
}

/// Raw drawing surface descriptor passed to paint callbacks
///
/// This is the boundary to the external 2D drawing library: a byte slice
/// into the current back buffer plus the layout needed to wrap it
/// (size, stride, format).
pub struct SurfaceMut<'a> {
    pub data: &'a mut [u8],
    pub size: Size,
    pub stride: usize,
    pub format: PixelFormat,
}

impl<'a> SurfaceMut<'a> {
    /// Byte offset of pixel (x, y); debug-asserts the point is in bounds
    pub fn offset_of(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.size.width && y < self.size.height);
        y as usize * self.stride + x as usize * self.format.bytes_per_pixel()
    }

    /// Re-borrow a window-local view of this surface
    ///
    /// The view shares the parent's stride, so row indexing inside the view
    /// lands on the right pixels; `rect` is clipped to the surface first.
    pub fn sub_view(&mut self, rect: Rect) -> Option<SurfaceMut<'_>> {
        let bounds = Rect::from_size(self.size);
        let clipped = rect.intersection(&bounds)?;
        let start = self.offset_of(clipped.x as u32, clipped.y as u32);
        let end = self.offset_of(clipped.x as u32, (clipped.bottom() - 1) as u32)
            + clipped.width as usize * self.format.bytes_per_pixel();
        Some(SurfaceMut {
            data: &mut self.data[start..end],
            size: clipped.size(),
            stride: self.stride,
            format: self.format,
        })
    }

    /// Fill a clipped rect with a repeated pixel value
    ///
    /// Convenience for callers without a drawing library attached; `pixel`
    /// must be exactly `bytes_per_pixel` long.
    pub fn fill_rect(&mut self, rect: Rect, pixel: &[u8]) {
        let bpp = self.format.bytes_per_pixel();
        debug_assert_eq!(pixel.len(), bpp);
        let bounds = Rect::from_size(self.size);
        let Some(clipped) = rect.intersection(&bounds) else {
            return;
        };
        for y in clipped.y..clipped.bottom() {
            let row = self.offset_of(clipped.x as u32, y as u32);
            for px in 0..clipped.width as usize {
                let at = row + px * bpp;
                self.data[at..at + bpp].copy_from_slice(pixel);
            }
        }
    }
}

/// Uniform present/flip contract over heterogeneous backing stores
///
/// Implementations own 1..N back buffers, a current-buffer index and a
/// pending damage accumulator. Damage is cleared only after a successful
/// present; a failed present leaves it intact so the next draw cycle
/// retries.
pub trait Screen {
    fn size(&self) -> Size;

    fn format(&self) -> PixelFormat;

    fn buffer_count(&self) -> usize;

    /// Index of the buffer currently being drawn into
    fn current_buffer(&self) -> usize;

    /// Merge a rectangle (clipped to screen bounds) into the damage set for
    /// the next flip
    fn add_damage(&mut self, rect: Rect);

    fn pending_damage(&self) -> &DamageArray;

    /// Run `f` over the current back buffer's raw surface
    fn with_surface(&mut self, f: &mut dyn FnMut(&mut SurfaceMut<'_>)) -> Result<()>;

    /// Present the current buffer
    ///
    /// With no pending damage this is an idempotent no-op returning
    /// `Ok(false)`. Software backends present synchronously; hardware
    /// backends submit the buffer to the display pipeline without blocking
    /// and advance the current-buffer index modulo the buffer count.
    /// Returns `Ok(true)` when a present was actually performed/submitted.
    fn schedule_flip(&mut self) -> Result<bool>;

    /// Adjust output geometry (position/scale/pan) without repainting
    ///
    /// Hardware planes reposition in the display controller; software
    /// screens ignore this (their placement is a compositor concern).
    fn set_output_geometry(&mut self, _dest: Rect) -> Result<()> {
        Ok(())
    }

    /// Plane backing this screen, if it is hardware-overlay-backed
    fn plane(&self) -> Option<PlaneId> {
        None
    }

    /// Called by the event loop when the display controller signals that a
    /// previously submitted buffer is now on-screen
    fn handle_flip_complete(&mut self) {}
}

/// Clip a damage rect to the screen bounds before accumulating it
pub(crate) fn clip_to_screen(rect: Rect, size: Size) -> Option<Rect> {
    rect.intersection(&Rect::from_size(size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(PixelFormat::Argb8888.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Rgb565.bytes_per_pixel(), 2);
    }

    #[test]
    fn test_fill_rect_clips_to_surface() {
        let size = Size::new(4, 4);
        let mut data = vec![0u8; 4 * 4 * 4];
        let mut surface = SurfaceMut {
            data: &mut data,
            size,
            stride: 16,
            format: PixelFormat::Argb8888,
        };
        surface.fill_rect(Rect::new(2, 2, 10, 10), &[0xff, 0xff, 0xff, 0xff]);
        // Inside the clip
        assert_eq!(surface.data[surface.offset_of(2, 2)], 0xff);
        assert_eq!(surface.data[surface.offset_of(3, 3)], 0xff);
        // Outside the painted region
        assert_eq!(surface.data[surface.offset_of(0, 0)], 0x00);
        assert_eq!(surface.data[surface.offset_of(1, 3)], 0x00);
    }
}
