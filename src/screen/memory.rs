//! Memory Screen
//!
//! Heap-backed screen used for host-window embedding and tests. Behaves
//! like a hardware screen (N buffers, rotating current index) but presents
//! by doing nothing more than rotating, so tests can observe buffer and
//! damage discipline without device access.

use tracing::debug;

use crate::error::Result;
use crate::geometry::{DamageArray, Rect, Size};
use crate::screen::{clip_to_screen, PixelFormat, Screen, SurfaceMut};

pub struct MemoryScreen {
    size: Size,
    format: PixelFormat,
    stride: usize,
    buffers: Vec<Vec<u8>>,
    current: usize,
    damage: DamageArray,
    /// Number of presents performed, for damage-lifecycle assertions
    presents: u64,
}

impl MemoryScreen {
    /// Allocate `buffer_count` heap buffers of `size` pixels
    pub fn new(size: Size, format: PixelFormat, buffer_count: usize) -> Self {
        debug_assert!(buffer_count >= 1);
        let stride = size.width as usize * format.bytes_per_pixel();
        let buffers = (0..buffer_count.max(1))
            .map(|_| vec![0u8; stride * size.height as usize])
            .collect();
        debug!("MemoryScreen {}x{} ({} buffers)", size.width, size.height, buffer_count);
        Self {
            size,
            format,
            stride,
            buffers,
            current: 0,
            damage: DamageArray::new(),
            presents: 0,
        }
    }

    /// Raw contents of one buffer, for test inspection
    pub fn buffer(&self, index: usize) -> &[u8] {
        &self.buffers[index]
    }

    pub fn presents(&self) -> u64 {
        self.presents
    }
}

impl Screen for MemoryScreen {
    fn size(&self) -> Size {
        self.size
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn current_buffer(&self) -> usize {
        self.current
    }

    fn add_damage(&mut self, rect: Rect) {
        if let Some(clipped) = clip_to_screen(rect, self.size) {
            self.damage.add(clipped);
        }
    }

    fn pending_damage(&self) -> &DamageArray {
        &self.damage
    }

    fn with_surface(&mut self, f: &mut dyn FnMut(&mut SurfaceMut<'_>)) -> Result<()> {
        let mut surface = SurfaceMut {
            data: &mut self.buffers[self.current],
            size: self.size,
            stride: self.stride,
            format: self.format,
        };
        f(&mut surface);
        Ok(())
    }

    fn schedule_flip(&mut self) -> Result<bool> {
        if self.damage.is_empty() {
            return Ok(false);
        }
        self.damage.clear();
        self.presents += 1;
        if self.buffers.len() > 1 {
            self.current = (self.current + 1) % self.buffers.len();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip_without_damage_is_noop() {
        let mut screen = MemoryScreen::new(Size::new(16, 16), PixelFormat::Argb8888, 2);
        assert!(!screen.schedule_flip().unwrap());
        assert_eq!(screen.current_buffer(), 0);
        assert_eq!(screen.presents(), 0);
    }

    #[test]
    fn test_flip_clears_damage_and_rotates() {
        let mut screen = MemoryScreen::new(Size::new(16, 16), PixelFormat::Argb8888, 2);
        screen.add_damage(Rect::new(0, 0, 4, 4));
        assert!(!screen.pending_damage().is_empty());
        assert!(screen.schedule_flip().unwrap());
        assert!(screen.pending_damage().is_empty());
        assert_eq!(screen.current_buffer(), 1);
    }

    #[test]
    fn test_damage_clipped_to_bounds() {
        let mut screen = MemoryScreen::new(Size::new(16, 16), PixelFormat::Rgb565, 1);
        screen.add_damage(Rect::new(12, 12, 100, 100));
        assert_eq!(screen.pending_damage().rects(), &[Rect::new(12, 12, 4, 4)]);
        // Entirely off-screen damage is dropped.
        screen.add_damage(Rect::new(100, 100, 5, 5));
        assert_eq!(screen.pending_damage().rects().len(), 1);
    }
}
