//! Compositor Module
//!
//! Maintains window stacking order and runs the top-level draw cycle: walk
//! windows bottom to top, repaint only damaged regions, composite software
//! windows into the primary screen and schedule flips on plane-backed
//! windows. A window's damage is cleared only after its paint has been
//! committed, so a failed present retries naturally on the next cycle.

use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::geometry::Rect;
use crate::screen::kms::FlipComplete;
use crate::screen::{Screen, SurfaceMut};
use crate::window::{Window, WindowBackend, WindowId};

pub struct Compositor {
    /// Stacking order, bottom to top
    stacking_order: Vec<WindowId>,
}

impl Compositor {
    pub fn new() -> Self {
        Self { stacking_order: Vec::new() }
    }

    pub fn add_window(&mut self, id: WindowId) {
        self.stacking_order.push(id);
    }

    pub fn remove_window(&mut self, id: WindowId) {
        self.stacking_order.retain(|&w| w != id);
    }

    /// Raise a window to the top of the stack
    pub fn raise(&mut self, id: WindowId) {
        debug!("Raising window {:?}", id);
        self.stacking_order.retain(|&w| w != id);
        self.stacking_order.push(id);
    }

    /// Lower a window to the bottom of the stack
    pub fn lower(&mut self, id: WindowId) {
        debug!("Lowering window {:?}", id);
        self.stacking_order.retain(|&w| w != id);
        self.stacking_order.insert(0, id);
    }

    pub fn stacking_order(&self) -> &[WindowId] {
        &self.stacking_order
    }

    /// Whether the next draw phase has any work to do
    pub fn needs_draw(&self, windows: &[Window]) -> bool {
        self.stacking_order
            .iter()
            .filter_map(|id| windows.get(id.0))
            .any(|w| w.visible() && w.has_damage())
    }

    /// Route flip completions to the screens that submitted them
    pub fn complete_flips(&self, windows: &mut [Window], completions: &[FlipComplete]) {
        for complete in completions {
            for id in &self.stacking_order {
                let Some(window) = windows.get_mut(id.0) else { continue };
                if let WindowBackend::Plane { screen } = window.backend_mut() {
                    if screen.plane() == Some(complete.plane) {
                        screen.handle_flip_complete();
                        break;
                    }
                }
            }
        }
    }

    /// Run one draw cycle over the window stack
    ///
    /// Paints every visible, damaged window bottom to top, then flushes the
    /// primary screen synchronously. Per-window present errors are logged
    /// and reported, but do not stop the remaining windows; the failing
    /// window keeps its damage.
    ///
    /// Software window frames must lie within the primary screen: their
    /// surface view is window-relative, so a frame clipped at the screen
    /// edge would shift paint coordinates. Violations are debug-asserted.
    pub fn draw_cycle(
        &mut self,
        windows: &mut [Window],
        primary: &mut dyn Screen,
    ) -> Result<()> {
        if !self.needs_draw(windows) {
            return Ok(());
        }
        let mut first_error = None;

        for id in self.stacking_order.clone() {
            let Some(window) = windows.get_mut(id.0) else { continue };
            if !window.visible() || !window.has_damage() {
                continue;
            }
            let rects = window.pending_damage_rects();
            trace!("Painting window {:?}: {} damage rects", id, rects.len());

            if window.is_plane_backed() {
                if let Err(e) = window.paint_and_flip_plane() {
                    warn!("Window {:?} flip failed: {}", id, e);
                    first_error.get_or_insert(e);
                }
                continue;
            }

            let frame = window.frame();
            debug_assert!(
                Rect::from_size(primary.size()).intersection(&frame) == Some(frame),
                "software window frame extends beyond the primary screen"
            );
            let paint = primary.with_surface(&mut |surface: &mut SurfaceMut<'_>| {
                if let Some(mut view) = surface.sub_view(frame) {
                    window.paint_into(&mut view, &rects);
                }
            });
            match paint {
                Ok(()) => {
                    // Commit the window's damage to its screen, then and
                    // only then drop it from the window.
                    for rect in &rects {
                        primary.add_damage(rect.translate(frame.x, frame.y));
                    }
                    if let WindowBackend::Basic { damage } = window.backend_mut() {
                        damage.clear();
                    }
                }
                Err(e) => {
                    warn!("Window {:?} paint failed: {}", id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        // Synchronous flush of the shared software screen ends the phase.
        if let Err(e) = primary.schedule_flip() {
            warn!("Primary screen present failed: {}", e);
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new()
    }
}
