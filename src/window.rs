//! Window Module
//!
//! A logical top-level window coupled to a concrete screen backend: either
//! software-composited into the context's primary screen, or bound to a
//! dedicated hardware overlay plane. The backend is chosen once at
//! construction from a hint and the platform's plane report; `automatic`
//! negotiates hardware first and falls back to software, explicit hints
//! fail fast.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::geometry::{DamageArray, Point, Rect, Size};
use crate::object::{Event, EventId, Object};
use crate::screen::kms::{KmsScreen, PlaneKind, SharedPlaneDevice};
use crate::screen::{PixelFormat, Screen, SurfaceMut};

/// Backend negotiation hint given at window construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendHint {
    /// Prefer a free hardware overlay plane, fall back to software
    #[default]
    Automatic,
    /// Composite into the primary screen; never touches the KMS device
    Software,
    /// Require an overlay plane; construction fails if none is free
    Overlay,
    /// Require a high-end (scaling) overlay plane
    Heo,
}

/// Index of a window in the context's window arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub usize);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WindowFlags: u32 {
        const TOP_LEVEL = 1 << 0;
        const VISIBLE   = 1 << 1;
    }
}

/// The seam the widget set plugs into
///
/// Widgets are client code; the core only needs their window-relative frame,
/// a clip-bounded paint entry point, and an input hook. `paint` receives a
/// window-local surface view, so widget coordinates and surface coordinates
/// agree.
pub trait Widget {
    /// Window-relative bounds
    fn frame(&self) -> Rect;

    /// Paint the intersection of this widget with `clip` (window-relative)
    fn paint(&mut self, surface: &mut SurfaceMut<'_>, clip: Rect);

    /// Input hook; the default ignores the event
    fn handle(&mut self, _event: &mut Event) {}
}

/// Concrete backing for a window
///
/// Exactly one of the two variants holds at all times: either the window
/// delegates to the context's primary screen (keeping only a window-local
/// damage set), or it owns a dedicated plane screen. Switching is only
/// possible through [`Window::allocate_screen`].
pub enum WindowBackend {
    /// Software-composited into the primary screen
    Basic { damage: DamageArray },
    /// Dedicated hardware overlay plane
    Plane { screen: KmsScreen },
}

pub struct Window {
    id: WindowId,
    /// Position and size on the display
    frame: Rect,
    flags: WindowFlags,
    object: Object,
    children: Vec<Box<dyn Widget>>,
    backend: WindowBackend,
}

/// Negotiate a backend for a new window
///
/// `Automatic` probes the plane report and quietly falls back to software
/// when no overlay is free or allocation fails; explicit hardware hints
/// propagate the allocation error instead.
pub(crate) fn select_backend(
    hint: BackendHint,
    device: Option<&SharedPlaneDevice>,
    frame: Rect,
    format: PixelFormat,
    buffer_count: usize,
) -> Result<WindowBackend> {
    let allocate = |kind: PlaneKind| -> Result<WindowBackend> {
        let device = device.ok_or(Error::PlaneExhausted(kind))?;
        let screen = KmsScreen::new(
            device.clone(),
            kind,
            frame.origin(),
            frame.size(),
            format,
            buffer_count,
        )?;
        Ok(WindowBackend::Plane { screen })
    };

    match hint {
        BackendHint::Software => Ok(WindowBackend::Basic { damage: DamageArray::new() }),
        BackendHint::Overlay => allocate(PlaneKind::Overlay),
        BackendHint::Heo => allocate(PlaneKind::Heo),
        BackendHint::Automatic => {
            let free = device
                .map(|d| d.borrow().report().free(PlaneKind::Overlay))
                .unwrap_or(0);
            if free == 0 {
                debug!("No free overlay plane, selecting software backend");
                return Ok(WindowBackend::Basic { damage: DamageArray::new() });
            }
            match allocate(PlaneKind::Overlay) {
                Ok(backend) => Ok(backend),
                Err(e) => {
                    warn!("Overlay allocation failed ({}), falling back to software", e);
                    Ok(WindowBackend::Basic { damage: DamageArray::new() })
                }
            }
        }
    }
}

impl Window {
    pub(crate) fn new(id: WindowId, frame: Rect, backend: WindowBackend) -> Self {
        let kind = match &backend {
            WindowBackend::Basic { .. } => "software",
            WindowBackend::Plane { .. } => "overlay plane",
        };
        info!(
            "Window {:?}: {}x{} at ({}, {}), {} backend",
            id, frame.width, frame.height, frame.x, frame.y, kind
        );
        Self {
            id,
            frame,
            flags: WindowFlags::TOP_LEVEL,
            object: Object::new(),
            children: Vec::new(),
            backend,
        }
    }

    pub fn id(&self) -> WindowId {
        self.id
    }

    pub fn frame(&self) -> Rect {
        self.frame
    }

    pub fn size(&self) -> Size {
        self.frame.size()
    }

    pub fn visible(&self) -> bool {
        self.flags.contains(WindowFlags::VISIBLE)
    }

    pub fn top_level(&self) -> bool {
        self.flags.contains(WindowFlags::TOP_LEVEL)
    }

    pub fn is_plane_backed(&self) -> bool {
        matches!(self.backend, WindowBackend::Plane { .. })
    }

    /// Event handler registration point for this window
    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn add_child(&mut self, child: Box<dyn Widget>) {
        let frame = child.frame();
        self.children.push(child);
        self.damage(frame);
    }

    /// Mark a window-relative rect as needing repaint
    pub fn damage(&mut self, rect: Rect) {
        let Some(clipped) = rect.intersection(&Rect::from_size(self.frame.size())) else {
            return;
        };
        match &mut self.backend {
            WindowBackend::Basic { damage } => damage.add(clipped),
            WindowBackend::Plane { screen } => screen.add_damage(clipped),
        }
    }

    /// Force a full repaint on the next cycle, bypassing accumulated damage
    pub fn top_draw(&mut self) {
        self.damage(Rect::from_size(self.frame.size()));
    }

    pub fn show(&mut self) {
        if self.flags.contains(WindowFlags::VISIBLE) {
            return;
        }
        self.flags.insert(WindowFlags::VISIBLE);
        self.object.invoke_handlers(&mut Event::new(EventId::SHOW));
        self.top_draw();
    }

    pub fn hide(&mut self) {
        if !self.flags.contains(WindowFlags::VISIBLE) {
            return;
        }
        self.flags.remove(WindowFlags::VISIBLE);
        self.object.invoke_handlers(&mut Event::new(EventId::HIDE));
    }

    /// Resize the window; plane windows reposition (and reallocate if the
    /// new size exceeds the buffer geometry), software windows repaint
    pub fn resize(&mut self, size: Size) -> Result<()> {
        if size == self.frame.size() {
            return Ok(());
        }
        self.frame = Rect::new(self.frame.x, self.frame.y, size.width, size.height);
        match &mut self.backend {
            WindowBackend::Basic { .. } => {
                self.top_draw();
                Ok(())
            }
            WindowBackend::Plane { screen } => screen.set_output_geometry(self.frame),
        }
    }

    pub fn move_to(&mut self, point: Point) -> Result<()> {
        self.frame = Rect::new(point.x, point.y, self.frame.width, self.frame.height);
        match &mut self.backend {
            // Placement of software windows is a compositor concern.
            WindowBackend::Basic { .. } => Ok(()),
            WindowBackend::Plane { screen } => screen.set_output_geometry(self.frame),
        }
    }

    /// Scale the output of a plane window without repainting its buffers
    ///
    /// Software windows cannot be scaled by the display controller; the
    /// call is a logged no-op for them.
    pub fn scale(&mut self, x: f32, y: f32) -> Result<()> {
        match &mut self.backend {
            WindowBackend::Basic { .. } => {
                debug!("Window {:?}: scale ignored on software backend", self.id);
                Ok(())
            }
            WindowBackend::Plane { screen } => {
                let size = screen.size();
                let dest = Rect::new(
                    self.frame.x,
                    self.frame.y,
                    (size.width as f32 * x) as u32,
                    (size.height as f32 * y) as u32,
                );
                screen.set_output_geometry(dest)?;
                self.frame = dest;
                Ok(())
            }
        }
    }

    /// Lazily bind this window to its own hardware screen
    ///
    /// No-op when the window already owns a plane. On success the window
    /// stops delegating to the primary screen; the two states are
    /// mutually exclusive at every point in time.
    pub fn allocate_screen(
        &mut self,
        device: Option<&SharedPlaneDevice>,
        format: PixelFormat,
        buffer_count: usize,
    ) -> Result<()> {
        if matches!(self.backend, WindowBackend::Plane { .. }) {
            return Ok(());
        }
        let device = device.ok_or(Error::PlaneExhausted(PlaneKind::Overlay))?;
        let screen = KmsScreen::new(
            device.clone(),
            PlaneKind::Overlay,
            self.frame.origin(),
            self.frame.size(),
            format,
            buffer_count,
        )?;
        self.backend = WindowBackend::Plane { screen };
        self.top_draw();
        Ok(())
    }

    /// Deliver an input event: window handlers first, then child widgets
    /// until one consumes it
    pub fn handle(&mut self, event: &mut Event) {
        self.object.invoke_handlers(event);
        if event.quit_requested() {
            return;
        }
        for child in &mut self.children {
            child.handle(event);
            if event.quit_requested() {
                return;
            }
        }
    }

    pub(crate) fn backend(&self) -> &WindowBackend {
        &self.backend
    }

    pub(crate) fn backend_mut(&mut self) -> &mut WindowBackend {
        &mut self.backend
    }

    /// Paint damaged child subtrees into a window-local surface view
    pub(crate) fn paint_into(&mut self, surface: &mut SurfaceMut<'_>, rects: &[Rect]) {
        for rect in rects {
            for child in &mut self.children {
                if let Some(clip) = child.frame().intersection(rect) {
                    child.paint(surface, clip);
                }
            }
        }
    }

    /// Paint damaged widget subtrees into this window's own plane screen
    /// and submit the flip
    ///
    /// Returns `Ok(false)` for software-backed windows (the compositor
    /// paints those into the primary screen) and when the flip was
    /// deferred; damage survives any failure for retry on the next cycle.
    pub(crate) fn paint_and_flip_plane(&mut self) -> Result<bool> {
        let WindowBackend::Plane { screen } = &mut self.backend else {
            return Ok(false);
        };
        let children = &mut self.children;
        let rects = screen.pending_damage().rects().to_vec();
        screen.with_surface(&mut |surface: &mut SurfaceMut<'_>| {
            for rect in &rects {
                for child in children.iter_mut() {
                    if let Some(clip) = child.frame().intersection(rect) {
                        child.paint(surface, clip);
                    }
                }
            }
        })?;
        screen.schedule_flip()
    }

    /// Pending window-local damage, regardless of backend
    pub(crate) fn pending_damage_rects(&self) -> Vec<Rect> {
        match &self.backend {
            WindowBackend::Basic { damage } => damage.rects().to_vec(),
            WindowBackend::Plane { screen } => screen.pending_damage().rects().to_vec(),
        }
    }

    pub(crate) fn has_damage(&self) -> bool {
        match &self.backend {
            WindowBackend::Basic { damage } => !damage.is_empty(),
            WindowBackend::Plane { screen } => !screen.pending_damage().is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::kms::testing::FakePlaneDevice;
    use crate::screen::kms::{FlipNotifier, PlaneReport};

    fn device_with(free_overlay: usize) -> SharedPlaneDevice {
        FakePlaneDevice::shared(
            PlaneReport { free_overlay, ..Default::default() },
            FlipNotifier::new(),
        )
    }

    #[test]
    fn test_automatic_falls_back_to_software_when_exhausted() {
        let device = device_with(0);
        let backend = select_backend(
            BackendHint::Automatic,
            Some(&device),
            Rect::new(0, 0, 320, 240),
            PixelFormat::Argb8888,
            3,
        )
        .unwrap();
        assert!(matches!(backend, WindowBackend::Basic { .. }));
    }

    #[test]
    fn test_automatic_without_kms_device_is_software() {
        let backend = select_backend(
            BackendHint::Automatic,
            None,
            Rect::new(0, 0, 320, 240),
            PixelFormat::Argb8888,
            3,
        )
        .unwrap();
        assert!(matches!(backend, WindowBackend::Basic { .. }));
    }

    #[test]
    fn test_explicit_overlay_hint_fails_fast() {
        let device = device_with(0);
        let result = select_backend(
            BackendHint::Overlay,
            Some(&device),
            Rect::new(0, 0, 320, 240),
            PixelFormat::Argb8888,
            3,
        );
        assert!(matches!(result, Err(Error::PlaneExhausted(PlaneKind::Overlay))));
    }

    #[test]
    fn test_automatic_prefers_overlay_when_free() {
        let device = device_with(1);
        let backend = select_backend(
            BackendHint::Automatic,
            Some(&device),
            Rect::new(0, 0, 320, 240),
            PixelFormat::Argb8888,
            3,
        )
        .unwrap();
        assert!(matches!(backend, WindowBackend::Plane { .. }));
    }

    #[test]
    fn test_allocate_screen_switches_exactly_once() {
        let device = device_with(1);
        let mut window = Window::new(
            WindowId(0),
            Rect::new(0, 0, 100, 80),
            WindowBackend::Basic { damage: DamageArray::new() },
        );
        assert!(!window.is_plane_backed());
        window
            .allocate_screen(Some(&device), PixelFormat::Argb8888, 3)
            .unwrap();
        assert!(window.is_plane_backed());
        // Already plane-backed: a second call is a no-op, not a second plane.
        window
            .allocate_screen(Some(&device), PixelFormat::Argb8888, 3)
            .unwrap();
        assert_eq!(device.borrow().report().free_overlay, 0);
    }

    #[test]
    fn test_damage_clipped_to_window() {
        let mut window = Window::new(
            WindowId(0),
            Rect::new(10, 10, 100, 80),
            WindowBackend::Basic { damage: DamageArray::new() },
        );
        window.damage(Rect::new(90, 70, 50, 50));
        assert_eq!(window.pending_damage_rects(), vec![Rect::new(90, 70, 10, 10)]);
        window.damage(Rect::new(200, 200, 5, 5));
        assert_eq!(window.pending_damage_rects().len(), 1);
    }

    #[test]
    fn test_show_hide_fire_object_events() {
        use std::cell::RefCell;
        use std::rc::Rc;
        let mut window = Window::new(
            WindowId(0),
            Rect::new(0, 0, 64, 64),
            WindowBackend::Basic { damage: DamageArray::new() },
        );
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let log = log.clone();
            window.object().on_event(
                move |event| log.borrow_mut().push(event.id),
                vec![EventId::SHOW, EventId::HIDE],
            );
        }
        window.show();
        window.show(); // already visible, no second SHOW
        window.hide();
        assert_eq!(*log.borrow(), vec![EventId::SHOW, EventId::HIDE]);
    }

    #[test]
    fn test_show_damages_full_window() {
        let mut window = Window::new(
            WindowId(0),
            Rect::new(0, 0, 64, 48),
            WindowBackend::Basic { damage: DamageArray::new() },
        );
        window.show();
        assert_eq!(window.pending_damage_rects(), vec![Rect::new(0, 0, 64, 48)]);
    }
}
