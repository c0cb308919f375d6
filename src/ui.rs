//! Ui Context Module
//!
//! The process context owning every toolkit singleton explicitly: primary
//! screen, window arena, stacking order, global-input listeners, the
//! reactor and the flip-completion channel. Construction probes the
//! configured devices; teardown is `Drop`. No statics anywhere.

use tracing::{debug, info, warn};

use crate::compositor::Compositor;
use crate::config::Config;
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::geometry::{Rect, Size};
use crate::input::{self, InputQueue};
use crate::object::{Event, Object};
use crate::screen::kms::SharedPlaneDevice;
use crate::screen::{FramebufferScreen, MemoryScreen, PixelFormat, Screen};
use crate::window::{select_backend, BackendHint, Window, WindowId};

pub struct Ui {
    config: Config,
    primary: Box<dyn Screen>,
    /// KMS collaborator; `None` when no card was probed, every window then
    /// composites in software
    plane_device: Option<SharedPlaneDevice>,
    windows: Vec<Window>,
    compositor: Compositor,
    global_input: Object,
    input_queue: InputQueue,
    event_loop: EventLoop,
}

impl Ui {
    /// Build a context over the configured framebuffer, probing the KMS
    /// card for overlay planes when the `kms` feature is enabled
    pub fn new(config: Config) -> Result<Self> {
        let event_loop = EventLoop::new()?;
        let primary = FramebufferScreen::open(&config.framebuffer.device)?;
        let plane_device = probe_kms(&config, &event_loop);
        info!(
            "Ui context up: {}x{} primary, overlay planes {}",
            primary.size().width,
            primary.size().height,
            if plane_device.is_some() { "available" } else { "unavailable" }
        );
        Ok(Self::assemble(Box::new(primary), plane_device, config, event_loop))
    }

    /// Build a context over a heap-backed screen, without device access
    pub fn new_headless(size: Size) -> Result<Self> {
        let event_loop = EventLoop::new()?;
        let primary = MemoryScreen::new(size, PixelFormat::Argb8888, 1);
        debug!("Headless Ui context: {}x{}", size.width, size.height);
        Ok(Self::assemble(Box::new(primary), None, Config::default(), event_loop))
    }

    fn assemble(
        primary: Box<dyn Screen>,
        plane_device: Option<SharedPlaneDevice>,
        config: Config,
        event_loop: EventLoop,
    ) -> Self {
        Self {
            config,
            primary,
            plane_device,
            windows: Vec::new(),
            compositor: Compositor::new(),
            global_input: Object::new(),
            input_queue: InputQueue::default(),
            event_loop,
        }
    }

    /// Create a top-level window; `hint` negotiates its screen backend
    ///
    /// The new window starts hidden at the top of the stack.
    pub fn create_window(&mut self, frame: Rect, hint: BackendHint) -> Result<WindowId> {
        let backend = select_backend(
            hint,
            self.plane_device.as_ref(),
            frame,
            self.primary.format(),
            self.config.window.buffer_count,
        )?;
        let id = WindowId(self.windows.len());
        self.windows.push(Window::new(id, frame, backend));
        self.compositor.add_window(id);
        Ok(id)
    }

    pub fn window(&self, id: WindowId) -> Option<&Window> {
        self.windows.get(id.0)
    }

    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut Window> {
        self.windows.get_mut(id.0)
    }

    pub fn raise(&mut self, id: WindowId) {
        self.compositor.raise(id);
        if let Some(window) = self.windows.get_mut(id.0) {
            window.top_draw();
        }
    }

    pub fn lower(&mut self, id: WindowId) {
        self.compositor.lower(id);
        // Windows previously underneath must repaint over this one.
        for window in &mut self.windows {
            if window.visible() {
                window.top_draw();
            }
        }
    }

    /// Listener registration point for events no window consumed
    pub fn global_input(&self) -> &Object {
        &self.global_input
    }

    /// Shared queue an input source pushes translated events into
    pub fn input_queue(&self) -> InputQueue {
        self.input_queue.clone()
    }

    pub fn event_loop_mut(&mut self) -> &mut EventLoop {
        &mut self.event_loop
    }

    /// Deliver one raw event: every visible top-level window in stacking
    /// order bottom to top, then the global listeners; a handler that stops
    /// the event consumes it and skips the rest. Returns whether it was
    /// consumed.
    pub fn dispatch_input(&mut self, event: &mut Event) -> bool {
        event.reset_quit();
        input::dispatch(
            event,
            self.compositor.stacking_order(),
            &mut self.windows,
            &self.global_input,
        )
    }

    /// Route pending flip completions, then repaint every damaged window
    pub fn draw_cycle(&mut self) -> Result<()> {
        let completions = self.event_loop.drain_flips();
        self.compositor
            .complete_flips(&mut self.windows, &completions);
        self.compositor
            .draw_cycle(&mut self.windows, self.primary.as_mut())
    }

    /// Block in the cooperative loop until [`quit`](Self::quit)
    ///
    /// Each iteration polls for fd readiness and timers, drains the input
    /// queue through [`dispatch_input`](Self::dispatch_input), then runs
    /// the draw cycle. Per-frame present errors are logged and retried on
    /// the next cycle, not returned.
    pub fn run(&mut self) -> Result<()> {
        self.event_loop.mark_running();
        while !self.event_loop.quit_requested() {
            let completions = self.event_loop.wait()?;
            self.compositor
                .complete_flips(&mut self.windows, &completions);
            self.pump_input();
            if let Err(e) = self
                .compositor
                .draw_cycle(&mut self.windows, self.primary.as_mut())
            {
                warn!("Draw cycle failed, retrying next iteration: {}", e);
            }
        }
        self.event_loop.mark_idle();
        Ok(())
    }

    /// Request loop termination; the current iteration completes first
    pub fn quit(&mut self) {
        self.event_loop.quit();
    }

    fn pump_input(&mut self) {
        let pending: Vec<Event> = self.input_queue.borrow_mut().drain(..).collect();
        for mut event in pending {
            self.dispatch_input(&mut event);
        }
    }

    #[cfg(test)]
    pub(crate) fn with_plane_device(mut self, device: SharedPlaneDevice) -> Self {
        self.plane_device = Some(device);
        self
    }
}

/// Probe the configured DRM card for overlay planes
///
/// Failure is quiet by design at this level: a board without a usable KMS
/// card still runs every window through the software path.
#[cfg(feature = "kms")]
fn probe_kms(config: &Config, event_loop: &EventLoop) -> Option<SharedPlaneDevice> {
    use crate::screen::DrmPlaneDevice;
    use std::cell::RefCell;
    use std::rc::Rc;

    match DrmPlaneDevice::open(&config.kms.card, event_loop.notifier()) {
        Ok(device) => {
            let device: SharedPlaneDevice = Rc::new(RefCell::new(device));
            Some(device)
        }
        Err(e) => {
            warn!("KMS probe of {:?} failed: {}", config.kms.card, e);
            None
        }
    }
}

#[cfg(not(feature = "kms"))]
fn probe_kms(_config: &Config, _event_loop: &EventLoop) -> Option<SharedPlaneDevice> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::object::EventId;
    use crate::screen::kms::testing::FakePlaneDevice;
    use crate::screen::kms::{FlipNotifier, PlaneDevice, PlaneReport};
    use crate::screen::SurfaceMut;
    use crate::window::Widget;

    /// Widget covering the window, recording every clip it is asked to
    /// paint
    struct RecordingWidget {
        frame: Rect,
        clips: Rc<RefCell<Vec<Rect>>>,
    }

    impl Widget for RecordingWidget {
        fn frame(&self) -> Rect {
            self.frame
        }

        fn paint(&mut self, surface: &mut SurfaceMut<'_>, clip: Rect) {
            self.clips.borrow_mut().push(clip);
            surface.fill_rect(clip, &[0xaa, 0xaa, 0xaa, 0xaa]);
        }
    }

    fn headless_with_window(window_frame: Rect) -> (Ui, WindowId, Rc<RefCell<Vec<Rect>>>) {
        let mut ui = Ui::new_headless(Size::new(640, 480)).unwrap();
        let id = ui.create_window(window_frame, BackendHint::Software).unwrap();
        let clips = Rc::new(RefCell::new(Vec::new()));
        let window = ui.window_mut(id).unwrap();
        window.add_child(Box::new(RecordingWidget {
            frame: Rect::from_size(window_frame.size()),
            clips: clips.clone(),
        }));
        window.show();
        (ui, id, clips)
    }

    #[test]
    fn test_damaged_subrect_repaints_exactly_once() {
        let (mut ui, id, clips) = headless_with_window(Rect::new(10, 10, 320, 240));
        // First cycle paints the full window surface.
        ui.draw_cycle().unwrap();
        assert_eq!(*clips.borrow(), vec![Rect::new(0, 0, 320, 240)]);
        assert!(!ui.window(id).unwrap().has_damage());

        clips.borrow_mut().clear();
        ui.window_mut(id).unwrap().damage(Rect::new(30, 40, 50, 50));
        ui.draw_cycle().unwrap();
        // Exactly the damaged sub-rect was repainted, nothing else.
        assert_eq!(*clips.borrow(), vec![Rect::new(30, 40, 50, 50)]);
        assert!(!ui.window(id).unwrap().has_damage());
    }

    #[test]
    fn test_clean_cycle_paints_nothing() {
        let (mut ui, _id, clips) = headless_with_window(Rect::new(0, 0, 100, 100));
        ui.draw_cycle().unwrap();
        clips.borrow_mut().clear();
        // No damage reported since the last cycle: the walk is skipped.
        ui.draw_cycle().unwrap();
        assert!(clips.borrow().is_empty());
    }

    #[test]
    fn test_hidden_window_never_painted_or_dispatched() {
        let mut ui = Ui::new_headless(Size::new(320, 240)).unwrap();
        let id = ui.create_window(Rect::new(0, 0, 100, 100), BackendHint::Software).unwrap();
        let clips = Rc::new(RefCell::new(Vec::new()));
        let hits = Rc::new(RefCell::new(0u32));
        {
            let window = ui.window_mut(id).unwrap();
            window.add_child(Box::new(RecordingWidget {
                frame: Rect::new(0, 0, 100, 100),
                clips: clips.clone(),
            }));
            let hits = hits.clone();
            window
                .object()
                .on_event(move |_| *hits.borrow_mut() += 1, Vec::new());
        }
        // Never shown: no paint, no input, zero handler invocations.
        ui.draw_cycle().unwrap();
        let mut event = Event::new(EventId::KEY_DOWN);
        ui.dispatch_input(&mut event);
        assert!(clips.borrow().is_empty());
        assert_eq!(*hits.borrow(), 0);
    }

    #[test]
    fn test_global_listener_runs_after_windows() {
        let (mut ui, id, _clips) = headless_with_window(Rect::new(0, 0, 64, 64));
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let log = log.clone();
            ui.window_mut(id)
                .unwrap()
                .object()
                .on_event(move |_| log.borrow_mut().push("window"), Vec::new());
        }
        {
            let log = log.clone();
            ui.global_input()
                .on_event(move |_| log.borrow_mut().push("global"), Vec::new());
        }
        let mut event = Event::new(EventId::RAW_POINTER_DOWN);
        assert!(!ui.dispatch_input(&mut event));
        assert_eq!(*log.borrow(), vec!["window", "global"]);
    }

    #[test]
    fn test_consumed_event_skips_global_listener() {
        let (mut ui, id, _clips) = headless_with_window(Rect::new(0, 0, 64, 64));
        let global_hits = Rc::new(RefCell::new(0u32));
        ui.window_mut(id)
            .unwrap()
            .object()
            .on_event(|event| event.stop(), Vec::new());
        {
            let global_hits = global_hits.clone();
            ui.global_input()
                .on_event(move |_| *global_hits.borrow_mut() += 1, Vec::new());
        }
        let mut event = Event::new(EventId::KEY_DOWN);
        assert!(ui.dispatch_input(&mut event));
        assert_eq!(*global_hits.borrow(), 0);
    }

    #[test]
    fn test_overlay_hint_allocates_plane_window() {
        let ui = Ui::new_headless(Size::new(320, 240)).unwrap();
        let device = FakePlaneDevice::shared(
            PlaneReport { free_overlay: 1, ..Default::default() },
            FlipNotifier::new(),
        );
        let mut ui = ui.with_plane_device(device.clone());
        let id = ui
            .create_window(Rect::new(0, 0, 128, 96), BackendHint::Overlay)
            .unwrap();
        assert!(ui.window(id).unwrap().is_plane_backed());
        assert_eq!(device.borrow().report().free_overlay, 0);
    }

    #[test]
    fn test_run_drains_input_queue_and_quits() {
        let (mut ui, id, _clips) = headless_with_window(Rect::new(0, 0, 64, 64));
        let hits = Rc::new(RefCell::new(0u32));
        {
            let hits = hits.clone();
            ui.window_mut(id)
                .unwrap()
                .object()
                .on_event(move |_| *hits.borrow_mut() += 1, vec![EventId::KEY_DOWN]);
        }
        ui.input_queue()
            .borrow_mut()
            .push_back(Event::with_key(EventId::KEY_DOWN, 28));
        let signal = ui.event_loop_mut().quit_signal();
        ui.event_loop_mut()
            .add_timer(std::time::Duration::ZERO, move || signal.raise());
        ui.run().unwrap();
        assert_eq!(*hits.borrow(), 1);
    }
}
