//! Input Module
//!
//! Raw input delivery. Events walk every visible top-level window in
//! stacking order, bottom to top, through each window's dispatcher; a
//! handler that stops the event consumes it and skips the remaining windows
//! and the process-wide listeners. Hidden windows never see dispatch.
//!
//! With the `evdev-input` feature an [`EvdevSource`] turns a
//! `/dev/input/event*` device into a reactor source feeding the same queue
//! the toolkit context drains each iteration.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::trace;

use crate::object::{Event, Object};
use crate::window::{Window, WindowId};

/// Queue of translated input events, drained by the context once per loop
/// iteration
pub type InputQueue = Rc<RefCell<VecDeque<Event>>>;

/// Deliver one raw event through the window stack, then the global
/// listeners; returns whether a handler consumed it
pub(crate) fn dispatch(
    event: &mut Event,
    order: &[WindowId],
    windows: &mut [Window],
    global: &Object,
) -> bool {
    for id in order {
        let Some(window) = windows.get_mut(id.0) else { continue };
        if !window.visible() || !window.top_level() {
            continue;
        }
        trace!("Dispatching {:?} to window {:?}", event.id, id);
        window.handle(event);
        if event.quit_requested() {
            return true;
        }
    }
    global.invoke_handlers(event);
    event.quit_requested()
}

#[cfg(feature = "evdev-input")]
pub use evdev_source::EvdevSource;

#[cfg(feature = "evdev-input")]
mod evdev_source {
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    use evdev::{Device, InputEventKind, Key};
    use mio::unix::SourceFd;
    use mio::{Interest, Token};
    use tracing::{debug, info, warn};

    use super::InputQueue;
    use crate::error::{Error, Result};
    use crate::event_loop::EventLoop;
    use crate::geometry::Point;
    use crate::object::{Event, EventId};

    /// A raw evdev input device pumped by the cooperative loop
    ///
    /// Translates `EV_KEY`/`EV_ABS`/`EV_REL` into toolkit events. Absolute
    /// and relative axes update a device-local cursor; one pointer-move
    /// event is emitted per sync report rather than per axis.
    pub struct EvdevSource {
        device: Device,
        cursor: Point,
        moved: bool,
    }

    impl EvdevSource {
        pub fn open(path: &Path) -> Result<Self> {
            let device = Device::open(path).map_err(|e| Error::Device {
                path: path.to_path_buf(),
                source: e,
            })?;
            info!("Input device {:?}: {}", path, device.name().unwrap_or("unnamed"));
            Ok(Self { device, cursor: Point::new(0, 0), moved: false })
        }

        /// Hand this source to the reactor; translated events land in
        /// `queue`
        pub fn attach(mut self, event_loop: &mut EventLoop, queue: InputQueue) -> Result<Token> {
            let fd = self.device.as_raw_fd();
            // Level-triggered polling needs a non-blocking read side.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
            event_loop.register(&mut SourceFd(&fd), Interest::READABLE, move || {
                self.pump(&queue);
            })
        }

        /// Read every pending kernel event and translate it into the queue
        fn pump(&mut self, queue: &InputQueue) {
            // Collect first: the fetch iterator borrows the device, and
            // translation below needs `&mut self` again.
            let events: Vec<_> = match self.device.fetch_events() {
                Ok(events) => events.collect(),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("Input read failed: {}", e);
                    return;
                }
            };
            for raw in events {
                match raw.kind() {
                    InputEventKind::Key(key) => {
                        self.translate_key(key, raw.value(), queue);
                    }
                    InputEventKind::AbsAxis(axis) => {
                        if axis == evdev::AbsoluteAxisType::ABS_X {
                            self.cursor.x = raw.value();
                            self.moved = true;
                        } else if axis == evdev::AbsoluteAxisType::ABS_Y {
                            self.cursor.y = raw.value();
                            self.moved = true;
                        }
                    }
                    InputEventKind::RelAxis(axis) => {
                        if axis == evdev::RelativeAxisType::REL_X {
                            self.cursor.x += raw.value();
                            self.moved = true;
                        } else if axis == evdev::RelativeAxisType::REL_Y {
                            self.cursor.y += raw.value();
                            self.moved = true;
                        }
                    }
                    InputEventKind::Synchronization(_) => {
                        if self.moved {
                            self.moved = false;
                            debug!("Pointer moved to {:?}", self.cursor);
                            queue.borrow_mut().push_back(Event::with_point(
                                EventId::RAW_POINTER_MOVE,
                                self.cursor,
                            ));
                        }
                    }
                    _ => {}
                }
            }
        }

        fn translate_key(&mut self, key: Key, value: i32, queue: &InputQueue) {
            let mut queue = queue.borrow_mut();
            if key == Key::BTN_TOUCH || key == Key::BTN_LEFT {
                let id = if value != 0 {
                    EventId::RAW_POINTER_DOWN
                } else {
                    EventId::RAW_POINTER_UP
                };
                queue.push_back(Event::with_point(id, self.cursor));
            } else {
                // Value 2 is kernel autorepeat, delivered as another press.
                let id = if value != 0 { EventId::KEY_DOWN } else { EventId::KEY_UP };
                queue.push_back(Event::with_key(id, key.code() as u32));
            }
        }
    }
}
