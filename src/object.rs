//! Object / Event Dispatcher Module
//!
//! Generic publish/subscribe primitive: any entity owning an [`Object`] can
//! register filtered callbacks and invoke them in registration order.
//! Dispatch iterates a snapshot copy of the registration list, so handlers
//! may add or remove registrations mid-dispatch without invalidating the
//! in-progress iteration.

use std::cell::RefCell;
use std::rc::Rc;

use crate::geometry::Point;

/// Identifier for an event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u32);

impl EventId {
    pub const RAW_POINTER_DOWN: EventId = EventId(1);
    pub const RAW_POINTER_UP: EventId = EventId(2);
    pub const RAW_POINTER_MOVE: EventId = EventId(3);
    pub const KEY_DOWN: EventId = EventId(4);
    pub const KEY_UP: EventId = EventId(5);
    pub const SHOW: EventId = EventId(6);
    pub const HIDE: EventId = EventId(7);
    pub const DRAW: EventId = EventId(8);
    /// First id available for application-defined events
    pub const USER_BASE: EventId = EventId(1000);
}

/// A dispatched event: kind id, optional payload, and a quit-propagation
/// flag any handler may set to short-circuit the remaining handlers for the
/// current invocation only.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub point: Option<Point>,
    pub key: Option<u32>,
    quit: bool,
}

impl Event {
    pub fn new(id: EventId) -> Self {
        Self { id, point: None, key: None, quit: false }
    }

    pub fn with_point(id: EventId, point: Point) -> Self {
        Self { id, point: Some(point), key: None, quit: false }
    }

    pub fn with_key(id: EventId, key: u32) -> Self {
        Self { id, point: None, key: Some(key), quit: false }
    }

    /// Stop propagation: no further handlers run for this invocation
    pub fn stop(&mut self) {
        self.quit = true;
    }

    pub fn quit_requested(&self) -> bool {
        self.quit
    }

    /// Re-arm a consumed event before handing it to the next dispatch target
    pub(crate) fn reset_quit(&mut self) {
        self.quit = false;
    }
}

/// Registration handle, unique per [`Object`] for the Object's lifetime
///
/// Handles are monotonically increasing and never reused automatically; a
/// handle becomes dead only through [`Object::remove_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Handle(pub u64);

type Callback = Rc<RefCell<dyn FnMut(&mut Event)>>;

#[derive(Clone)]
struct Registration {
    handle: Handle,
    /// Empty filter matches all event kinds
    filter: Vec<EventId>,
    callback: Callback,
}

/// Ordered collection of (callback, filter, handle) registrations
///
/// Registration lists live behind a `RefCell` so that a running handler can
/// call back into the same Object (register, remove, clear) re-entrantly:
/// dispatch operates on a snapshot taken before the first handler runs.
#[derive(Default)]
pub struct Object {
    registrations: RefCell<Vec<Registration>>,
    next_handle: RefCell<u64>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for the event kinds in `filter`
    ///
    /// An empty filter matches every event kind. Returns a handle that is
    /// strictly greater than every handle this Object has issued before.
    pub fn on_event<F>(&self, callback: F, filter: Vec<EventId>) -> Handle
    where
        F: FnMut(&mut Event) + 'static,
    {
        let mut next = self.next_handle.borrow_mut();
        let handle = Handle(*next);
        *next += 1;
        self.registrations.borrow_mut().push(Registration {
            handle,
            filter,
            callback: Rc::new(RefCell::new(callback)),
        });
        handle
    }

    /// Invoke matching handlers in registration order
    ///
    /// Iterates a snapshot of the registration list taken now; handlers
    /// added during dispatch run on the next invocation, and handlers
    /// removed during dispatch are skipped if they have not run yet, so a
    /// stale handle is never invoked. Stops as soon as a handler sets the
    /// event's quit flag. An empty registration list is a silent no-op.
    pub fn invoke_handlers(&self, event: &mut Event) {
        let snapshot: Vec<Registration> = self.registrations.borrow().clone();
        for registration in snapshot {
            if !registration.filter.is_empty() && !registration.filter.contains(&event.id) {
                continue;
            }
            // Skip entries removed earlier in this same dispatch.
            if !self.is_registered(registration.handle) {
                continue;
            }
            (registration.callback.borrow_mut())(event);
            if event.quit {
                break;
            }
        }
    }

    /// Remove one registration; returns whether the handle was live
    pub fn remove_handler(&self, handle: Handle) -> bool {
        let mut registrations = self.registrations.borrow_mut();
        let before = registrations.len();
        registrations.retain(|r| r.handle != handle);
        registrations.len() != before
    }

    /// Drop every registration; issued handles are never reused
    pub fn clear_event_handlers(&self) {
        self.registrations.borrow_mut().clear();
    }

    pub fn handler_count(&self) -> usize {
        self.registrations.borrow().len()
    }

    fn is_registered(&self, handle: Handle) -> bool {
        self.registrations.borrow().iter().any(|r| r.handle == handle)
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("handlers", &self.handler_count())
            .finish()
    }
}
