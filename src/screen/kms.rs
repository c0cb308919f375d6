//! KMS Overlay Screen
//!
//! Hardware screen backed by a display-controller overlay plane. The KMS
//! device itself is an external collaborator reached through the
//! [`PlaneDevice`] trait: the screen requests a plane by kind, size and
//! format, receives an opaque plane id plus buffer layout, and afterwards
//! only draws, commits and repositions through that id.
//!
//! Flip submission never blocks. Completion is signaled by the device's
//! flip worker through a [`FlipNotifier`] (shared queue plus `mio` waker)
//! drained on the cooperative loop thread; the buffer-index handoff in that
//! queue is the only cross-thread state in the toolkit.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::geometry::{DamageArray, Point, Rect, Size};
use crate::screen::{clip_to_screen, PixelFormat, Screen, SurfaceMut};

/// Opaque identifier for an allocated hardware plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaneId(pub u32);

/// Hardware plane kinds, a finite hint-directed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaneKind {
    Primary,
    Overlay,
    Cursor,
    /// High-end overlay: an overlay plane with scaling support
    Heo,
}

/// Free-plane counts reported by a device probe
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneReport {
    pub free_primary: usize,
    pub free_overlay: usize,
    pub free_cursor: usize,
    pub free_heo: usize,
}

impl PlaneReport {
    pub fn free(&self, kind: PlaneKind) -> usize {
        match kind {
            PlaneKind::Primary => self.free_primary,
            PlaneKind::Overlay => self.free_overlay,
            PlaneKind::Cursor => self.free_cursor,
            PlaneKind::Heo => self.free_heo,
        }
    }
}

/// Parameters of a plane allocation request
#[derive(Debug, Clone)]
pub struct PlaneRequest {
    pub kind: PlaneKind,
    pub size: Size,
    pub format: PixelFormat,
    pub buffer_count: usize,
}

/// Result of a successful plane allocation
#[derive(Debug, Clone)]
pub struct PlaneAllocation {
    pub id: PlaneId,
    /// Driver buffer identifier, usable for cross-process/GPU sharing
    pub gem_handle: u64,
    pub stride: usize,
    pub size: Size,
    pub buffer_count: usize,
}

/// The KMS collaborator boundary
///
/// Implementations own the driver handles and buffer memory; the toolkit
/// addresses everything through [`PlaneId`]. Allocation can exhaust
/// ([`Error::PlaneExhausted`]); a reportable error, never fatal to the
/// process. `commit` must not block: real devices submit and signal
/// completion later through the [`FlipNotifier`] given at construction.
pub trait PlaneDevice {
    /// Count free planes per kind, for backend negotiation
    fn report(&self) -> PlaneReport;

    fn allocate(&mut self, request: &PlaneRequest) -> Result<PlaneAllocation>;

    /// Release a plane; idempotent for already-released ids
    fn release(&mut self, plane: PlaneId);

    /// Run `f` over the raw memory of one buffer of a plane
    fn with_buffer(
        &mut self,
        plane: PlaneId,
        index: usize,
        f: &mut dyn FnMut(&mut SurfaceMut<'_>),
    ) -> Result<()>;

    /// Submit buffer `index` of `plane` to the display pipeline
    fn commit(&mut self, plane: PlaneId, index: usize, damage: &[Rect]) -> Result<()>;

    /// Reposition/rescale the plane's output without touching its buffers
    fn set_geometry(&mut self, plane: PlaneId, dest: Rect) -> Result<()>;
}

/// Shared handle to a plane device (single-threaded toolkit side)
pub type SharedPlaneDevice = Rc<RefCell<dyn PlaneDevice>>;

/// Flip-completion record posted by a device's worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipComplete {
    pub plane: PlaneId,
}

/// Channel from the flip worker back into the cooperative loop
///
/// Cloneable; the worker thread pushes completion records and rings the
/// loop's `mio` waker, the loop drains on its own thread. No other UI state
/// crosses threads.
#[derive(Clone, Default)]
pub struct FlipNotifier {
    queue: Arc<Mutex<VecDeque<FlipComplete>>>,
    waker: Arc<Mutex<Option<Arc<mio::Waker>>>>,
}

impl FlipNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the loop's waker so posts interrupt a blocked poll
    pub(crate) fn attach_waker(&self, waker: Arc<mio::Waker>) {
        *self.waker.lock().expect("flip notifier poisoned") = Some(waker);
    }

    /// Post a completion; called from the worker thread
    pub fn post(&self, complete: FlipComplete) {
        self.queue.lock().expect("flip notifier poisoned").push_back(complete);
        if let Some(waker) = self.waker.lock().expect("flip notifier poisoned").as_ref() {
            if let Err(e) = waker.wake() {
                warn!("Failed to wake event loop for flip completion: {}", e);
            }
        }
    }

    /// Drain pending completions; called on the loop thread
    pub fn drain(&self) -> Vec<FlipComplete> {
        self.queue.lock().expect("flip notifier poisoned").drain(..).collect()
    }
}

/// Hardware overlay screen
///
/// Owns exactly one plane for its lifetime; the plane is released on drop.
/// Defaults to triple buffering so the application can draw buffer N+2
/// while N is on-screen and N+1 is pending vsync.
pub struct KmsScreen {
    device: SharedPlaneDevice,
    allocation: PlaneAllocation,
    kind: PlaneKind,
    format: PixelFormat,
    /// Output geometry on the display (scan-out destination)
    output: Rect,
    current: usize,
    /// Buffers submitted but not yet signaled on-screen
    in_flight: usize,
    damage: DamageArray,
}

impl KmsScreen {
    /// Allocate a plane of `kind` and build a screen over it
    ///
    /// Fails with [`Error::PlaneExhausted`] when the device has no free
    /// plane of the requested kind, or [`Error::UnsupportedFormat`] when
    /// the plane cannot scan out `format`. Both propagate to the caller;
    /// fallback to software is the window backend's negotiation policy,
    /// not a retry loop here.
    pub fn new(
        device: SharedPlaneDevice,
        kind: PlaneKind,
        origin: Point,
        size: Size,
        format: PixelFormat,
        buffer_count: usize,
    ) -> Result<Self> {
        let request = PlaneRequest { kind, size, format, buffer_count: buffer_count.max(1) };
        let allocation = device.borrow_mut().allocate(&request)?;
        info!(
            "Allocated {:?} plane {:?}: {}x{} {:?}, {} buffers",
            kind, allocation.id, size.width, size.height, format, allocation.buffer_count
        );
        let output = Rect::new(origin.x, origin.y, size.width, size.height);
        device.borrow_mut().set_geometry(allocation.id, output)?;
        Ok(Self {
            device,
            allocation,
            kind,
            format,
            output,
            current: 0,
            in_flight: 0,
            damage: DamageArray::new(),
        })
    }

    pub fn kind(&self) -> PlaneKind {
        self.kind
    }

    pub fn output_geometry(&self) -> Rect {
        self.output
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Reallocate the plane's buffer set for a larger source geometry
    ///
    /// The replacement is allocated before the old plane is released, so a
    /// failed allocation propagates with the screen still intact on its old
    /// plane and buffers. Any frame in flight refers to the old buffers,
    /// which the device keeps alive until release; the new buffer set
    /// starts clean with full damage.
    fn reallocate(&mut self, size: Size) -> Result<()> {
        debug!(
            "Reallocating plane {:?}: {}x{} -> {}x{}",
            self.allocation.id,
            self.allocation.size.width,
            self.allocation.size.height,
            size.width,
            size.height
        );
        let request = PlaneRequest {
            kind: self.kind,
            size,
            format: self.format,
            buffer_count: self.allocation.buffer_count,
        };
        let mut device = self.device.borrow_mut();
        let allocation = device.allocate(&request)?;
        device.release(self.allocation.id);
        drop(device);
        self.allocation = allocation;
        self.current = 0;
        self.in_flight = 0;
        self.damage.clear();
        self.damage.add(Rect::from_size(size));
        Ok(())
    }
}

impl Screen for KmsScreen {
    fn size(&self) -> Size {
        self.allocation.size
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn buffer_count(&self) -> usize {
        self.allocation.buffer_count
    }

    fn current_buffer(&self) -> usize {
        self.current
    }

    fn add_damage(&mut self, rect: Rect) {
        if let Some(clipped) = clip_to_screen(rect, self.allocation.size) {
            self.damage.add(clipped);
        }
    }

    fn pending_damage(&self) -> &DamageArray {
        &self.damage
    }

    fn with_surface(&mut self, f: &mut dyn FnMut(&mut SurfaceMut<'_>)) -> Result<()> {
        self.device.borrow_mut().with_buffer(self.allocation.id, self.current, f)
    }

    fn schedule_flip(&mut self) -> Result<bool> {
        if self.damage.is_empty() {
            return Ok(false);
        }
        // With every other buffer queued or on-screen there is nowhere to
        // draw the next frame; keep the damage and let the pending
        // completion retry this flip on a later cycle.
        if self.allocation.buffer_count > 1 && self.in_flight >= self.allocation.buffer_count - 1 {
            debug!(
                "Plane {:?}: {} flips in flight, deferring",
                self.allocation.id, self.in_flight
            );
            return Ok(false);
        }
        let rects = self.damage.rects().to_vec();
        self.device
            .borrow_mut()
            .commit(self.allocation.id, self.current, &rects)?;
        // Submission succeeded: the damage is committed to the pipeline.
        self.damage.clear();
        self.in_flight += 1;
        self.current = (self.current + 1) % self.allocation.buffer_count;
        Ok(true)
    }

    fn set_output_geometry(&mut self, dest: Rect) -> Result<()> {
        if dest.width > self.allocation.size.width || dest.height > self.allocation.size.height {
            self.reallocate(dest.size())?;
        }
        self.device.borrow_mut().set_geometry(self.allocation.id, dest)?;
        self.output = dest;
        Ok(())
    }

    fn plane(&self) -> Option<PlaneId> {
        Some(self.allocation.id)
    }

    fn handle_flip_complete(&mut self) {
        debug_assert!(self.in_flight > 0, "completion without a submitted flip");
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

impl Drop for KmsScreen {
    fn drop(&mut self) {
        self.device.borrow_mut().release(self.allocation.id);
    }
}

/// In-process plane device used by unit tests across the crate
///
/// Completes every commit synchronously through the notifier, which is what
/// a display controller with an instantaneous vsync would do.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    pub(crate) struct FakePlane {
        pub kind: PlaneKind,
        pub size: Size,
        pub format: PixelFormat,
        pub stride: usize,
        pub buffers: Vec<Vec<u8>>,
        pub geometry: Rect,
        pub commits: Vec<(usize, Vec<Rect>)>,
    }

    pub(crate) struct FakePlaneDevice {
        free: PlaneReport,
        next_id: u32,
        pub planes: HashMap<PlaneId, FakePlane>,
        pub notifier: FlipNotifier,
        /// When false, commits stay pending until `complete_oldest`
        pub auto_complete: bool,
        /// When set, the next commit fails with this I/O error kind
        pub fail_next_commit: bool,
    }

    impl FakePlaneDevice {
        pub fn new(free: PlaneReport, notifier: FlipNotifier) -> Self {
            Self {
                free,
                next_id: 1,
                planes: HashMap::new(),
                notifier,
                auto_complete: true,
                fail_next_commit: false,
            }
        }

        /// Concrete shared handle; coerces to [`SharedPlaneDevice`] at use
        /// sites while tests keep access to the fake's knobs
        pub fn shared(free: PlaneReport, notifier: FlipNotifier) -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(Self::new(free, notifier)))
        }

        fn free_mut(&mut self, kind: PlaneKind) -> &mut usize {
            match kind {
                PlaneKind::Primary => &mut self.free.free_primary,
                PlaneKind::Overlay => &mut self.free.free_overlay,
                PlaneKind::Cursor => &mut self.free.free_cursor,
                PlaneKind::Heo => &mut self.free.free_heo,
            }
        }
    }

    impl PlaneDevice for FakePlaneDevice {
        fn report(&self) -> PlaneReport {
            self.free
        }

        fn allocate(&mut self, request: &PlaneRequest) -> Result<PlaneAllocation> {
            if *self.free_mut(request.kind) == 0 {
                return Err(Error::PlaneExhausted(request.kind));
            }
            *self.free_mut(request.kind) -= 1;
            let id = PlaneId(self.next_id);
            self.next_id += 1;
            let stride = request.size.width as usize * request.format.bytes_per_pixel();
            let buffers = (0..request.buffer_count)
                .map(|_| vec![0u8; stride * request.size.height as usize])
                .collect();
            self.planes.insert(
                id,
                FakePlane {
                    kind: request.kind,
                    size: request.size,
                    format: request.format,
                    stride,
                    buffers,
                    geometry: Rect::from_size(request.size),
                    commits: Vec::new(),
                },
            );
            Ok(PlaneAllocation {
                id,
                gem_handle: 0x1000 + id.0 as u64,
                stride,
                size: request.size,
                buffer_count: request.buffer_count,
            })
        }

        fn release(&mut self, plane: PlaneId) {
            if let Some(released) = self.planes.remove(&plane) {
                *self.free_mut(released.kind) += 1;
            }
        }

        fn with_buffer(
            &mut self,
            plane: PlaneId,
            index: usize,
            f: &mut dyn FnMut(&mut SurfaceMut<'_>),
        ) -> Result<()> {
            let plane = self.planes.get_mut(&plane).expect("unknown plane");
            let mut surface = SurfaceMut {
                data: &mut plane.buffers[index],
                size: plane.size,
                stride: plane.stride,
                format: plane.format,
            };
            f(&mut surface);
            Ok(())
        }

        fn commit(&mut self, plane: PlaneId, index: usize, damage: &[Rect]) -> Result<()> {
            if self.fail_next_commit {
                self.fail_next_commit = false;
                return Err(Error::Present(std::io::Error::from(std::io::ErrorKind::Other)));
            }
            let entry = self.planes.get_mut(&plane).expect("unknown plane");
            entry.commits.push((index, damage.to_vec()));
            if self.auto_complete {
                self.notifier.post(FlipComplete { plane });
            }
            Ok(())
        }

        fn set_geometry(&mut self, plane: PlaneId, dest: Rect) -> Result<()> {
            self.planes.get_mut(&plane).expect("unknown plane").geometry = dest;
            Ok(())
        }
    }
}
