//! DRM Plane Device
//!
//! [`PlaneDevice`] implementation over a KMS device node (`/dev/dri/card0`),
//! using universal planes and dumb buffers. Primary-plane flips are
//! submitted with an event flag and their completions are read by a
//! background thread polling the card fd with mio (100ms timeout so the
//! thread can observe shutdown), which posts into the loop's
//! [`FlipNotifier`]. Legacy `set_plane` on overlay/cursor planes has no
//! completion event; those commits latch at the next vblank, so completion
//! is posted right after submission.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drm::buffer::{Buffer, DrmFourcc};
use drm::control::{
    connector, crtc, dumbbuffer::DumbBuffer, framebuffer, plane, Device as ControlDevice,
    Event as DrmEvent, PageFlipFlags,
};
use drm::ClientCapability;
use drm::Device as BasicDevice;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::geometry::{Rect, Size};
use crate::screen::kms::{
    FlipComplete, FlipNotifier, PlaneAllocation, PlaneDevice, PlaneId, PlaneKind, PlaneReport,
    PlaneRequest,
};
use crate::screen::{PixelFormat, SurfaceMut};

/// Minimal wrapper giving the drm crate's device traits a concrete type
pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for Card {}
impl ControlDevice for Card {}

fn fourcc(format: PixelFormat) -> DrmFourcc {
    match format {
        PixelFormat::Argb8888 => DrmFourcc::Argb8888,
        PixelFormat::Xrgb8888 => DrmFourcc::Xrgb8888,
        PixelFormat::Rgb565 => DrmFourcc::Rgb565,
    }
}

fn depth_bpp(format: PixelFormat) -> (u32, u32) {
    match format {
        PixelFormat::Argb8888 => (32, 32),
        PixelFormat::Xrgb8888 => (24, 32),
        PixelFormat::Rgb565 => (16, 16),
    }
}

struct DrmPlane {
    kind: PlaneKind,
    handle: plane::Handle,
    size: Size,
    format: PixelFormat,
    buffers: Vec<DumbBuffer>,
    framebuffers: Vec<framebuffer::Handle>,
    dest: Rect,
}

pub struct DrmPlaneDevice {
    card: Arc<Card>,
    crtc: crtc::Handle,
    /// Plane handles not currently bound to a screen, per kind
    free: HashMap<PlaneKind, Vec<plane::Handle>>,
    planes: HashMap<PlaneId, DrmPlane>,
    next_id: u32,
    notifier: FlipNotifier,
    /// Plane id whose flips the event thread reports (primary only)
    primary_flip: Arc<Mutex<Option<PlaneId>>>,
    shutdown: Arc<AtomicBool>,
}

impl DrmPlaneDevice {
    /// Open a KMS card, probe its planes and start the flip-event thread
    ///
    /// Every failure here (open, capability, resource probe) is fatal to
    /// this device's construction and propagates to the caller.
    pub fn open(path: &Path, notifier: FlipNotifier) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Device { path: path.to_path_buf(), source: e })?;
        let card = Arc::new(Card(file));

        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(|e| Error::Device { path: path.to_path_buf(), source: e })?;

        let resources = card
            .resource_handles()
            .map_err(|e| Error::Device { path: path.to_path_buf(), source: e })?;

        // First connected connector decides the active pipe.
        let mut connected = None;
        for &conn in resources.connectors() {
            if let Ok(info) = card.get_connector(conn, false) {
                if info.state() == connector::State::Connected {
                    connected = Some(info);
                    break;
                }
            }
        }
        let connector_info = connected.ok_or_else(|| Error::Device {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no connected connector"),
        })?;
        let crtc_handle = *resources.crtcs().first().ok_or_else(|| Error::Device {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no CRTC"),
        })?;

        let mode_size = connector_info
            .modes()
            .first()
            .map(|m| m.size())
            .unwrap_or((0, 0));
        info!(
            "KMS card {:?}: connector {:?}, crtc {:?}, mode {}x{}",
            path,
            connector_info.interface(),
            crtc_handle,
            mode_size.0,
            mode_size.1
        );

        let mut free: HashMap<PlaneKind, Vec<plane::Handle>> = HashMap::new();
        let plane_handles = card
            .plane_handles()
            .map_err(|e| Error::Device { path: path.to_path_buf(), source: e })?;
        for handle in plane_handles {
            let kind = plane_type(&card, handle).unwrap_or(PlaneKind::Overlay);
            free.entry(kind).or_default().push(handle);
        }
        for (kind, handles) in &free {
            debug!("{} free {:?} planes", handles.len(), kind);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let primary_flip = Arc::new(Mutex::new(None));
        spawn_flip_thread(
            card.clone(),
            notifier.clone(),
            primary_flip.clone(),
            shutdown.clone(),
        )?;

        Ok(Self {
            card,
            crtc: crtc_handle,
            free,
            planes: HashMap::new(),
            next_id: 1,
            notifier,
            primary_flip,
            shutdown,
        })
    }

    fn plane_mut(&mut self, id: PlaneId) -> &mut DrmPlane {
        self.planes.get_mut(&id).expect("plane id not allocated by this device")
    }
}

/// Read a plane's `type` property to classify it
fn plane_type(card: &Card, handle: plane::Handle) -> Option<PlaneKind> {
    let props = card.get_properties(handle).ok()?;
    for (&prop, &value) in props.iter() {
        let info = card.get_property(prop).ok()?;
        if info.name().to_str().ok()? == "type" {
            // DRM_PLANE_TYPE_{OVERLAY,PRIMARY,CURSOR} = 0, 1, 2
            return match value {
                0 => Some(PlaneKind::Overlay),
                1 => Some(PlaneKind::Primary),
                2 => Some(PlaneKind::Cursor),
                _ => None,
            };
        }
    }
    None
}

/// Background thread: poll the card fd, read flip events, post completions
///
/// Mirrors the structure of a readiness-poll worker: mio poll with a 100ms
/// timeout so the thread notices the shutdown flag, readable fd means drm
/// events are waiting.
fn spawn_flip_thread(
    card: Arc<Card>,
    notifier: FlipNotifier,
    primary_flip: Arc<Mutex<Option<PlaneId>>>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let fd = card.as_fd().as_raw_fd();
    let mut poll = mio::Poll::new().map_err(Error::Loop)?;
    let mut events = mio::Events::with_capacity(4);
    poll.registry()
        .register(&mut mio::unix::SourceFd(&fd), mio::Token(0), mio::Interest::READABLE)
        .map_err(Error::Loop)?;

    let timeout = Duration::from_millis(100);
    std::thread::Builder::new()
        .name("egret-flip".into())
        .spawn(move || loop {
            if shutdown.load(Ordering::Relaxed) {
                debug!("Flip event thread shutting down");
                return;
            }
            if let Err(e) = poll.poll(&mut events, Some(timeout)) {
                warn!("Flip event poll failed: {}", e);
                continue;
            }
            if events.is_empty() {
                continue;
            }
            match card.receive_events() {
                Ok(drm_events) => {
                    for event in drm_events {
                        if let DrmEvent::PageFlip(_) = event {
                            if let Some(plane) =
                                *primary_flip.lock().expect("primary flip lock poisoned")
                            {
                                notifier.post(FlipComplete { plane });
                            }
                        }
                    }
                }
                Err(e) => warn!("Failed to read drm events: {}", e),
            }
        })
        .map_err(Error::Loop)?;
    Ok(())
}

impl PlaneDevice for DrmPlaneDevice {
    fn report(&self) -> PlaneReport {
        PlaneReport {
            free_primary: self.free.get(&PlaneKind::Primary).map_or(0, Vec::len),
            free_overlay: self.free.get(&PlaneKind::Overlay).map_or(0, Vec::len),
            free_cursor: self.free.get(&PlaneKind::Cursor).map_or(0, Vec::len),
            free_heo: self.free.get(&PlaneKind::Heo).map_or(0, Vec::len),
        }
    }

    fn allocate(&mut self, request: &PlaneRequest) -> Result<PlaneAllocation> {
        // An HEO request is an overlay plane with scaling; the classifier
        // files scalable overlays under Overlay, so both kinds draw from
        // that pool.
        let pool = match request.kind {
            PlaneKind::Heo => PlaneKind::Overlay,
            other => other,
        };
        let handle = self
            .free
            .get_mut(&pool)
            .and_then(Vec::pop)
            .ok_or(Error::PlaneExhausted(request.kind))?;

        let (depth, bpp) = depth_bpp(request.format);
        let mut buffers = Vec::with_capacity(request.buffer_count);
        let mut framebuffers = Vec::with_capacity(request.buffer_count);
        let dims = (request.size.width, request.size.height);
        for _ in 0..request.buffer_count {
            let db = self
                .card
                .create_dumb_buffer(dims, fourcc(request.format), bpp)
                .map_err(|e| {
                    warn!("Dumb buffer allocation failed: {}", e);
                    Error::UnsupportedFormat(request.format)
                })?;
            let fb = self.card.add_framebuffer(&db, depth, bpp).map_err(Error::Present)?;
            buffers.push(db);
            framebuffers.push(fb);
        }
        let stride = buffers[0].pitch() as usize;
        let gem_handle: u32 = buffers[0].handle().into();

        let id = PlaneId(self.next_id);
        self.next_id += 1;
        self.planes.insert(
            id,
            DrmPlane {
                kind: request.kind,
                handle,
                size: request.size,
                format: request.format,
                buffers,
                framebuffers,
                dest: Rect::from_size(request.size),
            },
        );
        debug!("Allocated drm plane {:?} as {:?} ({:?})", handle, id, request.kind);
        Ok(PlaneAllocation {
            id,
            gem_handle: gem_handle as u64,
            stride,
            size: request.size,
            buffer_count: self.planes[&id].buffers.len(),
        })
    }

    fn release(&mut self, plane: PlaneId) {
        let Some(released) = self.planes.remove(&plane) else {
            return;
        };
        for fb in released.framebuffers {
            if let Err(e) = self.card.destroy_framebuffer(fb) {
                warn!("Failed to destroy framebuffer: {}", e);
            }
        }
        for db in released.buffers {
            if let Err(e) = self.card.destroy_dumb_buffer(db) {
                warn!("Failed to destroy dumb buffer: {}", e);
            }
        }
        let pool = match released.kind {
            PlaneKind::Heo => PlaneKind::Overlay,
            other => other,
        };
        self.free.entry(pool).or_default().push(released.handle);
        if *self.primary_flip.lock().expect("primary flip lock poisoned") == Some(plane) {
            *self.primary_flip.lock().expect("primary flip lock poisoned") = None;
        }
    }

    fn with_buffer(
        &mut self,
        plane: PlaneId,
        index: usize,
        f: &mut dyn FnMut(&mut SurfaceMut<'_>),
    ) -> Result<()> {
        let card = self.card.clone();
        let entry = self.plane_mut(plane);
        let size = entry.size;
        let format = entry.format;
        let stride = entry.buffers[index].pitch() as usize;
        let mut mapping = card
            .map_dumb_buffer(&mut entry.buffers[index])
            .map_err(Error::Map)?;
        let mut surface = SurfaceMut { data: mapping.as_mut(), size, stride, format };
        f(&mut surface);
        Ok(())
    }

    fn commit(&mut self, plane: PlaneId, index: usize, _damage: &[Rect]) -> Result<()> {
        let card = self.card.clone();
        let crtc = self.crtc;
        let entry = self.plane_mut(plane);
        let fb = entry.framebuffers[index];
        match entry.kind {
            PlaneKind::Primary => {
                *self.primary_flip.lock().expect("primary flip lock poisoned") = Some(plane);
                card.page_flip(crtc, fb, PageFlipFlags::EVENT, None)
                    .map_err(Error::Present)?;
                // Completion arrives via the event thread.
            }
            _ => {
                let dest = entry.dest;
                let src_w = entry.size.width << 16;
                let src_h = entry.size.height << 16;
                card.set_plane(
                    entry.handle,
                    crtc,
                    Some(fb),
                    0,
                    (dest.x, dest.y, dest.width, dest.height),
                    (0, 0, src_w, src_h),
                )
                .map_err(Error::Present)?;
                // Legacy set_plane latches at the next vblank without an
                // event; report completion now so the buffer ring advances.
                self.notifier.post(FlipComplete { plane });
            }
        }
        Ok(())
    }

    fn set_geometry(&mut self, plane: PlaneId, dest: Rect) -> Result<()> {
        // Stored here and applied with the next commit; repositioning an
        // idle plane before its first frame would scan out stale memory.
        self.plane_mut(plane).dest = dest;
        Ok(())
    }
}

impl Drop for DrmPlaneDevice {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let ids: Vec<PlaneId> = self.planes.keys().copied().collect();
        for id in ids {
            self.release(id);
        }
    }
}
