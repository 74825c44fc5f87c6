//! The narrow interface the compositor consumes from the GPU layer.
//!
//! The Vulkan implementation lives outside this crate; everything the core
//! needs is expressed here as object-safe traits plus plain data. A software
//! reference device ([`soft`]) backs the headless backend and the tests.

pub mod soft;

use std::{any::Any, os::fd::OwnedFd, rc::Rc, sync::Arc, time};

use drm_fourcc::{DrmFourcc, DrmModifier};
use glam::UVec2;

use crate::geom::Rect;

/// Blend state selected per draw batch. One graphics pipeline exists per
/// mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BlendMode {
    None,
    Premultiplied,
    Postmultiplied,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub size: UVec2,
    pub format: DrmFourcc,
}

/// Single-plane layout metadata for both shm and dmabuf pixel sources.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: u32,
    pub stride: u32,
}

/// Parameters collected from zwp_linux_buffer_params_v1. The plane list
/// stays a list in the data model even though ingress is limited to plane 0.
#[derive(Debug)]
pub struct DmabufImport {
    pub size: UVec2,
    pub format: DrmFourcc,
    pub modifier: DrmModifier,
    pub planes: Vec<DmabufPlane>,
}

#[derive(Debug)]
pub struct DmabufPlane {
    pub fd: OwnedFd,
    pub layout: PlaneLayout,
}

/// Format table advertised through zwp_linux_dmabuf_v1 feedback tranches.
#[derive(Debug, Clone)]
pub struct DmabufFeedback {
    /// dev_t of the primary rendering device.
    pub main_device: u64,
    pub formats: Vec<(DrmFourcc, DrmModifier)>,
}

pub trait Image: Any {
    fn size(&self) -> UVec2;
    fn format(&self) -> DrmFourcc;
    fn as_any(&self) -> &dyn Any;
}

pub type ImageHandle = Rc<dyn Image>;

pub trait GpuBuffer: Any {
    fn len(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

pub type BufferHandle = Rc<dyn GpuBuffer>;

/// A monotonically increasing synchronization timeline, matching both
/// Vulkan timeline semaphores and DRM syncobjs.
pub trait Timeline {
    fn signal(&self, value: u64) -> anyhow::Result<()>;
    fn poll(&self, value: u64) -> anyhow::Result<bool>;
    /// Blocks until the timeline reaches `value`. Only ever called from
    /// worker threads; the main loop uses `poll`.
    fn wait(&self, value: u64, timeout: time::Duration) -> anyhow::Result<()>;
}

pub type TimelineHandle = Arc<dyn Timeline + Send + Sync>;

/// A specific value on a timeline.
#[derive(Clone)]
pub struct TimelinePoint {
    pub timeline: TimelineHandle,
    pub value: u64,
}

impl TimelinePoint {
    pub fn new(timeline: TimelineHandle, value: u64) -> Self {
        Self { timeline, value }
    }

    pub fn signal(&self) -> anyhow::Result<()> {
        self.timeline.signal(self.value)
    }

    pub fn poll(&self) -> anyhow::Result<bool> {
        self.timeline.poll(self.value)
    }

    pub fn wait(&self, timeout: time::Duration) -> anyhow::Result<()> {
        self.timeline.wait(self.value, timeout)
    }
}

impl std::fmt::Debug for TimelinePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<timeline point {}>", self.value)
    }
}

/// An acquired swapchain image plus the point that must be waited on before
/// rendering to it.
pub struct AcquiredImage {
    pub image: ImageHandle,
    pub acquire: TimelinePoint,
}

pub trait Swapchain {
    fn resize(&mut self, size: UVec2) -> anyhow::Result<()>;
    /// Acquires the next image. The caller must wait on the returned point
    /// (as part of its submission) before writing.
    fn acquire(&mut self) -> anyhow::Result<AcquiredImage>;
    /// Queues the image for scanout once `waits` have signalled.
    fn present(&mut self, waits: &[TimelinePoint]) -> anyhow::Result<()>;
}

/// The POD rectangle format consumed by the blit pipelines. Mirrors the
/// shader-side struct; kept `repr(C)` so the renderer can memcpy an array of
/// them into a per-frame storage buffer.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct ShaderRect {
    /// Source sub-rect in texel coordinates; ignored for untextured rects.
    pub src: [f32; 4],
    /// Destination rect in output pixels.
    pub dst: [f32; 4],
    /// Scissor in output pixels.
    pub clip: [f32; 4],
    /// Multiplied with the sampled color, or used directly when untextured.
    pub color: [f32; 4],
    /// Index into the image list passed alongside the draw, or !0 for none.
    pub image: u32,
    pub _pad: [u32; 3],
}

pub fn bytes_of_rects(rects: &[ShaderRect]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(rects.as_ptr() as *const u8, std::mem::size_of_val(rects))
    }
}

/// One recorded batch of rect draws. The renderer buckets its draw list by
/// blend mode (and optionally into single-rect batches with
/// `--separate-draws`) and emits one of these per bucket.
pub struct DrawBatch<'a> {
    pub rects: &'a BufferHandle,
    pub first: u32,
    pub count: u32,
    pub blend: BlendMode,
    /// Textures referenced by the batch, indexed by `ShaderRect::image`.
    pub images: &'a [ImageHandle],
    pub scissor: Rect,
}

/// A command recording in flight. Every image, buffer, and guard object a
/// submission touches must be protected so it outlives GPU execution; the
/// device drops protected objects on the main thread once the submission's
/// completion point has been observed (`Device::retire_completed`).
pub trait Commands {
    fn begin(&mut self, target: &ImageHandle, clear: [f32; 4]) -> anyhow::Result<()>;
    fn upload(&mut self, dst: &BufferHandle, offset: usize, bytes: &[u8]) -> anyhow::Result<()>;
    fn draw(&mut self, target: &ImageHandle, batch: DrawBatch) -> anyhow::Result<()>;
    fn protect(&mut self, object: Rc<dyn Any>);
    /// Ends recording and submits. Execution begins once `waits` have
    /// signalled; `signals` (and the returned completion point) signal when
    /// it finishes.
    fn submit(
        self: Box<Self>,
        waits: Vec<TimelinePoint>,
        signals: Vec<TimelinePoint>,
    ) -> anyhow::Result<TimelinePoint>;
}

pub trait Device {
    fn create_image(&self, desc: &ImageDesc) -> anyhow::Result<ImageHandle>;
    /// Synchronous pixel upload, used for shm ingress and compositor-owned
    /// textures (cursor, background).
    fn update_image(&self, image: &ImageHandle, data: &[u8], stride: u32) -> anyhow::Result<()>;
    fn import_dmabuf(&self, import: &DmabufImport) -> anyhow::Result<ImageHandle>;

    fn create_buffer(&self, len: usize) -> anyhow::Result<BufferHandle>;

    fn create_timeline(&self, initial: u64) -> anyhow::Result<TimelineHandle>;
    /// Imports a DRM syncobj fd as a timeline.
    fn import_syncobj(&self, fd: OwnedFd) -> anyhow::Result<TimelineHandle>;

    fn create_swapchain(&self, size: UVec2, images: u32) -> anyhow::Result<Box<dyn Swapchain>>;
    fn begin_commands(&self) -> anyhow::Result<Box<dyn Commands>>;

    /// Drops protection lists of completed submissions. Called from the
    /// main loop's idle pass.
    fn retire_completed(&self) -> anyhow::Result<()>;

    /// Formats accepted for wl_shm buffers.
    fn shm_formats(&self) -> Vec<DrmFourcc>;
    /// None when dmabuf import is unavailable (or disabled with
    /// `--no-dmabuf`); the global is not advertised in that case.
    fn dmabuf_feedback(&self) -> Option<DmabufFeedback>;

    fn wait_idle(&self);
}

pub type DeviceHandle = Rc<dyn Device>;

pub fn fourcc_bpp(format: DrmFourcc) -> Option<usize> {
    match format {
        DrmFourcc::Argb8888 | DrmFourcc::Xrgb8888 | DrmFourcc::Abgr8888 | DrmFourcc::Xbgr8888 => {
            Some(4)
        }
        _ => None,
    }
}

pub fn fourcc_has_alpha(format: DrmFourcc) -> bool {
    matches!(format, DrmFourcc::Argb8888 | DrmFourcc::Abgr8888)
}
