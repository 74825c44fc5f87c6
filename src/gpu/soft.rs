//! A software reference implementation of the GPU interface.
//!
//! Images are byte vectors and timelines are mutex-guarded counters. Draws
//! are executed as plain copies and recorded, which is what the headless
//! backend needs and what the tests introspect. Deferred completion can be
//! enabled to exercise the frame-pacing paths.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    os::fd::OwnedFd,
    rc::Rc,
    sync::{Arc, Condvar, Mutex},
    time,
};

use anyhow::{bail, Context as _};
use drm_fourcc::DrmFourcc;
use glam::UVec2;

use super::{
    AcquiredImage, BlendMode, BufferHandle, Commands, Device, DmabufFeedback, DmabufImport,
    DrawBatch, GpuBuffer, Image, ImageDesc, ImageHandle, ShaderRect, Swapchain, Timeline,
    TimelineHandle, TimelinePoint,
};

pub struct SoftImage {
    pub id: u64,
    size: UVec2,
    format: DrmFourcc,
    pub pixels: RefCell<Vec<u8>>,
}

impl Image for SoftImage {
    fn size(&self) -> UVec2 {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct SoftBuffer {
    pub data: RefCell<Vec<u8>>,
}

impl GpuBuffer for SoftBuffer {
    fn len(&self) -> usize {
        self.data.borrow().len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct SoftTimeline {
    value: Mutex<u64>,
    cond: Condvar,
}

impl SoftTimeline {
    pub fn new(initial: u64) -> Self {
        Self {
            value: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }
}

impl Timeline for SoftTimeline {
    fn signal(&self, value: u64) -> anyhow::Result<()> {
        let mut current = self.value.lock().unwrap();
        if value > *current {
            *current = value;
            self.cond.notify_all();
        }

        Ok(())
    }

    fn poll(&self, value: u64) -> anyhow::Result<bool> {
        Ok(*self.value.lock().unwrap() >= value)
    }

    fn wait(&self, value: u64, timeout: time::Duration) -> anyhow::Result<()> {
        let guard = self.value.lock().unwrap();
        let (guard, result) = self
            .cond
            .wait_timeout_while(guard, timeout, |v| *v < value)
            .unwrap();
        drop(guard);

        if result.timed_out() {
            bail!("timed out waiting for timeline value {value}");
        }

        Ok(())
    }
}

/// One recorded rect draw, for test introspection.
#[derive(Debug, Clone)]
pub struct DrawRecord {
    pub image: Option<u64>,
    pub dst: [f32; 4],
    pub clip: [f32; 4],
    pub color: [f32; 4],
    pub blend: BlendMode,
}

struct PendingSubmission {
    ops: Vec<Op>,
    protected: Vec<Rc<dyn Any>>,
    signals: Vec<TimelinePoint>,
    completion: TimelinePoint,
}

enum Op {
    Upload {
        dst: BufferHandle,
        offset: usize,
        bytes: Vec<u8>,
    },
    Draw {
        records: Vec<DrawRecord>,
    },
}

#[derive(Default)]
struct Inner {
    next_image_id: Cell<u64>,
    /// When false, submissions stay queued until `complete_one` is called.
    auto_complete: Cell<bool>,
    queued: RefCell<Vec<PendingSubmission>>,
    retained: RefCell<Vec<(TimelinePoint, Vec<Rc<dyn Any>>)>>,
    draw_log: RefCell<Vec<DrawRecord>>,
    submissions: Cell<u64>,
}

#[derive(Clone)]
pub struct SoftDevice(Rc<Inner>);

impl SoftDevice {
    pub fn new() -> Self {
        let inner = Inner {
            auto_complete: Cell::new(true),
            ..Inner::default()
        };

        Self(Rc::new(inner))
    }

    pub fn set_auto_complete(&self, auto: bool) {
        self.0.auto_complete.set(auto);
    }

    pub fn pending_submissions(&self) -> usize {
        self.0.queued.borrow().len()
    }

    pub fn submissions(&self) -> u64 {
        self.0.submissions.get()
    }

    pub fn take_draw_log(&self) -> Vec<DrawRecord> {
        std::mem::take(&mut *self.0.draw_log.borrow_mut())
    }

    /// Executes the oldest queued submission and signals its completion.
    pub fn complete_one(&self) -> anyhow::Result<bool> {
        let submission = {
            let mut queued = self.0.queued.borrow_mut();
            if queued.is_empty() {
                return Ok(false);
            }
            queued.remove(0)
        };

        self.execute(submission)?;
        Ok(true)
    }

    fn execute(&self, submission: PendingSubmission) -> anyhow::Result<()> {
        for op in submission.ops {
            match op {
                Op::Upload { dst, offset, bytes } => {
                    let buffer = dst
                        .as_any()
                        .downcast_ref::<SoftBuffer>()
                        .context("foreign buffer")?;
                    let mut data = buffer.data.borrow_mut();
                    if data.len() < offset + bytes.len() {
                        bail!("upload out of bounds");
                    }
                    data[offset..offset + bytes.len()].copy_from_slice(&bytes);
                }
                Op::Draw { records } => {
                    self.0.draw_log.borrow_mut().extend(records);
                }
            }
        }

        for signal in &submission.signals {
            signal.signal()?;
        }
        submission.completion.signal()?;
        self.0.submissions.set(self.0.submissions.get() + 1);

        // Protected objects are released from the main loop's idle pass.
        self.0
            .retained
            .borrow_mut()
            .push((submission.completion, submission.protected));

        Ok(())
    }

    fn alloc_image(&self, size: UVec2, format: DrmFourcc) -> ImageHandle {
        let id = self.0.next_image_id.get();
        self.0.next_image_id.set(id + 1);

        let bpp = super::fourcc_bpp(format).unwrap_or(4);
        Rc::new(SoftImage {
            id,
            size,
            format,
            pixels: RefCell::new(vec![0; size.x as usize * size.y as usize * bpp]),
        })
    }
}

pub struct SoftCommands {
    device: SoftDevice,
    ops: Vec<Op>,
    protected: Vec<Rc<dyn Any>>,
}

impl Commands for SoftCommands {
    fn begin(&mut self, _target: &ImageHandle, _clear: [f32; 4]) -> anyhow::Result<()> {
        Ok(())
    }

    fn upload(&mut self, dst: &BufferHandle, offset: usize, bytes: &[u8]) -> anyhow::Result<()> {
        self.ops.push(Op::Upload {
            dst: dst.clone(),
            offset,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn draw(&mut self, _target: &ImageHandle, batch: DrawBatch) -> anyhow::Result<()> {
        // Rect data may still be sitting in this recording's upload ops;
        // overlay them on the buffer contents so the log reflects what the
        // submission would sample.
        let buffer = batch
            .rects
            .as_any()
            .downcast_ref::<SoftBuffer>()
            .context("foreign buffer")?;

        let mut staged = buffer.data.borrow().clone();
        for op in &self.ops {
            if let Op::Upload { dst, offset, bytes } = op {
                if Rc::ptr_eq(dst, batch.rects) && staged.len() >= offset + bytes.len() {
                    staged[*offset..offset + bytes.len()].copy_from_slice(bytes);
                }
            }
        }

        let stride = std::mem::size_of::<ShaderRect>();
        let mut records = Vec::with_capacity(batch.count as usize);
        for i in batch.first..batch.first + batch.count {
            let start = i as usize * stride;
            if staged.len() < start + stride {
                bail!("rect draw out of bounds");
            }

            let rect: ShaderRect =
                unsafe { std::ptr::read_unaligned(staged[start..].as_ptr() as *const ShaderRect) };

            let image = if rect.image == u32::MAX {
                None
            } else {
                let handle = batch
                    .images
                    .get(rect.image as usize)
                    .context("rect references missing image")?;
                Some(
                    handle
                        .as_any()
                        .downcast_ref::<SoftImage>()
                        .context("foreign image")?
                        .id,
                )
            };

            records.push(DrawRecord {
                image,
                dst: rect.dst,
                clip: rect.clip,
                color: rect.color,
                blend: batch.blend,
            });
        }

        self.ops.push(Op::Draw { records });
        Ok(())
    }

    fn protect(&mut self, object: Rc<dyn Any>) {
        self.protected.push(object);
    }

    fn submit(
        self: Box<Self>,
        waits: Vec<TimelinePoint>,
        signals: Vec<TimelinePoint>,
    ) -> anyhow::Result<TimelinePoint> {
        for wait in &waits {
            if !wait.poll()? {
                // A real device would defer execution; the soft device only
                // ever sees already-signalled waits.
                bail!("submission waits on an unsignalled point");
            }
        }

        let completion = TimelinePoint::new(Arc::new(SoftTimeline::new(0)), 1);
        let submission = PendingSubmission {
            ops: self.ops,
            protected: self.protected,
            signals,
            completion: completion.clone(),
        };

        if self.device.0.auto_complete.get() {
            self.device.execute(submission)?;
        } else {
            self.device.0.queued.borrow_mut().push(submission);
        }

        Ok(completion)
    }
}

pub struct SoftSwapchain {
    device: SoftDevice,
    size: UVec2,
    images: Vec<ImageHandle>,
    next: usize,
}

impl Swapchain for SoftSwapchain {
    fn resize(&mut self, size: UVec2) -> anyhow::Result<()> {
        if size != self.size {
            self.size = size;
            for image in &mut self.images {
                *image = self.device.alloc_image(size, DrmFourcc::Xrgb8888);
            }
        }

        Ok(())
    }

    fn acquire(&mut self) -> anyhow::Result<AcquiredImage> {
        let image = self.images[self.next].clone();
        self.next = (self.next + 1) % self.images.len();

        let acquire = TimelinePoint::new(Arc::new(SoftTimeline::new(1)), 1);
        Ok(AcquiredImage { image, acquire })
    }

    fn present(&mut self, waits: &[TimelinePoint]) -> anyhow::Result<()> {
        for wait in waits {
            if !wait.poll()? {
                bail!("present waits on an unsignalled point");
            }
        }

        Ok(())
    }
}

impl Device for SoftDevice {
    fn create_image(&self, desc: &ImageDesc) -> anyhow::Result<ImageHandle> {
        Ok(self.alloc_image(desc.size, desc.format))
    }

    fn update_image(&self, image: &ImageHandle, data: &[u8], stride: u32) -> anyhow::Result<()> {
        let image = image
            .as_any()
            .downcast_ref::<SoftImage>()
            .context("foreign image")?;

        let size = image.size();
        let bpp = super::fourcc_bpp(image.format()).unwrap_or(4);
        let row = size.x as usize * bpp;
        let mut pixels = image.pixels.borrow_mut();
        for y in 0..size.y as usize {
            let src = y * stride as usize;
            if data.len() < src + row {
                bail!("image update out of bounds");
            }
            pixels[y * row..(y + 1) * row].copy_from_slice(&data[src..src + row]);
        }

        Ok(())
    }

    fn import_dmabuf(&self, _import: &DmabufImport) -> anyhow::Result<ImageHandle> {
        bail!("software device cannot import dmabufs")
    }

    fn create_buffer(&self, len: usize) -> anyhow::Result<BufferHandle> {
        Ok(Rc::new(SoftBuffer {
            data: RefCell::new(vec![0; len]),
        }))
    }

    fn create_timeline(&self, initial: u64) -> anyhow::Result<TimelineHandle> {
        Ok(Arc::new(SoftTimeline::new(initial)))
    }

    fn import_syncobj(&self, _fd: OwnedFd) -> anyhow::Result<TimelineHandle> {
        bail!("software device cannot import syncobjs")
    }

    fn create_swapchain(&self, size: UVec2, images: u32) -> anyhow::Result<Box<dyn Swapchain>> {
        let images = (0..images.max(1))
            .map(|_| self.alloc_image(size, DrmFourcc::Xrgb8888))
            .collect();

        Ok(Box::new(SoftSwapchain {
            device: self.clone(),
            size,
            images,
            next: 0,
        }))
    }

    fn begin_commands(&self) -> anyhow::Result<Box<dyn Commands>> {
        Ok(Box::new(SoftCommands {
            device: self.clone(),
            ops: Vec::new(),
            protected: Vec::new(),
        }))
    }

    fn retire_completed(&self) -> anyhow::Result<()> {
        self.0
            .retained
            .borrow_mut()
            .retain(|(point, _)| !point.poll().unwrap_or(true));
        Ok(())
    }

    fn shm_formats(&self) -> Vec<DrmFourcc> {
        vec![DrmFourcc::Argb8888, DrmFourcc::Xrgb8888]
    }

    fn dmabuf_feedback(&self) -> Option<DmabufFeedback> {
        None
    }

    fn wait_idle(&self) {
        while self.complete_one().unwrap_or(false) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_signal_poll() {
        let timeline = SoftTimeline::new(0);
        assert!(!timeline.poll(1).unwrap());
        timeline.signal(3).unwrap();
        assert!(timeline.poll(1).unwrap());
        assert!(timeline.poll(3).unwrap());
        assert!(!timeline.poll(4).unwrap());
    }

    #[test]
    fn deferred_submission() {
        let device = SoftDevice::new();
        device.set_auto_complete(false);

        let target = device
            .create_image(&ImageDesc {
                size: UVec2::new(4, 4),
                format: DrmFourcc::Xrgb8888,
            })
            .unwrap();

        let mut commands = device.begin_commands().unwrap();
        commands.begin(&target, [0.0; 4]).unwrap();
        let completion = commands.submit(Vec::new(), Vec::new()).unwrap();

        assert!(!completion.poll().unwrap());
        assert_eq!(device.pending_submissions(), 1);

        assert!(device.complete_one().unwrap());
        assert!(completion.poll().unwrap());
    }
}
