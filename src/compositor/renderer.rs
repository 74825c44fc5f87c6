use std::{cell::RefCell, rc::Rc};

use glam::{DVec2, IVec2, Vec4};
use tracing::trace;

use crate::{
    compositor::{
        buffers::BufferKey,
        cursor::CursorRender,
        output::OutputKey,
        surface::{Role, SurfaceKey},
        State,
    },
    geom::{FRect, Rect},
    gpu::{self, BlendMode, BufferHandle, DrawBatch, ImageHandle, ShaderRect},
};

const FOCUS_BORDER_WIDTH: f64 = 2.0;
const FOCUS_BORDER_ACTIVE: Vec4 = Vec4::new(0.4, 0.4, 1.0, 1.0);
const FOCUS_BORDER_INACTIVE: Vec4 = Vec4::new(0.3, 0.3, 0.3, 1.0);

/// One textured (or solid) rectangle in global coordinates, before the
/// translation into output pixels.
struct DrawItem {
    image: Option<ImageHandle>,
    src: FRect,
    dst: FRect,
    color: Vec4,
    blend: BlendMode,
}

/// Per-frame GPU-side rect storage, recycled through a pool and grown
/// geometrically.
pub struct FrameData {
    rects: Option<BufferHandle>,
    capacity: usize,
}

struct RetiredFrame {
    output: OutputKey,
    frame: FrameData,
}

/// Rides along with a submission's protection list; dropping it (when the
/// device retires the submission) returns the frame data to the pool and
/// unblocks the output.
struct FrameGuard {
    output: OutputKey,
    frame: Option<FrameData>,
    retired: Rc<RefCell<Vec<RetiredFrame>>>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.retired.borrow_mut().push(RetiredFrame {
                output: self.output,
                frame,
            });
        }
    }
}

/// External overlay (the debug GUI) drawing between the scene and the
/// drag icon. It records its own draw calls onto the frame's command
/// stream.
pub type OverlayHook = Box<dyn FnMut(&mut dyn gpu::Commands, &ImageHandle)>;

pub struct Renderer {
    pub background: Option<ImageHandle>,
    pub separate_draws: bool,
    pub overlay: Option<OverlayHook>,

    available_frames: Vec<FrameData>,
    retired: Rc<RefCell<Vec<RetiredFrame>>>,
}

impl Renderer {
    pub fn new(separate_draws: bool) -> Self {
        Self {
            background: None,
            separate_draws,
            overlay: None,
            available_frames: Vec::new(),
            retired: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Loads the configured wallpaper into a texture.
    pub fn load_background(
        &mut self,
        device: &gpu::DeviceHandle,
        path: &std::path::Path,
    ) -> anyhow::Result<()> {
        let image = image::open(path)?.into_rgba8();
        let (width, height) = image.dimensions();

        let handle = device.create_image(&gpu::ImageDesc {
            size: glam::UVec2::new(width, height),
            format: drm_fourcc::DrmFourcc::Abgr8888,
        })?;
        device.update_image(&handle, image.as_raw(), width * 4)?;

        self.background = Some(handle);
        Ok(())
    }
}

/// Translates a global-space rect into output pixels.
fn output_pixel_rect(dst: FRect, layout: FRect, output_size: DVec2) -> FRect {
    if layout.is_empty() {
        return FRect::default();
    }

    let scale = output_size / layout.size;
    FRect {
        pos: (dst.pos - layout.pos) * scale,
        size: dst.size * scale,
    }
}

fn to_array(rect: FRect) -> [f32; 4] {
    [
        rect.pos.x as f32,
        rect.pos.y as f32,
        rect.size.x as f32,
        rect.size.y as f32,
    ]
}

impl State {
    /// Renders one frame for an output: builds the global draw list, walks
    /// it into rect batches bucketed by blend mode, submits, and presents.
    pub fn render_output(&mut self, key: OutputKey) -> anyhow::Result<()> {
        let (target, acquire) = {
            let output = self
                .outputs
                .get_mut(key)
                .ok_or_else(|| anyhow::anyhow!("render on dead output"))?;
            output.swapchain.resize(output.size)?;
            let acquired = output.swapchain.acquire()?;
            (acquired.image, acquired.acquire)
        };

        let (items, sampled) = self.build_draw_list(key);

        let (layout_rect, output_size) = {
            let output = &self.outputs[key];
            (output.layout_rect, output.size.as_dvec2())
        };
        let framebuffer = Rect::from_pos_size(
            IVec2::ZERO,
            IVec2::new(output_size.x as i32, output_size.y as i32),
        );

        // Serialize the list, interning image handles per frame.
        let mut rects = Vec::with_capacity(items.len());
        let mut images: Vec<ImageHandle> = Vec::new();
        let mut blends = Vec::with_capacity(items.len());

        for item in &items {
            let px = output_pixel_rect(item.dst, layout_rect, output_size);

            // Degenerate clips drop the draw entirely.
            let clip = Rect::from_min_max(px.pos.floor().as_ivec2(), px.max().ceil().as_ivec2())
                .intersect(framebuffer);
            if clip.is_empty() {
                continue;
            }

            let image_index = match &item.image {
                Some(handle) => {
                    match images.iter().position(|i| Rc::ptr_eq(i, handle)) {
                        Some(index) => index as u32,
                        None => {
                            images.push(handle.clone());
                            images.len() as u32 - 1
                        }
                    }
                }
                None => u32::MAX,
            };

            rects.push(ShaderRect {
                src: to_array(item.src),
                dst: to_array(px),
                clip: to_array(clip.as_frect()),
                color: item.color.to_array(),
                image: image_index,
                _pad: [0; 3],
            });
            blends.push(item.blend);
        }

        // Acquire per-frame rect storage, growing geometrically.
        let mut frame = self.renderer.available_frames.pop().unwrap_or(FrameData {
            rects: None,
            capacity: 0,
        });

        let needed = rects.len().max(1);
        if frame.capacity < needed || frame.rects.is_none() {
            let new_capacity = needed.next_power_of_two().max(64);
            trace!(new_capacity, "growing frame rect buffer");
            frame.rects = Some(
                self.device
                    .create_buffer(new_capacity * std::mem::size_of::<ShaderRect>())?,
            );
            frame.capacity = new_capacity;
        }

        let rects_buffer = frame.rects.clone().unwrap();

        let mut commands = self.device.begin_commands()?;
        commands.begin(&target, [0.0, 0.0, 0.0, 1.0])?;
        commands.upload(&rects_buffer, 0, gpu::bytes_of_rects(&rects))?;

        // One batch per run of identical blend mode (or per rect with
        // --separate-draws), one pipeline bind each.
        let mut start = 0usize;
        while start < rects.len() {
            let blend = blends[start];
            let mut end = start + 1;
            if !self.renderer.separate_draws {
                while end < rects.len() && blends[end] == blend {
                    end += 1;
                }
            }

            commands.draw(
                &target,
                DrawBatch {
                    rects: &rects_buffer,
                    first: start as u32,
                    count: (end - start) as u32,
                    blend,
                    images: &images,
                    scissor: framebuffer,
                },
            )?;

            start = end;
        }

        if let Some(overlay) = self.renderer.overlay.as_mut() {
            overlay(commands.as_mut(), &target);
        }

        // Everything the submission touches stays alive until the GPU is
        // done: images, the rect buffer, and the frame guard that returns
        // the buffer to the pool and re-arms the output.
        for image in &images {
            commands.protect(Rc::new(image.clone()));
        }
        commands.protect(Rc::new(rects_buffer.clone()));
        commands.protect(Rc::new(FrameGuard {
            output: key,
            frame: Some(frame),
            retired: self.renderer.retired.clone(),
        }));

        let completion = commands.submit(vec![acquire], Vec::new())?;

        {
            let output = self.outputs.get_mut(key).unwrap();
            output.swapchain.present(&[completion.clone()])?;
        }

        // Client buffers sampled this frame are released only after the
        // submission completes.
        for buffer_key in sampled {
            if let Some(buffer) = self.buffers.get_mut(buffer_key) {
                buffer.release_wait = Some(completion.clone());
            }
        }

        self.dispatch_frame_callbacks(key);

        Ok(())
    }

    /// Drains retired frame guards; runs in the idle pass.
    pub fn reap_finished_frames(&mut self) {
        let retired: Vec<RetiredFrame> =
            std::mem::take(&mut *self.renderer.retired.borrow_mut());

        for RetiredFrame { output, frame } in retired {
            self.renderer.available_frames.push(frame);
            self.frame_complete(output);
        }
    }

    /// The draw list, in order: background, surface trees bottom-to-top
    /// (with backstops below and focus borders above toplevels), drag
    /// icon, cursor.
    fn build_draw_list(&mut self, key: OutputKey) -> (Vec<DrawItem>, Vec<BufferKey>) {
        let mut items = Vec::new();
        let mut sampled = Vec::new();

        let Some(output) = self.outputs.get(key) else {
            return (items, sampled);
        };
        let layout_rect = output.layout_rect;

        if let Some(background) = &self.renderer.background {
            let src = FRect::fit(background.size().as_dvec2(), layout_rect.size);
            items.push(DrawItem {
                image: Some(background.clone()),
                src,
                dst: layout_rect,
                color: Vec4::ONE,
                blend: BlendMode::None,
            });
        }

        let keyboard_focus_root = self
            .seat
            .keyboard
            .focus
            .map(|focus| self.subsurface_root(focus));

        for root in self.surfaces_z.clone() {
            let Some(surface) = self.surfaces.get(root) else {
                continue;
            };
            if !surface.mapped {
                continue;
            }

            let is_toplevel = surface.addons.toplevel.is_some();
            let fullscreen = surface
                .addons
                .toplevel
                .as_ref()
                .is_some_and(|t| t.fullscreen_output.is_some());

            let toplevel_rect = if is_toplevel {
                let rect = crate::compositor::xdg::toplevel_layout_rect(self, root);

                // Backstop under the whole window.
                items.push(DrawItem {
                    image: None,
                    src: FRect::default(),
                    dst: rect,
                    color: Vec4::new(0.0, 0.0, 0.0, 1.0),
                    blend: BlendMode::None,
                });

                Some(rect)
            } else {
                None
            };

            let (pos, scale) = self.surface_coord_space(root);
            self.draw_surface_tree(root, pos, scale, &mut items, &mut sampled);

            if let Some(rect) = toplevel_rect {
                if !fullscreen {
                    let color = if keyboard_focus_root == Some(root) {
                        FOCUS_BORDER_ACTIVE
                    } else {
                        FOCUS_BORDER_INACTIVE
                    };

                    for edge in border_rects(rect, FOCUS_BORDER_WIDTH) {
                        items.push(DrawItem {
                            image: None,
                            src: FRect::default(),
                            dst: edge,
                            color,
                            blend: BlendMode::Premultiplied,
                        });
                    }
                }
            }
        }

        // Drag icon tracks the pointer.
        if let Some(icon) = self.data.drag.icon {
            if self.surfaces.get(icon).is_some_and(|s| s.current.buffer.is_some()) {
                let pointer = self.seat.pointer.position;
                self.draw_surface_tree(icon, pointer, DVec2::ONE, &mut items, &mut sampled);
            }
        }

        // Cursor, topmost.
        match self.current_cursor() {
            CursorRender::Surface(cursor) => {
                let hotspot = self
                    .surfaces
                    .get(cursor)
                    .and_then(|s| s.addons.cursor.as_ref())
                    .map(|c| c.hotspot.as_dvec2())
                    .unwrap_or_default();

                let pointer = self.seat.pointer.position;
                self.draw_surface_tree(
                    cursor,
                    pointer - hotspot,
                    DVec2::ONE,
                    &mut items,
                    &mut sampled,
                );
            }
            CursorRender::Texture { image, hotspot } => {
                let pointer = self.seat.pointer.position;
                let size = image.size().as_dvec2();
                items.push(DrawItem {
                    image: Some(image),
                    src: FRect::from_pos_size(DVec2::ZERO, size),
                    dst: FRect::from_pos_size(pointer - hotspot.as_dvec2(), size),
                    color: Vec4::ONE,
                    blend: BlendMode::Premultiplied,
                });
            }
            CursorRender::Hidden => (),
        }

        (items, sampled)
    }

    /// Walks a surface's stack in z-order: the surface itself where its
    /// own entry sits, subsurfaces recursively at their stored positions.
    /// Stale entries are skipped.
    fn draw_surface_tree(
        &self,
        key: SurfaceKey,
        pos: DVec2,
        scale: DVec2,
        items: &mut Vec<DrawItem>,
        sampled: &mut Vec<BufferKey>,
    ) {
        let Some(surface) = self.surfaces.get(key) else {
            return;
        };

        let Some(buffer_key) = surface.current.buffer else {
            return;
        };

        for entry in &surface.current.stack {
            if entry.surface == key {
                let Some(buffer) = self.buffers.get(buffer_key) else {
                    continue;
                };
                let Some(image) = buffer.image.clone() else {
                    continue;
                };

                let dst = FRect {
                    pos: pos + surface.buffer_dst.pos.as_dvec2() * scale,
                    size: surface.buffer_dst.size.as_dvec2() * scale,
                };

                let blend = match &buffer.backing {
                    _ if gpu::fourcc_has_alpha(image.format()) => BlendMode::Premultiplied,
                    _ => BlendMode::None,
                };

                sampled.push(buffer_key);
                items.push(DrawItem {
                    image: Some(image),
                    src: surface.buffer_src,
                    dst,
                    color: Vec4::ONE,
                    blend,
                });
            } else if let Some(child) = self.surfaces.get(entry.surface) {
                if child.addons.subsurface.is_some() {
                    self.draw_surface_tree(
                        entry.surface,
                        pos + entry.position.as_dvec2() * scale,
                        scale,
                        items,
                        sampled,
                    );
                }
            }
        }
    }
}

fn border_rects(rect: FRect, width: f64) -> [FRect; 4] {
    let min = rect.min();
    let max = rect.max();
    [
        // Left, right, top, bottom.
        FRect::from_min_max(
            DVec2::new(min.x - width, min.y - width),
            DVec2::new(min.x, max.y + width),
        ),
        FRect::from_min_max(
            DVec2::new(max.x, min.y - width),
            DVec2::new(max.x + width, max.y + width),
        ),
        FRect::from_min_max(DVec2::new(min.x, min.y - width), DVec2::new(max.x, min.y)),
        FRect::from_min_max(DVec2::new(min.x, max.y), DVec2::new(max.x, max.y + width)),
    ]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn pixel_mapping_scales_into_output() {
        // A 200-wide output showing a 100-wide layout slice doubles
        // everything.
        let layout = FRect::from_xywh(100.0, 0.0, 100.0, 50.0);
        let px = output_pixel_rect(
            FRect::from_xywh(110.0, 10.0, 20.0, 20.0),
            layout,
            DVec2::new(200.0, 100.0),
        );

        assert_eq!(px, FRect::from_xywh(20.0, 20.0, 40.0, 40.0));
    }

    #[test]
    fn border_surrounds_rect() {
        let rects = border_rects(FRect::from_xywh(10.0, 10.0, 100.0, 50.0), 2.0);

        assert_eq!(rects[0], FRect::from_xywh(8.0, 8.0, 2.0, 54.0));
        assert_eq!(rects[1], FRect::from_xywh(110.0, 8.0, 2.0, 54.0));
        assert_eq!(rects[2], FRect::from_xywh(10.0, 8.0, 100.0, 2.0));
        assert_eq!(rects[3], FRect::from_xywh(10.0, 60.0, 100.0, 2.0));
    }
}
