use std::time;

use glam::{DVec2, IVec2, UVec2};
use tracing::{debug, trace};
use wayland_server::protocol::wl_output;

use crate::{
    backend::OutputInfo,
    compositor::{surface::SurfaceKey, timer::TimerEvent, State},
    geom::FRect,
    gpu::Swapchain,
};

slotmap::new_key_type! { pub struct OutputKey; }

#[derive(Debug, Clone)]
pub struct OutputMode {
    pub size: IVec2,
    pub refresh_mhz: u32,
}

#[derive(Debug, Clone)]
pub struct OutputDesc {
    pub make: String,
    pub model: String,
    pub name: String,
    pub physical_size_mm: IVec2,
    pub subpixel: wl_output::Subpixel,
    pub transform: wl_output::Transform,
    pub scale: i32,
    pub mode: OutputMode,
}

/// An addressable presentation target: a swapchain plus its placement in
/// the global coordinate space and frame-pacing state.
pub struct Output {
    pub backend_id: u64,
    pub global: wayland_server::backend::GlobalId,
    pub resources: Vec<wl_output::WlOutput>,

    pub size: UVec2,
    pub layout_rect: FRect,
    pub desc: OutputDesc,

    pub swapchain: Box<dyn Swapchain>,

    pub frames_in_flight: u32,
    /// Set at each vsync boundary (always set in async mode).
    pub frame_available: bool,
    /// A frame was requested while ineligible; retried on the next
    /// completion or vsync.
    pub frame_requested: bool,

    pub last_commit_id: u64,
    pub last_frame_time: time::Instant,
    pub vsync: bool,
}

impl Output {
    pub fn refresh_interval(&self) -> time::Duration {
        let mhz = self.desc.mode.refresh_mhz.max(1);
        time::Duration::from_secs_f64(1000.0 / mhz as f64)
    }
}

/// Arranges outputs in the global space and answers position queries.
#[derive(Default)]
pub struct OutputLayout {
    pub order: Vec<OutputKey>,
    pub primary: Option<OutputKey>,
}

impl OutputLayout {
    /// Outputs sit side by side, left to right, tops aligned.
    pub fn arrange(&self, outputs: &mut slotmap::SlotMap<OutputKey, Output>) {
        let mut x = 0.0;
        for key in &self.order {
            if let Some(output) = outputs.get_mut(*key) {
                output.layout_rect =
                    FRect::from_pos_size(DVec2::new(x, 0.0), output.size.as_dvec2());
                x += output.layout_rect.size.x;
            }
        }
    }

    /// Clamps a global position into the layout, returning the owning
    /// output. Positions outside every output snap to the nearest one.
    pub fn clamp_position(
        &self,
        outputs: &slotmap::SlotMap<OutputKey, Output>,
        position: DVec2,
    ) -> (DVec2, Option<OutputKey>) {
        for key in &self.order {
            if let Some(output) = outputs.get(*key) {
                if output.layout_rect.contains(position) {
                    return (position, Some(*key));
                }
            }
        }

        let mut best: Option<(f64, DVec2, OutputKey)> = None;
        for key in &self.order {
            let Some(output) = outputs.get(*key) else {
                continue;
            };

            let rect = output.layout_rect;
            let clamped = position.clamp(rect.min(), rect.max() - DVec2::ONE);
            let dist = clamped.distance_squared(position);
            if best.map_or(true, |(d, _, _)| dist < d) {
                best = Some((dist, clamped, *key));
            }
        }

        match best {
            Some((_, clamped, key)) => (clamped, Some(key)),
            None => (position, None),
        }
    }
}

impl State {
    pub fn handle_output_added(&mut self, info: OutputInfo) -> anyhow::Result<()> {
        debug!(name = %info.name, ?info.size, "output added");

        let swapchain = self
            .device
            .create_swapchain(info.size, self.config.render.max_swapchain_images)?;

        let desc = OutputDesc {
            make: info.make.clone(),
            model: info.model.clone(),
            name: info.name.clone(),
            physical_size_mm: info.physical_size_mm,
            subpixel: wl_output::Subpixel::Unknown,
            transform: wl_output::Transform::Normal,
            scale: info.scale,
            mode: OutputMode {
                size: info.size.as_ivec2(),
                refresh_mhz: info.refresh_mhz,
            },
        };

        let vsync = self.config.render.vsync;
        let key = self.outputs.insert_with_key(|key| Output {
            backend_id: info.id,
            global: self
                .display
                .create_global::<State, wl_output::WlOutput, OutputKey>(4, key),
            resources: Vec::new(),
            size: info.size,
            layout_rect: FRect::default(),
            desc,
            swapchain,
            frames_in_flight: 0,
            frame_available: true,
            frame_requested: false,
            last_commit_id: 0,
            last_frame_time: time::Instant::now(),
            vsync,
        });

        self.layout.order.push(key);
        if self.layout.primary.is_none() {
            self.layout.primary = Some(key);
        }
        self.layout.arrange(&mut self.outputs);

        self.request_frame(key);
        Ok(())
    }

    pub fn handle_output_removed(&mut self, backend_id: u64) {
        let Some(key) = self
            .outputs
            .iter()
            .find(|(_, output)| output.backend_id == backend_id)
            .map(|(key, _)| key)
        else {
            return;
        };

        debug!(name = %self.outputs[key].desc.name, "output removed");

        let output = self.outputs.remove(key).unwrap();
        self.display.remove_global::<State>(output.global);

        self.layout.order.retain(|k| *k != key);
        if self.layout.primary == Some(key) {
            self.layout.primary = self.layout.order.first().copied();
        }
        self.layout.arrange(&mut self.outputs);
    }

    /// Sends the initial property burst on a freshly bound wl_output.
    pub fn describe_output(&self, key: OutputKey, wl_output: &wl_output::WlOutput) {
        use wayland_server::Resource as _;

        let Some(output) = self.outputs.get(key) else {
            return;
        };
        let desc = &output.desc;

        wl_output.geometry(
            output.layout_rect.pos.x as i32,
            output.layout_rect.pos.y as i32,
            desc.physical_size_mm.x,
            desc.physical_size_mm.y,
            desc.subpixel,
            desc.make.clone(),
            desc.model.clone(),
            desc.transform,
        );
        wl_output.mode(
            wl_output::Mode::Current | wl_output::Mode::Preferred,
            desc.mode.size.x,
            desc.mode.size.y,
            desc.mode.refresh_mhz as i32,
        );

        if wl_output.version() >= 2 {
            wl_output.scale(desc.scale);
        }
        if wl_output.version() >= 4 {
            wl_output.name(desc.name.clone());
            wl_output.description(format!("{} {}", desc.make, desc.model));
        }
        if wl_output.version() >= 2 {
            wl_output.done();
        }
    }

    /// Asks for a frame on every output; used after scene mutations.
    pub fn request_all_frames(&mut self) {
        let keys: Vec<OutputKey> = self.layout.order.clone();
        for key in keys {
            self.request_frame(key);
        }
    }

    /// Dispatches a frame if the output is eligible and under the
    /// in-flight cap; otherwise queues the request for the next completion
    /// or vsync boundary.
    pub fn request_frame(&mut self, key: OutputKey) {
        let Some(output) = self.outputs.get_mut(key) else {
            return;
        };

        let eligible = output.frame_available || !output.vsync;
        if !eligible || output.frames_in_flight >= self.config.render.max_frames_in_flight {
            output.frame_requested = true;
            return;
        }

        output.frame_requested = false;
        output.frame_available = !output.vsync;
        output.frames_in_flight += 1;
        output.last_commit_id += 1;
        output.last_frame_time = time::Instant::now();

        if let Err(err) = self.render_output(key) {
            // GPU submission failures are not recoverable; input and
            // clients ride on the same loop, so wind down.
            tracing::error!(?err, "render failed, shutting down");
            self.shutdown_requested = true;
            if let Some(output) = self.outputs.get_mut(key) {
                output.frames_in_flight = output.frames_in_flight.saturating_sub(1);
            }
            return;
        }

        // Vsync mode pairs the next frame with the vsync boundary; async
        // submits again as soon as a completion frees a slot.
        if self.outputs[key].vsync {
            let at = self.outputs[key].last_frame_time + self.outputs[key].refresh_interval();
            let timers = &mut self.timers;
            if let Err(err) = timers.schedule(&mut self.timer, at, TimerEvent::OutputVsync(key)) {
                tracing::error!(?err, "failed to arm frame timer");
            }
        }
    }

    /// A render submission for this output completed.
    pub fn frame_complete(&mut self, key: OutputKey) {
        let Some(output) = self.outputs.get_mut(key) else {
            return;
        };

        output.frames_in_flight = output.frames_in_flight.saturating_sub(1);
        trace!(name = %output.desc.name, in_flight = output.frames_in_flight, "frame complete");

        if output.frame_requested {
            self.request_frame(key);
        }
    }

    /// Vsync boundary reached: the output may take a new frame.
    pub fn output_vsync(&mut self, key: OutputKey) {
        let Some(output) = self.outputs.get_mut(key) else {
            return;
        };

        output.frame_available = true;
        if output.frame_requested {
            self.request_frame(key);
        }
    }

    /// The output whose area contains the surface's frame centroid.
    pub fn primary_output_for_surface(&self, key: SurfaceKey) -> Option<OutputKey> {
        let frame = self.surface_frame(key);
        let (_, output) = self.layout.clamp_position(&self.outputs, frame.center());
        output
    }

    /// Emits pending frame callbacks for surfaces whose primary output was
    /// just presented, in commit order.
    pub fn dispatch_frame_callbacks(&mut self, output: OutputKey) {
        let now = self.timestamp();

        let targets: Vec<SurfaceKey> = self
            .surfaces
            .iter()
            .filter(|(_, surface)| surface.mapped || surface.role.is_some())
            .map(|(key, _)| key)
            .collect();

        for key in targets {
            if self.primary_output_for_surface(key) != Some(output) {
                continue;
            }

            let surface = &mut self.surfaces[key];
            for callback in surface.current.frame_callbacks.drain(..) {
                callback.done(now);
            }
        }
    }
}
