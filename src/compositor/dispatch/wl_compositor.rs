use std::sync::{Arc, Mutex};

use tracing::warn;
use wayland_server::{
    protocol::{wl_callback, wl_compositor, wl_output, wl_region, wl_surface},
    Resource as _,
};

use crate::{
    compositor::{
        surface::{Committed, Surface, SurfaceKey},
        State,
    },
    geom::{Rect, Region},
};

impl wayland_server::GlobalDispatch<wl_compositor::WlCompositor, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_compositor::WlCompositor>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<wl_compositor::WlCompositor, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_compositor::WlCompositor,
        request: wl_compositor::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_compositor::Request::CreateSurface { id } => {
                state
                    .surfaces
                    .insert_with_key(|key| Surface::new(data_init.init(id, key), key));
            }
            wl_compositor::Request::CreateRegion { id } => {
                data_init.init(id, Arc::new(Mutex::new(Region::default())));
            }
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wl_surface::WlSurface, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_surface::WlSurface,
        request: wl_surface::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let key = *data;
        match request {
            wl_surface::Request::Attach { buffer, x, y } => {
                let surface = state.surfaces.get_mut(key).expect("surface has no entry");

                surface.pending.buffer = buffer
                    .as_ref()
                    .and_then(|buffer| buffer.data::<crate::compositor::buffers::BufferKey>())
                    .copied();
                surface.pending.committed.set(Committed::BUFFER);

                if x != 0 || y != 0 {
                    if resource.version() >= 5 {
                        resource.post_error(
                            wl_surface::Error::InvalidOffset,
                            "Non-zero attach offsets require wl_surface.offset.",
                        );
                        return;
                    }

                    surface.pending.delta = glam::IVec2::new(x, y);
                    surface.pending.committed.set(Committed::DELTA);
                }
            }
            wl_surface::Request::Frame { callback } => {
                let callback = data_init.init(callback, key);
                state
                    .surfaces
                    .get_mut(key)
                    .expect("surface has no entry")
                    .pending
                    .frame_callbacks
                    .push(callback);
            }
            wl_surface::Request::SetOpaqueRegion { region } => {
                let surface = state.surfaces.get_mut(key).expect("surface has no entry");
                surface.pending.opaque_region = region_contents(region.as_ref());
                surface.pending.committed.set(Committed::OPAQUE_REGION);
            }
            wl_surface::Request::SetInputRegion { region } => {
                let surface = state.surfaces.get_mut(key).expect("surface has no entry");
                surface.pending.input_region = region.as_ref().map(|r| region_contents(Some(r)));
                surface.pending.committed.set(Committed::INPUT_REGION);
            }
            wl_surface::Request::SetBufferScale { scale } => {
                if scale < 1 {
                    resource.post_error(wl_surface::Error::InvalidScale, "Scale must be >= 1.");
                    return;
                }

                let surface = state.surfaces.get_mut(key).expect("surface has no entry");
                surface.pending.buffer_scale = scale as f64;
                surface.pending.committed.set(Committed::BUFFER_SCALE);
            }
            wl_surface::Request::SetBufferTransform { transform } => {
                if !matches!(transform.into_result(), Ok(wl_output::Transform::Normal)) {
                    warn!(?transform, "ignoring non-normal buffer transform");
                }
            }
            wl_surface::Request::Offset { x, y } => {
                let surface = state.surfaces.get_mut(key).expect("surface has no entry");
                surface.pending.delta = glam::IVec2::new(x, y);
                surface.pending.committed.set(Committed::DELTA);
            }
            wl_surface::Request::Commit => {
                state.surface_commit(key);
            }
            // Damage tracking is not used; every frame redraws.
            wl_surface::Request::Damage { .. } => (),
            wl_surface::Request::DamageBuffer { .. } => (),
            wl_surface::Request::Destroy => {
                if let Some(surface) = state.surfaces.get(key) {
                    if surface.addons.any_live() {
                        // wl_surface error defunct_role_object.
                        resource.post_error(
                            4u32,
                            "Surface destroyed with live role or addon objects.",
                        );
                    }
                }
            }
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_surface::WlSurface,
        data: &SurfaceKey,
    ) {
        state.surface_destroyed(*data);
    }
}

fn region_contents(region: Option<&wl_region::WlRegion>) -> Region {
    region
        .and_then(|r| r.data::<Arc<Mutex<Region>>>())
        .map(|r| r.lock().unwrap().clone())
        .unwrap_or_default()
}

impl wayland_server::Dispatch<wl_region::WlRegion, Arc<Mutex<Region>>> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_region::WlRegion,
        request: wl_region::Request,
        data: &Arc<Mutex<Region>>,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_region::Request::Add {
                x,
                y,
                width,
                height,
            } => {
                data.lock().unwrap().add(Rect::from_xywh(x, y, width, height));
            }
            wl_region::Request::Subtract {
                x,
                y,
                width,
                height,
            } => {
                data.lock()
                    .unwrap()
                    .subtract(Rect::from_xywh(x, y, width, height));
            }
            wl_region::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wl_callback::WlCallback, SurfaceKey> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_callback::WlCallback,
        _request: wl_callback::Request,
        _data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}
