use wayland_protocols::wp::viewporter::server::{wp_viewport, wp_viewporter};
use wayland_server::Resource as _;

use crate::{
    compositor::{surface::SurfaceKey, viewport::ViewportAddon, State},
    geom::FRect,
};

impl wayland_server::GlobalDispatch<wp_viewporter::WpViewporter, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wp_viewporter::WpViewporter>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<wp_viewporter::WpViewporter, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wp_viewporter::WpViewporter,
        request: wp_viewporter::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wp_viewporter::Request::GetViewport { id, surface } => {
                let key = *surface.data::<SurfaceKey>().expect("surface has no key");

                let Some(surf) = state.surfaces.get_mut(key) else {
                    return;
                };
                if surf.addons.viewport.is_some() {
                    resource.post_error(
                        wp_viewporter::Error::ViewportExists,
                        "Surface already has a viewport.",
                    );
                    return;
                }

                let wp_viewport = data_init.init(id, key);
                surf.addons.viewport = Some(ViewportAddon::new(wp_viewport));
            }
            wp_viewporter::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wp_viewport::WpViewport, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wp_viewport::WpViewport,
        request: wp_viewport::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let Some(viewport) = state
            .surfaces
            .get_mut(*data)
            .and_then(|s| s.addons.viewport.as_mut())
        else {
            return;
        };

        match request {
            wp_viewport::Request::SetSource {
                x,
                y,
                width,
                height,
            } => {
                if x == -1.0 && y == -1.0 && width == -1.0 && height == -1.0 {
                    viewport.set_source(None);
                } else if x < 0.0 || y < 0.0 || width <= 0.0 || height <= 0.0 {
                    resource.post_error(
                        wp_viewport::Error::BadValue,
                        "Source rectangle must be non-negative with positive size.",
                    );
                } else {
                    viewport.set_source(Some(FRect::from_xywh(x, y, width, height)));
                }
            }
            wp_viewport::Request::SetDestination { width, height } => {
                if width == -1 && height == -1 {
                    viewport.set_destination(None);
                } else if width <= 0 || height <= 0 {
                    resource.post_error(
                        wp_viewport::Error::BadValue,
                        "Destination size must be positive.",
                    );
                } else {
                    viewport.set_destination(Some(glam::IVec2::new(width, height)));
                }
            }
            wp_viewport::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wp_viewport::WpViewport,
        data: &SurfaceKey,
    ) {
        if let Some(surface) = state.surfaces.get_mut(*data) {
            surface.addons.viewport = None;
        }
    }
}
