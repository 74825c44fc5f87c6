use wayland_server::{
    protocol::{wl_subcompositor, wl_subsurface},
    Resource as _,
};

use crate::compositor::{
    subsurface::SubsurfaceAddon,
    surface::{Role, SurfaceKey},
    State,
};

impl wayland_server::GlobalDispatch<wl_subcompositor::WlSubcompositor, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_subcompositor::WlSubcompositor>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<wl_subcompositor::WlSubcompositor, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_subcompositor::WlSubcompositor,
        request: wl_subcompositor::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_subcompositor::Request::GetSubsurface {
                id,
                surface,
                parent,
            } => {
                let key = *surface.data::<SurfaceKey>().expect("surface has no key");
                let parent_key = *parent.data::<SurfaceKey>().expect("surface has no key");

                if key == parent_key {
                    resource.post_error(
                        wl_subcompositor::Error::BadParent,
                        "Cannot make a surface its own parent.",
                    );
                    return;
                }

                // The parent chain must not loop back through this surface.
                let mut ancestor = Some(parent_key);
                while let Some(current) = ancestor {
                    if current == key {
                        resource.post_error(
                            wl_subcompositor::Error::BadParent,
                            "Parent is a descendant of the surface.",
                        );
                        return;
                    }
                    ancestor = state
                        .surfaces
                        .get(current)
                        .and_then(|s| s.addons.subsurface.as_ref())
                        .map(|ss| ss.parent);
                }

                {
                    let Some(surf) = state.surfaces.get(key) else {
                        return;
                    };
                    if surf.role.is_some() {
                        resource.post_error(
                            wl_subcompositor::Error::BadSurface,
                            "Surface already has a role.",
                        );
                        return;
                    }
                }

                let wl_subsurface = data_init.init(id, key);

                let surf = state.surfaces.get_mut(key).expect("surface has no entry");
                surf.role = Some(Role::Subsurface);
                surf.addons.subsurface = Some(SubsurfaceAddon {
                    resource: wl_subsurface,
                    parent: parent_key,
                    // Subsurfaces start out synchronized.
                    synchronized: true,
                });

                state.subsurface_created(key, parent_key);
            }
            wl_subcompositor::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wl_subsurface::WlSubsurface, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_subsurface::WlSubsurface,
        request: wl_subsurface::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let key = *data;
        match request {
            wl_subsurface::Request::SetPosition { x, y } => {
                state.subsurface_set_position(key, glam::IVec2::new(x, y));
            }
            wl_subsurface::Request::PlaceAbove { sibling } => {
                let sibling = *sibling.data::<SurfaceKey>().expect("surface has no key");
                if let Err(reason) = state.subsurface_place(key, sibling, true) {
                    // A missing sibling is tolerated; the restack is
                    // dropped.
                    tracing::warn!(%reason, "ignoring place_above");
                }
            }
            wl_subsurface::Request::PlaceBelow { sibling } => {
                let sibling = *sibling.data::<SurfaceKey>().expect("surface has no key");
                if let Err(reason) = state.subsurface_place(key, sibling, false) {
                    tracing::warn!(%reason, "ignoring place_below");
                }
            }
            wl_subsurface::Request::SetSync => {
                state.subsurface_set_sync(key, true);
            }
            wl_subsurface::Request::SetDesync => {
                state.subsurface_set_sync(key, false);
            }
            wl_subsurface::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_subsurface::WlSubsurface,
        data: &SurfaceKey,
    ) {
        let key = *data;
        let parent = state
            .surfaces
            .get_mut(key)
            .and_then(|surface| surface.addons.subsurface.take())
            .map(|addon| addon.parent);

        // The subsurface leaves its parent's stack immediately.
        if let Some(parent) = parent.and_then(|p| state.surfaces.get_mut(p).map(|_| p)) {
            let parent_surface = &mut state.surfaces[parent];
            parent_surface.pending_stack.retain(|entry| entry.surface != key);
            parent_surface.stack_dirty = true;
        }
    }
}
