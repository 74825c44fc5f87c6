use std::sync::{Arc, Mutex};

use wayland_protocols::wp::pointer_constraints::zv1::server::{
    zwp_confined_pointer_v1, zwp_locked_pointer_v1, zwp_pointer_constraints_v1,
};
use wayland_server::{protocol::wl_region, Resource as _};

use crate::{
    compositor::{
        constraints::{
            ConstraintAddon, ConstraintKind, ConstraintLifetime, ConstraintResource, ConstraintState,
        },
        queue::StateQueue,
        surface::SurfaceKey,
        State,
    },
    geom::Region,
};

fn lifetime_from(
    lifetime: wayland_server::WEnum<zwp_pointer_constraints_v1::Lifetime>,
) -> ConstraintLifetime {
    match lifetime.into_result() {
        Ok(zwp_pointer_constraints_v1::Lifetime::Persistent) => ConstraintLifetime::Persistent,
        _ => ConstraintLifetime::Oneshot,
    }
}

fn region_from(region: Option<&wl_region::WlRegion>) -> Option<Region> {
    region
        .and_then(|r| r.data::<Arc<Mutex<Region>>>())
        .map(|r| r.lock().unwrap().clone())
}

impl wayland_server::GlobalDispatch<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1, ()>
    for State
{
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &zwp_pointer_constraints_v1::ZwpPointerConstraintsV1,
        request: zwp_pointer_constraints_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zwp_pointer_constraints_v1::Request::LockPointer {
                id,
                surface,
                pointer: _,
                region,
                lifetime,
            } => {
                let key = *surface.data::<SurfaceKey>().expect("surface has no key");

                let Some(surf) = state.surfaces.get_mut(key) else {
                    return;
                };
                if surf.addons.constraint.is_some() {
                    resource.post_error(
                        zwp_pointer_constraints_v1::Error::AlreadyConstrained,
                        "Surface already has a pointer constraint.",
                    );
                    return;
                }

                let locked = data_init.init(id, key);

                let mut queue = StateQueue::<ConstraintState>::default();
                queue.touch().region = region_from(region.as_ref());

                surf.addons.constraint = Some(ConstraintAddon {
                    resource: ConstraintResource::Locked(locked),
                    kind: ConstraintKind::Locked,
                    lifetime: lifetime_from(lifetime),
                    state: queue,
                    active: false,
                    spent: false,
                });
            }
            zwp_pointer_constraints_v1::Request::ConfinePointer {
                id,
                surface,
                pointer: _,
                region,
                lifetime,
            } => {
                let key = *surface.data::<SurfaceKey>().expect("surface has no key");

                let Some(surf) = state.surfaces.get_mut(key) else {
                    return;
                };
                if surf.addons.constraint.is_some() {
                    resource.post_error(
                        zwp_pointer_constraints_v1::Error::AlreadyConstrained,
                        "Surface already has a pointer constraint.",
                    );
                    return;
                }

                let confined = data_init.init(id, key);

                let mut queue = StateQueue::<ConstraintState>::default();
                queue.touch().region = region_from(region.as_ref());

                surf.addons.constraint = Some(ConstraintAddon {
                    resource: ConstraintResource::Confined(confined),
                    kind: ConstraintKind::Confined,
                    lifetime: lifetime_from(lifetime),
                    state: queue,
                    active: false,
                    spent: false,
                });
            }
            zwp_pointer_constraints_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<zwp_locked_pointer_v1::ZwpLockedPointerV1, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_locked_pointer_v1::ZwpLockedPointerV1,
        request: zwp_locked_pointer_v1::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let Some(constraint) = state
            .surfaces
            .get_mut(*data)
            .and_then(|s| s.addons.constraint.as_mut())
        else {
            return;
        };

        match request {
            zwp_locked_pointer_v1::Request::SetCursorPositionHint {
                surface_x,
                surface_y,
            } => {
                constraint.state.touch().position_hint =
                    Some(glam::DVec2::new(surface_x, surface_y));
            }
            zwp_locked_pointer_v1::Request::SetRegion { region } => {
                constraint.state.touch().region = region_from(region.as_ref());
            }
            zwp_locked_pointer_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &zwp_locked_pointer_v1::ZwpLockedPointerV1,
        data: &SurfaceKey,
    ) {
        if let Some(surface) = state.surfaces.get_mut(*data) {
            surface.addons.constraint = None;
        }
    }
}

impl wayland_server::Dispatch<zwp_confined_pointer_v1::ZwpConfinedPointerV1, SurfaceKey>
    for State
{
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_confined_pointer_v1::ZwpConfinedPointerV1,
        request: zwp_confined_pointer_v1::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let Some(constraint) = state
            .surfaces
            .get_mut(*data)
            .and_then(|s| s.addons.constraint.as_mut())
        else {
            return;
        };

        match request {
            zwp_confined_pointer_v1::Request::SetRegion { region } => {
                constraint.state.touch().region = region_from(region.as_ref());
            }
            zwp_confined_pointer_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &zwp_confined_pointer_v1::ZwpConfinedPointerV1,
        data: &SurfaceKey,
    ) {
        if let Some(surface) = state.surfaces.get_mut(*data) {
            surface.addons.constraint = None;
        }
    }
}
