use std::sync::{Arc, Mutex};

use tracing::warn;
use wayland_protocols::xdg::shell::server::{
    xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base,
};
use wayland_server::Resource as _;

use crate::{
    compositor::{
        surface::{Role, SurfaceKey},
        xdg::{PopupAddon, PositionerRules, ToplevelAddon, XdgSurfaceAddon},
        State,
    },
    geom::Rect,
};

impl wayland_server::GlobalDispatch<xdg_wm_base::XdgWmBase, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<xdg_wm_base::XdgWmBase>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<xdg_wm_base::XdgWmBase, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &xdg_wm_base::XdgWmBase,
        request: xdg_wm_base::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            xdg_wm_base::Request::CreatePositioner { id } => {
                data_init.init(id, Arc::new(Mutex::new(PositionerRules::default())));
            }
            xdg_wm_base::Request::GetXdgSurface { id, surface } => {
                let key = *surface.data::<SurfaceKey>().expect("surface has no key");

                let Some(surf) = state.surfaces.get(key) else {
                    return;
                };
                if surf.addons.xdg.is_some() {
                    resource.post_error(
                        xdg_wm_base::Error::Role,
                        "Surface already has an xdg_surface.",
                    );
                    return;
                }

                let xdg_surface = data_init.init(id, key);
                state.surfaces[key].addons.xdg = Some(XdgSurfaceAddon::new(xdg_surface));
            }
            xdg_wm_base::Request::Pong { .. } => (),
            xdg_wm_base::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<xdg_positioner::XdgPositioner, Arc<Mutex<PositionerRules>>>
    for State
{
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        resource: &xdg_positioner::XdgPositioner,
        request: xdg_positioner::Request,
        data: &Arc<Mutex<PositionerRules>>,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let mut rules = data.lock().unwrap();
        match request {
            xdg_positioner::Request::SetSize { width, height } => {
                if width <= 0 || height <= 0 {
                    resource.post_error(
                        xdg_positioner::Error::InvalidInput,
                        "Size must be positive.",
                    );
                    return;
                }
                rules.size = glam::IVec2::new(width, height);
            }
            xdg_positioner::Request::SetAnchorRect {
                x,
                y,
                width,
                height,
            } => {
                if width < 0 || height < 0 {
                    resource.post_error(
                        xdg_positioner::Error::InvalidInput,
                        "Anchor rect size must be non-negative.",
                    );
                    return;
                }
                rules.anchor_rect = Rect::from_xywh(x, y, width, height);
            }
            xdg_positioner::Request::SetAnchor { anchor } => {
                if let Ok(anchor) = anchor.into_result() {
                    rules.anchor = anchor;
                }
            }
            xdg_positioner::Request::SetGravity { gravity } => {
                if let Ok(gravity) = gravity.into_result() {
                    rules.gravity = gravity;
                }
            }
            xdg_positioner::Request::SetConstraintAdjustment {
                constraint_adjustment,
            } => {
                if let Ok(adjustment) = constraint_adjustment.into_result() {
                    rules.adjustment = adjustment;
                }
            }
            xdg_positioner::Request::SetOffset { x, y } => {
                rules.offset = glam::IVec2::new(x, y);
            }
            xdg_positioner::Request::SetReactive => {
                rules.reactive = true;
            }
            xdg_positioner::Request::SetParentSize {
                parent_width,
                parent_height,
            } => {
                rules.parent_size = glam::IVec2::new(parent_width, parent_height);
            }
            xdg_positioner::Request::SetParentConfigure { serial } => {
                rules.parent_configure = serial;
            }
            xdg_positioner::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<xdg_surface::XdgSurface, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &xdg_surface::XdgSurface,
        request: xdg_surface::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let key = *data;
        match request {
            xdg_surface::Request::GetToplevel { id } => {
                let Some(surf) = state.surfaces.get(key) else {
                    return;
                };
                if surf.role.is_some() {
                    resource.post_error(
                        xdg_surface::Error::AlreadyConstructed,
                        "Surface already has a role.",
                    );
                    return;
                }

                let xdg_toplevel = data_init.init(id, key);

                let surf = &mut state.surfaces[key];
                surf.role = Some(Role::XdgToplevel);
                surf.addons.toplevel = Some(ToplevelAddon::new(xdg_toplevel));
            }
            xdg_surface::Request::GetPopup {
                id,
                parent,
                positioner,
            } => {
                let Some(surf) = state.surfaces.get(key) else {
                    return;
                };
                if surf.role.is_some() {
                    resource.post_error(
                        xdg_surface::Error::AlreadyConstructed,
                        "Surface already has a role.",
                    );
                    return;
                }

                let rules = positioner
                    .data::<Arc<Mutex<PositionerRules>>>()
                    .map(|rules| rules.lock().unwrap().clone())
                    .unwrap_or_default();

                if rules.size.x <= 0 || rules.size.y <= 0 || rules.anchor_rect.size.x < 0 {
                    resource.post_error(
                        xdg_wm_base::Error::InvalidPositioner,
                        "Positioner is incomplete.",
                    );
                    return;
                }

                let xdg_popup = data_init.init(id, key);
                let mut addon = PopupAddon::new(xdg_popup, rules);

                // The root toplevel is found by walking parent popups.
                if let Some(parent_key) =
                    parent.as_ref().and_then(|p| p.data::<SurfaceKey>()).copied()
                {
                    addon.parent = Some(parent_key);
                    addon.root_toplevel = state.surfaces.get(parent_key).and_then(|parent| {
                        if parent.addons.toplevel.is_some() {
                            Some(parent_key)
                        } else {
                            parent
                                .addons
                                .popup
                                .as_ref()
                                .and_then(|popup| popup.root_toplevel)
                        }
                    });
                }

                let surf = &mut state.surfaces[key];
                surf.role = Some(Role::XdgPopup);
                surf.addons.popup = Some(addon);
            }
            xdg_surface::Request::SetWindowGeometry {
                x,
                y,
                width,
                height,
            } => {
                if width <= 0 || height <= 0 {
                    // Matches the reference behavior: treated as if the
                    // geometry had never been set.
                    warn!(width, height, "ignoring zero-sized window geometry");
                    return;
                }

                if let Some(xdg) = state
                    .surfaces
                    .get_mut(key)
                    .and_then(|s| s.addons.xdg.as_mut())
                {
                    xdg.state.touch().geometry = Some(Rect::from_xywh(x, y, width, height));
                }
            }
            xdg_surface::Request::AckConfigure { serial } => {
                if let Some(xdg) = state
                    .surfaces
                    .get_mut(key)
                    .and_then(|s| s.addons.xdg.as_mut())
                {
                    xdg.state.touch().acked_serial = serial;
                }
            }
            xdg_surface::Request::Destroy => {
                if let Some(surf) = state.surfaces.get(key) {
                    if surf.addons.toplevel.is_some() || surf.addons.popup.is_some() {
                        resource.post_error(
                            xdg_wm_base::Error::DefunctSurfaces,
                            "xdg_surface destroyed before its role object.",
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
        _resource: &xdg_surface::XdgSurface,
        data: &SurfaceKey,
    ) {
        if let Some(surface) = state.surfaces.get_mut(*data) {
            surface.addons.xdg = None;
        }
    }
}

impl wayland_server::Dispatch<xdg_toplevel::XdgToplevel, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &xdg_toplevel::XdgToplevel,
        request: xdg_toplevel::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let key = *data;
        match request {
            xdg_toplevel::Request::SetTitle { title } => {
                if let Some(toplevel) = state
                    .surfaces
                    .get_mut(key)
                    .and_then(|s| s.addons.toplevel.as_mut())
                {
                    toplevel.state.touch().title = Some(title);
                }
            }
            xdg_toplevel::Request::SetAppId { app_id } => {
                if let Some(toplevel) = state
                    .surfaces
                    .get_mut(key)
                    .and_then(|s| s.addons.toplevel.as_mut())
                {
                    toplevel.state.touch().app_id = Some(app_id);
                }
            }
            xdg_toplevel::Request::Move { .. } => {
                state.begin_move(key);
            }
            xdg_toplevel::Request::Resize { edges, .. } => {
                if let Ok(edges) = edges.into_result() {
                    state.begin_resize(key, edges);
                }
            }
            xdg_toplevel::Request::SetMaxSize { width, height } => {
                if let Some(toplevel) = state
                    .surfaces
                    .get_mut(key)
                    .and_then(|s| s.addons.toplevel.as_mut())
                {
                    toplevel.max_size = glam::IVec2::new(width, height);
                }
            }
            xdg_toplevel::Request::SetMinSize { width, height } => {
                if let Some(toplevel) = state
                    .surfaces
                    .get_mut(key)
                    .and_then(|s| s.addons.toplevel.as_mut())
                {
                    toplevel.min_size = glam::IVec2::new(width, height);
                }
            }
            xdg_toplevel::Request::SetFullscreen { output } => {
                use crate::compositor::output::OutputKey;

                let output_key = output
                    .as_ref()
                    .and_then(|o| o.data::<OutputKey>())
                    .copied()
                    .or_else(|| {
                        // No output requested: the one under the pointer.
                        let position = state.seat.pointer.position;
                        state.layout.clamp_position(&state.outputs, position).1
                    });

                state.toplevel_set_fullscreen(key, output_key);
            }
            xdg_toplevel::Request::UnsetFullscreen => {
                state.toplevel_set_fullscreen(key, None);
            }
            xdg_toplevel::Request::SetParent { .. } => (),
            xdg_toplevel::Request::ShowWindowMenu { .. } => (),
            xdg_toplevel::Request::SetMaximized | xdg_toplevel::Request::UnsetMaximized => {
                // Maximization is window-manager policy; not offered in
                // wm_capabilities, so silently ignored here.
            }
            xdg_toplevel::Request::SetMinimized => (),
            xdg_toplevel::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &xdg_toplevel::XdgToplevel,
        data: &SurfaceKey,
    ) {
        let key = *data;
        if let Some(surface) = state.surfaces.get_mut(key) {
            surface.addons.toplevel = None;
            surface.mapped = false;
        }
        state.surfaces_z.retain(|k| *k != key);
        state.seat_surface_gone(key);
    }
}

impl wayland_server::Dispatch<xdg_popup::XdgPopup, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &xdg_popup::XdgPopup,
        request: xdg_popup::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let key = *data;
        match request {
            xdg_popup::Request::Grab { .. } => {
                if let Some(popup) = state
                    .surfaces
                    .get_mut(key)
                    .and_then(|s| s.addons.popup.as_mut())
                {
                    popup.grab = true;
                }
            }
            xdg_popup::Request::Reposition { positioner, token } => {
                let rules = positioner
                    .data::<Arc<Mutex<PositionerRules>>>()
                    .map(|rules| rules.lock().unwrap().clone())
                    .unwrap_or_default();

                if let Some(popup) = state
                    .surfaces
                    .get_mut(key)
                    .and_then(|s| s.addons.popup.as_mut())
                {
                    popup.positioner = rules;
                    popup.reposition_token = Some(token);
                }

                state.popup_position(key);
            }
            xdg_popup::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &xdg_popup::XdgPopup,
        data: &SurfaceKey,
    ) {
        let key = *data;
        if let Some(surface) = state.surfaces.get_mut(key) {
            surface.addons.popup = None;
            surface.mapped = false;
        }
        state.surfaces_z.retain(|k| *k != key);
        state.seat_surface_gone(key);
    }
}
