//! Both decoration protocols always answer "server side": windows get the
//! compositor backstop and focus border, never client decorations.

use wayland_protocols::xdg::decoration::zv1::server::{
    zxdg_decoration_manager_v1, zxdg_toplevel_decoration_v1,
};
use wayland_protocols_misc::server_decoration::server::{
    org_kde_kwin_server_decoration, org_kde_kwin_server_decoration_manager,
};

use crate::compositor::State;

impl wayland_server::GlobalDispatch<zxdg_decoration_manager_v1::ZxdgDecorationManagerV1, ()>
    for State
{
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<zxdg_decoration_manager_v1::ZxdgDecorationManagerV1>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<zxdg_decoration_manager_v1::ZxdgDecorationManagerV1, ()> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zxdg_decoration_manager_v1::ZxdgDecorationManagerV1,
        request: zxdg_decoration_manager_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zxdg_decoration_manager_v1::Request::GetToplevelDecoration { id, .. } => {
                let decoration = data_init.init(id, ());
                decoration.configure(zxdg_toplevel_decoration_v1::Mode::ServerSide);
            }
            zxdg_decoration_manager_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<zxdg_toplevel_decoration_v1::ZxdgToplevelDecorationV1, ()>
    for State
{
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        resource: &zxdg_toplevel_decoration_v1::ZxdgToplevelDecorationV1,
        request: zxdg_toplevel_decoration_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zxdg_toplevel_decoration_v1::Request::SetMode { .. }
            | zxdg_toplevel_decoration_v1::Request::UnsetMode => {
                resource.configure(zxdg_toplevel_decoration_v1::Mode::ServerSide);
            }
            zxdg_toplevel_decoration_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl
    wayland_server::GlobalDispatch<
        org_kde_kwin_server_decoration_manager::OrgKdeKwinServerDecorationManager,
        (),
    > for State
{
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<
            org_kde_kwin_server_decoration_manager::OrgKdeKwinServerDecorationManager,
        >,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let manager = data_init.init(resource, ());
        manager.default_mode(org_kde_kwin_server_decoration_manager::Mode::Server);
    }
}

impl
    wayland_server::Dispatch<
        org_kde_kwin_server_decoration_manager::OrgKdeKwinServerDecorationManager,
        (),
    > for State
{
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &org_kde_kwin_server_decoration_manager::OrgKdeKwinServerDecorationManager,
        request: org_kde_kwin_server_decoration_manager::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            org_kde_kwin_server_decoration_manager::Request::Create { id, .. } => {
                let decoration = data_init.init(id, ());
                decoration.mode(org_kde_kwin_server_decoration::Mode::Server);
            }
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<org_kde_kwin_server_decoration::OrgKdeKwinServerDecoration, ()>
    for State
{
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        resource: &org_kde_kwin_server_decoration::OrgKdeKwinServerDecoration,
        request: org_kde_kwin_server_decoration::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            org_kde_kwin_server_decoration::Request::RequestMode { .. } => {
                resource.mode(org_kde_kwin_server_decoration::Mode::Server);
            }
            org_kde_kwin_server_decoration::Request::Release => (),
            _ => unreachable!(),
        }
    }
}
