use wayland_server::{
    protocol::{wl_keyboard, wl_pointer, wl_seat, wl_surface, wl_touch},
    Resource as _,
};

use crate::compositor::{surface::SurfaceKey, State};

impl wayland_server::GlobalDispatch<wl_seat::WlSeat, ()> for State {
    fn bind(
        state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_seat::WlSeat>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let wl_seat = data_init.init(resource, ());

        wl_seat.capabilities(wl_seat::Capability::Pointer | wl_seat::Capability::Keyboard);
        if wl_seat.version() >= 2 {
            wl_seat.name(state.seat.name.clone());
        }
    }
}

impl wayland_server::Dispatch<wl_seat::WlSeat, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_seat::WlSeat,
        request: wl_seat::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_seat::Request::GetPointer { id } => {
                let wl_pointer = data_init.init(id, ());
                state.seat.add_pointer(wl_pointer);
            }
            wl_seat::Request::GetKeyboard { id } => {
                let wl_keyboard = data_init.init(id, ());
                state.seat.add_keyboard(wl_keyboard);
            }
            wl_seat::Request::GetTouch { id } => {
                // Touch is not aggregated; the object exists and stays
                // silent.
                data_init.init(id, ());
            }
            wl_seat::Request::Release => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wl_pointer::WlPointer, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_pointer::WlPointer,
        request: wl_pointer::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_pointer::Request::SetCursor {
                serial,
                surface,
                hotspot_x,
                hotspot_y,
            } => {
                let key = surface
                    .as_ref()
                    .and_then(|s: &wl_surface::WlSurface| s.data::<SurfaceKey>())
                    .copied();

                state.set_cursor_surface(
                    resource,
                    serial,
                    key,
                    glam::IVec2::new(hotspot_x, hotspot_y),
                );
            }
            wl_pointer::Request::Release => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &wl_pointer::WlPointer,
        _data: &(),
    ) {
        state.seat.remove_pointer(resource);
    }
}

impl wayland_server::Dispatch<wl_keyboard::WlKeyboard, ()> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_keyboard::WlKeyboard,
        request: wl_keyboard::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_keyboard::Request::Release => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &wl_keyboard::WlKeyboard,
        _data: &(),
    ) {
        state.seat.remove_keyboard(resource);
    }
}

impl wayland_server::Dispatch<wl_touch::WlTouch, ()> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_touch::WlTouch,
        _request: wl_touch::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}
