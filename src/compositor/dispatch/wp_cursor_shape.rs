use wayland_protocols::wp::cursor_shape::v1::server::{
    wp_cursor_shape_device_v1, wp_cursor_shape_manager_v1,
};
use wayland_server::protocol::wl_pointer;

use crate::compositor::State;

impl wayland_server::GlobalDispatch<wp_cursor_shape_manager_v1::WpCursorShapeManagerV1, ()>
    for State
{
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wp_cursor_shape_manager_v1::WpCursorShapeManagerV1>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<wp_cursor_shape_manager_v1::WpCursorShapeManagerV1, ()> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wp_cursor_shape_manager_v1::WpCursorShapeManagerV1,
        request: wp_cursor_shape_manager_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wp_cursor_shape_manager_v1::Request::GetPointer {
                cursor_shape_device,
                pointer,
            } => {
                data_init.init(cursor_shape_device, Some(pointer));
            }
            wp_cursor_shape_manager_v1::Request::GetTabletToolV2 {
                cursor_shape_device,
                ..
            } => {
                // No tablet support; the object exists and is ignored.
                data_init.init(cursor_shape_device, None);
            }
            wp_cursor_shape_manager_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl
    wayland_server::Dispatch<
        wp_cursor_shape_device_v1::WpCursorShapeDeviceV1,
        Option<wl_pointer::WlPointer>,
    > for State
{
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wp_cursor_shape_device_v1::WpCursorShapeDeviceV1,
        request: wp_cursor_shape_device_v1::Request,
        data: &Option<wl_pointer::WlPointer>,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wp_cursor_shape_device_v1::Request::SetShape { serial, shape } => {
                if let (Some(pointer), Ok(shape)) = (data.as_ref(), shape.into_result()) {
                    state.set_cursor_shape(pointer, serial, shape);
                }
            }
            wp_cursor_shape_device_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}
