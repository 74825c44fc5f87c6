use wayland_protocols::wp::pointer_gestures::zv1::server::{
    zwp_pointer_gesture_hold_v1, zwp_pointer_gesture_pinch_v1, zwp_pointer_gesture_swipe_v1,
    zwp_pointer_gestures_v1,
};

use crate::compositor::State;

// The gestures global is advertised but never emits events: gesture
// recognition is not performed on the aggregated pointer.

impl wayland_server::GlobalDispatch<zwp_pointer_gestures_v1::ZwpPointerGesturesV1, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<zwp_pointer_gestures_v1::ZwpPointerGesturesV1>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<zwp_pointer_gestures_v1::ZwpPointerGesturesV1, ()> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_pointer_gestures_v1::ZwpPointerGesturesV1,
        request: zwp_pointer_gestures_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zwp_pointer_gestures_v1::Request::GetSwipeGesture { id, .. } => {
                data_init.init(id, ());
            }
            zwp_pointer_gestures_v1::Request::GetPinchGesture { id, .. } => {
                data_init.init(id, ());
            }
            zwp_pointer_gestures_v1::Request::GetHoldGesture { id, .. } => {
                data_init.init(id, ());
            }
            zwp_pointer_gestures_v1::Request::Release => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<zwp_pointer_gesture_swipe_v1::ZwpPointerGestureSwipeV1, ()>
    for State
{
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_pointer_gesture_swipe_v1::ZwpPointerGestureSwipeV1,
        _request: zwp_pointer_gesture_swipe_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}

impl wayland_server::Dispatch<zwp_pointer_gesture_pinch_v1::ZwpPointerGesturePinchV1, ()>
    for State
{
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_pointer_gesture_pinch_v1::ZwpPointerGesturePinchV1,
        _request: zwp_pointer_gesture_pinch_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}

impl wayland_server::Dispatch<zwp_pointer_gesture_hold_v1::ZwpPointerGestureHoldV1, ()> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_pointer_gesture_hold_v1::ZwpPointerGestureHoldV1,
        _request: zwp_pointer_gesture_hold_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}
