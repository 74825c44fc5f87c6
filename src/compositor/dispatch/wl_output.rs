use wayland_server::protocol::wl_output;

use crate::compositor::{output::OutputKey, State};

impl wayland_server::GlobalDispatch<wl_output::WlOutput, OutputKey> for State {
    fn bind(
        state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_output::WlOutput>,
        global_data: &OutputKey,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let key = *global_data;
        let wl_output = data_init.init(resource, key);

        state.describe_output(key, &wl_output);
        if let Some(output) = state.outputs.get_mut(key) {
            output.resources.push(wl_output);
        }
    }
}

impl wayland_server::Dispatch<wl_output::WlOutput, OutputKey> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_output::WlOutput,
        request: wl_output::Request,
        _data: &OutputKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_output::Request::Release => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &wl_output::WlOutput,
        data: &OutputKey,
    ) {
        if let Some(output) = state.outputs.get_mut(*data) {
            output.resources.retain(|r| r != resource);
        }
    }
}
