use std::os::fd::AsFd as _;

use wayland_server::{
    protocol::{wl_data_device, wl_data_device_manager, wl_data_offer, wl_data_source},
    Resource as _,
};

use crate::compositor::{
    data_device::{DataDevice, DataDeviceKey, DataOfferKey, DataSource, DataSourceKey},
    surface::SurfaceKey,
    State,
};

impl wayland_server::GlobalDispatch<wl_data_device_manager::WlDataDeviceManager, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_data_device_manager::WlDataDeviceManager>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<wl_data_device_manager::WlDataDeviceManager, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_data_device_manager::WlDataDeviceManager,
        request: wl_data_device_manager::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_data_device_manager::Request::CreateDataSource { id } => {
                state.data.sources.insert_with_key(|key| DataSource {
                    resource: data_init.init(id, key),
                    mime_types: Vec::new(),
                    actions: wl_data_device_manager::DndAction::empty(),
                    cancelled: false,
                });
            }
            wl_data_device_manager::Request::GetDataDevice { id, seat: _ } => {
                state.data.devices.insert_with_key(|key| DataDevice {
                    resource: data_init.init(id, key),
                });
            }
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wl_data_source::WlDataSource, DataSourceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_data_source::WlDataSource,
        request: wl_data_source::Request,
        data: &DataSourceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let key = *data;
        match request {
            wl_data_source::Request::Offer { mime_type } => {
                // A cancelled source cannot grow new offers.
                if let Some(source) = state.data.sources.get_mut(key) {
                    if !source.cancelled {
                        source.mime_types.push(mime_type);
                    }
                }
            }
            wl_data_source::Request::SetActions { dnd_actions } => {
                if let Some(source) = state.data.sources.get_mut(key) {
                    source.actions = dnd_actions.into_result().unwrap_or(wl_data_device_manager::DndAction::empty());
                }
            }
            wl_data_source::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_data_source::WlDataSource,
        data: &DataSourceKey,
    ) {
        state.data_source_destroyed(*data);
    }
}

impl wayland_server::Dispatch<wl_data_device::WlDataDevice, DataDeviceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_data_device::WlDataDevice,
        request: wl_data_device::Request,
        data: &DataDeviceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let key = *data;
        match request {
            wl_data_device::Request::SetSelection { source, serial: _ } => {
                let source = source
                    .as_ref()
                    .and_then(|s| s.data::<DataSourceKey>())
                    .copied();
                state.set_selection(source);
            }
            wl_data_device::Request::StartDrag {
                source,
                origin,
                icon,
                serial: _,
            } => {
                let Some(source) = source.as_ref().and_then(|s| s.data::<DataSourceKey>()) else {
                    // Drags without a data source carry no data to any
                    // other client; nothing to coordinate.
                    return;
                };
                let Some(origin) = origin.data::<SurfaceKey>() else {
                    return;
                };
                let icon = icon.as_ref().and_then(|s| s.data::<SurfaceKey>()).copied();

                state.start_drag(key, *source, *origin, icon);
            }
            wl_data_device::Request::Release => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_data_device::WlDataDevice,
        data: &DataDeviceKey,
    ) {
        if state.data.drag.device == Some(*data) {
            state.data.end_drag();
        }
        state.data.devices.remove(*data);
    }
}

impl wayland_server::Dispatch<wl_data_offer::WlDataOffer, DataOfferKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_data_offer::WlDataOffer,
        request: wl_data_offer::Request,
        data: &DataOfferKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let key = *data;
        match request {
            wl_data_offer::Request::Accept { serial: _, mime_type } => {
                state.offer_accept(key, mime_type);
            }
            wl_data_offer::Request::Receive { mime_type, fd } => {
                let source = state
                    .data
                    .offers
                    .get(key)
                    .and_then(|offer| state.data.sources.get(offer.source));

                match source {
                    Some(source) if source.resource.is_alive() => {
                        source.resource.send(mime_type, fd.as_fd());
                    }
                    _ => tracing::warn!("receive on an offer whose source is gone"),
                }
                // fd closes on drop.
            }
            wl_data_offer::Request::SetActions {
                dnd_actions,
                preferred_action,
            } => {
                let actions = dnd_actions.into_result().unwrap_or(wl_data_device_manager::DndAction::empty());
                let preferred = preferred_action.into_result().unwrap_or(wl_data_device_manager::DndAction::empty());
                state.offer_set_actions(key, actions, preferred);
            }
            wl_data_offer::Request::Finish => {
                state.offer_finish(key);
            }
            wl_data_offer::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_data_offer::WlDataOffer,
        data: &DataOfferKey,
    ) {
        if state.data.drag.offer == Some(*data) {
            state.data.drag.offer = None;
        }
        state.data.offers.remove(*data);
    }
}
