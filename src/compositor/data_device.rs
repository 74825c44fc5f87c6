use slotmap::SlotMap;
use tracing::{debug, trace, warn};
use wayland_server::{
    backend::ClientId,
    protocol::{wl_data_device, wl_data_device_manager, wl_data_offer, wl_data_source},
    Resource as _,
};

use glam::DVec2;

use crate::compositor::{
    surface::{DragIconAddon, Role, SurfaceKey},
    State,
};

slotmap::new_key_type! { pub struct DataSourceKey; }
slotmap::new_key_type! { pub struct DataOfferKey; }
slotmap::new_key_type! { pub struct DataDeviceKey; }

type DndAction = wl_data_device_manager::DndAction;

pub struct DataSource {
    pub resource: wl_data_source::WlDataSource,
    pub mime_types: Vec<String>,
    pub actions: DndAction,
    pub cancelled: bool,
}

pub struct DataOffer {
    pub resource: wl_data_offer::WlDataOffer,
    pub source: DataSourceKey,
    pub device: DataDeviceKey,
    pub action: DndAction,
    pub mime_type: Option<String>,
}

pub struct DataDevice {
    pub resource: wl_data_device::WlDataDevice,
}

/// An in-progress drag: the grabbed source and icon, plus the surface the
/// drag currently hovers and the offer posted to it.
#[derive(Default)]
pub struct DragState {
    pub device: Option<DataDeviceKey>,
    pub source: Option<DataSourceKey>,
    pub icon: Option<SurfaceKey>,
    pub offered_surface: Option<SurfaceKey>,
    pub offer: Option<DataOfferKey>,
}

/// Selection and drag-and-drop bookkeeping across data devices.
#[derive(Default)]
pub struct DataManager {
    pub sources: SlotMap<DataSourceKey, DataSource>,
    pub offers: SlotMap<DataOfferKey, DataOffer>,
    pub devices: SlotMap<DataDeviceKey, DataDevice>,

    pub selection: Option<DataSourceKey>,
    pub drag: DragState,
}

impl DataManager {
    pub fn drag_active(&self) -> bool {
        self.drag.source.is_some() && self.drag.device.is_some()
    }

    pub fn end_drag(&mut self) {
        self.drag = DragState::default();
    }

    pub fn surface_gone(&mut self, key: SurfaceKey) {
        if self.drag.icon == Some(key) {
            self.drag.icon = None;
        }
        if self.drag.offered_surface == Some(key) {
            self.drag.offered_surface = None;
            self.drag.offer = None;
        }
    }
}

impl State {
    /// Cancels a source (at most once) and tears down any drag built on
    /// it.
    pub fn cancel_data_source(&mut self, key: DataSourceKey) {
        let Some(source) = self.data.sources.get_mut(key) else {
            return;
        };
        if source.cancelled {
            return;
        }

        debug!("cancelling data source");
        source.cancelled = true;
        if source.resource.is_alive() {
            source.resource.cancelled();
        }

        if self.data.drag.source == Some(key) {
            self.data.end_drag();
        }
    }

    /// wl_data_device.set_selection: every other source is cancelled, and
    /// the keyboard-focused client receives the new offer.
    pub fn set_selection(&mut self, source: Option<DataSourceKey>) {
        let others: Vec<DataSourceKey> = self
            .data
            .sources
            .iter()
            .filter(|(key, _)| Some(*key) != source)
            .map(|(key, _)| key)
            .collect();

        for key in others {
            self.cancel_data_source(key);
        }

        self.data.selection = source;
        debug!(has_source = source.is_some(), "selection set");

        let focused_client = self
            .seat
            .keyboard
            .focus
            .and_then(|key| self.surfaces.get(key))
            .and_then(|surface| surface.wl_surface.client())
            .map(|client| client.id());

        if let Some(client) = focused_client {
            self.offer_selection_to(client);
        }
    }

    /// Posts the current selection as a fresh offer on every data device
    /// owned by `client`.
    pub fn offer_selection_to(&mut self, client: ClientId) {
        let Some(selection) = self.data.selection else {
            return;
        };
        if self
            .data
            .sources
            .get(selection)
            .map_or(true, |source| source.cancelled)
        {
            return;
        }

        let devices: Vec<DataDeviceKey> = self
            .data
            .devices
            .iter()
            .filter(|(_, device)| {
                device.resource.client().map(|c| c.id()) == Some(client.clone())
            })
            .map(|(key, _)| key)
            .collect();

        for device in devices {
            if let Some(offer) = self.create_offer(device, selection) {
                let offer_resource = self.data.offers[offer].resource.clone();
                let device_resource = self.data.devices[device].resource.clone();
                device_resource.selection(Some(&offer_resource));
            }
        }
    }

    /// Creates a wl_data_offer on the device's client and announces the
    /// source's mime types and actions.
    fn create_offer(&mut self, device: DataDeviceKey, source: DataSourceKey) -> Option<DataOfferKey> {
        let device_resource = self.data.devices.get(device)?.resource.clone();
        let client = device_resource.client()?;

        let (mime_types, actions) = {
            let source = self.data.sources.get(source)?;
            (source.mime_types.clone(), source.actions)
        };

        let display = self.display.clone();
        let version = device_resource.version();

        let key = self
            .data
            .offers
            .try_insert_with_key(|key| {
                client
                    .create_resource::<wl_data_offer::WlDataOffer, DataOfferKey, State>(
                        &display, version, key,
                    )
                    .map(|resource| DataOffer {
                        resource,
                        source,
                        device,
                        action: DndAction::empty(),
                        mime_type: None,
                    })
            })
            .ok()?;

        let offer_resource = self.data.offers[key].resource.clone();
        device_resource.data_offer(&offer_resource);

        for mime in &mime_types {
            offer_resource.offer(mime.clone());
        }
        if offer_resource.version() >= 3 {
            offer_resource.source_actions(actions);
        }

        Some(key)
    }

    /// wl_data_device.start_drag. The icon surface takes the drag-icon
    /// role; its committed offsets accumulate from here.
    pub fn start_drag(
        &mut self,
        device: DataDeviceKey,
        source: DataSourceKey,
        _origin: SurfaceKey,
        icon: Option<SurfaceKey>,
    ) {
        if let Some(icon_key) = icon {
            if let Some(surface) = self.surfaces.get_mut(icon_key) {
                match surface.role {
                    None | Some(Role::DragIcon) => {
                        surface.role = Some(Role::DragIcon);
                        surface.addons.drag_icon = Some(DragIconAddon::default());
                        surface.buffer_dst.pos = glam::IVec2::ZERO;
                    }
                    Some(_) => {
                        warn!(surface = ?surface, "drag icon surface already has a role");
                    }
                }
            }
        }

        debug!("drag started");
        self.data.drag = DragState {
            device: Some(device),
            source: Some(source),
            icon,
            offered_surface: None,
            offer: None,
        };

        let position = self.seat.pointer.position;
        let target = self.surface_under(position).map(|(key, _)| key);
        self.drag_motion(target, position);
    }

    /// Pointer motion while a drag is active: motion within the current
    /// target, or leave/offer/enter when the target changes.
    pub fn drag_motion(&mut self, target: Option<SurfaceKey>, global: DVec2) {
        if !self.data.drag_active() {
            return;
        }

        // Drags never target the icon itself or other unfocusable roles.
        let target = target.filter(|key| {
            self.surfaces
                .get(*key)
                .and_then(|surface| surface.role)
                .map_or(true, |role| role.focusable())
        });

        if self.data.drag.offered_surface == target {
            let Some(target) = target else { return };
            let Some(surface) = self.surfaces.get(target) else {
                return;
            };

            let position = self.surface_pos_from_global(target, global);
            let time = self.timestamp();
            let surface_id = surface.wl_surface.id();

            for (_, device) in self.data.devices.iter() {
                if device.resource.id().same_client_as(&surface_id) {
                    device.resource.motion(time, position.x, position.y);
                }
            }
            return;
        }

        // Leaving the previous target invalidates its offer.
        if let Some(old) = self.data.drag.offered_surface.take() {
            if let Some(surface) = self.surfaces.get(old) {
                let surface_id = surface.wl_surface.id();
                trace!("drag leave");
                for (_, device) in self.data.devices.iter() {
                    if device.resource.id().same_client_as(&surface_id) {
                        device.resource.leave();
                    }
                }
            }
        }

        self.data.drag.offered_surface = target;
        self.data.drag.offer = None;

        let Some(target) = target else { return };
        let Some(source) = self.data.drag.source else {
            return;
        };

        let position = self.surface_pos_from_global(target, global);
        let serial = self.serial.next();

        let device_keys: Vec<DataDeviceKey> = {
            let Some(surface) = self.surfaces.get(target) else {
                return;
            };
            let surface_id = surface.wl_surface.id();
            self.data
                .devices
                .iter()
                .filter(|(_, device)| device.resource.id().same_client_as(&surface_id))
                .map(|(key, _)| key)
                .collect()
        };

        for device in device_keys {
            let Some(offer) = self.create_offer(device, source) else {
                continue;
            };

            let offer_resource = self.data.offers[offer].resource.clone();
            let device_resource = self.data.devices[device].resource.clone();
            let wl_surface = self.surfaces[target].wl_surface.clone();

            trace!(?position, "drag enter");
            device_resource.enter(
                serial,
                &wl_surface,
                position.x,
                position.y,
                Some(&offer_resource),
            );
        }
    }

    /// Pointer release during a drag: drop if an accepted offer with a
    /// usable action is attached, cancel otherwise.
    pub fn finish_drag(&mut self) {
        let drag_source = self.data.drag.source;
        let drag_offer = self.data.drag.offer;

        // The icon disappears regardless of the outcome.
        if let Some(icon) = self.data.drag.icon.take() {
            if let Some(surface) = self.surfaces.get_mut(icon) {
                surface.addons.drag_icon = None;
            }
            self.needs_redraw = true;
        }

        let Some(source_key) = drag_source else {
            self.data.end_drag();
            return;
        };

        let accepted = drag_offer.and_then(|key| self.data.offers.get(key)).map(|offer| {
            let action_ok = !offer.action.is_empty()
                && self
                    .data
                    .sources
                    .get(offer.source)
                    .is_some_and(|source| source.actions.contains(offer.action));
            (offer.device, action_ok)
        });

        match accepted {
            Some((device, true)) => {
                debug!("drag completed with drop");
                if let Some(device) = self.data.devices.get(device) {
                    device.resource.drop();
                }
                if let Some(source) = self.data.sources.get(source_key) {
                    source.resource.dnd_drop_performed();
                }
                // The drag record survives until wl_data_offer.finish.
            }
            _ => {
                debug!("drag completed without a matching action, cancelling");
                self.cancel_data_source(source_key);
                self.data.end_drag();
            }
        }

        self.update_pointer_focus();
    }

    /// wl_data_offer.accept: track whether the drag target accepts one of
    /// the offered mime types, and give the source feedback.
    pub fn offer_accept(&mut self, key: DataOfferKey, mime_type: Option<String>) {
        let Some(offer) = self.data.offers.get(key) else {
            return;
        };
        let source_key = offer.source;

        if self.data.drag.source != Some(source_key) {
            trace!("accept outside the active drag, ignoring");
            return;
        }

        let matches = match &mime_type {
            None => false,
            Some(mime) => self
                .data
                .sources
                .get(source_key)
                .is_some_and(|source| source.mime_types.iter().any(|m| m == mime)),
        };

        let source_resource = self
            .data
            .sources
            .get(source_key)
            .map(|source| source.resource.clone());

        if matches {
            self.data.drag.offer = Some(key);
            self.data.offers[key].mime_type = mime_type.clone();
            if let Some(source) = source_resource {
                source.target(mime_type);
            }
        } else if self.data.drag.offer == Some(key) {
            self.data.drag.offer = None;
            if let Some(source) = source_resource {
                source.target(None);
            }
        }
    }

    /// wl_data_offer.set_actions: negotiate the drag action and tell both
    /// ends.
    pub fn offer_set_actions(
        &mut self,
        key: DataOfferKey,
        actions: DndAction,
        preferred: DndAction,
    ) {
        let Some(offer) = self.data.offers.get(key) else {
            return;
        };

        let Some(source) = self.data.sources.get(offer.source) else {
            warn!("set_actions on an offer whose source is gone");
            return;
        };

        let both = source.actions & actions;
        let chosen = if both.contains(preferred) && !preferred.is_empty() {
            preferred
        } else {
            // Lowest set bit wins, matching the protocol's precedence.
            let bits: u32 = both.bits();
            if bits == 0 {
                DndAction::empty()
            } else {
                DndAction::from_bits_truncate(bits & bits.wrapping_neg())
            }
        };

        let offer = &mut self.data.offers[key];
        offer.action = chosen;
        offer.resource.action(chosen);

        if let Some(source) = self.data.sources.get(offer.source) {
            if source.resource.version() >= 3 {
                source.resource.action(chosen);
            }
        }
    }

    /// wl_data_offer.finish: the drop target is done with the transfer.
    pub fn offer_finish(&mut self, key: DataOfferKey) {
        if let Some(offer) = self.data.offers.get(key) {
            if let Some(source) = self.data.sources.get(offer.source) {
                source.resource.dnd_finished();
            }
        }

        self.data.end_drag();
    }

    pub fn data_source_destroyed(&mut self, key: DataSourceKey) {
        if self.data.drag.source == Some(key) {
            self.data.end_drag();
        }
        if self.data.selection == Some(key) {
            self.data.selection = None;
        }

        self.data.sources.remove(key);
    }
}
