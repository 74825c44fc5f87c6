use glam::DVec2;
use hashbrown::{HashMap, HashSet};
use tracing::{debug, trace, warn};
use wayland_protocols::{
    wp::relative_pointer::zv1::server::zwp_relative_pointer_v1,
    xdg::shell::server::xdg_toplevel,
};
use wayland_server::{
    backend::ClientId,
    protocol::{wl_keyboard, wl_pointer},
    Resource as _,
};

use crate::{
    compositor::{
        input::{evdev, CountingSet, Xkb},
        surface::SurfaceKey,
        xdg, State, EPOCH,
    },
    config::KeyboardConfig,
};

#[derive(Debug)]
pub struct PointerEntry {
    pending_frame: bool,
}

pub struct SeatPointer {
    pub resources: HashMap<wl_pointer::WlPointer, PointerEntry>,
    pub relative_pointers:
        HashMap<zwp_relative_pointer_v1::ZwpRelativePointerV1, wl_pointer::WlPointer>,

    pub focus: Option<SurfaceKey>,
    /// Surface-local coordinates of the last enter/motion.
    pub focus_coords: DVec2,
    /// Global position, integrated as f64.
    pub position: DVec2,

    /// Aggregated across source devices; an implicit grab holds focus
    /// while any button is down.
    pub pressed: CountingSet,
    pub implicit_grab: Option<SurfaceKey>,

    /// Last enter serial per client, for set_cursor validation.
    pub enter_serials: HashMap<ClientId, u32>,
}

pub struct SeatKeyboard {
    pub resources: HashSet<wl_keyboard::WlKeyboard>,
    pub focus: Option<SurfaceKey>,
    pub xkb: Xkb,
    pub pressed: CountingSet,
    pub repeat_rate: i32,
    pub repeat_delay: i32,
}

/// The virtual seat presented to clients: one keyboard and one pointer,
/// each aggregating any number of source devices.
pub struct Seat {
    pub name: String,
    pub keyboard: SeatKeyboard,
    pub pointer: SeatPointer,
}

impl Seat {
    pub fn new(config: &KeyboardConfig) -> anyhow::Result<Self> {
        Ok(Self {
            name: "seat0".to_string(),
            keyboard: SeatKeyboard {
                resources: HashSet::new(),
                focus: None,
                xkb: Xkb::new(&config.layout)?,
                pressed: CountingSet::default(),
                repeat_rate: config.repeat_rate,
                repeat_delay: config.repeat_delay,
            },
            pointer: SeatPointer {
                resources: HashMap::new(),
                relative_pointers: HashMap::new(),
                focus: None,
                focus_coords: DVec2::ZERO,
                position: DVec2::ZERO,
                pressed: CountingSet::default(),
                implicit_grab: None,
                enter_serials: HashMap::new(),
            },
        })
    }

    pub fn add_pointer(&mut self, wl_pointer: wl_pointer::WlPointer) {
        self.pointer
            .resources
            .insert(wl_pointer, PointerEntry { pending_frame: false });
    }

    pub fn remove_pointer(&mut self, wl_pointer: &wl_pointer::WlPointer) {
        self.pointer.resources.remove(wl_pointer);
        self.pointer
            .relative_pointers
            .retain(|_, pointer| pointer != wl_pointer);
    }

    pub fn add_keyboard(&mut self, wl_keyboard: wl_keyboard::WlKeyboard) {
        use std::os::fd::AsFd as _;

        wl_keyboard.keymap(
            wl_keyboard::KeymapFormat::XkbV1,
            self.keyboard.xkb.keymap_file.as_fd(),
            self.keyboard.xkb.keymap_file.size() as u32,
        );

        if wl_keyboard.version() >= 4 {
            wl_keyboard.repeat_info(self.keyboard.repeat_rate, self.keyboard.repeat_delay);
        }

        self.keyboard.resources.insert(wl_keyboard);
    }

    pub fn remove_keyboard(&mut self, wl_keyboard: &wl_keyboard::WlKeyboard) {
        self.keyboard.resources.remove(wl_keyboard);
    }
}

/// Interactive move/resize driven through xdg_toplevel requests. Pointer
/// motion is diverted into the grab while it is active.
pub enum Interaction {
    Normal,
    Move {
        toplevel: SurfaceKey,
        pointer_grab: DVec2,
        anchor_grab: DVec2,
    },
    Resize {
        toplevel: SurfaceKey,
        pointer_grab: DVec2,
        size_grab: DVec2,
    },
}

impl State {
    pub(crate) fn timestamp(&self) -> u32 {
        EPOCH.elapsed().as_millis() as u32
    }

    /// Absolute events arrive normalized to the source output; translate
    /// through the output's layout rect.
    pub fn pointer_absolute(&mut self, normalized: DVec2) {
        let Some(rect) = self
            .layout
            .primary
            .and_then(|key| self.outputs.get(key))
            .map(|output| output.layout_rect)
        else {
            return;
        };

        let global = rect.pos + normalized.clamp(DVec2::ZERO, DVec2::ONE) * rect.size;
        self.pointer_move_to(global);
    }

    pub fn pointer_motion_relative(&mut self, delta: DVec2) {
        let current = self.seat.pointer.position;
        let (clamped, _) = self
            .layout
            .clamp_position(&self.outputs, current + delta);

        let constrained = self.constrain_pointer(current, clamped);
        self.send_relative_motion(delta);
        self.pointer_move_to(constrained);
    }

    fn send_relative_motion(&mut self, delta: DVec2) {
        let Some(focus) = self.seat.pointer.focus else {
            return;
        };
        let Some(surface) = self.surfaces.get(focus) else {
            return;
        };

        let now = EPOCH.elapsed().as_micros() as u64;
        let utime_hi = (now >> 32) as u32;
        let utime_lo = (now & 0xffffffff) as u32;

        for (relative, wl_pointer) in self
            .seat
            .pointer
            .relative_pointers
            .iter()
            .filter(|(r, _)| r.id().same_client_as(&surface.wl_surface.id()))
        {
            relative.relative_motion(utime_hi, utime_lo, delta.x, delta.y, delta.x, delta.y);
            if let Some(entry) = self.seat.pointer.resources.get_mut(wl_pointer) {
                entry.pending_frame = true;
            }
        }
    }

    pub fn pointer_move_to(&mut self, global: DVec2) {
        self.seat.pointer.position = global;
        self.needs_redraw = true;

        match &self.interaction {
            Interaction::Move {
                toplevel,
                pointer_grab,
                anchor_grab,
            } => {
                let (toplevel, delta) = (*toplevel, global - *pointer_grab);
                let anchor = *anchor_grab + delta;
                if let Some(xdg) = self
                    .surfaces
                    .get_mut(toplevel)
                    .and_then(|s| s.addons.xdg.as_mut())
                {
                    xdg.anchor_position = anchor;
                } else {
                    self.interaction = Interaction::Normal;
                }
                return;
            }
            Interaction::Resize {
                toplevel,
                pointer_grab,
                size_grab,
            } => {
                let (toplevel, delta) = (*toplevel, global - *pointer_grab);
                let size_grab = *size_grab;

                let anchor_rel = self
                    .surfaces
                    .get(toplevel)
                    .and_then(|s| s.addons.xdg.as_ref())
                    .map(|xdg| xdg.anchor_relative);

                if let Some(anchor_rel) = anchor_rel {
                    // Dragging an edge away from the anchor grows the
                    // window; the anchored edge stays put.
                    let sign = DVec2::ONE - anchor_rel * 2.0;
                    let new_size = (size_grab + delta * sign).max(DVec2::ONE);

                    if let Some(t) = self.surfaces[toplevel].addons.toplevel.as_mut() {
                        t.set_size(new_size.round().as_ivec2());
                    }
                    self.flush_toplevel_configure(toplevel);
                } else {
                    self.interaction = Interaction::Normal;
                }
                return;
            }
            Interaction::Normal => (),
        }

        if self.data.drag_active() {
            let target = self.surface_under(global).map(|(key, _)| key);
            self.drag_motion(target, global);
            return;
        }

        self.update_pointer_focus();
    }

    /// Recomputes pointer focus from the scene, honoring the implicit
    /// grab, and emits enter/leave/motion.
    pub fn update_pointer_focus(&mut self) {
        let position = self.seat.pointer.position;

        let target = if let Some(grab) = self.seat.pointer.implicit_grab {
            if self.surfaces.contains_key(grab) {
                Some((grab, self.surface_pos_from_global(grab, position)))
            } else {
                None
            }
        } else {
            self.surface_under(position)
        };

        match (self.seat.pointer.focus, target) {
            (Some(old), Some((new, coords))) if old == new => {
                // Same surface; emit motion on actual movement.
                if self.seat.pointer.focus_coords.round().as_ivec2()
                    != coords.round().as_ivec2()
                {
                    self.seat.pointer.focus_coords = coords;
                    self.pointer_send_motion(new, coords);
                }
            }
            (old, new) => {
                if let Some(old) = old {
                    self.pointer_send_leave(old);
                }

                self.seat.pointer.focus = new.map(|(key, _)| key);
                if let Some((key, coords)) = new {
                    self.seat.pointer.focus_coords = coords;
                    self.pointer_send_enter(key, coords);
                }
            }
        }
    }

    fn focused_pointer_surface_id(
        &self,
        key: SurfaceKey,
    ) -> Option<wayland_server::protocol::wl_surface::WlSurface> {
        self.surfaces.get(key).map(|s| s.wl_surface.clone())
    }

    fn pointer_send_enter(&mut self, key: SurfaceKey, coords: DVec2) {
        let Some(wl_surface) = self.focused_pointer_surface_id(key) else {
            return;
        };

        let serial = self.serial.next();
        if let Some(client) = wl_surface.client() {
            self.seat.pointer.enter_serials.insert(client.id(), serial);
        }

        // The entered client decides the cursor from here on.
        self.cursor.reset_for_enter();

        trace!(surface = ?self.surfaces[key], ?coords, "pointer enter");
        for (wl_pointer, entry) in self
            .seat
            .pointer
            .resources
            .iter_mut()
            .filter(|(p, _)| p.is_alive() && p.id().same_client_as(&wl_surface.id()))
        {
            entry.pending_frame = true;
            wl_pointer.enter(serial, &wl_surface, coords.x, coords.y);
        }
    }

    fn pointer_send_leave(&mut self, key: SurfaceKey) {
        let Some(wl_surface) = self.focused_pointer_surface_id(key) else {
            return;
        };

        let serial = self.serial.next();
        trace!(surface = ?self.surfaces[key], "pointer leave");
        for (wl_pointer, entry) in self
            .seat
            .pointer
            .resources
            .iter_mut()
            .filter(|(p, _)| p.is_alive() && p.id().same_client_as(&wl_surface.id()))
        {
            entry.pending_frame = true;
            wl_pointer.leave(serial, &wl_surface);
        }
    }

    fn pointer_send_motion(&mut self, key: SurfaceKey, coords: DVec2) {
        let Some(wl_surface) = self.focused_pointer_surface_id(key) else {
            return;
        };

        let time = self.timestamp();
        for (wl_pointer, entry) in self
            .seat
            .pointer
            .resources
            .iter_mut()
            .filter(|(p, _)| p.is_alive() && p.id().same_client_as(&wl_surface.id()))
        {
            entry.pending_frame = true;
            wl_pointer.motion(time, coords.x, coords.y);
        }
    }

    pub fn pointer_button(&mut self, code: u16, pressed: bool) {
        let edge = if pressed {
            self.seat.pointer.pressed.inc(code)
        } else {
            self.seat.pointer.pressed.dec(code)
        };
        if !edge {
            return;
        }

        if pressed {
            // The first press starts an implicit grab on the current
            // focus; it holds until every button is released.
            if self.seat.pointer.implicit_grab.is_none() {
                self.seat.pointer.implicit_grab = self.seat.pointer.focus;
            }

            let target = self.seat.pointer.focus;
            self.dismiss_grabbing_popups(target);

            // Click-to-focus.
            if let Some(focus) = target {
                let root = self.subsurface_root(focus);
                if self.surfaces.get(root).is_some_and(|s| s.addons.toplevel.is_some()) {
                    self.raise_surface(root);
                    self.activate_toplevel(Some(root));
                }
            }
        } else if !matches!(self.interaction, Interaction::Normal) {
            self.interaction = Interaction::Normal;
        }

        if self.data.drag_active() && !pressed && code == evdev::BTN_LEFT {
            if self.seat.pointer.pressed.is_empty() {
                self.seat.pointer.implicit_grab = None;
            }
            self.finish_drag();
            return;
        }

        let focus = self.seat.pointer.focus;
        if let Some(focus) = focus {
            let Some(wl_surface) = self.focused_pointer_surface_id(focus) else {
                return;
            };

            let serial = self.serial.next();
            let time = self.timestamp();
            let state = if pressed {
                wl_pointer::ButtonState::Pressed
            } else {
                wl_pointer::ButtonState::Released
            };

            for (wl_pointer, entry) in self
                .seat
                .pointer
                .resources
                .iter_mut()
                .filter(|(p, _)| p.is_alive() && p.id().same_client_as(&wl_surface.id()))
            {
                entry.pending_frame = true;
                wl_pointer.button(serial, time, code as u32, state);
            }
        }

        // The grab ends with the last release; only then does focus follow
        // the cursor again.
        if !pressed && self.seat.pointer.pressed.is_empty() {
            self.seat.pointer.implicit_grab = None;
            self.update_pointer_focus();
        }
    }

    pub fn pointer_axis(&mut self, scroll: DVec2, detents: DVec2) {
        let Some(focus) = self.seat.pointer.focus else {
            return;
        };
        let Some(wl_surface) = self.focused_pointer_surface_id(focus) else {
            return;
        };

        let time = self.timestamp();
        for (wl_pointer, entry) in self
            .seat
            .pointer
            .resources
            .iter_mut()
            .filter(|(p, _)| p.is_alive() && p.id().same_client_as(&wl_surface.id()))
        {
            entry.pending_frame = true;

            if scroll.x != 0.0 {
                wl_pointer.axis(time, wl_pointer::Axis::HorizontalScroll, scroll.x);
                send_axis_discrete(wl_pointer, wl_pointer::Axis::HorizontalScroll, detents.x);
            }
            if scroll.y != 0.0 {
                wl_pointer.axis(time, wl_pointer::Axis::VerticalScroll, scroll.y);
                send_axis_discrete(wl_pointer, wl_pointer::Axis::VerticalScroll, detents.y);
            }
        }
    }

    /// Batches wl_pointer.frame; runs in the idle pass.
    pub fn pointer_frame(&mut self) {
        for (wl_pointer, entry) in self.seat.pointer.resources.iter_mut() {
            if entry.pending_frame {
                if wl_pointer.version() >= 5 {
                    wl_pointer.frame();
                }
                entry.pending_frame = false;
            }
        }
    }

    pub fn seat_keyboard_key(&mut self, code: u16, pressed: bool) {
        let Some(focus) = self.seat.keyboard.focus else {
            return;
        };
        let Some(surface) = self.surfaces.get(focus) else {
            return;
        };

        let serial = self.serial.next();
        let time = self.timestamp();
        let state = if pressed {
            wl_keyboard::KeyState::Pressed
        } else {
            wl_keyboard::KeyState::Released
        };

        for wl_keyboard in self
            .seat
            .keyboard
            .resources
            .iter()
            .filter(|k| k.is_alive() && k.id().same_client_as(&surface.wl_surface.id()))
        {
            wl_keyboard.key(serial, time, code as u32, state);
        }
    }

    /// Modifier state is re-serialized and sent on every effective change.
    pub fn seat_keyboard_modifiers(&mut self) {
        let Some(focus) = self.seat.keyboard.focus else {
            return;
        };
        let Some(surface) = self.surfaces.get(focus) else {
            return;
        };

        let (depressed, latched, locked, group) = self.seat.keyboard.xkb.serialize();
        let serial = self.serial.next();

        for wl_keyboard in self
            .seat
            .keyboard
            .resources
            .iter()
            .filter(|k| k.is_alive() && k.id().same_client_as(&surface.wl_surface.id()))
        {
            wl_keyboard.modifiers(serial, depressed, latched, locked, group);
        }
    }

    pub fn set_keyboard_focus(&mut self, focus: Option<SurfaceKey>) {
        if self.seat.keyboard.focus == focus {
            return;
        }

        if let Some(old) = self.seat.keyboard.focus.take() {
            if let Some(surface) = self.surfaces.get(old) {
                let serial = self.serial.next();
                for wl_keyboard in self
                    .seat
                    .keyboard
                    .resources
                    .iter()
                    .filter(|k| k.is_alive() && k.id().same_client_as(&surface.wl_surface.id()))
                {
                    wl_keyboard.leave(serial, &surface.wl_surface);
                }
            }
        }

        self.seat.keyboard.focus = focus;

        if let Some(new) = focus {
            let Some(surface) = self.surfaces.get(new) else {
                self.seat.keyboard.focus = None;
                return;
            };

            debug!(surface = ?surface, "keyboard focus");

            let keys: Vec<u8> = self
                .seat
                .keyboard
                .pressed
                .codes()
                .flat_map(|code| (code as u32).to_ne_bytes())
                .collect();

            let serial = self.serial.next();
            let (depressed, latched, locked, group) = self.seat.keyboard.xkb.serialize();

            for wl_keyboard in self
                .seat
                .keyboard
                .resources
                .iter()
                .filter(|k| k.is_alive() && k.id().same_client_as(&surface.wl_surface.id()))
            {
                wl_keyboard.enter(serial, &surface.wl_surface, keys.clone());
                wl_keyboard.modifiers(serial, depressed, latched, locked, group);
            }

            // The newly focused client learns about the current selection.
            if let Some(client) = surface.wl_surface.client() {
                self.offer_selection_to(client.id());
            }
        }
    }

    /// Marks a toplevel active (and everything else inactive) and assigns
    /// keyboard focus.
    pub fn activate_toplevel(&mut self, key: Option<SurfaceKey>) {
        let toplevels: Vec<SurfaceKey> = self
            .surfaces
            .iter()
            .filter(|(_, s)| s.addons.toplevel.is_some())
            .map(|(k, _)| k)
            .collect();

        for toplevel_key in toplevels {
            let activated = Some(toplevel_key) == key;
            if let Some(toplevel) = self.surfaces[toplevel_key].addons.toplevel.as_mut() {
                if toplevel.initial_configure_sent {
                    toplevel.set_state(xdg_toplevel::State::Activated, activated);
                }
            }
            self.flush_toplevel_configure(toplevel_key);
        }

        self.set_keyboard_focus(key);
    }

    /// Unlinks a dying surface from focus, grabs, and cursor state.
    pub fn seat_surface_gone(&mut self, key: SurfaceKey) {
        if self.seat.pointer.focus == Some(key) {
            self.seat.pointer.focus = None;
        }
        if self.seat.pointer.implicit_grab == Some(key) {
            self.seat.pointer.implicit_grab = None;
        }
        if self.seat.keyboard.focus == Some(key) {
            self.seat.keyboard.focus = None;
        }

        self.cursor.surface_gone(key);

        match &self.interaction {
            Interaction::Move { toplevel, .. } | Interaction::Resize { toplevel, .. }
                if *toplevel == key =>
            {
                self.interaction = Interaction::Normal;
            }
            _ => (),
        }
    }

    /// xdg_toplevel.move: only honored while the left button is down.
    pub fn begin_move(&mut self, key: SurfaceKey) {
        if !self.seat.pointer.pressed.contains(evdev::BTN_LEFT) {
            warn!("move requested without a pressed button");
            return;
        }

        let Some(anchor) = self
            .surfaces
            .get(key)
            .and_then(|s| s.addons.xdg.as_ref())
            .map(|xdg| xdg.anchor_position)
        else {
            return;
        };

        self.interaction = Interaction::Move {
            toplevel: key,
            pointer_grab: self.seat.pointer.position,
            anchor_grab: anchor,
        };
    }

    /// xdg_toplevel.resize: re-anchors so the edge opposite the grabbed
    /// one stays fixed, then tracks the pointer.
    pub fn begin_resize(&mut self, key: SurfaceKey, edges: xdg_toplevel::ResizeEdge) {
        if !self.seat.pointer.pressed.contains(evdev::BTN_LEFT) {
            warn!("resize requested without a pressed button");
            return;
        }

        use xdg_toplevel::ResizeEdge;
        let anchor_rel = match edges {
            ResizeEdge::None => return,
            ResizeEdge::Top => DVec2::new(0.5, 1.0),
            ResizeEdge::Bottom => DVec2::new(0.5, 0.0),
            ResizeEdge::Left => DVec2::new(1.0, 0.5),
            ResizeEdge::Right => DVec2::new(0.0, 0.5),
            ResizeEdge::TopLeft => DVec2::new(1.0, 1.0),
            ResizeEdge::TopRight => DVec2::new(0.0, 1.0),
            ResizeEdge::BottomLeft => DVec2::new(1.0, 0.0),
            ResizeEdge::BottomRight => DVec2::new(0.0, 0.0),
            _ => return,
        };

        let geometry = xdg::effective_geometry(self, key);
        let size = geometry.size.as_dvec2();

        let Some(xdg) = self
            .surfaces
            .get_mut(key)
            .and_then(|s| s.addons.xdg.as_mut())
        else {
            return;
        };

        // Shift the anchor point so the new relative anchor describes the
        // same global position.
        xdg.anchor_position += (anchor_rel - xdg.anchor_relative) * size;
        xdg.anchor_relative = anchor_rel;

        self.interaction = Interaction::Resize {
            toplevel: key,
            pointer_grab: self.seat.pointer.position,
            size_grab: size,
        };
    }
}

fn send_axis_discrete(pointer: &wl_pointer::WlPointer, axis: wl_pointer::Axis, value: f64) {
    if value == 0.0 {
        return;
    }

    let version = pointer.version();
    if (5..8).contains(&version) {
        pointer.axis_discrete(axis, value.trunc() as i32);
    } else if version >= 8 {
        pointer.axis_value120(axis, (value * 120.0).round() as i32);
    }
}
