use glam::{DVec2, IVec2};
use tracing::{debug, trace, warn};
use wayland_protocols::xdg::shell::server::{xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel};
use wayland_server::Resource as _;

use crate::{
    compositor::{
        output::OutputKey,
        queue::StateQueue,
        surface::{CommitId, SurfaceKey},
        State,
    },
    geom::{AxisRegion, FRect, Rect},
};

#[derive(Debug, Default, Clone)]
pub struct XdgSurfaceState {
    pub geometry: Option<Rect>,
    pub acked_serial: u32,
}

/// The xdg_surface addon: window geometry plus configure serial tracking.
/// Wraps a surface that will additionally take the toplevel or popup role.
pub struct XdgSurfaceAddon {
    pub resource: xdg_surface::XdgSurface,
    pub state: StateQueue<XdgSurfaceState>,

    pub sent_serial: u32,

    /// Where the window sits in the global space: the geometry rect is
    /// placed so that `anchor_position` lines up with the fraction
    /// `anchor_relative` of its extent. Resizing from an edge re-anchors
    /// so the opposite edge stays put.
    pub anchor_position: DVec2,
    pub anchor_relative: DVec2,
}

impl XdgSurfaceAddon {
    pub fn new(resource: xdg_surface::XdgSurface) -> Self {
        Self {
            resource,
            state: StateQueue::default(),
            sent_serial: 0,
            anchor_position: DVec2::new(60.0, 60.0),
            anchor_relative: DVec2::ZERO,
        }
    }

    pub fn commit(&mut self, id: CommitId) {
        self.state.commit(id);
    }

    pub fn apply(&mut self, id: CommitId) {
        self.state.apply(id);
    }

    /// Configure debounce: nothing new is sent while an earlier configure
    /// awaits its ack.
    pub fn awaiting_ack(&self) -> bool {
        self.sent_serial != 0 && self.state.current.acked_serial < self.sent_serial
    }
}

#[derive(Debug, Default, Clone)]
pub struct ToplevelState {
    pub title: Option<String>,
    pub app_id: Option<String>,
}

const CONFIGURE_BOUNDS: u8 = 1 << 0;
const CONFIGURE_SIZE: u8 = 1 << 1;
const CONFIGURE_STATES: u8 = 1 << 2;

/// Compositor-to-client configure state accumulated between flushes.
#[derive(Debug, Default)]
pub struct ToplevelConfigure {
    pub bounds: IVec2,
    pub size: IVec2,
    pub states: Vec<xdg_toplevel::State>,
    pub pending: u8,
}

pub struct ToplevelAddon {
    pub resource: xdg_toplevel::XdgToplevel,
    pub state: StateQueue<ToplevelState>,

    pub initial_configure_sent: bool,
    pub initial_size_received: bool,

    pub configure: ToplevelConfigure,

    pub min_size: IVec2,
    pub max_size: IVec2,

    /// Compositor-imposed size in layout space; None tracks the client
    /// geometry 1:1.
    pub layout_size: Option<DVec2>,

    pub fullscreen_output: Option<OutputKey>,
    pub fullscreen_prev_size: IVec2,
}

impl ToplevelAddon {
    pub fn new(resource: xdg_toplevel::XdgToplevel) -> Self {
        Self {
            resource,
            state: StateQueue::default(),
            initial_configure_sent: false,
            initial_size_received: false,
            configure: ToplevelConfigure::default(),
            min_size: IVec2::ZERO,
            max_size: IVec2::ZERO,
            layout_size: None,
            fullscreen_output: None,
            fullscreen_prev_size: IVec2::ZERO,
        }
    }

    pub fn commit(&mut self, id: CommitId) {
        self.state.commit(id);
    }

    pub fn apply(&mut self, id: CommitId) {
        self.state.apply(id);
    }

    pub fn set_size(&mut self, size: IVec2) {
        if self.configure.size == size && self.initial_configure_sent {
            return;
        }
        self.configure.size = size;
        self.configure.pending |= CONFIGURE_SIZE;
    }

    pub fn set_bounds(&mut self, bounds: IVec2) {
        self.configure.bounds = bounds;
        self.configure.pending |= CONFIGURE_BOUNDS;
    }

    pub fn set_state(&mut self, state: xdg_toplevel::State, enabled: bool) {
        if enabled {
            if !self.configure.states.contains(&state) {
                self.configure.states.push(state);
                self.configure.pending |= CONFIGURE_STATES;
            }
        } else if let Some(index) = self.configure.states.iter().position(|s| *s == state) {
            self.configure.states.remove(index);
            self.configure.pending |= CONFIGURE_STATES;
        }
    }
}

/// Immutable placement rules captured from an xdg_positioner.
#[derive(Debug, Clone)]
pub struct PositionerRules {
    pub size: IVec2,
    pub anchor_rect: Rect,
    pub anchor: xdg_positioner::Anchor,
    pub gravity: xdg_positioner::Gravity,
    pub adjustment: xdg_positioner::ConstraintAdjustment,
    pub offset: IVec2,
    pub reactive: bool,
    pub parent_size: IVec2,
    pub parent_configure: u32,
}

impl Default for PositionerRules {
    fn default() -> Self {
        Self {
            size: IVec2::ZERO,
            anchor_rect: Rect::default(),
            anchor: xdg_positioner::Anchor::None,
            gravity: xdg_positioner::Gravity::None,
            adjustment: xdg_positioner::ConstraintAdjustment::empty(),
            offset: IVec2::ZERO,
            reactive: false,
            parent_size: IVec2::ZERO,
            parent_configure: 0,
        }
    }
}

pub struct PopupAddon {
    pub resource: xdg_popup::XdgPopup,
    pub positioner: PositionerRules,
    pub reposition_token: Option<u32>,

    pub parent: Option<SurfaceKey>,
    pub root_toplevel: Option<SurfaceKey>,

    pub initial_configure_sent: bool,
    pub grab: bool,

    /// Computed placement, relative to the parent surface origin.
    pub position: IVec2,
}

impl PopupAddon {
    pub fn new(resource: xdg_popup::XdgPopup, positioner: PositionerRules) -> Self {
        Self {
            resource,
            positioner,
            reposition_token: None,
            parent: None,
            root_toplevel: None,
            initial_configure_sent: false,
            grab: false,
            position: IVec2::ZERO,
        }
    }
}

/// Maps anchor/gravity edge selections to a relative factor of an extent:
/// 0 for the near edge, extent for the far edge, extent/2 for center.
fn anchor_to_rel(anchor: xdg_positioner::Anchor, rel: IVec2) -> IVec2 {
    use xdg_positioner::Anchor;
    match anchor {
        Anchor::None => IVec2::new(rel.x / 2, rel.y / 2),
        Anchor::Top => IVec2::new(rel.x / 2, 0),
        Anchor::Bottom => IVec2::new(rel.x / 2, rel.y),
        Anchor::Left => IVec2::new(0, rel.y / 2),
        Anchor::Right => IVec2::new(rel.x, rel.y / 2),
        Anchor::TopLeft => IVec2::new(0, 0),
        Anchor::TopRight => IVec2::new(rel.x, 0),
        Anchor::BottomLeft => IVec2::new(0, rel.y),
        Anchor::BottomRight => IVec2::new(rel.x, rel.y),
        _ => IVec2::new(rel.x / 2, rel.y / 2),
    }
}

fn gravity_to_rel(gravity: xdg_positioner::Gravity, rel: IVec2) -> IVec2 {
    use xdg_positioner::Gravity;
    match gravity {
        Gravity::None => IVec2::new(rel.x / 2, rel.y / 2),
        Gravity::Top => IVec2::new(rel.x / 2, 0),
        Gravity::Bottom => IVec2::new(rel.x / 2, rel.y),
        Gravity::Left => IVec2::new(0, rel.y / 2),
        Gravity::Right => IVec2::new(rel.x, rel.y / 2),
        Gravity::TopLeft => IVec2::new(0, 0),
        Gravity::TopRight => IVec2::new(rel.x, 0),
        Gravity::BottomLeft => IVec2::new(0, rel.y),
        Gravity::BottomRight => IVec2::new(rel.x, rel.y),
        _ => IVec2::new(rel.x / 2, rel.y / 2),
    }
}

struct AxisRules {
    anchor: AxisRegion,
    size: i32,
    gravity: i32,
    flip: bool,
    slide: bool,
    resize: bool,
}

#[derive(Debug, Copy, Clone)]
struct AxisOverlaps {
    start: i32,
    end: i32,
}

/// One axis of the popup placement algorithm. The region starts at the
/// anchor point offset by the gravity, then flip, slide, and resize
/// adjustments are tried in that order until it fits the constraint.
fn apply_axis(rules: &AxisRules, constraint: AxisRegion) -> AxisRegion {
    fn position(rules: &AxisRules) -> AxisRegion {
        AxisRegion::new(rules.anchor.pos + rules.gravity - rules.size, rules.size)
    }

    fn overlaps(region: AxisRegion, constraint: AxisRegion) -> AxisOverlaps {
        AxisOverlaps {
            start: constraint.pos - region.pos,
            end: region.end() - constraint.end(),
        }
    }

    fn unconstrained(region: AxisRegion, constraint: AxisRegion) -> bool {
        let o = overlaps(region, constraint);
        o.start <= 0 && o.end <= 0
    }

    let mut region = position(rules);
    if unconstrained(region, constraint) {
        return region;
    }

    if rules.flip {
        let flipped_rules = AxisRules {
            anchor: AxisRegion::new(rules.anchor.size - rules.anchor.pos, rules.anchor.size),
            size: rules.size,
            gravity: rules.size - rules.gravity,
            flip: false,
            slide: false,
            resize: false,
        };

        let flipped = position(&flipped_rules);
        if unconstrained(flipped, constraint) {
            return flipped;
        }
    }

    if rules.slide {
        let o = overlaps(region, constraint);
        if o.start > 0 && o.end > 0 {
            // Out of bounds on both sides: move along the gravity direction
            // until the opposite edge is in bounds.
            if rules.gravity == rules.size {
                region.pos += o.start;
            } else if rules.gravity == 0 {
                region.pos -= o.end;
            }
        } else if o.start > 0 {
            // Slide forward, at most until the far edge would leave.
            region.pos += o.start.min(-o.end);
        } else if o.end > 0 {
            region.pos -= o.end.min(-o.start);
        }

        if unconstrained(region, constraint) {
            return region;
        }
    }

    if rules.resize {
        let o = overlaps(region, constraint);
        if o.start > 0 && o.end > 0 {
            region = constraint;
        } else if o.start > 0 && o.start < region.size {
            region.pos += o.start;
            region.size -= o.start;
        } else if o.end > 0 && o.end < region.size {
            region.size -= o.end;
        }
    }

    // Best effort.
    region
}

/// Computes the popup placement rect from positioner rules, constrained to
/// `constraint` (both in the parent's surface coordinate space).
pub fn apply_positioner(rules: &PositionerRules, constraint: Rect) -> Rect {
    use xdg_positioner::ConstraintAdjustment as Adj;

    let anchor = anchor_to_rel(rules.anchor, rules.anchor_rect.size);
    let gravity = gravity_to_rel(rules.gravity, rules.size);

    let mut target = Rect::default();
    for axis in 0..2 {
        let (anchor_pos, anchor_size, size, gravity_rel, flip, slide, resize) = if axis == 0 {
            (
                anchor.x,
                rules.anchor_rect.size.x,
                rules.size.x,
                gravity.x,
                rules.adjustment.contains(Adj::FlipX),
                rules.adjustment.contains(Adj::SlideX),
                rules.adjustment.contains(Adj::ResizeX),
            )
        } else {
            (
                anchor.y,
                rules.anchor_rect.size.y,
                rules.size.y,
                gravity.y,
                rules.adjustment.contains(Adj::FlipY),
                rules.adjustment.contains(Adj::SlideY),
                rules.adjustment.contains(Adj::ResizeY),
            )
        };

        let axis_rules = AxisRules {
            anchor: AxisRegion::new(anchor_pos, anchor_size),
            size,
            gravity: gravity_rel,
            flip,
            slide,
            resize,
        };

        // The whole region is shifted by the anchor rect origin plus the
        // explicit offset; the constraint moves into that space and the
        // result moves back out.
        let offset = if axis == 0 {
            rules.anchor_rect.pos.x + rules.offset.x
        } else {
            rules.anchor_rect.pos.y + rules.offset.y
        };

        let constraint_region = if axis == 0 {
            AxisRegion::new(constraint.pos.x - offset, constraint.size.x)
        } else {
            AxisRegion::new(constraint.pos.y - offset, constraint.size.y)
        };

        let region = apply_axis(&axis_rules, constraint_region);
        if axis == 0 {
            target.pos.x = region.pos + offset;
            target.size.x = region.size;
        } else {
            target.pos.y = region.pos + offset;
            target.size.y = region.size;
        }
    }

    target
}

/// The window geometry: explicitly set, or the bounding box of the surface
/// tree when the client never set one.
pub fn effective_geometry(state: &State, key: SurfaceKey) -> Rect {
    let Some(surface) = state.surfaces.get(key) else {
        return Rect::default();
    };

    surface
        .addons
        .xdg
        .as_ref()
        .and_then(|xdg| xdg.state.current.geometry)
        .unwrap_or_else(|| state.tree_bounds(key))
}

/// The toplevel's geometry rect in global layout coordinates.
pub fn toplevel_layout_rect(state: &State, key: SurfaceKey) -> FRect {
    let geometry = effective_geometry(state, key);

    let Some(surface) = state.surfaces.get(key) else {
        return FRect::default();
    };
    let Some(toplevel) = surface.addons.toplevel.as_ref() else {
        return FRect::default();
    };

    if let Some(output) = toplevel
        .fullscreen_output
        .and_then(|key| state.outputs.get(key))
    {
        return output.layout_rect;
    }

    let Some(xdg) = surface.addons.xdg.as_ref() else {
        return FRect::default();
    };

    let extent = toplevel
        .layout_size
        .unwrap_or_else(|| geometry.size.as_dvec2());
    let pos = xdg.anchor_position - extent * xdg.anchor_relative;
    FRect::from_pos_size(pos, extent)
}

/// Coordinate space of a toplevel surface: where its surface origin lands
/// globally, and the layout scale applied to it.
pub fn toplevel_coord_space(state: &State, key: SurfaceKey) -> (DVec2, DVec2) {
    let geometry = effective_geometry(state, key);
    let layout = toplevel_layout_rect(state, key);

    let scale = if geometry.size.x > 0 && geometry.size.y > 0 {
        layout.size / geometry.size.as_dvec2()
    } else {
        DVec2::ONE
    };

    (layout.pos - geometry.pos.as_dvec2() * scale, scale)
}

impl State {
    /// Sends any pending toplevel configure, respecting the ack debounce.
    pub fn flush_toplevel_configure(&mut self, key: SurfaceKey) {
        let Some(surface) = self.surfaces.get_mut(key) else {
            return;
        };
        let (Some(xdg), Some(toplevel)) =
            (surface.addons.xdg.as_ref(), surface.addons.toplevel.as_mut())
        else {
            return;
        };

        if toplevel.configure.pending == 0 {
            return;
        }

        if xdg.awaiting_ack() {
            debug!(?key, "waiting for ack before reconfiguring");
            return;
        }

        if toplevel.configure.pending & CONFIGURE_BOUNDS != 0 && toplevel.resource.version() >= 4 {
            let bounds = toplevel.configure.bounds;
            toplevel.resource.configure_bounds(bounds.x, bounds.y);
        }

        let size = toplevel.configure.size;
        let raw_states = toplevel
            .configure
            .states
            .iter()
            .flat_map(|st| {
                let v: u32 = (*st).into();
                v.to_ne_bytes()
            })
            .collect::<Vec<u8>>();

        toplevel.resource.configure(size.x, size.y, raw_states);
        toplevel.configure.pending = 0;

        let serial = self.serial.next();
        let xdg = self.surfaces[key].addons.xdg.as_mut().unwrap();
        xdg.resource.configure(serial);
        xdg.sent_serial = serial;

        trace!(surface = ?self.surfaces[key], serial, "sent configure");
    }

    /// Idle pass: retries configures that were debounced on an unacked
    /// serial.
    pub fn flush_configures(&mut self) {
        let keys: Vec<SurfaceKey> = self
            .surfaces
            .iter()
            .filter(|(_, surface)| {
                surface
                    .addons
                    .toplevel
                    .as_ref()
                    .is_some_and(|t| t.configure.pending != 0 && t.initial_configure_sent)
            })
            .map(|(key, _)| key)
            .collect();

        for key in keys {
            self.flush_toplevel_configure(key);
        }
    }

    pub fn toplevel_set_fullscreen(&mut self, key: SurfaceKey, output: Option<OutputKey>) {
        let prev_rect = toplevel_layout_rect(self, key);

        let Some(surface) = self.surfaces.get_mut(key) else {
            return;
        };
        let Some(toplevel) = surface.addons.toplevel.as_mut() else {
            return;
        };

        toplevel.set_state(xdg_toplevel::State::Fullscreen, output.is_some());

        if output.is_some() && toplevel.fullscreen_output.is_none() {
            toplevel.fullscreen_prev_size = prev_rect.size.round().as_ivec2();
        }

        if toplevel.fullscreen_output.is_some() && output.is_none() {
            // Restore the size from before fullscreen.
            let size = toplevel.fullscreen_prev_size;
            if size.x > 0 && size.y > 0 {
                toplevel.set_size(size);
            }
        }

        toplevel.fullscreen_output = output;

        if let Some(output) = output.and_then(|key| self.outputs.get(key)) {
            let size = output.layout_rect.size.round().as_ivec2();
            let toplevel = self.surfaces[key].addons.toplevel.as_mut().unwrap();
            toplevel.set_size(size);
        }

        self.flush_toplevel_configure(key);
    }

    /// Compositor-requested close.
    pub fn toplevel_close(&mut self, key: SurfaceKey) {
        if let Some(toplevel) = self
            .surfaces
            .get(key)
            .and_then(|s| s.addons.toplevel.as_ref())
        {
            toplevel.resource.close();
        }
    }

    /// Recomputes a popup's placement and emits repositioned/configure.
    pub fn popup_position(&mut self, key: SurfaceKey) {
        let Some(surface) = self.surfaces.get(key) else {
            return;
        };
        let Some(popup) = surface.addons.popup.as_ref() else {
            return;
        };
        let Some(parent) = popup.parent else {
            warn!(surface = ?surface, "popup has no parent, cannot configure");
            return;
        };

        let rules = popup.positioner.clone();

        // Constrain to the output containing the anchor, translated into
        // the parent's surface coordinate space.
        let anchor_global =
            self.surface_pos_to_global(parent, rules.anchor_rect.pos.as_dvec2());
        let (_, output) = self.layout.clamp_position(&self.outputs, anchor_global);

        let constraint = match output.and_then(|key| self.outputs.get(key)) {
            Some(output) => {
                let rect = output.layout_rect;
                let min = self.surface_pos_from_global(parent, rect.min());
                let max = self.surface_pos_from_global(parent, rect.max());
                Rect::from_min_max(min.floor().as_ivec2(), max.ceil().as_ivec2())
            }
            None => Rect::from_pos_size(rules.anchor_rect.pos, rules.size.max(IVec2::ONE)),
        };

        let geometry = apply_positioner(&rules, constraint);

        let surface = &mut self.surfaces[key];
        let popup = surface.addons.popup.as_mut().unwrap();
        popup.position = geometry.pos;

        if let Some(token) = popup.reposition_token.take() {
            popup.resource.repositioned(token);
        }

        popup
            .resource
            .configure(geometry.pos.x, geometry.pos.y, geometry.size.x, geometry.size.y);

        let serial = self.serial.next();
        if let Some(xdg) = self.surfaces[key].addons.xdg.as_mut() {
            xdg.resource.configure(serial);
            xdg.sent_serial = serial;
        }
    }

    /// A grabbing popup is dismissed when a button press lands outside its
    /// surface tree.
    pub fn dismiss_grabbing_popups(&mut self, press_target: Option<SurfaceKey>) {
        let grabbing: Vec<SurfaceKey> = self
            .surfaces
            .iter()
            .filter(|(_, surface)| {
                surface.mapped
                    && surface.addons.popup.as_ref().is_some_and(|popup| popup.grab)
            })
            .map(|(key, _)| key)
            .collect();

        for key in grabbing {
            let inside = press_target.is_some_and(|target| {
                let mut cursor = Some(self.subsurface_root(target));
                while let Some(current) = cursor {
                    if current == key {
                        return true;
                    }
                    cursor = self
                        .surfaces
                        .get(current)
                        .and_then(|s| s.addons.popup.as_ref())
                        .and_then(|p| p.parent);
                }
                false
            });

            if !inside {
                debug!(surface = ?self.surfaces[key], "dismissing grabbing popup");
                if let Some(popup) = self.surfaces[key].addons.popup.as_ref() {
                    popup.resource.popup_done();
                }
                self.surfaces_z.retain(|k| *k != key);
            }
        }
    }
}

/// Role-addon commit side effects: initial configures and size
/// negotiation. Runs right after the surface freezes a packet.
pub fn handle_commit(state: &mut State, key: SurfaceKey, _id: CommitId) {
    let Some(surface) = state.surfaces.get(key) else {
        return;
    };

    if surface.addons.toplevel.is_some() {
        let first = {
            let toplevel = state.surfaces[key].addons.toplevel.as_mut().unwrap();
            if toplevel.initial_configure_sent {
                false
            } else {
                toplevel.initial_configure_sent = true;
                toplevel.set_size(IVec2::ZERO);
                toplevel.set_state(xdg_toplevel::State::Activated, true);

                if toplevel.resource.version() >= 5 {
                    let caps: u32 = xdg_toplevel::WmCapabilities::Fullscreen.into();
                    toplevel.resource.wm_capabilities(caps.to_ne_bytes().to_vec());
                }

                true
            }
        };

        if first {
            state.flush_toplevel_configure(key);
            return;
        }

        let negotiate_size = {
            let toplevel = state.surfaces[key].addons.toplevel.as_mut().unwrap();
            if toplevel.initial_size_received {
                false
            } else {
                toplevel.initial_size_received = true;
                true
            }
        };

        if negotiate_size {
            let geometry = effective_geometry(state, key);
            debug!(?geometry, "initial surface size");

            if geometry.size.x > 0 && geometry.size.y > 0 {
                let toplevel = state.surfaces[key].addons.toplevel.as_mut().unwrap();
                toplevel.set_size(geometry.size);
            }
        }

        state.flush_toplevel_configure(key);
        return;
    }

    let popup_first = state.surfaces[key]
        .addons
        .popup
        .as_mut()
        .map(|popup| {
            if popup.initial_configure_sent {
                false
            } else {
                popup.initial_configure_sent = true;
                true
            }
        })
        .unwrap_or(false);

    if popup_first {
        state.popup_position(key);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use xdg_positioner::{Anchor, ConstraintAdjustment, Gravity};

    use super::*;

    fn rules(
        size: (i32, i32),
        anchor_rect: Rect,
        anchor: Anchor,
        gravity: Gravity,
        adjustment: ConstraintAdjustment,
    ) -> PositionerRules {
        PositionerRules {
            size: IVec2::new(size.0, size.1),
            anchor_rect,
            anchor,
            gravity,
            adjustment,
            ..PositionerRules::default()
        }
    }

    const ALL_EDGES: [Anchor; 9] = [
        Anchor::None,
        Anchor::Top,
        Anchor::Bottom,
        Anchor::Left,
        Anchor::Right,
        Anchor::TopLeft,
        Anchor::TopRight,
        Anchor::BottomLeft,
        Anchor::BottomRight,
    ];

    const ALL_GRAVITIES: [Gravity; 9] = [
        Gravity::None,
        Gravity::Top,
        Gravity::Bottom,
        Gravity::Left,
        Gravity::Right,
        Gravity::TopLeft,
        Gravity::TopRight,
        Gravity::BottomLeft,
        Gravity::BottomRight,
    ];

    /// With an unconstrained (giant) constraint rect, every adjustment
    /// combination yields the plain anchor+gravity placement.
    #[test]
    fn unconstrained_placement_ignores_adjustments() {
        let anchor_rect = Rect::from_xywh(10, 20, 100, 40);
        let size = IVec2::new(30, 50);
        let giant = Rect::from_xywh(-100_000, -100_000, 200_000, 200_000);

        let adjustments = [
            ConstraintAdjustment::empty(),
            ConstraintAdjustment::FlipX | ConstraintAdjustment::FlipY,
            ConstraintAdjustment::SlideX | ConstraintAdjustment::SlideY,
            ConstraintAdjustment::ResizeX | ConstraintAdjustment::ResizeY,
            ConstraintAdjustment::all(),
        ];

        for anchor in ALL_EDGES {
            for gravity in ALL_GRAVITIES {
                let mut expected = None;
                for adjustment in adjustments {
                    let mut rules = rules(
                        (size.x, size.y),
                        anchor_rect,
                        anchor,
                        gravity,
                        adjustment,
                    );
                    rules.offset = IVec2::new(7, -3);

                    let anchor_rel = anchor_to_rel(anchor, anchor_rect.size);
                    let gravity_rel = gravity_to_rel(gravity, size);
                    let unadjusted = Rect::from_pos_size(
                        anchor_rect.pos + rules.offset + anchor_rel + gravity_rel - size,
                        size,
                    );

                    let result = apply_positioner(&rules, giant);
                    assert_eq!(result, unadjusted, "{anchor:?} {gravity:?} {adjustment:?}");

                    // Identical across all adjustment combinations.
                    match expected {
                        None => expected = Some(result),
                        Some(prior) => assert_eq!(result, prior),
                    }
                }
            }
        }
    }

    /// Bottom-anchored, bottom-gravity popup that is taller than the
    /// constraint: slide pins it at the constraint start, and resize then
    /// clips it to the constraint.
    #[test]
    fn slide_pins_and_resize_clips() {
        let anchor_rect = Rect::from_xywh(0, 0, 100, 20);
        let constraint = Rect::from_xywh(0, 0, 200, 30);

        let slide_only = rules(
            (80, 120),
            anchor_rect,
            Anchor::Bottom,
            Gravity::Bottom,
            ConstraintAdjustment::SlideY,
        );
        let result = apply_positioner(&slide_only, constraint);
        // The popup would start at y=20 (the anchor edge); sliding it up as
        // far as the constraint allows pins it at y=0. The overflow past
        // y=30 remains for the renderer to clip.
        assert_eq!(result.pos.y, 0);
        assert_eq!(result.size.y, 120);
        // The x axis is untouched: centered on the anchor rect.
        assert_eq!(result.pos.x, 50 + 40 - 80);
        assert_eq!(result.size.x, 80);

        let slide_resize = rules(
            (80, 120),
            anchor_rect,
            Anchor::Bottom,
            Gravity::Bottom,
            ConstraintAdjustment::SlideY | ConstraintAdjustment::ResizeY,
        );
        let result = apply_positioner(&slide_resize, constraint);
        assert_eq!(result.pos.y, 0);
        assert_eq!(result.size.y, 30);
    }

    #[test]
    fn flip_mirrors_when_it_fits() {
        // A popup growing downward out of the constraint flips upward.
        let anchor_rect = Rect::from_xywh(0, 80, 20, 20);
        let constraint = Rect::from_xywh(0, 0, 200, 110);

        let flip = rules(
            (40, 40),
            anchor_rect,
            Anchor::Bottom,
            Gravity::Bottom,
            ConstraintAdjustment::FlipY,
        );

        let result = apply_positioner(&flip, constraint);
        // Flipped: anchored to the top edge, growing upward from y=80.
        assert_eq!(result.pos.y, 40);
        assert_eq!(result.size.y, 40);
    }

    #[test]
    fn resize_clips_overflowing_side() {
        let anchor_rect = Rect::from_xywh(0, 0, 10, 10);
        let constraint = Rect::from_xywh(0, 0, 100, 25);

        let resize = rules(
            (40, 40),
            anchor_rect,
            Anchor::Bottom,
            Gravity::Bottom,
            ConstraintAdjustment::ResizeY,
        );

        let result = apply_positioner(&resize, constraint);
        assert_eq!(result.pos.y, 10);
        assert_eq!(result.size.y, 15);
    }
}
