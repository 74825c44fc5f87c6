use glam::DVec2;
use tracing::debug;
use wayland_protocols::wp::pointer_constraints::zv1::server::{
    zwp_confined_pointer_v1, zwp_locked_pointer_v1,
};

use crate::{
    compositor::{queue::StateQueue, surface::CommitId, surface::SurfaceKey, State},
    geom::Region,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Motion is suppressed entirely; the client may supply a position
    /// hint for when the lock ends.
    Locked,
    /// Motion is clamped to a region in surface coordinates.
    Confined,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConstraintLifetime {
    /// Deactivates permanently the first time it deactivates.
    Oneshot,
    /// May reactivate whenever focus returns inside the region.
    Persistent,
}

pub enum ConstraintResource {
    Locked(zwp_locked_pointer_v1::ZwpLockedPointerV1),
    Confined(zwp_confined_pointer_v1::ZwpConfinedPointerV1),
}

#[derive(Debug, Default, Clone)]
pub struct ConstraintState {
    /// None confines to the whole surface input region.
    pub region: Option<Region>,
    pub position_hint: Option<DVec2>,
}

/// The pointer-constraint surface addon (one per surface).
pub struct ConstraintAddon {
    pub resource: ConstraintResource,
    pub kind: ConstraintKind,
    pub lifetime: ConstraintLifetime,

    pub state: StateQueue<ConstraintState>,

    pub active: bool,
    /// A oneshot constraint that has deactivated can never activate again.
    pub spent: bool,
}

impl ConstraintAddon {
    pub fn commit(&mut self, id: CommitId) {
        self.state.commit(id);
    }

    pub fn apply(&mut self, id: CommitId) {
        self.state.apply(id);
    }

    fn send_activated(&self) {
        match &self.resource {
            ConstraintResource::Locked(locked) => locked.locked(),
            ConstraintResource::Confined(confined) => confined.confined(),
        }
    }

    fn send_deactivated(&self) {
        match &self.resource {
            ConstraintResource::Locked(locked) => locked.unlocked(),
            ConstraintResource::Confined(confined) => confined.unconfined(),
        }
    }

    /// Whether a point (in surface coordinates) is inside the committed
    /// constraint region.
    pub fn region_contains(&self, point: DVec2) -> bool {
        match &self.state.current.region {
            Some(region) => region.contains(point.floor().as_ivec2()),
            None => true,
        }
    }
}

impl State {
    /// Re-evaluates constraint activation against the current pointer
    /// focus. Runs in the idle pass and after focus changes.
    pub fn update_constraints(&mut self) {
        let focus = self.seat.pointer.focus;
        let position = self.seat.pointer.position;

        let keys: Vec<SurfaceKey> = self
            .surfaces
            .iter()
            .filter(|(_, surface)| surface.addons.constraint.is_some())
            .map(|(key, _)| key)
            .collect();

        for key in keys {
            let local = self.surface_pos_from_global(key, position);
            let surface = &mut self.surfaces[key];
            let Some(constraint) = surface.addons.constraint.as_mut() else {
                continue;
            };

            let should_activate = !constraint.spent
                && focus == Some(key)
                && constraint.region_contains(local);

            if should_activate && !constraint.active {
                debug!(?key, "activating pointer constraint");
                constraint.active = true;
                constraint.send_activated();
            } else if !should_activate && constraint.active {
                debug!(?key, "deactivating pointer constraint");
                constraint.active = false;
                constraint.send_deactivated();
                if constraint.lifetime == ConstraintLifetime::Oneshot {
                    constraint.spent = true;
                }
            }
        }
    }

    /// Applies the active constraint to a proposed pointer position,
    /// returning the constrained global position.
    pub fn constrain_pointer(&self, current: DVec2, proposed: DVec2) -> DVec2 {
        let Some(focus) = self.seat.pointer.focus else {
            return proposed;
        };

        let Some(constraint) = self
            .surfaces
            .get(focus)
            .and_then(|s| s.addons.constraint.as_ref())
        else {
            return proposed;
        };

        if !constraint.active {
            return proposed;
        }

        match constraint.kind {
            ConstraintKind::Locked => current,
            ConstraintKind::Confined => {
                let local = self.surface_pos_from_global(focus, proposed);
                let clamped = match &constraint.state.current.region {
                    Some(region) => region.clamp_point(local),
                    None => {
                        let dst = self.surfaces[focus].buffer_dst.as_frect();
                        dst.clamp_point(local)
                    }
                };

                self.surface_pos_to_global(focus, clamped)
            }
        }
    }
}
