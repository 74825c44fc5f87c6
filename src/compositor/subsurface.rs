use glam::IVec2;
use tracing::warn;
use wayland_server::protocol::wl_subsurface;

use crate::compositor::{
    surface::{StackEntry, SurfaceKey},
    State,
};

/// The wl_subsurface role addon. Position and z-order live on the parent's
/// stack (pending until the parent commits); the only state here is the
/// sync mode and the parent link.
pub struct SubsurfaceAddon {
    pub resource: wl_subsurface::WlSubsurface,
    pub parent: SurfaceKey,
    pub synchronized: bool,
}

impl State {
    /// Attaches a subsurface to the top of its parent's pending stack.
    pub fn subsurface_created(&mut self, key: SurfaceKey, parent: SurfaceKey) {
        let Some(parent_surface) = self.surfaces.get_mut(parent) else {
            return;
        };

        parent_surface.pending_stack.push(StackEntry {
            surface: key,
            position: IVec2::ZERO,
        });
        parent_surface.stack_dirty = true;
    }

    /// Updates this subsurface's position on the parent's pending stack.
    pub fn subsurface_set_position(&mut self, key: SurfaceKey, position: IVec2) {
        let Some(parent) = self
            .surfaces
            .get(key)
            .and_then(|s| s.addons.subsurface.as_ref())
            .map(|ss| ss.parent)
        else {
            return;
        };

        let Some(parent_surface) = self.surfaces.get_mut(parent) else {
            return;
        };

        if let Some(entry) = parent_surface
            .pending_stack
            .iter_mut()
            .find(|entry| entry.surface == key)
        {
            entry.position = position;
            parent_surface.stack_dirty = true;
        }
    }

    /// Restacks this subsurface relative to a sibling (or the parent
    /// itself) on the parent's pending stack. Committed with the parent.
    pub fn subsurface_place(
        &mut self,
        key: SurfaceKey,
        sibling: SurfaceKey,
        above: bool,
    ) -> Result<(), String> {
        if key == sibling {
            return Err("Cannot restack a subsurface relative to itself.".to_string());
        }

        let Some(parent) = self
            .surfaces
            .get(key)
            .and_then(|s| s.addons.subsurface.as_ref())
            .map(|ss| ss.parent)
        else {
            return Ok(());
        };

        let Some(parent_surface) = self.surfaces.get_mut(parent) else {
            return Ok(());
        };

        let stack = &mut parent_surface.pending_stack;
        let Some(current) = stack.iter().position(|entry| entry.surface == key) else {
            warn!("subsurface missing from its parent's stack");
            return Err("Surface not present in the parent stack.".to_string());
        };
        let Some(target) = stack.iter().position(|entry| entry.surface == sibling) else {
            return Err("Sibling not present in the parent stack.".to_string());
        };

        let entry = stack.remove(current);
        let target = stack
            .iter()
            .position(|e| e.surface == sibling)
            .unwrap_or(target);
        let insert_at = if above { target + 1 } else { target };
        stack.insert(insert_at, entry);

        parent_surface.stack_dirty = true;
        Ok(())
    }

    pub fn subsurface_set_sync(&mut self, key: SurfaceKey, synchronized: bool) {
        let was_effective = self.effectively_synchronized(key);

        if let Some(subsurface) = self
            .surfaces
            .get_mut(key)
            .and_then(|s| s.addons.subsurface.as_mut())
        {
            subsurface.synchronized = synchronized;
        }

        // Leaving synchronized mode applies any cached state immediately.
        if was_effective && !self.effectively_synchronized(key) {
            self.flush_apply(key);
        }
    }

    /// Walks subsurface parents to the root (non-subsurface) surface.
    pub fn subsurface_root(&self, key: SurfaceKey) -> SurfaceKey {
        let mut cursor = key;
        while let Some(parent) = self
            .surfaces
            .get(cursor)
            .and_then(|s| s.addons.subsurface.as_ref())
            .map(|ss| ss.parent)
        {
            if !self.surfaces.contains_key(parent) {
                break;
            }
            cursor = parent;
        }

        cursor
    }
}
