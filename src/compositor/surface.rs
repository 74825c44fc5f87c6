use std::collections::VecDeque;

use glam::{DVec2, IVec2};
use tracing::{trace, warn};
use wayland_protocols::wp::linux_drm_syncobj::v1::server::wp_linux_drm_syncobj_surface_v1;
use wayland_server::{
    protocol::{wl_callback, wl_surface},
    Resource as _,
};

use crate::{
    compositor::{
        buffers::{BufferKey, BufferLock, LockError},
        constraints::ConstraintAddon,
        subsurface::SubsurfaceAddon,
        viewport::ViewportAddon,
        xdg::{self, PopupAddon, ToplevelAddon, XdgSurfaceAddon},
        State,
    },
    geom::{FRect, Rect, Region},
    gpu::TimelinePoint,
};

slotmap::new_key_type! { pub struct SurfaceKey; }

/// Monotonic per-surface counter tying state packets to applies.
pub type CommitId = u32;

/// Bitmask of state pieces frozen into a packet.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Committed(u32);

impl Committed {
    pub const BUFFER: Committed = Committed(1 << 0);
    pub const FRAME_CALLBACKS: Committed = Committed(1 << 1);
    pub const DELTA: Committed = Committed(1 << 2);
    pub const OPAQUE_REGION: Committed = Committed(1 << 3);
    pub const INPUT_REGION: Committed = Committed(1 << 4);
    pub const BUFFER_SCALE: Committed = Committed(1 << 5);
    pub const STACK: Committed = Committed(1 << 6);
    pub const PARENT_COMMIT: Committed = Committed(1 << 7);

    pub fn contains(&self, other: Committed) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Committed) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self, other: Committed) {
        self.0 &= !other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// The role a surface plays. Assigned once, when a role addon attaches.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Cursor,
    DragIcon,
    Subsurface,
    XdgToplevel,
    XdgPopup,
}

impl Role {
    /// Cursor and drag-icon surfaces never take input focus.
    pub fn focusable(&self) -> bool {
        !matches!(self, Role::Cursor | Role::DragIcon)
    }
}

/// An entry in a surface's z-ordered stack: the surface itself plus its
/// subsurfaces, bottom-most first. Children appear as (possibly stale) keys
/// with their position; dead keys are skipped and pruned on the next parent
/// commit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StackEntry {
    pub surface: SurfaceKey,
    pub position: IVec2,
}

/// Double-buffered state frozen at commit time.
#[derive(Debug, Default)]
pub struct SurfaceState {
    pub committed: Committed,

    pub buffer: Option<BufferKey>,
    pub lock: Option<BufferLock>,
    pub frame_callbacks: Vec<wl_callback::WlCallback>,
    pub delta: IVec2,
    pub opaque_region: Region,
    pub input_region: Option<Region>,
    pub buffer_scale: f64,
    pub parent_commit: CommitId,
    pub stack: Vec<StackEntry>,
}

pub struct Packet {
    pub id: CommitId,
    pub state: SurfaceState,
}

/// The applied state the renderer and input routing read.
pub struct CurrentState {
    pub committed: Committed,

    pub buffer: Option<BufferKey>,
    pub lock: Option<BufferLock>,
    pub frame_callbacks: Vec<wl_callback::WlCallback>,
    pub delta: IVec2,
    pub opaque_region: Region,
    pub input_region: Region,
    pub buffer_scale: f64,
    pub parent_commit: CommitId,
    pub stack: Vec<StackEntry>,
}

impl Default for CurrentState {
    fn default() -> Self {
        Self {
            committed: Committed::default(),
            buffer: None,
            lock: None,
            frame_callbacks: Vec::new(),
            delta: IVec2::ZERO,
            opaque_region: Region::default(),
            input_region: Region::infinite(),
            buffer_scale: 1.0,
            parent_commit: 0,
            stack: Vec::new(),
        }
    }
}

/// Explicit-sync addon state (wp_linux_drm_syncobj_surface_v1). The
/// acquire/release points are per-commit and consumed by buffer ingress.
pub struct SyncobjAddon {
    pub resource: wp_linux_drm_syncobj_surface_v1::WpLinuxDrmSyncobjSurfaceV1,
    pub acquire: Option<TimelinePoint>,
    pub release: Option<TimelinePoint>,
}

impl SyncobjAddon {
    pub fn take_acquire(&mut self) -> Option<TimelinePoint> {
        self.acquire.take()
    }

    pub fn take_release(&mut self) -> Option<TimelinePoint> {
        self.release.take()
    }
}

/// Drag-icon role addon. Offsets accumulate across commits.
#[derive(Debug, Default)]
pub struct DragIconAddon {
    pub accumulated: IVec2,
}

/// Cursor role addon; carries the hotspot supplied with set_cursor.
#[derive(Debug, Default)]
pub struct CursorAddon {
    pub hotspot: IVec2,
}

/// Feature and role components attached to a surface. One slot per role
/// and per type; the commit/apply hooks are the only polymorphic surface.
#[derive(Default)]
pub struct Addons {
    pub subsurface: Option<SubsurfaceAddon>,
    pub xdg: Option<XdgSurfaceAddon>,
    pub toplevel: Option<ToplevelAddon>,
    pub popup: Option<PopupAddon>,
    pub viewport: Option<ViewportAddon>,
    pub syncobj: Option<SyncobjAddon>,
    pub constraint: Option<ConstraintAddon>,
    pub drag_icon: Option<DragIconAddon>,
    pub cursor: Option<CursorAddon>,
}

impl Addons {
    pub fn any_live(&self) -> bool {
        self.subsurface.is_some()
            || self.xdg.is_some()
            || self.toplevel.is_some()
            || self.popup.is_some()
            || self.viewport.is_some()
            || self.syncobj.is_some()
            || self.constraint.is_some()
            || self.drag_icon.is_some()
    }
}

pub struct Surface {
    pub wl_surface: wl_surface::WlSurface,

    /// Last assigned commit id.
    pub committed: CommitId,
    /// Last applied commit id.
    pub applied: CommitId,

    pub pending: SurfaceState,
    pub queue: VecDeque<Packet>,
    pub current: CurrentState,

    /// The stack is read-modify-write state: attach, set_position and
    /// place_above/below edit this persistent copy, which is snapshotted
    /// into the packet when dirty.
    pub pending_stack: Vec<StackEntry>,
    pub stack_dirty: bool,

    pub role: Option<Role>,
    pub addons: Addons,

    /// Placement of the buffer in surface coordinates. The origin carries
    /// the committed offset (accumulated for drag icons).
    pub buffer_dst: Rect,
    /// Source crop in buffer coordinates.
    pub buffer_src: FRect,

    pub mapped: bool,
}

impl Surface {
    pub fn new(wl_surface: wl_surface::WlSurface, key: SurfaceKey) -> Self {
        Self {
            wl_surface,
            committed: 0,
            applied: 0,
            pending: SurfaceState::default(),
            queue: VecDeque::new(),
            current: CurrentState::default(),
            // A surface's stack always contains the surface itself.
            pending_stack: vec![StackEntry {
                surface: key,
                position: IVec2::ZERO,
            }],
            stack_dirty: true,
            role: None,
            addons: Addons::default(),
            buffer_dst: Rect::default(),
            buffer_src: FRect::default(),
            mapped: false,
        }
    }

}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<{:?} wl_surface@{} c{} a{}>",
            self.role,
            self.wl_surface.id().protocol_id(),
            self.committed,
            self.applied,
        )
    }
}

impl State {
    /// Handles wl_surface.commit: assigns the next commit id, freezes
    /// pending state (performing buffer ingress), and, unless the surface
    /// is parent-synchronized, drives the apply queue.
    pub fn surface_commit(&mut self, key: SurfaceKey) {
        let id = self.freeze_commit(key);

        if self.effectively_synchronized(key) {
            trace!(surface = ?self.surfaces[key], id, "commit deferred to parent");
            return;
        }

        self.flush_apply(key);

        // Role configures run against the just-applied state, so size
        // negotiation sees the committed geometry.
        xdg::handle_commit(self, key, id);
    }

    /// Freezes all pending state pieces into a packet tagged with the next
    /// commit id, invoking addon commit hooks with the same id.
    fn freeze_commit(&mut self, key: SurfaceKey) -> CommitId {
        // Prune stack tombstones before snapshotting.
        let alive: Vec<bool> = {
            let surface = &self.surfaces[key];
            surface
                .pending_stack
                .iter()
                .map(|entry| entry.surface == key || self.surfaces.contains_key(entry.surface))
                .collect()
        };

        let surface = &mut self.surfaces[key];
        if alive.iter().any(|ok| !ok) {
            let mut it = alive.iter();
            surface.pending_stack.retain(|_| *it.next().unwrap());
            surface.stack_dirty = true;
        }

        surface.committed = surface.committed.wrapping_add(1);
        let id = surface.committed;

        if surface.stack_dirty {
            surface.pending.stack = surface.pending_stack.clone();
            surface.pending.committed.set(Committed::STACK);
            surface.stack_dirty = false;
        }

        if !surface.pending.frame_callbacks.is_empty() {
            surface.pending.committed.set(Committed::FRAME_CALLBACKS);
        }

        // A synchronized subsurface ties this packet to the parent's next
        // commit.
        let parent = surface.addons.subsurface.as_ref().map(|ss| ss.parent);

        if let Some(parent) = parent {
            if self.effectively_synchronized(key) {
                if let Some(parent) = self.surfaces.get(parent) {
                    let required = parent.committed.wrapping_add(1);
                    let surface = &mut self.surfaces[key];
                    surface.pending.parent_commit = required;
                    surface.pending.committed.set(Committed::PARENT_COMMIT);
                }
            }
        }

        // Buffer ingress. A zombie or doubly-locked buffer clears the
        // attach, leaving the surface contents untouched.
        let pending_buffer = {
            let surface = &self.surfaces[key];
            if surface.pending.committed.contains(Committed::BUFFER) {
                surface.pending.buffer
            } else {
                None
            }
        };

        if let Some(buffer_key) = pending_buffer {
            if !self.buffers.contains_key(buffer_key) {
                warn!("pending buffer was destroyed, clearing attach");
                let surface = &mut self.surfaces[key];
                surface.pending.buffer = None;
                surface.pending.committed.clear(Committed::BUFFER);
            } else {
                self.validate_sync_points(key);
                match self.commit_buffer(buffer_key, key) {
                    Ok(lock) => {
                        self.surfaces[key].pending.lock = Some(lock);
                    }
                    Err(LockError::Zombie) => {
                        warn!("commit on zombie buffer, clearing attach");
                        let surface = &mut self.surfaces[key];
                        surface.pending.buffer = None;
                        surface.pending.committed.clear(Committed::BUFFER);
                    }
                    Err(LockError::AlreadyLocked) => {
                        warn!("buffer already locked by an earlier commit, clearing attach");
                        let surface = &mut self.surfaces[key];
                        surface.pending.buffer = None;
                        surface.pending.committed.clear(Committed::BUFFER);
                    }
                }
            }
        }

        let surface = &mut self.surfaces[key];
        let state = std::mem::take(&mut surface.pending);
        surface.queue.push_back(Packet { id, state });

        trace!(surface = ?surface, id, "froze commit");

        // Addon state snapshots ride along under the same id.
        if let Some(viewport) = surface.addons.viewport.as_mut() {
            viewport.commit(id);
        }
        if let Some(xdg) = surface.addons.xdg.as_mut() {
            xdg.commit(id);
        }
        if let Some(toplevel) = surface.addons.toplevel.as_mut() {
            toplevel.commit(id);
        }
        if let Some(constraint) = surface.addons.constraint.as_mut() {
            constraint.commit(id);
        }

        id
    }

    /// The syncobj protocol requires both an acquire and a release point
    /// on every commit that attaches a dma buffer. A violation is a
    /// protocol error; ingress then falls back to implicit sync.
    fn validate_sync_points(&mut self, key: SurfaceKey) {
        let surface = &mut self.surfaces[key];
        let Some(syncobj) = surface.addons.syncobj.as_mut() else {
            return;
        };

        let buffer_is_dma = surface
            .pending
            .buffer
            .and_then(|b| self.buffers.get(b))
            .map(|b| {
                matches!(
                    b.backing,
                    crate::compositor::buffers::BufferBacking::Dma { .. }
                )
            })
            .unwrap_or(false);
        if !buffer_is_dma {
            return;
        }

        match (&syncobj.acquire, &syncobj.release) {
            (Some(_), Some(_)) => (),
            (None, Some(_)) => {
                syncobj.resource.post_error(
                    wp_linux_drm_syncobj_surface_v1::Error::NoAcquirePoint,
                    "Missing acquire point.",
                );
                syncobj.release = None;
            }
            (Some(_), None) => {
                syncobj.resource.post_error(
                    wp_linux_drm_syncobj_surface_v1::Error::NoReleasePoint,
                    "Missing release point.",
                );
                syncobj.acquire = None;
            }
            (None, None) => (),
        }
    }

    /// True when any ancestor in the subsurface chain is synchronized.
    pub fn effectively_synchronized(&self, key: SurfaceKey) -> bool {
        let mut cursor = key;
        loop {
            let Some(surface) = self.surfaces.get(cursor) else {
                return false;
            };
            let Some(subsurface) = surface.addons.subsurface.as_ref() else {
                return false;
            };

            if subsurface.synchronized {
                return true;
            }

            cursor = subsurface.parent;
        }
    }

    /// Applies queued packets in order, up to the newest one whose
    /// readiness conditions hold. Re-driven by buffer readiness tasks.
    pub fn flush_apply(&mut self, key: SurfaceKey) {
        loop {
            let Some(surface) = self.surfaces.get(key) else {
                return;
            };
            let Some(front) = surface.queue.front() else {
                break;
            };

            let id = front.id;
            if !self.packet_ready(key, front) {
                trace!(surface = ?self.surfaces[key], id, "packet not ready");
                break;
            }

            let packet = self.surfaces[key].queue.pop_front().unwrap();
            self.apply_packet(key, packet);
        }

        self.update_map_state(key);
    }

    /// A packet is applicable when its buffer reports ready and every
    /// synchronized child packet that would apply alongside it is ready
    /// too.
    fn packet_ready(&self, key: SurfaceKey, packet: &Packet) -> bool {
        if packet.state.committed.contains(Committed::BUFFER) {
            if let Some(buffer) = packet.state.buffer.and_then(|b| self.buffers.get(b)) {
                if !buffer.is_ready() {
                    return false;
                }
            }
        }

        let surface = &self.surfaces[key];
        let stack = if packet.state.committed.contains(Committed::STACK) {
            &packet.state.stack
        } else {
            &surface.current.stack
        };

        for entry in stack {
            if entry.surface == key {
                continue;
            }
            let Some(child) = self.surfaces.get(entry.surface) else {
                continue;
            };
            if child.addons.subsurface.is_none() || !self.effectively_synchronized(entry.surface) {
                continue;
            }

            for child_packet in &child.queue {
                if !child_packet.state.committed.contains(Committed::PARENT_COMMIT)
                    || child_packet.state.parent_commit <= packet.id
                {
                    if !self.packet_ready(entry.surface, child_packet) {
                        return false;
                    }
                } else {
                    break;
                }
            }
        }

        true
    }

    fn apply_packet(&mut self, key: SurfaceKey, packet: Packet) {
        let Packet { id, mut state } = packet;
        let surface = &mut self.surfaces[key];

        trace!(surface = ?surface, id, "applying packet");

        let committed = state.committed;
        if committed.contains(Committed::BUFFER) {
            // The old lock drops here; the idle pass releases the buffer
            // once the GPU is done with it.
            surface.current.buffer = state.buffer;
            surface.current.lock = state.lock.take();
        }
        if committed.contains(Committed::FRAME_CALLBACKS) {
            surface
                .current
                .frame_callbacks
                .append(&mut state.frame_callbacks);
        }
        if committed.contains(Committed::DELTA) {
            surface.current.delta = state.delta;
            if let Some(drag_icon) = surface.addons.drag_icon.as_mut() {
                drag_icon.accumulated += state.delta;
            }
        }
        if committed.contains(Committed::OPAQUE_REGION) {
            surface.current.opaque_region = state.opaque_region;
        }
        if committed.contains(Committed::INPUT_REGION) {
            surface.current.input_region = state.input_region.unwrap_or_else(Region::infinite);
        }
        if committed.contains(Committed::BUFFER_SCALE) {
            surface.current.buffer_scale = state.buffer_scale;
        }
        if committed.contains(Committed::STACK) {
            surface.current.stack = state.stack;
        }
        if committed.contains(Committed::PARENT_COMMIT) {
            surface.current.parent_commit = state.parent_commit;
        }

        surface.current.committed.set(committed);
        surface.applied = id;

        // Addon queues advance to the same id.
        if let Some(viewport) = surface.addons.viewport.as_mut() {
            viewport.apply(id);
        }
        if let Some(xdg) = surface.addons.xdg.as_mut() {
            xdg.apply(id);
        }
        if let Some(toplevel) = surface.addons.toplevel.as_mut() {
            toplevel.apply(id);
        }
        if let Some(constraint) = surface.addons.constraint.as_mut() {
            constraint.apply(id);
        }

        self.update_surface_geometry(key);
        self.needs_redraw = true;

        // Synchronized children whose packets were tied to this commit (or
        // an earlier one) apply at the same frame.
        let children: Vec<SurfaceKey> = self.surfaces[key]
            .current
            .stack
            .iter()
            .filter(|entry| entry.surface != key)
            .map(|entry| entry.surface)
            .collect();

        for child_key in children {
            let Some(child) = self.surfaces.get(child_key) else {
                continue;
            };
            if child.addons.subsurface.is_none() || !self.effectively_synchronized(child_key) {
                continue;
            }

            loop {
                let Some(child) = self.surfaces.get(child_key) else {
                    break;
                };
                let Some(front) = child.queue.front() else {
                    break;
                };
                if front.state.committed.contains(Committed::PARENT_COMMIT)
                    && front.state.parent_commit > id
                {
                    break;
                }

                let child_packet = self.surfaces[child_key].queue.pop_front().unwrap();
                self.apply_packet(child_key, child_packet);
            }

            self.update_map_state(child_key);
        }
    }

    /// Recomputes buffer_dst/buffer_src from the applied buffer, scale,
    /// offset, and viewport crop.
    fn update_surface_geometry(&mut self, key: SurfaceKey) {
        let buffer_size = self.surfaces[key]
            .current
            .buffer
            .and_then(|b| self.buffers.get(b))
            .map(|b| b.size());

        let surface = &mut self.surfaces[key];
        let scale = surface.current.buffer_scale.max(1.0);

        let (src, dst_size) = match (buffer_size, surface.addons.viewport.as_ref()) {
            (Some(size), Some(viewport)) => {
                let full = FRect::from_pos_size(DVec2::ZERO, size.as_dvec2());
                let src = viewport.current().source.unwrap_or(full);
                let dst = viewport
                    .current()
                    .destination
                    .unwrap_or_else(|| (src.size / scale).round().as_ivec2());
                (src, dst)
            }
            (Some(size), None) => (
                FRect::from_pos_size(DVec2::ZERO, size.as_dvec2()),
                (size.as_dvec2() / scale).round().as_ivec2(),
            ),
            (None, _) => (FRect::default(), IVec2::ZERO),
        };

        let origin = if surface.addons.drag_icon.is_some() {
            surface.addons.drag_icon.as_ref().unwrap().accumulated
        } else {
            surface.current.delta
        };

        surface.buffer_src = src;
        surface.buffer_dst = Rect::from_pos_size(origin, dst_size);
    }

    /// A surface is mapped when it has a role and an applied buffer.
    pub fn update_map_state(&mut self, key: SurfaceKey) {
        let Some(surface) = self.surfaces.get(key) else {
            return;
        };

        let mapped = surface.role.is_some() && surface.current.buffer.is_some();
        if mapped == surface.mapped {
            return;
        }

        self.surfaces[key].mapped = mapped;
        self.needs_redraw = true;
        let role = self.surfaces[key].role;

        trace!(surface = ?self.surfaces[key], mapped, "map state changed");

        match role {
            Some(Role::XdgToplevel) | Some(Role::XdgPopup) => {
                if mapped {
                    if !self.surfaces_z.contains(&key) {
                        self.surfaces_z.push(key);
                    }
                    self.surface_entered_outputs(key);
                } else {
                    self.surfaces_z.retain(|k| *k != key);
                    self.seat_surface_gone(key);
                }
            }
            _ => (),
        }
    }

    /// Sends wl_surface.enter for the outputs the surface lands on.
    fn surface_entered_outputs(&mut self, key: SurfaceKey) {
        let client_id = self.surfaces[key].wl_surface.client().map(|c| c.id());
        let Some(client_id) = client_id else { return };

        let outputs: Vec<wayland_server::protocol::wl_output::WlOutput> = self
            .outputs
            .values()
            .flat_map(|output| output.resources.iter())
            .filter(|res| res.client().map(|c| c.id()) == Some(client_id.clone()))
            .cloned()
            .collect();

        let surface = &self.surfaces[key];
        for wl_output in outputs {
            surface.wl_surface.enter(&wl_output);
        }
    }

    /// Client-side destruction. Live addons at destruction time are a
    /// protocol error (checked at the request site); here the surface is
    /// unlinked from every routing table.
    pub fn surface_destroyed(&mut self, key: SurfaceKey) {
        let Some(mut surface) = self.surfaces.remove(key) else {
            return;
        };

        // Cancel pending packets; their buffer locks drop with them.
        surface.queue.clear();
        surface.current.lock = None;

        for callback in surface.current.frame_callbacks.drain(..) {
            drop(callback);
        }

        self.surfaces_z.retain(|k| *k != key);
        self.seat_surface_gone(key);
        self.data.surface_gone(key);

        // Stacks referencing this surface now hold tombstones; parents
        // prune them on their next commit.
    }

    /// Raises a root surface to the top of the z-order.
    pub fn raise_surface(&mut self, key: SurfaceKey) {
        if let Some(position) = self.surfaces_z.iter().position(|k| *k == key) {
            let key = self.surfaces_z.remove(position);
            self.surfaces_z.push(key);
            self.needs_redraw = true;
        }
    }

    /// The surface's coordinate space: global position of its origin, and
    /// the scale from surface units to global units.
    pub fn surface_coord_space(&self, key: SurfaceKey) -> (DVec2, DVec2) {
        let Some(surface) = self.surfaces.get(key) else {
            return (DVec2::ZERO, DVec2::ONE);
        };

        if surface.addons.toplevel.is_some() {
            return xdg::toplevel_coord_space(self, key);
        }

        if let Some(popup) = surface.addons.popup.as_ref() {
            let geometry = xdg::effective_geometry(self, key);
            if let Some(parent) = popup.parent {
                let (parent_pos, parent_scale) = self.surface_coord_space(parent);
                let pos = parent_pos
                    + (popup.position.as_dvec2() - geometry.pos.as_dvec2()) * parent_scale;
                return (pos, parent_scale);
            }

            return (popup.position.as_dvec2(), DVec2::ONE);
        }

        if let Some(subsurface) = surface.addons.subsurface.as_ref() {
            let parent_key = subsurface.parent;
            if let Some(parent) = self.surfaces.get(parent_key) {
                let position = parent
                    .current
                    .stack
                    .iter()
                    .find(|entry| entry.surface == key)
                    .map(|entry| entry.position)
                    .unwrap_or_default();

                let (parent_pos, parent_scale) = self.surface_coord_space(parent_key);
                return (parent_pos + position.as_dvec2() * parent_scale, parent_scale);
            }
        }

        (DVec2::ZERO, DVec2::ONE)
    }

    pub fn surface_pos_from_global(&self, key: SurfaceKey, global: DVec2) -> DVec2 {
        let (pos, scale) = self.surface_coord_space(key);
        (global - pos) / scale
    }

    pub fn surface_pos_to_global(&self, key: SurfaceKey, local: DVec2) -> DVec2 {
        let (pos, scale) = self.surface_coord_space(key);
        pos + local * scale
    }

    /// The surface's bounding rect in global coordinates, covering its
    /// whole subsurface tree.
    pub fn surface_frame(&self, key: SurfaceKey) -> FRect {
        let (pos, scale) = self.surface_coord_space(key);
        let bounds = self.tree_bounds(key);
        FRect::from_pos_size(pos + bounds.pos.as_dvec2() * scale, bounds.size.as_dvec2() * scale)
    }

    /// AABB of the surface plus its subsurface tree, in surface
    /// coordinates. Also the fallback for xdg window geometry.
    pub fn tree_bounds(&self, key: SurfaceKey) -> Rect {
        fn expand(state: &State, key: SurfaceKey, offset: IVec2, min: &mut IVec2, max: &mut IVec2) {
            let Some(surface) = state.surfaces.get(key) else {
                return;
            };

            let dst = surface.buffer_dst.translate(offset);
            *min = (*min).min(dst.min());
            *max = (*max).max(dst.max());

            for entry in &surface.current.stack {
                if entry.surface == key {
                    continue;
                }
                if let Some(child) = state.surfaces.get(entry.surface) {
                    if child.addons.subsurface.is_some() {
                        expand(state, entry.surface, offset + entry.position, min, max);
                    }
                }
            }
        }

        let Some(surface) = self.surfaces.get(key) else {
            return Rect::default();
        };

        let mut min = surface.buffer_dst.min();
        let mut max = surface.buffer_dst.max();
        expand(self, key, IVec2::ZERO, &mut min, &mut max);

        Rect::from_min_max(min, max)
    }

    /// Whether a point in surface coordinates hits the surface's input
    /// area.
    pub fn point_accepts_input(&self, key: SurfaceKey, point: DVec2) -> bool {
        let Some(surface) = self.surfaces.get(key) else {
            return false;
        };

        if !surface.buffer_dst.as_frect().contains(point) {
            return false;
        }

        surface.current.input_region.contains(point.floor().as_ivec2())
    }

    /// Finds the top-most focusable surface under a global position,
    /// returning it with surface-local coordinates.
    pub fn surface_under(&self, global: DVec2) -> Option<(SurfaceKey, DVec2)> {
        for root in self.surfaces_z.iter().rev() {
            if let Some(hit) = self.tree_under(*root, global) {
                return Some(hit);
            }
        }

        None
    }

    fn tree_under(&self, key: SurfaceKey, global: DVec2) -> Option<(SurfaceKey, DVec2)> {
        let surface = self.surfaces.get(key)?;
        if !surface.mapped && surface.addons.subsurface.is_none() {
            return None;
        }

        // Topmost stack entries hit first.
        for entry in surface.current.stack.iter().rev() {
            if entry.surface == key {
                if surface.role.map_or(true, |role| role.focusable()) {
                    let local = self.surface_pos_from_global(key, global);
                    if self.point_accepts_input(key, local) {
                        return Some((key, local));
                    }
                }
            } else if let Some(child) = self.surfaces.get(entry.surface) {
                if child.addons.subsurface.is_some() && child.current.buffer.is_some() {
                    if let Some(hit) = self.tree_under(entry.surface, global) {
                        return Some(hit);
                    }
                }
            }
        }

        None
    }
}
