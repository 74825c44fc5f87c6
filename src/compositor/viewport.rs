use glam::IVec2;
use wayland_protocols::wp::viewporter::server::wp_viewport;

use crate::{
    compositor::{queue::StateQueue, surface::CommitId},
    geom::FRect,
};

#[derive(Debug, Default, Clone)]
pub struct ViewportState {
    pub source: Option<FRect>,
    pub destination: Option<IVec2>,
}

/// The wp_viewport addon: crops `buffer_src` and overrides the size of
/// `buffer_dst`, double-buffered like every other surface state piece.
pub struct ViewportAddon {
    pub resource: wp_viewport::WpViewport,
    pub state: StateQueue<ViewportState>,
}

impl ViewportAddon {
    pub fn new(resource: wp_viewport::WpViewport) -> Self {
        Self {
            resource,
            state: StateQueue::default(),
        }
    }

    pub fn set_source(&mut self, source: Option<FRect>) {
        self.state.touch().source = source;
    }

    pub fn set_destination(&mut self, destination: Option<IVec2>) {
        self.state.touch().destination = destination;
    }

    pub fn commit(&mut self, id: CommitId) {
        self.state.commit(id);
    }

    pub fn apply(&mut self, id: CommitId) {
        self.state.apply(id);
    }

    pub fn current(&self) -> &ViewportState {
        &self.state.current
    }
}
