//! A backend with no real display hardware. It announces a fixed set of
//! virtual outputs; presentation completion is reported immediately after
//! each commit, and the compositor's timer provides the vsync cadence.

use glam::{IVec2, UVec2};
use tracing::debug;

use super::{Backend, BackendEvent, OutputInfo};
use crate::waking_sender::WakingSender;

pub struct HeadlessBackend {
    outputs: Vec<OutputInfo>,
}

impl HeadlessBackend {
    pub fn new(sizes: &[UVec2]) -> Self {
        let outputs = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| OutputInfo {
                id: i as u64 + 1,
                size: *size,
                make: "prism".to_string(),
                model: "virtual".to_string(),
                name: format!("HEADLESS-{}", i + 1),
                physical_size_mm: IVec2::ZERO,
                refresh_mhz: 60_000,
                scale: 1,
            })
            .collect();

        Self { outputs }
    }
}

impl Backend for HeadlessBackend {
    fn start(&mut self, events: WakingSender<BackendEvent>) -> anyhow::Result<()> {
        for output in &self.outputs {
            debug!(name = %output.name, ?output.size, "announcing virtual output");
            events.send(BackendEvent::OutputAdded(output.clone())).ok();
        }

        Ok(())
    }

    fn shutdown(&mut self) {}
}
