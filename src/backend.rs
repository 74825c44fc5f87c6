//! The interface to the platform backend that produces outputs and input
//! events. Nested and direct KMS/evdev backends live outside this crate;
//! the in-tree headless backend drives outputs off the main loop timer.

pub mod headless;

use std::time;

use glam::{IVec2, UVec2};

use crate::waking_sender::WakingSender;

pub type BackendOutputId = u64;
pub type BackendInputId = u64;

#[derive(Debug, Clone)]
pub struct OutputInfo {
    pub id: BackendOutputId,
    pub size: UVec2,
    pub make: String,
    pub model: String,
    pub name: String,
    pub physical_size_mm: IVec2,
    pub refresh_mhz: u32,
    pub scale: i32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputKind {
    Keyboard,
    Pointer,
}

#[derive(Debug, Clone)]
pub struct InputInfo {
    pub id: BackendInputId,
    pub kind: InputKind,
    pub name: String,
}

/// One evdev channel update. SYN markers are never delivered; a whole
/// `Input` event is the frame. Relative wheel detents may be fractional.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct InputChannel {
    pub kind: u16,
    pub code: u16,
    pub value: f64,
}

#[derive(Debug)]
pub enum BackendEvent {
    OutputAdded(OutputInfo),
    OutputRemoved(BackendOutputId),
    /// The output finished presenting `commit_id` and can take a new frame.
    OutputFrame {
        output: BackendOutputId,
        commit_id: u64,
        start: time::Instant,
    },
    InputAdded(InputInfo),
    InputRemoved(BackendInputId),
    Input {
        input: BackendInputId,
        channels: Vec<InputChannel>,
    },
    ShutdownRequested,
}

pub trait Backend {
    /// Begins delivering events on `events`. Output/input announcements may
    /// arrive immediately or asynchronously.
    fn start(&mut self, events: WakingSender<BackendEvent>) -> anyhow::Result<()>;

    fn shutdown(&mut self);
}
