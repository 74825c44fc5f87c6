pub mod buffers;
pub mod constraints;
pub mod cursor;
pub mod data_device;
pub mod dispatch;
pub mod input;
pub mod output;
pub mod queue;
pub mod renderer;
pub mod sealed;
pub mod seat;
pub mod serial;
pub mod shm;
pub mod subsurface;
pub mod surface;
pub mod timer;
pub mod viewport;
pub mod xdg;

#[cfg(test)]
mod tests;

use std::{os::fd::AsRawFd as _, sync::Arc, time};

use anyhow::Context as _;
use crossbeam_channel as crossbeam;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use slotmap::SlotMap;
use tracing::{debug, info, trace, warn};
use wayland_server::Resource as _;

use crate::{
    backend::{Backend, BackendEvent},
    compositor::{
        buffers::{Buffer, BufferKey, CachedDmabufFeedback, SyncTimeline, SyncTimelineKey},
        cursor::CursorState,
        data_device::DataManager,
        input::{parse_hotkey, Hotkeys, InputSource},
        output::{Output, OutputKey, OutputLayout},
        renderer::Renderer,
        seat::{Interaction, Seat},
        serial::Serial,
        shm::{ShmPool, ShmPoolKey},
        surface::{Surface, SurfaceKey},
        timer::{TimerEvent, TimerFd, Timers},
    },
    config::Config,
    gpu,
    waking_sender::WakingSender,
};

lazy_static! {
    pub static ref EPOCH: time::Instant = time::Instant::now();
}

const DISPLAY: mio::Token = mio::Token(0);
const ACCEPT: mio::Token = mio::Token(1);
const WAKER: mio::Token = mio::Token(2);
const TIMER: mio::Token = mio::Token(3);

/// Command-line switches that reach into the core.
#[derive(Debug, Default, Clone)]
pub struct Options {
    pub no_dmabuf: bool,
    pub separate_draws: bool,
    pub imgui: bool,
    pub xwayland: Option<String>,
}

/// Completion notices posted to the main loop by worker threads.
#[derive(Debug)]
pub enum Task {
    BufferReady {
        buffer: BufferKey,
        surface: SurfaceKey,
    },
}

pub enum MainEvent {
    Backend(BackendEvent),
    Task(Task),
}

#[derive(Debug, Default)]
pub struct ClientState;

impl wayland_server::backend::ClientData for ClientState {
    fn initialized(&self, _client_id: wayland_server::backend::ClientId) {}
    fn disconnected(
        &self,
        _client_id: wayland_server::backend::ClientId,
        _reason: wayland_server::backend::DisconnectReason,
    ) {
    }
}

/// Everything the protocol dispatch and the frame pipeline operate on. One
/// thread owns this; workers only ever talk through the task channel.
pub struct State {
    pub serial: Serial,
    pub display: wayland_server::DisplayHandle,

    pub surfaces: SlotMap<SurfaceKey, Surface>,
    /// Root surfaces (toplevels and popups), bottom to top.
    pub surfaces_z: Vec<SurfaceKey>,

    pub buffers: SlotMap<BufferKey, Buffer>,
    pub shm_pools: SlotMap<ShmPoolKey, ShmPool>,
    pub sync_timelines: SlotMap<SyncTimelineKey, SyncTimeline>,
    pub cached_feedback: Option<CachedDmabufFeedback>,

    pub outputs: SlotMap<OutputKey, Output>,
    pub layout: OutputLayout,

    pub seat: Seat,
    pub input_sources: HashMap<u64, InputSource>,
    pub hotkeys: Hotkeys,
    pub interaction: Interaction,
    pub cursor: CursorState,

    pub data: DataManager,

    pub renderer: Renderer,
    pub timers: Timers,
    pub timer: TimerFd,

    pub tasks: WakingSender<MainEvent>,

    pub config: Config,
    pub options: Options,

    pub needs_redraw: bool,
    pub shutdown_requested: bool,

    // At the bottom for drop order.
    pub device: gpu::DeviceHandle,
}

impl State {
    fn new(
        display: wayland_server::DisplayHandle,
        device: gpu::DeviceHandle,
        config: Config,
        options: Options,
        tasks: WakingSender<MainEvent>,
        timer: TimerFd,
    ) -> anyhow::Result<Self> {
        let seat = Seat::new(&config.keyboard)?;

        let mut hotkeys = Hotkeys::default();
        hotkeys.main_mod = input::Modifiers::from_name(&config.keyboard.main_mod)
            .unwrap_or(input::Modifiers::ALT);
        for (binding, action) in &config.hotkeys {
            match parse_hotkey(binding) {
                Some((mods, code)) => {
                    if !hotkeys.bind(mods, code, *action) {
                        warn!(binding, "duplicate hotkey binding ignored");
                    }
                }
                None => warn!(binding, "unparseable hotkey binding ignored"),
            }
        }

        let cached_feedback = if options.no_dmabuf {
            None
        } else {
            match device.dmabuf_feedback() {
                Some(feedback) => Some(CachedDmabufFeedback::new(&feedback)?),
                None => None,
            }
        };

        let cursor = CursorState::new(&config.cursor);
        let renderer = Renderer::new(options.separate_draws);

        Ok(Self {
            serial: Serial::new(),
            display,

            surfaces: SlotMap::default(),
            surfaces_z: Vec::new(),

            buffers: SlotMap::default(),
            shm_pools: SlotMap::default(),
            sync_timelines: SlotMap::default(),
            cached_feedback,

            outputs: SlotMap::default(),
            layout: OutputLayout::default(),

            seat,
            input_sources: HashMap::new(),
            hotkeys,
            interaction: Interaction::Normal,
            cursor,

            data: DataManager::default(),

            renderer,
            timers: Timers::default(),
            timer,

            tasks,

            config,
            options,

            needs_redraw: true,
            shutdown_requested: false,

            device,
        })
    }

    pub fn handle_backend_event(&mut self, event: BackendEvent) -> anyhow::Result<()> {
        match event {
            BackendEvent::OutputAdded(info) => self.handle_output_added(info)?,
            BackendEvent::OutputRemoved(id) => self.handle_output_removed(id),
            BackendEvent::OutputFrame { output, commit_id, .. } => {
                trace!(output, commit_id, "backend frame complete");
                let key = self
                    .outputs
                    .iter()
                    .find(|(_, o)| o.backend_id == output)
                    .map(|(key, _)| key);
                if let Some(key) = key {
                    self.output_vsync(key);
                }
            }
            BackendEvent::InputAdded(info) => self.handle_input_added(info),
            BackendEvent::InputRemoved(id) => self.handle_input_removed(id),
            BackendEvent::Input { input, channels } => {
                self.handle_input_event(input, &channels)
            }
            BackendEvent::ShutdownRequested => {
                debug!("backend requested shutdown");
                self.shutdown_requested = true;
            }
        }

        Ok(())
    }

    pub fn handle_task(&mut self, task: Task) {
        match task {
            Task::BufferReady { buffer, surface } => {
                self.buffer_ready(buffer, surface);
                self.needs_redraw = true;
            }
        }
    }
}

pub struct Compositor {
    poll: mio::Poll,
    _waker: Arc<mio::Waker>,

    state: State,
    display: wayland_server::Display<State>,
    listening_socket: wayland_server::ListeningSocket,

    backend: Box<dyn Backend>,
    events: crossbeam::Receiver<MainEvent>,
    backend_events: crossbeam::Receiver<BackendEvent>,

    xwayland: Option<std::process::Child>,
}

impl Compositor {
    /// Builds the display, globals, socket, and state, and starts the
    /// backend. `WAYLAND_DISPLAY` is printed for clients to pick up.
    pub fn new(
        device: gpu::DeviceHandle,
        mut backend: Box<dyn Backend>,
        config: Config,
        options: Options,
    ) -> anyhow::Result<Self> {
        let mut display =
            wayland_server::Display::<State>::new().context("failed to create display")?;
        let dh = display.handle();

        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER)?);

        let (event_send, event_recv) = crossbeam::unbounded();
        let tasks = WakingSender::new(waker.clone(), event_send);

        let (backend_event_send, backend_event_recv) = crossbeam::unbounded();
        let backend_tasks = WakingSender::new(waker.clone(), backend_event_send);

        let timer = TimerFd::new()?;
        let timer_fd = timer.as_raw_fd();
        poll.registry().register(
            &mut mio::unix::SourceFd(&timer_fd),
            TIMER,
            mio::Interest::READABLE,
        )?;

        let mut state = State::new(dh.clone(), device, config, options, tasks.clone(), timer)?;

        create_globals(&dh, &state);

        if let Some(path) = state.config.render.background.clone() {
            let device = state.device.clone();
            if let Err(err) = state.renderer.load_background(&device, &path) {
                warn!(?err, path = %path.display(), "failed to load background");
            }
        }

        if state.options.imgui && state.renderer.overlay.is_none() {
            warn!("--imgui requested but no overlay module is registered");
        }

        // Wire up the wayland socket.
        let listening_socket = wayland_server::ListeningSocket::bind_auto("wayland", 1..33)
            .context("binding wayland socket")?;
        let socket_name = listening_socket
            .socket_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        info!(socket = ?socket_name, "listening for wayland clients");

        let display_fd = display.backend().poll_fd().as_raw_fd();
        poll.registry().register(
            &mut mio::unix::SourceFd(&display_fd),
            DISPLAY,
            mio::Interest::READABLE,
        )?;

        let listener_fd = listening_socket.as_raw_fd();
        poll.registry().register(
            &mut mio::unix::SourceFd(&listener_fd),
            ACCEPT,
            mio::Interest::READABLE,
        )?;

        // Children inherit the socket.
        std::env::set_var("WAYLAND_DISPLAY", &socket_name);

        let xwayland = if let Some(x11_display) = state.options.xwayland.clone() {
            match std::process::Command::new("Xwayland")
                .arg(&x11_display)
                .arg("-rootless")
                .env("WAYLAND_DISPLAY", &socket_name)
                .spawn()
            {
                Ok(child) => {
                    info!(display = %x11_display, "spawned Xwayland");
                    std::env::set_var("DISPLAY", &x11_display);
                    Some(child)
                }
                Err(err) => {
                    warn!(?err, "failed to spawn Xwayland");
                    None
                }
            }
        } else {
            None
        };

        // SIGINT/SIGTERM funnel into the normal shutdown path.
        {
            let tasks = tasks.clone();
            ctrlc::set_handler(move || {
                tasks
                    .send(MainEvent::Backend(BackendEvent::ShutdownRequested))
                    .ok();
            })
            .context("installing signal handler")?;
        }

        backend.start(backend_tasks)?;

        Ok(Self {
            poll,
            _waker: waker,
            state,
            display,
            listening_socket,
            backend,
            events: event_recv,
            backend_events: backend_event_recv,
            xwayland,
        })
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        let mut events = mio::Events::with_capacity(64);

        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => (),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                // Input and clients share this poll; there is no way to
                // limp along without it.
                Err(err) => return Err(err).context("event loop poll failed"),
            }

            for event in events.iter() {
                match event.token() {
                    ACCEPT => {
                        while let Some(stream) = self.listening_socket.accept()? {
                            let _client = self
                                .display
                                .handle()
                                .insert_client(stream, Arc::new(ClientState))?;
                            debug!("client connected");
                        }
                    }
                    DISPLAY => {
                        self.display
                            .dispatch_clients(&mut self.state)
                            .context("failed to dispatch the wayland display")?;
                    }
                    WAKER => {
                        while let Ok(event) = self.events.try_recv() {
                            match event {
                                MainEvent::Backend(event) => {
                                    self.state.handle_backend_event(event)?
                                }
                                MainEvent::Task(task) => self.state.handle_task(task),
                            }
                        }
                        while let Ok(event) = self.backend_events.try_recv() {
                            self.state.handle_backend_event(event)?;
                        }
                    }
                    TIMER => {
                        self.state.timer.read()?;
                        let now = time::Instant::now();
                        let timer = &mut self.state.timer;
                        let due = self.state.timers.fire(timer, now)?;
                        for event in due {
                            match event {
                                TimerEvent::OutputVsync(key) => self.state.output_vsync(key),
                            }
                        }
                    }
                    _ => unreachable!(),
                }
            }

            self.idle()?;

            if self.state.shutdown_requested {
                self.shutdown();
                return Ok(());
            }
        }
    }

    /// Housekeeping between poll wakeups.
    fn idle(&mut self) -> anyhow::Result<()> {
        self.state.flush_configures();
        self.state.update_constraints();
        self.state.pointer_frame();

        self.state.device.retire_completed()?;
        self.state.reap_finished_frames();
        self.state.release_buffers()?;

        if std::mem::take(&mut self.state.needs_redraw) {
            self.state.request_all_frames();
        }

        self.display.flush_clients()?;
        Ok(())
    }

    /// Leaves-first teardown: backend, then clients, then the GPU.
    fn shutdown(&mut self) {
        debug!("shutting down");

        self.backend.shutdown();

        if let Some(mut child) = self.xwayland.take() {
            let _ = child.kill();
            let _ = child.wait();
        }

        let _ = self.display.flush_clients();
        self.state.device.wait_idle();
    }
}

fn create_globals(dh: &wayland_server::DisplayHandle, state: &State) {
    use wayland_protocols::{
        wp::{
            cursor_shape::v1::server::wp_cursor_shape_manager_v1,
            linux_dmabuf::zv1::server::zwp_linux_dmabuf_v1,
            linux_drm_syncobj::v1::server::wp_linux_drm_syncobj_manager_v1,
            pointer_constraints::zv1::server::zwp_pointer_constraints_v1,
            pointer_gestures::zv1::server::zwp_pointer_gestures_v1,
            relative_pointer::zv1::server::zwp_relative_pointer_manager_v1,
            viewporter::server::wp_viewporter,
        },
        xdg::{
            decoration::zv1::server::zxdg_decoration_manager_v1, shell::server::xdg_wm_base,
        },
    };
    use wayland_protocols_misc::server_decoration::server::org_kde_kwin_server_decoration_manager;
    use wayland_server::protocol::{
        wl_compositor, wl_data_device_manager, wl_seat, wl_shm, wl_subcompositor,
    };

    create_global::<wl_compositor::WlCompositor>(dh, 6);
    create_global::<wl_subcompositor::WlSubcompositor>(dh, 1);
    create_global::<wl_shm::WlShm>(dh, 2);
    create_global::<wl_seat::WlSeat>(dh, 9);
    create_global::<wl_data_device_manager::WlDataDeviceManager>(dh, 3);
    create_global::<xdg_wm_base::XdgWmBase>(dh, 7);

    create_global::<wp_viewporter::WpViewporter>(dh, 1);
    create_global::<zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1>(dh, 1);
    create_global::<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1>(dh, 1);
    create_global::<zwp_pointer_gestures_v1::ZwpPointerGesturesV1>(dh, 3);
    create_global::<wp_cursor_shape_manager_v1::WpCursorShapeManagerV1>(dh, 1);
    create_global::<zxdg_decoration_manager_v1::ZxdgDecorationManagerV1>(dh, 1);
    create_global::<org_kde_kwin_server_decoration_manager::OrgKdeKwinServerDecorationManager>(
        dh, 1,
    );
    create_global::<wp_linux_drm_syncobj_manager_v1::WpLinuxDrmSyncobjManagerV1>(dh, 1);

    // Only advertised when the device can import.
    if state.cached_feedback.is_some() {
        create_global::<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>(dh, 5);
    }
}

fn create_global<G: wayland_server::Resource + 'static>(
    dh: &wayland_server::DisplayHandle,
    version: u32,
) where
    State: wayland_server::GlobalDispatch<G, ()>,
{
    let version = version.min(G::interface().version);
    let _ = dh.create_global::<State, G, ()>(version, ());
}

pub(crate) fn make_u64(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}
