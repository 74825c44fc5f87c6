//! End-to-end protocol tests: a real client connection over an in-process
//! socketpair, driven lockstep with the compositor state.

use std::{io::Write as _, os::unix::net::UnixStream, rc::Rc, sync::Arc};

use glam::{DVec2, IVec2, UVec2};
use pretty_assertions::assert_eq;
use wayland_client::{
    protocol::{
        wl_buffer, wl_callback, wl_compositor, wl_data_device, wl_data_device_manager,
        wl_data_offer, wl_data_source, wl_keyboard, wl_pointer, wl_registry, wl_seat, wl_shm,
        wl_shm_pool, wl_subcompositor, wl_subsurface, wl_surface,
    },
    Connection, Dispatch, Proxy as _, QueueHandle,
};
use wayland_protocols::xdg::shell::client::{
    xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base,
};

use crate::{
    backend::OutputInfo,
    compositor::{input::evdev, surface::SurfaceKey, ClientState, Options, State},
    config::Config,
    gpu::{self, soft::SoftDevice},
    waking_sender::WakingSender,
};

// ---------------------------------------------------------------------------
// Server-side harness

struct TestCompositor {
    display: wayland_server::Display<State>,
    state: State,
    device: SoftDevice,
    _poll: mio::Poll,
}

impl TestCompositor {
    fn new() -> Self {
        let display = wayland_server::Display::<State>::new().unwrap();
        let dh = display.handle();

        let poll = mio::Poll::new().unwrap();
        let waker = Arc::new(mio::Waker::new(poll.registry(), mio::Token(0)).unwrap());
        let (send, _recv) = crossbeam_channel::unbounded();
        let tasks = WakingSender::new(waker, send);

        let timer = crate::compositor::timer::TimerFd::new().unwrap();

        let device = SoftDevice::new();
        let device_handle: gpu::DeviceHandle = Rc::new(device.clone());

        let mut state = State::new(
            dh.clone(),
            device_handle,
            Config::default(),
            Options::default(),
            tasks,
            timer,
        )
        .unwrap();

        super::create_globals(&dh, &state);

        state
            .handle_output_added(OutputInfo {
                id: 1,
                size: UVec2::new(1024, 768),
                make: "test".to_string(),
                model: "virtual".to_string(),
                name: "TEST-1".to_string(),
                physical_size_mm: IVec2::ZERO,
                refresh_mhz: 60_000,
                scale: 1,
            })
            .unwrap();

        Self {
            display,
            state,
            device,
            _poll: poll,
        }
    }

    fn connect(&mut self) -> Client {
        let (server_stream, client_stream) = UnixStream::pair().unwrap();
        self.display
            .handle()
            .insert_client(server_stream, Arc::new(ClientState))
            .unwrap();

        let backend = wayland_backend::client::Backend::connect(client_stream).unwrap();
        let conn = Connection::from_backend(backend);
        let queue = conn.new_event_queue();
        let qh = queue.handle();

        let display = conn.display();
        let registry = display.get_registry(&qh, ());

        let mut client = Client {
            conn,
            queue,
            qh,
            registry,
            app: App::default(),
        };

        // Two rounds: registry globals, then bound-global events.
        self.pump(&mut client);
        self.pump(&mut client);

        client
    }

    /// One lockstep round: client out, server in/out, client in.
    fn pump(&mut self, client: &mut Client) {
        for _ in 0..4 {
            client.conn.flush().ok();

            self.display.dispatch_clients(&mut self.state).unwrap();
            self.idle();
            self.display.flush_clients().unwrap();

            if let Some(guard) = client.conn.prepare_read() {
                let _ = guard.read();
            }
            client.queue.dispatch_pending(&mut client.app).unwrap();
        }
    }

    /// The main loop's idle pass, minus the poll.
    fn idle(&mut self) {
        self.state.flush_configures();
        self.state.update_constraints();
        self.state.pointer_frame();
        self.state.device.retire_completed().unwrap();
        self.state.reap_finished_frames();
        self.state.release_buffers().unwrap();
    }

    fn surface_key(&self, surface: &wl_surface::WlSurface) -> SurfaceKey {
        let id = surface.id().protocol_id();
        self.state
            .surfaces
            .iter()
            .find(|(_, s)| {
                wayland_server::Resource::id(&s.wl_surface).protocol_id() == id
            })
            .map(|(key, _)| key)
            .expect("no matching server surface")
    }

    fn output_key(&self) -> crate::compositor::output::OutputKey {
        self.state.layout.primary.unwrap()
    }

    fn move_pointer(&mut self, x: f64, y: f64) {
        self.state.pointer_move_to(DVec2::new(x, y));
    }

    fn button(&mut self, code: u16, pressed: bool) {
        self.state.pointer_button(code, pressed);
    }
}

// ---------------------------------------------------------------------------
// Client-side harness

#[derive(Debug, Clone, PartialEq, Eq)]
enum PointerLog {
    Enter(u32),
    Leave(u32),
    Motion,
    Button(u32, bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DndLog {
    Enter(u32),
    Leave,
    Motion,
    Drop,
}

#[derive(Default)]
struct App {
    compositor: Option<wl_compositor::WlCompositor>,
    subcompositor: Option<wl_subcompositor::WlSubcompositor>,
    shm: Option<wl_shm::WlShm>,
    seat: Option<wl_seat::WlSeat>,
    wm_base: Option<xdg_wm_base::XdgWmBase>,
    data_device_manager: Option<wl_data_device_manager::WlDataDeviceManager>,

    /// xdg_surface configure serials, in arrival order.
    configure_serials: Vec<u32>,
    /// (size, states) from xdg_toplevel.configure.
    toplevel_configures: Vec<((i32, i32), Vec<u32>)>,
    popup_configures: Vec<(i32, i32, i32, i32)>,

    buffer_releases: Vec<u32>,
    frame_done: Vec<u32>,

    pointer_log: Vec<PointerLog>,

    dnd_log: Vec<DndLog>,
    offers: Vec<wl_data_offer::WlDataOffer>,
    offer_mimes: Vec<String>,
    selection_offers: u32,
    source_cancelled: u32,
    source_drop_performed: u32,
}

struct Client {
    conn: Connection,
    queue: wayland_client::EventQueue<App>,
    qh: QueueHandle<App>,
    #[allow(dead_code)]
    registry: wl_registry::WlRegistry,
    app: App,
}

impl Client {
    fn create_shm_buffer(
        &mut self,
        width: i32,
        height: i32,
        fill: u8,
    ) -> wl_buffer::WlBuffer {
        let stride = width * 4;
        let len = (stride * height) as usize;

        let fd = nix::sys::memfd::memfd_create(
            c"test-pool",
            nix::sys::memfd::MemFdCreateFlag::empty(),
        )
        .unwrap();
        let mut file = std::fs::File::from(fd);
        file.write_all(&vec![fill; len]).unwrap();

        let pool = self.app.shm.as_ref().unwrap().create_pool(
            std::os::fd::AsFd::as_fd(&file),
            len as i32,
            &self.qh,
            (),
        );

        pool.create_buffer(
            0,
            width,
            height,
            stride,
            wl_shm::Format::Xrgb8888,
            &self.qh,
            (),
        )
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for App {
    fn event(
        app: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<App>,
    ) {
        if let wl_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        {
            match interface.as_str() {
                "wl_compositor" => {
                    app.compositor = Some(registry.bind(name, version.min(6), qh, ()));
                }
                "wl_subcompositor" => {
                    app.subcompositor = Some(registry.bind(name, 1, qh, ()));
                }
                "wl_shm" => {
                    app.shm = Some(registry.bind(name, 1, qh, ()));
                }
                "wl_seat" => {
                    app.seat = Some(registry.bind(name, version.min(8), qh, ()));
                }
                "xdg_wm_base" => {
                    app.wm_base = Some(registry.bind(name, version.min(5), qh, ()));
                }
                "wl_data_device_manager" => {
                    app.data_device_manager = Some(registry.bind(name, version.min(3), qh, ()));
                }
                _ => (),
            }
        }
    }
}

macro_rules! noop_dispatch {
    ($($iface:ty),* $(,)?) => {
        $(
            impl Dispatch<$iface, ()> for App {
                fn event(
                    _app: &mut Self,
                    _proxy: &$iface,
                    _event: <$iface as wayland_client::Proxy>::Event,
                    _data: &(),
                    _conn: &Connection,
                    _qh: &QueueHandle<App>,
                ) {
                }
            }
        )*
    };
}

noop_dispatch!(
    wl_compositor::WlCompositor,
    wl_subcompositor::WlSubcompositor,
    wl_shm::WlShm,
    wl_shm_pool::WlShmPool,
    wl_surface::WlSurface,
    wl_subsurface::WlSubsurface,
    wl_keyboard::WlKeyboard,
    xdg_positioner::XdgPositioner,
);

impl Dispatch<wl_buffer::WlBuffer, ()> for App {
    fn event(
        app: &mut Self,
        buffer: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<App>,
    ) {
        if let wl_buffer::Event::Release = event {
            app.buffer_releases.push(buffer.id().protocol_id());
        }
    }
}

impl Dispatch<wl_callback::WlCallback, u32> for App {
    fn event(
        app: &mut Self,
        _callback: &wl_callback::WlCallback,
        event: wl_callback::Event,
        tag: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<App>,
    ) {
        if let wl_callback::Event::Done { .. } = event {
            app.frame_done.push(*tag);
        }
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for App {
    fn event(
        _app: &mut Self,
        wm_base: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<App>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, ()> for App {
    fn event(
        app: &mut Self,
        _surface: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<App>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            app.configure_serials.push(serial);
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ()> for App {
    fn event(
        app: &mut Self,
        _toplevel: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<App>,
    ) {
        if let xdg_toplevel::Event::Configure {
            width,
            height,
            states,
        } = event
        {
            let states = states
                .chunks_exact(4)
                .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            app.toplevel_configures.push(((width, height), states));
        }
    }
}

impl Dispatch<xdg_popup::XdgPopup, ()> for App {
    fn event(
        app: &mut Self,
        _popup: &xdg_popup::XdgPopup,
        event: xdg_popup::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<App>,
    ) {
        if let xdg_popup::Event::Configure {
            x,
            y,
            width,
            height,
        } = event
        {
            app.popup_configures.push((x, y, width, height));
        }
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for App {
    fn event(
        _app: &mut Self,
        _seat: &wl_seat::WlSeat,
        _event: wl_seat::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<App>,
    ) {
    }
}

impl Dispatch<wl_pointer::WlPointer, ()> for App {
    fn event(
        app: &mut Self,
        _pointer: &wl_pointer::WlPointer,
        event: wl_pointer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<App>,
    ) {
        match event {
            wl_pointer::Event::Enter { surface, .. } => {
                app.pointer_log
                    .push(PointerLog::Enter(surface.id().protocol_id()));
            }
            wl_pointer::Event::Leave { surface, .. } => {
                app.pointer_log
                    .push(PointerLog::Leave(surface.id().protocol_id()));
            }
            wl_pointer::Event::Motion { .. } => {
                app.pointer_log.push(PointerLog::Motion);
            }
            wl_pointer::Event::Button { button, state, .. } => {
                let pressed = matches!(
                    state,
                    wayland_client::WEnum::Value(wl_pointer::ButtonState::Pressed)
                );
                app.pointer_log.push(PointerLog::Button(button, pressed));
            }
            _ => (),
        }
    }
}

impl Dispatch<wl_data_device_manager::WlDataDeviceManager, ()> for App {
    fn event(
        _app: &mut Self,
        _manager: &wl_data_device_manager::WlDataDeviceManager,
        _event: wl_data_device_manager::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<App>,
    ) {
    }
}

impl Dispatch<wl_data_device::WlDataDevice, ()> for App {
    fn event(
        app: &mut Self,
        _device: &wl_data_device::WlDataDevice,
        event: wl_data_device::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<App>,
    ) {
        match event {
            wl_data_device::Event::DataOffer { id } => {
                app.offer_mimes.clear();
                app.offers.push(id);
            }
            wl_data_device::Event::Enter { surface, .. } => {
                app.dnd_log
                    .push(DndLog::Enter(surface.id().protocol_id()));
            }
            wl_data_device::Event::Leave => {
                app.dnd_log.push(DndLog::Leave);
            }
            wl_data_device::Event::Motion { .. } => {
                app.dnd_log.push(DndLog::Motion);
            }
            wl_data_device::Event::Drop => {
                app.dnd_log.push(DndLog::Drop);
            }
            wl_data_device::Event::Selection { .. } => {
                app.selection_offers += 1;
            }
            _ => (),
        }
    }

    wayland_client::event_created_child!(App, wl_data_device::WlDataDevice, [
        wl_data_device::EVT_DATA_OFFER_OPCODE => (wl_data_offer::WlDataOffer, ()),
    ]);
}

impl Dispatch<wl_data_offer::WlDataOffer, ()> for App {
    fn event(
        app: &mut Self,
        _offer: &wl_data_offer::WlDataOffer,
        event: wl_data_offer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<App>,
    ) {
        if let wl_data_offer::Event::Offer { mime_type } = event {
            app.offer_mimes.push(mime_type);
        }
    }
}

impl Dispatch<wl_data_source::WlDataSource, ()> for App {
    fn event(
        app: &mut Self,
        _source: &wl_data_source::WlDataSource,
        event: wl_data_source::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<App>,
    ) {
        match event {
            wl_data_source::Event::Cancelled => app.source_cancelled += 1,
            wl_data_source::Event::DndDropPerformed => app.source_drop_performed += 1,
            _ => (),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers

struct Window {
    surface: wl_surface::WlSurface,
    xdg_surface: xdg_surface::XdgSurface,
    toplevel: xdg_toplevel::XdgToplevel,
}

/// Runs the full map sequence: initial configure, ack, buffer attach,
/// size negotiation, final ack.
fn map_toplevel(comp: &mut TestCompositor, client: &mut Client, size: i32) -> Window {
    let qh = client.qh.clone();
    let surface = client.app.compositor.as_ref().unwrap().create_surface(&qh, ());
    let xdg_surface = client
        .app
        .wm_base
        .as_ref()
        .unwrap()
        .get_xdg_surface(&surface, &qh, ());
    let toplevel = xdg_surface.get_toplevel(&qh, ());

    surface.commit();
    comp.pump(client);

    let serial = *client.app.configure_serials.last().expect("no configure");
    xdg_surface.ack_configure(serial);

    let buffer = client.create_shm_buffer(size, size, 0xaa);
    surface.attach(Some(&buffer), 0, 0);
    surface.commit();
    comp.pump(client);

    if let Some(serial) = client.app.configure_serials.last().copied() {
        xdg_surface.ack_configure(serial);
    }
    surface.commit();
    comp.pump(client);

    Window {
        surface,
        xdg_surface,
        toplevel,
    }
}

// ---------------------------------------------------------------------------
// Scenarios

/// Scenario 1: an shm buffer is copied during commit and released exactly
/// once, with the bytes landing in the GPU image.
#[test_log::test]
fn shm_commit_copies_and_releases() {
    let mut comp = TestCompositor::new();
    let mut client = comp.connect();
    let qh = client.qh.clone();

    let surface = client.app.compositor.as_ref().unwrap().create_surface(&qh, ());
    let buffer = client.create_shm_buffer(4, 4, 0xff);

    surface.attach(Some(&buffer), 0, 0);
    surface.commit();
    comp.pump(&mut client);

    assert_eq!(
        client.app.buffer_releases,
        vec![buffer.id().protocol_id()],
        "expected exactly one release"
    );

    // The copy went through to the device image.
    let (_, server_buffer) = comp.state.buffers.iter().next().expect("no buffer");
    let image = server_buffer.image.as_ref().unwrap();
    let soft = image
        .as_any()
        .downcast_ref::<gpu::soft::SoftImage>()
        .unwrap();
    assert!(soft.pixels.borrow().iter().all(|b| *b == 0xff));
    assert!(!server_buffer.locked() || server_buffer.released);
}

/// Scenario 2: initial configure is (0, 0) with the activated state; the
/// second configure negotiates the committed geometry.
#[test_log::test]
fn toplevel_configure_negotiation() {
    let mut comp = TestCompositor::new();
    let mut client = comp.connect();
    let qh = client.qh.clone();

    let surface = client.app.compositor.as_ref().unwrap().create_surface(&qh, ());
    let xdg_surface = client
        .app
        .wm_base
        .as_ref()
        .unwrap()
        .get_xdg_surface(&surface, &qh, ());
    let _toplevel = xdg_surface.get_toplevel(&qh, ());

    surface.commit();
    comp.pump(&mut client);

    let activated: u32 = xdg_toplevel::State::Activated.into();
    assert_eq!(client.app.toplevel_configures.len(), 1);
    assert_eq!(client.app.toplevel_configures[0].0, (0, 0));
    assert!(client.app.toplevel_configures[0].1.contains(&activated));

    let serial = *client.app.configure_serials.last().unwrap();
    xdg_surface.ack_configure(serial);

    xdg_surface.set_window_geometry(0, 0, 400, 300);
    let buffer = client.create_shm_buffer(400, 300, 0xaa);
    surface.attach(Some(&buffer), 0, 0);
    surface.commit();
    comp.pump(&mut client);

    assert_eq!(client.app.toplevel_configures.len(), 2);
    assert_eq!(client.app.toplevel_configures[1].0, (400, 300));
    assert!(client.app.toplevel_configures[1].1.contains(&activated));

    let serial = *client.app.configure_serials.last().unwrap();
    xdg_surface.ack_configure(serial);
    surface.commit();
    comp.pump(&mut client);

    let key = comp.surface_key(&surface);
    assert!(comp.state.surfaces[key].mapped);
    assert_eq!(comp.state.surfaces_z, vec![key]);
}

/// Scenario 3: a synchronized subsurface lands on top of the parent's
/// stack and its state only applies with the parent commit.
#[test_log::test]
fn subsurface_sync_and_stacking() {
    let mut comp = TestCompositor::new();
    let mut client = comp.connect();
    let qh = client.qh.clone();

    let parent = map_toplevel(&mut comp, &mut client, 200);
    let parent_key = comp.surface_key(&parent.surface);

    let child = client.app.compositor.as_ref().unwrap().create_surface(&qh, ());
    let wl_subsurface = client.app.subcompositor.as_ref().unwrap().get_subsurface(
        &child,
        &parent.surface,
        &qh,
        (),
    );
    wl_subsurface.set_sync();
    wl_subsurface.place_above(&parent.surface);
    comp.pump(&mut client);

    let child_key = comp.surface_key(&child);
    let pending: Vec<SurfaceKey> = comp.state.surfaces[parent_key]
        .pending_stack
        .iter()
        .map(|e| e.surface)
        .collect();
    assert_eq!(pending, vec![parent_key, child_key]);

    // A synchronized child commit caches its state...
    let child_buffer = client.create_shm_buffer(32, 32, 0x55);
    child.attach(Some(&child_buffer), 0, 0);
    child.commit();
    comp.pump(&mut client);
    assert!(comp.state.surfaces[child_key].current.buffer.is_none());

    // ...until the parent commits, which applies both atomically.
    parent.surface.commit();
    comp.pump(&mut client);
    assert!(comp.state.surfaces[child_key].current.buffer.is_some());

    let stack: Vec<SurfaceKey> = comp.state.surfaces[parent_key]
        .current
        .stack
        .iter()
        .map(|e| e.surface)
        .collect();
    assert_eq!(stack, vec![parent_key, child_key]);

    // The stack invariant: the parent contains itself plus exactly its
    // subsurfaces, and the child is on top for hit testing.
    let hit = comp.state.surface_under(DVec2::new(70.0, 70.0));
    assert_eq!(hit.map(|(key, _)| key), Some(child_key));
}

/// Scenario 4 (wire side): the popup's initial commit yields a configure
/// with the placement computed by the positioner.
#[test_log::test]
fn popup_configure_placement() {
    let mut comp = TestCompositor::new();
    let mut client = comp.connect();
    let qh = client.qh.clone();

    let parent = map_toplevel(&mut comp, &mut client, 200);

    let positioner = client.app.wm_base.as_ref().unwrap().create_positioner(&qh, ());
    positioner.set_size(50, 40);
    positioner.set_anchor_rect(10, 10, 100, 20);
    positioner.set_anchor(xdg_positioner::Anchor::Bottom);
    positioner.set_gravity(xdg_positioner::Gravity::Bottom);

    let popup_surface = client.app.compositor.as_ref().unwrap().create_surface(&qh, ());
    let popup_xdg = client
        .app
        .wm_base
        .as_ref()
        .unwrap()
        .get_xdg_surface(&popup_surface, &qh, ());
    let _popup = popup_xdg.get_popup(Some(&parent.xdg_surface), &positioner, &qh, ());

    popup_surface.commit();
    comp.pump(&mut client);

    // Anchored to the bottom edge of the anchor rect, growing downward,
    // unconstrained on a 1024x768 output.
    assert_eq!(client.app.popup_configures, vec![(35, 30, 50, 40)]);
}

/// Scenario 5: an implicit grab pins pointer focus for as long as any
/// button is held.
#[test_log::test]
fn implicit_grab_holds_focus() {
    let mut comp = TestCompositor::new();
    let mut client = comp.connect();
    let qh = client.qh.clone();

    let _pointer = client.app.seat.as_ref().unwrap().get_pointer(&qh, ());

    let a = map_toplevel(&mut comp, &mut client, 100);
    let b = map_toplevel(&mut comp, &mut client, 100);

    let a_key = comp.surface_key(&a.surface);
    let b_key = comp.surface_key(&b.surface);

    // Side by side: A at x=60 (the default anchor), B at x=300.
    comp.state.surfaces[b_key]
        .addons
        .xdg
        .as_mut()
        .unwrap()
        .anchor_position = DVec2::new(300.0, 60.0);

    comp.move_pointer(100.0, 100.0);
    comp.pump(&mut client);
    assert_eq!(comp.state.seat.pointer.focus, Some(a_key));

    comp.button(evdev::BTN_LEFT, true);
    comp.pump(&mut client);

    // Moving over B mid-press leaves the focus (and events) on A.
    client.app.pointer_log.clear();
    comp.move_pointer(350.0, 100.0);
    comp.pump(&mut client);
    assert_eq!(comp.state.seat.pointer.focus, Some(a_key));
    assert!(client
        .app
        .pointer_log
        .iter()
        .all(|event| matches!(event, PointerLog::Motion)));

    // Releasing the last button re-evaluates focus.
    comp.button(evdev::BTN_LEFT, false);
    comp.pump(&mut client);
    assert_eq!(comp.state.seat.pointer.focus, Some(b_key));

    let a_id = a.surface.id().protocol_id();
    let b_id = b.surface.id().protocol_id();
    let transitions: Vec<&PointerLog> = client
        .app
        .pointer_log
        .iter()
        .filter(|event| matches!(event, PointerLog::Enter(_) | PointerLog::Leave(_)))
        .collect();
    assert_eq!(
        transitions,
        vec![&PointerLog::Leave(a_id), &PointerLog::Enter(b_id)]
    );
}

/// Selection: replacing the selection cancels the old source exactly once,
/// and later offers from it are ignored.
#[test_log::test]
fn selection_cancels_previous_source() {
    let mut comp = TestCompositor::new();
    let mut client = comp.connect();
    let qh = client.qh.clone();

    let manager = client.app.data_device_manager.clone().unwrap();
    let seat = client.app.seat.clone().unwrap();
    let device = manager.get_data_device(&seat, &qh, ());

    let source_a = manager.create_data_source(&qh, ());
    source_a.offer("text/plain".to_string());

    device.set_selection(Some(&source_a), 0);
    comp.pump(&mut client);
    assert_eq!(client.app.source_cancelled, 0);

    // Replacing the selection cancels A, exactly once.
    let source_b = manager.create_data_source(&qh, ());
    source_b.offer("text/plain".to_string());
    device.set_selection(Some(&source_b), 0);
    comp.pump(&mut client);
    assert_eq!(client.app.source_cancelled, 1);

    // Still exactly one cancel after more activity, and A's late offer is
    // dropped.
    source_a.offer("text/html".to_string());
    comp.pump(&mut client);
    assert_eq!(client.app.source_cancelled, 1);

    let a_mimes = comp
        .state
        .data
        .sources
        .iter()
        .find(|(_, s)| s.cancelled)
        .map(|(_, s)| s.mime_types.clone())
        .unwrap();
    assert_eq!(a_mimes, vec!["text/plain".to_string()]);
}

/// Scenario 6: drag-and-drop across three surfaces, with an accepted mime
/// type on the final target.
#[test_log::test]
fn drag_and_drop_across_surfaces() {
    let mut comp = TestCompositor::new();
    let mut client = comp.connect();
    let qh = client.qh.clone();

    let _pointer = client.app.seat.as_ref().unwrap().get_pointer(&qh, ());
    let manager = client.app.data_device_manager.clone().unwrap();
    let seat = client.app.seat.clone().unwrap();
    let device = manager.get_data_device(&seat, &qh, ());

    let a = map_toplevel(&mut comp, &mut client, 100);
    let b = map_toplevel(&mut comp, &mut client, 100);
    let c = map_toplevel(&mut comp, &mut client, 100);

    let a_key = comp.surface_key(&a.surface);
    let b_key = comp.surface_key(&b.surface);
    let c_key = comp.surface_key(&c.surface);

    for (key, x) in [(a_key, 0.0), (b_key, 200.0), (c_key, 400.0)] {
        comp.state.surfaces[key]
            .addons
            .xdg
            .as_mut()
            .unwrap()
            .anchor_position = DVec2::new(x, 0.0);
    }

    let source = manager.create_data_source(&qh, ());
    source.offer("text/plain".to_string());
    source.offer("text/uri-list".to_string());
    source.set_actions(wl_data_device_manager::DndAction::Copy);

    comp.move_pointer(50.0, 50.0);
    comp.button(evdev::BTN_LEFT, true);
    comp.pump(&mut client);

    device.start_drag(Some(&source), &a.surface, None, 0);
    comp.pump(&mut client);

    comp.move_pointer(250.0, 50.0);
    comp.pump(&mut client);
    comp.move_pointer(450.0, 50.0);
    comp.pump(&mut client);

    let a_id = a.surface.id().protocol_id();
    let b_id = b.surface.id().protocol_id();
    let c_id = c.surface.id().protocol_id();

    let transitions: Vec<&DndLog> = client
        .app
        .dnd_log
        .iter()
        .filter(|event| !matches!(event, DndLog::Motion))
        .collect();
    assert_eq!(
        transitions,
        vec![
            &DndLog::Enter(a_id),
            &DndLog::Leave,
            &DndLog::Enter(b_id),
            &DndLog::Leave,
            &DndLog::Enter(c_id),
        ]
    );
    assert_eq!(
        client.app.offer_mimes,
        vec!["text/plain".to_string(), "text/uri-list".to_string()]
    );

    // Accept a mime and pick an action on the live offer.
    let offer = client.app.offers.last().unwrap().clone();
    offer.accept(0, Some("text/uri-list".to_string()));
    offer.set_actions(
        wl_data_device_manager::DndAction::Copy,
        wl_data_device_manager::DndAction::Copy,
    );
    comp.pump(&mut client);

    comp.button(evdev::BTN_LEFT, false);
    comp.pump(&mut client);

    assert_eq!(client.app.dnd_log.last(), Some(&DndLog::Drop));
    assert_eq!(client.app.source_drop_performed, 1);
    assert_eq!(client.app.source_cancelled, 0);
}

/// Frame callbacks from successive commits arrive in commit order after a
/// frame is rendered.
#[test_log::test]
fn frame_callbacks_in_commit_order() {
    let mut comp = TestCompositor::new();
    let mut client = comp.connect();
    let qh = client.qh.clone();

    let window = map_toplevel(&mut comp, &mut client, 100);

    let _cb1 = window.surface.frame(&qh, 1u32);
    window.surface.commit();
    comp.pump(&mut client);

    let _cb2 = window.surface.frame(&qh, 2u32);
    window.surface.commit();
    comp.pump(&mut client);

    // The vsync boundary makes the output eligible again.
    let output = comp.output_key();
    comp.state.output_vsync(output);
    comp.state.request_frame(output);
    comp.pump(&mut client);

    assert_eq!(client.app.frame_done, vec![1, 2]);
}

/// Frame pacing: with deferred GPU completion, dispatches stop at the
/// in-flight cap and the queued request fires on completion.
#[test_log::test]
fn frame_pacing_respects_in_flight_cap() {
    let mut comp = TestCompositor::new();

    // Drain the frame dispatched when the output appeared.
    comp.state.device.retire_completed().unwrap();
    comp.state.reap_finished_frames();

    let output = comp.output_key();
    assert_eq!(comp.state.outputs[output].frames_in_flight, 0);

    comp.device.set_auto_complete(false);
    // Async mode so eligibility is purely the in-flight cap.
    comp.state.outputs[output].vsync = false;

    comp.state.request_frame(output);
    comp.state.request_frame(output);
    assert_eq!(comp.state.outputs[output].frames_in_flight, 2);

    // Over the cap: queued, not dispatched.
    comp.state.request_frame(output);
    assert_eq!(comp.state.outputs[output].frames_in_flight, 2);
    assert!(comp.state.outputs[output].frame_requested);

    // One completion frees a slot and the queued request dispatches.
    comp.device.complete_one().unwrap();
    comp.state.device.retire_completed().unwrap();
    comp.state.reap_finished_frames();
    assert_eq!(comp.state.outputs[output].frames_in_flight, 2);
    assert!(!comp.state.outputs[output].frame_requested);
}

/// The renderer draws the scene bottom-to-top: backstop, content, border.
#[test_log::test]
fn draw_list_order() {
    let mut comp = TestCompositor::new();
    let mut client = comp.connect();

    let _window = map_toplevel(&mut comp, &mut client, 100);

    comp.device.take_draw_log();
    let output = comp.output_key();
    comp.state.output_vsync(output);
    comp.state.request_frame(output);

    let log = comp.device.take_draw_log();
    assert!(log.len() >= 2, "expected a backstop and the surface");

    // Backstop first (solid), then the textured surface above it.
    assert!(log[0].image.is_none());
    assert!(log.iter().any(|draw| draw.image.is_some()));

    let solid_first = log.iter().position(|d| d.image.is_none()).unwrap();
    let textured = log.iter().position(|d| d.image.is_some()).unwrap();
    assert!(solid_first < textured);
}
