use cursor_icon::CursorIcon;
use glam::{IVec2, UVec2};
use hashbrown::HashMap;
use tracing::{debug, warn};
use wayland_protocols::wp::cursor_shape::v1::server::wp_cursor_shape_device_v1;
use wayland_server::{protocol::wl_pointer, Resource as _};

use crate::{
    compositor::{
        surface::{CursorAddon, Role, SurfaceKey},
        State,
    },
    config::CursorConfig,
    gpu::{self, ImageDesc, ImageHandle},
};

/// What the renderer should draw at the pointer position.
pub enum CursorRender {
    Surface(SurfaceKey),
    Texture { image: ImageHandle, hotspot: IVec2 },
    Hidden,
}

/// Cursor selection state. Priority: an active cursor-shape choice, then
/// the focused client's cursor surface, then the XCursor theme fallback.
pub struct CursorState {
    theme: String,
    size: u32,

    pub shape: Option<CursorIcon>,
    pub surface: Option<SurfaceKey>,

    cache: HashMap<String, Option<(ImageHandle, IVec2)>>,
}

impl CursorState {
    pub fn new(config: &CursorConfig) -> Self {
        Self {
            theme: config.theme.clone(),
            size: config.size,
            shape: None,
            surface: None,
            cache: HashMap::new(),
        }
    }

    /// Entering a different client's surface resets any client-provided
    /// cursor; the new client will set its own.
    pub fn reset_for_enter(&mut self) {
        self.shape = None;
        self.surface = None;
    }

    pub fn surface_gone(&mut self, key: SurfaceKey) {
        if self.surface == Some(key) {
            self.surface = None;
        }
    }

    fn load_icon(
        &mut self,
        device: &gpu::DeviceHandle,
        name: &str,
    ) -> Option<(ImageHandle, IVec2)> {
        if let Some(cached) = self.cache.get(name) {
            return cached.clone();
        }

        let loaded = load_xcursor_icon(device, &self.theme, name, self.size);
        if loaded.is_none() {
            warn!(name, theme = %self.theme, "failed to load cursor icon");
        }

        self.cache.insert(name.to_string(), loaded.clone());
        loaded
    }
}

fn load_xcursor_icon(
    device: &gpu::DeviceHandle,
    theme: &str,
    name: &str,
    size: u32,
) -> Option<(ImageHandle, IVec2)> {
    let theme = xcursor::CursorTheme::load(theme);
    let path = theme.load_icon(name)?;
    let data = std::fs::read(path).ok()?;
    let images = xcursor::parser::parse_xcursor(&data)?;

    // Nearest available nominal size.
    let image = images
        .iter()
        .min_by_key(|image| image.size.abs_diff(size))?;

    let handle = device
        .create_image(&ImageDesc {
            size: UVec2::new(image.width, image.height),
            format: drm_fourcc::DrmFourcc::Abgr8888,
        })
        .ok()?;
    device
        .update_image(&handle, &image.pixels_rgba, image.width * 4)
        .ok()?;

    debug!(name, width = image.width, height = image.height, "loaded cursor icon");
    Some((handle, IVec2::new(image.xhot as i32, image.yhot as i32)))
}

impl State {
    /// Resolves the cursor to draw this frame.
    pub fn current_cursor(&mut self) -> CursorRender {
        if let Some(shape) = self.cursor.shape {
            let device = self.device.clone();
            if let Some((image, hotspot)) = self.cursor.load_icon(&device, shape.name()) {
                return CursorRender::Texture { image, hotspot };
            }
        }

        if let Some(key) = self.cursor.surface {
            if let Some(surface) = self.surfaces.get(key) {
                if surface.current.buffer.is_some() {
                    return CursorRender::Surface(key);
                }
                // A cursor surface without content hides the cursor.
                return CursorRender::Hidden;
            }
        }

        let device = self.device.clone();
        match self.cursor.load_icon(&device, CursorIcon::Default.name()) {
            Some((image, hotspot)) => CursorRender::Texture { image, hotspot },
            None => CursorRender::Hidden,
        }
    }

    /// wl_pointer.set_cursor. The serial must belong to a recent
    /// pointer-enter for the requesting client.
    pub fn set_cursor_surface(
        &mut self,
        wl_pointer: &wl_pointer::WlPointer,
        serial: u32,
        surface: Option<SurfaceKey>,
        hotspot: IVec2,
    ) {
        let Some(client) = wl_pointer.client() else {
            return;
        };

        if self.seat.pointer.enter_serials.get(&client.id()) != Some(&serial) {
            debug!(serial, "ignoring set_cursor with stale serial");
            return;
        }

        if let Some(key) = surface {
            let Some(surf) = self.surfaces.get_mut(key) else {
                return;
            };

            // The surface takes (or must already have) the cursor role.
            match surf.role {
                None => {
                    surf.role = Some(Role::Cursor);
                    surf.addons.cursor = Some(CursorAddon { hotspot });
                }
                Some(Role::Cursor) => {
                    if let Some(cursor) = surf.addons.cursor.as_mut() {
                        cursor.hotspot = hotspot;
                    }
                }
                Some(_) => {
                    debug!(surface = ?surf, "ignoring cursor role for surface with another role");
                    return;
                }
            }
        }

        self.cursor.shape = None;
        self.cursor.surface = surface;
    }

    /// wp_cursor_shape_device_v1.set_shape.
    pub fn set_cursor_shape(
        &mut self,
        wl_pointer: &wl_pointer::WlPointer,
        serial: u32,
        shape: wp_cursor_shape_device_v1::Shape,
    ) {
        let Some(client) = wl_pointer.client() else {
            return;
        };

        if self.seat.pointer.enter_serials.get(&client.id()) != Some(&serial) {
            debug!(serial, "ignoring set_shape with stale serial");
            return;
        }

        self.cursor.shape = Some(shape_icon(shape));
        self.cursor.surface = None;
    }
}

/// wp_cursor_shape shapes map 1:1 onto the CSS cursor names.
fn shape_icon(shape: wp_cursor_shape_device_v1::Shape) -> CursorIcon {
    use wp_cursor_shape_device_v1::Shape;
    match shape {
        Shape::Default => CursorIcon::Default,
        Shape::ContextMenu => CursorIcon::ContextMenu,
        Shape::Help => CursorIcon::Help,
        Shape::Pointer => CursorIcon::Pointer,
        Shape::Progress => CursorIcon::Progress,
        Shape::Wait => CursorIcon::Wait,
        Shape::Cell => CursorIcon::Cell,
        Shape::Crosshair => CursorIcon::Crosshair,
        Shape::Text => CursorIcon::Text,
        Shape::VerticalText => CursorIcon::VerticalText,
        Shape::Alias => CursorIcon::Alias,
        Shape::Copy => CursorIcon::Copy,
        Shape::Move => CursorIcon::Move,
        Shape::NoDrop => CursorIcon::NoDrop,
        Shape::NotAllowed => CursorIcon::NotAllowed,
        Shape::Grab => CursorIcon::Grab,
        Shape::Grabbing => CursorIcon::Grabbing,
        Shape::EResize => CursorIcon::EResize,
        Shape::NResize => CursorIcon::NResize,
        Shape::NeResize => CursorIcon::NeResize,
        Shape::NwResize => CursorIcon::NwResize,
        Shape::SResize => CursorIcon::SResize,
        Shape::SeResize => CursorIcon::SeResize,
        Shape::SwResize => CursorIcon::SwResize,
        Shape::WResize => CursorIcon::WResize,
        Shape::EwResize => CursorIcon::EwResize,
        Shape::NsResize => CursorIcon::NsResize,
        Shape::NeswResize => CursorIcon::NeswResize,
        Shape::NwseResize => CursorIcon::NwseResize,
        Shape::ColResize => CursorIcon::ColResize,
        Shape::RowResize => CursorIcon::RowResize,
        Shape::AllScroll => CursorIcon::AllScroll,
        Shape::ZoomIn => CursorIcon::ZoomIn,
        Shape::ZoomOut => CursorIcon::ZoomOut,
        _ => CursorIcon::Default,
    }
}
