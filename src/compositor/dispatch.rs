//! GlobalDispatch/Dispatch impls wiring each protocol family to the core.

mod decoration;
mod wl_compositor;
mod wl_data_device_manager;
mod wl_output;
mod wl_seat;
mod wl_shm;
mod wl_subcompositor;
mod wp_cursor_shape;
mod wp_linux_dmabuf;
mod wp_linux_drm_syncobj;
mod wp_pointer_constraints;
mod wp_pointer_gestures;
mod wp_relative_pointer;
mod wp_viewporter;
mod xdg_shell;
