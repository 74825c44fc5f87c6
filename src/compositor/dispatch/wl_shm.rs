use std::{
    os::fd::AsRawFd as _,
    sync::{Arc, RwLock},
};

use tracing::error;
use wayland_server::{
    protocol::{wl_buffer, wl_shm, wl_shm_pool},
    Resource as _,
};

use crate::compositor::{
    buffers::{import_shm_buffer, validate_buffer_parameters, BufferKey, PlaneMetadata},
    shm::{Pool, ShmPool, ShmPoolKey},
    State,
};

impl wayland_server::GlobalDispatch<wl_shm::WlShm, ()> for State {
    fn bind(
        state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_shm::WlShm>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let wl_shm = data_init.init(resource, ());

        for format in state.device.shm_formats() {
            match format {
                drm_fourcc::DrmFourcc::Argb8888 => wl_shm.format(wl_shm::Format::Argb8888),
                drm_fourcc::DrmFourcc::Xrgb8888 => wl_shm.format(wl_shm::Format::Xrgb8888),
                _ => (),
            }
        }
    }
}

impl wayland_server::Dispatch<wl_shm::WlShm, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        wl_shm: &wl_shm::WlShm,
        request: wl_shm::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_shm::Request::CreatePool { id, fd, size } => {
                if size <= 0 {
                    wl_shm.post_error(
                        wl_shm::Error::InvalidStride,
                        "Negative or zero size provided.",
                    );
                    return;
                }

                let fd_debug = fd.as_raw_fd();
                let pool = match Pool::new(fd, size as usize) {
                    Ok(pool) => pool,
                    Err(err) => {
                        error!(?err, fd = fd_debug, size, "failed to map client shm");
                        wl_shm.post_error(wl_shm::Error::InvalidFd, "mmap failed.");
                        return;
                    }
                };

                state.shm_pools.insert_with_key(|key| {
                    let wl_shm_pool = data_init.init(id, key);
                    ShmPool {
                        _wl_shm: wl_shm.clone(),
                        _wl_shm_pool: wl_shm_pool,
                        // Buffers keep the mapping alive after pool destroy.
                        pool: Arc::new(RwLock::new(pool)),
                    }
                });
            }
            // Release (v2) needs no bookkeeping.
            _ => (),
        }
    }
}

impl wayland_server::Dispatch<wl_shm_pool::WlShmPool, ShmPoolKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_shm_pool::WlShmPool,
        request: wl_shm_pool::Request,
        data: &ShmPoolKey,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let pool = state
                    .shm_pools
                    .get(*data)
                    .expect("shm pool has no entry")
                    .pool
                    .clone();

                let format = match format.into_result() {
                    Ok(wl_shm::Format::Argb8888) => drm_fourcc::DrmFourcc::Argb8888,
                    Ok(wl_shm::Format::Xrgb8888) => drm_fourcc::DrmFourcc::Xrgb8888,
                    _ => {
                        resource.post_error(wl_shm::Error::InvalidFormat, "Invalid format.");
                        return;
                    }
                };

                if let Err(message) = validate_buffer_parameters(offset, width, height, stride, 4) {
                    resource.post_error(wl_shm::Error::InvalidStride, message);
                    return;
                }

                let buffer_size = stride * height;
                if (offset + buffer_size) as usize > pool.read().unwrap().size {
                    resource
                        .post_error(wl_shm::Error::InvalidStride, "Size exceeds pool capacity.");
                    return;
                }

                let format = PlaneMetadata {
                    format,
                    width: width as u32,
                    height: height as u32,
                    stride: stride as u32,
                    offset: offset as u32,
                };

                let device = state.device.clone();
                state.buffers.insert_with_key(|key| {
                    let wl_buffer = data_init.init(id, key);
                    import_shm_buffer(&device, wl_buffer, pool, format)
                });
            }
            wl_shm_pool::Request::Resize { size } => {
                let shm_pool = state.shm_pools.get_mut(*data).expect("pool has no entry");
                let mut pool = shm_pool.pool.write().unwrap();

                if size <= pool.size as i32 {
                    resource.post_error(wl_shm::Error::InvalidStride, "Pools can only grow.");
                    return;
                }

                if let Err(err) = pool.resize(size as usize) {
                    error!(?err, "failed to remap shm");
                    resource.post_error(wl_shm::Error::InvalidFd, "mmap operation failed.");
                }
            }
            wl_shm_pool::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_shm_pool::WlShmPool,
        data: &ShmPoolKey,
    ) {
        // Buffers referencing the pool hold their own Arc.
        state.shm_pools.remove(*data);
    }
}

impl wayland_server::Dispatch<wl_buffer::WlBuffer, BufferKey> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_buffer::WlBuffer,
        request: wl_buffer::Request,
        _data: &BufferKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_buffer::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_buffer::WlBuffer,
        data: &BufferKey,
    ) {
        // Deferred until any outstanding lock clears.
        if let Some(buffer) = state.buffers.get_mut(*data) {
            buffer.needs_destruction = true;
        }
    }
}
