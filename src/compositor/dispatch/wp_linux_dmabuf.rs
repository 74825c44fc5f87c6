use std::{
    os::fd::{AsFd as _, OwnedFd},
    sync::{Arc, Mutex},
};

use drm_fourcc::DrmFourcc;
use glam::UVec2;
use wayland_protocols::wp::linux_dmabuf::zv1::server::{
    zwp_linux_buffer_params_v1, zwp_linux_dmabuf_feedback_v1, zwp_linux_dmabuf_v1,
};
use wayland_server::{protocol::wl_buffer, Resource as _, WEnum};

use crate::{
    compositor::{
        buffers::{import_dmabuf_buffer, validate_buffer_parameters, PlaneMetadata},
        make_u64, State,
    },
    gpu::{self, DmabufImport, DmabufPlane, PlaneLayout},
};

impl wayland_server::GlobalDispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
        request: zwp_linux_dmabuf_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zwp_linux_dmabuf_v1::Request::CreateParams { params_id } => {
                data_init.init(params_id, Arc::new(Mutex::new(Params::Empty)));
            }
            zwp_linux_dmabuf_v1::Request::GetDefaultFeedback { id } => {
                let feedback = data_init.init(id, ());
                state.emit_dmabuf_feedback(&feedback);
            }
            zwp_linux_dmabuf_v1::Request::GetSurfaceFeedback { id, .. } => {
                // Per-surface feedback matches the default tranche.
                let feedback = data_init.init(id, ());
                state.emit_dmabuf_feedback(&feedback);
            }
            zwp_linux_dmabuf_v1::Request::Destroy => (),
            _ => (),
        }
    }
}

/// Single-plane import parameters. Multi-plane stays in the wire model but
/// is rejected at add time.
#[derive(Debug)]
enum Params {
    Empty,
    Config {
        fd: OwnedFd,
        offset: u32,
        stride: u32,
        modifier: u64,
    },
    Done,
}

impl
    wayland_server::Dispatch<
        zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
        Arc<Mutex<Params>>,
    > for State
{
    fn request(
        state: &mut Self,
        client: &wayland_server::Client,
        resource: &zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
        request: zwp_linux_buffer_params_v1::Request,
        data: &Arc<Mutex<Params>>,
        dh: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zwp_linux_buffer_params_v1::Request::Add {
                fd,
                plane_idx,
                offset,
                stride,
                modifier_hi,
                modifier_lo,
            } => {
                if plane_idx > 0 {
                    resource.post_error(
                        zwp_linux_buffer_params_v1::Error::PlaneIdx,
                        "Multiplane images are not supported.",
                    );
                    return;
                }

                let mut params = data.lock().unwrap();
                if matches!(*params, Params::Config { .. } | Params::Done) {
                    resource.post_error(
                        zwp_linux_buffer_params_v1::Error::PlaneSet,
                        "Plane 0 already configured.",
                    );
                    return;
                }

                *params = Params::Config {
                    fd,
                    offset,
                    stride,
                    modifier: make_u64(modifier_hi, modifier_lo),
                };
            }
            zwp_linux_buffer_params_v1::Request::Create {
                width,
                height,
                format,
                flags,
            } => {
                let mut params = data.lock().unwrap();
                let metadata = match validate_create(&params, width, height, format, flags) {
                    Ok(metadata) => metadata,
                    Err((code, message)) => {
                        resource.post_error(code, message);
                        return;
                    }
                };

                let Params::Config { fd, modifier, .. } =
                    std::mem::replace(&mut *params, Params::Done)
                else {
                    unreachable!();
                };

                let device = state.device.clone();
                let key = state.buffers.try_insert_with_key(|key| {
                    client
                        .create_resource::<wl_buffer::WlBuffer, _, State>(dh, 1, key)
                        .map(|wl_buffer| {
                            let import = build_import(metadata, modifier, fd);
                            import_dmabuf_buffer(&device, wl_buffer, import, metadata)
                        })
                });

                match key.ok().and_then(|key| state.buffers.get(key)) {
                    Some(buffer) if buffer.image.is_some() => {
                        resource.created(&buffer.wl_buffer);
                    }
                    _ => resource.failed(),
                }
            }
            zwp_linux_buffer_params_v1::Request::CreateImmed {
                buffer_id,
                width,
                height,
                format,
                flags,
            } => {
                let mut params = data.lock().unwrap();
                let metadata = match validate_create(&params, width, height, format, flags) {
                    Ok(metadata) => metadata,
                    Err((code, message)) => {
                        resource.post_error(code, message);
                        return;
                    }
                };

                let Params::Config { fd, modifier, .. } =
                    std::mem::replace(&mut *params, Params::Done)
                else {
                    unreachable!();
                };

                let device = state.device.clone();
                state.buffers.insert_with_key(|key| {
                    let wl_buffer = data_init.init(buffer_id, key);
                    let import = build_import(metadata, modifier, fd);
                    // Import failures leave a zombie; commits on it are
                    // cleared with a warning rather than killing the
                    // client.
                    import_dmabuf_buffer(&device, wl_buffer, import, metadata)
                });
            }
            zwp_linux_buffer_params_v1::Request::Destroy => (),
            _ => (),
        }
    }
}

fn build_import(metadata: PlaneMetadata, modifier: u64, fd: OwnedFd) -> DmabufImport {
    DmabufImport {
        size: UVec2::new(metadata.width, metadata.height),
        format: metadata.format,
        modifier: modifier.into(),
        planes: vec![DmabufPlane {
            fd,
            layout: PlaneLayout {
                offset: metadata.offset,
                stride: metadata.stride,
            },
        }],
    }
}

fn validate_create(
    params: &Params,
    width: i32,
    height: i32,
    format: u32,
    flags: WEnum<zwp_linux_buffer_params_v1::Flags>,
) -> Result<PlaneMetadata, (zwp_linux_buffer_params_v1::Error, String)> {
    if !flags
        .into_result()
        .map(|f| f.is_empty())
        .unwrap_or_default()
    {
        return Err((
            zwp_linux_buffer_params_v1::Error::InvalidFormat,
            "Flags are not supported.".to_string(),
        ));
    }

    match *params {
        Params::Empty => {
            return Err((
                zwp_linux_buffer_params_v1::Error::Incomplete,
                "Plane 0 not configured.".to_string(),
            ))
        }
        Params::Done => {
            return Err((
                zwp_linux_buffer_params_v1::Error::AlreadyUsed,
                "Params already consumed.".to_string(),
            ))
        }
        _ => (),
    }

    let format = match DrmFourcc::try_from(format) {
        Ok(format) => format,
        Err(_) => {
            return Err((
                zwp_linux_buffer_params_v1::Error::InvalidFormat,
                "Unknown format.".to_string(),
            ))
        }
    };

    let Some(bpp) = gpu::fourcc_bpp(format) else {
        return Err((
            zwp_linux_buffer_params_v1::Error::InvalidFormat,
            "Unsupported format.".to_string(),
        ));
    };

    let Params::Config { offset, stride, .. } = params else {
        unreachable!()
    };

    if let Err(message) =
        validate_buffer_parameters(*offset as i32, width, height, *stride as i32, bpp)
    {
        return Err((zwp_linux_buffer_params_v1::Error::InvalidDimensions, message));
    }

    Ok(PlaneMetadata {
        format,
        width: width as u32,
        height: height as u32,
        stride: *stride,
        offset: *offset,
    })
}

impl State {
    /// Sends the feedback tranche set: primary device, sealed format
    /// table, and one tranche listing every table entry.
    pub fn emit_dmabuf_feedback(
        &self,
        feedback: &zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1,
    ) {
        let Some(cached) = self.cached_feedback.as_ref() else {
            feedback.done();
            return;
        };

        let device_bytes = cached.main_device.to_ne_bytes().to_vec();

        feedback.format_table(cached.table.as_fd(), cached.table.size() as u32);
        feedback.main_device(device_bytes.clone());
        feedback.tranche_target_device(device_bytes);
        feedback.tranche_formats(cached.indices.clone());
        feedback.tranche_flags(zwp_linux_dmabuf_feedback_v1::TrancheFlags::empty());
        feedback.tranche_done();
        feedback.done();
    }
}

impl wayland_server::Dispatch<zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1, ()>
    for State
{
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1,
        _request: zwp_linux_dmabuf_feedback_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}
