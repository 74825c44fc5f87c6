use tracing::error;
use wayland_protocols::wp::linux_drm_syncobj::v1::server::{
    wp_linux_drm_syncobj_manager_v1, wp_linux_drm_syncobj_surface_v1,
    wp_linux_drm_syncobj_timeline_v1,
};
use wayland_server::Resource as _;

use crate::{
    compositor::{
        buffers::{SyncTimeline, SyncTimelineKey},
        make_u64,
        surface::{SurfaceKey, SyncobjAddon},
        State,
    },
    gpu::TimelinePoint,
};

impl wayland_server::GlobalDispatch<wp_linux_drm_syncobj_manager_v1::WpLinuxDrmSyncobjManagerV1, ()>
    for State
{
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wp_linux_drm_syncobj_manager_v1::WpLinuxDrmSyncobjManagerV1>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<wp_linux_drm_syncobj_manager_v1::WpLinuxDrmSyncobjManagerV1, ()>
    for State
{
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wp_linux_drm_syncobj_manager_v1::WpLinuxDrmSyncobjManagerV1,
        request: wp_linux_drm_syncobj_manager_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wp_linux_drm_syncobj_manager_v1::Request::GetSurface { id, surface } => {
                let Some(key) = surface.data::<SurfaceKey>().copied() else {
                    return;
                };

                let Some(surf) = state.surfaces.get_mut(key) else {
                    return;
                };
                if surf.addons.syncobj.is_some() {
                    resource.post_error(
                        wp_linux_drm_syncobj_manager_v1::Error::SurfaceExists,
                        "A syncobj surface already exists for that wl_surface.",
                    );
                    return;
                }

                let wp_syncobj_surface = data_init.init(id, key);
                surf.addons.syncobj = Some(SyncobjAddon {
                    resource: wp_syncobj_surface,
                    acquire: None,
                    release: None,
                });
            }
            wp_linux_drm_syncobj_manager_v1::Request::ImportTimeline { id, fd } => {
                let timeline = match state.device.import_syncobj(fd) {
                    Ok(timeline) => timeline,
                    Err(err) => {
                        error!(?err, "failed to import syncobj timeline");
                        resource.post_error(
                            wp_linux_drm_syncobj_manager_v1::Error::InvalidTimeline,
                            "Failed to import timeline.",
                        );
                        return;
                    }
                };

                state.sync_timelines.insert_with_key(|key| {
                    data_init.init(id, key);
                    SyncTimeline { timeline }
                });
            }
            wp_linux_drm_syncobj_manager_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl
    wayland_server::Dispatch<
        wp_linux_drm_syncobj_surface_v1::WpLinuxDrmSyncobjSurfaceV1,
        SurfaceKey,
    > for State
{
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wp_linux_drm_syncobj_surface_v1::WpLinuxDrmSyncobjSurfaceV1,
        request: wp_linux_drm_syncobj_surface_v1::Request,
        surface_key: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wp_linux_drm_syncobj_surface_v1::Request::SetAcquirePoint {
                timeline,
                point_hi,
                point_lo,
            } => {
                let Some(timeline) = timeline
                    .data::<SyncTimelineKey>()
                    .and_then(|key| state.sync_timelines.get(*key))
                else {
                    return;
                };
                let point = TimelinePoint::new(
                    timeline.timeline.clone(),
                    make_u64(point_hi, point_lo),
                );

                if let Some(syncobj) = state
                    .surfaces
                    .get_mut(*surface_key)
                    .and_then(|s| s.addons.syncobj.as_mut())
                {
                    syncobj.acquire = Some(point);
                }
            }
            wp_linux_drm_syncobj_surface_v1::Request::SetReleasePoint {
                timeline,
                point_hi,
                point_lo,
            } => {
                let Some(timeline) = timeline
                    .data::<SyncTimelineKey>()
                    .and_then(|key| state.sync_timelines.get(*key))
                else {
                    return;
                };
                let point = TimelinePoint::new(
                    timeline.timeline.clone(),
                    make_u64(point_hi, point_lo),
                );

                if let Some(syncobj) = state
                    .surfaces
                    .get_mut(*surface_key)
                    .and_then(|s| s.addons.syncobj.as_mut())
                {
                    syncobj.release = Some(point);
                }
            }
            wp_linux_drm_syncobj_surface_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wp_linux_drm_syncobj_surface_v1::WpLinuxDrmSyncobjSurfaceV1,
        surface_key: &SurfaceKey,
    ) {
        if let Some(surface) = state.surfaces.get_mut(*surface_key) {
            surface.addons.syncobj = None;
        }
    }
}

impl
    wayland_server::Dispatch<
        wp_linux_drm_syncobj_timeline_v1::WpLinuxDrmSyncobjTimelineV1,
        SyncTimelineKey,
    > for State
{
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wp_linux_drm_syncobj_timeline_v1::WpLinuxDrmSyncobjTimelineV1,
        request: wp_linux_drm_syncobj_timeline_v1::Request,
        _data: &SyncTimelineKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wp_linux_drm_syncobj_timeline_v1::Request::Destroy => (),
            _ => {
                let _ = state;
            }
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wp_linux_drm_syncobj_timeline_v1::WpLinuxDrmSyncobjTimelineV1,
        data: &SyncTimelineKey,
    ) {
        // Points already captured keep their own Arc to the timeline.
        state.sync_timelines.remove(*data);
    }
}
