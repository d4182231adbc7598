//! Controller service: provisions and deletes `JivaVolume` resources.
//!
//! Provisioning itself is done asynchronously by the operator. CreateVolume
//! returns as soon as the resource exists and the node waits for the volume
//! to become ready when staging it.

use std::sync::Arc;

use kube::ResourceExt;
use tonic::{Request, Response, Status};

use crate::{
    csi::*,
    is_supported_access_mode,
    limiter::InFlightVolumes,
    store::VolumeStore,
    volume::{self, VolumeDefaults},
};

pub struct Controller {
    store: Arc<dyn VolumeStore>,
    inflight: InFlightVolumes,
    defaults: VolumeDefaults,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl Controller {
    pub fn new(store: Arc<dyn VolumeStore>, defaults: VolumeDefaults) -> Self {
        Self {
            store,
            inflight: InFlightVolumes::new(),
            defaults,
        }
    }

    /// Share the in-flight reservations with `inflight`.
    pub fn with_inflight(mut self, inflight: InFlightVolumes) -> Self {
        self.inflight = inflight;
        self
    }
}

/// Check that every requested capability uses the supported access mode.
fn check_capabilities(
    name: &str,
    capabilities: &[VolumeCapability],
) -> Result<(), Status> {
    if capabilities.is_empty() {
        return Err(failure!(
            Code::InvalidArgument,
            "Missing volume capabilities for {}",
            name
        ));
    }
    for capability in capabilities {
        if !is_supported_access_mode(&capability.access_mode) {
            return Err(failure!(
                Code::InvalidArgument,
                "Volume {}: unsupported access mode {:?}, only {:?} is supported",
                name,
                capability.access_mode,
                crate::SUPPORTED_ACCESS_MODE
            ));
        }
    }
    Ok(())
}

#[tonic::async_trait]
impl controller_server::Controller for Controller {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("{:?}", msg);

        if msg.name.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Volume name missing in request"
            ));
        }
        check_capabilities(&msg.name, &msg.volume_capabilities)?;

        let volume = volume::volume_from_request(&msg, &self.defaults)?;
        let name = volume.name_any();
        let namespace = volume
            .namespace()
            .unwrap_or_else(|| self.defaults.namespace.clone());
        let capacity_bytes = volume::provisioned_bytes(&msg, &self.defaults)?;

        let _guard = self.inflight.guard(&name)?;

        self.store.refresh().await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to refresh store for volume {}: {}",
                name,
                error
            )
        })?;

        match self.store.get(&namespace, &name).await {
            Ok(existing) => {
                if existing.spec.capacity != volume.spec.capacity {
                    return Err(failure!(
                        Code::AlreadyExists,
                        "Volume {} already exists with capacity {}, requested {}",
                        name,
                        existing.spec.capacity,
                        volume.spec.capacity
                    ));
                }
                debug!("Volume {} already exists", name);
            }
            Err(error) if error.is_not_found() => {
                self.store.create(&volume).await.map_err(|error| {
                    failure!(
                        Code::Internal,
                        "Failed to create volume {}: {}",
                        name,
                        error
                    )
                })?;
                info!(
                    "Volume {} created in namespace {} with capacity {}",
                    name, namespace, volume.spec.capacity
                );
            }
            Err(error) => {
                return Err(failure!(
                    Code::Internal,
                    "Failed to get volume {}: {}",
                    name,
                    error
                ));
            }
        }

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes,
                volume_id: name,
                volume_context: msg.parameters,
                content_source: None,
                accessible_topology: Vec::new(),
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("{:?}", msg);

        let volume_id = &msg.volume_id;
        if volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Volume ID missing in request"
            ));
        }

        let _guard = self.inflight.guard(volume_id)?;

        self.store.refresh().await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to refresh store for volume {}: {}",
                volume_id,
                error
            )
        })?;

        let volumes = self
            .store
            .list(&volume::labels(volume_id))
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "Failed to list volumes for {}: {}",
                    volume_id,
                    error
                )
            })?;

        let volume = match volumes.first() {
            Some(volume) => volume,
            None => {
                info!("Volume {} does not exist, nothing to delete", volume_id);
                return Ok(Response::new(DeleteVolumeResponse {}));
            }
        };

        match self.store.delete(volume).await {
            Err(error) if !error.is_not_found() => {
                return Err(failure!(
                    Code::Internal,
                    "Failed to delete volume {}: {}",
                    volume_id,
                    error
                ));
            }
            _ => {}
        }

        info!("Volume {} deleted", volume_id);
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn validate_volume_capabilities(
        &self,
        _request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let caps =
            vec![controller_service_capability::rpc::Type::CreateDeleteVolume];

        debug!("ControllerGetCapabilities request: {:?}", caps);

        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|c| ControllerServiceCapability {
                    r#type: Some(controller_service_capability::Type::Rpc(
                        controller_service_capability::Rpc {
                            r#type: c as i32,
                        },
                    )),
                })
                .collect(),
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }
}
