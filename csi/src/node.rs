//! Node service: makes volumes usable on the node running the plugin.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::{
    csi::{
        volume_capability::{AccessType, MountVolume},
        *,
    },
    dev::IscsiConnector,
    filesystem_vol::{self, Backends},
    is_supported_access_mode,
    limiter::InFlightVolumes,
    mount::{self, Mounter},
    store::VolumeStore,
    wait::RetryPolicy,
};

pub struct Node {
    node_id: String,
    namespace: String,
    store: Arc<dyn VolumeStore>,
    connector: Arc<dyn IscsiConnector>,
    mounter: Arc<dyn Mounter>,
    inflight: InFlightVolumes,
    readiness: RetryPolicy,
    reachability: RetryPolicy,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id)
            .field("namespace", &self.namespace)
            .field("readiness", &self.readiness)
            .field("reachability", &self.reachability)
            .finish()
    }
}

impl Node {
    pub fn new(
        node_id: &str,
        namespace: &str,
        store: Arc<dyn VolumeStore>,
        connector: Arc<dyn IscsiConnector>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            namespace: namespace.to_string(),
            store,
            connector,
            mounter,
            inflight: InFlightVolumes::new(),
            readiness: RetryPolicy::default(),
            reachability: RetryPolicy::default(),
        }
    }

    /// Use `policy` to wait for volumes to be created by the operator.
    pub fn with_readiness(mut self, policy: RetryPolicy) -> Self {
        self.readiness = policy;
        self
    }

    /// Use `policy` to wait for target portals to accept connections.
    pub fn with_reachability(mut self, policy: RetryPolicy) -> Self {
        self.reachability = policy;
        self
    }

    /// Share the in-flight reservations with `inflight`.
    pub fn with_inflight(mut self, inflight: InFlightVolumes) -> Self {
        self.inflight = inflight;
        self
    }

    fn backends(&self) -> Backends<'_> {
        Backends {
            store: self.store.as_ref(),
            namespace: &self.namespace,
            connector: self.connector.as_ref(),
            mounter: self.mounter.as_ref(),
        }
    }
}

/// Pick the filesystem for a mount capability, rejecting unsupported ones.
fn filesystem(volume_id: &str, mnt: &MountVolume) -> Result<String, Status> {
    if mnt.fs_type.is_empty() {
        return Ok(mount::DEFAULT_FILESYSTEM.to_string());
    }
    if mount::is_supported_filesystem(&mnt.fs_type) {
        Ok(mnt.fs_type.clone())
    } else {
        Err(failure!(
            Code::InvalidArgument,
            "Volume {}: unsupported filesystem type: {}",
            volume_id,
            mnt.fs_type
        ))
    }
}

/// Check the capability of a stage or publish request and return its mount
/// description. Block access is reported as unimplemented.
fn mount_capability<'a>(
    volume_id: &str,
    capability: &'a Option<VolumeCapability>,
) -> Result<&'a MountVolume, Status> {
    let capability = capability.as_ref().ok_or_else(|| {
        failure!(
            Code::InvalidArgument,
            "Missing volume capability for {}",
            volume_id
        )
    })?;

    let mnt = match &capability.access_type {
        Some(AccessType::Mount(mnt)) => mnt,
        Some(AccessType::Block(_)) => {
            return Err(failure!(
                Code::Unimplemented,
                "Volume {}: block access type is not supported",
                volume_id
            ));
        }
        None => {
            return Err(failure!(
                Code::InvalidArgument,
                "Missing access type for {}",
                volume_id
            ));
        }
    };

    if !is_supported_access_mode(&capability.access_mode) {
        return Err(failure!(
            Code::InvalidArgument,
            "Volume {}: unsupported access mode {:?}",
            volume_id,
            capability.access_mode
        ));
    }

    Ok(mnt)
}

fn require(volume_id: &str, field: &str, value: &str) -> Result<(), Status> {
    if value.is_empty() {
        return Err(failure!(
            Code::InvalidArgument,
            "{} missing in request for volume {}",
            field,
            volume_id
        ));
    }
    Ok(())
}

#[tonic::async_trait]
impl node_server::Node for Node {
    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        debug!("NodeGetInfo request: ID={}", self.node_id);

        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        let caps = vec![node_service_capability::rpc::Type::StageUnstageVolume];

        debug!("NodeGetCapabilities request: {:?}", caps);

        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|c| NodeServiceCapability {
                    r#type: Some(node_service_capability::Type::Rpc(
                        node_service_capability::Rpc {
                            r#type: c as i32,
                        },
                    )),
                })
                .collect(),
        }))
    }

    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("{:?}", msg);

        require(&msg.volume_id, "Volume ID", &msg.volume_id)?;
        let mnt = match msg.volume_capability.as_ref() {
            Some(VolumeCapability {
                access_type: Some(AccessType::Block(_)),
                ..
            }) => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Volume {}: a mount capability is required",
                    msg.volume_id
                ));
            }
            _ => mount_capability(&msg.volume_id, &msg.volume_capability)?,
        };
        require(&msg.volume_id, "Staging path", &msg.staging_target_path)?;
        let fstype = filesystem(&msg.volume_id, mnt)?;

        let _guard = self.inflight.guard(&msg.volume_id)?;

        filesystem_vol::stage_fs_volume(
            &self.backends(),
            &msg,
            &fstype,
            &mnt.mount_flags,
            self.readiness,
            self.reachability,
        )
        .await?;

        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("{:?}", msg);

        require(&msg.volume_id, "Volume ID", &msg.volume_id)?;
        require(&msg.volume_id, "Staging path", &msg.staging_target_path)?;

        let _guard = self.inflight.guard(&msg.volume_id)?;

        filesystem_vol::unstage_fs_volume(&self.backends(), &msg).await?;

        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("{:?}", msg);

        require(&msg.volume_id, "Volume ID", &msg.volume_id)?;
        let mnt = mount_capability(&msg.volume_id, &msg.volume_capability)?;
        require(&msg.volume_id, "Target path", &msg.target_path)?;
        require(&msg.volume_id, "Staging path", &msg.staging_target_path)?;
        let fstype = filesystem(&msg.volume_id, mnt)?;

        let _guard = self.inflight.guard(&msg.volume_id)?;

        filesystem_vol::publish_fs_volume(
            &self.backends(),
            &msg,
            &fstype,
            &mnt.mount_flags,
        )
        .await?;

        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("{:?}", msg);

        require(&msg.volume_id, "Volume ID", &msg.volume_id)?;
        require(&msg.volume_id, "Target path", &msg.target_path)?;

        let _guard = self.inflight.guard(&msg.volume_id)?;

        filesystem_vol::unpublish_fs_volume(&self.backends(), &msg).await?;

        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("Not implemented"))
    }
}
