//! Functions for CSI stage, unstage, publish and unpublish filesystem volumes.
//!
//! Requests have been validated and the volume's in-flight reservation has
//! been taken by the caller.

use std::io::ErrorKind;

use tonic::Status;

use crate::{
    csi::*,
    dev::{self, IscsiConnector},
    mount::{self, subset, Mounter, ReadOnly},
    store::{StoreError, VolumeStore},
    volume::{JivaVolume, MountInfo},
    wait::{self, RetryPolicy},
};

/// What the flows operate on.
pub(crate) struct Backends<'a> {
    pub(crate) store: &'a dyn VolumeStore,
    pub(crate) namespace: &'a str,
    pub(crate) connector: &'a dyn IscsiConnector,
    pub(crate) mounter: &'a dyn Mounter,
}

impl<'a> Backends<'a> {
    async fn refresh(&self, volume_id: &str) -> Result<(), Status> {
        self.store.refresh().await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to refresh store for volume {}: {}",
                volume_id,
                error
            )
        })
    }

    /// Read the volume, change its mount record and write it back if it
    /// differs. A concurrent modification is reported, not retried.
    async fn update_mount_info(
        &self,
        volume_id: &str,
        change: impl FnOnce(&mut MountInfo),
    ) -> Result<JivaVolume, StoreError> {
        let mut volume = self.store.get(self.namespace, volume_id).await?;
        let before = volume.spec.mount_info.clone();
        change(&mut volume.spec.mount_info);
        if volume.spec.mount_info == before {
            return Ok(volume);
        }
        self.store.update(&volume).await
    }
}

fn store_failure(volume_id: &str, step: &str, error: StoreError) -> Status {
    if error.is_not_found() {
        return failure!(
            Code::NotFound,
            "Failed to {} for volume {}: {}",
            step,
            volume_id,
            error
        );
    }
    failure!(
        Code::Internal,
        "Failed to {} for volume {}: {}",
        step,
        volume_id,
        error
    )
}

pub(crate) async fn stage_fs_volume(
    backends: &Backends<'_>,
    msg: &NodeStageVolumeRequest,
    fstype: &str,
    mount_flags: &[String],
    readiness: RetryPolicy,
    reachability: RetryPolicy,
) -> Result<(), Status> {
    let volume_id = &msg.volume_id;
    let staging_path = &msg.staging_target_path;

    let volume = wait::wait_until_ready(
        backends.store,
        backends.namespace,
        volume_id,
        readiness,
    )
    .await
    .map_err(|error| {
        let status = Status::from(error);
        error!(volume.id = %volume_id, "{}", status.message());
        status
    })?;

    let portal = volume.target_portal().ok_or_else(|| {
        failure!(
            Code::Internal,
            "Failed to stage volume {}: no target portal recorded",
            volume_id
        )
    })?;
    wait::wait_until_reachable(&portal, reachability)
        .await
        .map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to stage volume {}: {}",
                volume_id,
                error
            )
        })?;

    let device_path = dev::attach(backends.connector, &volume.attach_spec())
        .await
        .map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to stage volume {}: attach failed: {}",
                volume_id,
                error
            )
        })?;

    backends
        .update_mount_info(volume_id, |info| {
            info.fs_type = fstype.to_string();
            info.device_path = device_path.clone();
            info.staging_path = staging_path.clone();
        })
        .await
        .map_err(|error| {
            store_failure(volume_id, "record staging", error)
        })?;

    debug!("Staging volume {} to {}", volume_id, staging_path);

    mount::mount_device(
        backends.mounter,
        &device_path,
        staging_path,
        fstype,
        mount_flags,
    )
    .await
    .map_err(|error| {
        failure!(
            Code::Internal,
            "Failed to stage volume {}: failed to mount device {} onto {}: {}",
            volume_id,
            device_path,
            staging_path,
            error
        )
    })?;

    info!("Volume {} staged to {}", volume_id, staging_path);
    Ok(())
}

pub(crate) async fn unstage_fs_volume(
    backends: &Backends<'_>,
    msg: &NodeUnstageVolumeRequest,
) -> Result<(), Status> {
    let volume_id = &msg.volume_id;
    let staging_path = &msg.staging_target_path;

    backends.refresh(volume_id).await?;

    let count = mount::unmount_target(backends.mounter, staging_path)
        .map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to unstage volume {}: failed to unmount {}: {}",
                volume_id,
                staging_path,
                error
            )
        })?;
    if count == 0 {
        info!(
            "Volume {} is not staged at {}, nothing to do",
            volume_id, staging_path
        );
        return Ok(());
    }

    let volume = match backends.store.get(backends.namespace, volume_id).await
    {
        Ok(volume) => volume,
        Err(error) if error.is_not_found() => {
            warn!(
                "Volume {} unmounted from {} but its resource is gone, skipping detach",
                volume_id, staging_path
            );
            return Ok(());
        }
        Err(error) => {
            return Err(store_failure(volume_id, "get volume", error));
        }
    };

    dev::detach(backends.connector, &volume.attach_spec())
        .await
        .map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to unstage volume {}: detach failed: {}",
                volume_id,
                error
            )
        })?;

    if let Err(error) = std::fs::remove_dir_all(staging_path) {
        if error.kind() != ErrorKind::NotFound {
            return Err(failure!(
                Code::Internal,
                "Failed to unstage volume {}: failed to remove {}: {}",
                volume_id,
                staging_path,
                error
            ));
        }
    }

    backends
        .update_mount_info(volume_id, |info| {
            info.device_path.clear();
            info.staging_path.clear();
        })
        .await
        .map_err(|error| store_failure(volume_id, "clear staging", error))?;

    info!("Volume {} unstaged from {}", volume_id, staging_path);
    Ok(())
}

/// Check that what is mounted on the publish target is the staged volume,
/// mounted with the flags this request asks for.
fn check_published(
    backends: &Backends<'_>,
    msg: &NodePublishVolumeRequest,
    mount_flags: &[String],
) -> Result<(), Status> {
    let volume_id = &msg.volume_id;
    let target_path = &msg.target_path;

    let lookup = |path: &str| {
        backends.mounter.mounted_at(path).map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to publish volume {}: failed to look up mount {}: {}",
                volume_id,
                path,
                error
            )
        })
    };

    let mounted = match lookup(target_path.as_str())? {
        Some(mounted) => mounted,
        None => return Ok(()),
    };

    if let Some(staged) = lookup(msg.staging_target_path.as_str())? {
        if mounted.source != staged.source {
            return Err(failure!(
                Code::AlreadyExists,
                "Failed to publish volume {}: directory {} is already in use",
                volume_id,
                target_path
            ));
        }
    }

    let readonly = msg.readonly || mount_flags.readonly();
    if !subset(mount_flags, &mounted.options)
        || readonly != mounted.options.readonly()
    {
        return Err(failure!(
            Code::AlreadyExists,
            "Failed to publish volume {}: directory {} is already mounted but with incompatible flags",
            volume_id,
            target_path
        ));
    }
    Ok(())
}

pub(crate) async fn publish_fs_volume(
    backends: &Backends<'_>,
    msg: &NodePublishVolumeRequest,
    fstype: &str,
    mount_flags: &[String],
) -> Result<(), Status> {
    let volume_id = &msg.volume_id;
    let staging_path = &msg.staging_target_path;
    let target_path = &msg.target_path;

    backends.refresh(volume_id).await?;

    let published = match backends.mounter.is_mount_point(target_path) {
        Ok(published) => published,
        Err(error) if error.kind() == ErrorKind::NotFound => false,
        Err(error) => {
            return Err(failure!(
                Code::Internal,
                "Failed to publish volume {}: failed to check {}: {}",
                volume_id,
                target_path,
                error
            ));
        }
    };

    if published {
        check_published(backends, msg, mount_flags)?;
        info!(
            "Volume {} is already published to {}",
            volume_id, target_path
        );
    } else {
        mount::create_mount_point(target_path).map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to publish volume {}: failed to create directory {}: {}",
                volume_id,
                target_path,
                error
            )
        })?;

        let options = mount::publish_options(msg.readonly, mount_flags);
        if let Err(error) =
            backends
                .mounter
                .mount(staging_path, target_path, fstype, &options)
        {
            if let Err(error) = mount::remove_mount_point(target_path) {
                error!(
                    "Could not remove mount target {}: {}",
                    target_path, error
                );
            }
            return Err(failure!(
                Code::Internal,
                "Failed to publish volume {}: failed to mount {} to {}: {}",
                volume_id,
                staging_path,
                target_path,
                error
            ));
        }
    }

    // also on a repeated publish, in case recording the first one failed
    backends
        .update_mount_info(volume_id, |info| {
            info.target_path = target_path.clone();
        })
        .await
        .map_err(|error| store_failure(volume_id, "record publish", error))?;

    if !published {
        info!("Volume {} published to {}", volume_id, target_path);
    }
    Ok(())
}

pub(crate) async fn unpublish_fs_volume(
    backends: &Backends<'_>,
    msg: &NodeUnpublishVolumeRequest,
) -> Result<(), Status> {
    let volume_id = &msg.volume_id;
    let target_path = &msg.target_path;

    backends.refresh(volume_id).await?;

    match backends.mounter.is_mount_point(target_path) {
        Ok(true) => {}
        Ok(false) => {
            info!(
                "Volume {} is not published at {}, nothing to do",
                volume_id, target_path
            );
            return Ok(());
        }
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(failure!(
                Code::NotFound,
                "Failed to unpublish volume {}: targetpath {} not found",
                volume_id,
                target_path
            ));
        }
        Err(error) => {
            return Err(failure!(
                Code::Internal,
                "Failed to unpublish volume {}: failed to check {}: {}",
                volume_id,
                target_path,
                error
            ));
        }
    }

    backends.mounter.unmount(target_path).map_err(|error| {
        failure!(
            Code::Internal,
            "Failed to unpublish volume {}: failed to unmount {}: {}",
            volume_id,
            target_path,
            error
        )
    })?;

    mount::remove_mount_point(target_path).map_err(|error| {
        failure!(
            Code::Internal,
            "Failed to unpublish volume {}: failed to remove directory {}: {}",
            volume_id,
            target_path,
            error
        )
    })?;

    match backends
        .update_mount_info(volume_id, |info| info.target_path.clear())
        .await
    {
        Ok(_) => {}
        Err(error) if error.is_not_found() => {
            warn!(
                "Volume {} unpublished from {} but its resource is gone",
                volume_id, target_path
            );
        }
        Err(error) => {
            return Err(store_failure(volume_id, "clear publish", error));
        }
    }

    info!("Volume {} unpublished from {}", volume_id, target_path);
    Ok(())
}
