//! Attaching and detaching the iSCSI devices backing the volumes.
//!
//! The node only ever goes through the `IscsiConnector` trait. The real
//! implementation drives `iscsiadm`, tests provide their own.
//!
//! Attaching a volume is performed as follows:
//! ```ignore
//!     let spec = volume.attach_spec();
//!     let path = dev::attach(connector, &spec).await?;
//!     // path is the /dev/disk/by-path link of the logged in LUN
//! ```
//!
//! Detaching it again via:
//! ```ignore
//!     dev::detach(connector, &volume.attach_spec()).await?;
//! ```

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use tokio::time::sleep;

mod iscsi;

pub use crate::error::DeviceError;
pub use iscsi::Iscsiadm;

pub type DeviceName = String;

/// Everything needed to log in to a volume's iSCSI target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachSpec {
    pub volume_name: String,
    pub target_iqn: String,
    /// Port used for portals which do not carry one.
    pub target_port: i32,
    pub lun: i32,
    /// iSCSI interface to log in through; "default" when empty.
    pub interface: String,
    pub target_portals: Vec<String>,
}

/// Logs the node in and out of iSCSI targets.
#[async_trait]
pub trait IscsiConnector: Send + Sync {
    /// Log in to the target and return the path of the block device.
    async fn connect(&self, spec: &AttachSpec) -> Result<DeviceName, DeviceError>;
    /// Log out of the target on every portal and forget about it.
    /// Log out of every session `connect` may have opened for `spec`.
    async fn disconnect(&self, spec: &AttachSpec) -> Result<(), DeviceError>;
}

/// Attach the volume described by `spec` and return its device path.
pub async fn attach(
    connector: &dyn IscsiConnector,
    spec: &AttachSpec,
) -> Result<DeviceName, DeviceError> {
    debug!(
        volume.name = %spec.volume_name,
        iqn = %spec.target_iqn,
        portals = ?spec.target_portals,
        "Attaching volume"
    );
    let path = connector.connect(spec).await?;
    if path.is_empty() {
        return Err(DeviceError::new(
            "connect reported success, but no path returned",
        ));
    }
    info!(volume.name = %spec.volume_name, device = %path, "Volume attached");
    Ok(path)
}

/// Detach the target `iqn` reachable through `portals`.
pub async fn detach(
    connector: &dyn IscsiConnector,
    spec: &AttachSpec,
) -> Result<(), DeviceError> {
    debug!(
        volume.name = %spec.volume_name,
        iqn = %spec.target_iqn,
        portals = ?spec.target_portals,
        "Detaching volume"
    );
    connector.disconnect(spec).await
}

/// Wait for a device node to show up once the login went through.
pub async fn wait_for_device(
    path: &str,
    timeout: Duration,
    retries: u32,
) -> Result<DeviceName, DeviceError> {
    for _ in 0 ..= retries {
        if Path::new(path).exists() {
            return Ok(path.to_string());
        }
        sleep(timeout).await;
    }
    Err(DeviceError::from(format!("device attach timeout: {}", path)))
}
