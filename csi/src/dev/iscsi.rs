use std::time::Duration;

use async_trait::async_trait;

use super::{wait_for_device, AttachSpec, DeviceError, DeviceName, IscsiConnector};
use crate::volume::with_port;

mod iscsiadm;
use iscsiadm::IscsiAdmin;

/// Interval between checks for the device node after a login.
const DEVICE_WAIT_INTERVAL: Duration = Duration::from_millis(100);
/// Number of checks for the device node after a login.
const DEVICE_WAIT_RETRIES: u32 = 100;

/// Path udev creates for a LUN logged in through `portal`.
fn by_path(portal: &str, iqn: &str, lun: i32) -> String {
    format!("/dev/disk/by-path/ip-{}-iscsi-{}-lun-{}", portal, iqn, lun)
}

fn interface(spec: &AttachSpec) -> &str {
    if spec.interface.is_empty() {
        "default"
    } else {
        &spec.interface
    }
}

/// Portals of `spec`, each with the target port unless it names one.
fn portals(spec: &AttachSpec) -> Vec<String> {
    spec.target_portals
        .iter()
        .map(|portal| with_port(portal, spec.target_port))
        .collect()
}

/// Connector which drives the host's `iscsiadm`.
#[derive(Debug, Default, Clone)]
pub struct Iscsiadm {}

impl Iscsiadm {
    pub fn new() -> Self {
        Self {}
    }

    /// Log in through a single portal unless a session already exists.
    async fn login_portal(
        &self,
        portal: &str,
        spec: &AttachSpec,
    ) -> Result<(), DeviceError> {
        let iqn = &spec.target_iqn;
        let iface = interface(spec);

        let found = IscsiAdmin::find_session(portal, iqn).await.map_err(
            |error| {
                DeviceError::from(format!(
                    "iscsiadm command (session) failed: {}",
                    error
                ))
            },
        )?;
        if found {
            debug!(%portal, %iqn, "iSCSI session already exists");
            return Ok(());
        }

        if let Err(error) = IscsiAdmin::discover(portal, iqn, iface).await {
            return Err(DeviceError::from(format!(
                "iscsiadm command (discovery) failed: {}",
                error
            )));
        }

        if let Err(error) = IscsiAdmin::login(portal, iqn, iface).await {
            let _ = IscsiAdmin::delete(portal, iqn, iface).await;
            return Err(DeviceError::from(format!(
                "iscsiadm command (login) failed: {}",
                error
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl IscsiConnector for Iscsiadm {
    async fn connect(&self, spec: &AttachSpec) -> Result<DeviceName, DeviceError> {
        if spec.target_iqn.is_empty() {
            return Err(DeviceError::new("missing target iqn"));
        }
        if spec.target_portals.is_empty() {
            return Err(DeviceError::new("no target portals"));
        }

        let mut last_error = None;
        for portal in portals(spec) {
            if let Err(error) = self.login_portal(&portal, spec).await {
                warn!(%portal, %error, "Failed to log in to iSCSI portal");
                last_error = Some(error);
                continue;
            }
            let path = by_path(&portal, &spec.target_iqn, spec.lun);
            match wait_for_device(
                &path,
                DEVICE_WAIT_INTERVAL,
                DEVICE_WAIT_RETRIES,
            )
            .await
            {
                Ok(path) => return Ok(path),
                Err(error) => {
                    warn!(%portal, %error, "Device did not show up");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DeviceError::new("failed to log in to any target portal")
        }))
    }

    async fn disconnect(&self, spec: &AttachSpec) -> Result<(), DeviceError> {
        let iqn = &spec.target_iqn;
        let iface = interface(spec);
        for portal in portals(spec) {
            if let Err(error) = IscsiAdmin::logout(&portal, iqn).await {
                return Err(DeviceError::from(format!(
                    "iscsiadm command (logout) failed: {}",
                    error
                )));
            }
            if let Err(error) = IscsiAdmin::delete(&portal, iqn, iface).await {
                return Err(DeviceError::from(format!(
                    "iscsiadm command (delete) failed: {}",
                    error
                )));
            }
        }
        Ok(())
    }
}
