//! Utility functions for formatting a device with a filesystem.
//!
//! A device is probed first and only formatted if no filesystem was found on
//! it. Whether an existing filesystem is of the requested type is not
//! checked: existing data is never overwritten.

use tokio::process::Command;

use crate::error::DeviceError;

/// blkid exit code when the device carries nothing it recognises.
const BLKID_NOTHING_FOUND: i32 = 2;

/// Return the filesystem type on `device`, if any.
pub(crate) async fn probe_filesystem(
    device: &str,
) -> Result<Option<String>, DeviceError> {
    let output = Command::new("blkid")
        .args(["-p", "-s", "TYPE", "-o", "value", device])
        .output()
        .await?;

    if output.status.code() == Some(BLKID_NOTHING_FOUND) {
        return Ok(None);
    }
    if !output.status.success() {
        return Err(DeviceError::from(format!(
            "Failed to probe device {}: {}",
            device,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let value = String::from_utf8(output.stdout)?;
    let value = value.trim();
    Ok(if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    })
}

/// Arguments for `mkfs.<fstype>` which keep it from prompting.
fn mkfs_args<'a>(fstype: &str, device: &'a str) -> Vec<&'a str> {
    match fstype {
        "xfs" => vec!["-f", device],
        fs if fs.starts_with("ext") => vec!["-F", device],
        _ => vec![device],
    }
}

/// Format `device` with `fstype` unless it already holds a filesystem.
pub(crate) async fn probed_format(
    device: &str,
    fstype: &str,
) -> Result<(), DeviceError> {
    if let Some(fs) = probe_filesystem(device).await? {
        info!(
            "Skipping format: device {} contains a preexisting {} filesystem",
            device, fs
        );
        return Ok(());
    }

    debug!("Formatting device {} with a {} filesystem", device, fstype);
    let output = Command::new(format!("mkfs.{}", fstype))
        .args(mkfs_args(fstype, device))
        .output()
        .await?;
    trace!(
        "Output of mkfs.{} command: {}",
        fstype,
        String::from_utf8_lossy(&output.stdout)
    );
    if !output.status.success() {
        return Err(DeviceError::from(format!(
            "Failed to format {} with {} fs: {}",
            device,
            fstype,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    info!("Device {} formatted with {} filesystem", device, fstype);
    Ok(())
}
