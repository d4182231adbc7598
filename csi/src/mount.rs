//! Utility functions for mounting and unmounting filesystems.
//!
//! The node verbs go through the `Mounter` trait; `SysMounter` is the
//! implementation backed by the kernel's mount table and mount(2).

use std::{
    collections::HashSet,
    fs::DirBuilder,
    io,
    os::unix::fs::DirBuilderExt,
};

use async_trait::async_trait;
use proc_mounts::MountIter;
use sys_mount::{unmount, FilesystemType, Mount, MountFlags, UnmountFlags};

use crate::{error::DeviceError, format::probed_format};

/// Filesystems volumes can be formatted with.
pub const SUPPORTED_FILESYSTEMS: [&str; 4] = ["ext2", "ext3", "ext4", "xfs"];
/// Filesystem used when the capability does not name one.
pub const DEFAULT_FILESYSTEM: &str = "ext4";

/// Whether volumes can be formatted with `fstype`.
pub fn is_supported_filesystem(fstype: &str) -> bool {
    SUPPORTED_FILESYSTEMS.contains(&fstype)
}

/// A line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub dest: String,
    pub fstype: String,
    pub options: Vec<String>,
}

impl From<proc_mounts::MountInfo> for MountEntry {
    fn from(info: proc_mounts::MountInfo) -> Self {
        Self {
            source: info.source.to_string_lossy().to_string(),
            dest: info.dest.to_string_lossy().to_string(),
            fstype: info.fstype,
            options: info.options,
        }
    }
}

pub trait ReadOnly {
    fn readonly(&self) -> bool;
}

impl ReadOnly for [String] {
    fn readonly(&self) -> bool {
        self.iter().any(|entry| entry == "ro")
    }
}

/// Whether every flag in `first`, other than ro/rw, is also in `second`.
pub fn subset(first: &[String], second: &[String]) -> bool {
    let set: HashSet<&String> = second.iter().collect();
    first
        .iter()
        .filter(|entry| *entry != "ro" && *entry != "rw")
        .all(|entry| set.contains(entry))
}

fn trimmed(path: &str) -> &str {
    path.trim_end_matches('/')
}

/// Find the entry mounted at `target`.
pub fn entry_at<'a>(
    entries: &'a [MountEntry],
    target: &str,
) -> Option<&'a MountEntry> {
    let target = trimmed(target);
    entries.iter().find(|entry| trimmed(&entry.dest) == target)
}

/// Find the device mounted at `target` and how many mounts it has in total.
/// Returns `(None, 0)` if nothing is mounted at `target`.
pub fn device_and_ref_count(
    entries: &[MountEntry],
    target: &str,
) -> (Option<String>, usize) {
    let device = match entry_at(entries, target) {
        Some(entry) => entry.source.clone(),
        None => return (None, 0),
    };
    let count = entries
        .iter()
        .filter(|entry| entry.source == device)
        .count();
    (Some(device), count)
}

/// Mount operations the node needs.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Whether `path` is a mount point; fails with `NotFound` when the
    /// path does not exist.
    fn is_mount_point(&self, path: &str) -> io::Result<bool>;
    /// The mount table entry for `target`, if something is mounted there.
    fn mounted_at(
        &self,
        target: &str,
    ) -> Result<Option<MountEntry>, DeviceError>;
    /// Format `device` unless it holds a filesystem already, then mount it.
    async fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fstype: &str,
        options: &[String],
    ) -> Result<(), DeviceError>;
    /// Mount `source` on `target`; a "bind" option makes it a bind mount.
    fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: &str,
        options: &[String],
    ) -> Result<(), DeviceError>;
    fn unmount(&self, target: &str) -> Result<(), DeviceError>;
    /// See `device_and_ref_count`.
    fn device_and_ref_count(
        &self,
        target: &str,
    ) -> Result<(Option<String>, usize), DeviceError>;
}

/// Split options into mount flags and the filesystem specific data.
fn parse(options: &[String]) -> (MountFlags, String) {
    let mut flags = MountFlags::empty();
    let mut list: Vec<&str> = Vec::new();

    for entry in options {
        match entry.as_str() {
            "ro" => flags.insert(MountFlags::RDONLY),
            "bind" => flags.insert(MountFlags::BIND),
            "noatime" => flags.insert(MountFlags::NOATIME),
            "nodiratime" => flags.insert(MountFlags::NODIRATIME),
            "relatime" => flags.insert(MountFlags::RELATIME),
            "strictatime" => flags.insert(MountFlags::STRICTATIME),
            "nodev" => flags.insert(MountFlags::NODEV),
            "noexec" => flags.insert(MountFlags::NOEXEC),
            "nosuid" => flags.insert(MountFlags::NOSUID),
            "sync" => flags.insert(MountFlags::SYNCHRONOUS),
            "dirsync" => flags.insert(MountFlags::DIRSYNC),
            "rw" | "defaults" => {}
            other => list.push(other),
        }
    }

    (flags, list.join(","))
}

/// Flags and data for the remount that follows a bind mount, or None if
/// the options need no remount.
fn bind_remount(options: &[String]) -> Option<(MountFlags, String)> {
    let (mut flags, data) = parse(options);
    flags.remove(MountFlags::BIND);
    if flags.is_empty() && data.is_empty() {
        return None;
    }
    flags.insert(MountFlags::BIND | MountFlags::REMOUNT);
    Some((flags, data))
}

// The empty string maps to None.
fn option(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

// Utility function used for displaying a list of options.
fn show(options: &[String]) -> String {
    let list: Vec<&str> = options
        .iter()
        .map(String::as_str)
        .filter(|value| *value != "rw")
        .collect();

    if list.is_empty() {
        return String::from("none");
    }

    list.join(",")
}

/// Mounter operating on the host.
#[derive(Debug, Default, Clone)]
pub struct SysMounter {}

impl SysMounter {
    pub fn new() -> Self {
        Self {}
    }

    fn entries(&self) -> io::Result<Vec<MountEntry>> {
        MountIter::new()?
            .map(|info| info.map(MountEntry::from))
            .collect()
    }
}

#[async_trait]
impl Mounter for SysMounter {
    fn is_mount_point(&self, path: &str) -> io::Result<bool> {
        std::fs::metadata(path)?;
        Ok(entry_at(&self.entries()?, path).is_some())
    }

    fn mounted_at(
        &self,
        target: &str,
    ) -> Result<Option<MountEntry>, DeviceError> {
        Ok(entry_at(&self.entries()?, target).cloned())
    }

    async fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fstype: &str,
        options: &[String],
    ) -> Result<(), DeviceError> {
        probed_format(device, fstype).await?;
        self.mount(device, target, fstype, options)
    }

    fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: &str,
        options: &[String],
    ) -> Result<(), DeviceError> {
        let (flags, data) = parse(options);

        if flags.contains(MountFlags::BIND) {
            Mount::new(
                source,
                target,
                FilesystemType::Manual("none"),
                MountFlags::BIND,
                None,
            )?;
            debug!("Source {} bind mounted onto target {}", source, target);

            if let Some((flags, data)) = bind_remount(options) {
                if let Err(error) = Mount::new(
                    "none",
                    target,
                    FilesystemType::Manual("none"),
                    flags,
                    option(&data),
                ) {
                    error!("Failed to remount {}: {}", target, error);
                    if let Err(error) = unmount(target, UnmountFlags::empty()) {
                        error!("Failed to unmount {}: {}", target, error);
                    }
                    return Err(error.into());
                }
                debug!(
                    "Target {} bind remounted (options: {})",
                    target,
                    show(options)
                );
            }
            return Ok(());
        }

        Mount::new(
            source,
            target,
            FilesystemType::Manual(fstype),
            flags,
            option(&data),
        )?;
        debug!(
            "Filesystem ({}) on device {} mounted onto target {} (options: {})",
            fstype,
            source,
            target,
            show(options)
        );
        Ok(())
    }

    fn unmount(&self, target: &str) -> Result<(), DeviceError> {
        unmount(target, UnmountFlags::empty())?;
        debug!("Target {} unmounted", target);
        Ok(())
    }

    fn device_and_ref_count(
        &self,
        target: &str,
    ) -> Result<(Option<String>, usize), DeviceError> {
        Ok(device_and_ref_count(&self.entries()?, target))
    }
}

/// Create a mount point directory, and any missing parents, with mode 0750.
pub fn create_mount_point(path: &str) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o750).create(path)
}

/// Remove a mount point directory; one which is already gone is fine.
pub fn remove_mount_point(path: &str) -> io::Result<()> {
    match std::fs::remove_dir(path) {
        Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

/// Mount `device` on `target`, formatting it first if it holds no
/// filesystem. The target directory is created if missing and nothing
/// happens if something is mounted there already.
pub async fn mount_device(
    mounter: &dyn Mounter,
    device: &str,
    target: &str,
    fstype: &str,
    options: &[String],
) -> Result<(), DeviceError> {
    match mounter.is_mount_point(target) {
        Ok(true) => {
            debug!("Target {} is already mounted", target);
            return Ok(());
        }
        Ok(false) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            create_mount_point(target).map_err(|error| {
                DeviceError::from(format!(
                    "Failed to create mount point {}: {}",
                    target, error
                ))
            })?;
        }
        Err(error) => {
            return Err(DeviceError::from(format!(
                "Failed to check mount point {}: {}",
                target, error
            )));
        }
    }

    mounter
        .format_and_mount(device, target, fstype, options)
        .await
}

/// Unmount whatever is mounted on `target`.
/// Returns the number of mounts the device had before, zero meaning nothing
/// was mounted and nothing was done.
pub fn unmount_target(
    mounter: &dyn Mounter,
    target: &str,
) -> Result<usize, DeviceError> {
    let (device, count) = mounter.device_and_ref_count(target)?;
    let device = match device {
        Some(device) if count > 0 => device,
        _ => {
            debug!("Nothing mounted at {}", target);
            return Ok(0);
        }
    };
    if count > 1 {
        warn!(
            "Device {} is still mounted {} more time(s) besides {}",
            device,
            count - 1,
            target
        );
    }
    mounter.unmount(target)?;
    Ok(count)
}

/// Mount options for a publish: a bind mount, read-only if asked for, plus
/// the capability's flags without duplicates.
pub fn publish_options(readonly: bool, flags: &[String]) -> Vec<String> {
    let mut options = vec!["bind".to_string()];
    if readonly {
        options.push("ro".to_string());
    }
    for flag in flags {
        if !options.contains(flag) {
            options.push(flag.clone());
        }
    }
    options
}
