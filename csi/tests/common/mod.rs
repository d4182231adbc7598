//! In-memory stand-ins for the cluster, iscsiadm and the mount table.
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use kube::ResourceExt;
use parking_lot::Mutex;

use jiva_csi::{
    csi::{
        volume_capability::{access_mode::Mode, AccessMode, AccessType, MountVolume},
        VolumeCapability,
    },
    dev::{AttachSpec, DeviceError, DeviceName, IscsiConnector},
    mount::{device_and_ref_count, MountEntry, Mounter},
    store::{StoreError, VolumeStore},
    volume::{
        IscsiSpec,
        JivaVolume,
        JivaVolumeSpec,
        JivaVolumeStatus,
        ReplicaStatus,
        PHASE_CREATED,
    },
};

pub const NAMESPACE: &str = "openebs";
pub const IQN: &str = "iqn.2016-09.com.openebs.jiva:pvc-1";

type Key = (String, String);

/// Volume store with resource versions, like the API server.
#[derive(Default)]
pub struct MemoryStore {
    volumes: Mutex<HashMap<Key, JivaVolume>>,
    version: AtomicUsize,
    refreshes: AtomicUsize,
    gets: AtomicUsize,
    /// Mark the volume created once it has been read this many times.
    ready_after: Mutex<Option<(String, usize)>>,
    conflict_on_update: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn key(volume: &JivaVolume) -> Key {
        (
            volume.namespace().unwrap_or_else(|| NAMESPACE.to_string()),
            volume.name_any(),
        )
    }

    fn bump(&self, volume: &mut JivaVolume) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        volume.metadata.resource_version = Some(version.to_string());
    }

    /// Store `volume` as the operator would, bypassing version checks.
    pub fn insert(&self, mut volume: JivaVolume) {
        if volume.metadata.namespace.is_none() {
            volume.metadata.namespace = Some(NAMESPACE.to_string());
        }
        self.bump(&mut volume);
        self.volumes.lock().insert(Self::key(&volume), volume);
    }

    pub fn volume(&self, name: &str) -> Option<JivaVolume> {
        self.volumes
            .lock()
            .get(&(NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn volume_in(&self, namespace: &str, name: &str) -> Option<JivaVolume> {
        self.volumes
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.volumes.lock().len()
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn ready_after(&self, name: &str, gets: usize) {
        *self.ready_after.lock() = Some((name.to_string(), gets));
    }

    pub fn conflict_on_update(&self) {
        self.conflict_on_update.store(true, Ordering::SeqCst);
    }

    pub fn clear_conflict(&self) {
        self.conflict_on_update.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl VolumeStore for MemoryStore {
    async fn refresh(&self) -> Result<(), StoreError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<JivaVolume, StoreError> {
        let gets = self.gets.fetch_add(1, Ordering::SeqCst) + 1;
        let key = (namespace.to_string(), name.to_string());
        let mut volumes = self.volumes.lock();
        let volume = volumes.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            name: name.to_string(),
        })?;
        if let Some((ready, after)) = self.ready_after.lock().as_ref() {
            if ready == name && gets >= *after {
                volume.status.get_or_insert_with(Default::default).phase =
                    PHASE_CREATED.to_string();
            }
        }
        Ok(volume.clone())
    }

    async fn create(&self, volume: &JivaVolume) -> Result<JivaVolume, StoreError> {
        let key = Self::key(volume);
        let mut volumes = self.volumes.lock();
        if volumes.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                name: key.1,
            });
        }
        let mut volume = volume.clone();
        self.bump(&mut volume);
        volumes.insert(key, volume.clone());
        Ok(volume)
    }

    async fn update(&self, volume: &JivaVolume) -> Result<JivaVolume, StoreError> {
        let key = Self::key(volume);
        let mut volumes = self.volumes.lock();
        let current = volumes.get(&key).ok_or_else(|| StoreError::NotFound {
            name: key.1.clone(),
        })?;
        if self.conflict_on_update.load(Ordering::SeqCst)
            || current.metadata.resource_version
                != volume.metadata.resource_version
        {
            return Err(StoreError::Conflict {
                name: key.1,
            });
        }
        let mut volume = volume.clone();
        self.bump(&mut volume);
        volumes.insert(key, volume.clone());
        Ok(volume)
    }

    async fn delete(&self, volume: &JivaVolume) -> Result<(), StoreError> {
        let key = Self::key(volume);
        match self.volumes.lock().remove(&key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                name: key.1,
            }),
        }
    }

    async fn list(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<JivaVolume>, StoreError> {
        Ok(self
            .volumes
            .lock()
            .values()
            .filter(|volume| {
                labels
                    .iter()
                    .all(|(key, value)| volume.labels().get(key) == Some(value))
            })
            .cloned()
            .collect())
    }
}

/// Connector which records what it was asked to do.
#[derive(Default)]
pub struct FakeConnector {
    /// Device path handed out on connect.
    pub path: Mutex<String>,
    pub fail: AtomicBool,
    pub connects: Mutex<Vec<AttachSpec>>,
    pub disconnects: Mutex<Vec<(String, Vec<String>)>>,
    pub disconnected_specs: Mutex<Vec<AttachSpec>>,
}

impl FakeConnector {
    pub fn new(path: &str) -> Arc<Self> {
        let connector = Self::default();
        *connector.path.lock() = path.to_string();
        Arc::new(connector)
    }
}

#[async_trait]
impl IscsiConnector for FakeConnector {
    async fn connect(&self, spec: &AttachSpec) -> Result<DeviceName, DeviceError> {
        self.connects.lock().push(spec.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeviceError::new("login failed"));
        }
        Ok(self.path.lock().clone())
    }

    async fn disconnect(&self, spec: &AttachSpec) -> Result<(), DeviceError> {
        self.disconnects
            .lock()
            .push((spec.target_iqn.clone(), spec.target_portals.clone()));
        self.disconnected_specs.lock().push(spec.clone());
        Ok(())
    }
}

/// Mount table kept in memory. Paths are checked for existence on the real
/// filesystem, so tests use temporary directories.
#[derive(Default)]
pub struct FakeMounter {
    pub entries: Mutex<Vec<MountEntry>>,
    pub formats: Mutex<Vec<(String, String, String)>>,
    pub fail_mount: AtomicBool,
}

impl FakeMounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, source: &str, dest: &str, options: &[String]) {
        self.entries.lock().push(MountEntry {
            source: source.to_string(),
            dest: dest.to_string(),
            fstype: "ext4".to_string(),
            options: options.to_vec(),
        });
    }

    pub fn entry(&self, dest: &str) -> Option<MountEntry> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.dest == dest)
            .cloned()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    fn is_mount_point(&self, path: &str) -> io::Result<bool> {
        std::fs::metadata(path)?;
        Ok(self.entry(path).is_some())
    }

    fn mounted_at(
        &self,
        target: &str,
    ) -> Result<Option<MountEntry>, DeviceError> {
        Ok(self.entry(target))
    }

    async fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fstype: &str,
        options: &[String],
    ) -> Result<(), DeviceError> {
        self.formats.lock().push((
            device.to_string(),
            target.to_string(),
            fstype.to_string(),
        ));
        self.mount(device, target, fstype, options)
    }

    fn mount(
        &self,
        source: &str,
        target: &str,
        _fstype: &str,
        options: &[String],
    ) -> Result<(), DeviceError> {
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(DeviceError::new("mount failed"));
        }
        // a bind mount shows the device of its source
        let source = match self.entry(source) {
            Some(entry) => entry.source,
            None => source.to_string(),
        };
        self.add(&source, target, options);
        Ok(())
    }

    fn unmount(&self, target: &str) -> Result<(), DeviceError> {
        let mut entries = self.entries.lock();
        match entries.iter().position(|entry| entry.dest == target) {
            Some(index) => {
                entries.remove(index);
                Ok(())
            }
            None => Err(DeviceError::new("not mounted")),
        }
    }

    fn device_and_ref_count(
        &self,
        target: &str,
    ) -> Result<(Option<String>, usize), DeviceError> {
        Ok(device_and_ref_count(&self.entries.lock(), target))
    }
}

pub fn mount_capability(mode: Mode, fs_type: &str) -> VolumeCapability {
    VolumeCapability {
        access_mode: Some(AccessMode {
            mode: mode as i32,
        }),
        access_type: Some(AccessType::Mount(MountVolume {
            fs_type: fs_type.to_string(),
            mount_flags: vec![],
            volume_mount_group: String::new(),
        })),
    }
}

/// A volume whose target is reachable at `portal`.
pub fn volume(name: &str, portal: &str) -> JivaVolume {
    let (ip, port) = portal.rsplit_once(':').unwrap_or((portal, "3260"));
    let mut volume = JivaVolume::new(
        name,
        JivaVolumeSpec {
            pv: name.to_string(),
            capacity: "5Gi".to_string(),
            iscsi_spec: IscsiSpec {
                target_ip: ip.to_string(),
                target_port: port.parse().unwrap(),
                iqn: IQN.to_string(),
                lun: 0,
                iscsi_interface: String::new(),
                target_portals: vec![portal.to_string()],
            },
            ..Default::default()
        },
    );
    volume.metadata.namespace = Some(NAMESPACE.to_string());
    volume
}

pub fn with_status(
    mut volume: JivaVolume,
    phase: &str,
    status: &str,
    replicas: Vec<ReplicaStatus>,
) -> JivaVolume {
    volume.status = Some(JivaVolumeStatus {
        status: status.to_string(),
        replica_count: replicas.len() as u32,
        replica_statuses: replicas,
        phase: phase.to_string(),
    });
    volume
}

pub fn ready_volume(name: &str, portal: &str) -> JivaVolume {
    with_status(volume(name, portal), PHASE_CREATED, "RW", vec![])
}
