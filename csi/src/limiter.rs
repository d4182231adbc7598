//! Volume Concurrency Limiter Module
//!
//! In general the Cluster Orchestrator (CO) is responsible for ensuring that
//! there is no more than one call "in-flight" per volume at a given time.
//! However, in some circumstances, the CO MAY lose state (for example when
//! the CO crashes and restarts), and MAY issue multiple calls simultaneously
//! for the same volume. Such calls are rejected straight away with ABORTED
//! rather than queued behind the running one.
use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;
use snafu::Snafu;

/// Volume concurrency limiter error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display(
        "An operation for volume {} is already in progress",
        id
    ))]
    OperationInProgress { id: String },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::OperationInProgress {
                ..
            } => tonic::Status::aborted(error.to_string()),
        }
    }
}

/// Set of volume ids which have an operation in-flight.
/// Cloning it yields a handle onto the same set.
#[derive(Debug, Clone, Default)]
pub struct InFlightVolumes {
    inventory: Arc<Mutex<HashSet<String>>>,
}

impl InFlightVolumes {
    /// Create a new, empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operation for `id` unless one is already recorded.
    /// Returns whether the caller now owns the reservation.
    pub fn try_acquire(&self, id: &str) -> bool {
        let mut inventory = self.inventory.lock();
        if inventory.contains(id) {
            trace!(volume.id = %id, "Operation already exists for volume");
            return false;
        }
        inventory.insert(id.to_string());
        trace!(volume.id = %id, "New reservation");
        true
    }

    /// Drop the reservation for `id`.
    pub fn release(&self, id: &str) {
        self.inventory.lock().remove(id);
        trace!(volume.id = %id, "Reservation released");
    }

    /// Check whether an operation for `id` is currently in-flight.
    pub fn contains(&self, id: &str) -> bool {
        self.inventory.lock().contains(id)
    }

    /// Take a reservation for `id` which is returned when the guard drops,
    /// or fail if an existing operation is already in progress.
    pub fn guard(&self, id: &str) -> Result<VolumeOpGuard, Error> {
        if self.try_acquire(id) {
            Ok(VolumeOpGuard {
                id: id.to_string(),
                volumes: self.clone(),
            })
        } else {
            Err(Error::OperationInProgress {
                id: id.to_string(),
            })
        }
    }
}

/// This Operation guard is used to ensure there is no more than 1 in-flight
/// operation for a given volume by holding a reservation for the volume's id.
/// When this is dropped the reservation is returned and a new operation can be
/// accepted.
#[derive(Debug)]
pub struct VolumeOpGuard {
    id: String,
    volumes: InFlightVolumes,
}

impl VolumeOpGuard {
    /// The volume id this guard holds a reservation for.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for VolumeOpGuard {
    fn drop(&mut self) {
        self.volumes.release(&self.id);
    }
}
