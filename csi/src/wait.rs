//! Bounded polling used by the node before it attaches a volume.
//!
//! Both waits check at a fixed interval a fixed number of times. The
//! readiness wait sleeps before every check, so the earliest it can succeed
//! is one interval after it was started.

use std::{io, time::Duration};

use snafu::{ResultExt, Snafu};
use tokio::{net::TcpStream, time::timeout};

use crate::{
    store::{StoreError, VolumeStore},
    volume::{JivaVolume, ReplicaStatus, VolumeLifecyclePhase},
};

/// Upper bound for a single connection attempt to a target portal.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How many times to check, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    /// A policy with at least one attempt.
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: if attempts == 0 { 1 } else { attempts },
            interval,
        }
    }
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Errors of the waits.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum WaitError {
    #[snafu(display(
        "Volume {} is RO: replica status: {:?}",
        name,
        replicas
    ))]
    ReadOnly {
        name: String,
        replicas: Vec<ReplicaStatus>,
    },
    #[snafu(display(
        "Volume {} is not ready: replicas may not be connected",
        name
    ))]
    ReplicasNotConnected { name: String },
    #[snafu(display("Volume {} is not ready: volume status is unknown", name))]
    NotReady { name: String },
    #[snafu(display("Failed to get volume {}: {}", name, source))]
    Store { name: String, source: StoreError },
    #[snafu(display(
        "iSCSI target not reachable, target portal {}: {}",
        endpoint,
        source
    ))]
    Unreachable { endpoint: String, source: io::Error },
}

impl From<WaitError> for tonic::Status {
    fn from(error: WaitError) -> Self {
        match error {
            WaitError::Store {
                ref source, ..
            } if source.is_not_found() => {
                tonic::Status::not_found(error.to_string())
            }
            _ => tonic::Status::internal(error.to_string()),
        }
    }
}

/// Error describing why a volume is still not usable.
fn not_ready(volume: &JivaVolume, name: &str) -> WaitError {
    match volume.lifecycle_phase() {
        VolumeLifecyclePhase::ReadOnlyDegraded => {
            let replicas = volume.replica_statuses();
            if replicas.is_empty() {
                WaitError::ReplicasNotConnected {
                    name: name.to_string(),
                }
            } else {
                WaitError::ReadOnly {
                    name: name.to_string(),
                    replicas: replicas.to_vec(),
                }
            }
        }
        _ => WaitError::NotReady {
            name: name.to_string(),
        },
    }
}

/// Wait for the operator to report the volume as created.
/// Each attempt refreshes the store and reads the volume, waits one interval
/// and then looks at the volume it read.
pub async fn wait_until_ready(
    store: &dyn VolumeStore,
    namespace: &str,
    name: &str,
    policy: RetryPolicy,
) -> Result<JivaVolume, WaitError> {
    let mut attempt = 0;
    loop {
        store.refresh().await.context(Store {
            name,
        })?;
        let volume = store.get(namespace, name).await.context(Store {
            name,
        })?;
        tokio::time::sleep(policy.interval()).await;
        attempt += 1;

        let phase = volume.lifecycle_phase();
        if phase == VolumeLifecyclePhase::Created {
            debug!(volume.name = %name, attempt, "Volume is ready");
            return Ok(volume);
        }
        if attempt >= policy.attempts() {
            return Err(not_ready(&volume, name));
        }
        debug!(volume.name = %name, ?phase, attempt, "Volume not ready yet");
    }
}

/// Wait until a TCP connection to `endpoint` ("host:port") can be opened.
/// The connection is closed straight away.
pub async fn wait_until_reachable(
    endpoint: &str,
    policy: RetryPolicy,
) -> Result<(), WaitError> {
    let mut attempt = 0;
    loop {
        let error =
            match timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(endpoint))
                .await
            {
                Ok(Ok(stream)) => {
                    drop(stream);
                    debug!(endpoint, attempt, "Target portal is reachable");
                    return Ok(());
                }
                Ok(Err(error)) => error,
                Err(_) => io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection attempt timed out",
                ),
            };
        attempt += 1;
        if attempt >= policy.attempts() {
            return Err(WaitError::Unreachable {
                endpoint: endpoint.to_string(),
                source: error,
            });
        }
        debug!(endpoint, attempt, %error, "Target portal not reachable yet");
        tokio::time::sleep(policy.interval()).await;
    }
}
