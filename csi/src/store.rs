//! Access to the `JivaVolume` custom resources in the cluster.
//!
//! The verbs only ever talk to the cluster through the `VolumeStore` trait so
//! that they can be driven against an in-memory store in the tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    ResourceExt,
};
use parking_lot::RwLock;
use snafu::{ResultExt, Snafu};

use crate::volume::JivaVolume;

/// Errors of the volume store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum StoreError {
    #[snafu(display("Volume {} not found", name))]
    NotFound { name: String },
    #[snafu(display("Volume {} already exists", name))]
    AlreadyExists { name: String },
    #[snafu(display("Volume {} was modified concurrently", name))]
    Conflict { name: String },
    #[snafu(display("Request for volume {} failed: {}", name, source))]
    Request { name: String, source: kube::Error },
    #[snafu(display("Failed to infer the cluster configuration: {}", source))]
    InferConfig {
        source: kube::config::InferConfigError,
    },
    #[snafu(display("Failed to build the cluster client: {}", source))]
    Connect { source: kube::Error },
}

impl StoreError {
    /// Whether the error means the volume does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StoreError> for tonic::Status {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound {
                ..
            } => tonic::Status::not_found(error.to_string()),
            StoreError::AlreadyExists {
                ..
            } => tonic::Status::already_exists(error.to_string()),
            _ => tonic::Status::internal(error.to_string()),
        }
    }
}

/// Persistent storage of the volume resources.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Rebuild the connection to the cluster.
    async fn refresh(&self) -> Result<(), StoreError>;
    /// Fetch the volume `name` in `namespace`.
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<JivaVolume, StoreError>;
    /// Create the volume in the namespace set in its metadata.
    async fn create(&self, volume: &JivaVolume) -> Result<JivaVolume, StoreError>;
    /// Replace the volume; fails with `Conflict` if it was modified since it
    /// was read.
    async fn update(&self, volume: &JivaVolume) -> Result<JivaVolume, StoreError>;
    /// Delete the volume.
    async fn delete(&self, volume: &JivaVolume) -> Result<(), StoreError>;
    /// List the volumes, across all namespaces, matching every given label.
    async fn list(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<JivaVolume>, StoreError>;
}

/// Store backed by the kubernetes API server.
pub struct KubeVolumeStore {
    config: kube::Config,
    client: RwLock<kube::Client>,
}

impl std::fmt::Debug for KubeVolumeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeVolumeStore")
            .field("cluster_url", &self.config.cluster_url)
            .finish()
    }
}

impl KubeVolumeStore {
    /// Connect using the in-cluster or kubeconfig configuration.
    pub async fn new() -> Result<Self, StoreError> {
        let config = kube::Config::infer().await.context(InferConfig)?;
        Self::from_config(config)
    }

    /// Connect using the given configuration.
    pub fn from_config(config: kube::Config) -> Result<Self, StoreError> {
        let client = kube::Client::try_from(config.clone()).context(Connect)?;
        Ok(Self {
            config,
            client: RwLock::new(client),
        })
    }

    fn client(&self) -> kube::Client {
        self.client.read().clone()
    }

    fn namespaced(&self, namespace: &str) -> Api<JivaVolume> {
        Api::namespaced(self.client(), namespace)
    }

    fn api_for(&self, volume: &JivaVolume) -> Api<JivaVolume> {
        match volume.namespace() {
            Some(namespace) => self.namespaced(&namespace),
            None => Api::default_namespaced(self.client()),
        }
    }
}

/// Translate the API server's answer into the store's error kinds.
fn api_error(name: &str, conflict: StoreError, error: kube::Error) -> StoreError {
    match &error {
        kube::Error::Api(response) if response.code == 404 => {
            StoreError::NotFound {
                name: name.to_string(),
            }
        }
        kube::Error::Api(response) if response.code == 409 => conflict,
        _ => StoreError::Request {
            name: name.to_string(),
            source: error,
        },
    }
}

fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl VolumeStore for KubeVolumeStore {
    async fn refresh(&self) -> Result<(), StoreError> {
        let client =
            kube::Client::try_from(self.config.clone()).context(Connect)?;
        *self.client.write() = client;
        Ok(())
    }

    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<JivaVolume, StoreError> {
        self.namespaced(namespace).get(name).await.map_err(|error| {
            api_error(
                name,
                StoreError::Conflict {
                    name: name.to_string(),
                },
                error,
            )
        })
    }

    async fn create(&self, volume: &JivaVolume) -> Result<JivaVolume, StoreError> {
        let name = volume.name_any();
        debug!(volume.name = %name, "Creating volume resource");
        self.api_for(volume)
            .create(&PostParams::default(), volume)
            .await
            .map_err(|error| {
                api_error(
                    &name,
                    StoreError::AlreadyExists {
                        name: name.clone(),
                    },
                    error,
                )
            })
    }

    async fn update(&self, volume: &JivaVolume) -> Result<JivaVolume, StoreError> {
        let name = volume.name_any();
        self.api_for(volume)
            .replace(&name, &PostParams::default(), volume)
            .await
            .map_err(|error| {
                api_error(
                    &name,
                    StoreError::Conflict {
                        name: name.clone(),
                    },
                    error,
                )
            })
    }

    async fn delete(&self, volume: &JivaVolume) -> Result<(), StoreError> {
        let name = volume.name_any();
        debug!(volume.name = %name, "Deleting volume resource");
        self.api_for(volume)
            .delete(&name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|error| {
                api_error(
                    &name,
                    StoreError::Conflict {
                        name: name.clone(),
                    },
                    error,
                )
            })
    }

    async fn list(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<JivaVolume>, StoreError> {
        let selector = selector(labels);
        let params = ListParams::default().labels(&selector);
        Api::<JivaVolume>::all(self.client())
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|error| {
                api_error(
                    &selector,
                    StoreError::Conflict {
                        name: selector.clone(),
                    },
                    error,
                )
            })
    }
}
