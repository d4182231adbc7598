//! Implementation of gRPC methods from CSI Identity gRPC service.

use std::collections::HashMap;

use tonic::{Request, Response, Status};

use super::csi::*;

/// Name the driver registers under unless configured otherwise.
pub const DEFAULT_DRIVER_NAME: &str = "jiva.csi.openebs.io";
const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug)]
pub struct Identity {
    driver_name: String,
}

impl Identity {
    pub fn new(driver_name: &str) -> Self {
        Self {
            driver_name: driver_name.to_string(),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new(DEFAULT_DRIVER_NAME)
    }
}

#[tonic::async_trait]
impl identity_server::Identity for Identity {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        debug!(
            "GetPluginInfo request ({}:{})",
            self.driver_name, PLUGIN_VERSION
        );

        if self.driver_name.is_empty() {
            return Err(failure!(Code::Unavailable, "Driver name not configured"));
        }

        Ok(Response::new(GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: PLUGIN_VERSION.to_owned(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let caps = vec![plugin_capability::service::Type::ControllerService];
        debug!("GetPluginCapabilities request: {:?}", caps);

        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|c| PluginCapability {
                    r#type: Some(plugin_capability::Type::Service(
                        plugin_capability::Service {
                            r#type: c as i32,
                        },
                    )),
                })
                .collect(),
        }))
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse {
            ready: Some(true),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity_server::Identity as _;

    #[tokio::test]
    async fn plugin_info() {
        let identity = Identity::default();
        let info = identity
            .get_plugin_info(Request::new(GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.name, DEFAULT_DRIVER_NAME);
        assert_eq!(info.vendor_version, env!("CARGO_PKG_VERSION"));

        let error = Identity::new("")
            .get_plugin_info(Request::new(GetPluginInfoRequest {}))
            .await
            .unwrap_err();
        assert_eq!(error.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn capabilities_and_probe() {
        let identity = Identity::default();
        let caps = identity
            .get_plugin_capabilities(Request::new(
                GetPluginCapabilitiesRequest {},
            ))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(caps.capabilities.len(), 1);

        let probe = identity
            .probe(Request::new(ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(probe.ready, Some(true));
    }
}
