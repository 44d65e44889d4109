//! The per-node provisioner agents and how the operator reaches them.
//!
//! Every node selected by a `LocalStorage` runs a provisioner (the same
//! binary, started with the `provisioner` subcommand) that measures and
//! prepares directories below the local path roots. The operator talks to
//! them over HTTP with JSON bodies.

mod client;
pub mod server;

pub use client::HttpProvisioner;

use crate::errors::*;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::Api;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub local_path: String,
}

/// Capacity of the filesystem holding a local path, in bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    #[serde(flatten)]
    pub node_info: NodeInfo,
    pub available: u64,
    pub capacity: u64,
}

/// Body of every non-2xx response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "Error")]
    pub error: String,
}

#[async_trait]
pub trait ProvisionerApi: Send + Sync {
    async fn node_info(&self) -> Result<NodeInfo>;
    async fn info(&self, local_path: &str) -> Result<Info>;
    /// Create the directory, or empty it when it exists.
    async fn prepare(&self, local_path: &str) -> Result<()>;
    /// Remove the directory. A missing directory is not an error.
    async fn remove(&self, local_path: &str) -> Result<()>;
}

/// The set of provisioners serving one `LocalStorage`.
#[async_trait]
pub trait ProvisionerFleet: Send + Sync {
    /// Clients for the provisioners that are ready right now.
    async fn members(&self) -> Result<Vec<Arc<dyn ProvisionerApi>>>;

    async fn for_node(&self, node: &str) -> Result<Arc<dyn ProvisionerApi>> {
        for member in self.members().await? {
            match member.node_info().await {
                Ok(info) if info.node_name == node => return Ok(member),
                Ok(_) => {}
                Err(err) => debug!("skipping unreachable provisioner: {}", err),
            }
        }
        bail!(ErrorKind::NotFound(format!("provisioner for node {}", node)))
    }
}

/// Finds provisioners through the ready addresses of their Service.
pub struct EndpointsFleet {
    api: Api<Endpoints>,
    service: String,
    port: u16,
}

impl EndpointsFleet {
    pub fn new(api: Api<Endpoints>, service: &str, port: u16) -> Self {
        EndpointsFleet {
            api,
            service: service.to_string(),
            port,
        }
    }
}

/// `http://ip:port` for every ready address, sorted.
pub fn endpoint_urls(endpoints: &Endpoints, port: u16) -> Vec<String> {
    let mut urls: Vec<String> = endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|s| s.addresses.iter().flatten())
        .map(|a| format!("http://{}:{}", a.ip, port))
        .collect();
    urls.sort();
    urls.dedup();
    urls
}

#[async_trait]
impl ProvisionerFleet for EndpointsFleet {
    async fn members(&self) -> Result<Vec<Arc<dyn ProvisionerApi>>> {
        let endpoints = match self.api.get(&self.service).await {
            Ok(eps) => eps,
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                bail!(ErrorKind::NotFound(format!("endpoints {}", self.service)))
            }
            Err(err) => return Err(err.into()),
        };
        endpoint_urls(&endpoints, self.port)
            .into_iter()
            .map(|url| Ok(Arc::new(HttpProvisioner::new(&url)?) as Arc<dyn ProvisionerApi>))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};

    #[test]
    fn info_wire_format() {
        let info = Info {
            node_info: NodeInfo {
                node_name: "n1".to_string(),
            },
            available: 100,
            capacity: 200,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"nodeName": "n1", "available": 100, "capacity": 200})
        );
        let err: ErrorResponse = serde_json::from_str(r#"{"Error":"boom"}"#).unwrap();
        assert_eq!(err.error, "boom");
    }

    #[test]
    fn urls_from_ready_addresses() {
        let addr = |ip: &str| EndpointAddress {
            ip: ip.to_string(),
            ..EndpointAddress::default()
        };
        let eps = Endpoints {
            subsets: Some(vec![
                EndpointSubset {
                    addresses: Some(vec![addr("10.0.0.2"), addr("10.0.0.1")]),
                    ..EndpointSubset::default()
                },
                EndpointSubset {
                    addresses: Some(vec![addr("10.0.0.1")]),
                    not_ready_addresses: Some(vec![addr("10.0.0.9")]),
                    ..EndpointSubset::default()
                },
            ]),
            ..Endpoints::default()
        };
        assert_eq!(
            endpoint_urls(&eps, 8929),
            vec!["http://10.0.0.1:8929", "http://10.0.0.2:8929"]
        );
    }
}
