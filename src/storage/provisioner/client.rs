use super::{ErrorResponse, Info, NodeInfo, ProvisionerApi, Request};
use crate::errors::*;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

pub const PROVISIONER_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct HttpProvisioner {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProvisioner {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROVISIONER_REQUEST_TIMEOUT)
            .build()?;
        Ok(HttpProvisioner {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn call<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.endpoint, path);
        let mut req = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(err) if err.is_timeout() => {
                bail!(ErrorKind::Timeout(format!("{} {}", method, url)))
            }
            Err(err) => return Err(err.into()),
        };
        let status = resp.status();
        let raw = resp.bytes().await?;
        if status.is_success() {
            if raw.is_empty() {
                return Ok(serde_json::from_str("null")?);
            }
            return Ok(serde_json::from_slice(&raw)?);
        }
        let message = serde_json::from_slice::<ErrorResponse>(&raw)
            .map(|e| e.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&raw).into_owned());
        Err(match status {
            StatusCode::BAD_REQUEST => ErrorKind::BadRequest(message).into(),
            _ => ErrorKind::Internal(format!("{} returned {}: {}", url, status, message)).into(),
        })
    }

    async fn post_path(&self, path: &str, local_path: &str) -> Result<()> {
        let req = Request {
            local_path: local_path.to_string(),
        };
        let _: Option<serde_json::Value> = self.call(Method::POST, path, Some(&req)).await?;
        Ok(())
    }
}

#[async_trait]
impl ProvisionerApi for HttpProvisioner {
    async fn node_info(&self) -> Result<NodeInfo> {
        self.call::<(), _>(Method::GET, "/nodeinfo", None).await
    }

    async fn info(&self, local_path: &str) -> Result<Info> {
        let req = Request {
            local_path: local_path.to_string(),
        };
        self.call(Method::POST, "/info", Some(&req)).await
    }

    async fn prepare(&self, local_path: &str) -> Result<()> {
        self.post_path("/prepare", local_path).await
    }

    async fn remove(&self, local_path: &str) -> Result<()> {
        self.post_path("/remove", local_path).await
    }
}
