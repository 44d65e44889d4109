//! HTTP server of the node local provisioner.

use super::{ErrorResponse, Info, NodeInfo, Request};
use crate::errors::*;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct ProvisionerServer {
    node_name: String,
    allowed_roots: Arc<Vec<PathBuf>>,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match err.kind() {
            ErrorKind::Validation(_) | ErrorKind::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

impl ProvisionerServer {
    /// With no allowed roots every absolute path is served.
    pub fn new(node_name: &str, allowed_roots: Vec<PathBuf>) -> Self {
        ProvisionerServer {
            node_name: node_name.to_string(),
            allowed_roots: Arc::new(allowed_roots),
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/nodeinfo", get(node_info))
            .route("/info", post(info))
            .route("/prepare", post(prepare))
            .route("/remove", post(remove))
            .with_state(self)
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            "provisioner for node {} listening on {}",
            self.node_name,
            listener.local_addr()?
        );
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Reject relative paths, `..` components and anything outside the
    /// allowed roots. `volume` paths must lie strictly below a root.
    fn check_path(&self, raw: &str, volume: bool) -> Result<PathBuf> {
        let path = PathBuf::from(raw);
        if !path.is_absolute() {
            bail!(ErrorKind::BadRequest(format!("{} is not absolute", raw)));
        }
        if path.components().any(|c| c == Component::ParentDir) {
            bail!(ErrorKind::BadRequest(format!("{} may not contain '..'", raw)));
        }
        if self.allowed_roots.is_empty() {
            return Ok(path);
        }
        let allowed = self
            .allowed_roots
            .iter()
            .any(|root| path.starts_with(root) && !(volume && path == *root));
        if !allowed {
            bail!(ErrorKind::BadRequest(format!(
                "{} is outside the local path roots",
                raw
            )));
        }
        Ok(path)
    }
}

fn filesystem_info(path: &Path) -> Result<(u64, u64)> {
    let stat = nix::sys::statvfs::statvfs(path)
        .chain_err(|| format!("statvfs of {}", path.display()))?;
    let unit = stat.fragment_size() as u64;
    Ok((
        stat.blocks_available() as u64 * unit,
        stat.blocks() as u64 * unit,
    ))
}

async fn clear_dir(path: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

async fn node_info(State(server): State<ProvisionerServer>) -> Json<NodeInfo> {
    Json(NodeInfo {
        node_name: server.node_name.clone(),
    })
}

async fn info(State(server): State<ProvisionerServer>, Json(req): Json<Request>) -> ApiResult<Info> {
    let path = server.check_path(&req.local_path, false)?;
    let (available, capacity) = filesystem_info(&path)?;
    Ok(Json(Info {
        node_info: NodeInfo {
            node_name: server.node_name.clone(),
        },
        available,
        capacity,
    }))
}

async fn prepare(
    State(server): State<ProvisionerServer>,
    Json(req): Json<Request>,
) -> ApiResult<serde_json::Value> {
    let path = server.check_path(&req.local_path, true)?;
    info!("preparing {}", path.display());
    let res: Result<()> = async {
        tokio::fs::create_dir_all(&path).await?;
        clear_dir(&path).await
    }
    .await;
    if let Err(err) = res {
        warn!("preparing {} failed: {}", path.display(), err);
        return Err(err.into());
    }
    Ok(Json(serde_json::json!({})))
}

async fn remove(
    State(server): State<ProvisionerServer>,
    Json(req): Json<Request>,
) -> ApiResult<serde_json::Value> {
    let path = server.check_path(&req.local_path, true)?;
    info!("removing {}", path.display());
    match tokio::fs::remove_dir_all(&path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!("removing {} failed: {}", path.display(), err);
            return Err(Error::from(err).into());
        }
    }
    Ok(Json(serde_json::json!({})))
}
