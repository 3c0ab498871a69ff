//! An in-memory stand-in for a container daemon.
//!
//! Serves the endpoints the client's integration tests need, with the same
//! body shapes a real daemon uses: JSON documents, newline-delimited JSON
//! progress for pulls, an endless chunked stream for live stats, the 8-byte
//! multiplexed framing for logs, and tar archives for file copies. Nothing
//! is executed; `echo` is the only command whose output is simulated.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Delay between two samples of a live stats stream.
pub const STATS_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreatedContainer {
    pub id: String,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
    pub exit_code: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub image: String,
    pub config: ContainerConfig,
    pub state: ContainerState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
}

#[derive(Debug)]
struct Container {
    inspect: ContainerInspect,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// Absolute path inside the container to content.
    files: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct Daemon {
    containers: HashMap<String, Container>,
    images: Vec<ImageSummary>,
}

impl Daemon {
    /// Look a container up by full id, name, or unique id prefix.
    fn find(&self, key: &str) -> Result<&Container, ApiError> {
        let id = self.resolve(key)?;
        self.containers
            .get(&id)
            .ok_or_else(|| ApiError::no_such_container(key))
    }

    fn find_mut(&mut self, key: &str) -> Result<&mut Container, ApiError> {
        let id = self.resolve(key)?;
        self.containers
            .get_mut(&id)
            .ok_or_else(|| ApiError::no_such_container(key))
    }

    fn resolve(&self, key: &str) -> Result<String, ApiError> {
        if self.containers.contains_key(key) {
            return Ok(key.to_string());
        }
        let name = format!("/{}", key.trim_start_matches('/'));
        let mut matches = self
            .containers
            .values()
            .filter(|c| c.inspect.name == name || c.inspect.id.starts_with(key))
            .map(|c| c.inspect.id.clone());
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id),
            _ => Err(ApiError::no_such_container(key)),
        }
    }

    fn has_image(&self, reference: &str) -> bool {
        self.images
            .iter()
            .any(|image| image.repo_tags.iter().any(|t| t == reference))
    }
}

pub type Db = Arc<RwLock<Daemon>>;

/// An error response with the daemon's `{"message": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn no_such_container(key: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("No such container: {key}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!(status = %self.status, message = %self.message, "request failed");
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(Daemon::default()));
    Router::new()
        .route("/_ping", get(ping))
        .route("/images/json", get(list_images))
        .route("/images/create", post(pull_image))
        .route("/containers/create", post(create_container))
        .route("/containers/{id}", delete(remove_container))
        .route("/containers/{id}/json", get(inspect_container))
        .route("/containers/{id}/start", post(start_container))
        .route("/containers/{id}/stats", get(container_stats))
        .route("/containers/{id}/logs", get(container_logs))
        .route("/containers/{id}/archive", get(get_archive).put(put_archive))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    info!(addr = ?listener.local_addr().ok(), "mock daemon listening");
    axum::serve(listener, app()).await
}

#[cfg(unix)]
pub async fn run_unix(listener: UnixListener) -> Result<(), std::io::Error> {
    info!(path = ?listener.local_addr().ok(), "mock daemon listening");
    axum::serve(listener, app()).await
}

/// `1`/`true` or `0`/`false`, as the daemon accepts for boolean parameters.
fn flag(value: Option<&str>, default: bool) -> bool {
    match value {
        Some("1") | Some("true") | Some("True") => true,
        Some("0") | Some("false") | Some("False") => false,
        _ => default,
    }
}

/// `busybox` means `busybox:latest`.
fn image_reference(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

async fn ping() -> &'static str {
    "OK"
}

async fn list_images(State(db): State<Db>) -> Json<Vec<ImageSummary>> {
    Json(db.read().await.images.clone())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullParams {
    from_image: Option<String>,
    tag: Option<String>,
}

async fn pull_image(
    State(db): State<Db>,
    Query(params): Query<PullParams>,
) -> Result<Response, ApiError> {
    let name = params
        .from_image
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "fromImage is required"))?;
    let tag = params.tag.unwrap_or_else(|| "latest".to_string());
    let reference = format!("{name}:{tag}");
    let layer = Uuid::new_v4().simple().to_string()[..12].to_string();
    debug!(%reference, "pulling image");

    let mut lines = vec![json!({"status": format!("Pulling from library/{name}"), "id": tag})];
    if name.starts_with("nonexistent") {
        let message = format!("manifest for {reference} not found: manifest unknown");
        lines.push(json!({"errorDetail": {"message": message}, "error": message}));
    } else {
        let digest = Uuid::new_v4().simple().to_string();
        lines.extend([
            json!({"status": "Pulling fs layer", "progressDetail": {}, "id": layer}),
            json!({"status": "Download complete", "progressDetail": {}, "id": layer}),
            json!({"status": "Pull complete", "progressDetail": {}, "id": layer}),
            json!({"status": format!("Digest: sha256:{digest}{digest}")}),
            json!({"status": format!("Status: Downloaded newer image for {reference}")}),
        ]);
        let mut daemon = db.write().await;
        if !daemon.has_image(&reference) {
            daemon.images.push(ImageSummary {
                id: format!("sha256:{digest}"),
                repo_tags: vec![reference],
            });
        }
    }

    // One chunk per progress line, as the daemon flushes them.
    let chunks = lines.into_iter().map(|line| {
        let mut bytes = line.to_string().into_bytes();
        bytes.push(b'\n');
        Ok::<_, Infallible>(Bytes::from(bytes))
    });
    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(stream::iter(chunks)),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    name: Option<String>,
}

async fn create_container(
    State(db): State<Db>,
    Query(params): Query<CreateParams>,
    Json(config): Json<ContainerConfig>,
) -> Result<(StatusCode, Json<CreatedContainer>), ApiError> {
    let mut daemon = db.write().await;
    let reference = image_reference(&config.image);
    if !daemon.has_image(&reference) {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("No such image: {reference}"),
        ));
    }
    let id = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    let name = format!("/{}", params.name.unwrap_or_else(|| id[..12].to_string()));
    if daemon.containers.values().any(|c| c.inspect.name == name) {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("Conflict. The container name {name:?} is already in use"),
        ));
    }
    debug!(%id, %name, image = %config.image, "container created");
    let container = Container {
        inspect: ContainerInspect {
            id: id.clone(),
            name,
            image: reference,
            config,
            state: ContainerState {
                status: "created".to_string(),
                running: false,
                exit_code: 0,
            },
        },
        stdout: Vec::new(),
        stderr: Vec::new(),
        files: HashMap::new(),
    };
    daemon.containers.insert(id.clone(), container);
    Ok((
        StatusCode::CREATED,
        Json(CreatedContainer {
            id,
            warnings: Vec::new(),
        }),
    ))
}

async fn start_container(
    State(db): State<Db>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let mut daemon = db.write().await;
    let container = daemon.find_mut(&key)?;
    if container.inspect.state.running {
        return Ok(StatusCode::NOT_MODIFIED);
    }
    let cmd = &container.inspect.config.cmd;
    match cmd.split_first() {
        Some((program, args)) if program == "echo" => {
            container.stdout.extend_from_slice(args.join(" ").as_bytes());
            container.stdout.push(b'\n');
        }
        Some((program, _)) => {
            let line = format!("{program}: command not found\n");
            container.stderr.extend_from_slice(line.as_bytes());
        }
        None => {}
    }
    container.inspect.state.running = true;
    container.inspect.state.status = "running".to_string();
    Ok(StatusCode::NO_CONTENT)
}

async fn inspect_container(
    State(db): State<Db>,
    Path(key): Path<String>,
) -> Result<Json<ContainerInspect>, ApiError> {
    let daemon = db.read().await;
    Ok(Json(daemon.find(&key)?.inspect.clone()))
}

#[derive(Debug, Deserialize)]
struct RemoveParams {
    force: Option<String>,
}

async fn remove_container(
    State(db): State<Db>,
    Path(key): Path<String>,
    Query(params): Query<RemoveParams>,
) -> Result<StatusCode, ApiError> {
    let mut daemon = db.write().await;
    let container = daemon.find(&key)?;
    if container.inspect.state.running && !flag(params.force.as_deref(), false) {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("You cannot remove a running container {key}. Stop the container before attempting removal or force remove"),
        ));
    }
    let id = container.inspect.id.clone();
    daemon.containers.remove(&id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    stream: Option<String>,
}

fn stats_sample(id: &str, n: u64) -> serde_json::Value {
    json!({
        "id": id,
        "num_procs": 1,
        "cpu_stats": { "cpu_usage": { "total_usage": 1_000_000 * n }, "online_cpus": 2 },
        "memory_stats": { "usage": 4_194_304 + 4096 * n, "limit": 1_073_741_824u64 },
    })
}

async fn container_stats(
    State(db): State<Db>,
    Path(key): Path<String>,
    Query(params): Query<StatsParams>,
) -> Result<Response, ApiError> {
    let id = db.read().await.find(&key)?.inspect.id.clone();
    if !flag(params.stream.as_deref(), true) {
        return Ok(Json(stats_sample(&id, 0)).into_response());
    }
    debug!(%id, "streaming stats");
    // Runs until the client goes away.
    let samples = stream::unfold(0u64, move |n| {
        let id = id.clone();
        async move {
            if n > 0 {
                tokio::time::sleep(STATS_INTERVAL).await;
            }
            let mut line = stats_sample(&id, n).to_string().into_bytes();
            line.push(b'\n');
            Some((Ok::<_, Infallible>(Bytes::from(line)), n + 1))
        }
    });
    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(samples),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    stdout: Option<String>,
    stderr: Option<String>,
}

/// One frame of the multiplexed stream format.
fn frame(stream: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.extend_from_slice(&[stream, 0, 0, 0]);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

async fn container_logs(
    State(db): State<Db>,
    Path(key): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<Response, ApiError> {
    let want_stdout = flag(params.stdout.as_deref(), false);
    let want_stderr = flag(params.stderr.as_deref(), false);
    if !want_stdout && !want_stderr {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "You must choose at least one stream",
        ));
    }
    let daemon = db.read().await;
    let container = daemon.find(&key)?;
    let mut body = Vec::new();
    if want_stdout {
        for line in container.stdout.split_inclusive(|&b| b == b'\n') {
            body.extend(frame(1, line));
        }
    }
    if want_stderr {
        for line in container.stderr.split_inclusive(|&b| b == b'\n') {
            body.extend(frame(2, line));
        }
    }
    Ok((
        [(header::CONTENT_TYPE, "application/vnd.docker.multiplexed-stream")],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct ArchiveParams {
    path: Option<String>,
}

fn required_path(params: ArchiveParams) -> Result<String, ApiError> {
    params
        .path
        .filter(|p| p.starts_with('/'))
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "path must be absolute"))
}

async fn put_archive(
    State(db): State<Db>,
    Path(key): Path<String>,
    Query(params): Query<ArchiveParams>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let dir = required_path(params)?;
    let bad_archive = |e: std::io::Error| {
        ApiError::new(StatusCode::BAD_REQUEST, format!("invalid tar archive: {e}"))
    };

    let mut unpacked = Vec::new();
    let mut archive = tar::Archive::new(&body[..]);
    for entry in archive.entries().map_err(bad_archive)? {
        let mut entry = entry.map_err(bad_archive)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path().map_err(bad_archive)?.to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).map_err(bad_archive)?;
        unpacked.push((format!("{}/{}", dir.trim_end_matches('/'), name), content));
    }

    let mut daemon = db.write().await;
    let container = daemon.find_mut(&key)?;
    debug!(id = %container.inspect.id, files = unpacked.len(), %dir, "archive extracted");
    container.files.extend(unpacked);
    Ok(StatusCode::OK)
}

async fn get_archive(
    State(db): State<Db>,
    Path(key): Path<String>,
    Query(params): Query<ArchiveParams>,
) -> Result<Response, ApiError> {
    let path = required_path(params)?;
    let daemon = db.read().await;
    let container = daemon.find(&key)?;
    let content = container.files.get(&path).ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Could not find the file {path} in container {key}"),
        )
    })?;
    let name = path.rsplit('/').next().unwrap_or(&path);

    let internal = |e: std::io::Error| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    let mut builder = tar::Builder::new(Vec::new());
    let mut entry = tar::Header::new_ustar();
    entry.set_size(content.len() as u64);
    entry.set_mode(0o644);
    builder
        .append_data(&mut entry, name, &content[..])
        .map_err(internal)?;
    let archive = builder.into_inner().map_err(internal)?;
    Ok(([(header::CONTENT_TYPE, "application/x-tar")], archive).into_response())
}
