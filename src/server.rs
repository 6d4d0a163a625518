use std::{future::Future, net::SocketAddr};

use axum::{
    extract::{rejection::JsonRejection, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::{
    config::Config,
    error::Error,
    events::DeviceInfo,
    lock::{Lock, ReleaseMode},
    scanner::{LastScan, ScannerStatus},
    sse,
    station::{Discovery, Station},
    websocket,
};

/// How a failed request looks on the wire.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// The condition, see [`Error::condition`].
    pub error: String,

    /// Human readable detail.
    pub detail: String,

    /// The holder, if a lock was held.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub holder: Option<Lock>,

    /// The partial response, if the device reported an error.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lines: Option<Vec<String>>,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::BadJson {
            request: String::new(),
            problem: rejection.to_string(),
        })
    }
}

fn status_of(e: &Error) -> StatusCode {
    match e {
        // Nobody will see this, but it shows up nicely in access logs.
        Error::ClientAbort => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::TransportAbsent(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::InvalidMac(_) | Error::InvalidInput(_) | Error::BadJson { .. } => {
            StatusCode::BAD_REQUEST
        }
        Error::EchoMismatch { .. } | Error::DeviceError { .. } => StatusCode::BAD_GATEWAY,
        Error::LockHeld(_) => StatusCode::CONFLICT,
        Error::StoreUnavailable(_) | Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        Error::NoSuchScanner(_) => StatusCode::NOT_FOUND,
        Error::BadConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_of(&self.0);
        debug!(%status, e = %self.0, "Error response");

        let body = ErrorBody {
            error: self.0.condition().to_string(),
            detail: self.0.to_string(),
            holder: match &self.0 {
                Error::LockHeld(holder) => Some(holder.clone()),
                _ => None,
            },
            lines: self.0.device_lines().map(<[String]>::to_vec),
        };

        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Cancelled when the handler is dropped, i.e. when the client goes away.
fn request_token() -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();

    (token, guard)
}

#[derive(Debug, Deserialize)]
struct BlinkRequest {
    mac: String,
    #[serde(default = "one")]
    count: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitorRequest {
    mac: String,
    pins: Vec<u32>,
    #[serde(default)]
    latch_pins: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct MacRequest {
    mac: String,
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineResponse {
    ok: bool,
    line: String,
}

impl LineResponse {
    fn ok(line: String) -> Json<Self> {
        Json(Self { ok: true, line })
    }
}

#[derive(Debug, Serialize)]
struct CommandResponse {
    lines: Vec<String>,
}

async fn blink(
    Extension(station): Extension<Station>,
    request: Result<Json<BlinkRequest>, JsonRejection>,
) -> ApiResult<LineResponse> {
    let Json(request) = request?;
    let (cancel, _guard) = request_token();

    let line = station.blink(&request.mac, request.count, cancel).await?;

    Ok(LineResponse::ok(line))
}

async fn monitor(
    Extension(station): Extension<Station>,
    request: Result<Json<MonitorRequest>, JsonRejection>,
) -> ApiResult<LineResponse> {
    let Json(request) = request?;
    let (cancel, _guard) = request_token();

    let line = station
        .monitor(&request.pins, &request.latch_pins, &request.mac, cancel)
        .await?;

    Ok(LineResponse::ok(line))
}

async fn ready(
    Extension(station): Extension<Station>,
    request: Result<Json<MacRequest>, JsonRejection>,
) -> ApiResult<LineResponse> {
    let Json(request) = request?;
    let (cancel, _guard) = request_token();

    let line = station.check_ready(&request.mac, cancel).await?;

    Ok(LineResponse::ok(line))
}

async fn ping(Extension(station): Extension<Station>) -> ApiResult<LineResponse> {
    let (cancel, _guard) = request_token();

    let line = station.ping(cancel).await?;

    Ok(LineResponse::ok(line))
}

async fn command(
    Extension(station): Extension<Station>,
    request: Result<Json<CommandRequest>, JsonRejection>,
) -> ApiResult<CommandResponse> {
    let Json(request) = request?;
    let (cancel, _guard) = request_token();

    let lines = station.command(&request.command, cancel).await?;

    Ok(Json(CommandResponse { lines }))
}

async fn discover(Extension(station): Extension<Station>) -> ApiResult<Discovery> {
    let (cancel, _guard) = request_token();

    Ok(Json(station.discover(cancel).await?))
}

async fn devices(Extension(station): Extension<Station>) -> Json<Vec<DeviceInfo>> {
    Json(station.devices())
}

async fn scanner_status(Extension(station): Extension<Station>) -> Json<Vec<ScannerStatus>> {
    Json(station.scanners().status_all())
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: String,
}

#[derive(Debug, Serialize)]
struct LastScanResponse {
    path: String,
    scan: Option<LastScan>,
}

async fn last_scan(
    Extension(station): Extension<Station>,
    Query(query): Query<PathQuery>,
) -> ApiResult<LastScanResponse> {
    let scan = station.scanners().get_last_scan_and_clear_for(&query.path)?;

    Ok(Json(LastScanResponse {
        path: query.path,
        scan,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StationQuery {
    station_id: Option<String>,
    #[serde(default)]
    force: bool,
}

async fn list_locks(
    Extension(station): Extension<Station>,
    Query(query): Query<StationQuery>,
) -> ApiResult<Vec<Lock>> {
    Ok(Json(station.locks().list(query.station_id.as_deref()).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcquireRequest {
    kssk: String,
    mac: String,
    station_id: String,
    ttl_seconds: Option<u64>,
}

async fn acquire_lock(
    Extension(station): Extension<Station>,
    request: Result<Json<AcquireRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Lock>), ApiError> {
    let Json(request) = request?;

    let lock = station
        .locks()
        .acquire(
            &request.kssk,
            &request.mac,
            &request.station_id,
            request.ttl_seconds,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(lock)))
}

#[derive(Debug, Serialize)]
struct ReleaseResponse {
    released: bool,
}

async fn release_lock(
    Extension(station): Extension<Station>,
    Path(kssk): Path<String>,
    Query(query): Query<StationQuery>,
) -> ApiResult<ReleaseResponse> {
    let mode = match (query.force, query.station_id) {
        (true, _) => ReleaseMode::Force,
        (false, Some(station_id)) => ReleaseMode::Owner(station_id),
        (false, None) => {
            return Err(Error::InvalidInput(
                "Releasing needs either a stationId or force=true".into(),
            )
            .into())
        }
    };

    let released = station.locks().release(&kssk, mode).await?;

    Ok(Json(ReleaseResponse { released }))
}

async fn config(Extension(station): Extension<Station>) -> Json<Config> {
    Json(station.config().clone())
}

async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// All routes, backed by the station.
pub fn router(station: Station) -> Router {
    Router::new()
        .route("/events", get(sse::sse_handler))
        .route("/ws", get(websocket::ws_handler))
        .route("/config", get(config))
        .route("/version", get(version))
        .route("/serial/blink", post(blink))
        .route("/serial/monitor", post(monitor))
        .route("/serial/ping", post(ping))
        .route("/serial/ready", post(ready))
        .route("/serial/command", post(command))
        .route("/serial/discover", get(discover))
        .route("/serial/devices", get(devices))
        .route("/scanner/status", get(scanner_status))
        .route("/scanner/last-scan", get(last_scan))
        .route("/locks", get(list_locks).post(acquire_lock))
        .route("/locks/:kssk", delete(release_lock))
        .layer(TraceLayer::new_for_http())
        // Each handler needs to be able to reach the station
        .layer(Extension(station))
}

/// Serve the station until the shutdown future resolves.
///
/// If no port is given an arbitrary available one is used,
/// and if a sender is given the port is sent on it.
pub async fn serve<F>(
    station: Station,
    port: Option<u16>,
    allocated_port: Option<oneshot::Sender<u16>>,
    shutdown: F,
) -> Result<(), Error>
where
    F: Future<Output = ()>,
{
    let app = router(station);

    let addr = SocketAddr::from(([127, 0, 0, 1], port.unwrap_or(0)));
    let server = axum::Server::try_bind(&addr)
        .map_err(|e| Error::BadConfig(format!("Could not listen on {addr}: {e}")))?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        if port_reply.send(addr.port()).is_err() {
            debug!("Nobody wanted to know which port was allocated");
        }
    }

    info!("listening on {}", addr);

    if let Err(e) = server.with_graceful_shutdown(shutdown).await {
        error!(%e, "Server error");
    }

    Ok(())
}

async fn run(
    config: Config,
    port: Option<u16>,
    allocated_port: Option<oneshot::Sender<u16>>,
) -> Result<(), Error> {
    let station = Station::new(config).await?;

    let result = serve(
        station.clone(),
        port,
        allocated_port,
        futures::future::pending(),
    )
    .await;

    station.shutdown().await;

    result
}

/// Start the server on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(config: Config, allocated_port: oneshot::Sender<u16>) -> Result<(), Error> {
    run(config, None, Some(allocated_port)).await
}

/// Start the server on the given port.
pub async fn run_on_port(config: Config, port: u16) -> Result<(), Error> {
    run(config, Some(port), None).await
}
