//! Request dispatch, fault boundary and websocket wiring
//!
//! One listener accepts every connection. HTTP requests flow through the
//! fault boundary into the ordered dispatcher; protocol-upgrade requests
//! bypass every gate and are spliced straight to the user's backend socket.

use crate::auth::AuthFlow;
use crate::config::{Config, RuntimeSwitches};
use crate::content::ContentHandler;
use crate::error::{empty_response, text_response, RouterBody, RouterError};
use crate::eula::EulaGate;
use crate::forward::{Forwarder, ForwarderConfig};
use crate::info::InfoHandler;
use crate::lifecycle::{BackendSpawner, LifecycleCoordinator};
use crate::router::{classify, RouteCategory};
use crate::settings::{FileSettingsStore, SettingsCache, STARTUP_PATH_SETTING};
use crate::user::{CookieUserDirectory, UserDirectory};
use futures::FutureExt;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How protocol upgrades are intercepted. Exactly one mode is active per
/// process, selected by the `PROXY_WEB_SOCKETS` switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    /// Server-wide wrapper: every request is inspected for an upgrade before
    /// it can reach the fault boundary or any gate
    Wrapped,
    /// Direct upgrade-event handling at dispatch entry
    Direct,
}

/// Everything dispatch needs, built once at startup and threaded through
/// every handler and collaborator.
pub struct AppContext {
    pub default_startup_path: String,
    pub socket_mode: SocketMode,
    /// When set, `/_nocachecontent/` is forwarded to this gateway port
    /// instead of being served locally
    pub nocache_gateway_port: Option<u16>,
    pub eula: EulaGate,
    pub settings: Arc<SettingsCache>,
    pub lifecycle: Arc<LifecycleCoordinator>,
    pub forwarder: Forwarder,
    pub content: ContentHandler,
    pub info: InfoHandler,
    pub users: Arc<dyn UserDirectory>,
    pub auth: Arc<dyn AuthFlow>,
    /// Signalled by `/_restart` once the response is on its way; `main`
    /// terminates the process when it fires
    pub restart_tx: watch::Sender<bool>,
}

impl AppContext {
    /// Assemble the context from configuration with the default
    /// collaborators. `nocache_gateway_port` comes from the content gateway
    /// switch; tests substitute their own collaborators by building the
    /// struct directly.
    pub fn new(
        config: &Config,
        switches: RuntimeSwitches,
        nocache_gateway_port: Option<u16>,
        spawner: Arc<dyn BackendSpawner>,
        auth: Arc<dyn AuthFlow>,
        restart_tx: watch::Sender<bool>,
    ) -> Arc<Self> {
        let lifecycle = LifecycleCoordinator::new(spawner);
        let settings = Arc::new(SettingsCache::new(Arc::new(FileSettingsStore::new(
            &config.content.settings_dir,
        ))));
        let forwarder = Forwarder::new(ForwarderConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        });
        let socket_mode = if switches.proxy_web_sockets {
            SocketMode::Wrapped
        } else {
            SocketMode::Direct
        };

        Arc::new(Self {
            default_startup_path: config.content.default_startup_path.clone(),
            socket_mode,
            nocache_gateway_port: switches.proxy_nocache_content.then_some(nocache_gateway_port).flatten(),
            eula: EulaGate::new(&config.eula.marker_dir, &config.eula.page_path),
            settings,
            info: InfoHandler::new(Arc::clone(&lifecycle)),
            lifecycle,
            forwarder,
            content: ContentHandler::new(&config.content.static_root),
            users: Arc::new(CookieUserDirectory),
            auth,
            restart_tx,
        })
    }
}

/// The front-door listener
pub struct RouterServer {
    bind_addr: SocketAddr,
    ctx: Arc<AppContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RouterServer {
    pub fn new(bind_addr: SocketAddr, ctx: Arc<AppContext>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            ctx,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Router listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Router shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { guarded_dispatch(ctx, req).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Fault boundary: a failing or panicking handler is logged with request
/// context and answered with an empty error status; the listener keeps
/// serving.
pub async fn guarded_dispatch(
    ctx: Arc<AppContext>,
    req: Request<Incoming>,
) -> Result<Response<RouterBody>, hyper::Error> {
    // The wrapping interceptor sees upgrades before any gate or guard.
    if ctx.socket_mode == SocketMode::Wrapped && is_upgrade_request(&req) {
        return Ok(handle_socket(ctx, req).await);
    }

    let request_id = Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match AssertUnwindSafe(dispatch(Arc::clone(&ctx), req))
        .catch_unwind()
        .await
    {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(%method, path, request_id, error = %e, "Request handler failed");
            Ok(empty_response(e.status_code()))
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%method, path, request_id, panic = %message, "Uncaught panic handling a request");
            Ok(empty_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

/// Ordered dispatch per the route table
async fn dispatch(
    ctx: Arc<AppContext>,
    req: Request<Incoming>,
) -> Result<Response<RouterBody>, RouterError> {
    // Direct upgrade-event handling: upgrades skip routing entirely.
    if ctx.socket_mode == SocketMode::Direct && is_upgrade_request(&req) {
        return Ok(handle_socket(ctx, req).await);
    }

    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    match classify(&path, ctx.eula.has_accepted()) {
        RouteCategory::EulaAccept => ctx.eula.accept(&query).await,
        RouteCategory::Auth => Ok(ctx.auth.handle(&path, &query)),
        RouteCategory::Static => Ok(ctx.content.serve(&path, false).await),
        RouteCategory::EulaPage => {
            info!(path, "EULA not accepted; serving EULA page");
            ctx.eula.serve_page().await
        }
        category => handle_routed(ctx, req, &path, &query, category).await,
    }
}

/// Handle a request that passed the EULA gate and the pre-gate rules
async fn handle_routed(
    ctx: Arc<AppContext>,
    req: Request<Incoming>,
    path: &str,
    query: &str,
    category: RouteCategory,
) -> Result<Response<RouterBody>, RouterError> {
    let user = ctx.users.user_id(req.headers());
    ctx.settings.ensure_loaded(&user)?;
    debug!(method = %req.method(), path, user, "Dispatching request");

    // Overlap backend startup with the rest of the request's work; the
    // result is observed later (or never), not here.
    ctx.lifecycle.ensure_started(&user);

    match category {
        RouteCategory::Root => {
            let target = ctx
                .settings
                .get(&user, STARTUP_PATH_SETTING)
                .unwrap_or_else(|| ctx.default_startup_path.clone());
            let mut resp = crate::error::redirect_response(&target);
            if let Some(cookie) = ctx.users.issue_cookie(req.headers()) {
                resp.headers_mut().insert(hyper::header::SET_COOKIE, cookie);
            }
            Ok(resp)
        }
        RouteCategory::ExplicitProxyPort(port) => ctx.forwarder.send(req, port).await,
        RouteCategory::NoCacheContent => match ctx.nocache_gateway_port {
            Some(port) => ctx.forwarder.send(req, port).await,
            None => Ok(ctx.content.serve(path, true).await),
        },
        RouteCategory::BackendProxied { tree } => {
            if tree {
                // Record the last-visited tree path before proxying.
                ctx.settings.update(&user, STARTUP_PATH_SETTING, path, true);
            }
            let port = ctx.lifecycle.wait_ready(&user).await?;
            ctx.forwarder.send(req, port).await
        }
        RouteCategory::Info => Ok(ctx.info.handle()),
        RouteCategory::Restart => {
            // Respond first; main exits the process once the signal lands.
            let restart_tx = ctx.restart_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = restart_tx.send(true);
            });
            warn!(user, "Restart requested");
            Ok(empty_response(StatusCode::OK))
        }
        RouteCategory::Setting => Ok(handle_setting(&ctx, &user, query)),
        RouteCategory::NotFound => Ok(empty_response(StatusCode::NOT_FOUND)),
        // dispatch consumes the pre-gate categories before calling here.
        RouteCategory::EulaAccept
        | RouteCategory::Auth
        | RouteCategory::Static
        | RouteCategory::EulaPage => unreachable!("pre-gate category in post-gate dispatch"),
    }
}

/// `/_setting?key=name` reads, `/_setting?key=name&value=v` writes
fn handle_setting(ctx: &Arc<AppContext>, user: &str, query: &str) -> Response<RouterBody> {
    let key = match query_param(query, "key") {
        Some(key) if !key.is_empty() => key,
        _ => return empty_response(StatusCode::BAD_REQUEST),
    };

    match query_param(query, "value") {
        Some(value) => {
            ctx.settings.update(user, &key, &value, true);
            empty_response(StatusCode::OK)
        }
        None => match ctx.settings.get(user, &key) {
            Some(value) => text_response(StatusCode::OK, value),
            None => empty_response(StatusCode::NOT_FOUND),
        },
    }
}

/// Decode a single query parameter
fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == name {
            Some(
                urlencoding::decode(v)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| v.to_string()),
            )
        } else {
            None
        }
    })
}

/// Check if a request is a protocol-upgrade (WebSocket) request
pub fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Splice an upgrade request straight to the user's backend. No EULA, auth,
/// routing or lifecycle check applies; a backend that is not ready yet is a
/// 502 and the client reconnects.
async fn handle_socket(ctx: Arc<AppContext>, req: Request<Incoming>) -> Response<RouterBody> {
    let user = ctx.users.user_id(req.headers());
    let port = ctx.lifecycle.port(&user);
    if port == 0 {
        warn!(user, path = %req.uri().path(), "Upgrade before backend ready");
        return empty_response(StatusCode::BAD_GATEWAY);
    }

    let raw_request = build_upgrade_request(&req, port);

    let mut backend_stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(user, port, error = %e, "Failed to connect to backend for upgrade");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(user, port, error = %e, "Failed to send upgrade request to backend");
        return empty_response(StatusCode::BAD_GATEWAY);
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match backend_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(user, port, "Backend closed connection before responding to upgrade");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
        Err(e) => {
            error!(user, port, error = %e, "Failed to read upgrade response from backend");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => {
            error!(user, port, "Failed to parse backend upgrade response");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(user, port, status = %status, "Backend rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder");
    }

    debug!(user, port, "WebSocket upgrade accepted by backend");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, &user, port).await;
            }
            Err(e) => {
                error!(user, port, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    response
}

/// Rebuild the upgrade request as raw HTTP/1.1 bytes for the backend
fn build_upgrade_request(req: &Request<Incoming>, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the backend's upgrade response head
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Relay bytes between the upgraded client and the backend socket
async fn forward_bidirectional(client: Upgraded, backend: TcpStream, user: &str, port: u16) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                user,
                port, client_to_backend, backend_to_client, "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(user, port, error = %e, "WebSocket connection closed with error");
        }
    }
}
