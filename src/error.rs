//! Error taxonomy and response helpers for the router

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Body type every handler produces
pub type RouterBody = BoxBody<Bytes, hyper::Error>;

/// Errors surfaced by the router's own handlers. Anything reaching the fault
/// boundary as one of these is logged and answered with its status code.
#[derive(Debug, Error)]
pub enum RouterError {
    /// `/accepted_eula` was hit without a `referer=` query parameter
    #[error("EULA accepted but no referer supplied")]
    MissingReferer,

    /// The EULA page asset is missing or unreadable
    #[error("EULA page asset unavailable: {0}")]
    EulaAssetMissing(#[source] std::io::Error),

    /// The per-user backend failed to start
    #[error("backend start failed for user {user}")]
    BackendStartFailed { user: String },

    /// Per-user settings could not be loaded from the store
    #[error("failed to load settings for user {user}: {source}")]
    SettingsLoad {
        user: String,
        #[source]
        source: anyhow::Error,
    },

    /// Forwarding to a backend port failed
    #[error("failed to forward request to port {port}: {source}")]
    Forward {
        port: u16,
        #[source]
        source: anyhow::Error,
    },

    /// Local I/O failure while serving a request
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RouterError {
    /// HTTP status this error maps to when it escapes to the fault boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::MissingReferer => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::EulaAssetMissing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::BackendStartFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::SettingsLoad { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::Forward { .. } => StatusCode::BAD_GATEWAY,
            RouterError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Response with the given status and an empty body
pub fn empty_response(status: StatusCode) -> Response<RouterBody> {
    Response::builder()
        .status(status)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

/// 302 redirect to the given location
pub fn redirect_response(location: &str) -> Response<RouterBody> {
    let location = HeaderValue::from_str(location)
        .unwrap_or_else(|_| HeaderValue::from_static("/"));
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, location)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

/// 200 response carrying an HTML body
pub fn html_response(body: impl Into<Bytes>) -> Response<RouterBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

/// 200 response carrying a JSON body
pub fn json_response(body: impl Into<Bytes>) -> Response<RouterBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

/// Plain-text response with an explicit status
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<RouterBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}
