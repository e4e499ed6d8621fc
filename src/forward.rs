//! Pooled HTTP forwarding to backend ports
//!
//! Byte-level forwarding is a collaborator of the dispatcher: given a request
//! and a loopback port, rewrite the URI and relay the exchange through a
//! pooled client.

use crate::error::{RouterBody, RouterError};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Connection pool knobs for the forwarding client
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Maximum idle connections kept per backend port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Rewrite a request URI to target the loopback backend port
fn backend_uri(port: u16, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("http://127.0.0.1:{port}{path_and_query}")
}

/// Forwards requests to `127.0.0.1:{port}` through a pooled client
pub struct Forwarder {
    client: Client<HttpConnector, Incoming>,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Forwarding client initialized"
        );

        Self { client }
    }

    /// Relay a request to the given backend port, preserving method, path,
    /// query, headers and body.
    pub async fn send(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<RouterBody>, RouterError> {
        let uri = backend_uri(port, req.uri());

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder.body(body).map_err(|e| RouterError::Forward {
            port,
            source: anyhow::anyhow!("failed to build backend request: {e}"),
        })?;

        let response = self
            .client
            .request(backend_req)
            .await
            .map_err(|e| RouterError::Forward {
                port,
                source: e.into(),
            })?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarder_config_default() {
        let config = ForwarderConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_backend_uri_preserves_path_and_query() {
        let uri: Uri = "http://example.com/tree/foo?x=1".parse().unwrap();
        assert_eq!(backend_uri(9001, &uri), "http://127.0.0.1:9001/tree/foo?x=1");

        let uri: Uri = "/api/sessions".parse().unwrap();
        assert_eq!(backend_uri(9001, &uri), "http://127.0.0.1:9001/api/sessions");
    }

    #[test]
    fn test_backend_uri_defaults_to_root() {
        let uri: Uri = "http://example.com".parse().unwrap();
        assert_eq!(backend_uri(8081, &uri), "http://127.0.0.1:8081/");
    }
}
