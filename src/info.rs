//! `/_info` diagnostics

use crate::error::{json_response, RouterBody};
use crate::lifecycle::{BackendStatus, LifecycleCoordinator};
use chrono::{DateTime, Utc};
use hyper::Response;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Serialize)]
struct InfoPayload {
    name: &'static str,
    version: &'static str,
    started_at: DateTime<Utc>,
    uptime_secs: u64,
    backends: Vec<BackendStatus>,
}

/// Formats the diagnostic payload for `/_info`
pub struct InfoHandler {
    coordinator: Arc<LifecycleCoordinator>,
    started_at: DateTime<Utc>,
    started_instant: Instant,
}

impl InfoHandler {
    pub fn new(coordinator: Arc<LifecycleCoordinator>) -> Self {
        Self {
            coordinator,
            started_at: Utc::now(),
            started_instant: Instant::now(),
        }
    }

    pub fn handle(&self) -> Response<RouterBody> {
        let payload = InfoPayload {
            name: PKG_NAME,
            version: VERSION,
            started_at: self.started_at,
            uptime_secs: self.started_instant.elapsed().as_secs(),
            backends: self.coordinator.snapshot(),
        };
        let body = serde_json::to_string_pretty(&payload)
            .unwrap_or_else(|_| "{}".to_string());
        json_response(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::BackendSpawner;
    use futures::future::BoxFuture;

    struct NullSpawner;

    impl BackendSpawner for NullSpawner {
        fn start(&self, _user: &str) -> BoxFuture<'static, anyhow::Result<u16>> {
            Box::pin(async { Ok(9001) })
        }
    }

    #[tokio::test]
    async fn test_info_payload_shape() {
        let coordinator = LifecycleCoordinator::new(Arc::new(NullSpawner));
        coordinator.wait_ready("alice").await.unwrap();

        let handler = InfoHandler::new(Arc::clone(&coordinator));
        let resp = handler.handle();
        assert_eq!(resp.status(), hyper::StatusCode::OK);
        assert_eq!(
            resp.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
