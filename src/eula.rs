//! Filesystem-backed EULA gate
//!
//! A marker directory records one-time acceptance. While it is absent, most
//! of the router is short-circuited and the static EULA page is served
//! instead; acceptance creates the marker and bounces back to the referer.

use crate::error::{html_response, redirect_response, RouterBody, RouterError};
use hyper::Response;
use std::path::PathBuf;
use tracing::info;

pub struct EulaGate {
    marker_dir: PathBuf,
    page_path: PathBuf,
}

impl EulaGate {
    pub fn new(marker_dir: impl Into<PathBuf>, page_path: impl Into<PathBuf>) -> Self {
        Self {
            marker_dir: marker_dir.into(),
            page_path: page_path.into(),
        }
    }

    /// Whether the acceptance marker exists
    pub fn has_accepted(&self) -> bool {
        self.marker_dir.exists()
    }

    /// Record acceptance and redirect back to the decoded referer from the
    /// raw query string. The marker is created even when no referer was
    /// supplied; the missing referer is the caller's 500.
    pub async fn accept(&self, raw_query: &str) -> Result<Response<RouterBody>, RouterError> {
        if !self.has_accepted() {
            tokio::fs::create_dir_all(&self.marker_dir).await?;
        }

        let referer = match raw_query.find("referer=") {
            Some(i) => {
                let raw = &raw_query[i + "referer=".len()..];
                urlencoding::decode(raw)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| raw.to_string())
            }
            None => {
                info!("Accepting EULA, but no referer; returning 500");
                return Err(RouterError::MissingReferer);
            }
        };

        info!(referer = %referer, "Accepting EULA");
        Ok(redirect_response(&referer))
    }

    /// Stream the EULA page verbatim. A missing asset is a local I/O error
    /// surfaced as a 500 by the fault boundary.
    pub async fn serve_page(&self) -> Result<Response<RouterBody>, RouterError> {
        let content = tokio::fs::read(&self.page_path)
            .await
            .map_err(RouterError::EulaAssetMissing)?;
        Ok(html_response(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    fn gate(dir: &tempfile::TempDir) -> EulaGate {
        EulaGate::new(
            dir.path().join("eula"),
            dir.path().join("static/eula.html"),
        )
    }

    #[tokio::test]
    async fn test_accept_creates_marker_and_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir);
        assert!(!gate.has_accepted());

        let resp = gate.accept("referer=%2Ftree%2Ffoo").await.unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(hyper::header::LOCATION).unwrap(),
            "/tree/foo"
        );
        assert!(gate.has_accepted());
    }

    #[tokio::test]
    async fn test_accept_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir);

        gate.accept("referer=/a").await.unwrap();
        let resp = gate.accept("referer=/b").await.unwrap();
        assert_eq!(resp.headers().get(hyper::header::LOCATION).unwrap(), "/b");
        assert!(gate.has_accepted());
    }

    #[tokio::test]
    async fn test_accept_without_referer_errors_but_marks() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir);

        let err = gate.accept("").await.unwrap_err();
        assert!(matches!(err, RouterError::MissingReferer));
        // Marker is present despite the 500.
        assert!(gate.has_accepted());
    }

    #[tokio::test]
    async fn test_serve_page_streams_asset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("static")).unwrap();
        std::fs::write(dir.path().join("static/eula.html"), "<html>eula</html>").unwrap();

        let gate = gate(&dir);
        let resp = gate.serve_page().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serve_page_missing_asset_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir);
        let err = gate.serve_page().await.unwrap_err();
        assert!(matches!(err, RouterError::EulaAssetMissing(_)));
    }
}
