//! Local static content
//!
//! Serves `/static` and `/custom` assets (available even pre-EULA so the
//! EULA page can load its resources) and the locally-served flavor of
//! `/_nocachecontent/`.

use crate::error::{empty_response, RouterBody};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::{Path, PathBuf};
use tracing::debug;

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

pub struct ContentHandler {
    root: PathBuf,
}

impl ContentHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a request path to a file under the content root. `/static` assets
    /// live at the root, `/custom` keeps its own subdirectory, and
    /// `/_nocachecontent` shares the root. Traversal segments are rejected.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let rel = if let Some(rest) = path.strip_prefix("/static/") {
            rest.to_string()
        } else if let Some(rest) = path.strip_prefix("/custom/") {
            format!("custom/{rest}")
        } else if let Some(rest) = path.strip_prefix("/_nocachecontent/") {
            rest.to_string()
        } else {
            return None;
        };

        if rel.is_empty() || rel.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return None;
        }
        Some(self.root.join(rel))
    }

    /// Serve a content file. Anything unmapped or missing is a 404 with an
    /// empty body; `no_cache` stamps the response uncacheable.
    pub async fn serve(&self, path: &str, no_cache: bool) -> Response<RouterBody> {
        let file = match self.resolve(path) {
            Some(file) => file,
            None => return empty_response(StatusCode::NOT_FOUND),
        };

        let content = match tokio::fs::read(&file).await {
            Ok(content) => content,
            Err(e) => {
                debug!(path, file = %file.display(), error = %e, "Content file not served");
                return empty_response(StatusCode::NOT_FOUND);
            }
        };

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, content_type(&file));
        if no_cache {
            builder = builder.header(hyper::header::CACHE_CONTROL, "no-cache, no-store");
        }
        builder
            .body(
                Full::new(Bytes::from(content))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .expect("valid response with StatusCode enum and static headers")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_with_files() -> (tempfile::TempDir, ContentHandler) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.css"), "body {}").unwrap();
        std::fs::create_dir_all(dir.path().join("custom")).unwrap();
        std::fs::write(dir.path().join("custom/theme.js"), "// theme").unwrap();
        std::fs::write(dir.path().join("page.html"), "<html></html>").unwrap();
        let handler = ContentHandler::new(dir.path());
        (dir, handler)
    }

    #[tokio::test]
    async fn test_serves_static_asset() {
        let (_dir, handler) = handler_with_files();
        let resp = handler.serve("/static/app.css", false).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/css"
        );
        assert!(resp.headers().get(hyper::header::CACHE_CONTROL).is_none());
    }

    #[tokio::test]
    async fn test_serves_custom_subdirectory() {
        let (_dir, handler) = handler_with_files();
        let resp = handler.serve("/custom/theme.js", false).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_nocache_headers() {
        let (_dir, handler) = handler_with_files();
        let resp = handler.serve("/_nocachecontent/page.html", true).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(hyper::header::CACHE_CONTROL).unwrap(),
            "no-cache, no-store"
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_404() {
        let (_dir, handler) = handler_with_files();
        let resp = handler.serve("/static/missing.css", false).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (_dir, handler) = handler_with_files();
        let resp = handler.serve("/static/../secrets.txt", false).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
