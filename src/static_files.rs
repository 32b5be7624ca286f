//! Static-asset collaborator
//!
//! Serves the single-page app's build output for every request the
//! forwarding engine delegates. Deliberately small: GET/HEAD, directory
//! index files, mime-typed bodies.

use anyhow::Context;
use std::path::{Path, PathBuf};

use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};

pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    /// `root` must exist; it is canonicalized once so containment checks
    /// compare resolved paths.
    pub fn new(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = std::fs::canonicalize(root.as_ref())
            .with_context(|| format!("static root {} not accessible", root.as_ref().display()))?;
        Ok(Self { root })
    }

    pub async fn serve(&self, request: &Request) -> Response {
        if !matches!(request.method, Method::GET | Method::HEAD) {
            return Response::method_not_allowed();
        }

        let path = request.path.split(['?', '#']).next().unwrap_or("");
        let requested = self.root.join(path.trim_start_matches('/'));

        // Canonicalize resolves symlinks and `..`, so escape attempts end
        // up outside the root and are refused.
        let resolved = match tokio::fs::canonicalize(&requested).await {
            Ok(p) => p,
            Err(_) => return Response::not_found(),
        };

        if !resolved.starts_with(&self.root) {
            return Response::forbidden();
        }

        let file = if resolved.is_dir() {
            resolved.join("index.html")
        } else {
            resolved
        };

        match tokio::fs::read(&file).await {
            Ok(bytes) => {
                let mime = mime_guess::from_path(&file).first_or_octet_stream();

                let mut builder = ResponseBuilder::new(StatusCode::Ok)
                    .header("Content-Type", mime.to_string());

                if request.method == Method::HEAD {
                    builder = builder.header("Content-Length", bytes.len().to_string());
                } else {
                    builder = builder.body(bytes);
                }

                builder.build()
            }
            Err(_) => Response::not_found(),
        }
    }
}
