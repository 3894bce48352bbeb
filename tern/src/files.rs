// src/files.rs
use crate::cache::{FileCache, Lookup};
use crate::http::Response;
use crate::listing;
use percent_encoding::percent_decode_str;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, warn};

const INDEX_FILE: &str = "index.html";

/// Serves files below a fixed root, caching rendered file responses.
pub struct StaticFiles {
    root: PathBuf,
    cache: FileCache,
}

impl StaticFiles {
    /// `root` is resolved once here; it does not have to exist yet.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = weakly_canonical(root.as_ref());
        if !root.is_dir() {
            warn!(root = %root.display(), "static root is not a directory");
        }
        Self {
            root,
            cache: FileCache::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Answer a GET for `request_path` (percent-encoded, query already removed).
    pub fn serve(&self, request_path: &str) -> Arc<Response> {
        // Only %XX escapes; `+` is a literal plus in a path
        let decoded = percent_decode_str(request_path).decode_utf8_lossy();

        let relative = decoded.strip_prefix('/').unwrap_or(&*decoded);
        let target = weakly_canonical(&self.root.join(relative));
        if !target.starts_with(&self.root) {
            warn!(path = %decoded, "request escapes the static root");
            return Arc::new(Response::error(403));
        }

        if decoded == "/" {
            let index = self.root.join(INDEX_FILE);
            if index.is_file() {
                return self.serve_file(&index);
            }
            return Arc::new(self.render_listing(&self.root, &decoded));
        }

        match fs::metadata(&target) {
            Ok(meta) if meta.is_dir() => {
                if !request_path.ends_with('/') {
                    return Arc::new(Response::redirect(&format!("{}/", request_path)));
                }
                Arc::new(self.render_listing(&target, &decoded))
            }
            Ok(_) => self.serve_file(&target),
            Err(_) => {
                if self.cache.evict(&target) {
                    debug!(path = %target.display(), "evicted cache entry for vanished file");
                }
                debug!(path = %decoded, "not found");
                Arc::new(Response::error(404))
            }
        }
    }

    fn render_listing(&self, dir: &Path, request_path: &str) -> Response {
        match listing::render(dir, request_path) {
            Ok(html) => Response::html(html),
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "failed to list directory");
                Response::error(404)
            }
        }
    }

    fn serve_file(&self, path: &Path) -> Arc<Response> {
        let current = fs::metadata(path).and_then(|m| m.modified()).ok();
        match self.cache.lookup(path, current) {
            Lookup::Hit(response) => {
                debug!(path = %path.display(), "cache hit");
                return response;
            }
            Lookup::Evicted => {
                debug!(path = %path.display(), "file removed, cache entry evicted");
                return Arc::new(Response::error(404));
            }
            Lookup::Stale => debug!(path = %path.display(), "cache entry stale"),
            Lookup::Miss => {}
        }

        let Some(modified) = current else {
            return Arc::new(Response::error(404));
        };

        let body = match fs::read(path) {
            Ok(body) => body,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "failed to read file");
                return Arc::new(Response::error(404));
            }
        };

        let response = Arc::new(
            Response::ok(content_type(path), body)
                .with_header("Last-Modified", httpdate::fmt_http_date(modified)),
        );
        self.store(path, &response, modified);
        response
    }

    /// Cache `response` only if the file still carries the timestamp it had
    /// when it was read.
    fn store(&self, path: &Path, response: &Arc<Response>, modified: SystemTime) {
        match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(now) if now == modified => {
                self.cache
                    .store(path.to_path_buf(), Arc::clone(response), modified);
            }
            Ok(_) => debug!(path = %path.display(), "file changed while reading, not cached"),
            Err(e) => warn!(path = %path.display(), error = %e, "could not cache file"),
        }
    }
}

/// MIME type from the extension; textual types get an explicit charset.
pub fn content_type(path: &Path) -> String {
    let Some(mime) = mime_guess::from_path(path).first() else {
        return "application/octet-stream".to_string();
    };
    let textual = mime.type_() == mime_guess::mime::TEXT
        || matches!(
            mime.essence_str(),
            "application/javascript" | "application/json" | "application/xml" | "image/svg+xml"
        );
    if textual {
        format!("{}; charset=UTF-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    }
}

/// Canonicalize the longest existing prefix of `path` and append the rest,
/// resolving `.` and `..` lexically.
pub fn weakly_canonical(path: &Path) -> PathBuf {
    let components: Vec<Component<'_>> = path.components().collect();
    for split in (1..=components.len()).rev() {
        let head: PathBuf = components[..split].iter().collect();
        if let Ok(base) = head.canonicalize() {
            return append_lexically(base, &components[split..]);
        }
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    append_lexically(PathBuf::new(), &absolute.components().collect::<Vec<_>>())
}

fn append_lexically(mut base: PathBuf, rest: &[Component<'_>]) -> PathBuf {
    for component in rest {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                base.pop();
            }
            other => base.push(other.as_os_str()),
        }
    }
    base
}
