//! Request path to file resolution, confined to a document root.

use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Index files tried, in order, when a directory is requested.
pub const INDEX_FILES: [&str; 4] = ["index.html", "index.htm", "index.xhtml", "index.txt"];

#[derive(Debug, Clone)]
pub struct DocRoot {
    root: PathBuf,
}

impl DocRoot {
    /// The root is canonicalized once so that every resolved path can be
    /// checked against it with a plain prefix test.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let root = path.as_ref().canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("document root {} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Map a request URI onto a readable file under the root.
    ///
    /// The query string is ignored and the path percent-decoded. Anything
    /// that does not exist, escapes the root after canonicalization, or is a
    /// directory without an index file resolves to `None`.
    pub fn resolve(&self, uri: &str) -> Option<PathBuf> {
        let raw = uri.split(['?', '#']).next().unwrap_or_default();
        if !raw.starts_with('/') {
            return None;
        }
        let decoded = urlencoding::decode(raw).ok()?;
        let relative = decoded.trim_start_matches('/');

        let canonical = self.confine(&self.root.join(relative))?;
        if canonical.is_dir() {
            return INDEX_FILES.iter().find_map(|name| {
                let index = self.confine(&canonical.join(name))?;
                index.is_file().then_some(index)
            });
        }
        canonical.is_file().then_some(canonical)
    }

    fn confine(&self, candidate: &Path) -> Option<PathBuf> {
        let canonical = candidate.canonicalize().ok()?;
        if canonical.starts_with(&self.root) {
            Some(canonical)
        } else {
            warn!(path = %candidate.display(), "request escapes document root");
            None
        }
    }
}
