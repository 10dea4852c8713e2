//! Directory-backed loader and storage
//!
//! Identifiers are mapped to files below `base_dir` after lexical
//! normalization. Paths outside `path_prefix` or matching a blacklist entry
//! are not handled here and yield `Pass`.

use crate::config::FileStoreConfig;
use crate::context::RequestContext;
use crate::error::{PartialError, RelayError, Result};
use crate::loader::{Loader, Storage};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Hidden files and parent directory references
const DOT_FILE: &str = "/.";

#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
    path_prefix: String,
    blacklist: Vec<String>,
}

impl FileStore {
    /// Create a store rooted at `base_dir` serving every path except dot files
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FileStore {
            base_dir: base_dir.into(),
            path_prefix: "/".to_string(),
            blacklist: vec![DOT_FILE.to_string()],
        }
    }

    pub fn from_config(config: &FileStoreConfig) -> Self {
        Self::new(&config.base_dir).with_path_prefix(&config.path_prefix)
    }

    pub fn with_path_prefix(mut self, prefix: &str) -> Self {
        self.path_prefix = prefix.to_string();
        self
    }

    /// Reject normalized paths containing `pattern`
    pub fn with_blacklist(mut self, pattern: &str) -> Self {
        self.blacklist.push(pattern.to_string());
        self
    }

    /// Resolve `image` to a file path, or `None` if this store does not
    /// handle it
    pub fn path(&self, image: &str) -> Option<PathBuf> {
        let escaped = image.replace(":/", "%3A");
        let cleaned = clean_path(&escaped);
        let normalized = format!("/{}", cleaned.strip_prefix('/').unwrap_or(&cleaned));

        if self.blacklist.iter().any(|b| normalized.contains(b.as_str())) {
            return None;
        }
        let rest = normalized.strip_prefix(&self.path_prefix)?;
        Some(self.base_dir.join(rest.trim_start_matches('/')))
    }
}

/// Lexically clean a slash separated path: collapse repeated separators,
/// drop `.` segments and resolve `..` against earlier segments
fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(last) if *last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            s => parts.push(s),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

#[async_trait]
impl Loader for FileStore {
    async fn load(&self, ctx: &RequestContext, image: &str) -> std::result::Result<Bytes, PartialError> {
        let path = self.path(image).ok_or(RelayError::Pass)?;
        debug!(image = %image, path = %path.display(), "reading file");
        let buf = ctx.run(fs::read(&path)).await??;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl Storage for FileStore {
    async fn save(&self, _ctx: &RequestContext, image: &str, buf: &Bytes) -> Result<()> {
        // Never create the base directory itself.
        fs::metadata(&self.base_dir).await.map_err(|e| {
            RelayError::IoError(format!(
                "base dir {} unavailable: {}",
                self.base_dir.display(),
                e
            ))
        })?;
        let path = self.path(image).ok_or(RelayError::Pass)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, buf).await?;
        debug!(image = %image, path = %path.display(), size = buf.len(), "wrote file");
        Ok(())
    }
}
