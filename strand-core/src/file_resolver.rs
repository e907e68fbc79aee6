//! File resolution capability and its default implementation.
//!
//! The default resolver anchors relative paths at a base directory and owns a
//! per-process cache directory that is removed again on close.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::options::FileSystemOptions;

/// Maps paths used by runtime components to files on disk.
pub trait FileResolver: Send + Sync {
    fn resolve(&self, path: &Path) -> PathBuf;

    /// Directory extracted or cached files are placed in, if caching is on.
    fn cache_dir(&self) -> Option<&Path> {
        None
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DefaultFileResolver {
    base_dir: PathBuf,
    cache_dir: Option<PathBuf>,
}

impl DefaultFileResolver {
    pub fn new(options: &FileSystemOptions) -> Self {
        let base_dir = options
            .base_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let cache_dir = options.file_caching_enabled.then(|| {
            base_dir
                .join(&options.file_cache_dir)
                .join(format!("strand-cache-{}", std::process::id()))
        });
        Self { base_dir, cache_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl FileResolver for DefaultFileResolver {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    fn close(&self) -> Result<()> {
        let Some(cache_dir) = &self.cache_dir else {
            return Ok(());
        };
        if cache_dir.exists() {
            std::fs::remove_dir_all(cache_dir)
                .with_context(|| format!("Failed to remove file cache {}", cache_dir.display()))?;
            debug!(cache_dir = %cache_dir.display(), "File cache removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_in(dir: &Path, caching: bool) -> FileSystemOptions {
        FileSystemOptions {
            file_caching_enabled: caching,
            base_dir: Some(dir.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_relative_paths_resolve_against_base() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DefaultFileResolver::new(&options_in(dir.path(), false));
        assert_eq!(resolver.resolve(Path::new("web/index.html")), dir.path().join("web/index.html"));
    }

    #[test]
    fn test_absolute_paths_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DefaultFileResolver::new(&options_in(dir.path(), false));
        let absolute = dir.path().join("abs.txt");
        assert_eq!(resolver.resolve(&absolute), absolute);
    }

    #[test]
    fn test_cache_dir_only_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DefaultFileResolver::new(&options_in(dir.path(), false)).cache_dir().is_none());

        let resolver = DefaultFileResolver::new(&options_in(dir.path(), true));
        let cache = resolver.cache_dir().unwrap();
        assert!(cache.starts_with(dir.path().join(".strand")));
    }

    #[test]
    fn test_close_removes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DefaultFileResolver::new(&options_in(dir.path(), true));
        let cache = resolver.cache_dir().unwrap().to_path_buf();
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("asset.bin"), b"cached").unwrap();

        resolver.close().unwrap();
        assert!(!cache.exists());
        // Closing twice is harmless.
        resolver.close().unwrap();
    }
}
