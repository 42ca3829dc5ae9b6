use std::sync::{Mutex, PoisonError};

use indexmap::IndexMap;

/// Style-category to remote-folder-id cache, scoped to one run.
///
/// Lookup and creation run under one lock, so at most one remote folder
/// is ever created per distinct style even if the per-item loop is
/// driven from multiple threads.
#[derive(Debug, Default)]
pub struct FolderCache {
    inner: Mutex<IndexMap<String, String>>,
}

impl FolderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, style: &str) -> Option<String> {
        self.lock().get(style).cloned()
    }

    /// Returns the cached folder id for `style`, or invokes `create`
    /// exactly once, caches the result, and returns it. A failed
    /// creation caches nothing; the next caller retries.
    pub fn ensure_with<E>(
        &self,
        style: &str,
        create: impl FnOnce() -> Result<String, E>,
    ) -> Result<String, E> {
        let mut map = self.lock();
        if let Some(existing) = map.get(style) {
            return Ok(existing.clone());
        }
        let folder_id = create()?;
        map.insert(style.to_string(), folder_id.clone());
        Ok(folder_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Cached styles in creation order.
    pub fn styles(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexMap<String, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::FolderCache;

    #[test]
    fn ensure_creates_once_per_style() -> anyhow::Result<()> {
        let cache = FolderCache::new();
        let mut created = 0usize;

        let first = cache.ensure_with("watercolor", || -> Result<String, Infallible> {
            created += 1;
            Ok(format!("folder-{created}"))
        })?;
        let second = cache.ensure_with("watercolor", || -> Result<String, Infallible> {
            created += 1;
            Ok(format!("folder-{created}"))
        })?;

        assert_eq!(first, "folder-1");
        assert_eq!(second, "folder-1");
        assert_eq!(created, 1);
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[test]
    fn distinct_styles_get_distinct_folders() -> anyhow::Result<()> {
        let cache = FolderCache::new();
        cache.ensure_with("watercolor", || -> Result<String, Infallible> {
            Ok("folder-a".to_string())
        })?;
        cache.ensure_with("sketch", || -> Result<String, Infallible> {
            Ok("folder-b".to_string())
        })?;

        assert_eq!(cache.get("watercolor").as_deref(), Some("folder-a"));
        assert_eq!(cache.get("sketch").as_deref(), Some("folder-b"));
        assert_eq!(cache.styles(), vec!["watercolor", "sketch"]);
        Ok(())
    }

    #[test]
    fn failed_creation_is_not_cached() {
        let cache = FolderCache::new();
        let failed: Result<String, String> =
            cache.ensure_with("watercolor", || Err("storage refused".to_string()));
        assert_eq!(failed, Err("storage refused".to_string()));
        assert!(cache.is_empty());

        let recovered: Result<String, String> =
            cache.ensure_with("watercolor", || Ok("folder-a".to_string()));
        assert_eq!(recovered, Ok("folder-a".to_string()));
        assert_eq!(cache.len(), 1);
    }
}
