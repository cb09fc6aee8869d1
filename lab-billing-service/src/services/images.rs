//! Image references are owned by the upload service; the ledger only asks
//! for their removal once the rows pointing at them are gone.

use async_trait::async_trait;
use service_core::error::AppError;
use tracing::{debug, warn};

use crate::services::metrics::IMAGE_CLEANUP_FAILURES_TOTAL;

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn remove(&self, url: &str) -> Result<(), AppError>;
}

/// Store used when no upload service is wired in.
#[derive(Debug, Clone, Default)]
pub struct NoopImageStore;

#[async_trait]
impl ImageStore for NoopImageStore {
    async fn remove(&self, url: &str) -> Result<(), AppError> {
        debug!(url = %url, "Image cleanup skipped, no image store configured");
        Ok(())
    }
}

/// Best effort: failures are logged and counted, never returned. Call only
/// after the owning transaction has committed.
pub async fn cleanup_images(store: &dyn ImageStore, urls: &[String]) {
    for url in urls {
        if let Err(e) = store.remove(url).await {
            IMAGE_CLEANUP_FAILURES_TOTAL.inc();
            warn!(url = %url, error = %e, "Failed to remove image");
        }
    }
}

/// URLs present in `before` but not in `after`.
pub fn dropped_urls(before: &[String], after: &[String]) -> Vec<String> {
    before
        .iter()
        .filter(|u| !after.contains(u))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_urls_keeps_only_removed_entries() {
        let before = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let after = vec!["b".to_string(), "d".to_string()];
        assert_eq!(dropped_urls(&before, &after), vec!["a", "c"]);
    }
}
