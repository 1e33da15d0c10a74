use crate::error::RagError;
use crate::models::{QueryOutcome, RagOptions};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Content address of a query: SHA-256 over `document_id:question:k`.
pub fn cache_key(document_id: &str, question: &str, k: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{document_id}:{question}:{k}").as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtl {
    pub success: Duration,
    pub failure: Duration,
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            success: Duration::from_secs(7_200),
            failure: Duration::from_secs(300),
        }
    }
}

impl From<&RagOptions> for CacheTtl {
    fn from(options: &RagOptions) -> Self {
        Self {
            success: Duration::from_secs(options.success_ttl_secs),
            failure: Duration::from_secs(options.failure_ttl_secs),
        }
    }
}

impl CacheTtl {
    pub fn for_outcome(&self, outcome: &QueryOutcome) -> Duration {
        if outcome.success {
            self.success
        } else {
            self.failure
        }
    }
}

/// Store of computed query outcomes. Implementations may be remote; every error is a
/// `RagError::Cache` and callers treat it as a miss.
#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<QueryOutcome>, RagError>;

    async fn put(
        &self,
        document_id: &str,
        key: &str,
        outcome: &QueryOutcome,
        ttl: Duration,
    ) -> Result<(), RagError>;

    /// Removes every entry written for `document_id`, returning how many were removed.
    async fn invalidate_document(&self, document_id: &str) -> Result<usize, RagError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_depend_on_every_component() {
        let base = cache_key("1", "What is a B-tree?", 5);
        assert_eq!(base, cache_key("1", "What is a B-tree?", 5));
        assert_ne!(base, cache_key("2", "What is a B-tree?", 5));
        assert_ne!(base, cache_key("1", "What is a B-tree", 5));
        assert_ne!(base, cache_key("1", "What is a B-tree?", 6));
        assert_eq!(base.len(), 64);
    }

    #[test]
    fn failures_expire_sooner() {
        let ttl = CacheTtl::default();
        let ok = QueryOutcome::answered("q", "a".to_string(), Vec::new());
        let failed = QueryOutcome::failed("q", &RagError::Generation("down".to_string()));

        assert_eq!(ttl.for_outcome(&ok), Duration::from_secs(7_200));
        assert_eq!(ttl.for_outcome(&failed), Duration::from_secs(300));
    }
}
