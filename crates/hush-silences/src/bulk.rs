//! Multi-silence operations with per-item outcomes.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::RequestContext;
use crate::error::{Result, SilenceError};
use crate::manager::SilenceManager;

/// Number of deletions in flight at once.
pub const BULK_CONCURRENCY: usize = 8;

/// A single failed item of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemError {
    /// The ID that failed.
    pub id: String,
    /// Why it failed.
    pub reason: String,
}

/// Outcome of a bulk delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDeleteResult {
    /// Number of silences deleted.
    pub deleted: usize,
    /// Failed IDs, in request order.
    pub errors: Vec<BulkItemError>,
}

/// Runs bulk operations against a shared [`SilenceManager`].
#[derive(Debug, Clone)]
pub struct BulkCoordinator {
    manager: Arc<SilenceManager>,
}

impl BulkCoordinator {
    /// Creates a coordinator over `manager`.
    #[must_use]
    pub const fn new(manager: Arc<SilenceManager>) -> Self {
        Self { manager }
    }

    /// Deletes every ID independently. One failure never affects the others
    /// and nothing is rolled back.
    ///
    /// Every item runs under a child of `ctx`, so cancelling `ctx` stops the
    /// items that have not finished yet; they are reported as errors.
    ///
    /// # Errors
    ///
    /// Returns `BulkLimitExceeded` before touching anything if `ids` is
    /// longer than the configured limit.
    pub async fn bulk_delete(&self, ctx: &RequestContext, ids: &[String]) -> Result<BulkDeleteResult> {
        let limit = self.manager.config().bulk_limit;
        if ids.len() > limit {
            return Err(SilenceError::BulkLimitExceeded {
                requested: ids.len(),
                limit,
            });
        }

        let started = Instant::now();
        let outcomes: Vec<(&String, Result<()>)> = futures::stream::iter(ids)
            .map(|id| async move {
                let item_ctx = ctx.child();
                (id, self.manager.delete_silence(&item_ctx, id).await)
            })
            .buffered(BULK_CONCURRENCY)
            .collect()
            .await;

        let mut result = BulkDeleteResult::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => result.deleted += 1,
                Err(e) => result.errors.push(BulkItemError {
                    id: id.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        info!(
            requested = ids.len(),
            deleted = result.deleted,
            failed = result.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "bulk delete finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::matcher::Matcher;
    use crate::store::MemoryStore;
    use crate::types::SilenceSpec;
    use chrono::{Duration, Utc};

    async fn coordinator(limit: usize) -> (BulkCoordinator, Arc<SilenceManager>) {
        let manager = SilenceManager::new(
            Arc::new(MemoryStore::new()),
            ManagerConfig::default().with_bulk_limit(limit),
        );
        manager.hydrate(&RequestContext::default()).await.unwrap();
        let manager = Arc::new(manager);
        (BulkCoordinator::new(Arc::clone(&manager)), manager)
    }

    async fn seed(manager: &SilenceManager, count: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let now = Utc::now();
            let spec = SilenceSpec::new(
                vec![Matcher::equal("instance", format!("node-{i}"))],
                now,
                now + Duration::hours(1),
                "ops@x.com",
                "rolling reboot",
            );
            ids.push(
                manager
                    .create_silence(&RequestContext::default(), spec)
                    .await
                    .unwrap()
                    .id,
            );
        }
        ids
    }

    #[tokio::test]
    async fn test_mixed_ids_report_in_order() {
        let (bulk, manager) = coordinator(100).await;
        let valid = seed(&manager, 10).await;

        let mut ids = valid.clone();
        ids.insert(3, "missing-a".to_string());
        ids.push("missing-b".to_string());

        let result = bulk.bulk_delete(&RequestContext::default(), &ids).await.unwrap();
        assert_eq!(result.deleted, 10);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[0].id, "missing-a");
        assert_eq!(result.errors[1].id, "missing-b");
        assert!(result.errors[0].reason.contains("not found"));

        for id in &valid {
            assert!(matches!(manager.get_silence(id), Err(SilenceError::NotFound { .. })));
        }
    }

    #[tokio::test]
    async fn test_over_limit_deletes_nothing() {
        let (bulk, manager) = coordinator(3).await;
        let ids = seed(&manager, 4).await;

        let err = bulk.bulk_delete(&RequestContext::default(), &ids).await.unwrap_err();
        assert!(matches!(err, SilenceError::BulkLimitExceeded { requested: 4, limit: 3 }));
        assert!(err.is_validation());
        assert_eq!(manager.len(), 4);
    }

    #[tokio::test]
    async fn test_empty_request_is_a_no_op() {
        let (bulk, _) = coordinator(3).await;
        let result = bulk.bulk_delete(&RequestContext::default(), &[]).await.unwrap();
        assert_eq!(result, BulkDeleteResult::default());
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_every_item() {
        let (bulk, manager) = coordinator(10).await;
        let ids = seed(&manager, 3).await;
        let ctx = RequestContext::default();
        ctx.cancel();

        let result = bulk.bulk_delete(&ctx, &ids).await.unwrap();
        assert_eq!(result.deleted, 0);
        assert_eq!(result.errors.len(), 3);
        assert_eq!(manager.len(), 3);
    }
}
