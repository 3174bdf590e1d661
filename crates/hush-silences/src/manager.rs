//! The silence lifecycle manager.
//!
//! This module provides the [`SilenceManager`], the single owner of the
//! in-memory silence index. Writes go to the durable store first and are
//! committed to the index only after the store accepted them; reads and
//! alert matching are served from the index alone.
//!
//! Locking rules:
//! - The index lock is held only while copying out of or committing into
//!   the index, never across store I/O.
//! - Writes and resynchronisation are separated by a gate so a resync never
//!   overwrites a write that committed while the snapshot was loading.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ManagerConfig;
use crate::context::RequestContext;
use crate::error::{Result, SilenceError};
use crate::events::{EventSink, NullSink, SilenceEvent, SilenceEventKind};
use crate::matcher::{matches_all, CompiledMatcher, LabelSet};
use crate::store::SilenceStore;
use crate::types::{
    paginate, Page, PageRequest, Silence, SilenceFilter, SilencePatch, SilenceSpec, SilenceStats,
    SilenceStatus,
};

/// A silence in the index together with its compiled matchers.
#[derive(Debug)]
pub(crate) struct IndexEntry {
    pub(crate) silence: Silence,
    pub(crate) matchers: Vec<CompiledMatcher>,
    /// Status last written to the store.
    hint: AtomicU8,
    /// Set once the `silence_expired` event has been published.
    expiry_announced: AtomicBool,
}

impl IndexEntry {
    fn new(silence: Silence, matchers: Vec<CompiledMatcher>, expiry_announced: bool) -> Self {
        let hint = silence.status;
        Self {
            silence,
            matchers,
            hint: AtomicU8::new(hint.to_u8()),
            expiry_announced: AtomicBool::new(expiry_announced),
        }
    }

    pub(crate) fn hint(&self) -> SilenceStatus {
        SilenceStatus::from_u8(self.hint.load(Ordering::Acquire))
    }

    pub(crate) fn set_hint(&self, status: SilenceStatus) {
        self.hint.store(status.to_u8(), Ordering::Release);
    }

    /// Returns true exactly once, for the caller that claims the expiry.
    pub(crate) fn claim_expiry(&self) -> bool {
        self.expiry_announced
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The outcome of an alert lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilenceMatch {
    /// True if at least one active silence matches.
    pub silenced: bool,
    /// IDs of every matching active silence, sorted.
    pub silence_ids: Vec<String>,
}

/// Owns the silence index and coordinates it with the durable store.
///
/// Construct one per process and share it through `Arc`.
#[derive(Debug)]
pub struct SilenceManager {
    config: ManagerConfig,
    store: Arc<dyn SilenceStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    index: RwLock<HashMap<String, Arc<IndexEntry>>>,
    write_gate: tokio::sync::RwLock<()>,
    hydrated: AtomicBool,
    store_healthy: AtomicBool,
    needs_resync: AtomicBool,
}

impl SilenceManager {
    /// Creates a manager over `store` using the system clock and no event
    /// sink. Call [`Self::hydrate`] before serving reads.
    #[must_use]
    pub fn new(store: Arc<dyn SilenceStore>, config: ManagerConfig) -> Self {
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            events: Arc::new(NullSink),
            index: RwLock::new(HashMap::new()),
            write_gate: tokio::sync::RwLock::new(()),
            hydrated: AtomicBool::new(false),
            store_healthy: AtomicBool::new(true),
            needs_resync: AtomicBool::new(false),
        }
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Returns a request context using the configured store deadline.
    #[must_use]
    pub fn context(&self) -> RequestContext {
        RequestContext::new(self.config.store_timeout)
    }

    /// Returns the current time according to the manager's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// True once the index has been loaded from the store.
    #[must_use]
    pub fn is_hydrated(&self) -> bool {
        self.hydrated.load(Ordering::Acquire)
    }

    /// False while the most recent store interaction failed.
    #[must_use]
    pub fn is_store_healthy(&self) -> bool {
        self.store_healthy.load(Ordering::Acquire)
    }

    /// True when a write's outcome is unknown and the index must be reloaded.
    #[must_use]
    pub fn needs_resync(&self) -> bool {
        self.needs_resync.load(Ordering::Acquire)
    }

    /// Number of silences in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Returns true if the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    // ============ Store access ============

    /// Runs a store future under `ctx`, tracking store health and timing.
    pub(crate) async fn store_call<T>(
        &self,
        ctx: &RequestContext,
        op: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        ctx.check()?;
        let started = Instant::now();
        let result = ctx.run(fut).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => {
                if !self.store_healthy.swap(true, Ordering::AcqRel) {
                    info!(op, "silence store recovered");
                }
                debug!(op, elapsed_ms, "store call completed");
            }
            Err(e) if e.is_store_failure() || matches!(e, SilenceError::Cancelled) => {
                if e.is_store_failure() {
                    self.store_healthy.store(false, Ordering::Release);
                }
                if matches!(e, SilenceError::Timeout { .. } | SilenceError::Cancelled) {
                    // The store may or may not have applied the write.
                    self.needs_resync.store(true, Ordering::Release);
                }
                warn!(op, elapsed_ms, error = %e, "store call failed");
            }
            Err(e) => debug!(op, elapsed_ms, error = %e, "store call rejected"),
        }
        result
    }

    pub(crate) fn store(&self) -> &dyn SilenceStore {
        self.store.as_ref()
    }

    pub(crate) fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    /// Copies out every index entry under a short read lock.
    pub(crate) fn entries(&self) -> Vec<Arc<IndexEntry>> {
        self.index.read().values().cloned().collect()
    }

    fn ensure_hydrated(&self) -> Result<()> {
        if self.is_hydrated() {
            Ok(())
        } else {
            Err(SilenceError::unavailable("silence index has not been loaded yet"))
        }
    }

    /// Commits `silence` unless the index already holds the same or a newer
    /// version. Without `insert`, a silence missing from the index (deleted
    /// while the write was in flight) is not brought back. Returns false if
    /// the commit was skipped.
    fn commit(&self, silence: Silence, matchers: Vec<CompiledMatcher>, insert: bool) -> bool {
        let mut index = self.index.write();
        let announced = match index.get(&silence.id) {
            Some(existing) if existing.silence.version >= silence.version => return false,
            Some(existing) => existing.expiry_announced.load(Ordering::Acquire),
            None if insert => false,
            None => return false,
        };
        index.insert(
            silence.id.clone(),
            Arc::new(IndexEntry::new(silence, matchers, announced)),
        );
        true
    }

    fn publish(&self, kind: SilenceEventKind, silence: &Silence) {
        let event = SilenceEvent::new(kind, silence, self.clock.now());
        self.events.publish(event);
    }

    // ============ Lifecycle ============

    /// Loads every stored silence into the index, replacing its contents.
    ///
    /// Stored records that no longer validate are skipped with a warning.
    /// Returns the number of silences loaded.
    ///
    /// # Errors
    ///
    /// Returns a store failure; the previous index is kept in that case.
    pub async fn hydrate(&self, ctx: &RequestContext) -> Result<usize> {
        let _gate = self.write_gate.write().await;
        let records = self.store_call(ctx, "load_all", self.store.load_all()).await?;

        let previous = self.index.read().clone();
        let mut entries = HashMap::with_capacity(records.len());
        let mut skipped = 0usize;
        for silence in records {
            match silence.compile() {
                Ok(matchers) => {
                    let announced = silence.status == SilenceStatus::Expired
                        || previous
                            .get(&silence.id)
                            .is_some_and(|e| e.expiry_announced.load(Ordering::Acquire));
                    entries.insert(
                        silence.id.clone(),
                        Arc::new(IndexEntry::new(silence, matchers, announced)),
                    );
                }
                Err(e) => {
                    skipped += 1;
                    warn!(silence_id = %silence.id, error = %e, "skipping invalid stored silence");
                }
            }
        }

        let count = entries.len();
        *self.index.write() = entries;
        self.hydrated.store(true, Ordering::Release);
        self.needs_resync.store(false, Ordering::Release);

        info!(count, skipped, "hydrated silence index");
        Ok(count)
    }

    /// Validates and persists a new silence.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a bad spec, or a store failure. The index
    /// is untouched on error.
    pub async fn create_silence(&self, ctx: &RequestContext, spec: SilenceSpec) -> Result<Silence> {
        let now = self.clock.now();
        let (silence, matchers) = spec.into_silence(now)?;

        let _gate = self.write_gate.read().await;
        let stored = self.store_call(ctx, "create", self.store.create(silence)).await?;
        self.commit(stored.clone(), matchers, true);

        info!(
            silence_id = %stored.id,
            created_by = %stored.created_by,
            matchers = stored.matchers.len(),
            status = %stored.status,
            "created silence"
        );
        self.publish(SilenceEventKind::Created, &stored);
        Ok(stored.with_status_at(now))
    }

    /// Applies `patch` to the silence `id` if its version is still
    /// `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Validation` (expired silence, immutable field,
    /// invalid result), `ConcurrentModification`, or a store failure.
    pub async fn update_silence(
        &self,
        ctx: &RequestContext,
        id: &str,
        patch: &SilencePatch,
        expected_version: u64,
    ) -> Result<Silence> {
        self.ensure_hydrated()?;
        let now = self.clock.now();
        let current = self
            .index
            .read()
            .get(id)
            .map(|e| e.silence.clone())
            .ok_or_else(|| SilenceError::not_found(id))?;

        if current.version != expected_version {
            return Err(SilenceError::ConcurrentModification {
                id: id.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let (next, matchers) = patch.apply(&current, now)?;

        let _gate = self.write_gate.read().await;
        let stored = self
            .store_call(ctx, "update", self.store.update(next, expected_version))
            .await?;
        if !self.commit(stored.clone(), matchers, false)
            && !self.index.read().contains_key(&stored.id)
        {
            // A concurrent delete removed the silence after the store took
            // this update; the delete is the later write.
            debug!(silence_id = %stored.id, version = stored.version, "update superseded by delete");
            return Ok(stored.with_status_at(now));
        }

        info!(
            silence_id = %stored.id,
            version = stored.version,
            status = %stored.status,
            "updated silence"
        );
        self.publish(SilenceEventKind::Updated, &stored);
        Ok(stored.with_status_at(now))
    }

    /// Deletes the silence `id`, whatever its status.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such silence exists, or a store failure.
    pub async fn delete_silence(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let _gate = self.write_gate.read().await;
        let removed = match self.store_call(ctx, "delete", self.store.delete(id)).await {
            Ok(removed) => removed,
            Err(e @ SilenceError::NotFound { .. }) => {
                // The index may still hold a record the store already lost.
                if self.index.write().remove(id).is_some() {
                    warn!(silence_id = %id, "dropped index entry missing from store");
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.index.write().remove(id);

        info!(silence_id = %id, created_by = %removed.created_by, "deleted silence");
        self.publish(SilenceEventKind::Deleted, &removed);
        Ok(())
    }

    // ============ Reads ============

    /// Returns the silence `id` with its status computed at the current time.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `StoreUnavailable` before the first hydration.
    pub fn get_silence(&self, id: &str) -> Result<Silence> {
        self.ensure_hydrated()?;
        let now = self.clock.now();
        self.index
            .read()
            .get(id)
            .map(|e| e.silence.clone().with_status_at(now))
            .ok_or_else(|| SilenceError::not_found(id))
    }

    /// Lists silences newest-created-first, filtering on the status computed
    /// at the current time. `stale` is set while the store is unhealthy.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` before the first hydration.
    pub fn list_silences(&self, filter: &SilenceFilter, page: PageRequest) -> Result<Page<Silence>> {
        self.ensure_hydrated()?;
        let now = self.clock.now();
        let matching: Vec<Silence> = {
            let index = self.index.read();
            index
                .values()
                .filter_map(|e| {
                    let status = e.silence.status_at(now);
                    filter
                        .matches(&e.silence, status)
                        .then(|| e.silence.clone().with_status_at(now))
                })
                .collect()
        };

        let mut page = paginate(matching, page);
        page.stale = !self.is_store_healthy();
        debug!(total = page.total, returned = page.items.len(), stale = page.stale, "listed silences");
        Ok(page)
    }

    /// Finds every active silence whose matchers all match `labels`.
    pub fn is_alert_silenced(&self, labels: &LabelSet) -> SilenceMatch {
        let now = self.clock.now();
        let mut candidates = 0usize;
        let mut silence_ids: Vec<String> = {
            let index = self.index.read();
            index
                .values()
                .filter(|e| e.silence.status_at(now) == SilenceStatus::Active)
                .inspect(|_| candidates += 1)
                .filter(|e| matches_all(&e.matchers, labels))
                .map(|e| e.silence.id.clone())
                .collect()
        };
        silence_ids.sort_unstable();

        debug!(candidates, matched = silence_ids.len(), "evaluated alert against silences");
        SilenceMatch {
            silenced: !silence_ids.is_empty(),
            silence_ids,
        }
    }

    /// Aggregates counters over the index at the current time.
    pub fn stats(&self) -> SilenceStats {
        let now = self.clock.now();
        let index = self.index.read();
        let mut stats = SilenceStats {
            total: index.len(),
            ..SilenceStats::default()
        };

        for entry in index.values() {
            let silence = &entry.silence;
            let status = silence.status_at(now);
            *stats.by_status.entry(status).or_default() += 1;
            *stats.by_creator.entry(silence.created_by.clone()).or_default() += 1;
            stats.total_matchers += silence.matchers.len();
            if status == SilenceStatus::Active
                && stats.next_expiry.is_none_or(|t| silence.ends_at < t)
            {
                stats.next_expiry = Some(silence.ends_at);
            }
        }
        stats
    }
}
