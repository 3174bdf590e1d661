//! Core types for the silence engine.
//!
//! This module provides the fundamental types used throughout the crate:
//! - [`SilenceStatus`]: The time-derived lifecycle state of a silence
//! - [`SilenceSpec`]: A user-submitted silence, before validation
//! - [`Silence`]: A persisted silence record
//! - [`SilencePatch`]: The editable subset of a silence
//! - [`SilenceFilter`], [`PageRequest`], [`Page`]: Listing
//! - [`SilenceStats`]: Aggregate counters

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SilenceError};
use crate::matcher::{compile_all, CompiledMatcher, Matcher};

static EMAIL_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+$").unwrap_or_else(|_| unreachable!()));

/// The lifecycle state of a silence.
///
/// Status is never set directly; it is computed from the current time and
/// the silence's `starts_at`/`ends_at` bounds and only ever moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SilenceStatus {
    /// The silence starts in the future.
    Pending,
    /// The silence currently suppresses matching alerts.
    Active,
    /// The silence has ended.
    Expired,
}

impl SilenceStatus {
    /// Computes the status at `now` for the given bounds.
    #[must_use]
    pub fn at(now: DateTime<Utc>, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        if now >= ends_at {
            Self::Expired
        } else if now >= starts_at {
            Self::Active
        } else {
            Self::Pending
        }
    }

    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }

    pub(crate) const fn to_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Active => 1,
            Self::Expired => 2,
        }
    }

    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Active,
            _ => Self::Expired,
        }
    }
}

impl fmt::Display for SilenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SilenceStatus {
    type Err = SilenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            other => Err(SilenceError::validation(format!("unknown status '{other}'"))),
        }
    }
}

/// A silence as submitted for creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilenceSpec {
    /// Label matchers; an alert is silenced when all of them match.
    pub matchers: Vec<Matcher>,
    /// When the silence starts.
    pub starts_at: DateTime<Utc>,
    /// When the silence ends.
    pub ends_at: DateTime<Utc>,
    /// Who created the silence.
    pub created_by: String,
    /// Why the silence exists.
    pub comment: String,
}

impl SilenceSpec {
    /// Creates a new spec. Nothing is validated until [`Self::into_silence`].
    pub fn new(
        matchers: Vec<Matcher>,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        created_by: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            matchers,
            starts_at,
            ends_at,
            created_by: created_by.into(),
            comment: comment.into(),
        }
    }

    /// Validates the submission and turns it into a new silence record with a
    /// fresh ID and version 1, together with its compiled matchers.
    ///
    /// # Errors
    ///
    /// Returns `SilenceError::Validation` if any invariant is violated or
    /// the silence would already be expired at `now`.
    pub fn into_silence(self, now: DateTime<Utc>) -> Result<(Silence, Vec<CompiledMatcher>)> {
        validate_creator(&self.created_by)?;
        let compiled = validate_fields(&self.matchers, self.starts_at, self.ends_at, &self.comment)?;
        if self.ends_at <= now {
            return Err(SilenceError::validation("ends_at must be in the future"));
        }

        let silence = Silence {
            id: Uuid::new_v4().to_string(),
            matchers: self.matchers,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            created_by: self.created_by,
            comment: self.comment,
            created_at: now,
            updated_at: now,
            version: 1,
            status: SilenceStatus::at(now, self.starts_at, self.ends_at),
        };
        Ok((silence, compiled))
    }
}

/// A persisted silence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Silence {
    /// Server-assigned unique identifier.
    pub id: String,
    /// Label matchers; an alert is silenced when all of them match.
    pub matchers: Vec<Matcher>,
    /// When the silence starts. Immutable.
    pub starts_at: DateTime<Utc>,
    /// When the silence ends.
    pub ends_at: DateTime<Utc>,
    /// Who created the silence. Immutable.
    pub created_by: String,
    /// Why the silence exists.
    pub comment: String,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last changed.
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency version, bumped on every update.
    pub version: u64,
    /// Lifecycle status.
    ///
    /// On values returned by the manager this is recomputed from the clock.
    /// Inside the durable store it is only a hint refreshed by the sweeper.
    pub status: SilenceStatus,
}

impl Silence {
    /// Computes the status of this silence at `now`.
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> SilenceStatus {
        SilenceStatus::at(now, self.starts_at, self.ends_at)
    }

    /// Returns a copy whose `status` reflects `now`.
    #[must_use]
    pub fn with_status_at(mut self, now: DateTime<Utc>) -> Self {
        self.status = self.status_at(now);
        self
    }

    /// Re-validates a stored record and compiles its matchers.
    ///
    /// # Errors
    ///
    /// Returns `SilenceError::Validation` if the record violates an invariant.
    pub fn compile(&self) -> Result<Vec<CompiledMatcher>> {
        validate_creator(&self.created_by)?;
        validate_fields(&self.matchers, self.starts_at, self.ends_at, &self.comment)
    }
}

/// An update to an existing silence.
///
/// Only `comment`, `matchers` and `ends_at` are editable. `created_by` and
/// `starts_at` may be present, but any value different from the stored one
/// is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilencePatch {
    /// New comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// New matcher list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matchers: Option<Vec<Matcher>>,
    /// New end time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    /// Immutable; must equal the stored value if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Immutable; must equal the stored value if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
}

impl SilencePatch {
    /// Creates an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the comment.
    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Replaces the matchers.
    #[must_use]
    pub fn matchers(mut self, matchers: Vec<Matcher>) -> Self {
        self.matchers = Some(matchers);
        self
    }

    /// Sets the end time.
    #[must_use]
    pub const fn ends_at(mut self, ends_at: DateTime<Utc>) -> Self {
        self.ends_at = Some(ends_at);
        self
    }

    /// Sets `created_by` (only accepted when unchanged).
    #[must_use]
    pub fn created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    /// Sets `starts_at` (only accepted when unchanged).
    #[must_use]
    pub const fn starts_at(mut self, starts_at: DateTime<Utc>) -> Self {
        self.starts_at = Some(starts_at);
        self
    }

    /// Applies the patch to `current`, producing the next record (with the
    /// version bumped) and its compiled matchers.
    ///
    /// # Errors
    ///
    /// Returns `SilenceError::Validation` if the silence is expired at `now`,
    /// an immutable field would change, or the result violates an invariant.
    pub fn apply(
        &self,
        current: &Silence,
        now: DateTime<Utc>,
    ) -> Result<(Silence, Vec<CompiledMatcher>)> {
        if current.status_at(now) == SilenceStatus::Expired {
            return Err(SilenceError::validation(format!(
                "silence {} has expired and can no longer be updated",
                current.id
            )));
        }
        if self
            .created_by
            .as_ref()
            .is_some_and(|c| *c != current.created_by)
        {
            return Err(SilenceError::validation("immutable field: created_by"));
        }
        if self.starts_at.is_some_and(|s| s != current.starts_at) {
            return Err(SilenceError::validation("immutable field: starts_at"));
        }

        let mut next = current.clone();
        if let Some(comment) = &self.comment {
            next.comment.clone_from(comment);
        }
        if let Some(matchers) = &self.matchers {
            next.matchers.clone_from(matchers);
        }
        if let Some(ends_at) = self.ends_at {
            next.ends_at = ends_at;
        }
        next.updated_at = now;
        next.version = current.version + 1;
        next.status = next.status_at(now);

        let compiled = validate_fields(&next.matchers, next.starts_at, next.ends_at, &next.comment)?;
        Ok((next, compiled))
    }
}

fn validate_creator(created_by: &str) -> Result<()> {
    let len = created_by.chars().count();
    if len == 0 || len > 255 {
        return Err(SilenceError::validation(
            "created_by must be 1..=255 characters",
        ));
    }
    if !EMAIL_SHAPE.is_match(created_by) {
        return Err(SilenceError::validation(
            "created_by must be an email address",
        ));
    }
    Ok(())
}

/// Maximum number of matchers on a single silence.
pub const MAX_MATCHERS: usize = 100;
/// Minimum comment length, in characters.
pub const MIN_COMMENT_LENGTH: usize = 3;
/// Maximum comment length, in characters.
pub const MAX_COMMENT_LENGTH: usize = 1024;

fn validate_fields(
    matchers: &[Matcher],
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    comment: &str,
) -> Result<Vec<CompiledMatcher>> {
    if matchers.is_empty() || matchers.len() > MAX_MATCHERS {
        return Err(SilenceError::validation(format!(
            "a silence needs 1..={MAX_MATCHERS} matchers, got {}",
            matchers.len()
        )));
    }

    let compiled = compile_all(matchers)?;

    // A silence whose every matcher accepts an empty label set would
    // suppress every alert in the system.
    if compiled.iter().all(|m| m.matches_value("")) {
        return Err(SilenceError::validation(
            "at least one matcher must not match the empty string",
        ));
    }

    if ends_at <= starts_at {
        return Err(SilenceError::validation("ends_at must be after starts_at"));
    }

    let comment_len = comment.chars().count();
    if !(MIN_COMMENT_LENGTH..=MAX_COMMENT_LENGTH).contains(&comment_len) {
        return Err(SilenceError::validation(format!(
            "comment must be {MIN_COMMENT_LENGTH}..={MAX_COMMENT_LENGTH} characters"
        )));
    }

    Ok(compiled)
}

/// A closed-open time window used for overlap filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Start of the window.
    pub from: DateTime<Utc>,
    /// End of the window.
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    /// Creates a window.
    #[must_use]
    pub const fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Returns true if `[starts_at, ends_at)` overlaps this window.
    #[must_use]
    pub fn overlaps(&self, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> bool {
        starts_at < self.to && ends_at > self.from
    }
}

/// Listing filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilenceFilter {
    /// Only silences in this status.
    pub status: Option<SilenceStatus>,
    /// Only silences created by this user.
    pub created_by: Option<String>,
    /// Only silences whose lifetime overlaps this window.
    pub window: Option<TimeWindow>,
}

impl SilenceFilter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to a status.
    #[must_use]
    pub const fn status(mut self, status: SilenceStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to a creator.
    #[must_use]
    pub fn created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    /// Restricts to silences overlapping a window.
    #[must_use]
    pub const fn window(mut self, window: TimeWindow) -> Self {
        self.window = Some(window);
        self
    }

    /// Returns true if `silence` passes the filter, judging status by
    /// `status` rather than the record's own field.
    #[must_use]
    pub fn matches(&self, silence: &Silence, status: SilenceStatus) -> bool {
        self.status.is_none_or(|s| s == status)
            && self
                .created_by
                .as_ref()
                .is_none_or(|c| *c == silence.created_by)
            && self
                .window
                .is_none_or(|w| w.overlaps(silence.starts_at, silence.ends_at))
    }
}

/// Zero-based page selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Page index, starting at 0.
    pub page: usize,
    /// Items per page.
    pub page_size: usize,
}

impl PageRequest {
    /// Largest page size honoured; larger requests are clamped.
    pub const MAX_PAGE_SIZE: usize = 1000;
    /// Page size used by [`Default`].
    pub const DEFAULT_PAGE_SIZE: usize = 50;

    /// Creates a page request, clamping `page_size` to `1..=MAX_PAGE_SIZE`.
    #[must_use]
    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page,
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    const fn offset(&self) -> usize {
        self.page.saturating_mul(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, Self::DEFAULT_PAGE_SIZE)
    }
}

/// One page of a listing plus the total number of matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Number of items matching the filter across all pages.
    pub total: usize,
    /// The page that was requested.
    pub page: usize,
    /// The effective page size.
    pub page_size: usize,
    /// True when served from a cache that may lag behind the durable store.
    pub stale: bool,
}

/// Sorts silences newest-created-first and cuts out the requested page.
#[must_use]
pub fn paginate(mut silences: Vec<Silence>, request: PageRequest) -> Page<Silence> {
    silences.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    let total = silences.len();
    let items = silences
        .into_iter()
        .skip(request.offset())
        .take(request.page_size)
        .collect();

    Page {
        items,
        total,
        page: request.page,
        page_size: request.page_size,
        stale: false,
    }
}

/// Aggregate counters over the silence index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilenceStats {
    /// Number of silences.
    pub total: usize,
    /// Count per status.
    pub by_status: BTreeMap<SilenceStatus, usize>,
    /// Count per creator.
    pub by_creator: BTreeMap<String, usize>,
    /// Sum of matcher counts.
    pub total_matchers: usize,
    /// Earliest `ends_at` among active silences.
    pub next_expiry: Option<DateTime<Utc>>,
}
