//! Alertmanager-compatible silence matching and lifecycle engine.
//!
//! `hush-silences` decides whether an alert is currently silenced and owns
//! the time-driven lifecycle of every silence (pending, active, expired).
//!
//! # Features
//!
//! - **Matchers**: `=`, `!=`, `=~`, `!~` with anchored regexes compiled once
//! - **Lifecycle**: Status derived from the clock on every read, never stored as truth
//! - **Durable store**: Pluggable [`SilenceStore`] with optimistic versioning
//! - **Expiry sweep**: Exactly one `silence_expired` event per silence
//! - **Bulk delete**: Independent per-item outcomes with bounded concurrency
//! - **Events**: Non-blocking fan-out to any number of subscribers
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use chrono::{Duration, Utc};
//! use hush_silences::{
//!     ManagerConfig, Matcher, MemoryStore, RequestContext, SilenceManager, SilenceSpec,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let manager = SilenceManager::new(Arc::new(MemoryStore::new()), ManagerConfig::default());
//! let ctx = RequestContext::default();
//! manager.hydrate(&ctx).await.unwrap();
//!
//! let now = Utc::now();
//! let spec = SilenceSpec::new(
//!     vec![Matcher::equal("alertname", "HighCPU")],
//!     now - Duration::minutes(5),
//!     now + Duration::hours(2),
//!     "ops@example.com",
//!     "kernel upgrade",
//! );
//! let silence = manager.create_silence(&ctx, spec).await.unwrap();
//!
//! let mut labels = HashMap::new();
//! labels.insert("alertname".to_string(), "HighCPU".to_string());
//! let result = manager.is_alert_silenced(&labels);
//! assert!(result.silenced);
//! assert_eq!(result.silence_ids, vec![silence.id]);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bulk;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod manager;
pub mod matcher;
pub mod store;
pub mod sweeper;
pub mod types;

// Re-export main types at crate root
pub use bulk::{BulkCoordinator, BulkDeleteResult, BulkItemError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigSource, Environment, FallbackChain, ManagerConfig, Resolved, ResolvedConfig,
    SettingsSource, StaticSettings,
};
pub use context::RequestContext;
pub use error::{Result, SilenceError};
pub use events::{
    BroadcastEmitter, EventSink, EventSubscription, NullSink, SilenceEvent, SilenceEventKind,
};
pub use manager::{SilenceManager, SilenceMatch};
pub use matcher::{CompiledMatcher, LabelSet, MatchOperator, Matcher};
pub use store::{FileStore, MemoryStore, SilenceStore};
pub use sweeper::{sweep_once, ExpirySweeper, SweepReport, SweeperHandle};
pub use types::{
    Page, PageRequest, Silence, SilenceFilter, SilencePatch, SilenceSpec, SilenceStats,
    SilenceStatus, TimeWindow,
};
