//! Engine configuration and the three-tier fallback chain.
//!
//! Values are looked up in a primary [`SettingsSource`] first, then in the
//! `HUSH_*` environment, then fall back to the hard-coded default. Every
//! lookup reports which tier answered so degraded setups can be spotted in
//! the logs.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, SilenceError};

/// Prefix for environment variables read by [`Environment`].
pub const ENV_PREFIX: &str = "HUSH_";

/// Configuration for the silence manager and its background tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Deadline for a single store call.
    pub store_timeout: Duration,
    /// Period of the expiry sweep.
    pub sweep_interval: Duration,
    /// Maximum number of IDs in one bulk request.
    pub bulk_limit: usize,
    /// Number of status hints written to the store per batch.
    pub hint_batch_size: usize,
    /// Per-subscriber event buffer.
    pub event_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
            bulk_limit: 1000,
            hint_batch_size: 256,
            event_buffer: 1024,
        }
    }
}

impl ManagerConfig {
    /// Set the store call deadline.
    #[must_use]
    pub const fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Set the sweep period.
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the bulk request cap.
    #[must_use]
    pub const fn with_bulk_limit(mut self, limit: usize) -> Self {
        self.bulk_limit = limit;
        self
    }

    /// Set the hint batch size.
    #[must_use]
    pub const fn with_hint_batch_size(mut self, size: usize) -> Self {
        self.hint_batch_size = size;
        self
    }

    /// Set the per-subscriber event buffer.
    #[must_use]
    pub const fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns `SilenceError::Config` naming the first bad key.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("store_timeout", self.store_timeout.is_zero()),
            ("sweep_interval", self.sweep_interval.is_zero()),
            ("bulk_limit", self.bulk_limit == 0),
            ("hint_batch_size", self.hint_batch_size == 0),
            ("event_buffer", self.event_buffer == 0),
        ];
        match checks.iter().find(|(_, bad)| *bad) {
            Some((key, _)) => Err(SilenceError::Config {
                key: (*key).to_string(),
                reason: "must be greater than zero".to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// The tier that supplied a configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigSource {
    /// The primary settings source.
    Primary,
    /// An environment variable.
    Environment,
    /// The built-in default.
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Environment => "environment",
            Self::Default => "default",
        })
    }
}

/// A configuration value together with the tier that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<T> {
    /// The value.
    pub value: T,
    /// Where it came from.
    pub source: ConfigSource,
}

/// The highest-priority configuration tier.
///
/// A source may be unreachable; an `Err` makes the chain fall through to
/// the environment instead of failing the lookup.
pub trait SettingsSource: Send + Sync + fmt::Debug {
    /// Looks up a raw value by key (e.g. `store_timeout`).
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be consulted.
    fn get(&self, key: &str) -> Result<Option<String>>;
}

/// A fixed in-memory [`SettingsSource`].
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    values: HashMap<String, String>,
}

impl StaticSettings {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl SettingsSource for StaticSettings {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }
}

/// Snapshot of `HUSH_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Captures the `HUSH_*` variables of the current process.
    #[must_use]
    pub fn from_process() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Builds an environment from explicit pairs; only `HUSH_*` keys are kept.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self { vars }
    }

    /// Looks up `key` as `HUSH_<KEY>`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(&env_name(key))
            .map(String::as_str)
    }
}

fn env_name(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())
}

/// Parses a duration such as `250ms`, `5s`, `2m` or `1h`. A bare number is
/// read as seconds.
///
/// # Errors
///
/// Returns `SilenceError::Config` if the text is not a duration.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let bad = || SilenceError::Config {
        key: "duration".to_string(),
        reason: format!("'{text}' is not a duration"),
    };

    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| bad())?;

    let scale = |factor: u64| amount.checked_mul(factor).map(Duration::from_secs).ok_or_else(|| bad());
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(amount)),
        "" | "s" => Ok(Duration::from_secs(amount)),
        "m" => scale(60),
        "h" => scale(3600),
        _ => Err(bad()),
    }
}

/// Ordered configuration lookup: primary, environment, default.
#[derive(Debug, Default)]
pub struct FallbackChain {
    primary: Option<Box<dyn SettingsSource>>,
    env: Environment,
}

impl FallbackChain {
    /// Creates a chain with only the environment tier.
    #[must_use]
    pub fn new(env: Environment) -> Self {
        Self { primary: None, env }
    }

    /// Installs a primary source.
    #[must_use]
    pub fn with_primary(mut self, primary: impl SettingsSource + 'static) -> Self {
        self.primary = Some(Box::new(primary));
        self
    }

    /// Resolves `key` using `parse` at every tier. Unreachable or malformed
    /// tiers are logged and skipped.
    pub fn resolve_with<T>(
        &self,
        key: &str,
        default: T,
        parse: impl Fn(&str) -> Result<T>,
    ) -> Resolved<T> {
        if let Some(primary) = &self.primary {
            match primary.get(key) {
                Ok(Some(raw)) => match parse(&raw) {
                    Ok(value) => {
                        return Resolved {
                            value,
                            source: ConfigSource::Primary,
                        };
                    }
                    Err(e) => warn!(key, error = %e, "Ignoring malformed primary setting"),
                },
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "Primary settings source unavailable"),
            }
        }

        if let Some(raw) = self.env.get(key) {
            match parse(raw) {
                Ok(value) => {
                    return Resolved {
                        value,
                        source: ConfigSource::Environment,
                    };
                }
                Err(e) => warn!(key, var = %env_name(key), error = %e, "Ignoring malformed environment setting"),
            }
        }

        debug!(key, "Using default setting");
        Resolved {
            value: default,
            source: ConfigSource::Default,
        }
    }

    /// Resolves a value parsed with [`FromStr`].
    pub fn resolve<T>(&self, key: &str, default: T) -> Resolved<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.resolve_with(key, default, |raw| {
            raw.trim().parse().map_err(|e: T::Err| SilenceError::Config {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })
    }

    /// Resolves a duration written with [`parse_duration`] syntax.
    pub fn resolve_duration(&self, key: &str, default: Duration) -> Resolved<Duration> {
        self.resolve_with(key, default, parse_duration)
    }

    /// Resolves every [`ManagerConfig`] field, falling back to `defaults`.
    /// Zero values are treated as malformed.
    pub fn manager_config(&self, defaults: &ManagerConfig) -> ResolvedConfig {
        let non_zero_duration = |raw: &str| {
            parse_duration(raw).and_then(|d| {
                if d.is_zero() {
                    Err(SilenceError::validation("duration must be positive"))
                } else {
                    Ok(d)
                }
            })
        };
        let positive = |raw: &str| match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(SilenceError::validation(format!("'{raw}' is not a positive integer"))),
        };

        let store_timeout = self.resolve_with("store_timeout", defaults.store_timeout, non_zero_duration);
        let sweep_interval =
            self.resolve_with("sweep_interval", defaults.sweep_interval, non_zero_duration);
        let bulk_limit = self.resolve_with("bulk_limit", defaults.bulk_limit, positive);
        let hint_batch_size = self.resolve_with("hint_batch_size", defaults.hint_batch_size, positive);
        let event_buffer = self.resolve_with("event_buffer", defaults.event_buffer, positive);

        ResolvedConfig {
            sources: vec![
                ("store_timeout", store_timeout.source),
                ("sweep_interval", sweep_interval.source),
                ("bulk_limit", bulk_limit.source),
                ("hint_batch_size", hint_batch_size.source),
                ("event_buffer", event_buffer.source),
            ],
            config: ManagerConfig {
                store_timeout: store_timeout.value,
                sweep_interval: sweep_interval.value,
                bulk_limit: bulk_limit.value,
                hint_batch_size: hint_batch_size.value,
                event_buffer: event_buffer.value,
            },
        }
    }
}

/// A fully resolved [`ManagerConfig`] plus the tier behind every field.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The resolved configuration.
    pub config: ManagerConfig,
    /// `(key, tier)` for each field, in declaration order.
    pub sources: Vec<(&'static str, ConfigSource)>,
}

impl ResolvedConfig {
    /// Returns the tier that supplied `key`.
    #[must_use]
    pub fn source_of(&self, key: &str) -> Option<ConfigSource> {
        self.sources
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, s)| *s)
    }
}
