//! Deferred configuration values.
//!
//! A [`DeferredValue`] is a configuration scalar whose concrete value is only
//! known at execution time. It owns a resolution strategy (a [`ValueSource`])
//! and a private memoization slot:
//!
//! - the strategy runs lazily, on the first call to [`DeferredValue::resolve`];
//! - once resolved, the instance never runs its strategy again;
//! - [`Clone`] shares the (immutable) strategy but starts with an empty slot,
//!   so two configurations built from the same template never share a
//!   resolved value. Static values are the exception: they are known up
//!   front and stay resolved.
//!
//! Strategies compose: [`DeferredValue::map`] and the encrypted source in
//! [`crate::secret`] wrap an inner strategy, and the whole chain is resolved
//! outermost-first in a single `resolve()` call.

mod params;

pub use params::{EnvSource, ParameterSource, RuntimeParameters};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::error::Result;

/// Resolution strategy for a deferred value.
///
/// Implementations must be immutable after construction: they are shared
/// between clones of a [`DeferredValue`].
#[async_trait]
pub trait ValueSource<T>: Send + Sync + fmt::Debug {
    /// Produce the concrete value. May perform I/O (e.g. a decrypt call).
    async fn produce(&self) -> Result<T>;

    /// Check, without any I/O, that the backing source is set.
    ///
    /// Returns `ConfigurationMissing` for unbound parameters so callers can
    /// fail before any connection or key-management call is attempted.
    fn check_available(&self) -> Result<()>;

    /// Human-readable description for diagnostics. Never includes the value.
    fn describe(&self) -> String;

    /// Whether the value is fixed at definition time.
    fn is_static(&self) -> bool {
        false
    }
}

/// Observable state of a deferred value.
#[derive(Debug, PartialEq, Eq)]
pub enum DeferredState<'a, T> {
    Unresolved,
    Resolved(&'a T),
}

/// A configuration value resolved lazily, at most once per instance.
pub struct DeferredValue<T> {
    source: Arc<dyn ValueSource<T>>,
    cell: OnceCell<T>,
}

impl<T> DeferredValue<T>
where
    T: Send + Sync + 'static,
{
    /// Create a deferred value from a resolution strategy.
    pub fn from_source(source: impl ValueSource<T> + 'static) -> Self {
        Self::from_shared(Arc::new(source))
    }

    pub(crate) fn from_shared(source: Arc<dyn ValueSource<T>>) -> Self {
        Self {
            source,
            cell: OnceCell::new(),
        }
    }

    pub(crate) fn source(&self) -> Arc<dyn ValueSource<T>> {
        self.source.clone()
    }

    /// Resolve the value, running the strategy on first access only.
    ///
    /// Concurrent callers wait for the single in-flight resolution. A failed
    /// resolution leaves the slot empty; the error is returned as-is.
    pub async fn resolve(&self) -> Result<&T> {
        self.cell
            .get_or_try_init(|| async { self.source.produce().await })
            .await
    }

    /// I/O-free check that the backing source of this value is set.
    pub fn check_available(&self) -> Result<()> {
        if self.cell.initialized() {
            return Ok(());
        }
        self.source.check_available()
    }

    /// Whether this instance has already memoized its value.
    pub fn is_resolved(&self) -> bool {
        self.cell.initialized()
    }

    /// Current state of the memoization slot.
    pub fn state(&self) -> DeferredState<'_, T> {
        match self.cell.get() {
            Some(v) => DeferredState::Resolved(v),
            None => DeferredState::Unresolved,
        }
    }

    /// The value, if it is known without resolving (static or already memoized).
    pub fn peek(&self) -> Option<&T> {
        self.cell.get()
    }

    /// Description of the resolution strategy, safe to log.
    pub fn describe(&self) -> String {
        self.source.describe()
    }

    /// Compose a pure transform on top of this value.
    ///
    /// The returned value has its own memoization slot; the transform runs
    /// once, after the inner strategy produces its value.
    pub fn map<U, F>(self, label: impl Into<String>, f: F) -> DeferredValue<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> Result<U> + Send + Sync + 'static,
    {
        DeferredValue::from_source(MapSource {
            inner: self.source,
            label: label.into(),
            f,
        })
    }
}

impl<T> DeferredValue<T>
where
    T: Clone + fmt::Debug + Send + Sync + 'static,
{
    /// A value already known at definition time.
    pub fn from_static(value: T) -> Self {
        Self {
            source: Arc::new(StaticSource(value.clone())),
            cell: OnceCell::from(value),
        }
    }
}

impl<T: Clone> Clone for DeferredValue<T> {
    /// Shares the strategy, not the memoized value. Static values stay
    /// resolved.
    fn clone(&self) -> Self {
        let cell = match self.cell.get() {
            Some(value) if self.source.is_static() => OnceCell::from(value.clone()),
            _ => OnceCell::new(),
        };
        Self {
            source: self.source.clone(),
            cell,
        }
    }
}

impl<T> fmt::Debug for DeferredValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredValue")
            .field("source", &self.source.describe())
            .field("resolved", &self.cell.initialized())
            .finish()
    }
}

impl From<&str> for DeferredValue<String> {
    fn from(value: &str) -> Self {
        DeferredValue::from_static(value.to_string())
    }
}

impl From<String> for DeferredValue<String> {
    fn from(value: String) -> Self {
        DeferredValue::from_static(value)
    }
}

/// A value supplied at definition time.
#[derive(Debug)]
pub struct StaticSource<T>(pub T);

#[async_trait]
impl<T> ValueSource<T> for StaticSource<T>
where
    T: Clone + fmt::Debug + Send + Sync + 'static,
{
    async fn produce(&self) -> Result<T> {
        Ok(self.0.clone())
    }

    fn check_available(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }

    fn is_static(&self) -> bool {
        true
    }
}

/// A pure transform applied to the output of an inner strategy.
struct MapSource<T, F> {
    inner: Arc<dyn ValueSource<T>>,
    label: String,
    f: F,
}

impl<T, F> fmt::Debug for MapSource<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapSource")
            .field("inner", &self.inner.describe())
            .field("label", &self.label)
            .finish()
    }
}

#[async_trait]
impl<T, U, F> ValueSource<U> for MapSource<T, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(T) -> Result<U> + Send + Sync + 'static,
{
    async fn produce(&self) -> Result<U> {
        let value = self.inner.produce().await?;
        (self.f)(value)
    }

    fn check_available(&self) -> Result<()> {
        self.inner.check_available()
    }

    fn describe(&self) -> String {
        format!("{}({})", self.label, self.inner.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingSource {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ValueSource<String> for CountingSource {
        async fn produce(&self) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("value-{}", n))
        }

        fn check_available(&self) -> Result<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    #[tokio::test]
    async fn test_resolution_is_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let value = DeferredValue::from_source(CountingSource {
            calls: calls.clone(),
        });

        assert_eq!(value.state(), DeferredState::Unresolved);
        assert_eq!(value.resolve().await.unwrap(), "value-0");
        assert_eq!(value.resolve().await.unwrap(), "value-0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(value.is_resolved());
    }

    #[tokio::test]
    async fn test_clone_gets_independent_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let template = DeferredValue::from_source(CountingSource {
            calls: calls.clone(),
        });

        let a = template.clone();
        let b = template.clone();
        assert_eq!(a.resolve().await.unwrap(), "value-0");
        assert_eq!(b.resolve().await.unwrap(), "value-1");
        assert_eq!(a.resolve().await.unwrap(), "value-0");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!template.is_resolved());
    }

    #[tokio::test]
    async fn test_static_value_is_resolved_up_front() {
        let value = DeferredValue::from_static("org.postgresql.Driver".to_string());
        assert!(value.is_resolved());
        assert_eq!(value.peek().map(String::as_str), Some("org.postgresql.Driver"));
        assert_eq!(value.resolve().await.unwrap(), "org.postgresql.Driver");
        assert!(value.clone().is_resolved());
    }

    #[tokio::test]
    async fn test_map_composes_lazily() {
        let calls = Arc::new(AtomicUsize::new(0));
        let value = DeferredValue::from_source(CountingSource {
            calls: calls.clone(),
        })
        .map("upper", |s| Ok(s.to_uppercase()));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(value.resolve().await.unwrap(), "VALUE-0");
        assert_eq!(value.resolve().await.unwrap(), "VALUE-0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(value.describe(), "upper(counting)");
    }

    #[tokio::test]
    async fn test_map_error_propagates() {
        let value = DeferredValue::from_static("x".to_string())
            .map("parse", |s| -> Result<i32> {
                s.parse::<i32>()
                    .map_err(|e| ExtractError::Config(e.to_string()))
            });
        assert!(matches!(
            value.resolve().await,
            Err(ExtractError::Config(_))
        ));
        assert!(!value.is_resolved());
    }

    #[test]
    fn test_debug_does_not_print_value() {
        let value = DeferredValue::from_static("hunter2".to_string());
        let debug = format!("{:?}", value);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("resolved: true"));
    }
}
