//! Client configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Async-ish credential refresh callback: returns a fresh credential, or
/// `None` when the application cannot provide one.
pub type AuthCallback = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Verbosity hint for the embedding application's tracing subscriber.
///
/// The library always emits through `tracing`; this level says how much of
/// it the application intends to surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Errors and lifecycle information.
    #[default]
    Info,
    /// Everything, including per-request pacing decisions.
    Debug,
}

impl LogLevel {
    /// Maps to the corresponding `tracing` level.
    #[must_use]
    pub fn as_tracing(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
        }
    }
}

/// Options for [`crate::Client`].
///
/// Only `name` is required. Endpoints left empty disable that direction.
#[derive(Clone)]
pub struct ClientOptions {
    /// Store identifier; also names the durable file.
    pub name: String,
    /// Pull endpoint, or empty to disable pulls.
    pub pull_url: String,
    /// Push endpoint, or empty to disable pushes.
    pub push_url: String,
    /// Initial pull credential.
    pub pull_auth: Option<String>,
    /// Initial push credential.
    pub push_auth: Option<String>,
    /// Refresh callback invoked when the pull endpoint answers 401.
    pub get_pull_auth: Option<AuthCallback>,
    /// Refresh callback invoked when the push endpoint answers 401.
    pub get_push_auth: Option<AuthCallback>,
    /// Watchdog period for spontaneous pulls; `None` disables.
    pub pull_interval: Option<Duration>,
    /// Debounce before a push dispatch.
    pub push_delay: Duration,
    /// Opaque application schema version forwarded on every request.
    pub schema_version: String,
    /// Use the in-memory backend instead of a durable file.
    pub use_memstore: bool,
    /// Logging verbosity hint.
    pub log_level: LogLevel,
    /// Directory holding durable store files.
    pub data_dir: PathBuf,
}

impl ClientOptions {
    /// Creates options for the named store with defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pull_url: String::new(),
            push_url: String::new(),
            pull_auth: None,
            push_auth: None,
            get_pull_auth: None,
            get_push_auth: None,
            pull_interval: None,
            push_delay: Duration::from_millis(10),
            schema_version: String::new(),
            use_memstore: false,
            log_level: LogLevel::default(),
            data_dir: PathBuf::from("."),
        }
    }

    /// Sets the pull endpoint.
    #[must_use]
    pub fn with_pull_url(mut self, url: impl Into<String>) -> Self {
        self.pull_url = url.into();
        self
    }

    /// Sets the push endpoint.
    #[must_use]
    pub fn with_push_url(mut self, url: impl Into<String>) -> Self {
        self.push_url = url.into();
        self
    }

    /// Sets the initial pull credential.
    #[must_use]
    pub fn with_pull_auth(mut self, auth: impl Into<String>) -> Self {
        self.pull_auth = Some(auth.into());
        self
    }

    /// Sets the initial push credential.
    #[must_use]
    pub fn with_push_auth(mut self, auth: impl Into<String>) -> Self {
        self.push_auth = Some(auth.into());
        self
    }

    /// Sets the pull credential refresh callback.
    #[must_use]
    pub fn with_get_pull_auth(mut self, f: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        self.get_pull_auth = Some(Arc::new(f));
        self
    }

    /// Sets the push credential refresh callback.
    #[must_use]
    pub fn with_get_push_auth(mut self, f: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        self.get_push_auth = Some(Arc::new(f));
        self
    }

    /// Sets the pull watchdog period.
    #[must_use]
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = Some(interval);
        self
    }

    /// Sets the push debounce delay.
    #[must_use]
    pub fn with_push_delay(mut self, delay: Duration) -> Self {
        self.push_delay = delay;
        self
    }

    /// Sets the schema version.
    #[must_use]
    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    /// Selects the in-memory backend.
    #[must_use]
    pub fn with_memstore(mut self) -> Self {
        self.use_memstore = true;
        self
    }

    /// Sets the logging verbosity hint.
    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets the directory for durable store files.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("name", &self.name)
            .field("pull_url", &self.pull_url)
            .field("push_url", &self.push_url)
            .field("pull_auth", &self.pull_auth.as_deref().map(|_| "<set>"))
            .field("push_auth", &self.push_auth.as_deref().map(|_| "<set>"))
            .field("get_pull_auth", &self.get_pull_auth.is_some())
            .field("get_push_auth", &self.get_push_auth.is_some())
            .field("pull_interval", &self.pull_interval)
            .field("push_delay", &self.push_delay)
            .field("schema_version", &self.schema_version)
            .field("use_memstore", &self.use_memstore)
            .field("log_level", &self.log_level)
            .field("data_dir", &self.data_dir)
            .finish()
    }
}
