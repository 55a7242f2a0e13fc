//! Configuration management for the client.

use std::env;
use std::time::Duration;

/// Default base URL of the data API.
pub const DEFAULT_API_HOST: &str = "http://127.0.0.1:3000";
/// Default base URL of the OAuth provider.
pub const DEFAULT_AUTH_HOST: &str = "http://127.0.0.1:3001";
/// Default API version sent with every request.
pub const DEFAULT_API_VERSION: u32 = 5;
/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default page size for auto-paginated pulls.
pub const DEFAULT_PAGE_SIZE: usize = 10_000;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Application key, part of every data URL
    pub app_key: String,
    /// Application secret for app-credential requests
    pub app_secret: String,
    /// Master secret, only needed for master-credential requests
    pub master_secret: Option<String>,
    /// Base URL of the data API
    pub api_host: String,
    /// Base URL of the OAuth provider used for token refresh
    pub auth_host: String,
    /// Value of the `X-Api-Version` header
    pub api_version: u32,
    /// Storage namespace for every local partition
    pub namespace: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Documents per page when auto-pagination is on
    pub page_size: usize,
    /// Pull incrementally when a previous pull of the same query is cached
    pub use_delta_set: bool,
    /// Pull in concurrent pages instead of one request
    pub auto_pagination: bool,
    /// The remote accepts an array body on create
    pub batch_insert: bool,
}

impl ClientConfig {
    /// Configuration with defaults for everything but the app identity.
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        let app_key = app_key.into();
        Self {
            namespace: app_key.clone(),
            app_key,
            app_secret: app_secret.into(),
            master_secret: None,
            api_host: DEFAULT_API_HOST.to_string(),
            auth_host: DEFAULT_AUTH_HOST.to_string(),
            api_version: DEFAULT_API_VERSION,
            timeout: DEFAULT_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
            use_delta_set: false,
            auto_pagination: false,
            batch_insert: false,
        }
    }

    /// Load configuration from a `.env` file and `DOCSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let app_key = lookup("DOCSYNC_APP_KEY").ok_or(ConfigError::MissingAppKey)?;
        let app_secret = lookup("DOCSYNC_APP_SECRET").ok_or(ConfigError::MissingAppSecret)?;

        let mut config = Self::new(app_key, app_secret);
        config.master_secret = lookup("DOCSYNC_MASTER_SECRET");

        if let Some(host) = lookup("DOCSYNC_API_HOST") {
            config.api_host = host;
        }
        if let Some(host) = lookup("DOCSYNC_AUTH_HOST") {
            config.auth_host = host;
        }
        if let Some(namespace) = lookup("DOCSYNC_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(version) = number(&lookup, "DOCSYNC_API_VERSION")? {
            config.api_version = version;
        }
        if let Some(ms) = number(&lookup, "DOCSYNC_TIMEOUT_MS")? {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(size) = number(&lookup, "DOCSYNC_PAGE_SIZE")? {
            config.page_size = size;
        }
        if let Some(flag) = boolean(&lookup, "DOCSYNC_DELTA_SET")? {
            config.use_delta_set = flag;
        }
        if let Some(flag) = boolean(&lookup, "DOCSYNC_AUTO_PAGINATION")? {
            config.auto_pagination = flag;
        }
        if let Some(flag) = boolean(&lookup, "DOCSYNC_BATCH_INSERT")? {
            config.batch_insert = flag;
        }

        Ok(config)
    }

    pub fn with_api_host(mut self, host: impl Into<String>) -> Self {
        self.api_host = host.into();
        self
    }

    pub fn with_auth_host(mut self, host: impl Into<String>) -> Self {
        self.auth_host = host.into();
        self
    }

    pub fn with_master_secret(mut self, secret: impl Into<String>) -> Self {
        self.master_secret = Some(secret.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_delta_set(mut self, enabled: bool) -> Self {
        self.use_delta_set = enabled;
        self
    }

    pub fn with_auto_pagination(mut self, enabled: bool) -> Self {
        self.auto_pagination = enabled;
        self
    }

    pub fn with_batch_insert(mut self, enabled: bool) -> Self {
        self.batch_insert = enabled;
        self
    }
}

fn number<F, N>(lookup: &F, var: &'static str) -> Result<Option<N>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    N: std::str::FromStr,
{
    lookup(var)
        .map(|raw| raw.trim().parse().map_err(|_| ConfigError::InvalidNumber { var }))
        .transpose()
}

fn boolean<F>(lookup: &F, var: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool { var }),
        })
        .transpose()
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("DOCSYNC_APP_KEY environment variable is required")]
    MissingAppKey,

    #[error("DOCSYNC_APP_SECRET environment variable is required")]
    MissingAppSecret,

    #[error("Invalid number in {var}")]
    InvalidNumber { var: &'static str },

    #[error("Invalid boolean in {var}")]
    InvalidBool { var: &'static str },
}
