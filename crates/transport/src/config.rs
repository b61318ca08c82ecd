use conductor_core::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::retry::RetryPolicy;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POOL_MAX_IDLE: usize = 10;

/// Serde helper for durations written as (fractional) seconds.
pub mod duration_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Basic-auth credentials.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Response caching for read-only calls.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    Disabled,
    /// Cache GET bodies in memory for `ttl`. Any mutating call through the
    /// same client clears the cache.
    Memory {
        #[serde(with = "duration_secs")]
        ttl: Duration,
    },
}

/// Everything needed to build a [`crate::TransportClient`] for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or IP. A value containing `://` is used verbatim as the base.
    pub address: String,
    pub port: Option<u16>,
    pub use_tls: bool,
    /// Reject self-signed certificates when true.
    pub verify_tls: bool,
    /// Prefix joined in front of every request path, e.g. `/api/nutanix/v3`.
    pub base_path: String,
    pub credentials: Option<Credentials>,
    pub headers: BTreeMap<String, String>,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,
    pub retry: RetryPolicy,
    pub cache: CacheMode,
    /// Promote `<Response [401]>` / `<Response [502]>` markers found in
    /// successful bodies to [`crate::ResponseError`].
    pub inband_error_markers: bool,
    pub pool_max_idle_per_host: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: None,
            use_tls: true,
            verify_tls: true,
            base_path: String::new(),
            credentials: None,
            headers: BTreeMap::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            retry: RetryPolicy::default(),
            cache: CacheMode::Disabled,
            inband_error_markers: true,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE,
        }
    }
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    pub fn with_inband_error_markers(mut self, enabled: bool) -> Self {
        self.inband_error_markers = enabled;
        self
    }

    /// Scheme, host, optional port and base path, without a trailing slash.
    pub fn base_url(&self) -> String {
        let root = if self.address.contains("://") {
            self.address.trim_end_matches('/').to_string()
        } else {
            let scheme = if self.use_tls { "https" } else { "http" };
            match self.port {
                Some(port) => format!("{}://{}:{}", scheme, self.address, port),
                None => format!("{}://{}", scheme, self.address),
            }
        };

        let base_path = self.base_path.trim_matches('/');
        if base_path.is_empty() {
            root
        } else {
            format!("{}/{}", root, base_path)
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Replaces the client's read timeout for this call.
    pub timeout: Option<Duration>,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    /// Send a string body as-is instead of JSON-encoding it.
    pub raw_body: bool,
    /// Skip the GET cache for this call.
    pub bypass_cache: bool,
    /// Abort backoff sleeps when cancelled.
    pub cancel: Option<CancelToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw_body = true;
        self
    }

    pub fn uncached(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}
