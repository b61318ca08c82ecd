use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::config::{CacheMode, CallOptions, ClientConfig};
use crate::decode;
use crate::error::{ClientError, Result, TransportError};

struct Inner {
    http: Client,
    base_url: String,
    config: ClientConfig,
    cache: Option<ResponseCache>,
}

/// Pooled HTTP client for one target.
///
/// Cloning is cheap; clones share the connection pool and the GET cache.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

impl TransportClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::Config(format!("header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::Config(format!("header value for {}: {}", name, e)))?;
            default_headers.insert(name, value);
        }

        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .danger_accept_invalid_certs(!config.verify_tls)
            .default_headers(default_headers)
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self::with_client(config, http))
    }

    /// Wrap an already-built `reqwest::Client`. Custom headers and timeouts
    /// in `config` that live on the builder are not applied to it.
    pub fn with_client(config: ClientConfig, http: Client) -> Self {
        let cache = match config.cache {
            CacheMode::Disabled => None,
            CacheMode::Memory { ttl } => Some(ResponseCache::new(ttl)),
        };

        Self {
            inner: Arc::new(Inner {
                http,
                base_url: config.base_url(),
                config,
                cache,
            }),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None, &CallOptions::default())
            .await
    }

    pub async fn get_with(&self, path: &str, options: &CallOptions) -> Result<Value> {
        self.request(Method::GET, path, None, options).await
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        self.post_with(path, body, &CallOptions::default()).await
    }

    pub async fn post_with<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        options: &CallOptions,
    ) -> Result<Value> {
        let body = encode(body)?;
        self.request(Method::POST, path, Some(body), options).await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        self.put_with(path, body, &CallOptions::default()).await
    }

    pub async fn put_with<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        options: &CallOptions,
    ) -> Result<Value> {
        let body = encode(body)?;
        self.request(Method::PUT, path, Some(body), options).await
    }

    pub async fn patch<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        self.patch_with(path, body, &CallOptions::default()).await
    }

    pub async fn patch_with<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        options: &CallOptions,
    ) -> Result<Value> {
        let body = encode(body)?;
        self.request(Method::PATCH, path, Some(body), options).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.request(Method::DELETE, path, None, &CallOptions::default())
            .await
    }

    pub async fn delete_with(&self, path: &str, options: &CallOptions) -> Result<Value> {
        self.request(Method::DELETE, path, None, options).await
    }

    /// GET and deserialize into `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.get(path).await?;
        serde_json::from_value(value).map_err(ClientError::Deserialize)
    }

    /// POST and deserialize the response into `T`.
    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let value = self.post(path, body).await?;
        serde_json::from_value(value).map_err(ClientError::Deserialize)
    }

    /// Issue one logical call: retries, decoding and error normalization
    /// included. Only the final outcome is returned.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: &CallOptions,
    ) -> Result<Value> {
        let url = self.url(path);
        let cache_key = self.cache_key(&url, options);
        let read_only = method == Method::GET || method == Method::HEAD;

        if let Some(cache) = &self.inner.cache {
            if !read_only {
                cache.clear();
            } else if let Some(key) = &cache_key {
                if let Some(hit) = cache.get(key) {
                    debug!(url = %url, "Serving cached response");
                    return Ok(hit);
                }
            }
        }

        let policy = &self.inner.config.retry;
        let max_attempts = policy.attempts_for(&method);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(TransportError::Cancelled.into());
            }

            debug!(method = %method, url = %url, attempt, max_attempts, "Sending request");

            let response = match self.send_once(&method, &url, body.as_ref(), options).await {
                Ok(response) => response,
                Err(e) => {
                    let error = TransportError::Connection {
                        message: e.to_string(),
                    };
                    if attempt < max_attempts {
                        let delay = policy.backoff(attempt);
                        warn!(
                            method = %method,
                            url = %url,
                            error = %error,
                            "Connection failed, retrying in {:?} (attempt {}/{})",
                            delay,
                            attempt + 1,
                            max_attempts
                        );
                        self.pause(delay, options).await?;
                        continue;
                    }
                    return Err(error.into());
                }
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                let value = self.finish(status, response).await?;
                if let (Some(cache), Some(key)) = (&self.inner.cache, cache_key) {
                    cache.put(key, value.clone());
                }
                return Ok(value);
            }

            let server_delay = policy.retry_after(status, response.headers());
            let content_type = content_type(&response);
            let text = response.text().await.unwrap_or_default();
            let error = TransportError::Http {
                status,
                body: decode::decode_error_body(content_type.as_deref(), text),
            };

            if attempt < max_attempts && policy.should_retry_status(status) {
                let delay = server_delay.unwrap_or_else(|| policy.backoff(attempt));
                warn!(
                    method = %method,
                    url = %url,
                    status,
                    "Retryable status, retrying in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    max_attempts
                );
                self.pause(delay, options).await?;
                continue;
            }

            if attempt > 1 {
                warn!(method = %method, url = %url, status, attempts = attempt, "Request failed after retries");
            }
            return Err(error.into());
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        options: &CallOptions,
    ) -> std::result::Result<Response, reqwest::Error> {
        let config = &self.inner.config;
        let mut request = self
            .inner
            .http
            .request(method.clone(), url)
            .timeout(options.timeout.unwrap_or(config.read_timeout));

        if let Some(credentials) = &config.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }

        request = match body {
            Some(Value::String(raw)) if options.raw_body => request.body(raw.clone()),
            Some(body) => request.json(body),
            None => request,
        };

        request.send().await
    }

    async fn finish(&self, status: u16, response: Response) -> Result<Value> {
        let content_type = content_type(&response);
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Connection {
                message: format!("failed to read response body: {}", e),
            })?;

        let value = decode::decode_success(status, content_type.as_deref(), text)?;

        if self.inner.config.inband_error_markers {
            if let Some(error) = decode::detect_inband_error(&value) {
                warn!(kind = error.kind(), "Successful response carries an in-band failure marker");
                return Err(error.into());
            }
        }

        Ok(value)
    }

    async fn pause(&self, delay: Duration, options: &CallOptions) -> Result<()> {
        match &options.cancel {
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(()),
                    _ = token.cancelled() => Err(TransportError::Cancelled.into()),
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.inner.base_url, path.trim_start_matches('/'))
    }

    fn cache_key(&self, url: &str, options: &CallOptions) -> Option<String> {
        if self.inner.cache.is_none() || options.bypass_cache {
            return None;
        }
        if options.query.is_empty() {
            return Some(url.to_string());
        }
        let query: Vec<String> = options
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        Some(format!("{}?{}", url, query.join("&")))
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("base_url", &self.inner.base_url)
            .finish()
    }
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Value> {
    serde_json::to_value(body).map_err(ClientError::Encode)
}

fn content_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
