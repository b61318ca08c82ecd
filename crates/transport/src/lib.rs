//! Resilient HTTP transport for talking to management planes.
//!
//! One [`TransportClient`] is built per logical target and shared read-only
//! by every step that talks to that target. It owns a pooled connection,
//! applies timeouts and the [`RetryPolicy`], and normalizes every failure
//! into [`TransportError`] or [`ResponseError`].

mod cache;
pub mod client;
pub mod config;
mod decode;
pub mod error;
pub mod retry;

pub use client::TransportClient;
pub use config::{duration_secs, CacheMode, CallOptions, ClientConfig, Credentials};
pub use error::{ClientError, ResponseError, Result, TransportError};
pub use retry::RetryPolicy;

pub use reqwest::Method;
