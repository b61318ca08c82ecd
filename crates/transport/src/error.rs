use serde_json::Value;
use thiserror::Error;

/// The outbound call itself failed after retries were exhausted.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTPError: status {status}: {body}")]
    Http { status: u16, body: Value },

    #[error("ConnectionError: {message}")]
    Connection { message: String },

    #[error("HTTPError: status {status}: body declared JSON but failed to decode: {message}")]
    Decode {
        status: u16,
        message: String,
        body: String,
    },

    #[error("Request cancelled before completion")]
    Cancelled,
}

impl TransportError {
    /// Discriminator string: `"HTTPError"` or `"ConnectionError"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } | Self::Decode { .. } => "HTTPError",
            Self::Connection { .. } => "ConnectionError",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Status code, or `None` when the server never answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } | Self::Decode { status, .. } => Some(*status),
            Self::Connection { .. } | Self::Cancelled => None,
        }
    }

    /// Best-effort decoded error body.
    pub fn body(&self) -> Option<Value> {
        match self {
            Self::Http { body, .. } => Some(body.clone()),
            Self::Decode { body, .. } => Some(Value::String(body.clone())),
            Self::Connection { .. } | Self::Cancelled => None,
        }
    }
}

/// The call succeeded at the HTTP level but the body carries a failure
/// marker some upstream APIs echo inside a 200 response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("LoginFailed: response body reports 401: {body}")]
    LoginFailed { body: String },

    #[error("BadGateway: response body reports 502: {body}")]
    BadGateway { body: String },
}

impl ResponseError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoginFailed { .. } => "LoginFailed",
            Self::BadGateway { .. } => "BadGateway",
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Response(#[from] ResponseError),

    #[error("Invalid client configuration: {0}")]
    Config(String),

    #[error("Failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Response did not match the expected shape: {0}")]
    Deserialize(#[source] serde_json::Error),
}

impl ClientError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(e) => e.kind(),
            Self::Response(e) => e.kind(),
            Self::Config(_) => "ConfigError",
            Self::Encode(_) | Self::Deserialize(_) => "SerializationError",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(e) => e.status(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
