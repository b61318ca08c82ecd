//! Response body normalization.

use serde_json::Value;

use crate::error::{ResponseError, TransportError};

const LOGIN_FAILED_MARKER: &str = "<Response [401]>";
const BAD_GATEWAY_MARKER: &str = "<Response [502]>";

fn claims_json(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
}

fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

/// Decode a successful body: structured data when declared or shaped like
/// JSON, raw text otherwise. A body that declares JSON but is not is an error.
pub(crate) fn decode_success(
    status: u16,
    content_type: Option<&str>,
    text: String,
) -> Result<Value, TransportError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }

    if claims_json(content_type) {
        return serde_json::from_str(&text).map_err(|e| TransportError::Decode {
            status,
            message: e.to_string(),
            body: text,
        });
    }

    if looks_like_json(&text) {
        if let Ok(value) = serde_json::from_str(&text) {
            return Ok(value);
        }
    }

    Ok(Value::String(text))
}

/// Best-effort decode of an error body; never fails.
pub(crate) fn decode_error_body(content_type: Option<&str>, text: String) -> Value {
    if claims_json(content_type) || looks_like_json(&text) {
        if let Ok(value) = serde_json::from_str(&text) {
            return value;
        }
    }
    Value::String(text)
}

/// Look for the failure markers one upstream API echoes into 200 responses.
pub(crate) fn detect_inband_error(body: &Value) -> Option<ResponseError> {
    let haystack = match body {
        Value::String(s) => s.clone(),
        Value::Null => return None,
        other => other.to_string(),
    };

    if haystack.contains(LOGIN_FAILED_MARKER) {
        Some(ResponseError::LoginFailed { body: haystack })
    } else if haystack.contains(BAD_GATEWAY_MARKER) {
        Some(ResponseError::BadGateway { body: haystack })
    } else {
        None
    }
}
