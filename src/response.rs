use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Result;
use crate::config::ResponseType;
use crate::error::Error;
use crate::util::truncate_body;

/// Decoded response payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Empty,
    Json(Value),
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub const fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    data: Payload,
}

impl Response {
    pub(crate) fn decode(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        response_type: ResponseType,
        method: &Method,
        uri: &str,
    ) -> Result<Self> {
        let data = decode_payload(status, &headers, &body, response_type).map_err(
            |(expected, message)| Error::DecodeBody {
                expected,
                message,
                method: method.clone(),
                uri: uri.to_owned(),
            },
        )?;
        Ok(Self {
            status,
            headers,
            body,
            data,
        })
    }

    /// Failure responses handed to auth strategies decode best-effort; an
    /// unparseable error body must not mask the status failure itself.
    pub(crate) fn for_failure(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let data = decode_payload(status, &headers, &body, ResponseType::Auto)
            .unwrap_or_else(|_| Payload::Binary(body.clone()));
        Self {
            status,
            headers,
            body,
            data,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw response body bytes, regardless of how `data` was decoded.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn into_data(self) -> Payload {
        self.data
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::DeserializeJson {
            source: Arc::new(source),
            body: truncate_body(&self.body),
        })
    }
}

fn decode_payload(
    status: StatusCode,
    headers: &HeaderMap,
    body: &Bytes,
    response_type: ResponseType,
) -> std::result::Result<Payload, (&'static str, String)> {
    if status == StatusCode::NO_CONTENT || body.is_empty() {
        return Ok(Payload::Empty);
    }

    let effective = match response_type {
        ResponseType::Auto => sniff_response_type(headers),
        explicit => explicit,
    };

    match effective {
        ResponseType::Json | ResponseType::Auto => {
            let value: Value =
                serde_json::from_slice(body).map_err(|error| ("json", error.to_string()))?;
            Ok(Payload::Json(value))
        }
        ResponseType::Text => Ok(Payload::Text(String::from_utf8_lossy(body).into_owned())),
        ResponseType::Binary => Ok(Payload::Binary(body.clone())),
    }
}

fn sniff_response_type(headers: &HeaderMap) -> ResponseType {
    let Some(content_type) = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return ResponseType::Binary;
    };
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if media_type == "application/json" || media_type.ends_with("+json") {
        ResponseType::Json
    } else if media_type.starts_with("text/") {
        ResponseType::Text
    } else {
        ResponseType::Binary
    }
}

/// Some APIs double-encode JSON payloads; a decoded payload that is itself a
/// JSON-shaped string gets one secondary parse, falling back silently to the
/// raw string.
pub(crate) fn reparse_double_encoded(payload: Payload) -> Payload {
    match payload {
        Payload::Json(Value::String(text)) => match parse_if_json_shaped(&text) {
            Some(value) => Payload::Json(value),
            None => Payload::Json(Value::String(text)),
        },
        Payload::Text(text) => match parse_if_json_shaped(&text) {
            Some(value) => Payload::Json(value),
            None => Payload::Text(text),
        },
        other => other,
    }
}

fn parse_if_json_shaped(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let object_shaped = trimmed.starts_with('{') && trimmed.ends_with('}');
    let array_shaped = trimmed.starts_with('[') && trimmed.ends_with(']');
    if !object_shaped && !array_shaped {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}
