// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote API boundary.
//!
//! The engine never builds HTTP requests. It talks to a [`RemoteTransport`]
//! that returns already-normalised [`RemoteRecord`]s. Whatever shape the
//! remote body has (array, id-keyed object, single object, null) is decoded
//! once here by [`normalize_payload`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::record::RemoteRecord;

/// Ordering requested from the remote list endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// `update_time ASC` - full scans
    OldestFirst,
    /// `update_time DESC` - latest modifications
    NewestFirst,
}

impl SortOrder {
    /// Query-string form understood by the remote API.
    #[must_use]
    pub fn as_query(&self) -> &'static str {
        match self {
            Self::OldestFirst => "update_time ASC",
            Self::NewestFirst => "update_time DESC",
        }
    }
}

/// Options for one list call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub limit: usize,
    pub sort: SortOrder,
    pub start: usize,
}

/// Rate-limit headers surfaced by the remote side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub remaining: Option<u64>,
    pub used: Option<u64>,
    pub limit: Option<u64>,
    /// Seconds until the remote window resets
    pub reset: Option<u64>,
    /// Seconds the remote asks us to wait
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    /// Parse from a header map. Keys are matched case-insensitively, with or
    /// without the `x-ratelimit-` prefix.
    #[must_use]
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let lookup = |name: &str| -> Option<u64> {
            headers.iter().find_map(|(k, v)| {
                let k = k.to_ascii_lowercase();
                let bare = k.strip_prefix("x-ratelimit-").unwrap_or(&k);
                (bare == name).then(|| v.trim().parse::<f64>().ok()).flatten()
            })
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n.ceil() as u64)
        };
        Self {
            remaining: lookup("remaining"),
            used: lookup("used"),
            limit: lookup("limit"),
            reset: lookup("reset"),
            retry_after: lookup("retry-after"),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Response of a successful transport round-trip.
///
/// `success = false` with a 2xx status is still a failed call; see
/// [`ApiResponse::into_result`].
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status_code: u16,
    pub success: bool,
    pub data: Vec<RemoteRecord>,
    /// Elements the remote returned, including ones dropped for lacking an id.
    /// Pagination advances by this, not by `data.len()`.
    pub page_len: usize,
    pub headers: HashMap<String, String>,
    /// Error text from the body when `success` is false
    pub error: Option<String>,
}

impl ApiResponse {
    /// Successful 200 response carrying `data`.
    #[must_use]
    pub fn ok(data: Vec<RemoteRecord>) -> Self {
        Self {
            status_code: 200,
            success: true,
            page_len: data.len(),
            data,
            headers: HashMap::new(),
            error: None,
        }
    }

    /// Decode a raw JSON body of the form `{"success": .., "data": .., "error": ..}`.
    #[must_use]
    pub fn from_json(status_code: u16, body: Value, headers: HashMap<String, String>) -> Self {
        let success = body
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or((200..300).contains(&status_code));
        let error = body
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);
        let (data, page_len) = normalize_page(body.get("data").cloned().unwrap_or(Value::Null));
        Self {
            status_code,
            success,
            data,
            page_len,
            headers,
            error,
        }
    }

    /// Elements of the remote page that did not decode into a record.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.page_len.saturating_sub(self.data.len())
    }

    #[must_use]
    pub fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders::from_headers(&self.headers)
    }

    /// Turn a `success: false` body into a [`TransportError`].
    pub fn into_result(self) -> Result<Self, TransportError> {
        if self.success && self.status_code < 400 {
            return Ok(self);
        }
        Err(TransportError {
            status: Some(self.status_code),
            message: self
                .error
                .clone()
                .unwrap_or_else(|| format!("remote call unsuccessful (status {})", self.status_code)),
            headers: self.headers,
        })
    }
}

/// Raw failure from the transport, before classification.
#[derive(Debug, Clone, Error)]
#[error("{}{message}", .status.map(|s| format!("HTTP {s}: ")).unwrap_or_default())]
pub struct TransportError {
    /// HTTP-style status, absent for network-level failures
    pub status: Option<u16>,
    pub message: String,
    pub headers: HashMap<String, String>,
}

impl TransportError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            headers: HashMap::new(),
        }
    }

    /// Network-level failure without a status code.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            headers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// `retry-after` hint, if the remote sent one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        RateLimitHeaders::from_headers(&self.headers)
            .retry_after
            .map(Duration::from_secs)
    }
}

/// The remote CRM API as the engine sees it.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// List records from `endpoint`.
    async fn call(&self, endpoint: &str, options: &CallOptions) -> Result<ApiResponse, TransportError>;
}

/// Decode any remote `data` shape into a flat list of records.
///
/// - array → one record per object element
/// - object with an `id` → a single record
/// - object without an `id` → its values (id-keyed maps)
/// - `null` → empty
///
/// Elements without a usable id are dropped.
#[must_use]
pub fn normalize_payload(data: Value) -> Vec<RemoteRecord> {
    normalize_page(data).0
}

/// Like [`normalize_payload`], also returning how many elements the remote
/// sent before any were dropped.
#[must_use]
pub fn normalize_page(data: Value) -> (Vec<RemoteRecord>, usize) {
    let candidates: Vec<Value> = match data {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        Value::Object(map) if map.contains_key("id") => vec![Value::Object(map)],
        Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
        other => vec![other],
    };
    let total = candidates.len();
    let records: Vec<RemoteRecord> = candidates
        .into_iter()
        .filter_map(RemoteRecord::from_value)
        .collect();
    if records.len() < total {
        debug!(dropped = total - records.len(), "Dropped remote elements without an id");
    }
    (records, total)
}
