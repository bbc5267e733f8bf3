//! HTTP request and response descriptors.

use super::transport::RawResponse;
use crate::config::HttpConfig;
use crate::error::{OpError, OpResult};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;

/// Description of one HTTP call.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub verb: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Wall-clock limit for one attempt. Zero disables it.
    pub timeout: Duration,
    /// Sent as `Content-Type` unless empty or overridden by `headers`.
    pub content_type: String,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self {
            verb: HttpConfig::DEFAULT_VERB.to_string(),
            url: String::new(),
            headers: BTreeMap::new(),
            body: String::new(),
            timeout: HttpConfig::DEFAULT_TIMEOUT,
            content_type: HttpConfig::DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

impl HttpRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_verb(mut self, verb: impl Into<String>) -> Self {
        self.verb = verb.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Reject requests that cannot be sent.
    pub fn validate(&self) -> OpResult<()> {
        if self.url.trim().is_empty() {
            return Err(OpError::validation("URL is empty"));
        }
        url::Url::parse(&self.url)
            .map_err(|e| OpError::validation(format!("Invalid URL '{}': {}", self.url, e)))?;
        Ok(())
    }

    /// Headers as sent: content type first, then user headers, which may override it.
    pub fn effective_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = Vec::with_capacity(self.headers.len() + 1);
        let overridden = self
            .headers
            .keys()
            .any(|key| key.eq_ignore_ascii_case("content-type"));
        if !self.content_type.is_empty() && !overridden {
            headers.push(("Content-Type".to_string(), self.content_type.clone()));
        }
        headers.extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        headers
    }
}

/// A received HTTP response, whatever its status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: String,
    pub headers: BTreeMap<String, String>,
}

impl HttpResponse {
    /// Normalize a transport response, splitting "Key: Value" header lines.
    pub fn from_raw(raw: RawResponse) -> Self {
        let headers = raw
            .header_lines
            .iter()
            .filter_map(|line| line.split_once(": "))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        Self {
            status_code: raw.status,
            body: raw.body,
            headers,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status_code)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// Decode the body as JSON.
    pub fn json<D: DeserializeOwned>(&self) -> OpResult<D> {
        serde_json::from_str(&self.body)
            .map_err(|e| OpError::validation(format!("Failed to parse response body: {}", e)))
    }
}

/// Host part of `url`, used to name per-endpoint circuit breakers.
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.host_str().unwrap_or("unknown").to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
