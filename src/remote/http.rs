// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! REST backend over reqwest.
//!
//! Endpoints (payloads are base64 in JSON):
//! - `GET  {base}/records/{type}/{id}` → `{ "version", "payload" }`, 404 when absent
//! - `PUT  {base}/records/{type}/{id}` with `{ "base_version", "payload" }`
//!   → 200 `{ "version", "event_id" }` or 409 `{ "current": {..} | null }`
//!
//! Every request carries the bearer token and an `x-owner-id` header.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{NetworkError, PushOutcome, RemoteBackend};
use crate::record::{EventId, Record, RecordKey};

#[derive(Debug, Serialize, Deserialize)]
struct WireRecord {
    version: u64,
    payload: String,
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    base_version: u64,
    payload: &'a str,
}

#[derive(Debug, Deserialize)]
struct PushAccepted {
    version: u64,
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct PushConflict {
    current: Option<WireRecord>,
}

/// How a non-success status maps onto [`NetworkError`].
fn classify_status(status: StatusCode) -> NetworkError {
    match status {
        StatusCode::UNAUTHORIZED => NetworkError::AuthExpired,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => NetworkError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => NetworkError::Transient(status.to_string()),
        s if s.is_server_error() => NetworkError::Transient(s.to_string()),
        s => NetworkError::Rejected { status: s.as_u16() },
    }
}

fn classify_reqwest(err: reqwest::Error) -> NetworkError {
    if err.is_timeout() {
        NetworkError::Timeout
    } else if err.is_decode() {
        NetworkError::Decode(err.to_string())
    } else {
        NetworkError::Transient(err.to_string())
    }
}

fn decode_record(key: &RecordKey, wire: WireRecord) -> Result<Record, NetworkError> {
    let payload = BASE64
        .decode(wire.payload.as_bytes())
        .map_err(|e| NetworkError::Decode(e.to_string()))?;
    Ok(Record::from_server(key.clone(), payload, wire.version))
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: reqwest::Url,
    token: RwLock<Option<String>>,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, NetworkError> {
        let base_url = reqwest::Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| NetworkError::Config(format!("invalid base url: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(NetworkError::Config(format!("'{}' cannot be a base url", base_url)));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NetworkError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token: RwLock::new(None),
        })
    }

    /// Replace the bearer token (after re-authentication).
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    fn record_url(&self, key: &RecordKey) -> Result<reqwest::Url, NetworkError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| NetworkError::Config("base url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["records", key.entity_type(), key.entity_id()]);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder, key: &RecordKey) -> reqwest::RequestBuilder {
        let request = request.header("x-owner-id", key.owner().as_str());
        match self.token.read().as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn fetch(&self, key: &RecordKey) -> Result<Option<Record>, NetworkError> {
        let url = self.record_url(key)?;
        let response = self
            .authorize(self.client.get(url), key)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            debug!(key = %key, %status, "Fetch failed");
            return Err(classify_status(status));
        }
        let wire: WireRecord = response.json().await.map_err(classify_reqwest)?;
        decode_record(key, wire).map(Some)
    }

    async fn push(&self, key: &RecordKey, payload: &[u8], base_version: u64) -> Result<PushOutcome, NetworkError> {
        let url = self.record_url(key)?;
        let encoded = BASE64.encode(payload);
        let body = PushRequest { base_version, payload: &encoded };
        let response = self
            .authorize(self.client.put(url), key)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            let conflict: PushConflict = response.json().await.map_err(classify_reqwest)?;
            let current = conflict.current.map(|w| decode_record(key, w)).transpose()?;
            return Ok(PushOutcome::Conflict { current });
        }
        if !status.is_success() {
            debug!(key = %key, %status, "Push failed");
            return Err(classify_status(status));
        }
        let accepted: PushAccepted = response.json().await.map_err(classify_reqwest)?;
        Ok(PushOutcome::Accepted {
            version: accepted.version,
            event_id: EventId::new(accepted.event_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OwnerId;

    fn key() -> RecordKey {
        RecordKey::new(OwnerId::new("alice"), "message", "m 1")
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), NetworkError::AuthExpired);
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT), NetworkError::Timeout);
        assert!(matches!(classify_status(StatusCode::SERVICE_UNAVAILABLE), NetworkError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS), NetworkError::Transient(_)));
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), NetworkError::Rejected { status: 400 });
        assert_eq!(classify_status(StatusCode::FORBIDDEN), NetworkError::Rejected { status: 403 });
    }

    #[test]
    fn test_record_url_escapes_segments() {
        let backend = HttpBackend::new("https://api.example.com/v2/", Duration::from_secs(5)).unwrap();
        let url = backend.record_url(&key()).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v2/records/message/m%201");
    }

    #[test]
    fn test_decode_record() {
        let wire = WireRecord { version: 3, payload: BASE64.encode(b"hi") };
        let record = decode_record(&key(), wire).unwrap();
        assert_eq!(record.payload, b"hi".to_vec());
        assert_eq!(record.version, 3);
        assert!(!record.local_dirty);

        let bad = WireRecord { version: 1, payload: "!!!".to_string() };
        assert!(matches!(decode_record(&key(), bad), Err(NetworkError::Decode(_))));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpBackend::new("not a url", Duration::from_secs(1)),
            Err(NetworkError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let backend = HttpBackend::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = backend.fetch(&key()).await.unwrap_err();
        assert!(matches!(err, NetworkError::Transient(_) | NetworkError::Timeout));
    }
}
