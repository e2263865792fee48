// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! WebSocket transport.
//!
//! One socket per topic at `{endpoint}/topics/{topic}?after={event_id}`.
//! The server sends each [`ChangeEvent`] as a JSON text frame.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::transport::{EventStream, Transport, TransportError};
use crate::record::{ChangeEvent, EventId};

#[derive(Clone)]
pub struct WsTransport {
    endpoint: String,
    token: Option<String>,
}

impl WsTransport {
    /// `endpoint` is the `ws://` or `wss://` base URL.
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn topic_url(&self, topic: &str, resume_after: Option<&EventId>) -> Result<reqwest::Url, TransportError> {
        let mut url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| TransportError::Connect(format!("bad endpoint: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| TransportError::Connect("endpoint cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["topics", topic]);
        if let Some(id) = resume_after {
            url.query_pairs_mut().append_pair("after", id.as_str());
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        topic: &str,
        resume_after: Option<&EventId>,
    ) -> Result<Box<dyn EventStream>, TransportError> {
        let url = self.topic_url(topic, resume_after)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(topic, "WebSocket connected");
        Ok(Box::new(WsStream { socket }))
    }
}

struct WsStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

/// Decode one text frame.
fn decode_frame(text: &str) -> Result<ChangeEvent, TransportError> {
    serde_json::from_str(text).map_err(|e| TransportError::Decode(e.to_string()))
}

#[async_trait]
impl EventStream for WsStream {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, TransportError> {
        loop {
            match self.socket.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::Disconnected(e.to_string())),
                Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                    Ok(event) => return Ok(Some(event)),
                    Err(e) => {
                        warn!(error = %e, "Skipping undecodable frame");
                        crate::metrics::record_realtime_event("decode_error");
                    }
                },
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_url_with_resume() {
        let ws = WsTransport::new("wss://sync.example.com/v1/", None);
        let url = ws.topic_url("conv 1", Some(&EventId::new("e-9"))).unwrap();
        assert_eq!(url.as_str(), "wss://sync.example.com/v1/topics/conv%201?after=e-9");
    }

    #[test]
    fn test_topic_url_without_resume() {
        let ws = WsTransport::new("ws://localhost:9000", None);
        let url = ws.topic_url("t", None).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:9000/topics/t");
    }

    #[test]
    fn test_decode_frame() {
        let frame = r#"{"event_id":"e1","topic":"t","key":{"owner":"o","entity_type":"doc","entity_id":"d"},"version":2,"payload":[1,2]}"#;
        let event = decode_frame(frame).unwrap();
        assert_eq!(event.version, 2);
        assert_eq!(event.payload, Some(vec![1, 2]));
        assert!(decode_frame("not json").is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        let ws = WsTransport::new("ws://127.0.0.1:1", None);
        assert!(matches!(ws.connect("t", None).await, Err(TransportError::Connect(_))));
    }
}
