// tracefork - Transaction Replay and Path Forensics
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Raw JSON-RPC transports
//!
//! A transport moves one JSON request to the node and hands back the parsed
//! JSON response envelope. Interpreting `result` / `error` is left to
//! [`NodeClient`](super::NodeClient).

use crate::{error::is_transport_limit_message, ReplayError};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::{fmt, time::Duration};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection to a node
#[derive(Debug)]
pub enum Transport {
    /// Request/response over HTTP(S)
    Http(HttpTransport),
    /// Long-lived WebSocket connection
    Ws(WsTransport),
}

impl Transport {
    /// Pick a transport from the URL scheme; WebSocket connections open lazily
    pub fn from_url(
        url: &str,
        timeout: Duration,
        max_response_bytes: Option<usize>,
    ) -> Result<Self, ReplayError> {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            Ok(Self::Ws(WsTransport::new(url)))
        } else if url.starts_with("http://") || url.starts_with("https://") {
            HttpTransport::new(url, timeout, max_response_bytes).map(Self::Http)
        } else {
            Err(ReplayError::Input(format!("unsupported node URL scheme: {url}")))
        }
    }

    /// Endpoint this transport talks to
    pub fn url(&self) -> &str {
        match self {
            Self::Http(http) => &http.url,
            Self::Ws(ws) => &ws.url,
        }
    }

    /// Send one request envelope and return the response envelope
    pub async fn send(&self, request: &Value) -> Result<Value, ReplayError> {
        match self {
            Self::Http(http) => http.send(request).await,
            Self::Ws(ws) => ws.send(request).await,
        }
    }
}

/// HTTP transport backed by a shared `reqwest` client
#[derive(Debug)]
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    max_response_bytes: Option<usize>,
}

impl HttpTransport {
    fn new(
        url: &str,
        timeout: Duration,
        max_response_bytes: Option<usize>,
    ) -> Result<Self, ReplayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplayError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { url: url.to_string(), client, max_response_bytes })
    }

    async fn send(&self, request: &Value) -> Result<Value, ReplayError> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| ReplayError::Transport(format!("request to {} failed: {e}", self.url)))?;

        let status = response.status();
        let body = match self.max_response_bytes {
            Some(limit) => read_capped(response, limit).await?,
            None => response.bytes().await.map_err(read_error)?.to_vec(),
        };

        // Some nodes answer JSON-RPC errors with a 4xx status; the envelope still counts.
        match serde_json::from_slice::<Value>(&body) {
            Ok(envelope) if envelope.is_object() => Ok(envelope),
            _ if !status.is_success() => {
                Err(ReplayError::Transport(format!("HTTP {status} from {}", self.url)))
            }
            Ok(other) => Err(ReplayError::Transport(format!("unexpected response: {other}"))),
            Err(e) => Err(ReplayError::Transport(format!("invalid JSON response: {e}"))),
        }
    }
}

/// Read a response body, giving up as soon as it grows past `limit` bytes
async fn read_capped(mut response: reqwest::Response, limit: usize) -> Result<Vec<u8>, ReplayError> {
    if let Some(declared) = response.content_length() {
        if declared > limit as u64 {
            return Err(ReplayError::TransportLimit(format!(
                "read limit exceeded: declared {declared} bytes > {limit}"
            )));
        }
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(read_error)? {
        if body.len() + chunk.len() > limit {
            return Err(ReplayError::TransportLimit(format!(
                "read limit exceeded: more than {limit} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn read_error(err: reqwest::Error) -> ReplayError {
    ReplayError::Transport(format!("failed to read response body: {err}"))
}

/// WebSocket transport carrying one in-flight request at a time
pub struct WsTransport {
    url: String,
    stream: Mutex<Option<WsStream>>,
}

impl fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsTransport").field("url", &self.url).finish_non_exhaustive()
    }
}

impl WsTransport {
    fn new(url: &str) -> Self {
        Self { url: url.to_string(), stream: Mutex::new(None) }
    }

    async fn send(&self, request: &Value) -> Result<Value, ReplayError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            debug!("Opening WebSocket connection to {}", self.url);
            let (stream, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| ReplayError::Transport(format!("websocket connect failed: {e}")))?;
            *guard = Some(stream);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(ReplayError::Transport("websocket connection unavailable".into()));
        };

        let result = exchange(stream, request).await;
        if result.is_err() {
            // The stream is in an unknown state; reconnect on next use.
            *guard = None;
        }
        result
    }
}

async fn exchange(stream: &mut WsStream, request: &Value) -> Result<Value, ReplayError> {
    let expected_id = request.get("id").cloned();
    stream.send(Message::text(request.to_string())).await.map_err(ws_error)?;

    while let Some(message) = stream.next().await {
        let message = message.map_err(ws_error)?;
        let text = match &message {
            Message::Text(_) | Message::Binary(_) => message.to_text().map_err(ws_error)?,
            Message::Close(frame) => {
                return Err(ReplayError::Transport(format!("websocket closed: {frame:?}")))
            }
            _ => continue,
        };
        let envelope: Value = serde_json::from_str(text)
            .map_err(|e| ReplayError::Transport(format!("invalid JSON frame: {e}")))?;
        if envelope.get("id").cloned() == expected_id {
            return Ok(envelope);
        }
        trace!("Skipping unrelated websocket frame");
    }
    Err(ReplayError::Transport("websocket stream ended".into()))
}

fn ws_error(err: tokio_tungstenite::tungstenite::Error) -> ReplayError {
    let message = err.to_string();
    if is_transport_limit_message(&message) {
        warn!("WebSocket frame exceeded limits: {message}");
        ReplayError::TransportLimit(message)
    } else {
        ReplayError::Transport(message)
    }
}
