//! Upstream WebSocket connection
//!
//! Writes go through a single send gate because the socket does not allow
//! concurrent writers. A reader task decodes inbound frames into
//! [`ServerEvent`]s and finishes with [`ServerEvent::Closed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use voice_bridge_config::RealtimeConfig;

use crate::dialect::{dialect_for, ProtocolDialect};
use crate::events::{ClientEvent, ServerEvent};
use crate::RealtimeError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound events buffered ahead of the orchestrator
const EVENT_CAPACITY: usize = 512;

/// Outbound half of an upstream connection
#[async_trait]
pub trait UpstreamSink: Send + Sync {
    /// Send one event; calls are serialized
    async fn send(&self, event: ClientEvent) -> Result<(), RealtimeError>;

    /// Close the connection; further sends fail
    async fn close(&self);
}

/// WebSocket connection to the speech service
pub struct RealtimeConnection {
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    dialect: Arc<dyn ProtocolDialect>,
    closed: AtomicBool,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeConnection {
    /// Connect within `handshake_timeout_ms`
    pub async fn connect(
        config: &RealtimeConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ServerEvent>), RealtimeError> {
        let budget = Duration::from_millis(config.handshake_timeout_ms);
        tokio::time::timeout(budget, Self::open(config))
            .await
            .map_err(|_| RealtimeError::HandshakeTimeout(config.handshake_timeout_ms))?
    }

    async fn open(
        config: &RealtimeConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ServerEvent>), RealtimeError> {
        let url = endpoint_url(config);
        let mut request = url.as_str().into_client_request()?;
        if let Some(key) = &config.api_key {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| RealtimeError::ConnectionFailed(format!("invalid api key: {}", e)))?;
            let headers = request.headers_mut();
            headers.insert("Authorization", bearer);
            headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;
        tracing::info!(url = %url, status = %response.status(), "Realtime connection established");

        let (writer, reader) = stream.split();
        let dialect: Arc<dyn ProtocolDialect> = Arc::from(dialect_for(config.dialect));
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let reader = tokio::spawn(read_loop(reader, dialect.clone(), tx));

        let connection = Arc::new(Self {
            writer: tokio::sync::Mutex::new(writer),
            dialect,
            closed: AtomicBool::new(false),
            reader: parking_lot::Mutex::new(Some(reader)),
        });
        Ok((connection, rx))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn endpoint_url(config: &RealtimeConfig) -> String {
    if config.url.contains("model=") || config.model.is_empty() {
        config.url.clone()
    } else if config.url.contains('?') {
        format!("{}&model={}", config.url, config.model)
    } else {
        format!("{}?model={}", config.url, config.model)
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    dialect: Arc<dyn ProtocolDialect>,
    tx: mpsc::Sender<ServerEvent>,
) {
    let reason = loop {
        let event = match stream.next().await {
            Some(Ok(Message::Text(text))) => match dialect.decode(text.as_str()) {
                Ok(ServerEvent::Ignored) => continue,
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Undecodable server event: {}", e);
                    continue;
                }
            },
            Some(Ok(Message::Binary(data))) => ServerEvent::AudioDelta {
                response_id: None,
                audio: data.to_vec(),
            },
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "closed by server".to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        };

        if tx.send(event).await.is_err() {
            return;
        }
    };

    tracing::info!(reason = %reason, "Realtime connection closed");
    let _ = tx.send(ServerEvent::Closed { reason }).await;
}

#[async_trait]
impl UpstreamSink for RealtimeConnection {
    async fn send(&self, event: ClientEvent) -> Result<(), RealtimeError> {
        if self.is_closed() {
            return Err(RealtimeError::ConnectionClosed);
        }
        let text = self.dialect.encode(&event)?;
        let mut writer = self.writer.lock().await;
        writer.send(Message::text(text)).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        tracing::debug!("Realtime connection closed locally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_appends_model() {
        let mut config = RealtimeConfig::default();
        config.url = "wss://example.test/v1/realtime".to_string();
        config.model = "m1".to_string();
        assert_eq!(endpoint_url(&config), "wss://example.test/v1/realtime?model=m1");

        config.url = "wss://example.test/v1/realtime?x=1".to_string();
        assert_eq!(endpoint_url(&config), "wss://example.test/v1/realtime?x=1&model=m1");

        config.url = "wss://example.test/v1/realtime?model=m2".to_string();
        assert_eq!(endpoint_url(&config), "wss://example.test/v1/realtime?model=m2");
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = RealtimeConfig {
            url: format!("ws://127.0.0.1:{}/", port),
            handshake_timeout_ms: 2000,
            ..RealtimeConfig::default()
        };
        let result = RealtimeConnection::connect(&config).await;
        assert!(matches!(result, Err(RealtimeError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        // accepts TCP but never answers the upgrade
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let config = RealtimeConfig {
            url: format!("ws://127.0.0.1:{}/", port),
            handshake_timeout_ms: 200,
            ..RealtimeConfig::default()
        };
        let result = RealtimeConnection::connect(&config).await;
        assert!(matches!(result, Err(RealtimeError::HandshakeTimeout(200))));
    }
}
