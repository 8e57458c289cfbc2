//! WebSocket [`Transport`] backed by `tokio-tungstenite`.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use feedmux_core::{FeedError, FrameSink, FrameStream, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` / `wss://` connections to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<(Box<dyn FrameSink>, FrameStream), FeedError> {
        tracing::info!(url = %self.url, "connecting via WebSocket");
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;

        let (sink, stream) = ws.split();
        let frames = stream
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Close(frame)) => Some(Err(FeedError::WebSocket(format!(
                        "closed by server: {frame:?}"
                    )))),
                    // Pings are answered by tungstenite; binary frames are not part of the protocol.
                    Ok(_) => None,
                    Err(e) => Some(Err(FeedError::WebSocket(e.to_string()))),
                }
            })
            .boxed();

        Ok((Box::new(WsSink { inner: sink }), frames))
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            tracing::debug!(error = %e, "WS close failed");
        }
    }
}
