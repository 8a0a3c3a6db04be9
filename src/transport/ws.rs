//! WebSocket wire: one JSON frame per text message, over tokio-tungstenite.

use crate::error::{ChatError, ChatResult};
use crate::transport::wire::{WireEvent, WireReceiver, WireSender};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsSender {
    sink: SplitSink<WsStream, WsMessage>,
}

pub struct WsReceiver {
    stream: SplitStream<WsStream>,
}

/// Open a websocket connection and split it into wire halves.
pub async fn connect(url: &str) -> ChatResult<(WsSender, WsReceiver)> {
    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| ChatError::Transport(format!("connect {url}: {e}")))?;
    let (sink, stream) = ws.split();
    Ok((WsSender { sink }, WsReceiver { stream }))
}

#[async_trait]
impl WireSender for WsSender {
    async fn send(&mut self, event: WireEvent) -> ChatResult<()> {
        let payload = serde_json::to_string(&event)?;
        self.sink
            .send(WsMessage::Text(payload.into()))
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))
    }
}

#[async_trait]
impl WireReceiver for WsReceiver {
    async fn recv(&mut self) -> ChatResult<Option<WireEvent>> {
        while let Some(frame) = self.stream.next().await {
            match frame.map_err(|e| ChatError::Transport(e.to_string()))? {
                WsMessage::Text(text) => {
                    let event = serde_json::from_str(text.as_str())?;
                    return Ok(Some(event));
                }
                WsMessage::Close(_) => return Ok(None),
                // Ping/pong are handled by the library; binary frames are
                // not part of the protocol.
                _ => continue,
            }
        }
        Ok(None)
    }
}
