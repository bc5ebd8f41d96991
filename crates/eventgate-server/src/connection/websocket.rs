//! Duplex variant over an upgraded WebSocket.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use eventgate_core::{CloseCode, GatewayError, Message, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Connection, ConnectionCore, ConnectionKind, FrameWriter};
use crate::config::GatewayConfig;
use crate::handler::Handler;

/// Error message for a frame that could not be decoded.
pub const INVALID_PAYLOAD: &str = "Invalid Payload";

struct WsFrameWriter {
    sink: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn write_message(&mut self, message: &Message) -> Result<()> {
        let json = message.to_json()?;
        self.sink
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(GatewayError::transport)
    }

    async fn write_close(&mut self, code: CloseCode) -> Result<()> {
        let frame = CloseFrame {
            code: code.code(),
            reason: code.reason().into(),
        };
        self.sink
            .send(WsMessage::Close(Some(frame)))
            .await
            .map_err(GatewayError::transport)
    }
}

/// A WebSocket client connection.
pub struct WebSocketConnection {
    core: Arc<ConnectionCore>,
}

impl WebSocketConnection {
    /// Greet the client and start the heartbeat, delivery and read tasks.
    ///
    /// The connection is ready when this returns. A failed greeting is a
    /// setup error and the socket is dropped.
    pub async fn start(
        socket: WebSocket,
        handler: Arc<Handler>,
        config: &GatewayConfig,
    ) -> Result<Arc<Self>> {
        let (sink, stream) = socket.split();
        let core = Arc::new(ConnectionCore::new(
            ConnectionKind::Duplex,
            Box::new(WsFrameWriter { sink }),
            handler,
            config,
        )?);

        core.greet().await?;
        core.spawn_heartbeat();
        core.spawn_delivery();
        let _ = tokio::spawn(run_read_loop(Arc::clone(&core), stream));

        if !core.mark_ready() {
            return Err(GatewayError::setup("connection closed during handshake"));
        }
        info!(session_id = %core.session_id(), "websocket client connected");
        Ok(Arc::new(Self { core }))
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }
}

async fn run_read_loop(core: Arc<ConnectionCore>, mut stream: SplitStream<WebSocket>) {
    let ctx = core.context_token().clone();
    loop {
        let frame = tokio::select! {
            () = ctx.cancelled() => break,
            frame = stream.next() => frame,
        };
        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text.as_str().to_owned(),
            Some(Ok(WsMessage::Binary(data))) => {
                if let Ok(text) = std::str::from_utf8(&data) {
                    text.to_string()
                } else {
                    core.send_error(INVALID_PAYLOAD, BTreeMap::new()).await;
                    continue;
                }
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            Some(Ok(WsMessage::Close(_))) => {
                debug!(session_id = %core.session_id(), "client sent close frame");
                break;
            }
            Some(Err(error)) => {
                debug!(session_id = %core.session_id(), %error, "websocket read failed");
                break;
            }
            None => break,
        };

        if let Err(error) = handle_frame(&core, &text).await {
            if error.is_fatal() {
                warn!(session_id = %core.session_id(), %error, "closing after transport failure");
                break;
            }
            debug!(session_id = %core.session_id(), %error, "command failed");
        }
    }

    core.mark_drained();
    core.close(CloseCode::Normal, Duration::ZERO).await;
}

/// Decode one client frame and apply it.
pub(crate) async fn handle_frame(core: &ConnectionCore, text: &str) -> Result<()> {
    let message = match Message::from_client_json(text) {
        Ok(message) => message,
        Err(error) => {
            let fields = BTreeMap::from([("error".to_string(), json!(error.to_string()))]);
            core.send_error(INVALID_PAYLOAD, fields).await;
            return Ok(());
        }
    };

    let handler = core.handler();
    match message {
        Message::Subscribe(payload) => handler.subscribe(core, payload).await.map(drop),
        Message::Unsubscribe(payload) => handler.unsubscribe(core, payload).await.map(drop),
        Message::Resume(_) => handler.resume(core).await.map(drop),
        other => {
            let fields = BTreeMap::from([("op".to_string(), json!(other.opcode().name()))]);
            core.send_error(CloseCode::UnknownOperation.reason(), fields)
                .await;
            Ok(())
        }
    }
}
