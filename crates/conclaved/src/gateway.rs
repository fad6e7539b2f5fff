//! Typed message gateway over a single websocket.
//!
//! Every frame is JSON. A frame that decodes strictly as
//! [`ControlClose`] ends the conversation and carries the reason, so a
//! shutdown reason is never limited to the 125 bytes of a native close
//! frame.
//!
//! ```text
//!   write() ──► writer lock ──► sink ─────────► peer
//!   receive() ◄── reader channel ◄── read loop ◄── peer
//!                         watcher: ctx done ─► ControlClose + close sink
//! ```

use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

use conclave_common::ControlClose;

use crate::context::{Cause, Context};

type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway is closed; carries the reason
    #[error("{0}")]
    Closed(Cause),

    #[error("Failed to write to websocket: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("Failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unexpected websocket frame")]
    UnexpectedFrame,
}

impl GatewayError {
    /// Text suitable for a close reason or an operator message
    pub fn cause(&self) -> Cause {
        match self {
            Self::Closed(cause) => cause.clone(),
            other => Cause::new(other.to_string()),
        }
    }
}

/// Bidirectional JSON messaging over one websocket
pub struct Gateway {
    ctx: Context,
    writer: Arc<Mutex<FrameSink>>,
    reader: Mutex<mpsc::Receiver<Message>>,
}

impl Gateway {
    /// Take ownership of `ws`. The gateway lives until `parent` is
    /// cancelled, the transport fails, or the peer sends a close.
    pub fn new<S>(parent: &Context, ws: WebSocketStream<S>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = parent.child();
        let (sink, stream) = ws.split();
        let writer: Arc<Mutex<FrameSink>> = Arc::new(Mutex::new(Box::pin(sink)));
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(read_loop(parent.clone(), ctx.clone(), Box::pin(stream), tx));
        tokio::spawn(watch(ctx.clone(), writer.clone()));

        Arc::new(Self {
            ctx,
            writer,
            reader: Mutex::new(rx),
        })
    }

    /// Lifetime context of this gateway
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Serialize `value` and send it as one text frame
    pub async fn write<T: Serialize>(&self, value: &T) -> Result<(), GatewayError> {
        if let Some(cause) = self.ctx.cause() {
            return Err(GatewayError::Closed(cause));
        }

        let text = serde_json::to_string(value)?;
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(text.into())).await?;

        Ok(())
    }

    /// Send a close carrying `cause`, then wait for the peer to hang up
    pub async fn write_close(&self, cause: impl Into<Cause>) -> Result<(), GatewayError> {
        let cause = cause.into();
        if !self.ctx.is_cancelled() {
            let text = serde_json::to_string(&ControlClose {
                control_message: cause.to_string(),
            })?;

            let mut writer = self.writer.lock().await;
            writer.send(Message::Text(text.into())).await?;
        }

        self.ctx.cancelled().await;
        Ok(())
    }

    /// Next raw frame
    pub async fn receive(&self) -> Result<Message, GatewayError> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            msg = reader.recv() => msg.ok_or_else(|| self.closed()),
            _ = self.ctx.cancelled() => Err(self.closed()),
        }
    }

    /// Next frame decoded as `T`, racing this gateway and `ctx`
    pub async fn receive_with_context<T: DeserializeOwned>(
        &self,
        ctx: &Context,
    ) -> Result<T, GatewayError> {
        let mut reader = self.reader.lock().await;
        let msg = tokio::select! {
            msg = reader.recv() => msg.ok_or_else(|| self.closed())?,
            _ = self.ctx.cancelled() => return Err(self.closed()),
            cause = ctx.done() => return Err(GatewayError::Closed(cause)),
        };

        decode(msg)
    }

    /// Next frame decoded as `T`
    pub async fn receive_as<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        decode(self.receive().await?)
    }

    fn closed(&self) -> GatewayError {
        GatewayError::Closed(self.ctx.cause().unwrap_or_else(|| Cause::new("Connection closed")))
    }
}

fn decode<T: DeserializeOwned>(msg: Message) -> Result<T, GatewayError> {
    match msg {
        Message::Text(text) => Ok(serde_json::from_str(text.as_str())?),
        Message::Binary(bytes) => Ok(serde_json::from_slice(&bytes)?),
        _ => Err(GatewayError::UnexpectedFrame),
    }
}

async fn read_loop(
    parent: Context,
    ctx: Context,
    mut stream: FrameStream,
    tx: mpsc::Sender<Message>,
) {
    loop {
        let next = tokio::select! {
            _ = ctx.cancelled() => return,
            next = stream.next() => next,
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                // A cancelled caller explains the broken transport better than the transport does.
                let cause = parent
                    .cause()
                    .unwrap_or_else(|| Cause::new(format!("Failed to read from websocket: {e}")));
                ctx.cancel(cause);
                return;
            }
            None => {
                ctx.cancel(parent.cause().unwrap_or_else(|| Cause::new("Connection closed")));
                return;
            }
        };

        match &msg {
            Message::Text(text) => {
                if let Ok(close) = serde_json::from_str::<ControlClose>(text.as_str()) {
                    tracing::debug!(reason = %close.control_message, "Received control close");
                    ctx.cancel(close.control_message);
                    return;
                }
            }
            Message::Close(frame) => {
                let reason = frame
                    .as_ref()
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "Connection closed".to_string());
                ctx.cancel(reason);
                return;
            }
            Message::Binary(_) => {}
            _ => continue,
        }

        tokio::select! {
            _ = ctx.cancelled() => return,
            sent = tx.send(msg) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

async fn watch(ctx: Context, writer: Arc<Mutex<FrameSink>>) {
    let cause = ctx.done().await;

    let mut writer = writer.lock().await;
    if let Ok(text) = serde_json::to_string(&ControlClose {
        control_message: cause.to_string(),
    }) {
        let _ = writer.send(Message::Text(text.into())).await;
    }
    let _ = writer.close().await;

    tracing::debug!(cause = %cause, "Gateway closed");
}
