use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::GatewayError;

/// Inbound traffic from one socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Text(String),
    /// The socket is gone. `code` is absent when the transport failed
    /// without a close frame.
    Closed { code: Option<u16>, reason: String },
}

/// Outbound instructions for one socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketCommand {
    Text(String),
    Close { code: u16 },
}

/// Channel pair standing in for an open socket. The shard never touches
/// the transport directly.
#[derive(Debug)]
pub struct SocketHandle {
    pub tx: mpsc::UnboundedSender<SocketCommand>,
    pub rx: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketHandle {
    /// Build a connected pair: the handle for the shard and the far ends for
    /// whoever drives the transport.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<SocketCommand>,
        mpsc::UnboundedSender<SocketEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: cmd_tx,
                rx: event_rx,
            },
            cmd_rx,
            event_tx,
        )
    }
}

/// Opens gateway sockets.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<SocketHandle, GatewayError>>;
}

/// Websocket connector backed by `tokio-tungstenite`. Each socket gets a
/// pump task bridging it to the handle's channels.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<SocketHandle, GatewayError>> {
        Box::pin(async move {
            let (ws, _) = connect_async(url.as_str()).await?;
            let (handle, commands, events) = SocketHandle::pair();
            tokio::spawn(pump(ws, commands, events));
            Ok(handle)
        })
    }
}

async fn pump<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::UnboundedSender<SocketEvent>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_sink, mut ws_stream) = ws.split();

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(SocketCommand::Text(text)) => {
                        if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                            let _ = events.send(SocketEvent::Closed { code: None, reason: e.to_string() });
                            return;
                        }
                    }
                    Some(SocketCommand::Close { code }) => {
                        let frame = CloseFrame { code: CloseCode::from(code), reason: "".into() };
                        let _ = ws_sink.send(Message::Close(Some(frame))).await;
                        return;
                    }
                    // shard dropped the handle
                    None => {
                        let _ = ws_sink.close().await;
                        return;
                    }
                }
            }
            msg = ws_stream.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => SocketEvent::Text(text.as_str().to_string()),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => SocketEvent::Text(text),
                        Err(_) => {
                            tracing::warn!("dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_string()))
                            .unwrap_or((None, String::new()));
                        let _ = events.send(SocketEvent::Closed { code, reason });
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = events.send(SocketEvent::Closed { code: None, reason: e.to_string() });
                        return;
                    }
                    None => {
                        let _ = events.send(SocketEvent::Closed { code: None, reason: "stream ended".to_string() });
                        return;
                    }
                };
                if events.send(event).is_err() {
                    return;
                }
            }
        }
    }
}
