use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use super::{ChannelConnector, ChannelLink, ConnectError, LinkClosed, OpenRequest};
use crate::auth::Token;
use crate::protocol::Handshake;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const SUBPROTOCOL: &str = "tty";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HANDSHAKE_GRACE: Duration = Duration::from_millis(250);
const CLOSE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub url: Url,
    pub connect_timeout: Duration,
    /// How long to watch for an immediate close after the handshake. A
    /// policy-violation close inside this window means the token was refused.
    pub handshake_grace: Duration,
}

impl WebSocketConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_grace: DEFAULT_HANDSHAKE_GRACE,
        }
    }

    /// `http://host/base/` becomes `ws://host/base/ws`, `https` becomes `wss`.
    pub fn for_base(base: &Url) -> Result<Self, ConnectError> {
        let scheme = match base.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ConnectError::InvalidEndpoint(format!(
                    "unsupported scheme '{other}'"
                )));
            }
        };
        let mut url = base.clone();
        url.set_scheme(scheme)
            .map_err(|_| ConnectError::InvalidEndpoint(format!("cannot use scheme {scheme}")))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        let mut url = url
            .join("ws")
            .map_err(|err| ConnectError::InvalidEndpoint(err.to_string()))?;
        url.set_query(base.query());
        Ok(Self::new(url))
    }
}

pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(
        &self,
        token: &Token,
        request: OpenRequest,
    ) -> Result<Box<dyn ChannelLink>, ConnectError> {
        let mut ws_request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectError::InvalidEndpoint(err.to_string()))?;
        ws_request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

        let (ws_stream, _) = timeout(self.config.connect_timeout, connect_async(ws_request))
            .await
            .map_err(|_| ConnectError::Transport("connect timed out".into()))?
            .map_err(|err| ConnectError::Transport(err.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let handshake = Handshake {
            auth_token: token.as_str().to_string(),
            columns: request.columns,
            rows: request.rows,
        };
        let text = serde_json::to_string(&handshake)
            .map_err(|err| ConnectError::Transport(err.to_string()))?;
        ws_sender
            .send(Message::Text(text))
            .await
            .map_err(|err| ConnectError::Transport(err.to_string()))?;

        let early = match timeout(self.config.handshake_grace, ws_receiver.next()).await {
            Err(_) => None,
            Ok(None) => {
                return Err(ConnectError::ClosedDuringHandshake("stream ended".into()));
            }
            Ok(Some(Err(err))) => return Err(ConnectError::Transport(err.to_string())),
            Ok(Some(Ok(Message::Close(frame)))) => return Err(classify_close(frame)),
            Ok(Some(Ok(message))) => message_bytes(message),
        };

        debug!(
            target = "webtty::transport",
            url = %self.config.url,
            early_frame = early.is_some(),
            "websocket channel established"
        );

        let (tx_out, rx_out) = mpsc::unbounded_channel::<Vec<u8>>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Some(frame) = early {
            let _ = tx_in.send(frame);
        }

        let connected = Arc::new(AtomicBool::new(true));
        let connected_task = connected.clone();
        let task = tokio::spawn(async move {
            handle_websocket(ws_sender, ws_receiver, rx_out, tx_in, connected_task).await;
        });

        Ok(Box::new(WebSocketLink {
            tx: Some(tx_out),
            rx: rx_in,
            connected,
            task: Some(task),
        }))
    }
}

fn classify_close(frame: Option<CloseFrame<'static>>) -> ConnectError {
    match frame {
        Some(frame) if frame.code == CloseCode::Policy => ConnectError::TokenRejected,
        Some(frame) => ConnectError::ClosedDuringHandshake(format!(
            "{}: {}",
            u16::from(frame.code),
            frame.reason
        )),
        None => ConnectError::ClosedDuringHandshake("no close frame".into()),
    }
}

fn message_bytes(message: Message) -> Option<Vec<u8>> {
    match message {
        Message::Binary(data) => Some(data),
        Message::Text(text) => Some(text.into_bytes()),
        _ => None,
    }
}

pub struct WebSocketLink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl ChannelLink for WebSocketLink {
    fn send(&self, frame: Vec<u8>) -> Result<(), LinkClosed> {
        if !self.is_connected() {
            return Err(LinkClosed);
        }
        self.tx
            .as_ref()
            .ok_or(LinkClosed)?
            .send(frame)
            .map_err(|_| LinkClosed)
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&mut self) {
        self.connected.store(false, Ordering::Release);
        // Dropping the sender lets the writer flush a close frame.
        self.tx.take();
        if let Some(mut task) = self.task.take() {
            if timeout(CLOSE_WAIT, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn handle_websocket(
    mut ws_sender: SplitSink<WsStream, Message>,
    mut ws_receiver: SplitStream<WsStream>,
    mut rx_out: mpsc::UnboundedReceiver<Vec<u8>>,
    tx_in: mpsc::UnboundedSender<Vec<u8>>,
    connected: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            outbound = rx_out.recv() => match outbound {
                Some(frame) => {
                    trace!(target = "webtty::transport", len = frame.len(), "ws send");
                    if let Err(err) = ws_sender.send(Message::Binary(frame)).await {
                        warn!(target = "webtty::transport", error = %err, "websocket send failed");
                        break;
                    }
                }
                None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        target = "webtty::transport",
                        reason = ?frame.map(|f| f.reason.into_owned()),
                        "remote closed websocket"
                    );
                    break;
                }
                Some(Ok(message)) => {
                    if let Some(frame) = message_bytes(message) {
                        if tx_in.send(frame).is_err() {
                            break;
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!(target = "webtty::transport", error = %err, "websocket receive failed");
                    break;
                }
                None => break,
            },
        }
    }
    connected.store(false, Ordering::Release);
}
