use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use url::Url;

use webtty_core::auth::{
    AuthError, CredentialProvider, HttpCredentialProvider, StaticCredentialProvider,
    TokenEndpointConfig,
};
use webtty_core::bridge::{BridgeEnvelope, BridgeHub, TrustPolicy};
use webtty_core::config::{DeferralPolicy, SessionConfig};
use webtty_core::mock::{Journal, JournalEntry, RecordingSurface};
use webtty_core::protocol::{ClientFrame, HostFrame, decode_client_frame, encode_host_frame};
use webtty_core::session::{
    SessionController, SessionDeps, SessionError, SessionEvent, SessionHandle, SessionState,
};
use webtty_core::transport::{ConnectError, WebSocketConfig, WebSocketConnector};

const WAIT: Duration = Duration::from_secs(5);
const GOOD_TOKEN: &str = "pty-token";

#[derive(Debug)]
enum Seen {
    Handshake(Value),
    Frame(ClientFrame),
    Closed,
}

#[derive(Clone)]
struct PtyServer {
    token_status: StatusCode,
    seen: mpsc::UnboundedSender<Seen>,
}

async fn issue_token(State(server): State<PtyServer>) -> Response {
    if server.token_status.is_success() {
        Json(json!({ "token": GOOD_TOKEN })).into_response()
    } else {
        (server.token_status, "token expired").into_response()
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(server): State<PtyServer>) -> Response {
    ws.protocols(["tty"])
        .on_upgrade(move |socket| serve_pty(socket, server))
}

async fn serve_pty(mut socket: WebSocket, server: PtyServer) {
    let Some(Ok(Message::Text(text))) = socket.recv().await else {
        return;
    };
    let handshake: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
    let accepted = handshake["AuthToken"] == GOOD_TOKEN;
    let _ = server.seen.send(Seen::Handshake(handshake));
    if !accepted {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1008,
                reason: "invalid token".into(),
            })))
            .await;
        return;
    }

    let greeting = [
        HostFrame::SetWindowTitle("remote shell".to_string()),
        HostFrame::Output(b"welcome\r\n".to_vec().into()),
    ];
    for frame in greeting {
        if socket
            .send(Message::Binary(encode_host_frame(&frame)))
            .await
            .is_err()
        {
            return;
        }
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Binary(data) => {
                let Ok(frame) = decode_client_frame(&data) else {
                    continue;
                };
                if let ClientFrame::Input(bytes) = &frame {
                    let echo = encode_host_frame(&HostFrame::Output(bytes.clone()));
                    let _ = socket.send(Message::Binary(echo)).await;
                }
                let _ = server.seen.send(Seen::Frame(frame));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    let _ = server.seen.send(Seen::Closed);
}

async fn spawn_server(token_status: StatusCode) -> (Url, mpsc::UnboundedReceiver<Seen>) {
    let (seen, seen_rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/token", get(issue_token))
        .route("/ws", get(upgrade))
        .with_state(PtyServer { token_status, seen });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (Url::parse(&format!("http://{addr}/")).unwrap(), seen_rx)
}

fn start_session(
    base: &Url,
    credentials: Arc<dyn CredentialProvider>,
    policy: DeferralPolicy,
    surface: RecordingSurface,
    hub: &BridgeHub,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let connector = WebSocketConnector::new(WebSocketConfig::for_base(base).unwrap());
    let deps = SessionDeps {
        credentials,
        connector: Arc::new(connector),
        surface: Box::new(surface),
        bridge_hub: hub.clone(),
        trust: TrustPolicy::AnyOrigin,
    };
    let config = SessionConfig::new("terminal")
        .with_policy(policy)
        .with_size(100, 30);
    SessionController::new(config, deps).start().unwrap()
}

fn http_credentials(base: &Url) -> Arc<dyn CredentialProvider> {
    let config = TokenEndpointConfig::for_base(base).unwrap();
    Arc::new(HttpCredentialProvider::new(config).unwrap())
}

async fn next_seen(seen: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    timeout(WAIT, seen.recv())
        .await
        .expect("server saw nothing")
        .expect("server gone")
}

async fn next_frame(seen: &mut mpsc::UnboundedReceiver<Seen>) -> ClientFrame {
    loop {
        if let Seen::Frame(frame) = next_seen(seen).await {
            return frame;
        }
    }
}

async fn wait_for_output(surface: &RecordingSurface, needle: &str) {
    timeout(WAIT, async {
        while !String::from_utf8_lossy(&surface.output()).contains(needle) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("expected output never reached the surface");
}

#[test_timeout::tokio_timeout_test]
async fn gated_session_round_trips_over_websocket() {
    let (base, mut seen) = spawn_server(StatusCode::OK).await;
    let journal = Journal::new();
    let surface = RecordingSurface::new(journal.clone());
    let hub = BridgeHub::new();
    let (handle, _events) = start_session(
        &base,
        http_credentials(&base),
        DeferralPolicy::GateAttach,
        surface.clone(),
        &hub,
    );

    match next_seen(&mut seen).await {
        Seen::Handshake(handshake) => {
            assert_eq!(handshake["AuthToken"], GOOD_TOKEN);
            assert_eq!(handshake["columns"], 100);
            assert_eq!(handshake["rows"], 30);
        }
        other => panic!("expected handshake, got {other:?}"),
    }
    timeout(
        WAIT,
        handle.wait_for(|s| s.state == SessionState::ChannelPreOpened),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(surface.attach_calls(), 0);

    hub.post(BridgeEnvelope::text(None, "?arg=ls&arg=-la"));
    assert_eq!(
        next_frame(&mut seen).await,
        ClientFrame::InjectArguments(vec!["ls".to_string(), "-la".to_string()])
    );
    wait_for_output(&surface, "welcome").await;
    assert_eq!(
        journal.count(|e| *e == JournalEntry::Title("remote shell".to_string())),
        1
    );

    handle.send_input(&b"whoami\r"[..]).unwrap();
    assert_eq!(
        next_frame(&mut seen).await,
        ClientFrame::Input(b"whoami\r".to_vec().into())
    );
    wait_for_output(&surface, "whoami").await;

    hub.post(BridgeEnvelope::text(None, "?arg=pwd"));
    assert_eq!(
        next_frame(&mut seen).await,
        ClientFrame::UpdateArguments(vec!["pwd".to_string()])
    );
    assert_eq!(surface.attach_calls(), 1);

    handle.stop().await;
    loop {
        if matches!(next_seen(&mut seen).await, Seen::Closed) {
            break;
        }
    }
    assert_eq!(surface.dispose_calls(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn refused_token_is_reported_as_startup_failure() {
    let (base, mut seen) = spawn_server(StatusCode::OK).await;
    let surface = RecordingSurface::default();
    let hub = BridgeHub::new();
    let (handle, mut events) = start_session(
        &base,
        Arc::new(StaticCredentialProvider::new("stale")),
        DeferralPolicy::Immediate,
        surface.clone(),
        &hub,
    );

    assert!(matches!(next_seen(&mut seen).await, Seen::Handshake(_)));
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(
        event,
        SessionEvent::StartupFailed(SessionError::Connect(ConnectError::TokenRejected))
    ));
    assert_eq!(handle.snapshot().state, SessionState::Uninitialized);
    assert_eq!(surface.attach_calls(), 0);

    handle.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn token_endpoint_rejection_never_opens_the_channel() {
    let (base, mut seen) = spawn_server(StatusCode::UNAUTHORIZED).await;
    let surface = RecordingSurface::default();
    let hub = BridgeHub::new();
    let (handle, mut events) = start_session(
        &base,
        http_credentials(&base),
        DeferralPolicy::Immediate,
        surface.clone(),
        &hub,
    );

    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    match event {
        SessionEvent::StartupFailed(SessionError::Auth(AuthError::Rejected { status, detail })) => {
            assert_eq!(status, 401);
            assert_eq!(detail, "token expired");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(seen.try_recv().is_err());
    assert_eq!(surface.attach_calls(), 0);

    handle.stop().await;
}
