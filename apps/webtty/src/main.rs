mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use webtty_core::auth::{
    CredentialProvider, HttpCredentialProvider, StaticCredentialProvider, TokenEndpointConfig,
};
use webtty_core::bridge::{BridgeEnvelope, BridgeHub, TrustPolicy};
use webtty_core::config::SessionConfig;
use webtty_core::display::TerminalSurface;
use webtty_core::session::{SessionController, SessionDeps, SessionEvent, SessionHandle};
use webtty_core::telemetry;
use webtty_core::transfer::FileBatch;
use webtty_core::transport::{WebSocketConfig, WebSocketConnector};

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = telemetry::init(&cli.logging.to_config()) {
        eprintln!("failed to initialise logging: {err}");
    }

    // stdin is read on a blocking thread that never returns on its own, so the
    // runtime is not left to wait for it.
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("webtty: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let interactive = std::io::stdin().is_terminal();
    let (columns, rows) = crossterm::terminal::size().unwrap_or((80, 24));

    let credentials: Arc<dyn CredentialProvider> = match cli.token.as_deref() {
        Some(token) => Arc::new(StaticCredentialProvider::new(token)),
        None => {
            let config = TokenEndpointConfig::for_base(&cli.url)
                .context("invalid token endpoint")?
                .with_basic_auth(cli.credential.as_deref());
            Arc::new(HttpCredentialProvider::new(config)?)
        }
    };
    let connector = WebSocketConnector::new(
        WebSocketConfig::for_base(&cli.url).context("invalid terminal endpoint")?,
    );
    let trust = if cli.allow_origins.is_empty() {
        TrustPolicy::AnyOrigin
    } else {
        TrustPolicy::allow_origins(cli.allow_origins.iter().cloned())
    };

    let hub = BridgeHub::new();
    let id = cli
        .id
        .clone()
        .unwrap_or_else(|| format!("terminal-{}", Uuid::new_v4()));
    let config = SessionConfig::new(id)
        .with_policy(cli.policy)
        .with_size(columns.max(1), rows.max(1));
    info!(
        target = "webtty::cli",
        url = %cli.url,
        policy = %cli.policy,
        columns,
        rows,
        "starting session"
    );

    let deps = SessionDeps {
        credentials,
        connector: Arc::new(connector),
        surface: Box::new(TerminalSurface::new(interactive)),
        bridge_hub: hub.clone(),
        trust,
    };
    let (handle, mut events) = SessionController::new(config, deps).start()?;

    if let Some(addr) = cli.bridge_listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind bridge listener on {addr}"))?;
        tokio::spawn(serve_bridge(listener, hub.clone()));
    }
    for payload in &cli.post_messages {
        hub.post(BridgeEnvelope::text(None, payload));
    }

    let handle = Arc::new(handle);
    tokio::spawn(pump_stdin(handle.clone()));
    #[cfg(unix)]
    tokio::spawn(forward_resizes(handle.clone()));

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(outcome) = on_event(&handle, event, &cli.uploads).await {
                        break outcome;
                    }
                }
                None => break Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                debug!(target = "webtty::cli", "interrupted");
                break Ok(());
            }
        }
    };

    handle.stop().await;
    outcome
}

/// Returns `Some` when the CLI should exit.
async fn on_event(
    handle: &SessionHandle,
    event: SessionEvent,
    uploads: &[PathBuf],
) -> Option<Result<()>> {
    match event {
        SessionEvent::StartupFailed(err) => {
            return Some(Err(anyhow::Error::new(err).context("session failed to start")));
        }
        SessionEvent::ChannelClosed => return Some(Ok(())),
        SessionEvent::FilePickerChanged(true) => {
            if uploads.is_empty() {
                warn!(
                    target = "webtty::cli",
                    "remote requested an upload but no --upload files were given"
                );
                let _ = handle.cancel_file_picker();
            } else {
                match FileBatch::from_paths(uploads).await {
                    Ok(batch) => {
                        let _ = handle.send_files(batch);
                    }
                    Err(err) => {
                        warn!(target = "webtty::cli", error = %err, "failed to read upload files");
                        let _ = handle.cancel_file_picker();
                    }
                }
            }
        }
        SessionEvent::TransferInterrupted(err) => {
            warn!(target = "webtty::cli", error = %err, "upload interrupted");
        }
        other => debug!(target = "webtty::cli", event = ?other, "session event"),
    }
    None
}

async fn pump_stdin(handle: Arc<SessionHandle>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 4096];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if handle.send_input(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(target = "webtty::cli", error = %err, "stdin read failed");
                break;
            }
        }
    }
}

#[cfg(unix)]
async fn forward_resizes(handle: Arc<SessionHandle>) {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut winch) = signal(SignalKind::window_change()) else {
        return;
    };
    while winch.recv().await.is_some() {
        if let Ok((columns, rows)) = crossterm::terminal::size() {
            if handle.resize(columns, rows).is_err() {
                break;
            }
        }
    }
}

/// Each line read from a connection is posted as one bridge message whose
/// origin is the peer address.
async fn serve_bridge(listener: TcpListener, hub: BridgeHub) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(target = "webtty::bridge", error = %err, "bridge accept failed");
                continue;
            }
        };
        let hub = hub.clone();
        tokio::spawn(async move {
            let origin = format!("tcp://{}", peer.ip());
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if !line.is_empty() {
                    hub.post(BridgeEnvelope::text(Some(&origin), line));
                }
            }
        });
    }
}
