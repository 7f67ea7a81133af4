//! Session lifecycle: token, channel, display attachment and argument
//! injection for one terminal session.
//!
//! [`SessionController::start`] spawns the controller task and returns a
//! [`SessionHandle`] plus the [`SessionEvent`] stream. All work for the
//! session (bridge messages, input, resizes, uploads, channel traffic) is
//! handled one event at a time on that task, so a bridge message that arrives
//! while the controller is still waiting on the token or the channel is
//! handled only after that wait finishes.

mod controller;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::auth::{AuthError, CredentialProvider};
use crate::bridge::{BridgeEnvelope, BridgeHub, BridgeListener, TrustPolicy};
use crate::channel::{ChannelError, ChannelState};
use crate::config::{ConfigError, SessionConfig};
use crate::display::DisplaySurface;
use crate::protocol::ArgumentBatch;
use crate::transfer::{FileBatch, TransferError, TransferSummary};
use crate::transport::{ChannelConnector, ConnectError};

use controller::Controller;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    /// Gated policies: waiting for a bridge message.
    AwaitingGate,
    /// Immediate policy, or a gate that resolved: token and channel in flight.
    Opening,
    /// `gate-attach`: the channel is open, the display is not attached yet.
    ChannelPreOpened,
    Attached,
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub initialized: bool,
    pub pending_args: Option<ArgumentBatch>,
    pub channel: ChannelState,
    pub picker_open: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Uninitialized,
            initialized: false,
            pending_args: None,
            channel: ChannelState::Idle,
            picker_open: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("channel connect failed: {0}")]
    Connect(#[from] ConnectError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("session stopped")]
    Stopped,
}

/// Reported to the embedding UI layer. Nothing is sent after `stop`.
#[derive(Debug)]
pub enum SessionEvent {
    Attached,
    StartupFailed(SessionError),
    ArgumentsInjected(ArgumentBatch),
    ArgumentsUpdated(ArgumentBatch),
    TitleChanged(String),
    Preferences(serde_json::Map<String, serde_json::Value>),
    FilePickerChanged(bool),
    TransferCompleted(TransferSummary),
    TransferInterrupted(TransferError),
    ChannelClosed,
}

/// Collaborators the controller drives.
pub struct SessionDeps {
    pub credentials: Arc<dyn CredentialProvider>,
    pub connector: Arc<dyn ChannelConnector>,
    pub surface: Box<dyn DisplaySurface>,
    pub bridge_hub: BridgeHub,
    pub trust: TrustPolicy,
}

#[derive(Debug)]
enum SessionCommand {
    Bridge(BridgeEnvelope),
    Initialize,
    Input(Bytes),
    Resize { columns: u16, rows: u16 },
    SendFiles(FileBatch),
    SetFilePicker(bool),
    Settle(oneshot::Sender<()>),
}

pub struct SessionController {
    config: SessionConfig,
    deps: SessionDeps,
}

impl SessionController {
    pub fn new(config: SessionConfig, deps: SessionDeps) -> Self {
        Self { config, deps }
    }

    /// Registers with the bridge hub and spawns the controller task, which
    /// immediately runs the start sequence for the configured policy.
    ///
    /// Must be called inside a tokio runtime. Startup failures are reported
    /// as [`SessionEvent::StartupFailed`]; only configuration errors are
    /// returned here.
    pub fn start(
        self,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        self.config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let bridge_tx = command_tx.clone();
        let listener: BridgeListener = Arc::new(move |envelope| {
            let _ = bridge_tx.send(SessionCommand::Bridge(envelope));
        });
        self.deps.bridge_hub.add_listener(listener.clone());

        let id = self.config.id.clone();
        let controller = Controller::new(
            self.config,
            self.deps,
            listener,
            event_tx,
            snapshot_tx,
            shutdown_rx,
        );
        let task = tokio::spawn(controller.run(command_rx));

        Ok((
            SessionHandle {
                id,
                commands: command_tx,
                shutdown: shutdown_tx,
                snapshot: snapshot_rx,
                task: Mutex::new(Some(task)),
            },
            event_rx,
        ))
    }
}

/// Owner-side control of a running session. Dropping it stops the session
/// without waiting for teardown.
pub struct SessionHandle {
    id: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    shutdown: watch::Sender<bool>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Resolves once a snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<SessionSnapshot, SessionError>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        rx.wait_for(predicate)
            .await
            .map(|snapshot| snapshot.clone())
            .map_err(|_| SessionError::Stopped)
    }

    fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Stopped)
    }

    /// Runs the initialization sequence now. A no-op once initialized.
    pub fn initialize(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::Initialize)
    }

    pub fn send_input(&self, bytes: impl Into<Bytes>) -> Result<(), SessionError> {
        self.command(SessionCommand::Input(bytes.into()))
    }

    pub fn resize(&self, columns: u16, rows: u16) -> Result<(), SessionError> {
        self.command(SessionCommand::Resize { columns, rows })
    }

    /// Closes the picker and uploads `batch`.
    pub fn send_files(&self, batch: FileBatch) -> Result<(), SessionError> {
        self.command(SessionCommand::SendFiles(batch))
    }

    pub fn open_file_picker(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::SetFilePicker(true))
    }

    pub fn cancel_file_picker(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::SetFilePicker(false))
    }

    /// Waits until every command sent before this call has been handled.
    pub async fn settle(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.command(SessionCommand::Settle(tx))?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Deregisters from the bridge, closes the channel and disposes the
    /// display. Safe in every state, including while the start sequence is
    /// still waiting on the token or the channel. Later calls return at once.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
