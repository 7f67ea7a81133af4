use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    SessionCommand, SessionDeps, SessionError, SessionEvent, SessionSnapshot, SessionState,
};
use crate::auth::CredentialProvider;
use crate::bridge::{BridgeEnvelope, BridgeHub, BridgeListener, BridgeOutcome, CrossContextBridge};
use crate::channel::{ChannelAdapter, ChannelEvent, ChannelState};
use crate::config::SessionConfig;
use crate::display::{DisplaySurface, SurfaceNotice};
use crate::protocol::{ArgumentBatch, ClientFrame};
use crate::transfer::{FileBatch, FileTransferCoordinator, TransferError};
use crate::transport::{ChannelConnector, OpenRequest};

type SharedSurface = Arc<Mutex<Box<dyn DisplaySurface>>>;

pub(super) struct Controller {
    config: SessionConfig,
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn ChannelConnector>,
    surface: SharedSurface,
    bridge: CrossContextBridge,
    hub: BridgeHub,
    listener: BridgeListener,
    channel: ChannelAdapter,
    transfers: FileTransferCoordinator,
    state: SessionState,
    initialized: bool,
    attached: bool,
    pending_args: Option<ArgumentBatch>,
    picker_open: bool,
    title: Option<String>,
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    shutdown: watch::Receiver<bool>,
}

impl Controller {
    pub(super) fn new(
        config: SessionConfig,
        deps: SessionDeps,
        listener: BridgeListener,
        events: mpsc::UnboundedSender<SessionEvent>,
        snapshot: watch::Sender<SessionSnapshot>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let channel = ChannelAdapter::new(config.max_pending_bytes);
        let transfers = FileTransferCoordinator::new(config.chunk_size);
        Self {
            credentials: deps.credentials,
            connector: deps.connector,
            surface: Arc::new(Mutex::new(deps.surface)),
            bridge: CrossContextBridge::new(deps.trust),
            hub: deps.bridge_hub,
            listener,
            channel,
            transfers,
            state: SessionState::Uninitialized,
            initialized: false,
            attached: false,
            pending_args: None,
            picker_open: false,
            title: None,
            events,
            snapshot,
            shutdown,
            config,
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        info!(
            target = "webtty::session",
            session_id = %self.config.id,
            policy = %self.config.deferral_policy,
            "session mounted"
        );
        self.mount().await;

        while self.is_mounted() {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                event = self.channel.recv() => self.on_channel_event(event),
            }
            self.publish();
        }

        self.teardown().await;
    }

    fn is_mounted(&self) -> bool {
        !*self.shutdown.borrow() && self.shutdown.has_changed().is_ok()
    }

    async fn mount(&mut self) {
        let policy = self.config.deferral_policy;
        if !policy.is_gated() {
            if let Err(err) = self.initialize_terminal().await {
                self.startup_failed(err);
            }
        } else {
            self.set_state(SessionState::AwaitingGate);
            if policy.opens_on_start() {
                match self.open_channel().await {
                    Ok(()) => self.set_state(SessionState::ChannelPreOpened),
                    Err(err) => self.startup_failed(err),
                }
            }
        }
        self.publish();
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Bridge(envelope) => self.on_bridge_message(envelope).await,
            SessionCommand::Initialize => {
                if let Err(err) = self.initialize_terminal().await {
                    self.startup_failed(err);
                }
            }
            SessionCommand::Input(bytes) => {
                if !self.attached || !self.channel.is_open() {
                    debug!(
                        target = "webtty::session",
                        len = bytes.len(),
                        "dropping input before attach"
                    );
                    return;
                }
                if let Err(err) = self.channel.send(&ClientFrame::Input(bytes)) {
                    debug!(target = "webtty::session", error = %err, "input not sent");
                }
            }
            SessionCommand::Resize { columns, rows } => self.resize(columns, rows),
            SessionCommand::SendFiles(batch) => self.send_files(batch).await,
            SessionCommand::SetFilePicker(open) => self.set_picker(open),
            SessionCommand::Settle(reply) => {
                self.publish();
                let _ = reply.send(());
            }
        }
    }

    /// Refreshes the token and opens the channel. A fresh adapter replaces
    /// one whose link has already ended.
    async fn open_channel(&mut self) -> Result<(), SessionError> {
        if self.channel.is_open() {
            return Ok(());
        }
        if self.channel.state() != ChannelState::Idle {
            self.channel.close().await;
            self.channel = ChannelAdapter::new(self.config.max_pending_bytes);
        }

        let credentials = self.credentials.clone();
        let token = until_shutdown(&mut self.shutdown, credentials.refresh())
            .await
            .ok_or(SessionError::Stopped)??;
        if !self.is_mounted() {
            return Err(SessionError::Stopped);
        }

        let request = OpenRequest {
            columns: self.config.display.columns,
            rows: self.config.display.rows,
        };
        let connector = self.connector.clone();
        let opened = until_shutdown(
            &mut self.shutdown,
            self.channel.open(connector.as_ref(), &token, request),
        )
        .await;
        match opened {
            None => Err(SessionError::Stopped),
            Some(Err(err)) => Err(err.into()),
            Some(Ok(())) => Ok(()),
        }
    }

    /// Opens the channel if needed, injects pending arguments, then attaches
    /// the display. A no-op once initialized.
    async fn initialize_terminal(&mut self) -> Result<(), SessionError> {
        if self.initialized {
            return Ok(());
        }
        if !self.channel.is_open() {
            self.set_state(SessionState::Opening);
            self.publish();
            self.open_channel().await?;
        }
        if !self.is_mounted() {
            return Err(SessionError::Stopped);
        }

        if let Some(args) = self.pending_args.take() {
            if let Err(err) = self.channel.send(&ClientFrame::InjectArguments(args.clone())) {
                self.pending_args = Some(args);
                return Err(err.into());
            }
            info!(
                target = "webtty::session",
                session_id = %self.config.id,
                args = ?args,
                "injected arguments"
            );
            self.emit(SessionEvent::ArgumentsInjected(args));
        }

        self.attach_surface();
        self.initialized = true;
        self.set_state(SessionState::Attached);
        self.emit(SessionEvent::Attached);
        Ok(())
    }

    fn attach_surface(&mut self) {
        if self.attached {
            return;
        }
        {
            let mut surface = self.surface.lock();
            surface.attach(&self.config.id);
            if let Some(title) = self.title.as_deref() {
                surface.set_title(title);
            }
        }
        self.attached = true;

        let surface = self.surface.clone();
        self.channel
            .on_receive(Box::new(move |bytes: &[u8]| surface.lock().write(bytes)));
        debug!(
            target = "webtty::session",
            session_id = %self.config.id,
            dropped = self.channel.dropped_frames(),
            "display attached"
        );
    }

    async fn on_bridge_message(&mut self, envelope: BridgeEnvelope) {
        let args = match self.bridge.parse(&envelope) {
            BridgeOutcome::Arguments(args) => args,
            BridgeOutcome::Ignored(reason) => {
                debug!(
                    target = "webtty::bridge",
                    origin = ?envelope.origin,
                    ?reason,
                    "ignoring bridge message"
                );
                return;
            }
        };
        info!(
            target = "webtty::bridge",
            session_id = %self.config.id,
            args = ?args,
            "received arguments"
        );

        if self.initialized {
            match self.channel.send(&ClientFrame::UpdateArguments(args.clone())) {
                Ok(()) => self.emit(SessionEvent::ArgumentsUpdated(args)),
                Err(err) => warn!(
                    target = "webtty::session",
                    error = %err,
                    "argument update not delivered"
                ),
            }
            return;
        }

        self.pending_args = Some(args);
        if self.config.deferral_policy.is_gated() {
            if let Err(err) = self.initialize_terminal().await {
                self.startup_failed(err);
            }
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Output => {}
            ChannelEvent::Title(title) => {
                if self.attached {
                    self.surface.lock().set_title(&title);
                }
                self.title = Some(title.clone());
                self.emit(SessionEvent::TitleChanged(title));
            }
            ChannelEvent::Preferences(prefs) => self.emit(SessionEvent::Preferences(prefs)),
            ChannelEvent::UploadRequested => self.set_picker(true),
            ChannelEvent::Malformed(err) => {
                warn!(target = "webtty::channel", error = %err, "dropping malformed frame");
            }
            ChannelEvent::Closed => {
                info!(
                    target = "webtty::session",
                    session_id = %self.config.id,
                    attached = self.attached,
                    "channel closed by remote"
                );
                if self.attached {
                    self.surface
                        .lock()
                        .notice(&SurfaceNotice::ConnectionClosed { reason: None });
                }
                self.emit(SessionEvent::ChannelClosed);
            }
        }
    }

    fn resize(&mut self, columns: u16, rows: u16) {
        if columns == 0 || rows == 0 {
            return;
        }
        self.config.display.columns = columns;
        self.config.display.rows = rows;
        if self.attached {
            self.surface.lock().resize(columns, rows);
        }
        if self.channel.is_open() {
            if let Err(err) = self.channel.send(&ClientFrame::Resize { columns, rows }) {
                debug!(target = "webtty::session", error = %err, "resize not sent");
            }
        }
    }

    async fn send_files(&mut self, batch: FileBatch) {
        self.set_picker(false);
        if batch.is_empty() {
            return;
        }
        let result = until_shutdown(
            &mut self.shutdown,
            self.transfers.send(&mut self.channel, &batch),
        )
        .await;
        match result {
            None => {}
            Some(Ok(Some(summary))) => {
                info!(
                    target = "webtty::transfer",
                    transfer_id = summary.transfer_id,
                    files = summary.files,
                    bytes = summary.bytes,
                    "upload complete"
                );
                self.emit(SessionEvent::TransferCompleted(summary));
            }
            Some(Ok(None)) => {}
            Some(Err(err)) => {
                warn!(target = "webtty::transfer", error = %err, "upload terminated");
                if let TransferError::Interrupted { file, .. } = &err {
                    if self.attached {
                        self.surface
                            .lock()
                            .notice(&SurfaceNotice::TransferInterrupted { file: file.clone() });
                    }
                }
                self.emit(SessionEvent::TransferInterrupted(err));
            }
        }
    }

    fn set_picker(&mut self, open: bool) {
        if self.picker_open != open {
            self.picker_open = open;
            self.emit(SessionEvent::FilePickerChanged(open));
        }
    }

    fn startup_failed(&mut self, err: SessionError) {
        if matches!(err, SessionError::Stopped) {
            return;
        }
        warn!(
            target = "webtty::session",
            session_id = %self.config.id,
            error = %err,
            "session startup failed"
        );
        self.set_state(SessionState::Uninitialized);
        self.emit(SessionEvent::StartupFailed(err));
    }

    async fn teardown(&mut self) {
        self.hub.remove_listener(&self.listener);
        self.channel.close().await;
        self.surface.lock().dispose();
        self.attached = false;
        self.set_state(SessionState::Disposed);
        self.publish();
        info!(
            target = "webtty::session",
            session_id = %self.config.id,
            "session disposed"
        );
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(
                target = "webtty::session",
                from = ?self.state,
                to = ?state,
                "state change"
            );
            self.state = state;
        }
    }

    /// The snapshot is published first so it never lags an event.
    fn emit(&self, event: SessionEvent) {
        if self.is_mounted() {
            self.publish();
            let _ = self.events.send(event);
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            state: self.state,
            initialized: self.initialized,
            pending_args: self.pending_args.clone(),
            channel: self.channel.state(),
            picker_open: self.picker_open,
        });
    }
}

/// Resolves once stop was requested or the handle is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Runs `fut` unless shutdown wins the race; `None` means the caller is no
/// longer mounted and must not continue.
async fn until_shutdown<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    if *shutdown.borrow() {
        return None;
    }
    tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown) => None,
        output = fut => Some(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn until_shutdown_passes_output_through() {
        let (_tx, mut rx) = watch::channel(false);
        assert_eq!(until_shutdown(&mut rx, async { 7 }).await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn until_shutdown_abandons_pending_work() {
        let (tx, mut rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });
        let out = until_shutdown(&mut rx, std::future::pending::<()>()).await;
        assert_eq!(out, None);
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        wait_for_shutdown(&mut rx).await;
        assert_eq!(until_shutdown(&mut rx, std::future::pending::<()>()).await, None);
    }
}
