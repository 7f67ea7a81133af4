use bytes::Bytes;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::auth::Token;
use crate::protocol::{ClientFrame, HostFrame, WireError, decode_host_frame, encode_client_frame};
use crate::transport::{ChannelConnector, ChannelLink, ConnectError, OpenRequest};

pub const DEFAULT_MAX_PENDING_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Opening,
    Open,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is not open")]
    NotOpen,
    #[error("channel closed by remote")]
    Closed,
}

/// What the controller sees from [`ChannelAdapter::recv`]. Output is not
/// reported here; it goes to the receive handler or the pending queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Output,
    Title(String),
    Preferences(serde_json::Map<String, serde_json::Value>),
    UploadRequested,
    Malformed(WireError),
    Closed,
}

pub type ReceiveHandler = Box<dyn FnMut(&[u8]) + Send>;

/// The session's single connection to the remote pty.
///
/// Output that arrives before a receive handler is installed is held in
/// arrival order. Once the held bytes pass half of `max_pending_bytes` the
/// remote is asked to pause; frames are dropped oldest-first only if the cap
/// is still exceeded.
pub struct ChannelAdapter {
    state: ChannelState,
    link: Option<Box<dyn ChannelLink>>,
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    max_pending_bytes: usize,
    dropped_frames: u64,
    paused: bool,
    handler: Option<ReceiveHandler>,
}

impl ChannelAdapter {
    pub fn new(max_pending_bytes: usize) -> Self {
        Self {
            state: ChannelState::Idle,
            link: None,
            pending: VecDeque::new(),
            pending_bytes: 0,
            max_pending_bytes: max_pending_bytes.max(1),
            dropped_frames: 0,
            paused: false,
            handler: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Opens the link. Only valid from `Idle`; an adapter never carries a
    /// second connection.
    pub async fn open(
        &mut self,
        connector: &dyn ChannelConnector,
        token: &Token,
        request: OpenRequest,
    ) -> Result<(), ConnectError> {
        if self.state != ChannelState::Idle {
            return Err(ConnectError::Transport(format!(
                "channel already {:?}",
                self.state
            )));
        }
        self.state = ChannelState::Opening;
        match connector.connect(token, request).await {
            Ok(link) => {
                self.link = Some(link);
                self.state = ChannelState::Open;
                debug!(
                    target = "webtty::channel",
                    columns = request.columns,
                    rows = request.rows,
                    "channel open"
                );
                Ok(())
            }
            Err(err) => {
                self.state = ChannelState::Closed;
                Err(err)
            }
        }
    }

    pub fn send(&mut self, frame: &ClientFrame) -> Result<(), ChannelError> {
        if self.state != ChannelState::Open {
            return Err(ChannelError::NotOpen);
        }
        let link = self.link.as_ref().ok_or(ChannelError::NotOpen)?;
        trace!(target = "webtty::channel", kind = frame.kind(), "send frame");
        link.send(encode_client_frame(frame)).map_err(|_| {
            self.state = ChannelState::Closed;
            ChannelError::Closed
        })
    }

    /// Installs the output consumer and flushes held output into it.
    pub fn on_receive(&mut self, mut handler: ReceiveHandler) {
        let flushed = self.pending.len();
        while let Some(bytes) = self.pending.pop_front() {
            handler(&bytes);
        }
        self.pending_bytes = 0;
        self.handler = Some(handler);
        if flushed > 0 {
            debug!(
                target = "webtty::channel",
                flushed,
                dropped = self.dropped_frames,
                "flushed held output"
            );
        }
        if self.paused {
            self.paused = false;
            if self.state == ChannelState::Open {
                if let Err(err) = self.send(&ClientFrame::Resume) {
                    debug!(target = "webtty::channel", error = %err, "resume not sent");
                }
            }
        }
    }

    /// Waits for the next inbound frame. Pending forever when no link is
    /// open so it can sit in a `select!` unconditionally.
    pub async fn recv(&mut self) -> ChannelEvent {
        let Some(link) = self.link.as_mut() else {
            return std::future::pending().await;
        };
        if self.state != ChannelState::Open {
            return std::future::pending().await;
        }
        match link.recv().await {
            None => {
                self.state = ChannelState::Closed;
                ChannelEvent::Closed
            }
            Some(raw) => match decode_host_frame(&raw) {
                Ok(HostFrame::Output(bytes)) => {
                    self.deliver(bytes);
                    ChannelEvent::Output
                }
                Ok(HostFrame::SetWindowTitle(title)) => ChannelEvent::Title(title),
                Ok(HostFrame::SetPreferences(prefs)) => ChannelEvent::Preferences(prefs),
                Ok(HostFrame::RequestUpload) => ChannelEvent::UploadRequested,
                Err(err) => ChannelEvent::Malformed(err),
            },
        }
    }

    pub(crate) fn deliver(&mut self, bytes: Bytes) {
        if let Some(handler) = self.handler.as_mut() {
            handler(&bytes);
            return;
        }

        self.pending_bytes += bytes.len();
        self.pending.push_back(bytes);

        if !self.paused && self.pending_bytes > self.max_pending_bytes / 2 {
            if self.state == ChannelState::Open && self.send(&ClientFrame::Pause).is_ok() {
                self.paused = true;
                debug!(
                    target = "webtty::channel",
                    pending_bytes = self.pending_bytes,
                    "paused remote output while detached"
                );
            }
        }

        let mut dropped_now = false;
        while self.pending_bytes > self.max_pending_bytes && self.pending.len() > 1 {
            if let Some(oldest) = self.pending.pop_front() {
                self.pending_bytes -= oldest.len();
                self.dropped_frames += 1;
                dropped_now = true;
            }
        }
        if dropped_now && self.dropped_frames.is_power_of_two() {
            warn!(
                target = "webtty::channel",
                dropped = self.dropped_frames,
                "detached output cap reached; dropping oldest frames"
            );
        }
    }

    /// Safe in every state, including before `open` and after the remote
    /// has gone away.
    pub async fn close(&mut self) {
        self.handler = None;
        self.pending.clear();
        self.pending_bytes = 0;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        if self.state != ChannelState::Closed {
            debug!(target = "webtty::channel", from = ?self.state, "channel closed");
        }
        self.state = ChannelState::Closed;
    }
}
