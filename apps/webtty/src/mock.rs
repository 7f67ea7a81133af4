//! In-memory stand-ins for the token source, the remote pty and the display,
//! sharing one [`Journal`] so tests can assert cross-component ordering.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Semaphore, mpsc};

use crate::auth::{AuthError, CredentialProvider, Token};
use crate::display::{DisplaySurface, SurfaceNotice};
use crate::protocol::{ClientFrame, HostFrame, decode_client_frame, encode_host_frame};
use crate::transport::{ChannelConnector, ChannelLink, ConnectError, LinkClosed, OpenRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    Refresh(String),
    Connect { token: String, columns: u16, rows: u16 },
    Frame(ClientFrame),
    LinkClosed,
    Attach(String),
    Write(Vec<u8>),
    Resize(u16, u16),
    Title(String),
    Notice(SurfaceNotice),
    Dispose,
}

#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: JournalEntry) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    pub fn position<F>(&self, predicate: F) -> Option<usize>
    where
        F: Fn(&JournalEntry) -> bool,
    {
        self.entries.lock().iter().position(predicate)
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&JournalEntry) -> bool,
    {
        self.entries.lock().iter().filter(|entry| predicate(entry)).count()
    }
}

/// Gate that blocks callers until the test releases them.
#[derive(Debug, Clone)]
struct Hold(Arc<Semaphore>);

impl Hold {
    fn new() -> Self {
        Self(Arc::new(Semaphore::new(0)))
    }

    async fn wait(&self) {
        if let Ok(permit) = self.0.acquire().await {
            permit.forget();
        }
    }

    fn release(&self) {
        self.0.add_permits(1);
    }
}

#[derive(Debug, Default)]
struct CredentialState {
    issued: u64,
    failure: Option<(u16, String)>,
    hold: Option<Hold>,
}

/// Issues `token-1`, `token-2`, ... so tests can see that every open used a
/// fresh token.
#[derive(Debug, Clone)]
pub struct MockCredentials {
    state: Arc<Mutex<CredentialState>>,
    journal: Journal,
}

impl MockCredentials {
    pub fn new(journal: Journal) -> Self {
        Self {
            state: Arc::new(Mutex::new(CredentialState::default())),
            journal,
        }
    }

    pub fn reject(&self, status: u16, detail: &str) {
        self.state.lock().failure = Some((status, detail.to_string()));
    }

    /// Undoes [`MockCredentials::reject`].
    pub fn recover(&self) {
        self.state.lock().failure = None;
    }

    /// Subsequent refreshes block until [`MockCredentials::release`].
    pub fn hold(&self) {
        self.state.lock().hold = Some(Hold::new());
    }

    pub fn release(&self) {
        if let Some(hold) = self.state.lock().hold.as_ref() {
            hold.release();
        }
    }

    pub fn issued(&self) -> u64 {
        self.state.lock().issued
    }
}

#[async_trait]
impl CredentialProvider for MockCredentials {
    async fn refresh(&self) -> Result<Token, AuthError> {
        let hold = self.state.lock().hold.clone();
        if let Some(hold) = hold {
            hold.wait().await;
        }
        let mut state = self.state.lock();
        if let Some((status, detail)) = state.failure.clone() {
            return Err(AuthError::Rejected { status, detail });
        }
        state.issued += 1;
        let token = format!("token-{}", state.issued);
        self.journal.record(JournalEntry::Refresh(token.clone()));
        Ok(Token::new(token))
    }
}

#[derive(Default)]
struct RemoteState {
    connects: usize,
    tokens: Vec<String>,
    sent: Vec<ClientFrame>,
    inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    backlog: VecDeque<Vec<u8>>,
    link_connected: Option<Arc<AtomicBool>>,
    reject_tokens: bool,
    refuse_connect: Option<String>,
    send_budget: Option<usize>,
    hold: Option<Hold>,
}

/// Scriptable remote pty. Clones share state.
#[derive(Clone, Default)]
pub struct MockRemote {
    state: Arc<Mutex<RemoteState>>,
    journal: Journal,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal,
        }
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            remote: self.clone(),
        }
    }

    pub fn reject_tokens(&self) {
        self.state.lock().reject_tokens = true;
    }

    pub fn refuse_connections(&self, reason: &str) {
        self.state.lock().refuse_connect = Some(reason.to_string());
    }

    /// Subsequent connects block until [`MockRemote::release`].
    pub fn hold(&self) {
        self.state.lock().hold = Some(Hold::new());
    }

    pub fn release(&self) {
        if let Some(hold) = self.state.lock().hold.as_ref() {
            hold.release();
        }
    }

    /// After `n` more frames the link behaves as if the remote went away.
    pub fn fail_sends_after(&self, n: usize) {
        self.state.lock().send_budget = Some(n);
    }

    pub fn push_frame(&self, frame: &HostFrame) {
        self.push_raw(encode_host_frame(frame));
    }

    /// Delivers bytes as-is, for frames the codec would never produce.
    pub fn push_raw(&self, bytes: Vec<u8>) {
        let mut state = self.state.lock();
        match state.inbound.as_ref() {
            Some(tx) => {
                let _ = tx.send(bytes);
            }
            None => state.backlog.push_back(bytes),
        }
    }

    /// Output sent before any link exists is delivered right after connect,
    /// like a banner printed on spawn.
    pub fn push_output(&self, bytes: &[u8]) {
        self.push_frame(&HostFrame::Output(bytes.to_vec().into()));
    }

    pub fn hang_up(&self) {
        let mut state = self.state.lock();
        state.inbound = None;
        if let Some(flag) = state.link_connected.as_ref() {
            flag.store(false, Ordering::Release);
        }
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn tokens(&self) -> Vec<String> {
        self.state.lock().tokens.clone()
    }

    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.state.lock().sent.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .link_connected
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

pub struct MockConnector {
    remote: MockRemote,
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(
        &self,
        token: &Token,
        request: OpenRequest,
    ) -> Result<Box<dyn ChannelLink>, ConnectError> {
        let hold = self.remote.state.lock().hold.clone();
        if let Some(hold) = hold {
            hold.wait().await;
        }

        let mut state = self.remote.state.lock();
        state.connects += 1;
        state.tokens.push(token.as_str().to_string());
        if let Some(reason) = state.refuse_connect.clone() {
            return Err(ConnectError::Transport(reason));
        }
        if state.reject_tokens {
            return Err(ConnectError::TokenRejected);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for frame in state.backlog.drain(..) {
            let _ = tx.send(frame);
        }
        let connected = Arc::new(AtomicBool::new(true));
        state.inbound = Some(tx);
        state.link_connected = Some(connected.clone());
        self.remote.journal.record(JournalEntry::Connect {
            token: token.as_str().to_string(),
            columns: request.columns,
            rows: request.rows,
        });

        Ok(Box::new(MockLink {
            remote: self.remote.clone(),
            rx,
            connected,
        }))
    }
}

pub struct MockLink {
    remote: MockRemote,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl ChannelLink for MockLink {
    fn send(&self, frame: Vec<u8>) -> Result<(), LinkClosed> {
        if !self.is_connected() {
            return Err(LinkClosed);
        }
        let mut state = self.remote.state.lock();
        if let Some(budget) = state.send_budget.as_mut() {
            if *budget == 0 {
                self.connected.store(false, Ordering::Release);
                state.inbound = None;
                return Err(LinkClosed);
            }
            *budget -= 1;
        }
        let decoded = decode_client_frame(&frame).map_err(|_| LinkClosed)?;
        state.sent.push(decoded.clone());
        self.remote.journal.record(JournalEntry::Frame(decoded));
        Ok(())
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&mut self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.remote.journal.record(JournalEntry::LinkClosed);
        }
        self.rx.close();
    }
}

#[derive(Debug, Default)]
struct SurfaceState {
    attached: Option<String>,
    attach_calls: usize,
    dispose_calls: usize,
    output: Vec<u8>,
    writes: Vec<Vec<u8>>,
}

/// Display double. Clones share state, so keep one clone for assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
    state: Arc<Mutex<SurfaceState>>,
    journal: Journal,
}

impl RecordingSurface {
    pub fn new(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal,
        }
    }

    pub fn attach_calls(&self) -> usize {
        self.state.lock().attach_calls
    }

    pub fn dispose_calls(&self) -> usize {
        self.state.lock().dispose_calls
    }

    pub fn container(&self) -> Option<String> {
        self.state.lock().attached.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    pub fn output(&self) -> Vec<u8> {
        self.state.lock().output.clone()
    }
}

impl DisplaySurface for RecordingSurface {
    fn attach(&mut self, container: &str) {
        let mut state = self.state.lock();
        state.attach_calls += 1;
        state.attached = Some(container.to_string());
        self.journal.record(JournalEntry::Attach(container.to_string()));
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.output.extend_from_slice(bytes);
        state.writes.push(bytes.to_vec());
        self.journal.record(JournalEntry::Write(bytes.to_vec()));
    }

    fn resize(&mut self, columns: u16, rows: u16) {
        self.journal.record(JournalEntry::Resize(columns, rows));
    }

    fn set_title(&mut self, title: &str) {
        self.journal.record(JournalEntry::Title(title.to_string()));
    }

    fn notice(&mut self, notice: &SurfaceNotice) {
        self.journal.record(JournalEntry::Notice(notice.clone()));
    }

    fn dispose(&mut self) {
        self.state.lock().dispose_calls += 1;
        self.journal.record(JournalEntry::Dispose);
    }
}
