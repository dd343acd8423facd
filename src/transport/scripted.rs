//! In-memory transport whose lifecycle is driven by the caller.
//!
//! Used by the test-suite to play the remote peer: complete or refuse
//! handshakes, close from the remote side, inject inbound messages, and make
//! sends or pings fail. The connector counts how many sessions are open at
//! any instant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{CloseCode, CloseInfo, Connector, Session, SessionEvents, SessionId};
use crate::errors::{FeedError, Result};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How freshly opened sessions behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Wait for `complete_handshake` / `close_remote`.
    Manual,
    /// Complete the handshake immediately.
    Accept,
    /// Fail the handshake immediately with an abnormal close.
    Refuse,
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

impl Counters {
    fn session_opened(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
    }

    fn session_closed(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ScriptedConnector {
    mode: Arc<Mutex<OpenMode>>,
    counters: Arc<Counters>,
    sessions: Arc<Mutex<Vec<Arc<ScriptedSession>>>>,
    opened_tx: mpsc::UnboundedSender<Arc<ScriptedSession>>,
    opened_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<ScriptedSession>>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::with_mode(OpenMode::Manual)
    }

    pub fn accepting() -> Self {
        Self::with_mode(OpenMode::Accept)
    }

    pub fn refusing() -> Self {
        Self::with_mode(OpenMode::Refuse)
    }

    pub fn with_mode(mode: OpenMode) -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Self {
            mode: Arc::new(Mutex::new(mode)),
            counters: Arc::new(Counters::default()),
            sessions: Arc::new(Mutex::new(Vec::new())),
            opened_tx,
            opened_rx: Arc::new(tokio::sync::Mutex::new(opened_rx)),
        }
    }

    pub fn set_mode(&self, mode: OpenMode) {
        *lock(&self.mode) = mode;
    }

    /// Waits for the next session the orchestrator opens.
    pub async fn next_session(&self) -> Arc<ScriptedSession> {
        self.opened_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector keeps its own sender alive")
    }

    pub fn sessions(&self) -> Vec<Arc<ScriptedSession>> {
        lock(&self.sessions).clone()
    }

    /// Sessions opened so far.
    pub fn open_count(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    pub fn live_count(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open sessions ever observed.
    pub fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, url: &Url, events: SessionEvents) -> Arc<dyn Session> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(ScriptedSession {
            id: events.session(),
            url: url.clone(),
            events: Mutex::new(Some(events)),
            script: Mutex::new(Script::default()),
            dead: CancellationToken::new(),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            counters: Arc::clone(&self.counters),
        });
        self.counters.session_opened();
        lock(&self.sessions).push(Arc::clone(&session));

        match *lock(&self.mode) {
            OpenMode::Manual => {}
            OpenMode::Accept => session.complete_handshake(),
            OpenMode::Refuse => session.close_remote(CloseCode::Abnormal, None),
        }
        let _ = self.opened_tx.send(Arc::clone(&session));
        session
    }
}

#[derive(Debug, Default)]
struct Script {
    sent: Vec<String>,
    pings: usize,
    fail_sends: bool,
    fail_pings: bool,
    local_close: Option<CloseInfo>,
}

pub struct ScriptedSession {
    id: SessionId,
    url: Url,
    events: Mutex<Option<SessionEvents>>,
    script: Mutex<Script>,
    dead: CancellationToken,
    inbound_tx: mpsc::UnboundedSender<Result<String>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<String>>>,
    counters: Arc<Counters>,
}

impl ScriptedSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn complete_handshake(&self) {
        if let Some(events) = lock(&self.events).as_ref() {
            events.opened();
        }
    }

    /// The peer closes the socket.
    pub fn close_remote(&self, code: CloseCode, reason: Option<&str>) {
        let close = CloseInfo::new(code, reason.map(str::to_string));
        self.finish(close);
    }

    /// Queues an inbound text frame.
    pub fn push_inbound(&self, text: &str) {
        let _ = self.inbound_tx.send(Ok(text.to_string()));
    }

    /// Makes the next `receive` fail.
    pub fn fail_receive(&self, message: &str) {
        let _ = self.inbound_tx.send(Err(FeedError::Receive(message.to_string())));
    }

    pub fn set_fail_sends(&self, fail: bool) {
        lock(&self.script).fail_sends = fail;
    }

    pub fn set_fail_pings(&self, fail: bool) {
        lock(&self.script).fail_pings = fail;
    }

    /// Text frames written so far.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.script).sent.clone()
    }

    pub fn ping_count(&self) -> usize {
        lock(&self.script).pings
    }

    pub fn is_closed(&self) -> bool {
        self.dead.is_cancelled()
    }

    /// Code and reason passed to `close`, if the orchestrator closed it.
    pub fn local_close(&self) -> Option<CloseInfo> {
        lock(&self.script).local_close.clone()
    }

    /// Marks the session dead and reports closure. Only the first call counts.
    fn finish(&self, close: CloseInfo) -> bool {
        let Some(events) = lock(&self.events).take() else {
            return false;
        };
        self.counters.session_closed();
        // report before failing pending receives, like a real socket
        events.closed(close);
        self.dead.cancel();
        true
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn send(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(FeedError::SessionClosed);
        }
        let mut script = lock(&self.script);
        if script.fail_sends {
            return Err(FeedError::Send("scripted send failure".into()));
        }
        script.sent.push(text);
        Ok(())
    }

    async fn receive(&self) -> Result<String> {
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.dead.cancelled() => Err(FeedError::Receive("socket closed".into())),
            msg = inbound.recv() => msg.unwrap_or(Err(FeedError::SessionClosed)),
        }
    }

    async fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(FeedError::SessionClosed);
        }
        let mut script = lock(&self.script);
        if script.fail_pings {
            return Err(FeedError::Ping("scripted ping failure".into()));
        }
        script.pings += 1;
        Ok(())
    }

    fn close(&self, code: CloseCode, reason: Option<String>) {
        let close = CloseInfo::new(code, reason);
        lock(&self.script).local_close = Some(close.clone());
        self.finish(close);
    }
}
