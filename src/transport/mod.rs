//! Transport sessions.
//!
//! Responsibilities:
//! • Own exactly one socket per session.
//! • Report handshake completion and closure back to the orchestrator, once each.
//! • Provide send / receive / ping primitives to the periodic loops.
//! • Classify close frames into recoverable and terminal.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

pub use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::errors::Result;
use crate::feed::FeedEvent;

pub mod scripted;
pub mod ws;

pub use scripted::{OpenMode, ScriptedConnector, ScriptedSession};
pub use ws::WsConnector;

/// Identifies one transport session for the lifetime of a `FeedClient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Code and optional text carried by a close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: CloseCode,
    pub reason: Option<String>,
}

impl CloseInfo {
    pub fn new(code: CloseCode, reason: Option<String>) -> Self {
        // an empty reason is the same as none
        let reason = reason.filter(|r| !r.is_empty());
        Self { code, reason }
    }

    pub fn abnormal() -> Self {
        Self::new(CloseCode::Abnormal, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Worth reconnecting.
    Recoverable,
    /// Clean or explained close; stay disconnected.
    Terminal,
}

/// A textual reason, or a normal/going-away code, ends the stream for good.
/// Everything else is treated as a transient failure.
///
/// Note that an abnormal code that also carries a reason is terminal.
pub fn classify(close: &CloseInfo) -> CloseDisposition {
    match (&close.reason, close.code) {
        (Some(_), _) => CloseDisposition::Terminal,
        (None, CloseCode::Normal | CloseCode::Away) => CloseDisposition::Terminal,
        _ => CloseDisposition::Recoverable,
    }
}

/// Lifecycle notifications from a transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened { session: SessionId },
    Closed { session: SessionId, close: CloseInfo },
}

/// Handle a session uses to report its lifecycle.
///
/// `closed` consumes the handle, so a session can report closure only once.
#[derive(Debug)]
pub struct SessionEvents {
    session: SessionId,
    tx: mpsc::UnboundedSender<FeedEvent>,
}

impl SessionEvents {
    pub(crate) fn new(session: SessionId, tx: mpsc::UnboundedSender<FeedEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Handshake complete.
    pub fn opened(&self) {
        let _ = self.tx.send(FeedEvent::Transport(TransportEvent::Opened {
            session: self.session,
        }));
    }

    pub fn closed(self, close: CloseInfo) {
        let _ = self.tx.send(FeedEvent::Transport(TransportEvent::Closed {
            session: self.session,
            close,
        }));
    }
}

/// An open (or opening) socket.
///
/// After `close` is called, or after the session has reported `closed`, every
/// other method fails.
#[async_trait]
pub trait Session: Send + Sync {
    async fn send(&self, text: String) -> Result<()>;

    /// Next inbound text message.
    async fn receive(&self) -> Result<String>;

    /// Resolves once the peer acknowledged the ping.
    async fn ping(&self) -> Result<()>;

    /// Fire-and-forget close. Reserved codes such as `Abnormal` drop the
    /// socket without writing a close frame.
    fn close(&self, code: CloseCode, reason: Option<String>);
}

/// Opens sessions. `open` returns immediately; the handshake completes in the
/// background and is reported through `events`.
pub trait Connector: Send + Sync {
    fn open(&self, url: &Url, events: SessionEvents) -> Arc<dyn Session>;
}
