//! WebSocket transport built on tokio-tungstenite.
//!
//! Each session spawns one driver task that owns the socket. The session
//! handle talks to the driver through a command channel; inbound text frames
//! come back through a second channel. Pongs resolve outstanding pings in
//! FIFO order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, info, warn};
use url::Url;

use super::{CloseCode, CloseInfo, Connector, Session, SessionEvents};
use crate::config::FeedConfig;
use crate::errors::{FeedError, Result};

const PING_PAYLOAD: &[u8] = b"hb";

/// Opens real WebSocket sessions.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
    ping_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration, ping_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ping_timeout,
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(config.connect_timeout, config.ping_timeout)
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &Url, events: SessionEvents) -> Arc<dyn Session> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(
            url.clone(),
            self.connect_timeout,
            commands_rx,
            inbound_tx,
            events,
        ));
        Arc::new(WsSession {
            commands: commands_tx,
            inbound: Mutex::new(inbound_rx),
            ping_timeout: self.ping_timeout,
        })
    }
}

enum Command {
    Text(String, oneshot::Sender<Result<()>>),
    Ping(oneshot::Sender<Result<()>>),
    Close(CloseInfo),
}

struct WsSession {
    commands: mpsc::UnboundedSender<Command>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    ping_timeout: Duration,
}

#[async_trait]
impl Session for WsSession {
    async fn send(&self, text: String) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Text(text, ack_tx))
            .map_err(|_| FeedError::SessionClosed)?;
        ack_rx
            .await
            .map_err(|_| FeedError::Send("socket closed before write completed".into()))?
    }

    async fn receive(&self) -> Result<String> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| FeedError::Receive("socket closed".into()))
    }

    async fn ping(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Ping(ack_tx))
            .map_err(|_| FeedError::SessionClosed)?;
        match tokio::time::timeout(self.ping_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FeedError::Ping("socket closed before pong".into())),
            Err(_) => Err(FeedError::PingTimeout(self.ping_timeout)),
        }
    }

    fn close(&self, code: CloseCode, reason: Option<String>) {
        let _ = self.commands.send(Command::Close(CloseInfo::new(code, reason)));
    }
}

/// Owns the socket for one session and reports `opened`/`closed` exactly once.
async fn drive(
    url: Url,
    connect_timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedSender<String>,
    events: SessionEvents,
) {
    let session = events.session();

    let connected = tokio::select! {
        res = tokio::time::timeout(connect_timeout, connect_async(url.as_str())) => res,
        close = wait_for_close(&mut commands) => {
            debug!(%session, "[WS] closed before handshake completed");
            events.closed(close);
            return;
        }
    };
    let ws = match connected {
        Ok(Ok((ws, _resp))) => ws,
        Ok(Err(e)) => {
            warn!(%session, error = %FeedError::TransportOpen(e.to_string()), "[WS] handshake failed");
            events.closed(CloseInfo::abnormal());
            return;
        }
        Err(_) => {
            let err = FeedError::TransportOpen(format!("no handshake within {connect_timeout:?}"));
            warn!(%session, error = %err, "[WS] handshake timed out");
            events.closed(CloseInfo::abnormal());
            return;
        }
    };
    info!(%session, %url, "[WS] handshake complete");
    events.opened();

    let (mut sink, mut stream) = ws.split();
    let mut pending_pings: VecDeque<oneshot::Sender<Result<()>>> = VecDeque::new();
    let mut remote_close: Option<CloseInfo> = None;

    let close = loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Text(text, ack)) => {
                    let res = sink.send(Message::Text(text)).await.map_err(|e| FeedError::Send(e.to_string()));
                    let _ = ack.send(res);
                }
                Some(Command::Ping(ack)) => match sink.send(Message::Ping(PING_PAYLOAD.to_vec())).await {
                    Ok(()) => pending_pings.push_back(ack),
                    Err(e) => {
                        let _ = ack.send(Err(FeedError::Ping(e.to_string())));
                    }
                },
                Some(Command::Close(close)) => {
                    if close.code.is_allowed() {
                        let frame = CloseFrame {
                            code: close.code,
                            reason: close.reason.clone().unwrap_or_default().into(),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            debug!(%session, error = %e, "[WS] close frame not delivered");
                        }
                    }
                    break close;
                }
                // handle dropped without an explicit close
                None => break CloseInfo::new(CloseCode::Away, None),
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send(text);
                }
                Some(Ok(Message::Pong(_))) => {
                    if let Some(ack) = pending_pings.pop_front() {
                        let _ = ack.send(Ok(()));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    // keep reading; tungstenite answers the close and ends the stream
                    remote_close = Some(match frame {
                        Some(f) => CloseInfo::new(f.code, Some(f.reason.into_owned())),
                        None => CloseInfo::new(CloseCode::Status, None),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if remote_close.is_none() {
                        warn!(%session, error = %e, "[WS] websocket message error");
                    }
                    break remote_close.take().unwrap_or_else(CloseInfo::abnormal);
                }
                None => break remote_close.take().unwrap_or_else(CloseInfo::abnormal),
            },
        }
    };

    for ack in pending_pings.drain(..) {
        let _ = ack.send(Err(FeedError::Ping("socket closed".into())));
    }
    info!(%session, code = ?close.code, reason = ?close.reason, "[WS] session closed");
    events.closed(close);
    // `inbound` drops here, after `closed` was queued
}

/// Waits for a `Close` command during the handshake. Other commands are
/// rejected since nothing may be written before the socket opens.
async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<Command>) -> CloseInfo {
    loop {
        match commands.recv().await {
            Some(Command::Close(close)) => return close,
            Some(Command::Text(_, ack)) | Some(Command::Ping(ack)) => {
                let _ = ack.send(Err(FeedError::SessionClosed));
            }
            None => return CloseInfo::new(CloseCode::Away, None),
        }
    }
}
