//! The three periodic loops that run while a session is live.
//!
//! All three share one cancellation token. A loop that fails reports to the
//! orchestrator and exits; the orchestrator then cancels the other two.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::clock::sleep_or_cancel;
use crate::errors::FeedError;
use crate::feed::FeedEvent;
use crate::feed::bus::EventBus;
use crate::models::{PriceMessage, Watchlist};
use crate::simulator::PriceSimulator;
use crate::transport::{Session, SessionId};

/// Inbound text containing this marker asks the client to drop the session.
pub const DISCONNECT_DIRECTIVE: &str = "disconnect";

pub fn is_disconnect_directive(text: &str) -> bool {
    text.contains(DISCONNECT_DIRECTIVE)
}

/// Timing for the loops of one session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopTimings {
    pub price_interval: Duration,
    pub heartbeat_interval: Duration,
}

struct LoopContext {
    session_id: SessionId,
    session: Arc<dyn Session>,
    bus: Arc<EventBus>,
    events: mpsc::UnboundedSender<FeedEvent>,
    token: CancellationToken,
}

impl LoopContext {
    fn report(&self, error: FeedError) {
        if self.token.is_cancelled() {
            return;
        }
        let _ = self.events.send(FeedEvent::LoopFailed {
            session: self.session_id,
            error,
        });
    }
}

/// Handles for the send, heartbeat and receive loops of one session.
pub(crate) struct LoopSet {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl LoopSet {
    pub(crate) fn spawn(
        session_id: SessionId,
        session: Arc<dyn Session>,
        bus: Arc<EventBus>,
        events: mpsc::UnboundedSender<FeedEvent>,
        symbols: Watchlist,
        simulator: Arc<Mutex<PriceSimulator>>,
        timings: LoopTimings,
    ) -> Self {
        let token = CancellationToken::new();
        let ctx = Arc::new(LoopContext {
            session_id,
            session,
            bus,
            events,
            token: token.clone(),
        });
        let handles = vec![
            tokio::spawn(send_loop(
                Arc::clone(&ctx),
                symbols,
                simulator,
                timings.price_interval,
            )),
            tokio::spawn(heartbeat_loop(
                Arc::clone(&ctx),
                timings.heartbeat_interval,
            )),
            tokio::spawn(receive_loop(ctx)),
        ];
        Self { token, handles }
    }

    /// Stops all three loops without waiting for them.
    pub(crate) fn cancel(self) {
        self.token.cancel();
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn send_loop(
    ctx: Arc<LoopContext>,
    symbols: Watchlist,
    simulator: Arc<Mutex<PriceSimulator>>,
    interval: Duration,
) {
    loop {
        let updates = simulator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tick(&symbols);
        trace!(session = %ctx.session_id, count = updates.len(), "[SIM] tick");

        for update in updates {
            if ctx.token.is_cancelled() {
                return;
            }
            let payload = PriceMessage::from_update(&update).to_json();
            ctx.bus.publish_price(ctx.session_id, update);

            let payload = match payload {
                Ok(p) => p,
                Err(e) => {
                    ctx.report(e);
                    return;
                }
            };
            let sent = tokio::select! {
                biased;
                _ = ctx.token.cancelled() => return,
                res = ctx.session.send(payload) => res,
            };
            if let Err(e) = sent {
                ctx.report(e);
                return;
            }
        }

        if !sleep_or_cancel(interval, &ctx.token).await {
            return;
        }
    }
}

async fn heartbeat_loop(ctx: Arc<LoopContext>, interval: Duration) {
    loop {
        let pinged = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => return,
            res = ctx.session.ping() => res,
        };
        if let Err(e) = pinged {
            ctx.report(e);
            return;
        }
        trace!(session = %ctx.session_id, "[FEED] pong");

        if !sleep_or_cancel(interval, &ctx.token).await {
            return;
        }
    }
}

async fn receive_loop(ctx: Arc<LoopContext>) {
    loop {
        let received = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => return,
            res = ctx.session.receive() => res,
        };
        match received {
            Ok(text) if is_disconnect_directive(&text) => {
                ctx.report(FeedError::ServerDisconnect(text));
                return;
            }
            // the peer echoes our frames back; nothing to do with them
            Ok(text) => debug!(session = %ctx.session_id, len = text.len(), "[FEED] inbound"),
            Err(e) => {
                ctx.report(e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::state::ConnectionState;
    use crate::transport::{
        CloseCode, Connector, ScriptedConnector, ScriptedSession, SessionEvents,
    };
    use url::Url;

    struct Harness {
        bus: Arc<EventBus>,
        events: mpsc::UnboundedReceiver<FeedEvent>,
        session: Arc<ScriptedSession>,
        loops: LoopSet,
    }

    async fn start(tickers: &str) -> Harness {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connector = ScriptedConnector::accepting();
        let url = Url::parse("wss://example.test/raw").unwrap();
        let handle = connector.open(&url, SessionEvents::new(SessionId(1), tx.clone()));
        let session = connector.next_session().await;
        // drain the Opened event
        rx.recv().await.unwrap();

        let bus = Arc::new(EventBus::new());
        let epoch = bus.begin(ConnectionState::Connecting);
        bus.go_live(epoch, SessionId(1));

        let loops = LoopSet::spawn(
            SessionId(1),
            handle,
            Arc::clone(&bus),
            tx,
            Watchlist::from_tickers(tickers).unwrap(),
            Arc::new(Mutex::new(PriceSimulator::seeded(11))),
            LoopTimings {
                price_interval: Duration::from_secs(2),
                heartbeat_interval: Duration::from_secs(15),
            },
        );
        Harness {
            bus,
            events: rx,
            session,
            loops,
        }
    }

    #[test]
    fn directive_detection() {
        assert!(is_disconnect_directive("server: disconnect now"));
        assert!(!is_disconnect_directive(r#"{"symbol":"AAA","price":1.0}"#));
    }

    #[tokio::test(start_paused = true)]
    async fn send_loop_publishes_and_transmits_each_tick() {
        let h = start("AAA,BBB").await;
        let mut prices = h.bus.subscribe_prices();

        tokio::time::sleep(Duration::from_millis(4_100)).await;
        // ticks at 0s, 2s and 4s
        let sent = h.session.sent();
        assert_eq!(sent.len(), 6);
        let first: PriceMessage = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(first.symbol, "AAA");

        let mut received = 0;
        while prices.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 6);
        h.loops.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_on_interval() {
        let h = start("AAA").await;
        tokio::time::sleep(Duration::from_millis(30_500)).await;
        assert_eq!(h.session.ping_count(), 3);
        h.loops.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_reported_once_per_loop() {
        let mut h = start("AAA").await;
        h.session.push_inbound("please disconnect");
        match h.events.recv().await {
            Some(FeedEvent::LoopFailed { session, error }) => {
                assert_eq!(session, SessionId(1));
                assert!(matches!(error, FeedError::ServerDisconnect(_)));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        h.session.set_fail_sends(true);
        match h.events.recv().await {
            Some(FeedEvent::LoopFailed { error, .. }) => {
                assert!(matches!(error, FeedError::Send(_)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        h.loops.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_loops_stay_quiet() {
        let mut h = start("AAA").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.loops.cancel();
        h.bus.retire(SessionId(1));
        let sent_before = h.session.sent().len();

        h.session.set_fail_pings(true);
        h.session.close_remote(CloseCode::Abnormal, None);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.session.sent().len(), sent_before);
        // only the transport's own close event, no loop failures
        match h.events.try_recv() {
            Ok(FeedEvent::Transport(_)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(h.events.try_recv().is_err());
    }
}
