//! Persistent gateway session with heartbeat, watchdog and reconnect.
//!
//! One session runs four tasks: the reader (this module's `drive` loop),
//! a writer that owns the socket sink, a heartbeat ticker and a watchdog.
//! All of them stop when the session's child token is cancelled.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, timeout};
use tokio_tungstenite::tungstenite::{self, Message, protocol::CloseFrame};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::EventHandler;
use super::backoff::Backoff;
use super::dedup::RecentIds;
use super::protocol::{
    self, GatewayPayload, Hello, MessagePayload, OP_DISPATCH, OP_HEARTBEAT, OP_HEARTBEAT_ACK,
    OP_HELLO, OP_INVALID_SESSION, OP_RECONNECT, Ready,
};
use crate::channels::access::ChannelAccessRegistry;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::pipeline::types::InboundEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, Message>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HELLO_TIMEOUT: Duration = Duration::from_secs(15);
const WRITER_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const OUTBOUND_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingHello,
    Identified,
    Active,
}

/// What survives between connections of one manager run.
#[derive(Debug, Default)]
struct Session {
    session_id: Option<String>,
    seq: Option<u64>,
    resume_url: Option<String>,
}

impl Session {
    fn resumable(&self) -> Option<(&str, u64)> {
        Some((self.session_id.as_deref()?, self.seq?))
    }

    fn invalidate(&mut self) {
        *self = Self::default();
    }
}

enum SessionEnd {
    Shutdown,
    Reconnect(&'static str),
}

// ── Heartbeat bookkeeping ───────────────────────────────────────────

#[derive(Debug, Default)]
struct HeartbeatState {
    seq: Option<u64>,
    /// Send time of the oldest heartbeat not yet acknowledged.
    awaiting_ack_since: Option<Instant>,
    sent: u64,
}

impl HeartbeatState {
    fn mark_sent(&mut self, now: Instant) {
        self.sent += 1;
        if self.awaiting_ack_since.is_none() {
            self.awaiting_ack_since = Some(now);
        }
    }

    fn mark_acked(&mut self) {
        self.awaiting_ack_since = None;
    }

    fn unacked_for(&self, now: Instant) -> Option<Duration> {
        self.awaiting_ack_since
            .map(|since| now.saturating_duration_since(since))
    }
}

type SharedHeartbeat = Arc<Mutex<HeartbeatState>>;

fn lock(state: &SharedHeartbeat) -> MutexGuard<'_, HeartbeatState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Manager ─────────────────────────────────────────────────────────

pub struct GatewayConnectionManager {
    config: GatewayConfig,
    handler: Arc<dyn EventHandler>,
    registry: Option<Arc<ChannelAccessRegistry>>,
    monitored: HashSet<String>,
    state: watch::Sender<ConnectionState>,
    connections: AtomicU64,
    delivered: AtomicU64,
}

impl GatewayConnectionManager {
    pub fn new(config: GatewayConfig, handler: Arc<dyn EventHandler>) -> Self {
        let monitored = config.channel_ids.iter().cloned().collect();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            handler,
            registry: None,
            monitored,
            state,
            connections: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Drop events from channels the registry has blacklisted.
    pub fn with_registry(mut self, registry: Arc<ChannelAccessRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Sockets opened so far.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Events handed to the handler so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "Gateway state");
        }
    }

    fn accepts(&self, channel_id: &str) -> bool {
        if !self.monitored.is_empty() && !self.monitored.contains(channel_id) {
            return false;
        }
        match &self.registry {
            Some(registry) => !registry.is_blacklisted(channel_id),
            None => true,
        }
    }

    /// Keep a session alive until `cancel` fires or the credentials are
    /// rejected. Only fatal errors are returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
        let mut backoff = Backoff::from_config(&self.config);
        let mut session = Session::default();
        let mut dedup = RecentIds::new(self.config.dedup_capacity);

        loop {
            let started = Instant::now();
            let result = self.run_session(&mut session, &mut dedup, &cancel).await;
            let lived = started.elapsed();
            self.set_state(ConnectionState::Disconnected);

            match result {
                Ok(SessionEnd::Shutdown) => {
                    info!("Gateway stopped");
                    return Ok(());
                }
                Ok(SessionEnd::Reconnect(reason)) => {
                    info!(
                        duration_secs = lived.as_secs_f64(),
                        reason, "Gateway connection closed"
                    );
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        duration_secs = lived.as_secs_f64(),
                        error = %e,
                        "Gateway credentials rejected, not reconnecting"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        duration_secs = lived.as_secs_f64(),
                        error = %e,
                        "Gateway connection lost"
                    );
                }
            }

            backoff.connection_ended(lived);
            let delay = backoff.next_delay();
            info!(
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                resumable = session.resumable().is_some(),
                "Reconnecting to gateway"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Gateway stopped");
                    return Ok(());
                }
                _ = sleep(delay) => {}
            }
        }
    }

    async fn run_session(
        &self,
        session: &mut Session,
        dedup: &mut RecentIds,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, GatewayError> {
        let url = match (&session.resume_url, session.resumable()) {
            (Some(resume_url), Some(_)) => resume_endpoint(resume_url, &self.config.url),
            _ => self.config.url.clone(),
        };

        self.set_state(ConnectionState::Connecting);
        let socket = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
            res = timeout(CONNECT_TIMEOUT, connect_async(url.as_str())) => match res {
                Ok(Ok((socket, _response))) => socket,
                Ok(Err(e)) => return Err(connect_error(&url, e)),
                Err(_) => {
                    return Err(GatewayError::Connect {
                        url,
                        reason: "timed out".into(),
                    });
                }
            },
        };
        self.connections.fetch_add(1, Ordering::Relaxed);
        info!(url = %url, "Gateway connected");

        let (sink, mut stream) = socket.split();
        let session_cancel = cancel.child_token();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let writer = tokio::spawn(write_loop(sink, out_rx, session_cancel.clone()));

        let result = self
            .drive(session, dedup, &mut stream, &out_tx, cancel, &session_cancel)
            .await;

        session_cancel.cancel();
        drop(out_tx);
        if timeout(WRITER_STOP_TIMEOUT, writer).await.is_err() {
            debug!("Gateway writer did not stop in time");
        }
        result
    }

    async fn drive(
        &self,
        session: &mut Session,
        dedup: &mut RecentIds,
        stream: &mut WsReader,
        out: &mpsc::Sender<Message>,
        cancel: &CancellationToken,
        session_cancel: &CancellationToken,
    ) -> Result<SessionEnd, GatewayError> {
        self.set_state(ConnectionState::AwaitingHello);
        let hello = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
            res = timeout(HELLO_TIMEOUT, read_hello(stream)) => res
                .map_err(|_| GatewayError::Handshake("no Hello received".into()))??,
        };
        let heartbeat_interval = Duration::from_millis(hello.heartbeat_interval.max(1));
        debug!(interval_ms = hello.heartbeat_interval, "Gateway hello");

        let token = self.config.token.expose_secret();
        let handshake = match session.resumable() {
            Some((session_id, seq)) => {
                info!(session_id, seq, "Resuming gateway session");
                protocol::resume(token, session_id, seq)
            }
            None => protocol::identify(token, self.config.intents),
        };
        send_json(out, &handshake).await?;
        self.set_state(ConnectionState::Identified);

        let heartbeat: SharedHeartbeat = Arc::new(Mutex::new(HeartbeatState {
            seq: session.seq,
            ..HeartbeatState::default()
        }));
        let stall_limit = heartbeat_interval.mul_f64(self.config.watchdog_ratio);
        let stalled = CancellationToken::new();
        tokio::spawn(heartbeat_loop(
            heartbeat_interval / 2,
            Arc::clone(&heartbeat),
            out.clone(),
            session_cancel.clone(),
        ));
        tokio::spawn(watchdog_loop(
            stall_limit,
            Arc::clone(&heartbeat),
            stalled.clone(),
            session_cancel.clone(),
        ));

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
                _ = stalled.cancelled() => return Err(GatewayError::HeartbeatTimeout(stall_limit)),
                frame = stream.next() => frame,
            };

            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = close_parts(frame);
                    if code.is_some_and(protocol::invalidates_session) {
                        session.invalidate();
                    }
                    return Err(protocol::close_error(code, &reason));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(GatewayError::Closed {
                        code: None,
                        reason: e.to_string(),
                    });
                }
                None => {
                    return Err(GatewayError::Closed {
                        code: None,
                        reason: "stream ended".into(),
                    });
                }
            };

            let payload = match GatewayPayload::parse(text.as_str()) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Ignoring gateway frame");
                    continue;
                }
            };
            if let Some(seq) = payload.s {
                session.seq = Some(seq);
                lock(&heartbeat).seq = Some(seq);
            }

            match payload.op {
                OP_DISPATCH => self.handle_dispatch(payload, session, dedup).await,
                OP_HEARTBEAT => {
                    let seq = {
                        let mut hb = lock(&heartbeat);
                        hb.mark_sent(Instant::now());
                        hb.seq
                    };
                    send_json(out, &protocol::heartbeat(seq)).await?;
                }
                OP_HEARTBEAT_ACK => lock(&heartbeat).mark_acked(),
                OP_RECONNECT => return Ok(SessionEnd::Reconnect("server requested reconnect")),
                OP_INVALID_SESSION => {
                    let resumable = payload.d.as_bool().unwrap_or(false);
                    if !resumable {
                        session.invalidate();
                    }
                    return Err(GatewayError::InvalidSession { resumable });
                }
                other => debug!(op = other, "Ignoring gateway opcode"),
            }
        }
    }

    async fn handle_dispatch(
        &self,
        payload: GatewayPayload,
        session: &mut Session,
        dedup: &mut RecentIds,
    ) {
        match payload.t.as_deref() {
            Some("READY") => match serde_json::from_value::<Ready>(payload.d) {
                Ok(ready) => {
                    info!(session_id = %ready.session_id, "Gateway session ready");
                    session.session_id = Some(ready.session_id);
                    session.resume_url = ready.resume_gateway_url;
                    self.set_state(ConnectionState::Active);
                }
                Err(e) => warn!(error = %e, "Malformed READY payload"),
            },
            Some("RESUMED") => {
                info!("Gateway session resumed");
                self.set_state(ConnectionState::Active);
            }
            Some("MESSAGE_CREATE") => match serde_json::from_value::<MessagePayload>(payload.d) {
                Ok(message) => self.deliver(message.into_event(), dedup).await,
                Err(e) => warn!(error = %e, "Malformed MESSAGE_CREATE payload"),
            },
            Some(other) => debug!(event = other, "Ignoring dispatch"),
            None => {}
        }
    }

    async fn deliver(&self, event: InboundEvent, dedup: &mut RecentIds) {
        if !self.accepts(&event.channel_id) {
            debug!(channel_id = %event.channel_id, "Event from unmonitored channel dropped");
            return;
        }
        if !dedup.insert(&event.id) {
            debug!(event_id = %event.id, "Duplicate event suppressed");
            return;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.handler.on_event(event).await;
    }
}

// ── Session tasks ───────────────────────────────────────────────────

async fn write_loop(
    mut sink: WsWriter,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        warn!(error = %e, "Gateway write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Gateway socket close");
    }
}

async fn heartbeat_loop(
    every: Duration,
    state: SharedHeartbeat,
    out: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let mut tick = interval(every.max(Duration::from_millis(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let seq = {
                    let mut hb = lock(&state);
                    hb.mark_sent(Instant::now());
                    hb.seq
                };
                if send_json(&out, &protocol::heartbeat(seq)).await.is_err() {
                    break;
                }
                debug!(?seq, "Heartbeat sent");
            }
        }
    }
}

async fn watchdog_loop(
    limit: Duration,
    state: SharedHeartbeat,
    stalled: CancellationToken,
    cancel: CancellationToken,
) {
    let mut tick = interval((limit / 8).max(Duration::from_millis(5)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let unacked = lock(&state).unacked_for(Instant::now());
                if let Some(waited) = unacked.filter(|w| *w > limit) {
                    warn!(
                        waited_ms = waited.as_millis() as u64,
                        limit_ms = limit.as_millis() as u64,
                        "Heartbeat not acknowledged, dropping connection"
                    );
                    stalled.cancel();
                    break;
                }
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

async fn read_hello(stream: &mut WsReader) -> Result<Hello, GatewayError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let payload = GatewayPayload::parse(text.as_str())?;
                if payload.op != OP_HELLO {
                    return Err(GatewayError::Handshake(format!(
                        "expected Hello, got op {}",
                        payload.op
                    )));
                }
                return serde_json::from_value(payload.d)
                    .map_err(|e| GatewayError::Handshake(format!("bad Hello: {e}")));
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = close_parts(frame);
                return Err(protocol::close_error(code, &reason));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(GatewayError::Handshake(e.to_string())),
            None => return Err(GatewayError::Handshake("closed before Hello".into())),
        }
    }
}

async fn send_json(out: &mpsc::Sender<Message>, value: &Value) -> Result<(), GatewayError> {
    out.send(Message::Text(value.to_string().into()))
        .await
        .map_err(|_| GatewayError::Closed {
            code: None,
            reason: "writer stopped".into(),
        })
}

fn close_parts(frame: Option<CloseFrame>) -> (Option<u16>, String) {
    match frame {
        Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_string()),
        None => (None, String::new()),
    }
}

fn connect_error(url: &str, err: tungstenite::Error) -> GatewayError {
    if let tungstenite::Error::Http(response) = &err
        && response.status().as_u16() == 401
    {
        return GatewayError::AuthFailed("gateway rejected the token (HTTP 401)".into());
    }
    GatewayError::Connect {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

/// The resume URL comes without query parameters; reuse the configured ones.
fn resume_endpoint(resume_url: &str, base_url: &str) -> String {
    if resume_url.contains('?') {
        return resume_url.to_string();
    }
    match base_url.split_once('?') {
        Some((_, query)) => format!("{}/?{query}", resume_url.trim_end_matches('/')),
        None => resume_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unacked_time_counts_from_oldest_heartbeat() {
        let mut hb = HeartbeatState::default();
        assert!(hb.unacked_for(Instant::now()).is_none());

        let first = Instant::now();
        hb.mark_sent(first);
        tokio::time::advance(Duration::from_millis(500)).await;
        hb.mark_sent(Instant::now());
        tokio::time::advance(Duration::from_millis(500)).await;

        assert_eq!(hb.unacked_for(Instant::now()), Some(Duration::from_secs(1)));
        hb.mark_acked();
        assert!(hb.unacked_for(Instant::now()).is_none());
        assert_eq!(hb.sent, 2);
    }

    #[test]
    fn session_resumable_needs_id_and_sequence() {
        let mut session = Session::default();
        assert!(session.resumable().is_none());
        session.session_id = Some("abc".into());
        assert!(session.resumable().is_none());
        session.seq = Some(12);
        assert_eq!(session.resumable(), Some(("abc", 12)));
        session.invalidate();
        assert!(session.resumable().is_none());
    }

    #[test]
    fn resume_endpoint_keeps_query() {
        assert_eq!(
            resume_endpoint(
                "wss://gateway-us-east1-b.discord.gg",
                "wss://gateway.discord.gg/?v=10&encoding=json"
            ),
            "wss://gateway-us-east1-b.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(
            resume_endpoint("ws://127.0.0.1:9000/?v=10", "ws://x/?v=9"),
            "ws://127.0.0.1:9000/?v=10"
        );
        assert_eq!(resume_endpoint("ws://a", "ws://b"), "ws://a");
    }

    #[test]
    fn close_frame_parts() {
        let frame = CloseFrame {
            code: 4004.into(),
            reason: "Authentication failed.".into(),
        };
        assert_eq!(
            close_parts(Some(frame)),
            (Some(4004), "Authentication failed.".to_string())
        );
        assert_eq!(close_parts(None), (None, String::new()));
    }
}
