//! Per-relay connection lifecycle.
//!
//! Each relay gets one task owning the socket. The task connects (optionally
//! through a SOCKS5 proxy), replays open subscriptions after every
//! reconnect, forwards parsed frames into the shared ingest queue, and backs
//! off exponentially with jitter between attempts. State transitions are
//! observable through a watch channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::subscription::{IngestSender, SubRegistry, SubState, SubscriptionEvent};
use crate::wire::{ClientRequest, RelayResponse};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PINGS: u32 = 3;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

/// Socket-level knobs shared by every connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub socks_proxy: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            connect_timeout: Duration::from_secs(10),
            socks_proxy: None,
        }
    }
}

/// Count of currently connected relays, watchable by the controller.
#[derive(Clone)]
pub struct ConnectedGauge {
    tx: Arc<watch::Sender<usize>>,
}

impl ConnectedGauge {
    pub fn new() -> (ConnectedGauge, watch::Receiver<usize>) {
        let (tx, rx) = watch::channel(0);
        (ConnectedGauge { tx: Arc::new(tx) }, rx)
    }

    fn add(&self, delta: isize) {
        self.tx.send_modify(|c| *c = c.saturating_add_signed(delta));
    }
}

enum Command {
    Send(ClientRequest),
    Disconnect,
}

/// Handle to one relay's connection task.
pub struct RelayConnection {
    uri: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnState>,
    task: JoinHandle<()>,
}

impl RelayConnection {
    /// Start the connection task; it begins connecting immediately.
    pub fn spawn(
        uri: String,
        opts: ConnectOptions,
        registry: SubRegistry,
        queue: IngestSender,
        gauge: ConnectedGauge,
    ) -> RelayConnection {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnState::Idle);
        let task = tokio::spawn(run(
            uri.clone(),
            opts,
            registry,
            queue,
            gauge,
            cmd_rx,
            state_tx,
        ));
        RelayConnection {
            uri,
            cmd_tx,
            state_rx,
            task,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    /// Wait for the first connect attempt to resolve. Idempotent: returns
    /// true immediately when already connected. The task keeps retrying in
    /// the background either way.
    pub async fn connect(&self, wait: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let outcome = timeout(wait, async {
            loop {
                match *rx.borrow_and_update() {
                    ConnState::Connected => return true,
                    ConnState::Failed => return false,
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        matches!(outcome, Ok(true))
    }

    /// Queue a request for in-order delivery. Returns false when the
    /// connection task is gone.
    pub fn send(&self, req: ClientRequest) -> bool {
        self.cmd_tx.send(Command::Send(req)).is_ok()
    }

    /// Close the socket and stop the task.
    pub async fn disconnect(mut self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
        if timeout(Duration::from_secs(2), &mut self.task).await.is_err() {
            self.task.abort();
        }
    }
}

enum End {
    Disconnect,
    Failed,
}

async fn run(
    uri: String,
    opts: ConnectOptions,
    registry: SubRegistry,
    queue: IngestSender,
    gauge: ConnectedGauge,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnState>,
) {
    let mut backoff = Backoff::new();
    loop {
        let _ = state_tx.send(ConnState::Connecting);
        let ws = match timeout(
            opts.connect_timeout,
            connect_ws(&uri, opts.socks_proxy.as_deref()),
        )
        .await
        {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                warn!(relay = %uri, error = %e, "connect failed");
                if !wait_backoff(&mut backoff, &mut cmd_rx, &state_tx).await {
                    break;
                }
                continue;
            }
            Err(_) => {
                warn!(relay = %uri, "connect timed out");
                if !wait_backoff(&mut backoff, &mut cmd_rx, &state_tx).await {
                    break;
                }
                continue;
            }
        };
        info!(relay = %uri, "connected");
        gauge.add(1);
        let _ = state_tx.send(ConnState::Connected);
        backoff.reset();
        let end = run_connected(&uri, ws, &registry, &queue, &mut cmd_rx).await;
        gauge.add(-1);
        match end {
            End::Disconnect => {
                let _ = state_tx.send(ConnState::Disconnecting);
                break;
            }
            End::Failed => {
                if !wait_backoff(&mut backoff, &mut cmd_rx, &state_tx).await {
                    break;
                }
            }
        }
    }
    let _ = state_tx.send(ConnState::Idle);
}

/// Sleep out one back-off step while staying responsive to disconnect.
/// Returns false when the task should stop.
async fn wait_backoff(
    backoff: &mut Backoff,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    state_tx: &watch::Sender<ConnState>,
) -> bool {
    let _ = state_tx.send(ConnState::Failed);
    let slept = sleep(backoff.next_delay());
    tokio::pin!(slept);
    loop {
        tokio::select! {
            _ = &mut slept => return true,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Disconnect) => return false,
                Some(Command::Send(_)) => {
                    debug!("dropping request while disconnected");
                }
            },
        }
    }
}

async fn run_connected(
    uri: &str,
    ws: WsStream,
    registry: &SubRegistry,
    queue: &IngestSender,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> End {
    let (mut sink, mut stream) = ws.split();

    // replay surviving subscriptions with their original ids
    for (sub_id, filters) in registry.open_on(uri) {
        registry.mark(&sub_id, SubState::Open);
        let req = ClientRequest::Req {
            sub_id: sub_id.clone(),
            filters,
        };
        match req.encode() {
            Ok(text) => {
                debug!(relay = %uri, sub_id, "replaying subscription");
                if sink.send(Message::Text(text)).await.is_err() {
                    return End::Failed;
                }
            }
            Err(e) => warn!(relay = %uri, error = %e, "unencodable replay dropped"),
        }
    }

    let mut ping = interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed_pings: u32 = 0;
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Disconnect) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return End::Disconnect;
                }
                Some(Command::Send(req)) => match req.encode() {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            return End::Failed;
                        }
                    }
                    Err(e) => warn!(relay = %uri, error = %e, "unencodable request dropped"),
                },
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(uri, &text, registry, queue),
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        return End::Failed;
                    }
                }
                Some(Ok(Message::Pong(_))) => missed_pings = 0,
                Some(Ok(Message::Close(_))) | None => return End::Failed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(relay = %uri, error = %e, "socket error");
                    return End::Failed;
                }
            },
            _ = ping.tick() => {
                if missed_pings >= MAX_MISSED_PINGS {
                    warn!(relay = %uri, "ping timeout");
                    return End::Failed;
                }
                missed_pings += 1;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    return End::Failed;
                }
            }
        }
    }
}

/// Parse one text frame and fan it into the registry and ingest queue.
/// Malformed frames are dropped; the connection continues.
fn handle_frame(uri: &str, text: &str, registry: &SubRegistry, queue: &IngestSender) {
    match RelayResponse::parse(text) {
        Ok(RelayResponse::Event { sub_id, event }) => {
            registry.record_event(&sub_id, text.len());
            let _ = queue.send((uri.to_string(), SubscriptionEvent::EventAppeared(event)));
        }
        Ok(RelayResponse::Eose { sub_id }) => {
            registry.mark(&sub_id, SubState::EoseSeen);
            let _ = queue.send((uri.to_string(), SubscriptionEvent::Eose(sub_id)));
        }
        Ok(RelayResponse::Closed { sub_id, reason }) => {
            registry.mark(&sub_id, SubState::Closed);
            let _ = queue.send((uri.to_string(), SubscriptionEvent::Closed(sub_id, reason)));
        }
        Ok(RelayResponse::Ok {
            event_id,
            accepted,
            message,
        }) => debug!(relay = %uri, event_id, accepted, message, "publish ack"),
        Ok(RelayResponse::Notice { message }) => warn!(relay = %uri, message, "relay notice"),
        Err(e) => warn!(relay = %uri, error = %e, "dropping malformed frame"),
    }
}

type WsStream = WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(uri: &str, socks_proxy: Option<&str>) -> Result<WsStream> {
    let url = Url::parse(uri)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = uri.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = socks_proxy {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Backoff {
        Backoff { next: BACKOFF_BASE }
    }

    fn reset(&mut self) {
        self.next = BACKOFF_BASE;
    }

    /// Doubles up to the cap; each step gets ±25% jitter.
    fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (base * 2).min(BACKOFF_CAP);
        base.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
    }
}
