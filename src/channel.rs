//! A single live peer connection.
//!
//! A channel couples the framed transport with per-peer state, the
//! channel timers, and the protocols attached after promotion. The
//! transport lives inside the channel task; everyone else talks to the
//! channel through its command queue.
//!
//! Lifecycle: `Germinating` on accept/connect, `Handshaking` once bytes
//! flow, `Active` after version/verack completes and the channel is stored
//! in the connection registry, `Stopped` exactly once thereafter.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tokio_util::codec::Framed;

use crate::config::ADDRESS_PROTOCOL_VERSION;
use crate::context::Context;
use crate::error::{P2pError, P2pResult};
use crate::protocol::{version, Action, AddressProtocol, PingProtocol, Protocol};
use crate::wire::{Message, MessageCodec, VersionMessage};

/// Who initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer.
    Outbound,
    /// The peer dialed us.
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, no bytes exchanged yet.
    Germinating,
    /// Version handshake in progress.
    Handshaking,
    /// Promoted into the connection registry.
    Active,
    /// Stopped; terminal.
    Stopped,
}

/// Work queued onto the channel task.
pub(crate) enum ChannelCommand {
    /// Write a message to the peer.
    Send(Message),
    /// Tear the channel down with a code.
    Stop(P2pError),
}

/// One established, framed peer connection.
pub struct Channel {
    addr: SocketAddr,
    direction: Direction,
    nonce: u64,
    state: Mutex<ChannelState>,
    peer_version: Mutex<Option<VersionMessage>>,
    last_activity: Mutex<Instant>,
    stopped: AtomicBool,
    stop_tx: watch::Sender<Option<P2pError>>,
    cmd_tx: mpsc::UnboundedSender<ChannelCommand>,
    taps: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
}

impl Channel {
    /// Create a germinating channel with a fresh handshake nonce.
    pub(crate) fn new(
        addr: SocketAddr,
        direction: Direction,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(None);
        let nonce = rand::thread_rng().gen_range(1..=u64::MAX);

        let channel = Arc::new(Self {
            addr,
            direction,
            nonce,
            state: Mutex::new(ChannelState::Germinating),
            peer_version: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            stopped: AtomicBool::new(false),
            stop_tx,
            cmd_tx,
            taps: Mutex::new(Vec::new()),
        });
        (channel, cmd_rx)
    }

    /// A detached channel for registry tests; its command queue is closed.
    #[cfg(test)]
    pub(crate) fn for_tests(addr: SocketAddr, direction: Direction) -> Arc<Self> {
        let (channel, _cmd_rx) = Self::new(addr, direction);
        channel
    }

    /// Remote endpoint.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connection direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Our handshake nonce for this channel.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.state.lock().expect("channel state poisoned")
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        *self.state.lock().expect("channel state poisoned") = state;
    }

    /// The peer's version message, available once handshaken.
    pub fn peer_version(&self) -> Option<VersionMessage> {
        self.peer_version
            .lock()
            .expect("peer version poisoned")
            .clone()
    }

    pub(crate) fn set_peer_version(&self, version: VersionMessage) {
        *self.peer_version.lock().expect("peer version poisoned") = Some(version);
    }

    /// The peer's advertised start height, zero before handshake.
    pub fn peer_height(&self) -> u64 {
        self.peer_version().map(|v| v.start_height).unwrap_or(0)
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock().expect("activity poisoned") = Instant::now();
    }

    pub(crate) fn last_activity(&self) -> Instant {
        *self.last_activity.lock().expect("activity poisoned")
    }

    /// Whether the channel is stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// The stop code, once stopped.
    pub fn stop_reason(&self) -> Option<P2pError> {
        self.stop_tx.borrow().clone()
    }

    /// Watch for the stop code. The value is already set if the channel
    /// stopped before the subscription.
    pub fn subscribe_stop(&self) -> watch::Receiver<Option<P2pError>> {
        self.stop_tx.subscribe()
    }

    /// Receive messages the core does not consume, in wire order.
    pub fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.taps.lock().expect("taps poisoned").push(tx);
        rx
    }

    fn forward(&self, message: Message) {
        let mut taps = self.taps.lock().expect("taps poisoned");
        taps.retain(|tap| tap.send(message.clone()).is_ok());
    }

    /// Queue a message for the peer.
    pub fn send(&self, message: Message) -> P2pResult<()> {
        if self.is_stopped() {
            return Err(P2pError::ChannelStopped);
        }
        self.cmd_tx
            .send(ChannelCommand::Send(message))
            .map_err(|_| P2pError::ChannelStopped)
    }

    /// Stop the channel with a code. Idempotent; only the first code wins.
    pub fn stop(&self, code: P2pError) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ChannelState::Stopped);
        self.stop_tx.send_replace(Some(code.clone()));
        let _ = self.cmd_tx.send(ChannelCommand::Stop(code));
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, self.direction)
    }
}

/// The framed transport type driven by the channel task.
pub(crate) type Transport = Framed<TcpStream, MessageCodec>;

/// Dial an address and wrap the socket in a germinating channel.
pub(crate) async fn dial(
    ctx: &Arc<Context>,
    addr: SocketAddr,
) -> P2pResult<(Arc<Channel>, Transport, mpsc::UnboundedReceiver<ChannelCommand>)> {
    let stream = match timeout(ctx.settings.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(P2pError::ChannelTimeout),
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(addr = %addr, error = %e, "failed to set TCP_NODELAY");
    }

    let framed = Framed::new(stream, MessageCodec::new(ctx.settings.magic()));
    let (channel, cmd_rx) = Channel::new(addr, Direction::Outbound);
    Ok((channel, framed, cmd_rx))
}

/// Dial, handshake, and promote an outbound channel.
///
/// Dials to our own advertised address are not short-circuited here; the
/// handshake nonce detects the loopback wherever the packets actually land.
pub(crate) async fn open_outbound(ctx: &Arc<Context>, addr: SocketAddr) -> P2pResult<Arc<Channel>> {
    if ctx.settings.is_blacklisted(&addr) {
        return Err(P2pError::ChannelDropped);
    }

    let (channel, framed, cmd_rx) = dial(ctx, addr).await?;
    establish(ctx, channel, framed, cmd_rx).await
}

/// Handshake and promote an accepted inbound socket.
pub(crate) async fn accept_inbound(
    ctx: &Arc<Context>,
    stream: TcpStream,
    addr: SocketAddr,
) -> P2pResult<Arc<Channel>> {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(addr = %addr, error = %e, "failed to set TCP_NODELAY");
    }

    let framed = Framed::new(stream, MessageCodec::new(ctx.settings.magic()));
    let (channel, cmd_rx) = Channel::new(addr, Direction::Inbound);
    establish(ctx, channel, framed, cmd_rx).await
}

/// Run the version handshake under the pending registry, then promote.
async fn establish(
    ctx: &Arc<Context>,
    channel: Arc<Channel>,
    mut framed: Transport,
    cmd_rx: mpsc::UnboundedReceiver<ChannelCommand>,
) -> P2pResult<Arc<Channel>> {
    channel.set_state(ChannelState::Handshaking);
    ctx.pending.store(channel.clone()).await?;
    let result = version::perform(&mut framed, &channel, ctx).await;
    let _ = ctx.pending.remove(&channel).await;

    let peer_version = match result {
        Ok(peer_version) => peer_version,
        Err(e) => {
            tracing::debug!(channel = %channel, error = %e, "handshake failed");
            channel.stop(e.clone());
            return Err(e);
        }
    };

    channel.set_peer_version(peer_version.clone());
    promote(ctx, channel, framed, cmd_rx, peer_version).await
}

/// Store the handshaken channel, attach its protocols, start its task and
/// notify subscribers.
async fn promote(
    ctx: &Arc<Context>,
    channel: Arc<Channel>,
    framed: Transport,
    cmd_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    peer_version: VersionMessage,
) -> P2pResult<Arc<Channel>> {
    channel.set_state(ChannelState::Active);
    channel.touch();

    if let Err(e) = ctx.connections.store(channel.clone()).await {
        tracing::debug!(channel = %channel, error = %e, "channel rejected by registry");
        channel.stop(e.clone());
        return Err(e);
    }

    let mut protocols: Vec<Box<dyn Protocol>> = vec![Box::new(PingProtocol::new())];
    if peer_version.protocol_version >= ADDRESS_PROTOCOL_VERSION {
        protocols.push(Box::new(AddressProtocol::new(
            ctx.settings.host_pool_capacity,
        )));
    }

    let task_ctx = ctx.clone();
    let task_channel = channel.clone();
    ctx.pool
        .spawn(async move { run(task_ctx, task_channel, framed, cmd_rx, protocols).await });

    ctx.subscriber.relay(Ok(channel.clone()));
    tracing::info!(
        channel = %channel,
        peer_height = peer_version.start_height,
        agent = %peer_version.user_agent,
        "channel promoted"
    );
    Ok(channel)
}

/// Apply protocol actions to the transport and facilities.
async fn execute(
    ctx: &Arc<Context>,
    framed: &mut Transport,
    actions: Vec<Action>,
) -> Result<(), P2pError> {
    for action in actions {
        match action {
            Action::Send(message) => framed.send(message).await?,
            Action::StoreAddresses(list) => {
                tracing::debug!(count = list.len(), "storing gossiped addresses");
                ctx.hosts.store_many(list).await?;
            }
            Action::SendAddresses { max } => {
                let sample = ctx.hosts.sample(max).await;
                framed.send(Message::Addresses(sample)).await?;
            }
            Action::RequestAddresses { below } => {
                if ctx.hosts.count().await < below {
                    framed.send(Message::GetAddresses).await?;
                }
            }
            Action::Stop(code) => return Err(code),
        }
    }
    Ok(())
}

/// Route one received message through the attached protocols.
async fn dispatch(
    ctx: &Arc<Context>,
    channel: &Arc<Channel>,
    framed: &mut Transport,
    protocols: &mut [Box<dyn Protocol>],
    message: Message,
) -> Result<(), P2pError> {
    for protocol in protocols.iter_mut() {
        if let Some(actions) = protocol.on_message(&message) {
            return execute(ctx, framed, actions).await;
        }
    }

    match message {
        Message::Unknown { .. } => {
            channel.forward(message);
            Ok(())
        }
        Message::Version(_) | Message::Verack => Err(P2pError::BadStream(
            "handshake message on active channel".to_string(),
        )),
        other => {
            tracing::trace!(channel = %channel, message = %other, "unconsumed message ignored");
            Ok(())
        }
    }
}

/// The channel task: pumps the transport, drives the timers and executes
/// protocol actions until the channel stops.
async fn run(
    ctx: Arc<Context>,
    channel: Arc<Channel>,
    mut framed: Transport,
    mut cmd_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    mut protocols: Vec<Box<dyn Protocol>>,
) {
    let settings = ctx.settings.clone();
    let mut shutdown = ctx.pool.shutdown_signal();

    let promoted_at = Instant::now();
    let expiration = sleep_until(promoted_at + settings.channel_expiration);
    tokio::pin!(expiration);
    let mut heartbeat = interval_at(
        promoted_at + settings.channel_heartbeat,
        settings.channel_heartbeat,
    );
    let mut revival = interval_at(
        promoted_at + settings.channel_revival,
        settings.channel_revival,
    );

    let mut attach_actions = Vec::new();
    for protocol in protocols.iter_mut() {
        attach_actions.extend(protocol.on_attach());
    }
    let mut pending_stop = execute(&ctx, &mut framed, attach_actions).await.err();

    let stop_code = loop {
        if let Some(code) = pending_stop.take() {
            break code;
        }
        if channel.is_stopped() {
            break channel.stop_reason().unwrap_or(P2pError::ChannelStopped);
        }

        let inactivity_deadline = channel.last_activity() + settings.channel_inactivity;

        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(message)) => {
                    channel.touch();
                    tracing::trace!(channel = %channel, message = %message, "received");
                    pending_stop = dispatch(&ctx, &channel, &mut framed, &mut protocols, message)
                        .await
                        .err();
                }
                Some(Err(e)) => break e,
                None => break P2pError::ChannelDropped,
            },

            cmd = cmd_rx.recv() => match cmd {
                Some(ChannelCommand::Send(message)) => {
                    if let Err(e) = framed.send(message).await {
                        break e;
                    }
                }
                Some(ChannelCommand::Stop(code)) => break code,
                None => break P2pError::ChannelStopped,
            },

            _ = heartbeat.tick() => {
                let mut actions = Vec::new();
                for protocol in protocols.iter_mut() {
                    actions.extend(protocol.on_heartbeat());
                }
                pending_stop = execute(&ctx, &mut framed, actions).await.err();
            }

            _ = revival.tick() => {
                let mut actions = Vec::new();
                for protocol in protocols.iter_mut() {
                    actions.extend(protocol.on_revival());
                }
                pending_stop = execute(&ctx, &mut framed, actions).await.err();
            }

            _ = &mut expiration => {
                tracing::debug!(channel = %channel, "channel expired, rotating");
                break P2pError::ChannelTimeout;
            }

            _ = sleep_until(inactivity_deadline) => {
                // Re-check: activity may have advanced while this arm was armed.
                if channel.last_activity() + settings.channel_inactivity <= Instant::now() {
                    tracing::debug!(channel = %channel, "channel inactive");
                    break P2pError::ChannelTimeout;
                }
            }

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break P2pError::ServiceStopped;
                }
            }
        }
    };

    channel.stop(stop_code.clone());
    for protocol in protocols.iter_mut() {
        protocol.on_stop(&stop_code);
    }
    let _ = ctx.connections.remove(&channel).await;
    let _ = ctx.pending.remove(&channel).await;
    tracing::debug!(channel = %channel, code = %stop_code, "channel stopped");
}
