use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use futures::FutureExt;
use glam::Vec3;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};
use uuid::Uuid;
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::packet_pool::PacketPool;
use crate::config::ClientStackConfig;
use crate::dispatch::{default_handlers, DispatchRouter, HandlerRegistry, PacketHandler};
use crate::duplicate_tracker::DuplicateTracker;
use crate::events::EventBus;
use crate::packet::{append_acks, Message, Packet, PacketType, ACK_LEN};
use crate::reliable_ledger::ReliableLedger;
use crate::scene::Scene;
use crate::sequence::SequenceAllocator;
use crate::serializers;
use crate::serializers::{ChatArgs, TerseUpdate};
use crate::session::{AuthenticateResponse, LoginInfo, SessionAuthenticator};
use crate::throttle::{ThrottleCategory, ThrottleRates};
use crate::throttled_queue::{Delivery, OutgoingPacket, QueueItem, ThrottledQueue};
use crate::transport::PacketTransport;

/// The alert a viewer receives (once) when a packet handler failed for its connection
pub const SESSION_CRASHED_MESSAGE: &str = "Your session has crashed; further actions will not be processed.";

/// a `PacketAck` carries its ids in a block with a u8 count
const MAX_ACKS_PER_PACKET: usize = u8::MAX as usize;

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    }
    else if let Some(s) = payload.downcast_ref::<String>() {
        s
    }
    else {
        "<non-string panic payload>"
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ConnectionState {
    Authenticating,
    /// Circuit authenticated and registered with the scene. The connection may additionally be
    ///  blocked, see [Connection::is_blocked].
    Active,
    Closing,
    Closed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CloseReason {
    AuthenticationFailed,
    /// the viewer logged out
    Logout,
    /// the viewer closed the circuit without logging out
    CircuitClosed,
    Kicked,
    /// the viewer did not send any packets for too long
    TimedOut,
    /// sending a packet failed
    TransportFault,
    /// server-initiated teardown, e.g. after the agent left the region
    CircuitShutdown,
}

/// The triple a viewer presents in `UseCircuitCode`
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CircuitIdentity {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}

/// Collaborators and resources shared by all connections of a server
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<ClientStackConfig>,
    pub transport: Arc<dyn PacketTransport>,
    pub authenticator: Arc<dyn SessionAuthenticator>,
    pub scene: Arc<dyn Scene>,
    /// handlers consulted for packets that have no connection-local handler
    pub global_handlers: Arc<HandlerRegistry>,
    pub default_handlers: Arc<HandlerRegistry>,
    pub packet_pool: Arc<PacketPool>,
    pub buffer_pool: Arc<BufferPool>,
}

impl ConnectionContext {
    pub fn new(
        config: ClientStackConfig,
        transport: Arc<dyn PacketTransport>,
        authenticator: Arc<dyn SessionAuthenticator>,
        scene: Arc<dyn Scene>,
    ) -> anyhow::Result<ConnectionContext> {
        config.validate()?;

        Ok(ConnectionContext {
            packet_pool: Arc::new(PacketPool::from_config(&config)),
            buffer_pool: Arc::new(BufferPool::new(config.max_packet_size, config.buffer_pool_size)),
            config: Arc::new(config),
            transport,
            authenticator,
            scene,
            global_handlers: Arc::new(HandlerRegistry::new()),
            default_handlers: Arc::new(default_handlers()),
        })
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionStats {
    pub packets_in: u64,
    pub packets_out: u64,
    pub packets_resent: u64,
    pub duplicates_dropped: u64,
    pub unacked_packets: usize,
    pub unacked_bytes: usize,
    pub pending_acks: usize,
    pub probe_failures: u32,
}

#[derive(Default)]
struct Counters {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    packets_resent: AtomicU64,
    duplicates_dropped: AtomicU64,
}

/// The server side of a viewer's circuit.
///
/// All inbound and outbound packets of a connection pass through its throttled queue and are
///  processed by a single task, the *client loop*. That task authenticates the circuit first,
///  then drains the queue until the connection is closed: it dispatches inbound packets (after
///  ack bookkeeping and duplicate suppression) and puts outbound packets on the wire in the
///  order the category budgets allow.
///
/// Two timer tasks run alongside the client loop while it is active: the ack / resend timer
///  sends standalone acks and re-sends overdue reliable packets, and the liveness timer probes
///  a silent viewer with pings and times the connection out eventually.
///
/// All termination goes through [Connection::close], which closes the queue: the client loop
///  then flushes remaining outbound packets, waits for the timers to stop, deregisters from
///  the scene and moves to [ConnectionState::Closed].
pub struct Connection {
    identity: CircuitIdentity,
    remote_addr: SocketAddr,
    proxy_addr: Mutex<Option<SocketAddr>>,
    context: ConnectionContext,

    login: Mutex<Option<LoginInfo>>,
    start_position: Mutex<Vec3>,

    sequences: SequenceAllocator,
    duplicates: DuplicateTracker,
    ledger: ReliableLedger,
    queue: ThrottledQueue,
    router: DispatchRouter,
    events: EventBus,

    state: watch::Sender<ConnectionState>,
    close_reason: Mutex<Option<CloseReason>>,
    blocked: AtomicBool,
    inbound_since_probe: AtomicBool,
    probe_failures: AtomicU32,
    next_ping_id: AtomicU8,
    crash_alert_sent: AtomicBool,
    counters: Counters,

    client_loop: Mutex<Option<JoinHandle<()>>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{agent:{}, circuit:{}, remote:{:?}}}", self.identity.agent_id, self.identity.circuit_code, self.remote_addr)
    }
}

impl Connection {
    pub fn new(identity: CircuitIdentity, remote_addr: SocketAddr, context: ConnectionContext) -> Arc<Connection> {
        let config = context.config.clone();
        let (state, _) = watch::channel(ConnectionState::Authenticating);

        Arc::new(Connection {
            identity,
            remote_addr,
            proxy_addr: Mutex::new(None),
            login: Mutex::new(None),
            start_position: Mutex::new(Vec3::ZERO),
            sequences: SequenceAllocator::new(config.max_sequence),
            duplicates: DuplicateTracker::new(config.dupe_window),
            ledger: ReliableLedger::new(&config),
            queue: ThrottledQueue::new(config.throttle.initial_rates, config.throttle.burst, config.max_packet_size),
            router: DispatchRouter::new(context.global_handlers.clone(), context.default_handlers.clone()),
            events: EventBus::new(),
            state,
            close_reason: Mutex::new(None),
            blocked: AtomicBool::new(false),
            inbound_since_probe: AtomicBool::new(false),
            probe_failures: AtomicU32::new(0),
            next_ping_id: AtomicU8::new(0),
            crash_alert_sent: AtomicBool::new(false),
            counters: Counters::default(),
            client_loop: Mutex::new(None),
            timers: Mutex::new(Vec::new()),
            context,
        })
    }

    /// Spawns the client loop, which authenticates the circuit and processes packets until the
    ///  connection is closed
    pub fn start(self: &Arc<Self>) {
        let span = info_span!("connection", agent_id = %self.identity.agent_id, circuit_code = self.identity.circuit_code);
        let handle = tokio::spawn(self.clone().run().instrument(span));
        *self.client_loop.lock().unwrap() = Some(handle);
    }

    async fn run(self: Arc<Self>) {
        if !self.authenticate().await {
            self.close_reason.lock().unwrap()
                .get_or_insert(CloseReason::AuthenticationFailed);
            self.queue.close();
            self.state.send_replace(ConnectionState::Closed);
            return;
        }

        if self.state() >= ConnectionState::Closing {
            debug!("connection was closed during authentication");
            self.finish(false).await;
            return;
        }

        self.start_timers();
        self.context.scene.add_connection(self.clone()).await;
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Authenticating {
                *s = ConnectionState::Active;
                true
            }
            else {
                false
            }
        });
        info!("circuit established with {:?}", self.remote_addr);

        self.client_loop().await;
        self.finish(true).await;
    }

    async fn authenticate(&self) -> bool {
        let id = &self.identity;
        match self.context.authenticator.authenticate(id.session_id, id.agent_id, id.circuit_code).await {
            Ok(AuthenticateResponse { authorized: true, login_info }) => {
                let login_info = login_info.unwrap_or_default();
                debug!("circuit authenticated for {} {}", login_info.first_name, login_info.last_name);
                *self.start_position.lock().unwrap() = login_info.start_position;
                *self.login.lock().unwrap() = Some(login_info);
                true
            }
            Ok(_) => {
                warn!("circuit authentication failed: agent {} session {} circuit {} from {:?}", id.agent_id, id.session_id, id.circuit_code, self.remote_addr);
                false
            }
            Err(e) => {
                warn!("error authenticating circuit {} for agent {} from {:?}: {}", id.circuit_code, id.agent_id, self.remote_addr, e);
                false
            }
        }
    }

    fn start_timers(self: &Arc<Self>) {
        let config = &self.context.config;

        let ack_timer = {
            let connection = self.clone();
            let period = config.ack_interval;
            tokio::spawn(async move {
                connection.run_timer(period, |c| c.ack_resend_tick(Instant::now())).await
            }.instrument(Span::current()))
        };
        let ping_timer = {
            let connection = self.clone();
            let period = config.ping_interval;
            tokio::spawn(async move {
                connection.run_timer(period, |c| c.check_liveness()).await
            }.instrument(Span::current()))
        };

        self.timers.lock().unwrap()
            .extend([ack_timer, ping_timer]);
    }

    /// calls `on_tick` every `period` until the connection starts closing
    async fn run_timer(&self, period: Duration, on_tick: impl Fn(&Connection)) {
        let mut state = self.state.subscribe();
        let mut interval = interval_at(Instant::now() + period, period);
        loop {
            if *state.borrow_and_update() >= ConnectionState::Closing {
                break;
            }

            tokio::select! {
                _ = interval.tick() => on_tick(self),
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        trace!("timer stopped");
    }

    async fn client_loop(&self) {
        loop {
            match self.queue.dequeue().await {
                QueueItem::Incoming(packet) => self.process_inbound(packet).await,
                QueueItem::Outgoing(packet) => {
                    if let Err(e) = self.process_outbound(packet).await {
                        error!("error sending packet to {:?}: {} - closing connection", self.send_addr(), e);
                        self.close(CloseReason::TransportFault);
                    }
                }
                QueueItem::Poison => break,
            }
        }
        debug!("client loop terminated");
    }

    async fn finish(&self, registered: bool) {
        // acks that could not be appended, e.g. for a LogoutRequest
        self.send_pending_acks();

        let remaining = self.queue.flush();
        if self.close_reason() == Some(CloseReason::TransportFault) {
            debug!("discarding {} outbound packets after transport fault", remaining.len());
        }
        else {
            for packet in remaining {
                if let Err(e) = self.process_outbound(packet).await {
                    debug!("error flushing outbound packets: {}", e);
                    break;
                }
            }
        }

        let timers = std::mem::take(&mut *self.timers.lock().unwrap());
        for timer in timers {
            if let Err(e) = timer.await {
                error!("timer task failed: {}", e);
            }
        }

        if registered {
            self.context.scene.remove_connection(self.identity.agent_id).await;
        }
        self.state.send_replace(ConnectionState::Closed);
        info!("connection closed: {:?}", self.close_reason());
    }

    /// Hands a packet received from the viewer to the client loop for processing
    pub fn in_packet(&self, packet: Packet) {
        if self.state() >= ConnectionState::Closing {
            trace!("connection is closing: dropping inbound {:?}", packet.packet_type());
            self.context.packet_pool.release(packet);
            return;
        }
        self.queue.enqueue_incoming(packet);
    }

    async fn process_inbound(&self, packet: Packet) {
        self.counters.packets_in.fetch_add(1, Ordering::Relaxed);
        self.inbound_since_probe.store(true, Ordering::Release);
        self.probe_failures.store(0, Ordering::Release);
        self.blocked.store(false, Ordering::Release);

        for &ack in &packet.header.appended_acks {
            self.ledger.ack_received(ack);
        }
        if let Message::PacketAck(acks) = &packet.message {
            for &ack in &acks.ids {
                self.ledger.ack_received(ack);
            }
        }

        let sequence = packet.sequence();
        let packet_type = packet.packet_type();
        if packet.is_reliable() {
            self.ledger.queue_pending_ack(sequence);
        }

        if self.duplicates.seen(sequence, packet_type) {
            debug!("dropping duplicate {:?} #{}", packet_type, sequence);
            self.counters.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            self.context.packet_pool.release(packet);
            return;
        }

        trace!("dispatching {:?} #{}", packet_type, sequence);
        let packet = self.context.packet_pool.check_out(packet);
        match AssertUnwindSafe(self.router.dispatch(self, &packet)).catch_unwind().await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => debug!("unhandled packet {:?}", packet_type),
            Ok(Err(e)) => {
                error!("error handling {:?} for agent {}: {}", packet_type, self.identity.agent_id, e);
                self.notify_crash();
            }
            Err(panic) => {
                error!("handler panicked on {:?} for agent {}: {}", packet_type, self.identity.agent_id, panic_message(&*panic));
                self.notify_crash();
            }
        }
    }

    async fn process_outbound(&self, packet: OutgoingPacket) -> anyhow::Result<()> {
        let OutgoingPacket { mut bytes, packet_type, sequence, delivery, category } = packet;

        let tracked = (delivery == Delivery::Reliable).then(|| bytes.to_vec());
        if delivery != Delivery::Resend {
            let room = self.context.config.max_packet_size.saturating_sub(bytes.len() + 1) / ACK_LEN;
            let acks = self.ledger.take_appended_acks(packet_type, room);
            if !acks.is_empty() {
                trace!("appending {} acks to {:?} #{}", acks.len(), packet_type, sequence);
                append_acks(&mut bytes, &acks);
            }
        }
        if let Some(tracked) = tracked {
            self.ledger.track_for_ack(sequence, packet_type, tracked, category, Instant::now());
        }

        trace!("sending {:?} #{} ({} bytes, {:?})", packet_type, sequence, bytes.len(), delivery);
        let result = self.context.transport.send_packet(self.send_addr(), &bytes).await;
        self.context.buffer_pool.return_to_pool(bytes);
        result?;

        self.counters.packets_out.fetch_add(1, Ordering::Relaxed);
        if delivery == Delivery::Resend {
            self.counters.packets_resent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Queues a packet for sending. A sequence number is assigned and the packet is serialized
    ///  right away, its object is returned to the packet pool. Callable from any thread.
    pub fn out_packet(&self, mut packet: Packet, category: ThrottleCategory) {
        if self.state() == ConnectionState::Closed {
            trace!("connection is closed: dropping outbound {:?}", packet.packet_type());
            self.context.packet_pool.release(packet);
            return;
        }

        packet.header.sequence = self.sequences.next();
        let mut bytes = self.context.buffer_pool.get_from_pool();
        packet.ser(&mut bytes);
        if bytes.len() > self.context.config.max_packet_size {
            warn!("{:?} packet has {} bytes, exceeding the maximum packet size of {}", packet.packet_type(), bytes.len(), self.context.config.max_packet_size);
        }

        let outgoing = OutgoingPacket {
            bytes,
            packet_type: packet.packet_type(),
            sequence: packet.sequence(),
            delivery: if packet.is_reliable() { Delivery::Reliable } else { Delivery::Unreliable },
            category,
        };
        self.context.packet_pool.release(packet);
        self.queue.enqueue(outgoing);
    }

    /// Periodic reliability maintenance: sends pending acks, re-queues overdue reliable packets
    ///  and expires duplicate tracking
    pub(crate) fn ack_resend_tick(&self, now: Instant) {
        self.send_pending_acks();

        for item in self.ledger.resend_due(now) {
            let mut bytes = self.context.buffer_pool.get_from_pool();
            bytes.extend_from_slice(&item.bytes);
            self.queue.enqueue(OutgoingPacket {
                bytes,
                packet_type: item.packet_type,
                sequence: item.sequence,
                delivery: Delivery::Resend,
                category: ThrottleCategory::Resend,
            });
        }

        self.duplicates.sweep_at(now);

        let stats = self.stats();
        trace!(packets_in = stats.packets_in, packets_out = stats.packets_out, resent = stats.packets_resent,
            unacked = stats.unacked_packets, unacked_bytes = stats.unacked_bytes, "packet statistics");
    }

    fn send_pending_acks(&self) {
        loop {
            let acks = self.ledger.take_pending_acks(MAX_ACKS_PER_PACKET);
            if acks.is_empty() {
                break;
            }
            trace!("sending {} standalone acks", acks.len());
            self.send_acks(acks);
        }
    }

    /// One liveness probe: if nothing was received since the previous probe, this counts as a
    ///  failure and the viewer is pinged. The connection is closed when the failures exceed the
    ///  limit, which is higher while the viewer is blocked.
    pub(crate) fn check_liveness(&self) {
        if self.inbound_since_probe.swap(false, Ordering::AcqRel) {
            self.probe_failures.store(0, Ordering::Release);
            return;
        }

        let failures = self.probe_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let limit = if self.is_blocked() {
            self.context.config.max_probe_failures_blocked
        }
        else {
            self.context.config.max_probe_failures
        };

        if failures > limit {
            info!("no packets from viewer for {} probes - disconnecting", failures - 1);
            self.close(CloseReason::TimedOut);
            return;
        }

        trace!("no inbound packets since last probe ({} failures)", failures);
        self.send_start_ping();
    }

    /// Initiates the shutdown of the connection: the client loop terminates once it sees the
    ///  closed queue and then completes the shutdown. Closing a closed connection has no effect;
    ///  the first reason is kept.
    pub fn close(&self, reason: CloseReason) {
        let changed = self.state.send_if_modified(|s| {
            if *s < ConnectionState::Closing {
                *s = ConnectionState::Closing;
                true
            }
            else {
                false
            }
        });
        if changed {
            info!("closing connection: {:?}", reason);
            *self.close_reason.lock().unwrap() = Some(reason);
        }
        self.queue.close();
    }

    /// Server-initiated teardown: sends `DisableSimulator`, closes the connection and waits
    ///  for the client loop to complete. Must not be called from a packet handler, which runs
    ///  on the client loop - handlers call [Connection::close] instead.
    pub async fn shutdown_circuit(&self) {
        if self.state() < ConnectionState::Closing {
            self.send_disable_simulator();
        }
        self.close(CloseReason::CircuitShutdown);

        let handle = self.client_loop.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("client loop failed: {}", e);
            }
        }
    }

    /// Sends `KickUser` and closes the connection
    pub fn kick(&self, reason: &str) {
        let (ip, port) = match self.remote_addr {
            SocketAddr::V4(addr) => (*addr.ip(), addr.port()),
            SocketAddr::V6(addr) => (Ipv4Addr::UNSPECIFIED, addr.port()),
        };
        self.out_packet(serializers::kick_user(&self.context.packet_pool, ip, port, self.identity.agent_id, self.identity.session_id, reason), ThrottleCategory::Task);
        self.close(CloseReason::Kicked);
    }

    fn notify_crash(&self) {
        if !self.crash_alert_sent.swap(true, Ordering::AcqRel) {
            self.send_alert(SESSION_CRASHED_MESSAGE);
        }
    }

    pub fn send_acks(&self, ids: Vec<u32>) {
        self.out_packet(serializers::packet_ack(&self.context.packet_pool, &ids), ThrottleCategory::Unknown);
    }

    pub fn send_start_ping(&self) {
        let ping_id = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
        self.out_packet(serializers::start_ping_check(&self.context.packet_pool, ping_id, self.ledger.oldest_unacked()), ThrottleCategory::Unknown);
    }

    pub fn send_complete_ping(&self, ping_id: u8) {
        self.out_packet(serializers::complete_ping_check(&self.context.packet_pool, ping_id), ThrottleCategory::Unknown);
    }

    pub fn send_alert(&self, message: &str) {
        self.out_packet(serializers::alert_message(&self.context.packet_pool, message), ThrottleCategory::Task);
    }

    pub fn send_chat(&self, chat: &ChatArgs) {
        self.out_packet(serializers::chat_from_simulator(&self.context.packet_pool, chat), ThrottleCategory::Task);
    }

    pub fn send_logout_reply(&self) {
        self.out_packet(serializers::logout_reply(&self.context.packet_pool, self.identity.agent_id, self.identity.session_id), ThrottleCategory::Unknown);
    }

    pub fn send_disable_simulator(&self) {
        self.out_packet(serializers::disable_simulator(&self.context.packet_pool), ThrottleCategory::Unknown);
    }

    pub fn send_enable_simulator(&self, region_handle: u64, ip: Ipv4Addr, port: u16) {
        self.out_packet(serializers::enable_simulator(&self.context.packet_pool, region_handle, ip, port), ThrottleCategory::Unknown);
    }

    pub fn send_movement_complete(&self, look_at: Vec3, region_handle: u64, timestamp: u32, channel_version: &str) {
        let position = self.start_position();
        self.out_packet(serializers::agent_movement_complete(&self.context.packet_pool, self.identity.agent_id, self.identity.session_id, position, look_at, region_handle, timestamp, channel_version), ThrottleCategory::Unknown);
    }

    fn out_packets(&self, packets: Vec<Packet>, category: ThrottleCategory) {
        for packet in packets {
            self.out_packet(packet, category);
        }
    }

    /// Batches are split into as many packets as it takes to stay within the maximum packet size
    pub fn send_terse_avatar_updates(&self, region_handle: u64, time_dilation: f32, avatars: &[TerseUpdate]) {
        self.out_packets(serializers::terse_avatar_update(&self.context.packet_pool, self.context.config.max_packet_size, region_handle, time_dilation, avatars), ThrottleCategory::Task);
    }

    pub fn send_terse_prim_updates(&self, region_handle: u64, time_dilation: f32, prims: &[(TerseUpdate, Vec<u8>)]) {
        self.out_packets(serializers::terse_prim_update(&self.context.packet_pool, self.context.config.max_packet_size, region_handle, time_dilation, prims), ThrottleCategory::Task);
    }

    pub fn send_kill_objects(&self, local_ids: &[u32]) {
        self.out_packets(serializers::kill_object(&self.context.packet_pool, self.context.config.max_packet_size, local_ids), ThrottleCategory::Task);
    }

    pub fn send_name_reply(&self, names: &[(Uuid, &str, &str)]) {
        self.out_packets(serializers::uuid_name_reply(&self.context.packet_pool, self.context.config.max_packet_size, names), ThrottleCategory::Task);
    }

    pub fn send_viewer_time(&self, usec_since_start: u64, sec_per_day: u32, sec_per_year: u32, sun_direction: Vec3, sun_phase: f32, sun_ang_velocity: Vec3) {
        self.out_packet(serializers::simulator_viewer_time(&self.context.packet_pool, usec_since_start, sec_per_day, sec_per_year, sun_direction, sun_phase, sun_ang_velocity), ThrottleCategory::Task);
    }

    /// Applies the throttle block of an `AgentThrottle` packet to the outbound queue
    pub fn apply_client_throttles(&self, raw: &[u8]) -> anyhow::Result<()> {
        let rates = self.queue.rates().with_client_throttles(raw, &self.context.config.throttle)?;
        self.queue.set_throttle(&rates);
        Ok(())
    }

    pub fn throttle_rates(&self) -> ThrottleRates {
        self.queue.rates()
    }

    /// A blocked viewer (e.g. one that reported itself paused) gets more time before it is
    ///  considered gone. Any inbound packet unblocks the connection.
    pub fn set_blocked(&self, blocked: bool) {
        debug!("connection blocked: {}", blocked);
        self.blocked.store(blocked, Ordering::Release);
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Registers a handler for this connection only, taking precedence over global handlers
    pub fn register_handler(&self, packet_type: PacketType, handler: Arc<dyn PacketHandler>) -> bool {
        self.router.local().register(packet_type, handler)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ledger(&self) -> &ReliableLedger {
        &self.ledger
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            packets_in: self.counters.packets_in.load(Ordering::Relaxed),
            packets_out: self.counters.packets_out.load(Ordering::Relaxed),
            packets_resent: self.counters.packets_resent.load(Ordering::Relaxed),
            duplicates_dropped: self.counters.duplicates_dropped.load(Ordering::Relaxed),
            unacked_packets: self.ledger.unacked_count(),
            unacked_bytes: self.ledger.unacked_bytes(),
            pending_acks: self.ledger.pending_ack_count(),
            probe_failures: self.probe_failures.load(Ordering::Acquire),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().unwrap()
    }

    pub fn identity(&self) -> &CircuitIdentity {
        &self.identity
    }

    pub fn agent_id(&self) -> Uuid {
        self.identity.agent_id
    }

    pub fn session_id(&self) -> Uuid {
        self.identity.session_id
    }

    pub fn circuit_code(&self) -> u32 {
        self.identity.circuit_code
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Routes outbound packets through a proxy instead of sending them to the viewer directly
    pub fn set_proxy_addr(&self, proxy_addr: Option<SocketAddr>) {
        *self.proxy_addr.lock().unwrap() = proxy_addr;
    }

    fn send_addr(&self) -> SocketAddr {
        self.proxy_addr.lock().unwrap()
            .unwrap_or(self.remote_addr)
    }

    /// the login data captured during authentication
    pub fn login_info(&self) -> Option<LoginInfo> {
        self.login.lock().unwrap().clone()
    }

    pub fn secure_session_id(&self) -> Option<Uuid> {
        self.login.lock().unwrap()
            .as_ref()
            .map(|l| l.secure_session_id)
    }

    pub fn start_position(&self) -> Vec3 {
        *self.start_position.lock().unwrap()
    }

    pub fn set_start_position(&self, position: Vec3) {
        *self.start_position.lock().unwrap() = position;
    }

    /// the viewer's IP address
    pub fn remote_ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }
}
