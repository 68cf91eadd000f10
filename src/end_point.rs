use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;
use crate::config::ClientStackConfig;
use crate::connection::{CircuitIdentity, Connection, ConnectionContext, ConnectionState};
use crate::packet::{Message, Packet};
use crate::scene::Scene;
use crate::session::SessionAuthenticator;

/// sources of malformed datagrams that are remembered for log rate limiting
const MAX_MALFORMED_SOURCES: usize = 1024;

/// The UDP side of the client stack: it receives datagrams on a socket and routes them to the
///  connection for their source address. A `UseCircuitCode` packet from an unknown address
///  creates a new connection, all other packets from unknown addresses are dropped.
///
/// Connections are removed when they are closed.
pub struct UdpEndPoint {
    socket: Arc<UdpSocket>,
    context: ConnectionContext,
    connections: RwLock<FxHashMap<SocketAddr, Arc<Connection>>>,
    malformed_log: Mutex<FxHashMap<SocketAddr, Instant>>,
}

impl UdpEndPoint {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: ClientStackConfig,
        authenticator: Arc<dyn SessionAuthenticator>,
        scene: Arc<dyn Scene>,
    ) -> anyhow::Result<Arc<UdpEndPoint>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        let context = ConnectionContext::new(config, Arc::new(socket.clone()), authenticator, scene)?;
        Ok(Arc::new(UdpEndPoint::new(socket, context)))
    }

    /// `socket` is the socket for receiving, sending goes through the context's transport
    pub fn new(socket: Arc<UdpSocket>, context: ConnectionContext) -> UdpEndPoint {
        UdpEndPoint {
            socket,
            context,
            connections: Default::default(),
            malformed_log: Default::default(),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// the shared context, e.g. for registering global packet handlers
    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop");

        let mut buf = self.context.buffer_pool.get_from_pool();
        loop {
            buf.resize(self.context.buffer_pool.buf_size(), 0);
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let span = span!(Level::TRACE, "datagram_received", ?from);
            let _entered = span.enter();
            trace!("received {} bytes", num_read);

            self.on_datagram(from, &buf[..num_read]);
        }
    }

    pub fn on_datagram(self: &Arc<Self>, from: SocketAddr, raw: &[u8]) {
        let packet = match Packet::deser(raw) {
            Ok(packet) => packet,
            Err(e) => {
                if self.should_log_malformed(from, Instant::now()) {
                    warn!("received malformed datagram from {:?}: {} - dropping", from, e);
                }
                else {
                    debug!("received malformed datagram from {:?}: {} - dropping", from, e);
                }
                return;
            }
        };

        if let Some(connection) = self.connection(from) {
            connection.in_packet(packet);
            return;
        }

        let identity = match &packet.message {
            Message::UseCircuitCode(use_circuit_code) => CircuitIdentity {
                agent_id: use_circuit_code.agent_id,
                session_id: use_circuit_code.session_id,
                circuit_code: use_circuit_code.code,
            },
            _ => {
                debug!("received {:?} from {:?} without a circuit - dropping", packet.packet_type(), from);
                self.context.packet_pool.release(packet);
                return;
            }
        };

        self.get_or_add_connection(from, identity)
            .in_packet(packet);
    }

    fn get_or_add_connection(self: &Arc<Self>, from: SocketAddr, identity: CircuitIdentity) -> Arc<Connection> {
        let mut connections = self.connections.write().unwrap();
        if let Some(existing) = connections.get(&from) {
            return existing.clone();
        }

        debug!("new circuit {} for agent {} from {:?}", identity.circuit_code, identity.agent_id, from);
        let connection = Connection::new(identity, from, self.context.clone());
        connections.insert(from, connection.clone());
        drop(connections);

        self.remove_when_closed(connection.clone());
        connection.start();
        connection
    }

    fn remove_when_closed(self: &Arc<Self>, connection: Arc<Connection>) {
        let end_point = Arc::downgrade(self);
        let mut state = connection.subscribe_state();
        tokio::spawn(async move {
            // an error means the connection was dropped, which happens only after it closed
            let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;

            if let Some(end_point) = end_point.upgrade() {
                let mut connections = end_point.connections.write().unwrap();
                if connections.get(&connection.remote_addr()).is_some_and(|c| Arc::ptr_eq(c, &connection)) {
                    connections.remove(&connection.remote_addr());
                    debug!("removed closed connection for {:?}", connection.remote_addr());
                }
            }
        });
    }

    fn should_log_malformed(&self, from: SocketAddr, now: Instant) -> bool {
        let interval = self.context.config.malformed_log_interval;
        let mut malformed_log = self.malformed_log.lock().unwrap();

        if let Some(&last) = malformed_log.get(&from) {
            if now.duration_since(last) < interval {
                return false;
            }
        }

        if malformed_log.len() >= MAX_MALFORMED_SOURCES {
            malformed_log.retain(|_, last| now.duration_since(*last) < interval);
        }
        malformed_log.insert(from, now);
        true
    }

    pub fn connection(&self, remote_addr: SocketAddr) -> Option<Arc<Connection>> {
        self.connections.read().unwrap()
            .get(&remote_addr)
            .cloned()
    }

    pub fn connection_for_agent(&self, agent_id: Uuid) -> Option<Arc<Connection>> {
        self.connections.read().unwrap()
            .values()
            .find(|c| c.agent_id() == agent_id)
            .cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().unwrap()
            .values()
            .cloned()
            .collect()
    }

    pub fn num_connections(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    /// shuts down all circuits, waiting for each connection to complete its shutdown
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<Connection>> = self.connections.write().unwrap()
            .drain()
            .map(|(_, c)| c)
            .collect();

        info!("shutting down {} circuits", connections.len());
        for connection in connections {
            connection.shutdown_circuit().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use bytes::BytesMut;
    use super::*;
    use crate::packet::messages::*;
    use crate::packet::PacketType;
    use crate::session::InMemoryAuthenticator;
    use crate::test_util::*;

    async fn end_point(setup: &TestSetup) -> Arc<UdpEndPoint> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Arc::new(UdpEndPoint::new(socket, setup.context.clone()))
    }

    fn raw(packet: &Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        buf.to_vec()
    }

    fn use_circuit_code(sequence: u32) -> Vec<u8> {
        raw(&inbound(UseCircuitCode { code: CIRCUIT_CODE, session_id: SESSION_ID, agent_id: AGENT_ID }, sequence, true))
    }

    #[tokio::test(start_paused = true)]
    async fn test_use_circuit_code_creates_connection() {
        let setup = TestSetup::new();
        let end_point = end_point(&setup).await;

        end_point.on_datagram(remote_addr(), &use_circuit_code(1));
        settle().await;

        let connection = end_point.connection(remote_addr()).unwrap();
        assert_eq!(connection.state(), ConnectionState::Active);
        assert_eq!(*connection.identity(), identity());
        assert_eq!(setup.scene.added(), vec![AGENT_ID]);
        assert!(Arc::ptr_eq(&end_point.connection_for_agent(AGENT_ID).unwrap(), &connection));

        // a repeated UseCircuitCode goes to the existing connection
        end_point.on_datagram(remote_addr(), &use_circuit_code(1));
        settle().await;
        assert_eq!(end_point.num_connections(), 1);
        assert_eq!(connection.stats().duplicates_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_packets_without_circuit_are_dropped() {
        let setup = TestSetup::new();
        let end_point = end_point(&setup).await;

        end_point.on_datagram(remote_addr(), &raw(&inbound(StartPingCheck { ping_id: 1, oldest_unacked: 0 }, 1, false)));
        settle().await;

        assert_eq!(end_point.num_connections(), 0);
        assert!(setup.transport.sent_packets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_packets_are_routed_by_address() {
        let setup = TestSetup::new();
        let end_point = end_point(&setup).await;

        end_point.on_datagram(remote_addr(), &use_circuit_code(1));
        settle().await;
        end_point.on_datagram(remote_addr(), &raw(&inbound(StartPingCheck { ping_id: 3, oldest_unacked: 0 }, 2, false)));
        settle().await;

        let sent = setup.transport.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message, Message::CompletePingCheck(CompletePingCheck { ping_id: 3 }));
        // the ack for UseCircuitCode is piggybacked
        assert_eq!(sent[0].header.appended_acks, vec![1]);
        assert_eq!(setup.transport.sent_to(), vec![remote_addr()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_circuit_is_removed() {
        let setup = TestSetup::with_authenticator(Arc::new(InMemoryAuthenticator::new()));
        let end_point = end_point(&setup).await;

        end_point.on_datagram(remote_addr(), &use_circuit_code(1));
        settle().await;

        assert_eq!(end_point.num_connections(), 0);
        assert!(setup.scene.added().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_is_removed() {
        let setup = TestSetup::new();
        let end_point = end_point(&setup).await;

        end_point.on_datagram(remote_addr(), &use_circuit_code(1));
        settle().await;
        end_point.on_datagram(remote_addr(), &raw(&inbound(LogoutRequest { agent_id: AGENT_ID, session_id: SESSION_ID }, 2, true)));
        settle().await;

        assert_eq!(end_point.num_connections(), 0);
        assert_eq!(setup.scene.removed(), vec![AGENT_ID]);
        assert!(setup.transport.sent_packets().iter().any(|p| p.packet_type() == PacketType::LogoutReply));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_datagrams_are_dropped() {
        let setup = TestSetup::new();
        let end_point = end_point(&setup).await;

        end_point.on_datagram(remote_addr(), &[0x40, 0, 0]);
        end_point.on_datagram(remote_addr(), &[0x00, 0, 0, 0, 1, 0, 0xff]);
        settle().await;
        assert_eq!(end_point.num_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_logging_is_rate_limited() {
        let setup = TestSetup::new();
        let end_point = end_point(&setup).await;
        let other: SocketAddr = "127.0.0.2:9999".parse().unwrap();

        let now = Instant::now();
        assert!(end_point.should_log_malformed(remote_addr(), now));
        assert!(!end_point.should_log_malformed(remote_addr(), now + Duration::from_secs(5)));
        assert!(end_point.should_log_malformed(other, now + Duration::from_secs(5)));
        assert!(end_point.should_log_malformed(remote_addr(), now + Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown() {
        let setup = TestSetup::new();
        let end_point = end_point(&setup).await;

        end_point.on_datagram(remote_addr(), &use_circuit_code(1));
        settle().await;
        let connection = end_point.connection(remote_addr()).unwrap();

        end_point.shutdown().await;
        assert_eq!(end_point.num_connections(), 0);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(setup.transport.sent_packets().iter().any(|p| p.packet_type() == PacketType::DisableSimulator));
    }

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let scene = Arc::new(TrackingScene::default());
        let end_point = UdpEndPoint::bind("127.0.0.1:0", ClientStackConfig::default(), authenticator(), scene.clone()).await.unwrap();
        let server_addr = end_point.local_addr().unwrap();
        tokio::spawn(end_point.clone().recv_loop());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&use_circuit_code(1), server_addr).await.unwrap();
        client.send_to(&raw(&inbound(StartPingCheck { ping_id: 5, oldest_unacked: 0 }, 2, false)), server_addr).await.unwrap();

        let mut buf = [0u8; 1500];
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (len, _) = client.recv_from(&mut buf).await.unwrap();
                let packet = Packet::deser(&buf[..len]).unwrap();
                if packet.packet_type() == PacketType::CompletePingCheck {
                    return packet;
                }
            }
        }).await.unwrap();

        assert_eq!(received.message, Message::CompletePingCheck(CompletePingCheck { ping_id: 5 }));
        assert_eq!(scene.added(), vec![AGENT_ID]);
        end_point.shutdown().await;
    }
}
