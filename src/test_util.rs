//! Test doubles for the collaborators of a [Connection]: a transport that records sent packets,
//!  a scene that records (de)registrations, and fixtures for a known circuit.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::anyhow;
use async_trait::async_trait;
use glam::Vec3;
use uuid::Uuid;
use crate::config::ClientStackConfig;
use crate::connection::{CircuitIdentity, Connection, ConnectionContext};
use crate::packet::{Message, Packet, PacketFlags};
use crate::scene::Scene;
use crate::session::{InMemoryAuthenticator, LoginInfo, SessionAuthenticator};
use crate::transport::PacketTransport;

pub const AGENT_ID: Uuid = Uuid::from_u128(0xa9e7);
pub const SESSION_ID: Uuid = Uuid::from_u128(0x5e55);
pub const SECURE_SESSION_ID: Uuid = Uuid::from_u128(0x5ec0);
pub const CIRCUIT_CODE: u32 = 4711;

pub fn identity() -> CircuitIdentity {
    CircuitIdentity {
        agent_id: AGENT_ID,
        session_id: SESSION_ID,
        circuit_code: CIRCUIT_CODE,
    }
}

pub fn remote_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 13000))
}

pub fn login_info() -> LoginInfo {
    LoginInfo {
        first_name: "Test".to_string(),
        last_name: "User".to_string(),
        secure_session_id: SECURE_SESSION_ID,
        start_position: Vec3::new(128.0, 128.0, 25.0),
        look_at: Vec3::X,
    }
}

/// an authenticator that knows the circuit of [identity]
pub fn authenticator() -> Arc<InMemoryAuthenticator> {
    let result = InMemoryAuthenticator::new();
    result.add_circuit(CIRCUIT_CODE, SESSION_ID, AGENT_ID, login_info());
    Arc::new(result)
}

/// a packet as it arrives from the viewer
pub fn inbound(message: impl Into<Message>, sequence: u32, reliable: bool) -> Packet {
    let mut result = Packet::new(message);
    result.header.sequence = sequence;
    result.set_reliable(reliable);
    result
}

/// gives spawned tasks the chance to process everything that is ready
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[derive(Default)]
pub struct TrackingTransport {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl TrackingTransport {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn num_attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn sent_raw(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap()
            .iter()
            .map(|(_, raw)| raw.clone())
            .collect()
    }

    pub fn sent_to(&self) -> Vec<SocketAddr> {
        self.sent.lock().unwrap()
            .iter()
            .map(|(to, _)| *to)
            .collect()
    }

    /// all successfully sent packets, decoded
    pub fn sent_packets(&self) -> Vec<Packet> {
        self.sent_raw().iter()
            .map(|raw| Packet::deser(raw).unwrap())
            .collect()
    }

    /// the ids of all standalone `PacketAck` packets, one entry per packet
    pub fn sent_acks(&self) -> Vec<Vec<u32>> {
        self.sent_packets().into_iter()
            .filter_map(|p| match p.message {
                Message::PacketAck(ack) => Some(ack.ids),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PacketTransport for TrackingTransport {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if self.failing.load(Ordering::Acquire) {
            return Err(anyhow!("simulated transport failure"));
        }
        assert!(packet_buf[0] & !PacketFlags::all().bits() == 0, "undefined flag bits");
        self.sent.lock().unwrap().push((to, packet_buf.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct TrackingScene {
    added: Mutex<Vec<Uuid>>,
    removed: Mutex<Vec<Uuid>>,
}

impl TrackingScene {
    pub fn added(&self) -> Vec<Uuid> {
        self.added.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<Uuid> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scene for TrackingScene {
    async fn add_connection(&self, connection: Arc<Connection>) {
        self.added.lock().unwrap().push(connection.agent_id());
    }

    async fn remove_connection(&self, agent_id: Uuid) {
        self.removed.lock().unwrap().push(agent_id);
    }
}

/// A [ConnectionContext] with default config, wired to tracking doubles
pub struct TestSetup {
    pub transport: Arc<TrackingTransport>,
    pub scene: Arc<TrackingScene>,
    pub context: ConnectionContext,
}

impl TestSetup {
    pub fn new() -> TestSetup {
        Self::with_authenticator(authenticator())
    }

    pub fn with_authenticator(authenticator: Arc<dyn SessionAuthenticator>) -> TestSetup {
        let scene = Arc::new(TrackingScene::default());
        Self::build(ClientStackConfig::default(), authenticator, scene.clone(), scene)
    }

    /// NB: `self.scene` is not the scene the connections use
    pub fn with_scene(scene: Arc<dyn Scene>) -> TestSetup {
        Self::build(ClientStackConfig::default(), authenticator(), Arc::new(TrackingScene::default()), scene)
    }

    fn build(config: ClientStackConfig, authenticator: Arc<dyn SessionAuthenticator>, tracking_scene: Arc<TrackingScene>, scene: Arc<dyn Scene>) -> TestSetup {
        let transport = Arc::new(TrackingTransport::default());
        let context = ConnectionContext::new(config, transport.clone(), authenticator, scene).unwrap();
        TestSetup {
            transport,
            scene: tracking_scene,
            context,
        }
    }
}
