//! Routing of inbound packets to handlers. Handlers are looked up by packet type in three
//!  registries: the connection's own, the process-wide one shared by all connections, and the
//!  built-in defaults implementing circuit maintenance and event fan-out.

use std::collections::hash_map::Entry;
use std::sync::{Arc, RwLock};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};
use crate::connection::{CloseReason, Connection};
use crate::events::ClientEvent;
use crate::packet::{Message, Packet, PacketType};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    /// Returns `true` if the packet was handled. `false` passes it on to the next registry
    ///  level. An `Err` means the handler failed; the client loop logs it and continues.
    async fn handle(&self, connection: &Connection, packet: &Packet) -> anyhow::Result<bool>;
}

/// Handlers by packet type. There is at most one handler per packet type: the first
///  registration wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<FxHashMap<PacketType, Arc<dyn PacketHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        Default::default()
    }

    /// Returns `false` (and leaves the existing handler in place) if there is a handler for
    ///  the packet type already
    pub fn register(&self, packet_type: PacketType, handler: Arc<dyn PacketHandler>) -> bool {
        match self.handlers.write().unwrap().entry(packet_type) {
            Entry::Occupied(_) => {
                debug!("there is a handler for {:?} already - ignoring registration", packet_type);
                false
            }
            Entry::Vacant(e) => {
                e.insert(handler);
                true
            }
        }
    }

    pub fn get(&self, packet_type: PacketType) -> Option<Arc<dyn PacketHandler>> {
        self.handlers.read().unwrap()
            .get(&packet_type)
            .cloned()
    }

    pub fn contains(&self, packet_type: PacketType) -> bool {
        self.handlers.read().unwrap().contains_key(&packet_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }
}

pub struct DispatchRouter {
    local: HandlerRegistry,
    global: Arc<HandlerRegistry>,
    defaults: Arc<HandlerRegistry>,
}

impl DispatchRouter {
    pub fn new(global: Arc<HandlerRegistry>, defaults: Arc<HandlerRegistry>) -> DispatchRouter {
        DispatchRouter {
            local: HandlerRegistry::new(),
            global,
            defaults,
        }
    }

    pub fn local(&self) -> &HandlerRegistry {
        &self.local
    }

    /// Passes the packet to the handlers for its type, connection-local first, then global, then
    ///  the built-in default. Returns whether one of them handled it.
    pub async fn dispatch(&self, connection: &Connection, packet: &Packet) -> anyhow::Result<bool> {
        let packet_type = packet.packet_type();

        for registry in [&self.local, self.global.as_ref(), self.defaults.as_ref()] {
            if let Some(handler) = registry.get(packet_type) {
                if handler.handle(connection, packet).await? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// The built-in handlers: circuit maintenance packets, and fan-out of simulation packets as
///  [ClientEvent]s on the connection's event bus
pub fn default_handlers() -> HandlerRegistry {
    let result = HandlerRegistry::new();

    let consumed = Arc::new(ConsumedHandler);
    for packet_type in [PacketType::UseCircuitCode, PacketType::OpenCircuit, PacketType::PacketAck, PacketType::CompletePingCheck] {
        result.register(packet_type, consumed.clone());
    }

    result.register(PacketType::StartPingCheck, Arc::new(PingHandler));
    result.register(PacketType::AgentThrottle, Arc::new(ThrottleHandler));
    result.register(PacketType::AgentPause, Arc::new(PauseHandler));
    result.register(PacketType::AgentResume, Arc::new(PauseHandler));
    result.register(PacketType::LogoutRequest, Arc::new(LogoutHandler));
    result.register(PacketType::CloseCircuit, Arc::new(CloseCircuitHandler));

    let fan_out = Arc::new(EventFanOut);
    for packet_type in [
        PacketType::ChatFromViewer,
        PacketType::AgentUpdate,
        PacketType::CompleteAgentMovement,
        PacketType::RegionHandshakeReply,
        PacketType::UuidNameRequest,
        PacketType::TeleportLocationRequest,
    ] {
        result.register(packet_type, fan_out.clone());
    }

    result
}

/// Packets whose effect is fully covered by the client loop's inbound processing (acks,
///  liveness), or that are only meaningful before the circuit exists
struct ConsumedHandler;

#[async_trait]
impl PacketHandler for ConsumedHandler {
    async fn handle(&self, _connection: &Connection, packet: &Packet) -> anyhow::Result<bool> {
        trace!("consumed {:?}", packet.packet_type());
        Ok(true)
    }
}

struct PingHandler;

#[async_trait]
impl PacketHandler for PingHandler {
    async fn handle(&self, connection: &Connection, packet: &Packet) -> anyhow::Result<bool> {
        if let Message::StartPingCheck(ping) = &packet.message {
            connection.send_complete_ping(ping.ping_id);
        }
        Ok(true)
    }
}

struct ThrottleHandler;

#[async_trait]
impl PacketHandler for ThrottleHandler {
    async fn handle(&self, connection: &Connection, packet: &Packet) -> anyhow::Result<bool> {
        if let Message::AgentThrottle(throttle) = &packet.message {
            connection.apply_client_throttles(&throttle.throttles)?;
        }
        Ok(true)
    }
}

struct PauseHandler;

#[async_trait]
impl PacketHandler for PauseHandler {
    async fn handle(&self, connection: &Connection, packet: &Packet) -> anyhow::Result<bool> {
        connection.set_blocked(packet.packet_type() == PacketType::AgentPause);
        Ok(true)
    }
}

struct LogoutHandler;

#[async_trait]
impl PacketHandler for LogoutHandler {
    async fn handle(&self, connection: &Connection, _packet: &Packet) -> anyhow::Result<bool> {
        info!("logout requested");
        connection.send_logout_reply();
        connection.close(CloseReason::Logout);
        Ok(true)
    }
}

struct CloseCircuitHandler;

#[async_trait]
impl PacketHandler for CloseCircuitHandler {
    async fn handle(&self, connection: &Connection, _packet: &Packet) -> anyhow::Result<bool> {
        connection.close(CloseReason::CircuitClosed);
        Ok(true)
    }
}

struct EventFanOut;

#[async_trait]
impl PacketHandler for EventFanOut {
    async fn handle(&self, connection: &Connection, packet: &Packet) -> anyhow::Result<bool> {
        match ClientEvent::from_message(connection.agent_id(), &packet.message) {
            Some(event) => {
                connection.events().publish(connection, &event).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
