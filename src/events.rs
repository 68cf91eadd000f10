//! Decoded client events published to the simulation. This replaces a large set of per-event
//!  callback slots with a closed event type and a subscriber registry.

use std::sync::{Arc, RwLock};
use async_trait::async_trait;
use glam::Vec3;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::trace;
use uuid::Uuid;
use crate::connection::Connection;
use crate::packet::messages::AgentUpdate;
use crate::packet::Message;

#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Chat {
        agent_id: Uuid,
        message: String,
        chat_type: u8,
        channel: i32,
    },
    AgentUpdate {
        agent_id: Uuid,
        update: AgentUpdate,
    },
    CompleteMovement {
        agent_id: Uuid,
    },
    RegionHandshakeReply {
        agent_id: Uuid,
        flags: u32,
    },
    NameRequest {
        agent_id: Uuid,
        ids: Vec<Uuid>,
    },
    TeleportLocationRequest {
        agent_id: Uuid,
        region_handle: u64,
        position: Vec3,
        look_at: Vec3,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ClientEventKind {
    Chat,
    AgentUpdate,
    CompleteMovement,
    RegionHandshakeReply,
    NameRequest,
    TeleportLocationRequest,
}

impl ClientEvent {
    pub fn kind(&self) -> ClientEventKind {
        match self {
            ClientEvent::Chat { .. } => ClientEventKind::Chat,
            ClientEvent::AgentUpdate { .. } => ClientEventKind::AgentUpdate,
            ClientEvent::CompleteMovement { .. } => ClientEventKind::CompleteMovement,
            ClientEvent::RegionHandshakeReply { .. } => ClientEventKind::RegionHandshakeReply,
            ClientEvent::NameRequest { .. } => ClientEventKind::NameRequest,
            ClientEvent::TeleportLocationRequest { .. } => ClientEventKind::TeleportLocationRequest,
        }
    }

    pub fn agent_id(&self) -> Uuid {
        match self {
            ClientEvent::Chat { agent_id, .. } |
            ClientEvent::AgentUpdate { agent_id, .. } |
            ClientEvent::CompleteMovement { agent_id } |
            ClientEvent::RegionHandshakeReply { agent_id, .. } |
            ClientEvent::NameRequest { agent_id, .. } |
            ClientEvent::TeleportLocationRequest { agent_id, .. } => *agent_id,
        }
    }

    /// The event for an inbound message, `None` for messages that are not simulation events.
    ///  The event is attributed to the connection's agent, not to the (unverified) agent id
    ///  in the message.
    pub fn from_message(agent_id: Uuid, message: &Message) -> Option<ClientEvent> {
        let event = match message {
            Message::ChatFromViewer(m) => ClientEvent::Chat {
                agent_id,
                message: m.message.clone(),
                chat_type: m.chat_type,
                channel: m.channel,
            },
            Message::AgentUpdate(m) => ClientEvent::AgentUpdate {
                agent_id,
                update: m.clone(),
            },
            Message::CompleteAgentMovement(_) => ClientEvent::CompleteMovement { agent_id },
            Message::RegionHandshakeReply(m) => ClientEvent::RegionHandshakeReply {
                agent_id,
                flags: m.flags,
            },
            Message::UuidNameRequest(m) => ClientEvent::NameRequest {
                agent_id,
                ids: m.ids.clone(),
            },
            Message::TeleportLocationRequest(m) => ClientEvent::TeleportLocationRequest {
                agent_id,
                region_handle: m.region_handle,
                position: m.position,
                look_at: m.look_at,
            },
            _ => return None,
        };
        Some(event)
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSubscriber: Send + Sync + 'static {
    async fn on_event(&self, connection: &Connection, event: &ClientEvent) -> anyhow::Result<()>;
}

/// Per-connection registry of event subscribers. Subscribers are called in the order they
///  subscribed.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<FxHashMap<ClientEventKind, Vec<Arc<dyn EventSubscriber>>>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        Default::default()
    }

    pub fn subscribe(&self, kind: ClientEventKind, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().unwrap()
            .entry(kind)
            .or_default()
            .push(subscriber);
    }

    pub fn num_subscribers(&self, kind: ClientEventKind) -> usize {
        self.subscribers.read().unwrap()
            .get(&kind)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Calls all subscribers for the event's kind, stopping at the first one that fails.
    ///  Returns the number of subscribers that were called successfully.
    pub async fn publish(&self, connection: &Connection, event: &ClientEvent) -> anyhow::Result<usize> {
        let subscribers = self.subscribers.read().unwrap()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        if subscribers.is_empty() {
            trace!("no subscribers for {:?}", event.kind());
        }

        for subscriber in &subscribers {
            subscriber.on_event(connection, event).await?;
        }
        Ok(subscribers.len())
    }
}
