use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::config::ClientStackConfig;
use crate::packet::{Message, Packet, PacketType};

/// Recycles decoded / to-be-encoded packet objects per packet type. Pooling is an optimization
///  only: an empty pool (or a disabled one) hands out freshly allocated packets.
pub struct PacketPool {
    enabled: bool,
    max_per_type: usize,
    packets: Mutex<FxHashMap<PacketType, Vec<Packet>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PacketPoolStats {
    pub hits: u64,
    pub misses: u64,
}

impl PacketPool {
    pub fn new(enabled: bool, max_per_type: usize) -> PacketPool {
        PacketPool {
            enabled,
            max_per_type,
            packets: Default::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ClientStackConfig) -> PacketPool {
        PacketPool::new(config.packet_pooling, config.packet_pool_size)
    }

    /// a reset packet of the given type, recycled if possible
    pub fn acquire(&self, packet_type: PacketType) -> Packet {
        if self.enabled && packet_type != PacketType::Unknown {
            let mut packets = self.packets.lock().unwrap();
            if let Some(packet) = packets.get_mut(&packet_type).and_then(|v| v.pop()) {
                trace!("returning {:?} packet from pool", packet_type);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return packet;
            }
        }

        debug!("no {:?} packet in pool: creating new packet", packet_type);
        self.misses.fetch_add(1, Ordering::Relaxed);
        Packet::new(Message::new_for(packet_type))
    }

    /// a recycled packet carrying the given message
    pub fn acquire_with(&self, message: impl Into<Message>) -> Packet {
        let message = message.into();
        let mut packet = self.acquire(message.packet_type());
        packet.message = message;
        packet
    }

    pub fn release(&self, mut packet: Packet) {
        let packet_type = packet.packet_type();
        if !self.enabled || packet_type == PacketType::Unknown {
            return;
        }

        packet.reset();

        let mut packets = self.packets.lock().unwrap();
        let pooled = packets.entry(packet_type).or_default();
        if pooled.len() < self.max_per_type {
            trace!("returning {:?} packet to pool", packet_type);
            pooled.push(packet);
        }
        else {
            trace!("pool for {:?} is full: discarding returned packet", packet_type);
        }
    }

    /// Wraps a packet in a guard that releases it to this pool when it goes out of scope
    pub fn check_out(self: &Arc<Self>, packet: Packet) -> PooledPacket {
        PooledPacket {
            packet: Some(packet),
            pool: self.clone(),
        }
    }

    pub fn stats(&self) -> PacketPoolStats {
        PacketPoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub fn pooled(&self, packet_type: PacketType) -> usize {
        self.packets.lock().unwrap()
            .get(&packet_type)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

/// A packet checked out from a [PacketPool]. It is returned to the pool exactly once, when the
///  guard is dropped, unless it is taken out with [PooledPacket::into_inner].
pub struct PooledPacket {
    packet: Option<Packet>,
    pool: Arc<PacketPool>,
}

impl PooledPacket {
    pub fn into_inner(mut self) -> Packet {
        self.packet.take()
            .expect("packet is present until the guard is consumed")
    }
}

impl Deref for PooledPacket {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        self.packet.as_ref()
            .expect("packet is present until the guard is consumed")
    }
}

impl DerefMut for PooledPacket {
    fn deref_mut(&mut self) -> &mut Packet {
        self.packet.as_mut()
            .expect("packet is present until the guard is consumed")
    }
}

impl Drop for PooledPacket {
    fn drop(&mut self) {
        if let Some(packet) = self.packet.take() {
            self.pool.release(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::messages::{AlertMessage, ChatFromViewer, PacketAck, StartPingCheck};

    #[test]
    fn test_acquire_empty_pool_allocates() {
        let pool = PacketPool::new(true, 4);
        let packet = pool.acquire(PacketType::StartPingCheck);
        assert_eq!(packet, Packet::new(StartPingCheck::default()));
        assert_eq!(pool.stats(), PacketPoolStats { hits: 0, misses: 1 });
    }

    #[test]
    fn test_release_resets_and_recycles() {
        let pool = PacketPool::new(true, 4);
        let mut packet = Packet::reliable(ChatFromViewer {
            message: "hi".to_string(),
            ..Default::default()
        });
        packet.header.sequence = 99;
        pool.release(packet);
        assert_eq!(pool.pooled(PacketType::ChatFromViewer), 1);

        let recycled = pool.acquire(PacketType::ChatFromViewer);
        assert_eq!(recycled, Packet::new(ChatFromViewer::default()));
        assert_eq!(pool.stats(), PacketPoolStats { hits: 1, misses: 0 });
    }

    #[test]
    fn test_release_keeps_block_allocations() {
        let pool = PacketPool::new(true, 4);
        pool.release(Packet::new(PacketAck { ids: (0..200).collect() }));

        let recycled = pool.acquire(PacketType::PacketAck);
        match &recycled.message {
            Message::PacketAck(ack) => {
                assert!(ack.ids.is_empty());
                assert!(ack.ids.capacity() >= 200);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_release_keeps_string_allocations() {
        let pool = PacketPool::new(true, 4);
        pool.release(Packet::reliable(AlertMessage { message: "x".repeat(100) }));

        let recycled = pool.acquire(PacketType::AlertMessage);
        assert_eq!(recycled, Packet::new(AlertMessage::default()));
        match &recycled.message {
            Message::AlertMessage(alert) => assert!(alert.message.capacity() >= 100),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_acquire_with() {
        let pool = PacketPool::new(true, 4);
        pool.release(Packet::new(StartPingCheck::default()));

        let packet = pool.acquire_with(StartPingCheck { ping_id: 9, oldest_unacked: 1 });
        assert_eq!(packet, Packet::new(StartPingCheck { ping_id: 9, oldest_unacked: 1 }));
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn test_pool_is_bounded_per_type() {
        let pool = PacketPool::new(true, 2);
        for _ in 0..5 {
            pool.release(Packet::new(StartPingCheck::default()));
        }
        assert_eq!(pool.pooled(PacketType::StartPingCheck), 2);
    }

    #[test]
    fn test_disabled_pool() {
        let pool = PacketPool::new(false, 2);
        pool.release(Packet::new(StartPingCheck::default()));
        assert_eq!(pool.pooled(PacketType::StartPingCheck), 0);
        let _ = pool.acquire(PacketType::StartPingCheck);
        assert_eq!(pool.stats(), PacketPoolStats { hits: 0, misses: 1 });
    }

    #[test]
    fn test_check_out_releases_once_on_drop() {
        let pool = Arc::new(PacketPool::new(true, 4));
        {
            let mut guard = pool.check_out(Packet::new(StartPingCheck { ping_id: 3, oldest_unacked: 0 }));
            guard.header.sequence = 7;
            assert_eq!(guard.sequence(), 7);
        }
        assert_eq!(pool.pooled(PacketType::StartPingCheck), 1);

        let guard = pool.check_out(Packet::new(StartPingCheck::default()));
        let packet = guard.into_inner();
        assert_eq!(packet.packet_type(), PacketType::StartPingCheck);
        assert_eq!(pool.pooled(PacketType::StartPingCheck), 1);
    }
}
