use std::collections::hash_map::Entry;
use std::sync::Mutex;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;
use crate::packet::PacketType;

/// Remembers recently received inbound sequence numbers for a configurable window, so that
///  re-transmissions of packets that were already processed can be dropped.
pub struct DuplicateTracker {
    window: Duration,
    entries: Mutex<FxHashMap<u32, (Instant, PacketType)>>,
}

impl DuplicateTracker {
    pub fn new(window: Duration) -> DuplicateTracker {
        DuplicateTracker {
            window,
            entries: Default::default(),
        }
    }

    /// `true` if the sequence number was seen within the window. Otherwise it is recorded and
    ///  `false` is returned.
    pub fn seen(&self, sequence: u32, packet_type: PacketType) -> bool {
        self.seen_at(sequence, packet_type, Instant::now())
    }

    pub fn seen_at(&self, sequence: u32, packet_type: PacketType, now: Instant) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.entry(sequence) {
            Entry::Occupied(mut e) => {
                let (received_at, _) = *e.get();
                if now.saturating_duration_since(received_at) <= self.window {
                    return true;
                }
                // expired but not swept yet: the sequence number came around again
                e.insert((now, packet_type));
                false
            }
            Entry::Vacant(e) => {
                e.insert((now, packet_type));
                false
            }
        }
    }

    /// removes entries older than the window, returning the number of removed entries
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, (received_at, _)| now.saturating_duration_since(*received_at) <= self.window);
        let removed = before - entries.len();
        if removed > 0 {
            trace!("removed {} expired entries from duplicate tracking", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn packet_type_of(&self, sequence: u32) -> Option<PacketType> {
        self.entries.lock().unwrap()
            .get(&sequence)
            .map(|(_, packet_type)| *packet_type)
    }
}
