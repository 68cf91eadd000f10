use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::ClientStackConfig;
use crate::packet::header::mark_resent;
use crate::packet::PacketType;
use crate::throttle::ThrottleCategory;

/// An outbound reliable packet waiting for its ack
#[derive(Clone, Debug)]
pub struct UnackedRecord {
    pub packet_type: PacketType,
    /// the packet's wire bytes, with the `RESENT` flag set once it was re-sent
    pub bytes: Vec<u8>,
    pub category: ThrottleCategory,
    pub sent_at: Instant,
    pub resend_count: u32,
}

/// A packet that is due for re-transmission
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResendItem {
    pub sequence: u32,
    pub packet_type: PacketType,
    pub bytes: Vec<u8>,
}

struct Unacked {
    records: FxHashMap<u32, UnackedRecord>,
    bytes: usize,
}

#[derive(Default)]
struct PendingAcks {
    queue: VecDeque<u32>,
    members: FxHashSet<u32>,
}

/// Bookkeeping for both directions of reliable delivery: outbound packets waiting for acks
///  (driving re-transmission), and sequence numbers of inbound reliable packets we still owe
///  an ack for.
pub struct ReliableLedger {
    resend_timeout: Duration,
    max_unacked_packets: usize,
    max_pending_acks: usize,
    append_ack_threshold: usize,
    max_appended_acks: usize,

    unacked: Mutex<Unacked>,
    pending_acks: Mutex<PendingAcks>,
}

impl ReliableLedger {
    pub fn new(config: &ClientStackConfig) -> ReliableLedger {
        ReliableLedger {
            resend_timeout: config.resend_timeout,
            max_unacked_packets: config.max_unacked_packets,
            max_pending_acks: config.max_pending_acks,
            append_ack_threshold: config.append_ack_threshold,
            max_appended_acks: config.max_appended_acks,
            unacked: Mutex::new(Unacked {
                records: Default::default(),
                bytes: 0,
            }),
            pending_acks: Default::default(),
        }
    }

    /// Starts tracking an outbound reliable packet. An existing record for the same sequence
    ///  number is left untouched, and `false` is returned.
    pub fn track_for_ack(&self, sequence: u32, packet_type: PacketType, bytes: Vec<u8>, category: ThrottleCategory, now: Instant) -> bool {
        let mut unacked = self.unacked.lock().unwrap();

        if unacked.records.contains_key(&sequence) {
            warn!("sequence number #{} is already waiting for an ack - ignoring new record", sequence);
            return false;
        }

        if unacked.records.len() >= self.max_unacked_packets {
            let oldest = unacked.records.iter()
                .min_by_key(|(_, r)| r.sent_at)
                .map(|(&seq, _)| seq);
            if let Some(oldest) = oldest {
                warn!("{} unacked packets: discarding record for #{}", unacked.records.len(), oldest);
                if let Some(evicted) = unacked.records.remove(&oldest) {
                    unacked.bytes -= evicted.bytes.len();
                }
            }
        }

        trace!("tracking #{} for ack", sequence);
        unacked.bytes += bytes.len();
        unacked.records.insert(sequence, UnackedRecord {
            packet_type,
            bytes,
            category,
            sent_at: now,
            resend_count: 0,
        });
        true
    }

    /// Removes the record for an acknowledged sequence number. Unknown sequence numbers are
    ///  ignored, returning `false`.
    pub fn ack_received(&self, sequence: u32) -> bool {
        let mut unacked = self.unacked.lock().unwrap();
        match unacked.records.remove(&sequence) {
            Some(record) => {
                trace!("#{} was acked", sequence);
                unacked.bytes -= record.bytes.len();
                true
            }
            None => {
                trace!("ack for #{} that is not waiting for an ack", sequence);
                false
            }
        }
    }

    /// All records that were sent (or last re-sent) more than the resend timeout ago. They are
    ///  marked as resent and their send time is reset, so each record is returned at most once
    ///  per timeout interval.
    pub fn resend_due(&self, now: Instant) -> Vec<ResendItem> {
        let mut unacked = self.unacked.lock().unwrap();
        let mut result = Vec::new();
        for (&sequence, record) in unacked.records.iter_mut() {
            if now.saturating_duration_since(record.sent_at) > self.resend_timeout {
                mark_resent(&mut record.bytes);
                record.sent_at = now;
                record.resend_count += 1;
                debug!("re-sending #{} (resend #{})", sequence, record.resend_count);
                result.push(ResendItem {
                    sequence,
                    packet_type: record.packet_type,
                    bytes: record.bytes.clone(),
                });
            }
        }
        result.sort_by_key(|item| item.sequence);
        result
    }

    pub fn is_unacked(&self, sequence: u32) -> bool {
        self.unacked.lock().unwrap().records.contains_key(&sequence)
    }

    pub fn resend_count(&self, sequence: u32) -> Option<u32> {
        self.unacked.lock().unwrap().records
            .get(&sequence)
            .map(|r| r.resend_count)
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().unwrap().records.len()
    }

    pub fn unacked_bytes(&self) -> usize {
        self.unacked.lock().unwrap().bytes
    }

    /// the lowest sequence number waiting for an ack, 0 if there is none
    pub fn oldest_unacked(&self) -> u32 {
        self.unacked.lock().unwrap().records
            .keys()
            .min()
            .copied()
            .unwrap_or(0)
    }

    /// Records an inbound reliable sequence number for acknowledgement. Sequence numbers that
    ///  are already pending are not queued twice; if the pending acks reached their ceiling, the
    ///  ack is dropped and the sender will eventually re-send.
    pub fn queue_pending_ack(&self, sequence: u32) -> bool {
        let mut pending = self.pending_acks.lock().unwrap();
        if pending.members.contains(&sequence) {
            return false;
        }
        if pending.queue.len() >= self.max_pending_acks {
            warn!("{} pending acks: dropping ack for #{}", pending.queue.len(), sequence);
            return false;
        }
        pending.members.insert(sequence);
        pending.queue.push_back(sequence);
        true
    }

    /// Takes pending acks to piggyback on an outbound packet of the given type, at most `room`
    ///  and at most the configured number of appended acks. Acks are never appended to ack or
    ///  logout packets, and not at all while the backlog exceeds the append threshold (it is
    ///  left to standalone ack packets then).
    pub fn take_appended_acks(&self, packet_type: PacketType, room: usize) -> Vec<u32> {
        match packet_type {
            PacketType::PacketAck | PacketType::LogoutRequest | PacketType::LogoutReply => return Vec::new(),
            _ => {}
        }

        let mut pending = self.pending_acks.lock().unwrap();
        if pending.queue.len() > self.append_ack_threshold {
            debug!("{} pending acks exceed the threshold for appending acks", pending.queue.len());
            return Vec::new();
        }
        Self::take(&mut pending, self.max_appended_acks.min(room))
    }

    /// Takes up to `max` pending acks for a standalone ack packet
    pub fn take_pending_acks(&self, max: usize) -> Vec<u32> {
        let mut pending = self.pending_acks.lock().unwrap();
        Self::take(&mut pending, max)
    }

    fn take(pending: &mut PendingAcks, max: usize) -> Vec<u32> {
        let n = max.min(pending.queue.len());
        let result: Vec<u32> = pending.queue.drain(..n).collect();
        for seq in &result {
            pending.members.remove(seq);
        }
        result
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().unwrap().queue.len()
    }
}
