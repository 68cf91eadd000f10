use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use bytes::BytesMut;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::packet::{Packet, PacketType};
use crate::throttle::{ThrottleCategory, ThrottleRates, TokenBucket};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Delivery {
    Unreliable,
    /// tracked for ack when it is put on the wire
    Reliable,
    /// re-transmission of a packet that is already tracked for ack
    Resend,
}

/// An outbound packet in wire format, waiting for its category's budget
#[derive(Debug)]
pub struct OutgoingPacket {
    pub bytes: BytesMut,
    pub packet_type: PacketType,
    pub sequence: u32,
    pub delivery: Delivery,
    pub category: ThrottleCategory,
}

impl OutgoingPacket {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug)]
pub enum QueueItem {
    /// a decoded inbound packet; inbound traffic shares the queue with outbound traffic, but
    ///  it is not throttled
    Incoming(Packet),
    Outgoing(OutgoingPacket),
    /// the queue was closed, the consumer should terminate
    Poison,
}

struct QueueState {
    incoming: VecDeque<Packet>,
    outgoing: [VecDeque<OutgoingPacket>; ThrottleCategory::COUNT],
    buckets: Vec<TokenBucket>,
    next_category: usize,
    closed: bool,
}

impl QueueState {
    /// Releases the next outbound packet whose category has the budget for it, starting the
    ///  search at the category after the last one served. If there is none, returns the time
    ///  until the earliest waiting packet becomes releasable (or `None` if nothing waits).
    fn try_release(&mut self, now: Instant) -> Result<OutgoingPacket, Option<Duration>> {
        let mut min_wait: Option<Duration> = None;

        for offset in 0..ThrottleCategory::COUNT {
            let idx = (self.next_category + offset) % ThrottleCategory::COUNT;
            let size = match self.outgoing[idx].front() {
                Some(p) => p.len(),
                None => continue,
            };

            let bucket = &mut self.buckets[idx];
            bucket.refill(now);
            if bucket.try_consume(size) {
                self.next_category = (idx + 1) % ThrottleCategory::COUNT;
                if let Some(packet) = self.outgoing[idx].pop_front() {
                    return Ok(packet);
                }
            }

            let wait = bucket.time_until_available(size);
            min_wait = Some(min_wait.map_or(wait, |w| w.min(wait)));
        }
        Err(min_wait)
    }

    fn len(&self) -> usize {
        self.incoming.len() + self.outgoing.iter().map(|q| q.len()).sum::<usize>()
    }
}

/// The queue drained by a connection's client loop. Producers never block: `enqueue` always
///  accepts, and release to the wire is paced per category by token buckets.
pub struct ThrottledQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ThrottledQueue {
    /// `min_bucket_capacity` should be the maximum packet size so that any packet is eventually
    ///  releasable
    pub fn new(rates: ThrottleRates, burst: Duration, min_bucket_capacity: usize) -> ThrottledQueue {
        let now = Instant::now();
        let buckets = ThrottleCategory::ALL.iter()
            .map(|&c| TokenBucket::new(rates.get(c), burst, min_bucket_capacity, now))
            .collect();

        ThrottledQueue {
            state: Mutex::new(QueueState {
                incoming: Default::default(),
                outgoing: Default::default(),
                buckets,
                next_category: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn enqueue_incoming(&self, packet: Packet) {
        trace!("enqueueing incoming {:?}", packet.packet_type());
        self.state.lock().unwrap()
            .incoming.push_back(packet);
        self.notify.notify_one();
    }

    pub fn enqueue(&self, packet: OutgoingPacket) {
        trace!("enqueueing outgoing {:?} #{} as {:?}", packet.packet_type, packet.sequence, packet.category);
        self.state.lock().unwrap()
            .outgoing[packet.category.index()].push_back(packet);
        self.notify.notify_one();
    }

    /// Waits for the next item: inbound packets as soon as they are available, outbound packets
    ///  when their category's budget allows. Returns [QueueItem::Poison] once the queue is
    ///  closed.
    pub async fn dequeue(&self) -> QueueItem {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return QueueItem::Poison;
                }
                if let Some(packet) = state.incoming.pop_front() {
                    return QueueItem::Incoming(packet);
                }
                match state.try_release(Instant::now()) {
                    Ok(packet) => return QueueItem::Outgoing(packet),
                    Err(wait) => wait,
                }
            };

            match wait {
                Some(wait) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    pub fn set_throttle(&self, rates: &ThrottleRates) {
        let now = Instant::now();
        {
            let mut state = self.state.lock().unwrap();
            for category in ThrottleCategory::ALL {
                state.buckets[category.index()].set_rate(rates.get(category), now);
            }
        }
        debug!("throttle rates set to {:?}", rates);
        self.notify.notify_one();
    }

    pub fn rates(&self) -> ThrottleRates {
        let state = self.state.lock().unwrap();
        let mut result = ThrottleRates::uniform(0);
        for category in ThrottleCategory::ALL {
            result.set(category, state.buckets[category.index()].rate());
        }
        result
    }

    /// Makes current and future `dequeue` calls return [QueueItem::Poison]. Closing a closed
    ///  queue has no effect.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        debug!("closing queue");
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Removes all waiting outbound packets regardless of budgets, in category order. Waiting
    ///  inbound packets are discarded.
    pub fn flush(&self) -> Vec<OutgoingPacket> {
        let mut state = self.state.lock().unwrap();
        let discarded = state.incoming.len();
        if discarded > 0 {
            debug!("flushing queue: discarding {} inbound packets", discarded);
            state.incoming.clear();
        }
        state.outgoing.iter_mut()
            .flat_map(|q| q.drain(..))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::packet::messages::StartPingCheck;

    fn outgoing(category: ThrottleCategory, sequence: u32, len: usize) -> OutgoingPacket {
        OutgoingPacket {
            bytes: BytesMut::from(&vec![0u8; len][..]),
            packet_type: PacketType::ImprovedTerseObjectUpdate,
            sequence,
            delivery: Delivery::Unreliable,
            category,
        }
    }

    fn queue(rate: u32) -> ThrottledQueue {
        ThrottledQueue::new(ThrottleRates::uniform(rate), Duration::from_millis(250), 1500)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_within_category() {
        let queue = queue(100_000);
        let mut reliable = outgoing(ThrottleCategory::Task, 2, 50);
        reliable.delivery = Delivery::Reliable;
        queue.enqueue(outgoing(ThrottleCategory::Task, 1, 50));
        queue.enqueue(reliable);

        let mut sequences = Vec::new();
        for _ in 0..2 {
            match queue.dequeue().await {
                QueueItem::Outgoing(p) => sequences.push((p.sequence, p.delivery)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(sequences, vec![(1, Delivery::Unreliable), (2, Delivery::Reliable)]);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_is_not_throttled() {
        let queue = queue(1);
        queue.enqueue(outgoing(ThrottleCategory::Task, 1, 1000));
        queue.enqueue_incoming(Packet::new(StartPingCheck::default()));

        let start = Instant::now();
        assert!(matches!(queue.dequeue().await, QueueItem::Incoming(_)));
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_paced() {
        let queue = queue(1_000);
        let start = Instant::now();
        queue.enqueue(outgoing(ThrottleCategory::Land, 1, 500));
        queue.enqueue(outgoing(ThrottleCategory::Land, 2, 500));

        assert!(matches!(queue.dequeue().await, QueueItem::Outgoing(_)));
        let first = Instant::now() - start;
        assert!(matches!(queue.dequeue().await, QueueItem::Outgoing(_)));
        let second = Instant::now() - start;

        assert!(first >= Duration::from_millis(500), "{:?}", first);
        assert!(second >= Duration::from_millis(1000), "{:?}", second);
        assert!(second < Duration::from_millis(1100), "{:?}", second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_conformance_under_concurrent_producers() {
        let mut rates = ThrottleRates::uniform(1_000);
        rates.set(ThrottleCategory::Task, 10_000);
        rates.set(ThrottleCategory::Land, 5_000);
        let queue = Arc::new(ThrottledQueue::new(rates, Duration::from_millis(250), 1500));
        let start = Instant::now();

        let producers: Vec<_> = [ThrottleCategory::Task, ThrottleCategory::Land].into_iter()
            .map(|category| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for i in 0..300 {
                        queue.enqueue(outgoing(category, i, 100));
                        if i % 10 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();

        let window = Duration::from_secs(2);
        let mut released = [0usize; ThrottleCategory::COUNT];
        loop {
            let remaining = (start + window).saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, queue.dequeue()).await {
                Ok(QueueItem::Outgoing(p)) => {
                    let idx = p.category.index();
                    released[idx] += p.len();
                    let elapsed = (Instant::now() - start).as_secs_f64();
                    let allowed = rates.get(p.category) as f64 * elapsed + 1.0;
                    assert!(released[idx] as f64 <= allowed, "{:?}: {} bytes after {}s", p.category, released[idx], elapsed);
                }
                Ok(other) => panic!("unexpected {:?}", other),
                Err(_) => break,
            }
        }

        for p in producers {
            p.await.unwrap();
        }

        assert!(released[ThrottleCategory::Task.index()] >= 15_000, "{:?}", released);
        assert!(released[ThrottleCategory::Land.index()] >= 7_500, "{:?}", released);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_category_does_not_starve_others() {
        let mut rates = ThrottleRates::uniform(100_000);
        rates.set(ThrottleCategory::Texture, 1_000);
        let queue = ThrottledQueue::new(rates, Duration::from_millis(250), 1500);
        for i in 0..10 {
            queue.enqueue(outgoing(ThrottleCategory::Texture, i, 1000));
        }
        queue.enqueue(outgoing(ThrottleCategory::Task, 100, 100));

        match queue.dequeue().await {
            QueueItem::Outgoing(p) => assert_eq!(p.sequence, 100),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_unblocks() {
        let queue = Arc::new(queue(1_000));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        queue.close();
        queue.close();
        assert!(matches!(consumer.await.unwrap(), QueueItem::Poison));
        assert!(matches!(queue.dequeue().await, QueueItem::Poison));
        assert!(queue.is_closed());
        queue.close();
    }

    #[tokio::test]
    async fn test_close_before_dequeue() {
        let queue = queue(1_000);
        queue.enqueue_incoming(Packet::new(StartPingCheck::default()));
        queue.close();
        assert!(matches!(queue.dequeue().await, QueueItem::Poison));
    }

    #[tokio::test]
    async fn test_flush_ignores_budgets() {
        let queue = queue(1);
        queue.enqueue(outgoing(ThrottleCategory::Texture, 3, 1000));
        queue.enqueue(outgoing(ThrottleCategory::Land, 1, 1000));
        queue.enqueue(outgoing(ThrottleCategory::Land, 2, 1000));
        queue.enqueue_incoming(Packet::new(StartPingCheck::default()));

        let flushed: Vec<u32> = queue.flush().iter().map(|p| p.sequence).collect();
        assert_eq!(flushed, vec![1, 2, 3]);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_throttle() {
        let queue = queue(1);
        let mut rates = ThrottleRates::uniform(10);
        rates.set(ThrottleCategory::Asset, 50_000);
        queue.set_throttle(&rates);
        assert_eq!(queue.rates(), rates);

        let start = Instant::now();
        queue.enqueue(outgoing(ThrottleCategory::Asset, 1, 500));
        assert!(matches!(queue.dequeue().await, QueueItem::Outgoing(_)));
        assert!(Instant::now() - start <= Duration::from_millis(11));
    }
}
