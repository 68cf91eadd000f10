//! The client side of a region simulator's UDP protocol: reliable delivery on top of UDP
//!  (sequence numbers, acks and resends), per-category bandwidth throttling, duplicate
//!  suppression, liveness probing and dispatch of decoded viewer packets to the simulation.
//!
//! A [end_point::UdpEndPoint] receives datagrams and creates a [connection::Connection] per
//!  circuit. Each connection runs a single client loop that processes inbound and outbound
//!  packets through a [throttled_queue::ThrottledQueue].

pub mod buffers;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod duplicate_tracker;
pub mod end_point;
pub mod events;
pub mod packet;
pub mod reliable_ledger;
mod safe_converter;
pub mod scene;
pub mod sequence;
pub mod serializers;
pub mod session;
pub mod throttle;
pub mod throttled_queue;
pub mod transport;
pub mod util;

#[cfg(test)]
mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
