//! The packet model: header, message number and body, and their wire representation.

pub mod header;
pub mod message_number;
pub mod messages;
pub mod zerocode;

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use crate::safe_converter::PrecheckedCast;

pub use header::{PacketFlags, PacketHeader};
pub use message_number::MessageNumber;
pub use messages::{Message, PacketType};

/// size of an appended ack on the wire
pub const ACK_LEN: usize = size_of::<u32>();

#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub message: Message,
}

impl Packet {
    /// A new unreliable packet for the message, zero-coded if the message template says so
    pub fn new(message: impl Into<Message>) -> Packet {
        let message = message.into();
        let mut header = PacketHeader::default();
        header.flags.set(PacketFlags::ZEROCODED, message.packet_type().is_zerocoded());
        Packet { header, message }
    }

    pub fn reliable(message: impl Into<Message>) -> Packet {
        let mut result = Packet::new(message);
        result.set_reliable(true);
        result
    }

    pub fn packet_type(&self) -> PacketType {
        self.message.packet_type()
    }

    pub fn is_reliable(&self) -> bool {
        self.header.is_reliable()
    }

    pub fn set_reliable(&mut self, reliable: bool) {
        self.header.flags.set(PacketFlags::RELIABLE, reliable);
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    /// Resets the packet to the state of a fresh packet of the same type, for reuse from a pool
    pub fn reset(&mut self) {
        let packet_type = self.packet_type();
        self.header.flags = PacketFlags::empty();
        self.header.flags.set(PacketFlags::ZEROCODED, packet_type.is_zerocoded());
        self.header.sequence = 0;
        self.header.extra.clear();
        self.header.appended_acks.clear();
        if packet_type != PacketType::Unknown {
            self.message.clear();
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut flags = self.header.flags;
        flags.set(PacketFlags::APPENDED_ACKS, !self.header.appended_acks.is_empty());

        buf.put_u8(flags.bits());
        buf.put_u32(self.header.sequence);
        buf.put_u8(self.header.extra.len().prechecked_cast());
        buf.put_slice(&self.header.extra);

        if flags.contains(PacketFlags::ZEROCODED) {
            let mut plain = Vec::with_capacity(64);
            self.message.message_number().ser(&mut plain);
            self.message.ser(&mut plain);
            zerocode::encode(&plain, buf);
        }
        else {
            self.message.message_number().ser(buf);
            self.message.ser(buf);
        }

        if !self.header.appended_acks.is_empty() {
            for &ack in &self.header.appended_acks {
                buf.put_u32(ack);
            }
            buf.put_u8(self.header.appended_acks.len().prechecked_cast());
        }
    }

    pub fn deser(raw: &[u8]) -> anyhow::Result<Packet> {
        if raw.len() < header::MIN_PACKET_LEN {
            bail!("packet too short: {} bytes", raw.len());
        }

        let flags = PacketFlags::from_bits_truncate(raw[0]);
        let sequence = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
        let extra_len = raw[header::SEQUENCE_END] as usize;
        let body_start = header::SEQUENCE_END + 1 + extra_len;
        if raw.len() <= body_start {
            bail!("packet too short for extra header of {} bytes", extra_len);
        }
        let extra = raw[header::SEQUENCE_END + 1..body_start].to_vec();

        let mut body_end = raw.len();
        let mut appended_acks = Vec::new();
        if flags.contains(PacketFlags::APPENDED_ACKS) {
            let num_acks = raw[raw.len() - 1] as usize;
            let acks_len = num_acks * ACK_LEN + 1;
            if raw.len() < body_start + 1 + acks_len {
                bail!("packet too short for {} appended acks", num_acks);
            }
            body_end = raw.len() - acks_len;
            appended_acks = raw[body_end..raw.len() - 1]
                .chunks_exact(ACK_LEN)
                .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
        }

        let message = if flags.contains(PacketFlags::ZEROCODED) {
            let mut decoded = Vec::with_capacity(2 * (body_end - body_start));
            zerocode::decode(&raw[body_start..body_end], &mut decoded)?;
            Self::deser_message(&decoded)?
        }
        else {
            Self::deser_message(&raw[body_start..body_end])?
        };

        Ok(Packet {
            header: PacketHeader {
                flags,
                sequence,
                extra,
                appended_acks,
            },
            message,
        })
    }

    fn deser_message(mut body: &[u8]) -> anyhow::Result<Message> {
        let number = MessageNumber::deser(&mut body)?;
        Message::deser(number, &mut body)
    }
}

/// Appends acks to an already serialized packet, setting its `APPENDED_ACKS` flag. The packet
///  must not carry appended acks yet.
pub fn append_acks(buf: &mut BytesMut, acks: &[u32]) {
    if acks.is_empty() {
        return;
    }
    buf[0] |= PacketFlags::APPENDED_ACKS.bits();
    for &ack in acks {
        buf.put_u32(ack);
    }
    buf.put_u8(acks.len().prechecked_cast());
}

#[cfg(test)]
mod tests {
    use super::*;
    use messages::*;
    use uuid::Uuid;

    #[test]
    fn test_ser_unreliable() {
        let mut packet = Packet::new(CompletePingCheck { ping_id: 7 });
        packet.header.sequence = 0x010203;

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        assert_eq!(&buf[..], &[0x00, 0, 1, 2, 3, 0, 2, 7]);

        assert_eq!(Packet::deser(&buf).unwrap(), packet);
    }

    #[test]
    fn test_ser_reliable_low() {
        let mut packet = Packet::reliable(LogoutRequest {
            agent_id: Uuid::from_bytes([1; 16]),
            session_id: Uuid::from_bytes([2; 16]),
        });
        packet.header.sequence = 5;

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        assert_eq!(&buf[..10], &[0x40, 0, 0, 0, 5, 0, 0xFF, 0xFF, 0, 252]);
        assert_eq!(buf.len(), 10 + 32);

        let decoded = Packet::deser(&buf).unwrap();
        assert!(decoded.is_reliable());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_ser_zerocoded() {
        let mut packet = Packet::new(RegionHandshakeReply {
            agent_id: Uuid::nil(),
            session_id: Uuid::nil(),
            flags: 1,
        });
        assert!(packet.header.is_zerocoded());
        packet.header.sequence = 1;

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        // message number ff ff 00 95, 32 zero bytes, flags 01 00 00 00
        assert_eq!(&buf[..], &[0x80, 0, 0, 0, 1, 0, 0xFF, 0xFF, 0, 1, 149, 0, 32, 1, 0, 3]);

        assert_eq!(Packet::deser(&buf).unwrap(), packet);
    }

    #[test]
    fn test_appended_acks() {
        let mut packet = Packet::new(StartPingCheck { ping_id: 1, oldest_unacked: 0 });
        packet.header.sequence = 3;

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        let plain_len = buf.len();
        append_acks(&mut buf, &[9, 0x01020304]);
        assert_eq!(buf[0], 0x10);
        assert_eq!(&buf[plain_len..], &[0, 0, 0, 9, 1, 2, 3, 4, 2]);

        let decoded = Packet::deser(&buf).unwrap();
        assert_eq!(decoded.header.appended_acks, vec![9, 0x01020304]);
        assert_eq!(decoded.message, packet.message);
    }

    #[test]
    fn test_appended_acks_on_zerocoded_packet() {
        let mut packet = Packet::reliable(LogoutReply::default());
        packet.header.appended_acks = vec![0, 1];

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        assert_eq!(buf[0], 0x80 | 0x40 | 0x10);

        let decoded = Packet::deser(&buf).unwrap();
        assert_eq!(decoded.header.appended_acks, vec![0, 1]);
        assert_eq!(decoded.message, packet.message);
    }

    #[test]
    fn test_extra_header_is_skipped() {
        let raw = [0x00, 0, 0, 0, 1, 2, 0xAA, 0xBB, 2, 7];
        let packet = Packet::deser(&raw).unwrap();
        assert_eq!(packet.header.extra, vec![0xAA, 0xBB]);
        assert_eq!(packet.message, Message::CompletePingCheck(CompletePingCheck { ping_id: 7 }));
    }

    #[rstest::rstest]
    #[case::too_short(vec![0, 0, 0, 0, 1, 0])]
    #[case::extra_header_too_long(vec![0, 0, 0, 0, 1, 5, 1, 2])]
    #[case::too_many_acks(vec![0x10, 0, 0, 0, 1, 0, 2, 7, 3])]
    #[case::bad_zerocoding(vec![0x80, 0, 0, 0, 1, 0, 2, 0])]
    #[case::truncated_body(vec![0x00, 0, 0, 0, 1, 0, 1, 7])]
    fn test_deser_malformed(#[case] raw: Vec<u8>) {
        assert!(Packet::deser(&raw).is_err());
    }

    #[test]
    fn test_reset() {
        let mut packet = Packet::reliable(ChatFromViewer {
            message: "hello".to_string(),
            ..ChatFromViewer::default()
        });
        packet.header.sequence = 17;
        packet.header.appended_acks.push(3);

        packet.reset();
        assert_eq!(packet, Packet::new(ChatFromViewer::default()));
    }
}
