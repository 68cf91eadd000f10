use bitflags::bitflags;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct PacketFlags: u8 {
        const ZEROCODED = 0x80;
        const RELIABLE = 0x40;
        /// set on every re-transmission of a reliable packet
        const RESENT = 0x20;
        const APPENDED_ACKS = 0x10;
    }
}

/// offset of the first byte after flags and sequence number
pub const SEQUENCE_END: usize = 5;
/// minimum size of a packet: flags, sequence, extra header length and a 1 byte message number
pub const MIN_PACKET_LEN: usize = SEQUENCE_END + 2;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: u32,
    /// opaque extra header bytes, passed through unchanged
    pub extra: Vec<u8>,
    /// acks piggybacked on the packet, in wire order
    pub appended_acks: Vec<u32>,
}

impl PacketHeader {
    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn is_resent(&self) -> bool {
        self.flags.contains(PacketFlags::RESENT)
    }

    pub fn is_zerocoded(&self) -> bool {
        self.flags.contains(PacketFlags::ZEROCODED)
    }
}

/// Marks already serialized packet bytes as a re-transmission
pub fn mark_resent(raw: &mut [u8]) {
    if let Some(flags) = raw.first_mut() {
        *flags |= PacketFlags::RESENT.bits();
    }
}

/// Reads the sequence number from serialized packet bytes
pub fn raw_sequence(raw: &[u8]) -> Option<u32> {
    if raw.len() < SEQUENCE_END {
        return None;
    }
    Some(u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_resent() {
        let mut raw = vec![0x40, 0, 0, 0, 9, 0, 1];
        mark_resent(&mut raw);
        assert_eq!(raw[0], 0x60);
        assert_eq!(raw_sequence(&raw), Some(9));

        let mut empty: Vec<u8> = vec![];
        mark_resent(&mut empty);
        assert_eq!(raw_sequence(&empty), None);
    }

    #[test]
    fn test_flags_ignore_unknown_bits() {
        let flags = PacketFlags::from_bits_truncate(0x41);
        assert_eq!(flags, PacketFlags::RELIABLE);
    }
}
