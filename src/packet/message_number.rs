use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::util::buf_ext::BufExt;

/// The message number prefix of a packet body. The frequency determines how many bytes the
///  number occupies on the wire.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum MessageNumber {
    /// 1 byte, `0x01..=0xFE`
    High(u8),
    /// `0xFF` followed by 1 byte
    Medium(u8),
    /// `0xFF 0xFF` followed by a big-endian u16
    Low(u16),
    /// `0xFF 0xFF 0xFF` followed by 1 byte, i.e. `0xFFFFFFxx`
    Fixed(u8),
    /// placeholder for an empty message, never valid on the wire
    #[default]
    Invalid,
}

impl MessageNumber {
    /// the number of bytes [MessageNumber::ser] writes
    pub fn wire_len(&self) -> usize {
        match self {
            MessageNumber::High(_) | MessageNumber::Invalid => 1,
            MessageNumber::Medium(_) => 2,
            MessageNumber::Low(_) | MessageNumber::Fixed(_) => 4,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match *self {
            MessageNumber::High(n) => buf.put_u8(n),
            MessageNumber::Medium(n) => {
                buf.put_u8(0xFF);
                buf.put_u8(n);
            }
            MessageNumber::Low(n) => {
                buf.put_u16(0xFFFF);
                buf.put_u16(n);
            }
            MessageNumber::Fixed(n) => {
                buf.put_u16(0xFFFF);
                buf.put_u8(0xFF);
                buf.put_u8(n);
            }
            MessageNumber::Invalid => buf.put_u8(0),
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageNumber> {
        let b0 = buf.try_read_u8()?;
        if b0 == 0 {
            bail!("invalid message number 0");
        }
        if b0 != 0xFF {
            return Ok(MessageNumber::High(b0));
        }

        let b1 = buf.try_read_u8()?;
        if b1 != 0xFF {
            return Ok(MessageNumber::Medium(b1));
        }

        let b2 = buf.try_read_u8()?;
        let b3 = buf.try_read_u8()?;
        if b2 == 0xFF {
            Ok(MessageNumber::Fixed(b3))
        }
        else {
            Ok(MessageNumber::Low(u16::from_be_bytes([b2, b3])))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::high(MessageNumber::High(4), vec![4])]
    #[case::medium(MessageNumber::Medium(17), vec![0xFF, 17])]
    #[case::low(MessageNumber::Low(252), vec![0xFF, 0xFF, 0, 252])]
    #[case::low_two_bytes(MessageNumber::Low(0x0102), vec![0xFF, 0xFF, 1, 2])]
    #[case::fixed(MessageNumber::Fixed(0xFB), vec![0xFF, 0xFF, 0xFF, 0xFB])]
    fn test_message_number(#[case] number: MessageNumber, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        number.ser(&mut buf);
        assert_eq!(&buf[..], &expected[..]);
        assert_eq!(number.wire_len(), expected.len());

        let mut b: &[u8] = &buf;
        assert_eq!(MessageNumber::deser(&mut b).unwrap(), number);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::medium_truncated(vec![0xFF])]
    #[case::low_truncated(vec![0xFF, 0xFF, 0])]
    #[case::zero(vec![0, 1])]
    fn test_message_number_truncated(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(MessageNumber::deser(&mut b).is_err());
    }
}
