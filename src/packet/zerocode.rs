//! Run-length coding of zero bytes: a run of n zeros is written as `0x00 n` with n in
//!  `1..=255`, longer runs are split.

use anyhow::bail;
use bytes::BufMut;

pub fn encode(src: &[u8], dst: &mut impl BufMut) {
    let mut zeros: u8 = 0;
    for &b in src {
        if b == 0 {
            if zeros == u8::MAX {
                dst.put_u8(0);
                dst.put_u8(zeros);
                zeros = 0;
            }
            zeros += 1;
        }
        else {
            if zeros > 0 {
                dst.put_u8(0);
                dst.put_u8(zeros);
                zeros = 0;
            }
            dst.put_u8(b);
        }
    }
    if zeros > 0 {
        dst.put_u8(0);
        dst.put_u8(zeros);
    }
}

pub fn decode(src: &[u8], dst: &mut Vec<u8>) -> anyhow::Result<()> {
    let mut iter = src.iter();
    while let Some(&b) = iter.next() {
        if b != 0 {
            dst.push(b);
            continue;
        }
        match iter.next() {
            None => bail!("zero-coded data ends with an unterminated zero run"),
            Some(0) => bail!("zero-coded data contains a zero run of length 0"),
            Some(&count) => dst.resize(dst.len() + count as usize, 0),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::no_zeros(vec![1, 2, 3], vec![1, 2, 3])]
    #[case::inner_run(vec![1, 0, 0, 0, 2], vec![1, 0, 3, 2])]
    #[case::trailing_run(vec![5, 0], vec![5, 0, 1])]
    #[case::leading_run(vec![0, 0, 7], vec![0, 2, 7])]
    #[case::max_run(vec![0; 255], vec![0, 255])]
    #[case::split_run(vec![0; 300], vec![0, 255, 0, 45])]
    #[case::empty(vec![], vec![])]
    fn test_zerocode(#[case] plain: Vec<u8>, #[case] encoded: Vec<u8>) {
        let mut buf = BytesMut::new();
        encode(&plain, &mut buf);
        assert_eq!(&buf[..], &encoded[..]);

        let mut decoded = Vec::new();
        decode(&encoded, &mut decoded).unwrap();
        assert_eq!(decoded, plain);
    }

    #[rstest]
    #[case::trailing_zero(vec![1, 0])]
    #[case::zero_count(vec![1, 0, 0, 2])]
    fn test_decode_malformed(#[case] encoded: Vec<u8>) {
        let mut decoded = Vec::new();
        assert!(decode(&encoded, &mut decoded).is_err());
    }
}
