use std::net::Ipv4Addr;
use anyhow::anyhow;
use glam::{Quat, Vec3};
use uuid::Uuid;
use crate::safe_converter::PrecheckedCast;

macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}

/// Maximum length of a `Variable 1` field, including the terminating NUL for text
pub const MAX_VARIABLE1_LEN: usize = u8::MAX as usize;
/// Text in `Variable 2` fields (chat, kick reasons) is capped at this length including the NUL
pub const MAX_TEXT2_LEN: usize = 1024;

/// Checked readers for the field types of the message template. Numbers are little endian
///  unless the name says otherwise.
pub trait BufExt: bytes::Buf {
    get_try_impl!(try_read_u8, u8, get_u8);
    get_try_impl!(try_read_u16_le, u16, get_u16_le);
    get_try_impl!(try_read_u16_be, u16, get_u16);
    get_try_impl!(try_read_u32_le, u32, get_u32_le);
    get_try_impl!(try_read_u32_be, u32, get_u32);
    get_try_impl!(try_read_u64_le, u64, get_u64_le);
    get_try_impl!(try_read_i32_le, i32, get_i32_le);
    get_try_impl!(try_read_f32_le, f32, get_f32_le);

    fn try_read_bytes(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow: expected {} bytes, {} remaining", len, self.remaining()));
        }
        let mut result = vec![0u8; len];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    fn try_read_uuid(&mut self) -> anyhow::Result<Uuid> {
        let mut raw = [0u8; 16];
        if self.remaining() < raw.len() {
            return Err(anyhow!("buffer underflow"));
        }
        self.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    fn try_read_vec3(&mut self) -> anyhow::Result<Vec3> {
        let x = self.try_read_f32_le()?;
        let y = self.try_read_f32_le()?;
        let z = self.try_read_f32_le()?;
        Ok(Vec3::new(x, y, z))
    }

    /// a quaternion is transmitted as the x, y and z of its normalized form with non-negative
    ///  w, w being reconstructed from the other three
    fn try_read_quat(&mut self) -> anyhow::Result<Quat> {
        let xyz = self.try_read_vec3()?;
        let w_squared = 1.0 - xyz.length_squared();
        let w = if w_squared > 0.0 { w_squared.sqrt() } else { 0.0 };
        Ok(Quat::from_xyzw(xyz.x, xyz.y, xyz.z, w))
    }

    /// IPADDR fields are in network byte order
    fn try_read_ipv4(&mut self) -> anyhow::Result<Ipv4Addr> {
        Ok(Ipv4Addr::from(self.try_read_u32_be()?))
    }

    fn try_read_variable1(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = self.try_read_u8()? as usize;
        self.try_read_bytes(len)
    }

    fn try_read_variable2(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = self.try_read_u16_le()? as usize;
        self.try_read_bytes(len)
    }

    fn try_read_text1(&mut self) -> anyhow::Result<String> {
        Ok(text_from_field(&self.try_read_variable1()?))
    }

    fn try_read_text2(&mut self) -> anyhow::Result<String> {
        Ok(text_from_field(&self.try_read_variable2()?))
    }

    /// Number of repetitions of a variable block. Trailing variable blocks may be omitted
    ///  altogether, which counts as zero repetitions.
    fn try_read_block_count(&mut self) -> anyhow::Result<usize> {
        if !self.has_remaining() {
            return Ok(0);
        }
        Ok(self.try_read_u8()? as usize)
    }
}

pub trait BufMutExt: bytes::BufMut {
    fn put_uuid(&mut self, id: &Uuid) {
        self.put_slice(id.as_bytes());
    }

    fn put_vec3(&mut self, v: Vec3) {
        self.put_f32_le(v.x);
        self.put_f32_le(v.y);
        self.put_f32_le(v.z);
    }

    fn put_quat(&mut self, q: Quat) {
        let normalized = if q.length_squared() > 0.0 { q.normalize() } else { Quat::IDENTITY };
        let normalized = if normalized.w < 0.0 { -normalized } else { normalized };
        self.put_f32_le(normalized.x);
        self.put_f32_le(normalized.y);
        self.put_f32_le(normalized.z);
    }

    fn put_ipv4(&mut self, ip: Ipv4Addr) {
        self.put_slice(&ip.octets());
    }

    /// NB: the caller is responsible for the length limit of 255 bytes
    fn put_variable1(&mut self, data: &[u8]) {
        self.put_u8(data.len().prechecked_cast());
        self.put_slice(data);
    }

    fn put_variable2(&mut self, data: &[u8]) {
        self.put_u16_le(data.len().prechecked_cast());
        self.put_slice(data);
    }

    /// writes text NUL-terminated, truncated so that the field including NUL fits 255 bytes
    fn put_text1(&mut self, s: &str) {
        let truncated = truncate_utf8(s, MAX_VARIABLE1_LEN - 1);
        self.put_u8((truncated.len() + 1).prechecked_cast());
        self.put_slice(truncated.as_bytes());
        self.put_u8(0);
    }

    fn put_text2(&mut self, s: &str, max_len: usize) {
        let max_len = max_len.min(u16::MAX as usize);
        let truncated = truncate_utf8(s, max_len - 1);
        self.put_u16_le((truncated.len() + 1).prechecked_cast());
        self.put_slice(truncated.as_bytes());
        self.put_u8(0);
    }

    fn put_block_count(&mut self, count: usize) {
        self.put_u8(count.prechecked_cast());
    }
}

impl <T: bytes::Buf> BufExt for T {
}

impl <T: bytes::BufMut> BufMutExt for T {
}

/// cuts a string to at most `max_len` bytes without splitting a UTF-8 sequence
pub fn truncate_utf8(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn text_from_field(raw: &[u8]) -> String {
    let end = raw.iter()
        .position(|&b| b == 0)
        .unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
