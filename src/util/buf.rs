use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("string length {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }

    let raw = buf.copy_to_bytes(len);
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

pub fn put_bool(buf: &mut impl BufMut, b: bool) {
    buf.put_u8(if b { 1 } else { 0 });
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    if !buf.has_remaining() {
        bail!("buffer exhausted reading a boolean");
    }
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        n => bail!("invalid boolean value {}", n),
    }
}
