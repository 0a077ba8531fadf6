use std::fmt::{Display, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;

use crate::error::XgressError;
use crate::util::buf::{put_string, try_get_string};

/// The payload marks the end of its circuit. It carries no data and is never buffered.
pub const FLAG_CIRCUIT_END: u32 = 1;
/// Set for payloads originating from the terminator (egress) side of a circuit
pub const FLAG_ORIGINATOR: u32 = 2;
pub const FLAG_CIRCUIT_START: u32 = 4;

pub const HEADER_KEY_UUID: u8 = 0;

pub type Headers = FxHashMap<u8, Bytes>;

/// The fabric address an xgress is bound to
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Address(pub String);
impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address(value.to_string())
    }
}

/// Which endpoint of a circuit produced a payload
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Originator {
    Initiator = 0,
    Terminator = 1,
}
impl Display for Originator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Originator::Initiator => write!(f, "Initiator"),
            Originator::Terminator => write!(f, "Terminator"),
        }
    }
}

pub fn set_originator_flag(flags: u32, originator: Originator) -> u32 {
    match originator {
        Originator::Initiator => flags & !FLAG_ORIGINATOR,
        Originator::Terminator => flags | FLAG_ORIGINATOR,
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Payload {
    pub circuit_id: String,
    pub sequence: i32,
    pub flags: u32,
    pub data: Bytes,
    pub headers: Headers,
}
impl Payload {
    pub fn new(circuit_id: &str, sequence: i32, originator: Originator, data: Bytes, headers: Headers) -> Payload {
        Payload {
            circuit_id: circuit_id.to_string(),
            sequence,
            flags: set_originator_flag(0, originator),
            data,
            headers,
        }
    }

    pub fn end_of_circuit(circuit_id: &str, sequence: i32, originator: Originator) -> Payload {
        Payload {
            circuit_id: circuit_id.to_string(),
            sequence,
            flags: set_originator_flag(FLAG_CIRCUIT_END, originator),
            data: Bytes::new(),
            headers: Default::default(),
        }
    }

    pub fn is_circuit_end(&self) -> bool {
        self.flags & FLAG_CIRCUIT_END != 0
    }

    pub fn is_circuit_start(&self) -> bool {
        self.flags & FLAG_CIRCUIT_START != 0
    }

    pub fn originator(&self) -> Originator {
        if self.flags & FLAG_ORIGINATOR != 0 {
            Originator::Terminator
        }
        else {
            Originator::Initiator
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.circuit_id);
        buf.put_i32(self.sequence);
        buf.put_u32_varint(self.flags);

        buf.put_usize_varint(self.headers.len());
        for (&key, value) in &self.headers {
            buf.put_u8(key);
            buf.put_usize_varint(value.len());
            buf.put_slice(value);
        }

        buf.put_usize_varint(self.data.len());
        buf.put_slice(&self.data);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Payload> {
        let circuit_id = try_get_string(buf)?;
        if buf.remaining() < 4 {
            bail!(XgressError::MalformedMessage("payload truncated before sequence".to_string()));
        }
        let sequence = buf.get_i32();
        let flags = buf.try_get_u32_varint()?;

        let num_headers = buf.try_get_usize_varint()?;
        let mut headers = Headers::default();
        for _ in 0..num_headers {
            if !buf.has_remaining() {
                bail!(XgressError::MalformedMessage("payload truncated in headers".to_string()));
            }
            let key = buf.get_u8();
            let value = try_get_bytes(buf)?;
            headers.insert(key, value);
        }

        let data = try_get_bytes(buf)?;

        Ok(Payload {
            circuit_id,
            sequence,
            flags,
            data,
            headers,
        })
    }
}

fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!(XgressError::MalformedMessage(format!("length {} exceeds remaining {} bytes", len, buf.remaining())));
    }
    Ok(buf.copy_to_bytes(len))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Acknowledgement {
    pub circuit_id: String,
    pub sequence: Vec<i32>,
    pub originator: Originator,
}
impl Acknowledgement {
    pub fn new(circuit_id: &str, originator: Originator) -> Acknowledgement {
        Acknowledgement {
            circuit_id: circuit_id.to_string(),
            sequence: Vec::new(),
            originator,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.circuit_id);
        buf.put_u8(self.originator.into());
        let sequence = encode_sequence(&self.sequence);
        buf.put_usize_varint(sequence.len());
        buf.put_slice(&sequence);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Acknowledgement> {
        let circuit_id = try_get_string(buf)?;
        if !buf.has_remaining() {
            bail!(XgressError::MalformedMessage("acknowledgement truncated before originator".to_string()));
        }
        let originator = Originator::try_from(buf.get_u8())?;
        let sequence = decode_sequence(&try_get_bytes(buf)?)?;

        Ok(Acknowledgement {
            circuit_id,
            sequence,
            originator,
        })
    }
}

/// Each sequence number is written as four bytes big endian, an empty list has an empty encoding
pub fn encode_sequence(sequence: &[i32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(sequence.len() * 4);
    for &s in sequence {
        buf.put_i32(s);
    }
    buf.freeze()
}

pub fn decode_sequence(mut raw: &[u8]) -> anyhow::Result<Vec<i32>> {
    if raw.len() % 4 != 0 {
        bail!(XgressError::MalformedMessage(format!("acknowledgement sequence of {} bytes is not a multiple of 4", raw.len())));
    }

    let mut result = Vec::with_capacity(raw.len() / 4);
    while raw.has_remaining() {
        result.push(raw.get_i32());
    }
    Ok(result)
}
