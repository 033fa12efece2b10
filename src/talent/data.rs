// Talent payload formats: typed-triple data blocks, contact info, get-time
// and the Modbus tunnel wrapper.

use crate::prelude::*;

use nom::{
    bytes::complete::{take, take_until},
    number::complete::{be_f32, be_i16, be_i32, be_i64, be_i8, be_u32, be_u8},
    IResult,
};

/// Magic prefix of a tunneled Modbus payload: `00 01 a3 28 | u8 len | pdu`.
pub const MODBUS_MAGIC: u32 = 0x0001_a328;

const TAG_END: u8 = 0x00;
const TAG_STRING: u8 = 0x41;
const TAG_I8: u8 = 0x42;
const TAG_F32: u8 = 0x46;
const TAG_I32: u8 = 0x49;
const TAG_I64: u8 = 0x4c;
const TAG_I16: u8 = 0x53;
const TAG_PASCAL: u8 = 0x54;

#[derive(Clone, Debug, PartialEq)]
pub enum TalentValue {
    Str(String),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
}

impl TalentValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TalentValue::Str(_) => None,
            TalentValue::I8(v) => Some(*v as f64),
            TalentValue::I16(v) => Some(*v as f64),
            TalentValue::I32(v) => Some(*v as f64),
            TalentValue::I64(v) => Some(*v as f64),
            TalentValue::F32(v) => Some(*v as f64),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataBlock {
    pub data_id: u32,
    pub id: String,
    pub timestamp: i64,
    pub items: Vec<(u32, TalentValue)>,
}

fn pascal(input: &[u8]) -> IResult<&[u8], String> {
    let (input, len) = be_u8(input)?;
    let (input, s) = take(len)(input)?;
    Ok((input, String::from_utf8_lossy(s).into_owned()))
}

fn nul_terminated(input: &[u8]) -> IResult<&[u8], String> {
    let (input, s) = take_until(&b"\0"[..])(input)?;
    let (input, _) = take(1usize)(input)?;
    Ok((input, String::from_utf8_lossy(s).into_owned()))
}

struct Header {
    data_id: u32,
    id: String,
    timestamp: i64,
    count: u32,
}

fn header(input: &[u8]) -> IResult<&[u8], Header> {
    let (input, data_id) = be_u32(input)?;
    let (input, id) = pascal(input)?;
    let (input, _) = be_u8(input)?;
    let (input, timestamp) = be_i64(input)?;
    let (input, count) = be_u32(input)?;
    Ok((
        input,
        Header {
            data_id,
            id,
            timestamp,
            count,
        },
    ))
}

fn truncated<E>(_: nom::Err<E>) -> FrameError {
    FrameError::Truncated("talent data")
}

/// Parses a data block (msg 0x04 / 0x71).
///
/// Parsing stops at an end tag or after `count` items. An unknown type tag
/// aborts the whole block.
pub fn parse_data(payload: &[u8]) -> Result<DataBlock, FrameError> {
    let (mut input, h) = header(payload).map_err(truncated)?;

    // every item is at least an address and a tag
    let mut items = Vec::with_capacity((h.count as usize).min(input.len() / 5));
    for _ in 0..h.count {
        let (rest, addr) = be_u32::<_, nom::error::Error<&[u8]>>(input).map_err(truncated)?;
        let (rest, tag) = be_u8::<_, nom::error::Error<&[u8]>>(rest).map_err(truncated)?;
        let (rest, value) = match tag {
            TAG_END => break,
            TAG_PASCAL => pascal(rest).map(|(r, s)| (r, TalentValue::Str(s))),
            TAG_STRING => nul_terminated(rest).map(|(r, s)| (r, TalentValue::Str(s))),
            TAG_I8 => be_i8(rest).map(|(r, v)| (r, TalentValue::I8(v))),
            TAG_I16 => be_i16(rest).map(|(r, v)| (r, TalentValue::I16(v))),
            TAG_I32 => be_i32(rest).map(|(r, v)| (r, TalentValue::I32(v))),
            TAG_I64 => be_i64(rest).map(|(r, v)| (r, TalentValue::I64(v))),
            TAG_F32 => be_f32(rest).map(|(r, v)| (r, TalentValue::F32(v))),
            other => return Err(FrameError::InvalidDataType(other)),
        }
        .map_err(truncated)?;
        items.push((addr, value));
        input = rest;
    }

    Ok(DataBlock {
        data_id: h.data_id,
        id: h.id,
        timestamp: h.timestamp,
        items,
    })
}

/// Serialises a data block; numeric values are written as i32, strings as
/// pascal strings.
pub fn encode_data(block: &DataBlock) -> Vec<u8> {
    let mut r = Vec::new();
    r.extend_from_slice(&block.data_id.to_be_bytes());
    push_pascal(&mut r, &block.id);
    r.push(0x01);
    r.extend_from_slice(&block.timestamp.to_be_bytes());
    r.extend_from_slice(&(block.items.len() as u32).to_be_bytes());
    for (addr, value) in &block.items {
        r.extend_from_slice(&addr.to_be_bytes());
        match value {
            TalentValue::Str(s) => {
                r.push(TAG_PASCAL);
                push_pascal(&mut r, s);
            }
            TalentValue::I8(v) => {
                r.push(TAG_I8);
                r.extend_from_slice(&v.to_be_bytes());
            }
            TalentValue::I16(v) => {
                r.push(TAG_I16);
                r.extend_from_slice(&v.to_be_bytes());
            }
            TalentValue::I32(v) => {
                r.push(TAG_I32);
                r.extend_from_slice(&v.to_be_bytes());
            }
            TalentValue::I64(v) => {
                r.push(TAG_I64);
                r.extend_from_slice(&v.to_be_bytes());
            }
            TalentValue::F32(v) => {
                r.push(TAG_F32);
                r.extend_from_slice(&v.to_be_bytes());
            }
        }
    }
    r
}

fn push_pascal(r: &mut Vec<u8>, s: &str) {
    let b = s.as_bytes();
    let b = &b[..b.len().min(u8::MAX as usize)];
    r.push(b.len() as u8);
    r.extend_from_slice(b);
}

/// Offset of the timestamp inside a data payload, if the payload is long
/// enough to hold one.
pub fn timestamp_offset(payload: &[u8]) -> Option<usize> {
    let id_len = *payload.get(4)? as usize;
    let pos = 4 + 1 + id_len + 1;
    (payload.len() >= pos + 8).then_some(pos)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContactInfo {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Contact info is optional on the wire; an empty payload is valid.
pub fn parse_contact_info(payload: &[u8]) -> ContactInfo {
    let mut info = ContactInfo::default();
    if let Ok((rest, name)) = pascal(payload) {
        info.name = Some(name);
        if let Ok((_, email)) = pascal(rest) {
            info.email = Some(email);
        }
    }
    info
}

/// Get-time answers carry the sender's clock in ms since the epoch.
pub fn parse_time(payload: &[u8]) -> Option<i64> {
    let b: [u8; 8] = payload.get(..8)?.try_into().ok()?;
    Some(i64::from_be_bytes(b))
}

pub fn wrap_modbus(pdu: &[u8]) -> Vec<u8> {
    let mut r = Vec::with_capacity(5 + pdu.len());
    r.extend_from_slice(&MODBUS_MAGIC.to_be_bytes());
    r.push(pdu.len() as u8);
    r.extend_from_slice(pdu);
    r
}

pub fn unwrap_modbus(payload: &[u8]) -> Result<&[u8], FrameError> {
    if payload.len() < 5 {
        return Err(FrameError::Truncated("talent modbus"));
    }
    let len = payload[4] as usize;
    payload
        .get(5..5 + len)
        .ok_or(FrameError::Truncated("talent modbus pdu"))
}
