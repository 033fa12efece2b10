use crate::prelude::*;

use bytes::{Buf, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio_util::codec::Decoder;

/// Frames larger than this are treated as garbage and the buffer is dropped.
pub const MAX_FRAME_LEN: usize = 0xffff;

const LEN_FIELD: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Control {
    Request = 0x70,
    Indication = 0x91,
    Response = 0x99,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MsgId {
    ContactInfo = 0x00,
    InverterData = 0x04,
    OtaUpdate = 0x13,
    GetTime = 0x22,
    CollectorData = 0x71,
    Modbus = 0x77,
}

impl MsgId {
    pub fn is_data(&self) -> bool {
        matches!(self, MsgId::InverterData | MsgId::CollectorData)
    }
}

/// One decoded Talent frame.
///
/// Layout (big-endian): `u32 total_len | u8 id_len | id | u8 ctrl | u8 msg_id | payload`
/// where `total_len` counts everything after the length field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TalentFrame {
    pub id: String,
    pub ctrl: u8,
    pub msg_id: u8,
    pub header_len: usize,
    pub raw: Bytes,
}

impl TalentFrame {
    pub fn control(&self) -> Option<Control> {
        Control::try_from(self.ctrl).ok()
    }

    pub fn msg(&self) -> Option<MsgId> {
        MsgId::try_from(self.msg_id).ok()
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[self.header_len..]
    }

    pub fn payload_len(&self) -> usize {
        self.raw.len() - self.header_len
    }
}

#[derive(Clone, Copy, Debug)]
struct Header {
    frame_len: usize,
    id_len: usize,
}

/// Incremental Talent decoder.
///
/// The header is remembered once complete, so repeated calls on a growing
/// buffer only re-check the body length.
#[derive(Debug, Default)]
pub struct TalentCodec {
    header: Option<Header>,
}

impl TalentCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.header = None;
    }

    fn parse_header(src: &BytesMut) -> Result<Option<Header>, FrameError> {
        if src.len() < LEN_FIELD + 1 {
            return Ok(None);
        }
        let total = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let id_len = src[4] as usize;
        if total < id_len + 3 || total + LEN_FIELD > MAX_FRAME_LEN {
            return Err(FrameError::BadLength(total));
        }
        Ok(Some(Header {
            frame_len: LEN_FIELD + total,
            id_len,
        }))
    }
}

impl Decoder for TalentCodec {
    type Item = TalentFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.header {
            Some(header) => header,
            None => match Self::parse_header(src) {
                Ok(Some(header)) => {
                    self.header = Some(header);
                    header
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    src.clear();
                    return Err(e);
                }
            },
        };

        if src.len() < header.frame_len {
            src.reserve(header.frame_len - src.len());
            return Ok(None);
        }

        self.header = None;
        let raw = src.split_to(header.frame_len).freeze();
        let id_end = LEN_FIELD + 1 + header.id_len;
        let id = String::from_utf8_lossy(&raw[LEN_FIELD + 1..id_end])
            .trim_end_matches('\0')
            .to_owned();

        Ok(Some(TalentFrame {
            id,
            ctrl: raw[id_end],
            msg_id: raw[id_end + 1],
            header_len: id_end + 2,
            raw,
        }))
    }
}

/// Serialises a Talent frame.
pub fn build(id: &str, ctrl: u8, msg_id: u8, payload: &[u8]) -> Vec<u8> {
    let id = id.as_bytes();
    let id = &id[..id.len().min(u8::MAX as usize)];
    let total = (id.len() + 3 + payload.len()) as u32;

    let mut r = Vec::with_capacity(LEN_FIELD + total as usize);
    r.extend_from_slice(&total.to_be_bytes());
    r.push(id.len() as u8);
    r.extend_from_slice(id);
    r.push(ctrl);
    r.push(msg_id);
    r.extend_from_slice(payload);
    r
}

/// Rewrites frames bound for the cloud.
///
/// Data indications carry a millisecond timestamp which is shifted by
/// `ts_offset` so the cloud sees its own clock. `raw` may hold several
/// concatenated frames; anything else passes through untouched.
pub fn rewrite_for_forward(raw: &[u8], ts_offset: i64) -> Vec<u8> {
    let mut out = raw.to_vec();
    if ts_offset == 0 {
        return out;
    }

    let mut pos = 0;
    while pos + LEN_FIELD + 1 <= out.len() {
        let mut cur = &out[pos..];
        let total = cur.get_u32() as usize;
        let id_len = cur.get_u8() as usize;
        let frame_len = LEN_FIELD + total;
        if total < id_len + 3 || pos + frame_len > out.len() {
            break;
        }

        let ctrl_pos = pos + LEN_FIELD + 1 + id_len;
        let payload = ctrl_pos + 2;
        let is_data = out[ctrl_pos] == u8::from(Control::Indication)
            && MsgId::try_from(out[ctrl_pos + 1]).map_or(false, |m| m.is_data());

        if is_data {
            if let Some(ts_pos) = super::data::timestamp_offset(&out[payload..pos + frame_len]) {
                let ts_pos = payload + ts_pos;
                let mut b = [0u8; 8];
                b.copy_from_slice(&out[ts_pos..ts_pos + 8]);
                let ts = i64::from_be_bytes(b).wrapping_add(ts_offset);
                out[ts_pos..ts_pos + 8].copy_from_slice(&ts.to_be_bytes());
            }
        }

        pos += frame_len;
    }

    out
}
