use crate::prelude::*;
use crate::solarman::sequence::Sequence;

use bytes::{Buf, Bytes, BytesMut};
use nom_derive::{Nom, Parse};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio_util::codec::Decoder;

pub const START: u8 = 0xa5;
pub const STOP: u8 = 0x15;
pub const HEADER_LEN: usize = 11;
/// header plus checksum and stop byte
pub const OVERHEAD: usize = HEADER_LEN + 2;
/// The length field is 16 bits wide.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

const RESPONSE_OFFSET: u16 = 0x3000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ControlCode {
    DeviceInd = 0x4110,
    Data = 0x4210,
    SyncStart = 0x4310,
    Command = 0x4510,
    Heartbeat = 0x4710,
    SyncEnd = 0x4810,
    DeviceRsp = 0x1110,
    DataRsp = 0x1210,
    SyncStartRsp = 0x1310,
    CommandRsp = 0x1510,
    HeartbeatRsp = 0x1710,
    SyncEndRsp = 0x1810,
}

impl ControlCode {
    pub fn is_response(code: u16) -> bool {
        code & 0xf000 == 0x1000
    }

    /// Control code of the acknowledgement for a device request.
    pub fn response_to(code: u16) -> u16 {
        code.wrapping_sub(RESPONSE_OFFSET)
    }
}

/// One decoded Solarman-V5 frame.
///
/// Layout (little-endian): `0xa5 | u16 len | u16 ctrl | u16 seq | u32 serial |
/// payload | checksum | 0x15`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolarmanFrame {
    pub ctrl: u16,
    pub seq: u16,
    pub serial: u32,
    pub raw: Bytes,
}

impl SolarmanFrame {
    pub fn code(&self) -> Option<ControlCode> {
        ControlCode::try_from(self.ctrl).ok()
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_LEN..self.raw.len() - 2]
    }

    pub fn payload_len(&self) -> usize {
        self.raw.len() - OVERHEAD
    }

    /// First payload byte; echoed in acknowledgements.
    pub fn frame_type(&self) -> u8 {
        self.payload().first().copied().unwrap_or(0)
    }
}

pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Incremental Solarman decoder.
///
/// A lost start byte drops the whole buffer; a bad checksum or stop byte
/// drops just the one frame.
#[derive(Debug, Default)]
pub struct SolarmanCodec {
    frame_len: Option<usize>,
}

impl SolarmanCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.frame_len = None;
    }
}

impl Decoder for SolarmanCodec {
    type Item = SolarmanFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame_len = match self.frame_len {
            Some(len) => len,
            None => {
                if src.is_empty() {
                    return Ok(None);
                }
                if src[0] != START {
                    let b = src[0];
                    src.clear();
                    return Err(FrameError::BadStartByte(b));
                }
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let len = u16::from_le_bytes([src[1], src[2]]) as usize + OVERHEAD;
                self.frame_len = Some(len);
                len
            }
        };

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        self.frame_len = None;
        let stop = src[frame_len - 1];
        if stop != STOP {
            src.advance(frame_len);
            return Err(FrameError::BadStopByte(stop));
        }
        let calculated = checksum(&src[1..frame_len - 2]);
        let found = src[frame_len - 2];
        if calculated != found {
            src.advance(frame_len);
            return Err(FrameError::BadChecksum { calculated, found });
        }

        let raw = src.split_to(frame_len).freeze();
        let mut hdr = &raw[3..HEADER_LEN];
        let ctrl = hdr.get_u16_le();
        let seq = hdr.get_u16_le();
        let serial = hdr.get_u32_le();

        Ok(Some(SolarmanFrame {
            ctrl,
            seq,
            serial,
            raw,
        }))
    }
}

/// Frames `payload`, which must fit the length field (see [`MAX_PAYLOAD`]).
pub fn build(ctrl: u16, seq: u16, serial: u32, payload: &[u8]) -> Vec<u8> {
    debug_assert!(
        payload.len() <= MAX_PAYLOAD,
        "solarman payload of {} bytes",
        payload.len()
    );
    let mut r = Vec::with_capacity(OVERHEAD + payload.len());
    r.push(START);
    r.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    r.extend_from_slice(&ctrl.to_le_bytes());
    r.extend_from_slice(&seq.to_le_bytes());
    r.extend_from_slice(&serial.to_le_bytes());
    r.extend_from_slice(payload);
    r.push(checksum(&r[1..]));
    r.push(STOP);
    r
}

/// Gives every frame in `raw` a fresh sequence number from `seq` and
/// recomputes its checksum. Payloads are not touched.
pub fn rewrite_for_forward(raw: &[u8], seq: &mut Sequence) -> Vec<u8> {
    let mut out = raw.to_vec();
    let mut pos = 0;
    while pos + HEADER_LEN <= out.len() && out[pos] == START {
        let len = u16::from_le_bytes([out[pos + 1], out[pos + 2]]) as usize + OVERHEAD;
        if pos + len > out.len() {
            break;
        }
        out[pos + 5..pos + 7].copy_from_slice(&seq.next_send().to_le_bytes());
        out[pos + len - 2] = checksum(&out[pos + 1..pos + len - 2]);
        pos += len;
    }
    out
}

// {{{ payload layouts
/// Start of a real-time data payload (0x4210).
#[derive(Clone, Debug, PartialEq, Nom)]
#[nom(LittleEndian)]
pub struct DataHeader {
    pub frame_type: u8,
    pub sensor_list: u16,
}

/// Prefix in front of the Modbus PDU in a 0x4510 command.
#[derive(Clone, Debug, PartialEq, Nom)]
#[nom(LittleEndian)]
pub struct CommandHeader {
    pub frame_type: u8,
    pub sensor_type: u16,
    pub total_working_time: u32,
    pub power_on_time: u32,
    pub offset_time: u32,
}

/// Prefix in front of the Modbus PDU in a 0x1510 command response.
#[derive(Clone, Debug, PartialEq, Nom)]
#[nom(LittleEndian)]
pub struct CommandResponseHeader {
    pub frame_type: u8,
    pub status: u8,
    pub total_working_time: u32,
    pub power_on_time: u32,
    pub offset_time: u32,
}

pub const COMMAND_HEADER_LEN: usize = 15;
pub const COMMAND_RESPONSE_HEADER_LEN: usize = 14;

pub fn data_header(payload: &[u8]) -> Result<DataHeader, FrameError> {
    DataHeader::parse(payload)
        .map(|(_, h)| h)
        .map_err(|_| FrameError::Truncated("solarman data header"))
}

/// Splits a command request into its header and the tunneled PDU.
pub fn command_pdu(payload: &[u8]) -> Result<(CommandHeader, &[u8]), FrameError> {
    CommandHeader::parse(payload)
        .map(|(rest, h)| (h, rest))
        .map_err(|_| FrameError::Truncated("solarman command"))
}

pub fn command_response_pdu(payload: &[u8]) -> Result<(CommandResponseHeader, &[u8]), FrameError> {
    CommandResponseHeader::parse(payload)
        .map(|(rest, h)| (h, rest))
        .map_err(|_| FrameError::Truncated("solarman command response"))
}

pub fn command_payload(pdu: &[u8]) -> Vec<u8> {
    let mut r = Vec::with_capacity(COMMAND_HEADER_LEN + pdu.len());
    r.push(0x02);
    r.extend_from_slice(&0u16.to_le_bytes());
    r.extend_from_slice(&[0u8; 12]);
    r.extend_from_slice(pdu);
    r
}

/// Acknowledgement payload: `frame_type | 0x01 | u32 unix time | u32 0`.
pub fn ack_payload(frame_type: u8, unix_time: u32) -> Vec<u8> {
    let mut r = Vec::with_capacity(10);
    r.push(frame_type);
    r.push(0x01);
    r.extend_from_slice(&unix_time.to_le_bytes());
    r.extend_from_slice(&0u32.to_le_bytes());
    r
}
// }}}
