use crate::infos::register_map::{ModbusEntry, MODBUS_MAP};
use crate::infos::scaled_value;
use crate::prelude::*;

use serde_json::Value;
use std::collections::VecDeque;
use thiserror::Error;

pub const READ_HOLDING_REGS: u8 = 0x03;
pub const READ_INPUT_REGS: u8 = 0x04;
pub const WRITE_SINGLE_REG: u8 = 0x06;

pub const INVERTER_ADDR: u8 = 0x01;

const EXCEPTION_FLAG: u8 = 0x80;

/// Cloud requests waiting for the device link beyond this are dropped,
/// oldest first.
const MAX_HELD: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModbusError {
    #[error("response too short ({0} bytes)")]
    TooShort(usize),
    #[error("CRC mismatch")]
    Crc,
    #[error("address mismatch: expected {expected}, got {got}")]
    AddressMismatch { expected: u8, got: u8 },
    #[error("function mismatch: expected {expected}, got {got}")]
    FunctionMismatch { expected: u8, got: u8 },
    #[error("length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("unsolicited response")]
    Unsolicited,
}

impl ModbusError {
    pub fn counter(&self) -> Counter {
        match self {
            ModbusError::TooShort(_) | ModbusError::LengthMismatch { .. } => Counter::ModbusLenErr,
            ModbusError::Crc => Counter::ModbusCrcErr,
            ModbusError::AddressMismatch { .. } => Counter::ModbusAddrErr,
            ModbusError::FunctionMismatch { .. } => Counter::ModbusFuncErr,
            ModbusError::Unsolicited => Counter::ModbusUnsolicited,
        }
    }
}

pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(data)
}

/// True when the trailing little-endian CRC matches the rest of the PDU.
pub fn check_crc(pdu: &[u8]) -> bool {
    if pdu.len() < 4 {
        return false;
    }
    let (body, crc) = pdu.split_at(pdu.len() - 2);
    crc16(body) == u16::from_le_bytes([crc[0], crc[1]])
}

/// Builds `addr | func | reg | value | crc`. For reads `value` is the
/// register count.
pub fn build_pdu(addr: u8, func: u8, reg: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(8);
    pdu.push(addr);
    pdu.push(func);
    pdu.extend_from_slice(&reg.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    let crc = crc16(&pdu);
    pdu.extend_from_slice(&crc.to_le_bytes());
    pdu
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub addr: u8,
    pub func: u8,
    pub reg: u16,
    pub value: u16,
    pub retries_remaining: u8,
    pub pdu: Vec<u8>,
}

#[derive(Debug, PartialEq)]
pub enum Timeout {
    /// resend this PDU and restart the timer
    Retransmit(Vec<u8>),
    /// retries exhausted; send the next queued PDU, if any
    Abandoned(Option<Vec<u8>>),
    /// nothing was outstanding
    Idle,
}

#[derive(Debug, Default, PartialEq)]
pub struct Response {
    pub values: Vec<(Register, Value)>,
    pub exception: Option<u8>,
    /// next queued PDU to transmit now that this request is complete
    pub next: Option<Vec<u8>>,
}

impl Request {
    /// Parses a request PDU received from the cloud.
    pub fn from_pdu(pdu: &[u8]) -> Result<Self, ModbusError> {
        if pdu.len() < 8 {
            return Err(ModbusError::TooShort(pdu.len()));
        }
        if !check_crc(pdu) {
            return Err(ModbusError::Crc);
        }
        Ok(Self {
            addr: pdu[0],
            func: pdu[1],
            reg: u16::from_be_bytes([pdu[2], pdu[3]]),
            value: u16::from_be_bytes([pdu[4], pdu[5]]),
            retries_remaining: 0,
            pdu: pdu.to_vec(),
        })
    }

    fn answered_by(&self, pdu: &[u8]) -> bool {
        pdu.len() >= 2
            && pdu[0] == self.addr
            && (pdu[1] == self.func || pdu[1] == self.func | EXCEPTION_FLAG)
    }
}

/// Request/response correlation for the tunneled Modbus-RTU link.
///
/// The tunnel has no I/O of its own: callers transmit whatever PDU it hands
/// back and drive [`ModbusTunnel::on_timeout`] from a timer.
///
/// The device link carries one request at a time. Our own commands and
/// requests passed through from the cloud take turns; a cloud request that
/// arrives while the link is busy is held together with the frame carrying
/// it until [`ModbusTunnel::release_held`] hands it out.
#[derive(Debug)]
pub struct ModbusTunnel {
    retries: u8,
    pending: Option<Request>,
    queue: VecDeque<Request>,
    /// cloud request on the wire; its answer goes back to the cloud
    cloud: Option<Request>,
    held: VecDeque<(Request, Vec<u8>)>,
}

impl ModbusTunnel {
    pub fn new(retries: u8) -> Self {
        Self {
            retries,
            pending: None,
            queue: VecDeque::new(),
            cloud: None,
            held: VecDeque::new(),
        }
    }

    pub fn link_busy(&self) -> bool {
        self.pending.is_some() || self.cloud.is_some()
    }

    pub fn cloud_in_flight(&self) -> bool {
        self.cloud.is_some()
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&Request> {
        self.pending.as_ref()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queues a command. Returns the PDU when it can go out immediately.
    pub fn build_msg(&mut self, func: u8, reg: u16, value: u16) -> Option<Vec<u8>> {
        let pdu = build_pdu(INVERTER_ADDR, func, reg, value);
        let request = Request {
            addr: INVERTER_ADDR,
            func,
            reg,
            value,
            retries_remaining: self.retries,
            pdu: pdu.clone(),
        };

        if !self.link_busy() {
            self.pending = Some(request);
            Some(pdu)
        } else {
            debug!("modbus: queueing func {} reg 0x{:04x}", func, reg);
            self.queue.push_back(request);
            None
        }
    }

    pub fn on_timeout(&mut self) -> Timeout {
        if let Some(cloud) = self.cloud.as_ref() {
            // the cloud retries on its own
            warn!(
                "modbus: no answer to cloud func {} reg 0x{:04x}",
                cloud.func, cloud.reg
            );
            return Timeout::Abandoned(self.cloud_done());
        }
        let Some(pending) = self.pending.as_mut() else {
            return Timeout::Idle;
        };

        if pending.retries_remaining > 0 {
            pending.retries_remaining -= 1;
            debug!(
                "modbus: retrying reg 0x{:04x}, {} retries left",
                pending.reg, pending.retries_remaining
            );
            return Timeout::Retransmit(pending.pdu.clone());
        }

        warn!(
            "modbus: giving up on func {} reg 0x{:04x}",
            pending.func, pending.reg
        );
        Timeout::Abandoned(self.advance())
    }

    /// Validates a response PDU against the outstanding request.
    ///
    /// On error the pending request is left in place to be retried.
    pub fn recv_resp(&mut self, pdu: &[u8]) -> Result<Response, ModbusError> {
        let Some(pending) = self.pending.as_ref() else {
            return Err(ModbusError::Unsolicited);
        };
        if pdu.len() < 5 {
            return Err(ModbusError::TooShort(pdu.len()));
        }
        if !check_crc(pdu) {
            return Err(ModbusError::Crc);
        }
        if pdu[0] != pending.addr {
            return Err(ModbusError::AddressMismatch {
                expected: pending.addr,
                got: pdu[0],
            });
        }

        if pdu[1] == pending.func | EXCEPTION_FLAG {
            let code = pdu[2];
            warn!(
                "modbus: exception {} for func {} reg 0x{:04x}",
                code, pending.func, pending.reg
            );
            return Ok(Response {
                exception: Some(code),
                next: self.advance(),
                ..Default::default()
            });
        }
        if pdu[1] != pending.func {
            return Err(ModbusError::FunctionMismatch {
                expected: pending.func,
                got: pdu[1],
            });
        }

        let values = match pending.func {
            READ_HOLDING_REGS | READ_INPUT_REGS => {
                let expected = 2 * pending.value as usize;
                let got = pdu[2] as usize;
                if got != expected || pdu.len() != 5 + got {
                    return Err(ModbusError::LengthMismatch { expected, got });
                }
                decode_regs(pending.reg, &pdu[3..3 + got])
            }
            _ => {
                if pdu.len() != 8 || pdu[..6] != pending.pdu[..6] {
                    return Err(ModbusError::LengthMismatch {
                        expected: 8,
                        got: pdu.len(),
                    });
                }
                Vec::new()
            }
        };

        Ok(Response {
            values,
            exception: None,
            next: self.advance(),
        })
    }

    /// Sanity check for requests originating from the cloud.
    pub fn recv_req(&self, pdu: &[u8]) -> Result<(), ModbusError> {
        Request::from_pdu(pdu).map(|_| ())
    }

    /// Tracks a cloud request bound for the device. Returns true when
    /// `frame` may be sent now; otherwise it is held.
    pub fn cloud_req(&mut self, pdu: &[u8], frame: &[u8]) -> Result<bool, ModbusError> {
        let request = Request::from_pdu(pdu)?;
        if !self.link_busy() {
            self.cloud = Some(request);
            return Ok(true);
        }

        debug!(
            "modbus: link busy, holding cloud func {} reg 0x{:04x}",
            request.func, request.reg
        );
        if self.held.len() >= MAX_HELD {
            if let Some((dropped, _)) = self.held.pop_front() {
                warn!("modbus: dropping held cloud reg 0x{:04x}", dropped.reg);
            }
        }
        self.held.push_back((request, frame.to_vec()));
        Ok(false)
    }

    /// True when `pdu` answers the cloud request on the wire.
    pub fn is_cloud_resp(&self, pdu: &[u8]) -> bool {
        self.cloud.as_ref().map_or(false, |c| c.answered_by(pdu))
    }

    /// The cloud request was answered or timed out. Our next queued
    /// command, if any, goes first.
    pub fn cloud_done(&mut self) -> Option<Vec<u8>> {
        self.cloud = None;
        self.pending = self.queue.pop_front();
        self.pending.as_ref().map(|r| r.pdu.clone())
    }

    /// Hands out the oldest held cloud frame once the link is free.
    pub fn release_held(&mut self) -> Option<Vec<u8>> {
        if self.link_busy() {
            return None;
        }
        let (request, frame) = self.held.pop_front()?;
        self.cloud = Some(request);
        Some(frame)
    }

    pub fn clear(&mut self) {
        self.pending = None;
        self.queue.clear();
        self.cloud = None;
        self.held.clear();
    }

    // held cloud requests go before our next queued command
    fn advance(&mut self) -> Option<Vec<u8>> {
        if !self.held.is_empty() {
            self.pending = None;
            return None;
        }
        self.pending = self.queue.pop_front();
        self.pending.as_ref().map(|r| r.pdu.clone())
    }
}

/// Maps a block of big-endian registers starting at `start` through the
/// static Modbus map.
pub fn decode_regs(start: u16, data: &[u8]) -> Vec<(Register, Value)> {
    let end = start as usize + data.len() / 2;
    MODBUS_MAP
        .iter()
        .filter(|e: &&ModbusEntry| {
            let addr = e.addr as usize;
            addr >= start as usize && addr + e.kind.size() / 2 <= end
        })
        .filter_map(|e| {
            let offset = (e.addr - start) as usize * 2;
            e.kind
                .read(data, offset)
                .map(|raw| (e.register, scaled_value(raw, &e.scale)))
        })
        .collect()
}
