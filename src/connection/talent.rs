use crate::infos::register_map::TALENT_MAP;
use crate::prelude::*;
use crate::talent::data::{self, DataBlock, TalentValue};
use crate::talent::packet::{self, Control, MsgId, TalentCodec, TalentFrame};

use super::{now_ms, ConnectionCore, Protocol};

use bytes::BytesMut;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::codec::Decoder;

/// A Talent connection, either the device leg (server) or the cloud leg
/// (client).
pub struct TalentConnection {
    core: ConnectionCore,
    codec: TalentCodec,
    /// cloud clock minus local clock, in ms
    ts_offset: i64,
}

impl TalentConnection {
    pub fn new(role: Role, ctx: Context, events: &UnboundedSender<SessionEvent>) -> Self {
        Self {
            core: ConnectionCore::new(Family::Talent, role, ctx, events),
            codec: TalentCodec::new(),
            ts_offset: 0,
        }
    }

    pub fn ts_offset(&self) -> i64 {
        self.ts_offset
    }

    fn id(&self) -> String {
        self.core.unique_id.clone().unwrap_or_default()
    }

    fn reply(&mut self, msg_id: MsgId, payload: &[u8]) {
        let frame = packet::build(&self.id(), Control::Response.into(), msg_id.into(), payload);
        self.core.send(&frame);
    }

    fn dispatch(&mut self, frame: TalentFrame) -> Result<()> {
        if !self.core.check_serial(&frame.id) {
            return Ok(());
        }
        trace!(
            "{}: ctrl 0x{:02x} msg 0x{:02x} len {}",
            self.core.name(),
            frame.ctrl,
            frame.msg_id,
            frame.payload_len()
        );

        match self.core.role {
            Role::Server => self.device_frame(&frame),
            Role::Client => self.cloud_frame(&frame),
        }
    }

    // {{{ device leg
    fn device_frame(&mut self, frame: &TalentFrame) -> Result<()> {
        let Some(ctrl) = frame.control() else {
            self.core
                .stats()
                .count(Counter::UnknownCtrl, format!("talent ctrl 0x{:02x}", frame.ctrl));
            self.core.forward(&frame.raw);
            return Ok(());
        };
        let Some(msg) = frame.msg() else {
            self.core
                .stats()
                .count(Counter::UnknownMsg, format!("talent msg 0x{:02x}", frame.msg_id));
            self.core.forward(&frame.raw);
            return Ok(());
        };

        match (ctrl, msg) {
            (Control::Response, MsgId::Modbus) => self.device_modbus(frame)?,
            // answers to cloud requests go back to the cloud as they are
            (Control::Response, _) => self.core.forward(&frame.raw),
            (_, MsgId::ContactInfo) => {
                let info = data::parse_contact_info(frame.payload());
                debug!("{}: contact info {:?}", self.core.name(), info);
                self.reply(MsgId::ContactInfo, &[0x01]);
                self.core.forward(&frame.raw);
            }
            (_, MsgId::GetTime) => {
                self.reply(MsgId::GetTime, &now_ms().to_be_bytes());
                self.core.set_state(State::Up);
                self.core.forward(&frame.raw);
            }
            (_, MsgId::InverterData) | (_, MsgId::CollectorData) => {
                self.reply(msg, &[0x01]);
                self.device_data(frame);
                self.core.forward(&frame.raw);
            }
            (_, MsgId::OtaUpdate) => {
                self.core
                    .stats()
                    .count(Counter::OtaStartMsg, format!("{}: OTA start", self.core.name()));
                self.core.forward(&frame.raw);
            }
            (_, MsgId::Modbus) => self.device_modbus(frame)?,
        }

        Ok(())
    }

    fn device_data(&mut self, frame: &TalentFrame) {
        match data::parse_data(frame.payload()) {
            Ok(block) => {
                let n = self.core.db.apply_talent(&block.items);
                debug!(
                    "{}: data block {} items, {} changed",
                    self.core.name(),
                    block.items.len(),
                    n
                );
                if self.core.state != State::Up {
                    self.core.set_state(State::Up);
                }
            }
            Err(e) => self.core.frame_error(&e),
        }
    }

    fn device_modbus(&mut self, frame: &TalentFrame) -> Result<()> {
        let pdu = data::unwrap_modbus(frame.payload());
        match pdu {
            Ok(pdu) if self.core.tunnel.is_cloud_resp(pdu) => {
                self.core.forward(&frame.raw);
                if let Some(next) = self.core.on_cloud_resp() {
                    self.send_modbus(&next);
                }
            }
            _ if !self.core.tunnel.has_pending() => self.core.forward(&frame.raw),
            Ok(pdu) => {
                let pdu = pdu.to_vec();
                if let Some(next) = self.core.on_modbus_resp(&pdu) {
                    self.send_modbus(&next);
                }
            }
            Err(e) => self.core.frame_error(&e),
        }
        self.release_held();
        Ok(())
    }

    /// Cloud Modbus requests share the device link with our own commands.
    /// Returns true when the frame was held back.
    fn hold_cloud_modbus(&mut self, frame: &TalentFrame) -> bool {
        if frame.msg() != Some(MsgId::Modbus) || frame.control() == Some(Control::Response) {
            return false;
        }
        match data::unwrap_modbus(frame.payload()) {
            Ok(pdu) => !self.core.cloud_modbus(pdu, &frame.raw),
            Err(_) => false,
        }
    }
    // }}}

    // {{{ cloud leg
    fn cloud_frame(&mut self, frame: &TalentFrame) -> Result<()> {
        match (frame.control(), frame.msg()) {
            (Some(Control::Response), Some(MsgId::GetTime)) => {
                if let Some(ts) = data::parse_time(frame.payload()) {
                    self.ts_offset = ts - now_ms();
                    debug!("{}: cloud clock offset {} ms", self.core.name(), self.ts_offset);
                }
                if self.core.state != State::Up {
                    self.core.set_state(State::Up);
                }
            }
            // the device was already answered locally
            (Some(Control::Response), _) => {
                trace!("{}: dropping cloud ack 0x{:02x}", self.core.name(), frame.msg_id)
            }
            (_, Some(MsgId::Modbus)) => {
                match data::unwrap_modbus(frame.payload()) {
                    Ok(pdu) => {
                        if let Err(e) = self.core.tunnel.recv_req(pdu) {
                            warn!("{}: cloud modbus request: {}", self.core.name(), e);
                            self.core.stats().count(e.counter(), e.to_string());
                        }
                    }
                    Err(e) => self.core.frame_error(&e),
                }
                self.core.forward(&frame.raw);
            }
            _ => self.core.forward(&frame.raw),
        }
        Ok(())
    }
    // }}}
}

impl Protocol for TalentConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ConnectionCore {
        &mut self.core
    }

    fn read(&mut self) {
        loop {
            if self.core.is_closed() {
                return;
            }
            let frame = match self.codec.decode(self.core.rx.buf_mut()) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    self.codec.reset();
                    self.core.frame_error(&e);
                    continue;
                }
            };
            if let Err(e) = self.dispatch(frame) {
                self.core.internal_error(e);
            }
        }
    }

    fn forward_in(&mut self, raw: &[u8]) {
        if self.core.role == Role::Client {
            let out = packet::rewrite_for_forward(raw, self.ts_offset);
            self.core.send(&out);
            return;
        }

        let mut codec = TalentCodec::new();
        let mut buf = BytesMut::from(raw);
        while let Ok(Some(frame)) = codec.decode(&mut buf) {
            if !self.hold_cloud_modbus(&frame) {
                self.core.send(&frame.raw);
            }
        }
        if !buf.is_empty() {
            self.core.send(&buf);
        }
    }

    fn release_held(&mut self) {
        if let Some(frame) = self.core.release_held() {
            self.core.send(&frame);
        }
    }

    fn send_modbus(&mut self, pdu: &[u8]) {
        let frame = packet::build(
            &self.id(),
            Control::Request.into(),
            MsgId::Modbus.into(),
            &data::wrap_modbus(pdu),
        );
        self.core.send(&frame);
    }

    fn send_heartbeat(&mut self) {
        let frame = packet::build(&self.id(), Control::Request.into(), MsgId::GetTime.into(), &[]);
        self.core.send(&frame);
        if self.core.state != State::Up {
            self.core.set_state(State::Pend);
        }
    }

    fn send_data(&mut self, record: &DeviceRecord) {
        let items = TALENT_MAP
            .iter()
            .filter_map(|e| {
                let value = record.get(e.register)?;
                let v = match value.as_str() {
                    Some(s) => TalentValue::Str(s.to_owned()),
                    None => TalentValue::I32(e.scale.invert(value.as_f64()?)? as i32),
                };
                Some((e.addr, v))
            })
            .collect::<Vec<_>>();

        if items.is_empty() {
            debug!("{}: nothing cached, skipping data frame", self.core.name());
            return;
        }

        let block = DataBlock {
            data_id: 0,
            id: self.id(),
            timestamp: now_ms() + self.ts_offset,
            items,
        };
        let frame = packet::build(
            &self.id(),
            Control::Indication.into(),
            MsgId::InverterData.into(),
            &data::encode_data(&block),
        );
        self.core.send(&frame);
    }
}
