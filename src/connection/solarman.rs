use crate::infos::register_map::{SOLARMAN_DATA_LEN, SOLARMAN_MAP, SOLARMAN_SENSOR_LIST};
use crate::prelude::*;
use crate::solarman::packet::{self, ControlCode, SolarmanCodec, SolarmanFrame};
use crate::solarman::Sequence;

use super::{ConnectionCore, Protocol};

use bytes::BytesMut;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::codec::Decoder;

pub struct SolarmanConnection {
    core: ConnectionCore,
    codec: SolarmanCodec,
    seq: Sequence,
    serial: u32,
}

impl SolarmanConnection {
    pub fn new(role: Role, ctx: Context, events: &UnboundedSender<SessionEvent>) -> Self {
        Self {
            core: ConnectionCore::new(Family::Solarman, role, ctx, events),
            codec: SolarmanCodec::new(),
            seq: Sequence::new(role == Role::Server),
            serial: 0,
        }
    }

    /// Logger serial used in frames we originate.
    pub fn set_serial(&mut self, serial: &str) {
        self.core.unique_id = Some(serial.to_owned());
        match serial.parse() {
            Ok(sn) => self.serial = sn,
            Err(_) => warn!("solarman: '{}' is not a numeric logger serial", serial),
        }
    }

    pub fn sequence(&self) -> &Sequence {
        &self.seq
    }

    fn send_frame(&mut self, ctrl: u16, payload: &[u8]) {
        if payload.len() > packet::MAX_PAYLOAD {
            warn!(
                "{}: {} byte payload does not fit a frame, not sent",
                self.core.name(),
                payload.len()
            );
            return;
        }
        let frame = packet::build(ctrl, self.seq.next_send(), self.serial, payload);
        self.core.send(&frame);
    }

    fn ack(&mut self, frame: &SolarmanFrame) {
        let unix = chrono::Utc::now().timestamp() as u32;
        let payload = packet::ack_payload(frame.frame_type(), unix);
        self.send_frame(ControlCode::response_to(frame.ctrl), &payload);
    }

    fn dispatch(&mut self, frame: SolarmanFrame) -> Result<()> {
        self.seq.set_recv(frame.seq);
        if !self.core.check_serial(&frame.serial.to_string()) {
            return Ok(());
        }
        self.serial = frame.serial;
        trace!(
            "{}: ctrl 0x{:04x} seq 0x{:04x} len {}",
            self.core.name(),
            frame.ctrl,
            frame.seq,
            frame.payload_len()
        );

        match self.core.role {
            Role::Server => self.device_frame(&frame),
            Role::Client => self.cloud_frame(&frame),
        }
    }

    // {{{ device leg
    fn device_frame(&mut self, frame: &SolarmanFrame) -> Result<()> {
        use ControlCode::*;

        let Some(code) = frame.code() else {
            self.core
                .stats()
                .count(Counter::UnknownCtrl, format!("solarman ctrl 0x{:04x}", frame.ctrl));
            self.core.forward(&frame.raw);
            return Ok(());
        };

        match code {
            DeviceInd => {
                self.ack(frame);
                self.up_unless_syncing();
            }
            Data => {
                self.ack(frame);
                self.device_data(frame);
                self.up_unless_syncing();
            }
            SyncStart => {
                self.ack(frame);
                self.core.set_state(State::Pend);
            }
            SyncEnd => {
                self.ack(frame);
                self.core.set_state(State::Up);
            }
            Heartbeat => self.ack(frame),
            CommandRsp => {
                let pdu = packet::command_response_pdu(frame.payload()).map(|(_, pdu)| pdu);
                match pdu {
                    Ok(pdu) if self.core.tunnel.is_cloud_resp(pdu) => {
                        if let Some(next) = self.core.on_cloud_resp() {
                            self.send_modbus(&next);
                        }
                        self.release_held();
                    }
                    _ if !self.core.tunnel.has_pending() => {}
                    // our own poll, the cloud never asked for it
                    Ok(pdu) => {
                        let pdu = pdu.to_vec();
                        if let Some(next) = self.core.on_modbus_resp(&pdu) {
                            self.send_modbus(&next);
                        }
                        self.release_held();
                        return Ok(());
                    }
                    Err(e) => {
                        self.core.frame_error(&e);
                        return Ok(());
                    }
                }
            }
            _ => {}
        }

        self.core.forward(&frame.raw);
        Ok(())
    }

    /// Cloud commands share the device link with our own. Returns true when
    /// the frame was held back.
    fn hold_cloud_modbus(&mut self, frame: &SolarmanFrame) -> bool {
        if frame.code() != Some(ControlCode::Command) {
            return false;
        }
        match packet::command_pdu(frame.payload()) {
            Ok((_, pdu)) => !self.core.cloud_modbus(pdu, &frame.raw),
            Err(_) => false,
        }
    }

    fn transmit(&mut self, raw: &[u8]) {
        let out = packet::rewrite_for_forward(raw, &mut self.seq);
        self.core.send(&out);
    }

    fn up_unless_syncing(&mut self) {
        if self.core.state != State::Pend {
            self.core.set_state(State::Up);
        }
    }

    fn device_data(&mut self, frame: &SolarmanFrame) {
        let payload = frame.payload();
        let header = match packet::data_header(payload) {
            Ok(h) => h,
            Err(e) => return self.core.frame_error(&e),
        };

        let expected = self
            .core
            .device
            .as_ref()
            .and_then(|d| d.sensor_list())
            .unwrap_or(SOLARMAN_SENSOR_LIST);
        if header.sensor_list != expected {
            debug!(
                "{}: unsupported sensor list 0x{:04x}",
                self.core.name(),
                header.sensor_list
            );
            self.core.stats().count(
                Counter::UnknownMsg,
                format!("solarman sensor list 0x{:04x}", header.sensor_list),
            );
            return;
        }
        if payload.len() < SOLARMAN_DATA_LEN {
            debug!("{}: short data payload ({} bytes), decoding what is there", self.core.name(), payload.len());
        }

        let n = self.core.db.apply_offsets(SOLARMAN_MAP, payload);
        debug!("{}: real-time data, {} values changed", self.core.name(), n);
    }
    // }}}

    // {{{ cloud leg
    fn cloud_frame(&mut self, frame: &SolarmanFrame) -> Result<()> {
        if ControlCode::is_response(frame.ctrl) {
            // acks for frames the device already had answered locally
            if self.core.state == State::Pend {
                self.core.set_state(State::Up);
            }
            return Ok(());
        }

        if frame.code() == Some(ControlCode::Command) {
            match packet::command_pdu(frame.payload()) {
                Ok((_, pdu)) => {
                    if let Err(e) = self.core.tunnel.recv_req(pdu) {
                        warn!("{}: cloud modbus request: {}", self.core.name(), e);
                        self.core.stats().count(e.counter(), e.to_string());
                    }
                }
                Err(e) => self.core.frame_error(&e),
            }
        }

        self.core.forward(&frame.raw);
        Ok(())
    }
    // }}}
}

impl Protocol for SolarmanConnection {
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
            return self.transmit(raw);
        }

        let mut codec = SolarmanCodec::new();
        let mut buf = BytesMut::from(raw);
        while let Ok(Some(frame)) = codec.decode(&mut buf) {
            if !self.hold_cloud_modbus(&frame) {
                self.transmit(&frame.raw);
            }
        }
        if !buf.is_empty() {
            self.transmit(&buf);
        }
    }

    fn release_held(&mut self) {
        if let Some(frame) = self.core.release_held() {
            self.transmit(&frame);
        }
    }

    fn send_modbus(&mut self, pdu: &[u8]) {
        self.send_frame(ControlCode::Command.into(), &packet::command_payload(pdu));
    }

    fn send_heartbeat(&mut self) {
        self.send_frame(ControlCode::Heartbeat.into(), &[0x00]);
        if self.core.state != State::Up {
            self.core.set_state(State::Pend);
        }
    }

    fn send_data(&mut self, record: &DeviceRecord) {
        let mut payload = vec![0u8; SOLARMAN_DATA_LEN];
        payload[0] = 0x01;
        payload[1..3].copy_from_slice(&SOLARMAN_SENSOR_LIST.to_le_bytes());

        let mut n = 0;
        for e in SOLARMAN_MAP {
            let raw = record.get_f64(e.register).and_then(|v| e.scale.invert(v));
            if let Some(raw) = raw {
                e.kind.write(&mut payload, e.offset, raw);
                n += 1;
            }
        }
        if n == 0 {
            debug!("{}: nothing cached, skipping data frame", self.core.name());
            return;
        }

        self.send_frame(ControlCode::Data.into(), &payload);
    }
}
