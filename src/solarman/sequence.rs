/// Per-connection sequence counter pair.
///
/// Each side keeps its own 8-bit counter and echoes the peer's last one. On
/// the server side our counter sits in the high byte and the echo in the low
/// byte; the client side uses the opposite layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sequence {
    server_side: bool,
    rcvd: u8,
    snd: u8,
}

impl Sequence {
    pub fn new(server_side: bool) -> Self {
        Self {
            server_side,
            ..Default::default()
        }
    }

    pub fn set_recv(&mut self, seq: u16) {
        let [lo, hi] = seq.to_le_bytes();
        self.rcvd = if self.server_side { lo } else { hi };
    }

    pub fn received(&self) -> u8 {
        self.rcvd
    }

    pub fn next_send(&mut self) -> u16 {
        self.snd = self.snd.wrapping_add(1);
        if self.server_side {
            u16::from_le_bytes([self.rcvd, self.snd])
        } else {
            u16::from_le_bytes([self.snd, self.rcvd])
        }
    }
}
