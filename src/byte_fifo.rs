use bytes::{Buf, Bytes, BytesMut};

pub type Trigger = Box<dyn FnMut() + Send>;

/// Growable byte queue used for the receive, transmit and forward buffers
/// of a connection.
///
/// An optional trigger callback can be registered; owners call
/// [`ByteFifo::trigger`] once they have queued a complete unit of data so
/// the I/O side knows there is something to flush.
#[derive(Default)]
pub struct ByteFifo {
    buf: BytesMut,
    trigger: Option<Trigger>,
}

impl ByteFifo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reg_trigger(&mut self, trigger: Trigger) {
        self.trigger = Some(trigger);
    }

    pub fn trigger(&mut self) {
        if let Some(trigger) = self.trigger.as_mut() {
            trigger();
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn peek(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Removes and returns up to `n` bytes from the front.
    pub fn get(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    pub fn get_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Direct access for codecs that consume frames in place.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl std::fmt::Debug for ByteFifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteFifo")
            .field("len", &self.buf.len())
            .field("trigger", &self.trigger.is_some())
            .finish()
    }
}

// hex dump, 16 bytes per line, used for frame logging at debug level
impl std::fmt::Display for ByteFifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        hex_dump(f, &self.buf)
    }
}

pub fn hex_dump(f: &mut impl std::fmt::Write, data: &[u8]) -> std::fmt::Result {
    for (n, chunk) in data.chunks(16).enumerate() {
        write!(f, "{:04x}:", n * 16)?;
        for b in chunk {
            write!(f, " {:02x}", b)?;
        }
        writeln!(f)?;
    }
    Ok(())
}

pub fn to_hex(data: &[u8]) -> String {
    let mut s = String::new();
    let _ = hex_dump(&mut s, data);
    s
}
