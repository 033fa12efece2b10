use thiserror::Error;

/// Creates an anyhow error with the current file and line number
#[macro_export]
macro_rules! file_error {
    ($($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}",
            std::path::Path::new(file!())
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("?"),
            line!(),
            format!($($arg)*)
        )
    };
}

/// Creates an anyhow error with the current file and line number, and includes a source error
#[macro_export]
macro_rules! file_error_with_source {
    ($source:expr, $($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}: {}",
            std::path::Path::new(file!())
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("?"),
            line!(),
            format!($($arg)*),
            $source
        )
    };
}

/// Framing and payload errors raised while decoding either wire format.
///
/// All of these are recovered inside the dispatch loop: the offending frame
/// (or the whole receive buffer, for a lost start byte) is discarded and the
/// connection stays open.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("bad start byte 0x{0:02x}, receive buffer discarded")]
    BadStartByte(u8),

    #[error("bad stop byte 0x{0:02x}")]
    BadStopByte(u8),

    #[error("checksum mismatch: calculated 0x{calculated:02x}, frame has 0x{found:02x}")]
    BadChecksum { calculated: u8, found: u8 },

    #[error("declared frame length {0} out of range")]
    BadLength(usize),

    #[error("unsupported data type tag 0x{0:02x}")]
    InvalidDataType(u8),

    #[error("payload truncated: {0}")]
    Truncated(&'static str),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Payload-level errors count separately from framing errors.
    pub fn is_data_type(&self) -> bool {
        matches!(self, FrameError::InvalidDataType(_))
    }
}
