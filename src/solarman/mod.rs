pub mod packet;
pub mod sequence;

pub use packet::{ControlCode, SolarmanCodec, SolarmanFrame};
pub use sequence::Sequence;
