pub mod data;
pub mod packet;

pub use packet::{Control, MsgId, TalentCodec, TalentFrame};
