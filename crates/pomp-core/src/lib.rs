pub mod addr;
pub mod buffer;
pub mod codec;
pub mod error;
pub mod message;
pub mod protocol;
pub mod varint;
pub mod wire;

pub use addr::Addr;
pub use buffer::Buffer;
pub use codec::{Decoder, Encoder};
pub use error::{PompError, Result};
pub use message::Message;
pub use protocol::Framer;
