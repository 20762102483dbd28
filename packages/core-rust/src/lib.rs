//! Correlator Core — messages, header maps, values, clock, and `MsgPack` codec.

pub mod clock;
pub mod codec;
pub mod message;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use codec::CodecError;
pub use message::{headers, Message, MessageBuilder, MessageHeaders};
pub use types::{CorrelationKey, Value};
