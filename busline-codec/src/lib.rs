//! Busline Codec
//!
//! Wire-level concerns kept out of the dispatcher kernel: the stateful HID
//! byte-frame codec (`hid`). The websocket transport needs no codec of its
//! own beyond `serde_json`, since `busline_core::packet::Packet` already
//! (de)serializes to the `{"type":...,"payload":...}` envelope directly.

pub mod error;
pub mod hid;

pub use error::{CodecError, Result};
pub use hid::{frame_packet, HidDecoder};
