//! Wire-level types and the packet codec for the ADC protocol.
//!
//! ADC frames are newline-terminated text lines beginning with a one-byte
//! kind indicator and a three-letter command name. This crate knows nothing
//! about the hub; it only translates between bytes and typed packets.

mod errors;
pub use errors::ProtocolError;

mod types;
pub use types::{Cid, CmdName, Feature, Sid, CID_LEN, SID_LEN};

mod escape;
pub use escape::{escape, unescape};

mod fields;
pub use fields::{field_value, fields};

mod packet;
pub use packet::{
    BroadcastPacket, ClientPacket, DirectPacket, EchoPacket, FeaturePacket, HubPacket, InfoPacket,
    Packet, UdpPacket, LINE_DELIM,
};
