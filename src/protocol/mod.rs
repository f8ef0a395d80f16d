//! Cache wire protocol.
//!
//! - [`packet`]: Packet header, message types, encode/decode
//! - [`chunk`]: Splitting serialized values into bounded chunks

pub mod chunk;
pub mod packet;
