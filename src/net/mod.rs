//! Connection plumbing shared by the client and server proxies.
//!
//! - [`channel`]: ChannelId, ChannelHandle and transport events
//! - [`tcp`]: Length-prefixed TCP transport

pub mod channel;
pub mod tcp;
