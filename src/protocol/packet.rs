//! Wire packets of the cache protocol.
//!
//! Every packet starts with the same 4-byte header so that mismatched peers
//! can still read it and reject the packet cleanly:
//!
//! ```text
//! +----------------+-----------+-----------+------------------------+
//! | magic (u16 LE) | version u8| type u8   | type-specific fields   |
//! +----------------+-----------+-----------+------------------------+
//! ```
//!
//! Keys are 32 raw bytes, totals are u64, chunk counts and indices u32,
//! booleans one byte, byte payloads u32-length-prefixed. All integers are
//! little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::cache::key::{CacheKey, KEY_SIZE};

/// Identifies a cache protocol packet.
pub const PACKET_MAGIC: u16 = 0xACAC;

/// The only protocol version this build speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 4;

/// Largest packet a transport frame may carry.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Bytes a chunk packet spends on everything except the chunk data.
pub const CHUNK_PACKET_OVERHEAD: usize = HEADER_SIZE + KEY_SIZE + 4 + 4;

/// Chunk bound used for every chunked transfer.
pub const CHUNK_SIZE: usize = MAX_PACKET_SIZE - CHUNK_PACKET_OVERHEAD;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too short for header: {0} bytes")]
    TooShort(usize),

    #[error("Bad packet magic {0:#06x}")]
    BadMagic(u16),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown packet type {0}")]
    UnknownType(u8),

    #[error("Truncated {0:?} packet")]
    Truncated(PacketType),

    #[error("{extra} trailing bytes after {packet_type:?} packet")]
    TrailingBytes { packet_type: PacketType, extra: usize },

    #[error("Invalid boolean byte {0}")]
    InvalidBool(u8),

    #[error("{0:?} packet is not valid in this direction")]
    UnexpectedDirection(PacketType),
}

/// Packet type discriminant as carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    AddAnnounce = 1,
    AddAck = 2,
    AddChunk = 3,
    GetRequest = 4,
    GetInfo = 5,
    GetChunkRequest = 6,
    GetChunk = 7,
    RemoveRequest = 8,
    RemoveAck = 9,
    ClearRequest = 10,
    ClearAck = 11,
    WarmupRequest = 12,
    StatusRequest = 13,
    StatusAck = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => PacketType::AddAnnounce,
            2 => PacketType::AddAck,
            3 => PacketType::AddChunk,
            4 => PacketType::GetRequest,
            5 => PacketType::GetInfo,
            6 => PacketType::GetChunkRequest,
            7 => PacketType::GetChunk,
            8 => PacketType::RemoveRequest,
            9 => PacketType::RemoveAck,
            10 => PacketType::ClearRequest,
            11 => PacketType::ClearAck,
            12 => PacketType::WarmupRequest,
            13 => PacketType::StatusRequest,
            14 => PacketType::StatusAck,
            other => return Err(PacketError::UnknownType(other)),
        })
    }
}

impl PacketType {
    /// Short lowercase name, used as a metrics label.
    pub fn name(&self) -> &'static str {
        match self {
            PacketType::AddAnnounce => "add_announce",
            PacketType::AddAck => "add_ack",
            PacketType::AddChunk => "add_chunk",
            PacketType::GetRequest => "get_request",
            PacketType::GetInfo => "get_info",
            PacketType::GetChunkRequest => "get_chunk_request",
            PacketType::GetChunk => "get_chunk",
            PacketType::RemoveRequest => "remove_request",
            PacketType::RemoveAck => "remove_ack",
            PacketType::ClearRequest => "clear_request",
            PacketType::ClearAck => "clear_ack",
            PacketType::WarmupRequest => "warmup_request",
            PacketType::StatusRequest => "status_request",
            PacketType::StatusAck => "status_ack",
        }
    }
}

/// The fixed header, readable regardless of version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u16,
    pub version: u8,
    pub packet_type: u8,
}

impl PacketHeader {
    /// Read the raw header without validating it.
    pub fn peek(frame: &[u8]) -> Result<Self, PacketError> {
        if frame.len() < HEADER_SIZE {
            return Err(PacketError::TooShort(frame.len()));
        }
        Ok(Self {
            magic: u16::from_le_bytes([frame[0], frame[1]]),
            version: frame[2],
            packet_type: frame[3],
        })
    }

    /// Check magic and version and resolve the packet type.
    pub fn validate(&self) -> Result<PacketType, PacketError> {
        if self.magic != PACKET_MAGIC {
            return Err(PacketError::BadMagic(self.magic));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(self.version));
        }
        PacketType::try_from(self.packet_type)
    }
}

/// Every message of the cache protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    AddAnnounce {
        key: CacheKey,
        total_bytes: u64,
        total_chunks: u32,
    },
    AddAck {
        key: CacheKey,
        accepted: bool,
    },
    AddChunk {
        key: CacheKey,
        index: u32,
        data: Bytes,
    },
    GetRequest {
        key: CacheKey,
    },
    /// `total_bytes == 0 && total_chunks == 0` signals a miss.
    GetInfo {
        key: CacheKey,
        total_bytes: u64,
        total_chunks: u32,
    },
    GetChunkRequest {
        key: CacheKey,
        index: u32,
    },
    /// Empty `data` signals an aborted transfer.
    GetChunk {
        key: CacheKey,
        index: u32,
        data: Bytes,
    },
    RemoveRequest {
        key: CacheKey,
    },
    RemoveAck {
        key: CacheKey,
        removed: bool,
    },
    ClearRequest,
    ClearAck {
        cleared: bool,
    },
    WarmupRequest {
        key: CacheKey,
    },
    StatusRequest,
    StatusAck,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::AddAnnounce { .. } => PacketType::AddAnnounce,
            Packet::AddAck { .. } => PacketType::AddAck,
            Packet::AddChunk { .. } => PacketType::AddChunk,
            Packet::GetRequest { .. } => PacketType::GetRequest,
            Packet::GetInfo { .. } => PacketType::GetInfo,
            Packet::GetChunkRequest { .. } => PacketType::GetChunkRequest,
            Packet::GetChunk { .. } => PacketType::GetChunk,
            Packet::RemoveRequest { .. } => PacketType::RemoveRequest,
            Packet::RemoveAck { .. } => PacketType::RemoveAck,
            Packet::ClearRequest => PacketType::ClearRequest,
            Packet::ClearAck { .. } => PacketType::ClearAck,
            Packet::WarmupRequest { .. } => PacketType::WarmupRequest,
            Packet::StatusRequest => PacketType::StatusRequest,
            Packet::StatusAck => PacketType::StatusAck,
        }
    }

    /// Encode into a single frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16_le(PACKET_MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.packet_type() as u8);

        match self {
            Packet::AddAnnounce {
                key,
                total_bytes,
                total_chunks,
            }
            | Packet::GetInfo {
                key,
                total_bytes,
                total_chunks,
            } => {
                buf.put_slice(key.as_bytes());
                buf.put_u64_le(*total_bytes);
                buf.put_u32_le(*total_chunks);
            }
            Packet::AddAck { key, accepted: flag } | Packet::RemoveAck { key, removed: flag } => {
                buf.put_slice(key.as_bytes());
                buf.put_u8(u8::from(*flag));
            }
            Packet::AddChunk { key, index, data } | Packet::GetChunk { key, index, data } => {
                buf.put_slice(key.as_bytes());
                buf.put_u32_le(*index);
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            Packet::GetRequest { key }
            | Packet::RemoveRequest { key }
            | Packet::WarmupRequest { key } => {
                buf.put_slice(key.as_bytes());
            }
            Packet::GetChunkRequest { key, index } => {
                buf.put_slice(key.as_bytes());
                buf.put_u32_le(*index);
            }
            Packet::ClearAck { cleared } => {
                buf.put_u8(u8::from(*cleared));
            }
            Packet::ClearRequest | Packet::StatusRequest | Packet::StatusAck => {}
        }

        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        let body = match self {
            Packet::AddAnnounce { .. } | Packet::GetInfo { .. } => KEY_SIZE + 12,
            Packet::AddAck { .. } | Packet::RemoveAck { .. } => KEY_SIZE + 1,
            Packet::AddChunk { data, .. } | Packet::GetChunk { data, .. } => {
                KEY_SIZE + 8 + data.len()
            }
            Packet::GetRequest { .. }
            | Packet::RemoveRequest { .. }
            | Packet::WarmupRequest { .. } => KEY_SIZE,
            Packet::GetChunkRequest { .. } => KEY_SIZE + 4,
            Packet::ClearAck { .. } => 1,
            Packet::ClearRequest | Packet::StatusRequest | Packet::StatusAck => 0,
        };
        HEADER_SIZE + body
    }

    /// Decode a frame. The frame must hold exactly one packet.
    pub fn decode(frame: Bytes) -> Result<Self, PacketError> {
        let packet_type = PacketHeader::peek(&frame)?.validate()?;
        let mut body = frame.slice(HEADER_SIZE..);
        let mut reader = BodyReader {
            body: &mut body,
            packet_type,
        };

        let packet = match packet_type {
            PacketType::AddAnnounce => Packet::AddAnnounce {
                key: reader.key()?,
                total_bytes: reader.u64()?,
                total_chunks: reader.u32()?,
            },
            PacketType::GetInfo => Packet::GetInfo {
                key: reader.key()?,
                total_bytes: reader.u64()?,
                total_chunks: reader.u32()?,
            },
            PacketType::AddAck => Packet::AddAck {
                key: reader.key()?,
                accepted: reader.bool()?,
            },
            PacketType::RemoveAck => Packet::RemoveAck {
                key: reader.key()?,
                removed: reader.bool()?,
            },
            PacketType::AddChunk => Packet::AddChunk {
                key: reader.key()?,
                index: reader.u32()?,
                data: reader.payload()?,
            },
            PacketType::GetChunk => Packet::GetChunk {
                key: reader.key()?,
                index: reader.u32()?,
                data: reader.payload()?,
            },
            PacketType::GetRequest => Packet::GetRequest { key: reader.key()? },
            PacketType::RemoveRequest => Packet::RemoveRequest { key: reader.key()? },
            PacketType::WarmupRequest => Packet::WarmupRequest { key: reader.key()? },
            PacketType::GetChunkRequest => Packet::GetChunkRequest {
                key: reader.key()?,
                index: reader.u32()?,
            },
            PacketType::ClearAck => Packet::ClearAck {
                cleared: reader.bool()?,
            },
            PacketType::ClearRequest => Packet::ClearRequest,
            PacketType::StatusRequest => Packet::StatusRequest,
            PacketType::StatusAck => Packet::StatusAck,
        };

        if body.has_remaining() {
            return Err(PacketError::TrailingBytes {
                packet_type,
                extra: body.remaining(),
            });
        }
        Ok(packet)
    }
}

struct BodyReader<'a> {
    body: &'a mut Bytes,
    packet_type: PacketType,
}

impl BodyReader<'_> {
    fn need(&self, len: usize) -> Result<(), PacketError> {
        if self.body.remaining() < len {
            return Err(PacketError::Truncated(self.packet_type));
        }
        Ok(())
    }

    fn key(&mut self) -> Result<CacheKey, PacketError> {
        self.need(KEY_SIZE)?;
        let raw = self.body.split_to(KEY_SIZE);
        CacheKey::from_slice(&raw).map_err(|_| PacketError::Truncated(self.packet_type))
    }

    fn u64(&mut self) -> Result<u64, PacketError> {
        self.need(8)?;
        Ok(self.body.get_u64_le())
    }

    fn u32(&mut self) -> Result<u32, PacketError> {
        self.need(4)?;
        Ok(self.body.get_u32_le())
    }

    fn bool(&mut self) -> Result<bool, PacketError> {
        self.need(1)?;
        match self.body.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PacketError::InvalidBool(other)),
        }
    }

    fn payload(&mut self) -> Result<Bytes, PacketError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.body.split_to(len))
    }
}

/// Packets a client sends to a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest {
    AddAnnounce {
        key: CacheKey,
        total_bytes: u64,
        total_chunks: u32,
    },
    AddChunk {
        key: CacheKey,
        index: u32,
        data: Bytes,
    },
    Get {
        key: CacheKey,
    },
    GetChunk {
        key: CacheKey,
        index: u32,
    },
    Remove {
        key: CacheKey,
    },
    Clear,
    Warmup {
        key: CacheKey,
    },
    Status,
}

impl ServerRequest {
    pub fn packet_type(&self) -> PacketType {
        match self {
            ServerRequest::AddAnnounce { .. } => PacketType::AddAnnounce,
            ServerRequest::AddChunk { .. } => PacketType::AddChunk,
            ServerRequest::Get { .. } => PacketType::GetRequest,
            ServerRequest::GetChunk { .. } => PacketType::GetChunkRequest,
            ServerRequest::Remove { .. } => PacketType::RemoveRequest,
            ServerRequest::Clear => PacketType::ClearRequest,
            ServerRequest::Warmup { .. } => PacketType::WarmupRequest,
            ServerRequest::Status => PacketType::StatusRequest,
        }
    }
}

impl TryFrom<Packet> for ServerRequest {
    type Error = PacketError;

    fn try_from(packet: Packet) -> Result<Self, Self::Error> {
        Ok(match packet {
            Packet::AddAnnounce {
                key,
                total_bytes,
                total_chunks,
            } => ServerRequest::AddAnnounce {
                key,
                total_bytes,
                total_chunks,
            },
            Packet::AddChunk { key, index, data } => ServerRequest::AddChunk { key, index, data },
            Packet::GetRequest { key } => ServerRequest::Get { key },
            Packet::GetChunkRequest { key, index } => ServerRequest::GetChunk { key, index },
            Packet::RemoveRequest { key } => ServerRequest::Remove { key },
            Packet::ClearRequest => ServerRequest::Clear,
            Packet::WarmupRequest { key } => ServerRequest::Warmup { key },
            Packet::StatusRequest => ServerRequest::Status,
            other => return Err(PacketError::UnexpectedDirection(other.packet_type())),
        })
    }
}

impl From<ServerRequest> for Packet {
    fn from(request: ServerRequest) -> Self {
        match request {
            ServerRequest::AddAnnounce {
                key,
                total_bytes,
                total_chunks,
            } => Packet::AddAnnounce {
                key,
                total_bytes,
                total_chunks,
            },
            ServerRequest::AddChunk { key, index, data } => Packet::AddChunk { key, index, data },
            ServerRequest::Get { key } => Packet::GetRequest { key },
            ServerRequest::GetChunk { key, index } => Packet::GetChunkRequest { key, index },
            ServerRequest::Remove { key } => Packet::RemoveRequest { key },
            ServerRequest::Clear => Packet::ClearRequest,
            ServerRequest::Warmup { key } => Packet::WarmupRequest { key },
            ServerRequest::Status => Packet::StatusRequest,
        }
    }
}

/// Packets a server sends back to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientResponse {
    AddAck {
        key: CacheKey,
        accepted: bool,
    },
    GetInfo {
        key: CacheKey,
        total_bytes: u64,
        total_chunks: u32,
    },
    GetChunk {
        key: CacheKey,
        index: u32,
        data: Bytes,
    },
    RemoveAck {
        key: CacheKey,
        removed: bool,
    },
    ClearAck {
        cleared: bool,
    },
    StatusAck,
}

impl TryFrom<Packet> for ClientResponse {
    type Error = PacketError;

    fn try_from(packet: Packet) -> Result<Self, Self::Error> {
        Ok(match packet {
            Packet::AddAck { key, accepted } => ClientResponse::AddAck { key, accepted },
            Packet::GetInfo {
                key,
                total_bytes,
                total_chunks,
            } => ClientResponse::GetInfo {
                key,
                total_bytes,
                total_chunks,
            },
            Packet::GetChunk { key, index, data } => ClientResponse::GetChunk { key, index, data },
            Packet::RemoveAck { key, removed } => ClientResponse::RemoveAck { key, removed },
            Packet::ClearAck { cleared } => ClientResponse::ClearAck { cleared },
            Packet::StatusAck => ClientResponse::StatusAck,
            other => return Err(PacketError::UnexpectedDirection(other.packet_type())),
        })
    }
}

impl From<ClientResponse> for Packet {
    fn from(response: ClientResponse) -> Self {
        match response {
            ClientResponse::AddAck { key, accepted } => Packet::AddAck { key, accepted },
            ClientResponse::GetInfo {
                key,
                total_bytes,
                total_chunks,
            } => Packet::GetInfo {
                key,
                total_bytes,
                total_chunks,
            },
            ClientResponse::GetChunk { key, index, data } => Packet::GetChunk { key, index, data },
            ClientResponse::RemoveAck { key, removed } => Packet::RemoveAck { key, removed },
            ClientResponse::ClearAck { cleared } => Packet::ClearAck { cleared },
            ClientResponse::StatusAck => Packet::StatusAck,
        }
    }
}
