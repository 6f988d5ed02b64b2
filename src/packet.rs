use std::borrow::Cow;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::RconError;

/// Id echoed by the server in place of the request id when a login fails.
pub const AUTH_FAILURE_ID: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    // SERVERDATA_AUTH
    Login,
    // SERVERDATA_EXECCOMMAND (also SERVERDATA_AUTH_RESPONSE)
    Command,
    // SERVERDATA_RESPONSE_VALUE
    Response,
    /// Any other value. Sent as-is, never produced by us.
    Other(i32),
}

impl PacketType {
    /// Servers answer a login with type 2, the same value used for commands.
    pub const AUTH_RESPONSE: PacketType = PacketType::Command;

    pub fn value(&self) -> i32 {
        match self {
            PacketType::Login => 3,
            PacketType::Command => 2,
            PacketType::Response => 0,
            PacketType::Other(value) => *value,
        }
    }

    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.value().to_le_bytes()
    }
}

impl From<i32> for PacketType {
    fn from(value: i32) -> Self {
        match value {
            3 => PacketType::Login,
            2 => PacketType::Command,
            0 => PacketType::Response,
            other => PacketType::Other(other),
        }
    }
}

/// A single frame on the wire: size, id, type, body and two null bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    id: i32,
    packet_type: PacketType,
    body: Vec<u8>,
}

impl Packet {
    /// Bytes counted by the size field for an empty body (id, type, padding).
    pub const BASE_PACKET_SIZE: i32 = 10;
    /// Size field, id and type.
    pub const HEADER_LEN: usize = 12;

    pub fn new(id: i32, packet_type: PacketType, body: impl Into<Vec<u8>>) -> Self {
        Packet {
            id,
            packet_type,
            body: body.into(),
        }
    }

    // Since the only one of these values that can change in length is the body,
    // an easy way to calculate the size of a packet is to find the byte-length
    // of the packet body, then add 10 to it.
    pub fn size(&self) -> i32 {
        self.body.len() as i32 + Self::BASE_PACKET_SIZE
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn pack(&self) -> Vec<u8> {
        // Size, ID, Type, Body, Terminator
        let mut payload = Vec::<u8>::with_capacity(4 + self.size() as usize);
        payload.extend_from_slice(&self.size().to_le_bytes());
        payload.extend_from_slice(&self.id().to_le_bytes());
        payload.extend_from_slice(&self.packet_type().to_le_bytes());
        payload.extend_from_slice(self.body());
        // null terminate the body, then null terminate the entire packet
        payload.extend_from_slice(&[0u8, 0u8]);
        payload
    }

    /// Read one whole packet from `stream`.
    pub async fn read_from<R>(stream: &mut R) -> Result<Packet, RconError>
    where
        R: AsyncRead + Unpin,
    {
        let header = Header::read_from(stream).await?;
        let body = read_body(stream, header.size).await?;
        Ok(Packet::new(header.id, header.packet_type, body))
    }
}

/// The fixed twelve bytes in front of every body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub size: i32,
    pub id: i32,
    pub packet_type: PacketType,
}

impl Header {
    pub async fn read_from<R>(stream: &mut R) -> Result<Header, RconError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; Packet::HEADER_LEN];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(RconError::FramingError)?;

        Ok(Header {
            size: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            id: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            packet_type: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]).into(),
        })
    }

    /// Number of body bytes announced by `size`. Sizes at or below the base
    /// size carry no body.
    pub fn body_len(size: i32) -> usize {
        if size > Packet::BASE_PACKET_SIZE {
            (size - Packet::BASE_PACKET_SIZE) as usize
        } else {
            0
        }
    }
}

/// Read the body announced by `size` and the two trailing padding bytes.
pub async fn read_body<R>(stream: &mut R, size: i32) -> Result<Vec<u8>, RconError>
where
    R: AsyncRead + Unpin,
{
    let expected = Header::body_len(size);
    // grown as bytes arrive, a bogus size can't make us allocate up front
    let mut body = Vec::new();
    (&mut *stream)
        .take(expected as u64)
        .read_to_end(&mut body)
        .await
        .map_err(RconError::FramingError)?;

    if body.len() != expected {
        return Err(RconError::FramingError(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {} body bytes, got {}", expected, body.len()),
        )));
    }

    let mut padding = [0u8; 2];
    stream
        .read_exact(&mut padding)
        .await
        .map_err(RconError::FramingError)?;

    Ok(body)
}

/// Length in bytes of the first packet in `buf`, if all of it is there.
pub fn complete_packet_len(buf: &[u8]) -> Option<usize> {
    let size_bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    let size = i32::from_le_bytes(size_bytes).max(Packet::BASE_PACKET_SIZE);
    let total = 4 + size as usize;
    (buf.len() >= total).then_some(total)
}
