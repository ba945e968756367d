use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const CMD_CONNECT: u8 = 1;
const CMD_DATA: u8 = 2;
const CMD_RECONNECT: u8 = 3;

const FLAG_OK: u8 = 0x01;

/// Upper bound for a single DATA payload carried in one message.
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("field too long: {0}")]
    FieldTooLong(&'static str),
}

/// Opaque identifier of one logical connection multiplexed over a transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh 128-bit random id rendered as lowercase hex.
    pub fn random() -> Self {
        let hi: u64 = rand::random();
        let lo: u64 = rand::random();
        Self(format!("{hi:016x}{lo:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Data,
    Reconnect,
    /// A command code this build does not understand. Decoded so the
    /// receiver can log and skip it; never produced locally.
    Unknown(u8),
}

impl Command {
    fn code(self) -> u8 {
        match self {
            Command::Connect => CMD_CONNECT,
            Command::Data => CMD_DATA,
            Command::Reconnect => CMD_RECONNECT,
            Command::Unknown(c) => c,
        }
    }

    fn from_code(c: u8) -> Self {
        match c {
            CMD_CONNECT => Command::Connect,
            CMD_DATA => Command::Data,
            CMD_RECONNECT => Command::Reconnect,
            other => Command::Unknown(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => f.write_str("CONNECT"),
            Command::Data => f.write_str("DATA"),
            Command::Reconnect => f.write_str("RECONNECT"),
            Command::Unknown(c) => write!(f, "UNKNOWN({c})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayData {
    pub command: Command,
    pub network: String,
    pub address: String,
    pub ok: bool,
    pub message: String,
    /// Empty on a DATA message means the sender has nothing more to send.
    pub payload: Bytes,
}

impl RelayData {
    fn empty(command: Command) -> Self {
        Self {
            command,
            network: String::new(),
            address: String::new(),
            ok: false,
            message: String::new(),
            payload: Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub session: SessionId,
    pub data: RelayData,
}

impl RelayMessage {
    pub fn connect(session: SessionId, network: &str, address: &str) -> Self {
        let mut data = RelayData::empty(Command::Connect);
        data.network = network.to_string();
        data.address = address.to_string();
        Self { session, data }
    }

    pub fn connect_ok(session: SessionId) -> Self {
        let mut data = RelayData::empty(Command::Connect);
        data.ok = true;
        Self { session, data }
    }

    pub fn connect_err(session: SessionId, message: impl Into<String>) -> Self {
        let mut data = RelayData::empty(Command::Connect);
        data.message = message.into();
        Self { session, data }
    }

    pub fn data(session: SessionId, payload: Bytes) -> Self {
        let mut data = RelayData::empty(Command::Data);
        data.payload = payload;
        Self { session, data }
    }

    pub fn half_close(session: SessionId) -> Self {
        Self::data(session, Bytes::new())
    }

    pub fn reconnect(session: SessionId) -> Self {
        let mut data = RelayData::empty(Command::Reconnect);
        data.ok = true;
        Self { session, data }
    }

    pub fn command(&self) -> Command {
        self.data.command
    }

    pub fn is_half_close(&self) -> bool {
        self.data.command == Command::Data && self.data.payload.is_empty()
    }
}

/// Serializes a message body.
///
/// Layout (big-endian): `u8 command | u8 flags | u16+session | u16+network |
/// u16+address | u16+message | u32+payload`.
pub fn encode_body(msg: &RelayMessage) -> Result<Bytes, ProtocolError> {
    let d = &msg.data;
    if d.payload.len() > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::FieldTooLong("payload"));
    }

    let mut b = BytesMut::with_capacity(
        2 + 8 + 4
            + msg.session.as_str().len()
            + d.network.len()
            + d.address.len()
            + d.message.len()
            + d.payload.len(),
    );
    b.put_u8(d.command.code());
    b.put_u8(if d.ok { FLAG_OK } else { 0 });
    put_str(&mut b, msg.session.as_str(), "session")?;
    put_str(&mut b, &d.network, "network")?;
    put_str(&mut b, &d.address, "address")?;
    put_str(&mut b, &d.message, "message")?;
    b.put_u32(d.payload.len() as u32);
    b.put_slice(&d.payload);
    Ok(b.freeze())
}

pub fn decode_body(mut buf: &[u8]) -> Result<RelayMessage, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Malformed("short header"));
    }
    let command = Command::from_code(buf.get_u8());
    let flags = buf.get_u8();

    let session = get_str(&mut buf)?;
    if session.is_empty() {
        return Err(ProtocolError::Malformed("empty session id"));
    }
    let network = get_str(&mut buf)?;
    let address = get_str(&mut buf)?;
    let message = get_str(&mut buf)?;

    if buf.remaining() < 4 {
        return Err(ProtocolError::Malformed("short payload length"));
    }
    let n = buf.get_u32() as usize;
    if n > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::FieldTooLong("payload"));
    }
    if buf.remaining() != n {
        return Err(ProtocolError::Malformed("payload length mismatch"));
    }
    let payload = Bytes::copy_from_slice(buf);

    Ok(RelayMessage {
        session: SessionId(session),
        data: RelayData {
            command,
            network,
            address,
            ok: flags & FLAG_OK != 0,
            message,
            payload,
        },
    })
}

fn put_str(b: &mut BytesMut, s: &str, field: &'static str) -> Result<(), ProtocolError> {
    let n: u16 = s
        .len()
        .try_into()
        .map_err(|_| ProtocolError::FieldTooLong(field))?;
    b.put_u16(n);
    b.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Malformed("short string length"));
    }
    let n = buf.get_u16() as usize;
    if buf.remaining() < n {
        return Err(ProtocolError::Malformed("short string"));
    }
    let s = String::from_utf8_lossy(&buf[..n]).into_owned();
    buf.advance(n);
    Ok(s)
}
