use crate::net::support::{FaultKind, NetError, NetResult};
use crate::net::MAX_RELIABLE_MESSAGE_SIZE;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Framing overhead of one reliable message: header word + unique index.
pub const RELIABLE_OVERHEAD: usize = 8;

/// Largest payload one reliable message may carry.
pub const MAX_MESSAGE_PAYLOAD: usize = MAX_RELIABLE_MESSAGE_SIZE - 16;

pub const USERNAME_MAX: usize = 32;
pub const PASSWORD_HASH_MAX: usize = 32;

/// Core reliable-message opcodes. Values 64 and up are application-defined.
pub mod opcode {
    pub const CONNECT_ATTEMPT: u32 = 1;
    pub const CONNECT_ACK: u32 = 2;
    pub const DISCONNECT: u32 = 3;
    pub const CLIENT_CONNECTED: u32 = 4;
    pub const CLIENT_DISCONNECTED: u32 = 5;
    pub const SUBMIT_CHAT: u32 = 6;
    pub const RECEIVE_CHAT: u32 = 7;
    pub const FIRST_APPLICATION: u32 = 64;
}

/// A queued message. Reliable messages acquire their `unique_index` and
/// `sequence_index` when promoted into the per-sequence queue; unreliable
/// messages never do.
#[derive(Debug, Clone)]
pub struct ReliableMessage {
    pub sequence_index: u32,
    pub unique_index: u32,
    pub opcode: u32,
    pub payload: Vec<u8>,
}

impl ReliableMessage {
    #[inline]
    pub fn new(opcode: u32) -> ReliableMessage {
        ReliableMessage {
            sequence_index: 0,
            unique_index: 0,
            opcode,
            payload: Vec::new(),
        }
    }

    #[inline]
    pub fn with_payload(opcode: u32, payload: Vec<u8>) -> ReliableMessage {
        debug_assert!(payload.len() <= MAX_MESSAGE_PAYLOAD);
        ReliableMessage {
            sequence_index: 0,
            unique_index: 0,
            opcode,
            payload,
        }
    }

    /// Wire size including framing overhead (before 4-byte rounding).
    #[inline]
    pub fn size_bytes(&self) -> usize {
        RELIABLE_OVERHEAD + self.payload.len()
    }
}

// --- payload helpers -------------------------------------------------------

fn write_utf16_fixed(out: &mut Vec<u8>, text: &str, units: usize) {
    let mut written = 0;
    for unit in text.encode_utf16().take(units - 1) {
        out.write_u16::<LittleEndian>(unit).expect("vec write");
        written += 1;
    }
    while written < units {
        out.write_u16::<LittleEndian>(0).expect("vec write");
        written += 1;
    }
}

fn read_utf16_fixed(stream: &mut &[u8], units: usize) -> NetResult<String> {
    let mut buffer = Vec::with_capacity(units);
    for _ in 0..units {
        buffer.push(stream.read_u16::<LittleEndian>()?);
    }
    let end = buffer.iter().position(|&u| u == 0).unwrap_or_else(|| buffer.len());
    String::from_utf16(&buffer[..end]).map_err(|_| NetError::Fatal(FaultKind::Malformed))
}

fn read_cstr(stream: &[u8]) -> NetResult<String> {
    let end = stream.iter().position(|&c| c == 0).unwrap_or_else(|| stream.len());
    String::from_utf8(stream[..end].to_vec()).map_err(|_| NetError::Fatal(FaultKind::Malformed))
}

/// Longest chat text that still fits a reliable message next to its
/// 2-byte routing field and terminator.
const CHAT_TEXT_MAX: usize = MAX_MESSAGE_PAYLOAD - 3;

fn clamp_text(text: &str) -> &str {
    if text.len() <= CHAT_TEXT_MAX {
        return text;
    }
    let mut end = CHAT_TEXT_MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Opcode 1. First message of the handshake, resent up to five times.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectAttempt {
    pub protocol_version: u16,
    pub nonce: u16,
    pub user_name: String,
    pub hashed_password: String,
    pub client_ticks: i64,
    pub client_tick_freq: i64,
}

impl ConnectAttempt {
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(148);
        out.write_u16::<LittleEndian>(self.protocol_version).expect("vec write");
        out.write_u16::<LittleEndian>(self.nonce).expect("vec write");
        write_utf16_fixed(&mut out, &self.user_name, USERNAME_MAX);
        write_utf16_fixed(&mut out, &self.hashed_password, PASSWORD_HASH_MAX);
        out.write_i64::<LittleEndian>(self.client_ticks).expect("vec write");
        out.write_i64::<LittleEndian>(self.client_tick_freq).expect("vec write");
        out
    }

    pub fn read(mut stream: &[u8]) -> NetResult<ConnectAttempt> {
        let protocol_version = stream.read_u16::<LittleEndian>()?;
        let nonce = stream.read_u16::<LittleEndian>()?;
        let user_name = read_utf16_fixed(&mut stream, USERNAME_MAX)?;
        let hashed_password = read_utf16_fixed(&mut stream, PASSWORD_HASH_MAX)?;
        let client_ticks = stream.read_i64::<LittleEndian>()?;
        let client_tick_freq = stream.read_i64::<LittleEndian>()?;

        Ok(ConnectAttempt {
            protocol_version,
            nonce,
            user_name,
            hashed_password,
            client_ticks,
            client_tick_freq,
        })
    }
}

/// Opcode 2. Server verdict on a connect attempt, carrying the clock basis
/// for server-time estimation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectAck {
    pub success: u32,
    pub nonce: u16,
    pub server_ticks: i64,
    pub server_tick_freq: i64,
    /// Echo of the attempt's `client_ticks`, for round-trip halving.
    pub client_ticks: i64,
}

impl ConnectAck {
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(30);
        out.write_u32::<LittleEndian>(self.success).expect("vec write");
        out.write_u16::<LittleEndian>(self.nonce).expect("vec write");
        out.write_i64::<LittleEndian>(self.server_ticks).expect("vec write");
        out.write_i64::<LittleEndian>(self.server_tick_freq).expect("vec write");
        out.write_i64::<LittleEndian>(self.client_ticks).expect("vec write");
        out
    }

    pub fn read(mut stream: &[u8]) -> NetResult<ConnectAck> {
        Ok(ConnectAck {
            success: stream.read_u32::<LittleEndian>()?,
            nonce: stream.read_u16::<LittleEndian>()?,
            server_ticks: stream.read_i64::<LittleEndian>()?,
            server_tick_freq: stream.read_i64::<LittleEndian>()?,
            client_ticks: stream.read_i64::<LittleEndian>()?,
        })
    }
}

/// Opcodes 4/5. Roster updates broadcast to every connected client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConnected {
    pub nonce: u16,
    pub user_name: String,
}

impl ClientConnected {
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + USERNAME_MAX * 2);
        out.write_u16::<LittleEndian>(self.nonce).expect("vec write");
        write_utf16_fixed(&mut out, &self.user_name, USERNAME_MAX);
        out
    }

    pub fn read(mut stream: &[u8]) -> NetResult<ClientConnected> {
        let nonce = stream.read_u16::<LittleEndian>()?;
        let user_name = read_utf16_fixed(&mut stream, USERNAME_MAX)?;
        Ok(ClientConnected { nonce, user_name })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientDisconnected {
    pub nonce: u16,
}

impl ClientDisconnected {
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2);
        out.write_u16::<LittleEndian>(self.nonce).expect("vec write");
        out
    }

    pub fn read(mut stream: &[u8]) -> NetResult<ClientDisconnected> {
        Ok(ClientDisconnected {
            nonce: stream.read_u16::<LittleEndian>()?,
        })
    }
}

/// Opcode 6. Chat line from a client; destination 0 broadcasts.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitChat {
    pub destination: u16,
    pub text: String,
}

impl SubmitChat {
    pub fn write(&self) -> Vec<u8> {
        let text = clamp_text(&self.text);
        let mut out = Vec::with_capacity(3 + text.len());
        out.write_u16::<LittleEndian>(self.destination).expect("vec write");
        out.extend_from_slice(text.as_bytes());
        out.push(0);
        out
    }

    pub fn read(mut stream: &[u8]) -> NetResult<SubmitChat> {
        let destination = stream.read_u16::<LittleEndian>()?;
        let text = read_cstr(stream)?;
        Ok(SubmitChat { destination, text })
    }
}

/// Opcode 7. Chat line relayed by the server; source 0 is the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveChat {
    pub source: u16,
    pub text: String,
}

impl ReceiveChat {
    pub fn write(&self) -> Vec<u8> {
        let text = clamp_text(&self.text);
        let mut out = Vec::with_capacity(3 + text.len());
        out.write_u16::<LittleEndian>(self.source).expect("vec write");
        out.extend_from_slice(text.as_bytes());
        out.push(0);
        out
    }

    pub fn read(mut stream: &[u8]) -> NetResult<ReceiveChat> {
        let source = stream.read_u16::<LittleEndian>()?;
        let text = read_cstr(stream)?;
        Ok(ReceiveChat { source, text })
    }
}
