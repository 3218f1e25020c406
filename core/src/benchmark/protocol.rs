//! Benchmark wire protocol - framed, length-prefixed messages
//!
//! Frame layout: `type:u8 | length:u32 BE | payload[length]`. Message
//! bodies use big-endian fixed-width integers; strings are a u16 BE length
//! followed by the bytes. The same codec feeds both the plain socket path
//! and the chaos path, which needs a whole frame per write so the drop
//! unit is one frame.

use super::Direction;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload. Anything larger is a protocol violation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Protocol message type bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Initiator to receiver: start benchmark.
    Start,
    /// Receiver to initiator: acknowledge start.
    Ack,
    /// Data transfer chunk.
    Data,
    /// Transfer complete with totals.
    Complete,
    /// Latency probe.
    Ping,
    /// Latency response.
    Pong,
    /// Error message.
    Error,
}

impl MessageType {
    pub fn as_byte(&self) -> u8 {
        match self {
            MessageType::Start => 0x30,
            MessageType::Ack => 0x31,
            MessageType::Data => 0x32,
            MessageType::Complete => 0x33,
            MessageType::Ping => 0x34,
            MessageType::Pong => 0x35,
            MessageType::Error => 0x3F,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x30 => Some(MessageType::Start),
            0x31 => Some(MessageType::Ack),
            0x32 => Some(MessageType::Data),
            0x33 => Some(MessageType::Complete),
            0x34 => Some(MessageType::Ping),
            0x35 => Some(MessageType::Pong),
            0x3F => Some(MessageType::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Start => "Start",
            MessageType::Ack => "Ack",
            MessageType::Data => "Data",
            MessageType::Complete => "Complete",
            MessageType::Ping => "Ping",
            MessageType::Pong => "Pong",
            MessageType::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Benchmark protocol errors. Terminal for the offending connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),
    #[error("truncated message payload")]
    Truncated,
    #[error("direction must be \"upload\" or \"download\", got {0:?}")]
    InvalidDirection(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One benchmark protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Start { size: i64, direction: Direction },
    Ack { accepted: bool, error: String },
    Data { seq: u32, data: Vec<u8> },
    Complete { bytes: i64, duration_ns: i64 },
    Ping { seq: u32, timestamp_ns: i64 },
    Pong { seq: u32, ping_timestamp_ns: i64 },
    Error { message: String },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Start { .. } => MessageType::Start,
            Message::Ack { .. } => MessageType::Ack,
            Message::Data { .. } => MessageType::Data,
            Message::Complete { .. } => MessageType::Complete,
            Message::Ping { .. } => MessageType::Ping,
            Message::Pong { .. } => MessageType::Pong,
            Message::Error { .. } => MessageType::Error,
        }
    }

    /// Encode the message body (without the type/length header).
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Message::Start { size, direction } => {
                let mut buf = Vec::with_capacity(8 + 2 + 8);
                buf.extend_from_slice(&size.to_be_bytes());
                put_string(&mut buf, direction.as_str());
                buf
            }
            Message::Ack { accepted, error } => {
                let mut buf = Vec::with_capacity(1 + 2 + error.len());
                buf.push(u8::from(*accepted));
                put_string(&mut buf, error);
                buf
            }
            Message::Data { seq, data } => {
                let mut buf = Vec::with_capacity(4 + 4 + data.len());
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Message::Complete { bytes, duration_ns } => {
                let mut buf = Vec::with_capacity(16);
                buf.extend_from_slice(&bytes.to_be_bytes());
                buf.extend_from_slice(&duration_ns.to_be_bytes());
                buf
            }
            Message::Ping { seq, timestamp_ns } => {
                let mut buf = Vec::with_capacity(12);
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(&timestamp_ns.to_be_bytes());
                buf
            }
            Message::Pong {
                seq,
                ping_timestamp_ns,
            } => {
                let mut buf = Vec::with_capacity(12);
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(&ping_timestamp_ns.to_be_bytes());
                buf
            }
            Message::Error { message } => {
                let mut buf = Vec::with_capacity(2 + message.len());
                put_string(&mut buf, message);
                buf
            }
        }
    }

    /// Decode a message body for a known type.
    pub fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = payload;
        let msg = match msg_type {
            MessageType::Start => {
                let size = take_i64(&mut buf)?;
                let direction = take_string(&mut buf)?;
                let direction = direction
                    .parse::<Direction>()
                    .map_err(|_| ProtocolError::InvalidDirection(direction))?;
                Message::Start { size, direction }
            }
            MessageType::Ack => {
                let accepted = take_u8(&mut buf)? != 0;
                let error = take_string(&mut buf)?;
                Message::Ack { accepted, error }
            }
            MessageType::Data => {
                let seq = take_u32(&mut buf)?;
                let len = take_u32(&mut buf)? as usize;
                let data = take_bytes(&mut buf, len)?.to_vec();
                Message::Data { seq, data }
            }
            MessageType::Complete => {
                let bytes = take_i64(&mut buf)?;
                let duration_ns = take_i64(&mut buf)?;
                Message::Complete { bytes, duration_ns }
            }
            MessageType::Ping => {
                let seq = take_u32(&mut buf)?;
                let timestamp_ns = take_i64(&mut buf)?;
                Message::Ping { seq, timestamp_ns }
            }
            MessageType::Pong => {
                let seq = take_u32(&mut buf)?;
                let ping_timestamp_ns = take_i64(&mut buf)?;
                Message::Pong {
                    seq,
                    ping_timestamp_ns,
                }
            }
            MessageType::Error => {
                let message = take_string(&mut buf)?;
                Message::Error { message }
            }
        };
        Ok(msg)
    }

    /// Encode a full frame: type byte, u32 BE length, payload. This is the
    /// unit handed to the chaos writer so one drop loses one whole frame.
    pub fn encode_frame(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.push(self.message_type().as_byte());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Read one framed message from the stream.
pub async fn read_message<R>(r: &mut R) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let type_byte = r.read_u8().await?;
    let msg_type =
        MessageType::from_byte(type_byte).ok_or(ProtocolError::UnknownType(type_byte))?;

    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;

    Message::decode(msg_type, &payload)
}

/// Write one framed message to the stream.
pub async fn write_message<W>(w: &mut W, msg: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = msg.encode_frame();
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

// Payload cursor helpers.

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn take_bytes<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProtocolError> {
    if buf.len() < n {
        return Err(ProtocolError::Truncated);
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, ProtocolError> {
    Ok(take_bytes(buf, 1)?[0])
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, ProtocolError> {
    let bytes = take_bytes(buf, 4)?;
    Ok(u32::from_be_bytes(bytes.try_into().expect("4 bytes")))
}

fn take_i64(buf: &mut &[u8]) -> Result<i64, ProtocolError> {
    let bytes = take_bytes(buf, 8)?;
    Ok(i64::from_be_bytes(bytes.try_into().expect("8 bytes")))
}

fn take_string(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    let len = u16::from_be_bytes(take_bytes(buf, 2)?.try_into().expect("2 bytes")) as usize;
    let bytes = take_bytes(buf, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::Truncated)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let payload = msg.encode_payload();
        Message::decode(msg.message_type(), &payload).expect("decode")
    }

    #[test]
    fn test_start_roundtrip() {
        let msg = Message::Start {
            size: 10 * 1024 * 1024,
            direction: Direction::Upload,
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_ack_roundtrip() {
        let msg = Message::Ack {
            accepted: false,
            error: "busy".to_string(),
        };
        assert_eq!(roundtrip(msg.clone()), msg);

        let msg = Message::Ack {
            accepted: true,
            error: String::new(),
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_data_roundtrip() {
        let msg = Message::Data {
            seq: 42,
            data: vec![1, 2, 3, 4, 5],
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let ping = Message::Ping {
            seq: 7,
            timestamp_ns: 123_456_789,
        };
        assert_eq!(roundtrip(ping.clone()), ping);

        let pong = Message::Pong {
            seq: 7,
            ping_timestamp_ns: 123_456_789,
        };
        assert_eq!(roundtrip(pong.clone()), pong);
    }

    #[test]
    fn test_complete_roundtrip() {
        let msg = Message::Complete {
            bytes: 1024,
            duration_ns: 5_000_000,
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_error_roundtrip() {
        let msg = Message::Error {
            message: "benchmark already in progress".to_string(),
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_decode_truncated() {
        let result = Message::decode(MessageType::Start, &[0, 0, 0]);
        assert!(matches!(result, Err(ProtocolError::Truncated)));
    }

    #[test]
    fn test_decode_invalid_direction() {
        let msg = Message::Start {
            size: 1,
            direction: Direction::Upload,
        };
        let mut payload = msg.encode_payload();
        // Rewrite the direction string to something unknown of equal length.
        let len = payload.len();
        payload[len - 6..].copy_from_slice(b"sdrawk");
        let result = Message::decode(MessageType::Start, &payload);
        assert!(matches!(result, Err(ProtocolError::InvalidDirection(_))));
    }

    #[test]
    fn test_message_type_bytes() {
        for mt in [
            MessageType::Start,
            MessageType::Ack,
            MessageType::Data,
            MessageType::Complete,
            MessageType::Ping,
            MessageType::Pong,
            MessageType::Error,
        ] {
            assert_eq!(MessageType::from_byte(mt.as_byte()), Some(mt));
        }
        assert_eq!(MessageType::from_byte(0x00), None);
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let msg = Message::Data {
            seq: 3,
            data: vec![9u8; 1000],
        };
        write_message(&mut client, &msg).await.unwrap();

        let got = read_message(&mut server).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_stream_unknown_type() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x99, 0, 0, 0, 0])
            .await
            .unwrap();

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(ProtocolError::UnknownType(0x99))));
    }

    #[tokio::test]
    async fn test_stream_oversized_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut header = vec![MessageType::Data.as_byte()];
        header.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut client, &header)
            .await
            .unwrap();

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge(_))));
    }

    #[test]
    fn test_frame_layout() {
        let msg = Message::Ping {
            seq: 1,
            timestamp_ns: 2,
        };
        let frame = msg.encode_frame();
        assert_eq!(frame[0], 0x34);
        let len = u32::from_be_bytes(frame[1..5].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 5);
    }
}
