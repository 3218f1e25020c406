//! Relay frame codec - the binary websocket frames between peer and hub
//!
//! Client to server: `0x01 | target_len:u8 | target | payload` (send),
//! `0x03 | stats json` (heartbeat), `0x04` (close).
//! Server to client: `0x02 | src_len:u8 | src | payload` (deliver),
//! `0x05 | error_len:u16 | error` (error).

use crate::proto::PeerStats;
use thiserror::Error;

pub const MSG_SEND_PACKET: u8 = 0x01;
pub const MSG_RECV_PACKET: u8 = 0x02;
pub const MSG_HEARTBEAT: u8 = 0x03;
pub const MSG_CLOSE: u8 = 0x04;
pub const MSG_ERROR: u8 = 0x05;

/// Relay frame decode error types.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame type: {0:#04x}")]
    UnknownType(u8),
    #[error("truncated frame")]
    Truncated,
    #[error("peer name too long: {0} bytes")]
    NameTooLong(usize),
    #[error("invalid utf-8 in frame")]
    InvalidUtf8,
    #[error("invalid heartbeat stats: {0}")]
    InvalidStats(String),
}

/// One relay frame, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// Peer to hub: deliver `payload` to the named peer.
    SendPacket { target: String, payload: Vec<u8> },
    /// Hub to peer: `payload` arrived from the named peer.
    RecvPacket { source: String, payload: Vec<u8> },
    /// Peer to hub: keepalive with traffic counters.
    Heartbeat { stats: PeerStats },
    /// Peer to hub: graceful session end.
    Close,
    /// Hub to peer: session-level error.
    Error { message: String },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            RelayFrame::SendPacket { target, payload } => {
                encode_named(MSG_SEND_PACKET, target, payload)
            }
            RelayFrame::RecvPacket { source, payload } => {
                encode_named(MSG_RECV_PACKET, source, payload)
            }
            RelayFrame::Heartbeat { stats } => {
                let body = serde_json::to_vec(stats)
                    .map_err(|e| FrameError::InvalidStats(e.to_string()))?;
                let mut buf = Vec::with_capacity(1 + body.len());
                buf.push(MSG_HEARTBEAT);
                buf.extend_from_slice(&body);
                Ok(buf)
            }
            RelayFrame::Close => Ok(vec![MSG_CLOSE]),
            RelayFrame::Error { message } => {
                let bytes = message.as_bytes();
                let mut buf = Vec::with_capacity(3 + bytes.len());
                buf.push(MSG_ERROR);
                buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                buf.extend_from_slice(bytes);
                Ok(buf)
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let (&frame_type, rest) = data.split_first().ok_or(FrameError::Empty)?;
        match frame_type {
            MSG_SEND_PACKET => {
                let (name, payload) = decode_named(rest)?;
                Ok(RelayFrame::SendPacket {
                    target: name,
                    payload,
                })
            }
            MSG_RECV_PACKET => {
                let (name, payload) = decode_named(rest)?;
                Ok(RelayFrame::RecvPacket {
                    source: name,
                    payload,
                })
            }
            MSG_HEARTBEAT => {
                let stats = serde_json::from_slice(rest)
                    .map_err(|e| FrameError::InvalidStats(e.to_string()))?;
                Ok(RelayFrame::Heartbeat { stats })
            }
            MSG_CLOSE => Ok(RelayFrame::Close),
            MSG_ERROR => {
                if rest.len() < 2 {
                    return Err(FrameError::Truncated);
                }
                let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                let body = rest.get(2..2 + len).ok_or(FrameError::Truncated)?;
                let message =
                    String::from_utf8(body.to_vec()).map_err(|_| FrameError::InvalidUtf8)?;
                Ok(RelayFrame::Error { message })
            }
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

fn encode_named(frame_type: u8, name: &str, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let name_bytes = name.as_bytes();
    if name_bytes.len() > u8::MAX as usize {
        return Err(FrameError::NameTooLong(name_bytes.len()));
    }

    let mut buf = Vec::with_capacity(2 + name_bytes.len() + payload.len());
    buf.push(frame_type);
    buf.push(name_bytes.len() as u8);
    buf.extend_from_slice(name_bytes);
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn decode_named(rest: &[u8]) -> Result<(String, Vec<u8>), FrameError> {
    let (&name_len, rest) = rest.split_first().ok_or(FrameError::Truncated)?;
    let name_len = name_len as usize;
    if rest.len() < name_len {
        return Err(FrameError::Truncated);
    }
    let (name, payload) = rest.split_at(name_len);
    let name = String::from_utf8(name.to_vec()).map_err(|_| FrameError::InvalidUtf8)?;
    Ok((name, payload.to_vec()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_packet_roundtrip() {
        let frame = RelayFrame::SendPacket {
            target: "peer2".to_string(),
            payload: vec![1, 2, 3],
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes[0], MSG_SEND_PACKET);
        assert_eq!(bytes[1] as usize, 5);
        assert_eq!(RelayFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_recv_packet_roundtrip() {
        let frame = RelayFrame::RecvPacket {
            source: "peer1".to_string(),
            payload: b"hello".to_vec(),
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(RelayFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let frame = RelayFrame::Heartbeat {
            stats: PeerStats {
                bytes_sent: 10,
                bytes_received: 20,
                packets_sent: 1,
                packets_received: 2,
            },
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes[0], MSG_HEARTBEAT);
        assert_eq!(RelayFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_close_roundtrip() {
        let bytes = RelayFrame::Close.encode().unwrap();
        assert_eq!(bytes, vec![MSG_CLOSE]);
        assert_eq!(RelayFrame::decode(&bytes).unwrap(), RelayFrame::Close);
    }

    #[test]
    fn test_error_roundtrip() {
        let frame = RelayFrame::Error {
            message: "session superseded".to_string(),
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(RelayFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_empty_payload_allowed() {
        let frame = RelayFrame::SendPacket {
            target: "p".to_string(),
            payload: vec![],
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(RelayFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(RelayFrame::decode(&[]), Err(FrameError::Empty)));
        assert!(matches!(
            RelayFrame::decode(&[0x99]),
            Err(FrameError::UnknownType(0x99))
        ));
        // Claims a 10-byte name but carries 2 bytes.
        assert!(matches!(
            RelayFrame::decode(&[MSG_SEND_PACKET, 10, b'a', b'b']),
            Err(FrameError::Truncated)
        ));
        assert!(matches!(
            RelayFrame::decode(&[MSG_ERROR, 0]),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn test_oversized_name_rejected() {
        let frame = RelayFrame::SendPacket {
            target: "x".repeat(300),
            payload: vec![],
        };
        assert!(matches!(frame.encode(), Err(FrameError::NameTooLong(300))));
    }
}
