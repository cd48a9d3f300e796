//! # Wire Format
//!
//! CBOR encoding and length-delimited framing for RAINS messages.
//!
//! Each frame on a stream is a 4-byte big-endian length prefix followed by
//! the CBOR encoding of one [`Message`]. Frames are bounded by the
//! configured maximum message size on both directions: encoding a larger
//! message fails locally, and an inbound frame claiming a larger length is
//! rejected before any payload is read, so a hostile peer cannot make the
//! server buffer more than the limit.
//!
//! Round-trip invariant: for any sorted message `m`,
//! `decode(encode(m)) == m`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;

/// Default maximum size of one framed message in bytes.
pub const DEFAULT_MSG_MAX_SIZE: usize = 65535;

/// Error type for framing and codec failures.
#[derive(Debug)]
pub enum WireError {
    /// The frame exceeds the configured maximum message size.
    TooLarge { size: usize, limit: usize },
    /// The payload is not a valid CBOR message.
    Malformed(String),
    /// The underlying stream failed or closed mid-frame.
    Io(std::io::Error),
    /// The stream closed cleanly between frames.
    Closed,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::TooLarge { size, limit } => {
                write!(f, "frame of {size} bytes exceeds limit of {limit}")
            }
            WireError::Malformed(detail) => write!(f, "malformed message: {detail}"),
            WireError::Io(err) => write!(f, "stream error: {err}"),
            WireError::Closed => write!(f, "stream closed"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        WireError::Io(err)
    }
}

/// Encode `msg` to CBOR, checking the size limit.
pub fn encode(msg: &Message, max_size: usize) -> Result<Vec<u8>, WireError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(msg, &mut bytes)
        .map_err(|e| WireError::Malformed(e.to_string()))?;
    if bytes.len() > max_size {
        return Err(WireError::TooLarge {
            size: bytes.len(),
            limit: max_size,
        });
    }
    Ok(bytes)
}

/// Decode one CBOR message from `bytes`.
pub fn decode(bytes: &[u8], max_size: usize) -> Result<Message, WireError> {
    if bytes.len() > max_size {
        return Err(WireError::TooLarge {
            size: bytes.len(),
            limit: max_size,
        });
    }
    ciborium::de::from_reader(bytes).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Write one framed message to `stream`.
pub async fn write_message<W>(stream: &mut W, msg: &Message, max_size: usize) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(msg, max_size)?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed message from `stream`.
///
/// `WireError::Closed` means the peer shut the stream down between frames;
/// `TooLarge` is returned before the oversized payload is read.
pub async fn read_message<R>(stream: &mut R, max_size: usize) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(WireError::Closed),
        Err(e) => return Err(WireError::Io(e)),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_size {
        return Err(WireError::TooLarge {
            size: len,
            limit: max_size,
        });
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    decode(&payload, max_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        Assertion, Notification, NotificationKind, Object, Query, Section, Token,
    };
    use std::net::Ipv4Addr;

    fn sample_message() -> Message {
        let mut msg = Message {
            token: Token::fresh(),
            content: vec![
                Section::Query(Query {
                    name: "example".to_string(),
                    context: ".".to_string(),
                    expiration: 2_000_000_000,
                    types: vec![crate::message::ObjectKind::Ip4],
                    options: vec![crate::message::QueryOption::CachedAnswersOnly],
                }),
                Section::Assertion(Assertion {
                    subject_name: "example".to_string(),
                    subject_zone: "ch".to_string(),
                    context: ".".to_string(),
                    content: vec![Object::Ip4(Ipv4Addr::new(192, 0, 2, 7))],
                    ..Default::default()
                }),
                Section::Notification(Notification {
                    token: Token::fresh(),
                    kind: NotificationKind::Heartbeat,
                    data: String::new(),
                }),
            ],
            signatures: vec![],
            capabilities: vec![crate::message::Capability::tls_over_tcp()],
        };
        msg.sort();
        msg
    }

    #[test]
    fn codec_round_trip() {
        let msg = sample_message();
        let bytes = encode(&msg, DEFAULT_MSG_MAX_SIZE).unwrap();
        let decoded = decode(&bytes, DEFAULT_MSG_MAX_SIZE).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn encode_rejects_oversized() {
        let mut msg = sample_message();
        if let Section::Assertion(a) = &mut msg.content[0] {
            a.content = vec![Object::NameSet("x".repeat(100_000)); 1];
        }
        match encode(&msg, DEFAULT_MSG_MAX_SIZE) {
            Err(WireError::TooLarge { limit, .. }) => assert_eq!(limit, DEFAULT_MSG_MAX_SIZE),
            other => panic!("expected TooLarge, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        let garbage = [0xFFu8, 0x00, 0x12, 0x34];
        assert!(matches!(
            decode(&garbage, DEFAULT_MSG_MAX_SIZE),
            Err(WireError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn framed_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1 << 16);
        let msg = sample_message();

        write_message(&mut client, &msg, DEFAULT_MSG_MAX_SIZE)
            .await
            .unwrap();
        let received = read_message(&mut server, DEFAULT_MSG_MAX_SIZE).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn oversized_frame_rejected_before_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // A length prefix far beyond the limit, with no payload behind it.
        client.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();

        match read_message(&mut server, DEFAULT_MSG_MAX_SIZE).await {
            Err(WireError::TooLarge { size, .. }) => assert_eq!(size, 1_000_000),
            other => panic!("expected TooLarge, got {:?}", other.err().map(|e| e.to_string())),
        }
    }

    #[tokio::test]
    async fn clean_close_between_frames() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(matches!(
            read_message(&mut server, DEFAULT_MSG_MAX_SIZE).await,
            Err(WireError::Closed)
        ));
    }

    #[tokio::test]
    async fn sequential_frames_stay_in_order() {
        let (mut client, mut server) = tokio::io::duplex(1 << 16);
        let first = sample_message();
        let second = sample_message();

        write_message(&mut client, &first, DEFAULT_MSG_MAX_SIZE).await.unwrap();
        write_message(&mut client, &second, DEFAULT_MSG_MAX_SIZE).await.unwrap();

        let got_first = read_message(&mut server, DEFAULT_MSG_MAX_SIZE).await.unwrap();
        let got_second = read_message(&mut server, DEFAULT_MSG_MAX_SIZE).await.unwrap();
        assert_eq!(got_first.token, first.token);
        assert_eq!(got_second.token, second.token);
    }
}
