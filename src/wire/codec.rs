//! Framed message codec.
//!
//! Frames carry a fixed 24-byte header followed by the payload:
//! - 4 bytes: network magic (identifier, little-endian)
//! - 12 bytes: NUL-padded ASCII command
//! - 4 bytes: little-endian payload length
//! - 4 bytes: checksum, first four bytes of SHA256(SHA256(payload))

use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{P2pError, P2pResult};
use crate::wire::{self, Message, NetworkAddress, VersionMessage};

/// Header size: magic + command + length + checksum.
const HEADER_SIZE: usize = 24;

/// Command field width.
const COMMAND_SIZE: usize = 12;

fn checksum(payload: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; 4];
    out.copy_from_slice(&second[..4]);
    out
}

/// A parsed frame header, pending its payload.
#[derive(Debug)]
struct Header {
    command: String,
    length: usize,
    checksum: [u8; 4],
}

/// Codec for framed protocol messages.
#[derive(Debug)]
pub struct MessageCodec {
    /// Expected frame magic.
    magic: [u8; 4],
    /// Header of the frame currently being read.
    current: Option<Header>,
}

impl MessageCodec {
    /// Create a codec for a network magic.
    pub fn new(magic: [u8; 4]) -> Self {
        Self {
            magic,
            current: None,
        }
    }

    fn decode_header(&self, src: &mut BytesMut) -> P2pResult<Header> {
        let magic: [u8; 4] = src[0..4].try_into().expect("slice length checked");
        if magic != self.magic {
            return Err(P2pError::BadStream(format!(
                "invalid magic: expected {:02x?}, got {:02x?}",
                self.magic, magic
            )));
        }

        let raw_command = &src[4..4 + COMMAND_SIZE];
        let end = raw_command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_SIZE);
        let command = std::str::from_utf8(&raw_command[..end])
            .map_err(|_| P2pError::BadStream("non-ascii command".to_string()))?
            .to_string();

        let length =
            u32::from_le_bytes(src[16..20].try_into().expect("slice length checked")) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(P2pError::BadStream(format!(
                "payload too large: {} bytes (max {})",
                length, MAX_PAYLOAD_SIZE
            )));
        }

        let checksum: [u8; 4] = src[20..24].try_into().expect("slice length checked");

        src.advance(HEADER_SIZE);
        Ok(Header {
            command,
            length,
            checksum,
        })
    }

    fn decode_payload(command: &str, payload: &[u8]) -> P2pResult<Message> {
        let message = match command {
            "version" => Message::Version(wire::deserialize::<VersionMessage>(payload)?),
            "verack" => Message::Verack,
            "ping" => Message::Ping(wire::deserialize::<u64>(payload)?),
            "pong" => Message::Pong(wire::deserialize::<u64>(payload)?),
            "getaddr" => Message::GetAddresses,
            "addr" => Message::Addresses(wire::deserialize::<Vec<NetworkAddress>>(payload)?),
            other => Message::Unknown {
                command: other.to_string(),
                payload: payload.to_vec(),
            },
        };
        Ok(message)
    }

    fn encode_payload(message: &Message) -> P2pResult<Vec<u8>> {
        match message {
            Message::Version(v) => wire::serialize(v),
            Message::Verack | Message::GetAddresses => Ok(Vec::new()),
            Message::Ping(n) | Message::Pong(n) => wire::serialize(n),
            Message::Addresses(list) => wire::serialize(list),
            Message::Unknown { payload, .. } => Ok(payload.clone()),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = P2pError;

    fn decode(&mut self, src: &mut BytesMut) -> P2pResult<Option<Self::Item>> {
        if self.current.is_none() {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }
            self.current = Some(self.decode_header(src)?);
        }

        let header = self.current.as_ref().expect("header just set");
        if src.len() < header.length {
            src.reserve(header.length - src.len());
            return Ok(None);
        }

        let header = self.current.take().expect("header present");
        let payload = src.split_to(header.length);

        if checksum(&payload) != header.checksum {
            return Err(P2pError::BadStream(format!(
                "checksum mismatch on '{}'",
                header.command
            )));
        }

        Self::decode_payload(&header.command, &payload).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = P2pError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> P2pResult<()> {
        let command = message.command();
        if command.len() > COMMAND_SIZE || !command.is_ascii() {
            return Err(P2pError::BadStream(format!("invalid command '{}'", command)));
        }

        let payload = Self::encode_payload(&message)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(P2pError::BadStream(format!(
                "payload too large: {} bytes (max {})",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&self.magic);

        let mut name = [0u8; COMMAND_SIZE];
        name[..command.len()].copy_from_slice(command.as_bytes());
        dst.put_slice(&name);

        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum(&payload));
        dst.put_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::wire::unix_time;

    fn codec() -> MessageCodec {
        MessageCodec::new(Settings::mainnet().magic())
    }

    fn version() -> VersionMessage {
        VersionMessage {
            protocol_version: crate::config::PROTOCOL_VERSION,
            services: 1,
            timestamp: unix_time() as u64,
            receiver: NetworkAddress::new("203.0.113.9".parse().unwrap(), 7333, 0),
            sender: NetworkAddress::unspecified(1),
            nonce: 0xdead_beef,
            user_agent: "/galena-p2p:0.1.0/".to_string(),
            start_height: 812_000,
            relay: true,
        }
    }

    #[test]
    fn test_roundtrip_version() {
        let mut codec = codec();
        let original = Message::Version(version());

        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_roundtrip_addresses() {
        let mut codec = codec();
        let list = vec![
            NetworkAddress::new("203.0.113.1".parse().unwrap(), 7333, 1),
            NetworkAddress::new("2001:db8::1".parse().unwrap(), 7333, 1),
        ];
        let original = Message::Addresses(list);

        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), original);
    }

    #[test]
    fn test_unknown_command_passes_through() {
        let mut codec = codec();
        let original = Message::Unknown {
            command: "inv".to_string(),
            payload: vec![9, 8, 7],
        };

        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), original);
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec.encode(Message::Ping(7), &mut buf).unwrap();

        // Header plus two payload bytes: not decodable yet.
        let mut partial = buf.split_to(HEADER_SIZE + 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert_eq!(
            codec.decode(&mut partial).unwrap().unwrap(),
            Message::Ping(7)
        );
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let mut encoder = MessageCodec::new([0xff; 4]);
        let mut buf = BytesMut::new();
        encoder.encode(Message::Verack, &mut buf).unwrap();

        let mut decoder = codec();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(P2pError::BadStream(_))
        ));
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec.encode(Message::Ping(7), &mut buf).unwrap();

        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(codec.decode(&mut buf), Err(P2pError::BadStream(_))));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        buf.put_slice(&Settings::mainnet().magic());
        buf.put_slice(&[0u8; COMMAND_SIZE]);
        buf.put_u32_le((MAX_PAYLOAD_SIZE + 1) as u32);
        buf.put_slice(&[0u8; 4]);

        assert!(matches!(codec.decode(&mut buf), Err(P2pError::BadStream(_))));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec.encode(Message::Ping(1), &mut buf).unwrap();
        codec.encode(Message::Pong(1), &mut buf).unwrap();
        codec.encode(Message::GetAddresses, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::Ping(1));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::Pong(1));
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Message::GetAddresses
        );
        assert!(buf.is_empty());
    }
}
