use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::ID;
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// The 68-byte opening exchange on every peer connection.
pub struct Handshake {
    pub protocol:   [u8; 19],
    pub reserved:   [u8; 8],
    pub info_hash:  ID,
    pub peer_id:    ID,
}

impl Handshake {
    pub fn new(info_hash: ID, peer_id: ID) -> Self {
        Self {
            protocol: PROTOCOL,
            // No extensions; incoming reserved bytes are accepted as-is.
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(19);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.len() < 4 {
            return Ok(None);
        }
        // The length byte and the start of the protocol string arrive first;
        // no point waiting for 68 bytes when these are already wrong.
        if src[0] != 19 || &src[1..4] != b"Bit" {
            return Err(PeerError::IncorrectProtocol);
        }
        if src.len() < 68 {
            return Ok(None);
        }

        src.advance(1);
        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);
        if protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(info_hash: ID, peer_id: ID) -> BytesMut {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(Handshake::new(info_hash, peer_id), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        buf
    }

    #[test]
    fn test_round_trip() {
        let mut src = encoded([0xaa; 20], [0xbb; 20]);
        let handshake = HandshakeCodec.decode(&mut src).unwrap().unwrap();
        assert_eq!(handshake.protocol, PROTOCOL);
        assert_eq!(handshake.reserved, [0; 8]);
        assert_eq!(handshake.info_hash, [0xaa; 20]);
        assert_eq!(handshake.peer_id, [0xbb; 20]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_incomplete_waits() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        assert!(HandshakeCodec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_rejects_on_first_bytes() {
        // A wrong prefix fails before the full 68 bytes ever arrive.
        let mut src = BytesMut::from(&b"\x13Bad"[..]);
        assert!(HandshakeCodec.decode(&mut src).is_err());

        let mut src = BytesMut::from(&b"\x14BitT"[..]);
        assert!(HandshakeCodec.decode(&mut src).is_err());
    }

    #[test]
    fn test_rejects_wrong_protocol_tail() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"Bittorrent protocol"); // wrong case
        src.extend_from_slice(&[0; 48]);
        assert!(HandshakeCodec.decode(&mut src).is_err());
    }

    #[test]
    fn test_trailing_data_left_in_buffer() {
        let mut src = encoded([1; 20], [2; 20]);
        src.extend_from_slice(&[0, 0, 0, 0]); // a keep-alive right behind
        assert!(HandshakeCodec.decode(&mut src).unwrap().is_some());
        assert_eq!(src.len(), 4);
    }
}
