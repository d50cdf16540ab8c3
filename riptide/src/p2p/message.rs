use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{
    block::{BlockData, BlockInfo},
    Bitfield, BLOCK_SIZE,
};
use super::PeerError;

#[cfg_attr(test, derive(Debug, Clone, PartialEq, Eq))]
pub enum Message {

    // Advises the peer not to close the connection even if nothing has
    // arrived for a while.
    KeepAlive,

    // No further requests will be satisfied.
    Choke,

    // Requests from the peer will be served again.
    Unchoke,

    // The client intends to request blocks.
    Interested,

    // The client no longer intends to request blocks.
    NotInterested,

    // The client acquired the piece at this index.
    Have { idx: u32 },

    // Which pieces a client holds, sent once right after the handshake.
    Bitfield(Bitfield),

    // Ask for a block: piece index, offset within the piece, length.
    Request(BlockInfo),

    // A block payload, referencing piece index and offset.
    Block(BlockData),

    // Withdraw an earlier request.
    Cancel(BlockInfo),
}

// Length-prefixed framing. The codec knows the piece count so it can hold
// bitfield frames to their exact size and cap every frame length.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    num_pieces: usize,
}

impl MessageCodec {

    pub fn new(num_pieces: usize) -> Self {
        Self { num_pieces }
    }

    fn bitfield_len(&self) -> usize {
        (self.num_pieces + 7) / 8
    }

    fn max_frame(&self) -> usize {
        (9 + BLOCK_SIZE).max(1 + self.bitfield_len())
    }
}

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // [0, 0, 0, 0]
            Message::KeepAlive => dst.put_u32(0),

            // [0, 0, 0, 1, 0]
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // [0, 0, 0, 1, 1]
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // [0, 0, 0, 1, 2]
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // [0, 0, 0, 1, 3]
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                dst.put_u32(1 + bitfield.as_raw_slice().len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(bitfield.as_raw_slice());
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        loop {
            // Can't read the message length yet.
            if src.remaining() < 4 {
                return Ok(None);
            }

            let mut peeker = std::io::Cursor::new(&src[..]);
            let msg_len = peeker.get_u32() as usize;

            if msg_len > self.max_frame() {
                return Err(PeerError::FrameTooLarge(msg_len));
            }
            if src.remaining() < 4 + msg_len {
                // Haven't received all of the message.
                return Ok(None);
            }

            src.advance(4);
            if msg_len == 0 {
                return Ok(Some(Message::KeepAlive));
            }

            let id = src.get_u8();
            let msg = match id {
                0..=3 => {
                    if msg_len != 1 {
                        return Err(PeerError::InvalidMessage);
                    }
                    match id {
                        0 => Message::Choke,
                        1 => Message::Unchoke,
                        2 => Message::Interested,
                        _ => Message::NotInterested,
                    }
                },
                4 => {
                    if msg_len != 5 {
                        return Err(PeerError::InvalidMessage);
                    }
                    Message::Have { idx: src.get_u32() }
                },
                5 => {
                    if msg_len != 1 + self.bitfield_len() {
                        return Err(PeerError::InvalidMessage);
                    }
                    let mut raw = vec![0; msg_len - 1];
                    src.copy_to_slice(&mut raw);
                    // Spare bits past the piece count must be zero.
                    let spare = self.num_pieces % 8;
                    if spare != 0 && raw[raw.len() - 1] << spare != 0 {
                        return Err(PeerError::InvalidMessage);
                    }
                    let mut bitfield = Bitfield::from_vec(raw);
                    bitfield.truncate(self.num_pieces);
                    Message::Bitfield(bitfield)
                },
                6 => {
                    if msg_len != 13 {
                        return Err(PeerError::InvalidMessage);
                    }
                    let piece_idx = src.get_u32() as usize;
                    let offset = src.get_u32() as usize;
                    let len = src.get_u32() as usize;
                    Message::Request(BlockInfo { piece_idx, offset, len })
                },
                7 => {
                    if msg_len < 9 {
                        return Err(PeerError::InvalidMessage);
                    }
                    let piece_idx = src.get_u32() as usize;
                    let offset = src.get_u32() as usize;
                    let mut data = vec![0; msg_len - 9];
                    src.copy_to_slice(&mut data);
                    Message::Block(BlockData { piece_idx, offset, data })
                },
                8 => {
                    if msg_len != 13 {
                        return Err(PeerError::InvalidMessage);
                    }
                    let piece_idx = src.get_u32() as usize;
                    let offset = src.get_u32() as usize;
                    let len = src.get_u32() as usize;
                    Message::Cancel(BlockInfo { piece_idx, offset, len })
                },
                id => {
                    // Unknown ids are skipped, not fatal.
                    tracing::debug!("skipping unknown message id {}", id);
                    src.advance(msg_len - 1);
                    continue;
                }
            };

            return Ok(Some(msg));
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Block(block) => write!(f, "block data {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
        }
    }
}
