//! Framing and messages of the peer wire protocol.
//!
//! After the 68-byte handshake every message is length prefixed: a four byte
//! big-endian length covering the id byte and the payload. A length of zero
//! is a keep-alive.

pub mod handshake;

// re-exports
pub use handshake::{Handshake, HandshakeCodec, PSTR};

use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::{bitfield::Bitfield, config::CONFIG, error::Error};

/// Size of a block request, 16 KiB, the de-facto constant of the protocol.
pub const BLOCK_LEN: u32 = 1 << 14;

/// Identifies a block within a piece: the piece index, the byte offset
/// inside the piece and the length in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub index: u32,
    pub begin: u32,
    pub len: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl BlockInfo {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }
}

/// A block of data carried by a Piece message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: usize,
    pub begin: u32,
    pub block: Vec<u8>,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            index: self.index as u32,
            begin: self.begin,
            len: self.block.len() as u32,
        }
    }
}

/// An extension protocol message: the extended message id followed by its
/// payload, usually bencoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedMessage(pub u8, pub Vec<u8>);

/// Messages exchanged after a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(usize),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    Extended(ExtendedMessage),
}

/// The wire ids of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match k {
            k if k == Choke as u8 => Ok(Choke),
            k if k == Unchoke as u8 => Ok(Unchoke),
            k if k == Interested as u8 => Ok(Interested),
            k if k == NotInterested as u8 => Ok(NotInterested),
            k if k == Have as u8 => Ok(Have),
            k if k == Bitfield as u8 => Ok(Bitfield),
            k if k == Request as u8 => Ok(Request),
            k if k == Piece as u8 => Ok(Piece),
            k if k == Cancel as u8 => Ok(Cancel),
            k if k == Extended as u8 => Ok(Extended),
            _ => Err(Error::MessageId(k)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            // <len=0005><id=4><piece index>
            Message::Have(piece_index) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                let piece_index = piece_index.try_into().map_err(|_| {
                    Error::MessageResponse
                })?;
                buf.put_u32(piece_index);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let v = bitfield.into_vec();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Request as u8);
                block_info.encode(buf);
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                let Block { index, begin, block } = block;

                buf.put_u32(1 + 4 + 4 + block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);

                let index =
                    index.try_into().map_err(|_| Error::MessageResponse)?;
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.put(&block[..]);
            }
            // <len=0013><id=8><index><begin><length>
            Message::Cancel(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Cancel as u8);
                block_info.encode(buf);
            }
            // <len=0002+X><id=20><ext_id><payload>
            Message::Extended(ExtendedMessage(ext_id, payload)) => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(ext_id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // the message length header must be present at the minimum, otherwise
        // we can't determine the message type
        if buf.remaining() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without advancing the buffer, the whole
        // message may not have arrived yet
        let mut tmp_buf = Cursor::new(&buf);
        let msg_len = tmp_buf.get_u32() as usize;

        if msg_len > CONFIG.max_message_length as usize {
            return Err(Error::MessageTooLarge(msg_len));
        }

        if buf.remaining() < 4 + msg_len {
            trace!(
                "read buffer is {} bytes long but message is {} bytes long",
                buf.remaining(),
                msg_len
            );
            return Ok(None);
        }

        buf.advance(4);

        // the length is only 0 for keep alive messages, everything else
        // carries at least the message id
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let msg_id = MessageId::try_from(buf.get_u8())?;

        let msg = match msg_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if msg_len != 5 {
                    return Err(Error::MessageResponse);
                }
                Message::Have(buf.get_u32() as usize)
            }
            MessageId::Bitfield => {
                let mut bitfield = vec![0; msg_len - 1];
                buf.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            }
            MessageId::Request => {
                if msg_len != 13 {
                    return Err(Error::MessageResponse);
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();

                Message::Request(BlockInfo { index, begin, len })
            }
            MessageId::Piece => {
                if msg_len < 9 {
                    return Err(Error::MessageResponse);
                }
                let index = buf.get_u32() as usize;
                let begin = buf.get_u32();

                let mut block = vec![0; msg_len - 9];
                buf.copy_to_slice(&mut block);

                Message::Piece(Block { index, begin, block })
            }
            MessageId::Cancel => {
                if msg_len != 13 {
                    return Err(Error::MessageResponse);
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();

                Message::Cancel(BlockInfo { index, begin, len })
            }
            MessageId::Extended => {
                if msg_len < 2 {
                    return Err(Error::MessageResponse);
                }
                let ext_id = buf.get_u8();

                let mut payload = vec![0u8; msg_len - 2];
                buf.copy_to_slice(&mut payload);

                Message::Extended(ExtendedMessage(ext_id, payload))
            }
        };

        Ok(Some(msg))
    }
}
