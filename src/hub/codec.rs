//! Frame codec for hub traffic
//!
//! # Hub frames
//!
//! Hub frames are as follows:
//!
//! ```norun
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Kind      |             Link              |    Length     :
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! :    Length     |                                               :
//! +-+-+-+-+-+-+-+-+                    Payload                    :
//! :                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Kind: 8-bits. 1 announces a new link, 2 carries link payload,
//! 3 tears a link down.
//!
//! Link: 16-bits. The link the frame belongs to, never zero.
//!
//! Length: 16-bits. Size in bytes of the payload that follows. Always
//! zero for Create and Close frames.
//!
//! The whole post-handshake byte stream in each direction is enciphered
//! with the key derived during the handshake; the codec applies the
//! keystream so callers only ever see plaintext frames.

use crate::{
    auth::{CipherKey, Direction},
    utils::types::LinkId,
};
use bytes::{Buf, BufMut, Bytes};
use chacha20::{cipher::StreamCipher, ChaCha20};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed frame header in bytes
const HEADER_SIZE: usize = 5;

/// Kinds of frame travelling through a hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Announces a new link to the peer
    Create = 1,
    /// Carries link payload bytes
    Data = 2,
    /// Tears the link down
    Close = 3,
}

impl FrameKind {
    fn from_value(value: u8) -> Option<FrameKind> {
        Some(match value {
            1 => FrameKind::Create,
            2 => FrameKind::Data,
            3 => FrameKind::Close,
            _ => return None,
        })
    }
}

/// Message sent through a hub
pub struct Frame {
    pub kind: FrameKind,
    /// The link this frame belongs to
    pub link: LinkId,
    /// The frame contents, empty for control frames
    pub message: Bytes,
}

impl Frame {
    pub fn create(link: LinkId) -> Frame {
        Frame {
            kind: FrameKind::Create,
            link,
            message: Bytes::new(),
        }
    }

    pub fn data(link: LinkId, message: Bytes) -> Frame {
        debug_assert!(message.len() <= u16::MAX as usize);
        Frame {
            kind: FrameKind::Data,
            link,
            message,
        }
    }

    pub fn close(link: LinkId) -> Frame {
        Frame {
            kind: FrameKind::Close,
            link,
            message: Bytes::new(),
        }
    }
}

/// Header portion of a [Frame] decoded while waiting for the payload
struct FrameHeader {
    kind: FrameKind,
    link: LinkId,
    length: u16,
}

/// Codec for encoding and decoding hub frames over the enciphered
/// stream
pub struct FrameCodec {
    /// Keystream applied to outgoing bytes
    seal: ChaCha20,
    /// Keystream applied to incoming bytes
    open: ChaCha20,
    /// How many bytes at the front of the read buffer have already been
    /// deciphered across decode calls
    deciphered: usize,
    /// Stores the current frame header while waiting for the full
    /// payload to become available
    partial: Option<FrameHeader>,
}

impl FrameCodec {
    /// Codec for the client end of a tunnel
    pub fn client(key: &CipherKey) -> FrameCodec {
        Self::new(
            key.cipher(Direction::ClientToServer),
            key.cipher(Direction::ServerToClient),
        )
    }

    /// Codec for the server end of a tunnel
    pub fn server(key: &CipherKey) -> FrameCodec {
        Self::new(
            key.cipher(Direction::ServerToClient),
            key.cipher(Direction::ClientToServer),
        )
    }

    fn new(seal: ChaCha20, open: ChaCha20) -> FrameCodec {
        FrameCodec {
            seal,
            open,
            deciphered: 0,
            partial: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Decipher whatever arrived since the last call
        if src.len() > self.deciphered {
            self.open.apply_keystream(&mut src[self.deciphered..]);
            self.deciphered = src.len();
        }

        let partial = match self.partial.as_mut() {
            Some(value) => value,
            None => {
                // Not enough room for a partial frame
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let kind = src.get_u8();
                let link = src.get_u16();
                let length = src.get_u16();
                self.deciphered -= HEADER_SIZE;

                let kind = FrameKind::from_value(kind).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "unknown frame kind")
                })?;

                self.partial.insert(FrameHeader { kind, link, length })
            }
        };

        // Not enough data for the partial frame
        if src.len() < partial.length as usize {
            return Ok(None);
        }

        let partial = self.partial.take().expect("Partial frame missing");
        let bytes = src.split_to(partial.length as usize);
        self.deciphered -= partial.length as usize;

        Ok(Some(Frame {
            kind: partial.kind,
            link: partial.link,
            message: bytes.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();

        dst.put_u8(item.kind as u8);
        dst.put_u16(item.link);
        dst.put_u16(item.message.len() as u16);
        dst.extend_from_slice(&item.message);

        // Encipher only the region this frame appended; earlier frames
        // still sitting in the buffer are already sealed
        self.seal.apply_keystream(&mut dst[start..]);
        Ok(())
    }
}
