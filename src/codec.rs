//! Length-delimited postcard framing for [`Message`].
//!
//! Wire layout per frame: a u32 length prefix followed by the
//! postcard-encoded message (sender id, kind discriminant, varint
//! request id, varint clock vector). Self-describing and schema-checked
//! on decode — inbound bytes are never interpreted as anything but these
//! typed fields.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::messages::Message;

fn new_length_delimited_codec() -> LengthDelimitedCodec {
    // A frame is two ids + one discriminant + N varints; 64 KiB is generous
    // headroom for any realistic cluster size.
    LengthDelimitedCodec::builder()
        .max_frame_length(64 * 1024)
        .new_codec()
}

/// Wraps [`LengthDelimitedCodec`] with postcard serialization of
/// [`Message`].
#[derive(Debug)]
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MessageCodec {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl MessageCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: new_length_delimited_codec(),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let msg = postcard::from_bytes(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = postcard::to_allocvec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(bytes), dst)
    }
}
