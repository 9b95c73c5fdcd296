//! Generic encoding and decoding of RPC messages.
//!
//! A [`Codec`] turns typed messages into bytes and back; the surrounding
//! machinery adds the five-byte message prefix (compressed flag plus
//! big-endian length) and drives compression and flow control.

mod buffer;
pub(crate) mod compression;
mod decode;
mod encode;

#[cfg(feature = "prost")]
mod prost;

use crate::Status;

pub use buffer::{DecodeBuf, EncodeBuf};
pub use compression::{CompressionEncoding, EnabledCompressionEncodings};
pub(crate) use compression::SingleMessageCompressionOverride;
pub use decode::Streaming;
pub(crate) use decode::{DataSource, StreamDirection};
pub(crate) use encode::encode_message;

#[cfg(feature = "prost")]
pub use self::prost::ProstCodec;

/// Size of the message prefix: one flag byte plus a `u32` length.
pub(crate) const HEADER_SIZE: usize = 1 + 4;

/// Default limit on decoded (post-decompression) message size: 4 MiB.
pub(crate) const DEFAULT_MAX_RECV_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Trait that knows how to encode and decode RPC messages.
pub trait Codec {
    /// The encodable message.
    type Encode: Send + 'static;
    /// The decodable message.
    type Decode: Send + 'static;

    /// The encoder that can encode a message.
    type Encoder: Encoder<Item = Self::Encode, Error = Status> + Send + 'static;
    /// The decoder that can decode a message.
    type Decoder: Decoder<Item = Self::Decode, Error = Status> + Send + 'static;

    /// Fetch the encoder.
    fn encoder(&mut self) -> Self::Encoder;
    /// Fetch the decoder.
    fn decoder(&mut self) -> Self::Decoder;
}

/// Encodes messages into bytes.
pub trait Encoder {
    /// The message type.
    type Item;
    /// The error produced on failure; surfaced as an `Internal` status.
    type Error: From<std::io::Error>;

    /// Encode `item` into the destination buffer.
    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error>;
}

/// Decodes messages from bytes.
pub trait Decoder {
    /// The decoded message type.
    type Item;
    /// The error produced on failure; surfaced as an `Internal` status.
    type Error: From<std::io::Error>;

    /// Decode one complete message from `src`. The buffer holds exactly one
    /// length-delimited message; `Ok(None)` means the decoder needs more
    /// data, which is a protocol violation at this layer.
    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error>;
}
