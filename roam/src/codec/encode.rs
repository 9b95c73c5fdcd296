use bytes::{BufMut, Bytes, BytesMut};

use super::compression::{compress, CompressionEncoding, SingleMessageCompressionOverride};
use super::{EncodeBuf, Encoder, HEADER_SIZE};
use crate::Status;

pub(super) const BUFFER_SIZE: usize = 8 * 1024;

/// Encodes one message into its on-stream form: the five-byte prefix
/// followed by the (optionally compressed) payload.
///
/// `buf` and `uncompressed` are scratch buffers reused across messages.
pub(crate) fn encode_message<T>(
    encoder: &mut dyn Encoder<Item = T, Error = Status>,
    item: T,
    compression: Option<CompressionEncoding>,
    compression_override: SingleMessageCompressionOverride,
    max_message_size: Option<usize>,
    buf: &mut BytesMut,
    uncompressed: &mut BytesMut,
) -> Result<Bytes, Status> {
    let compress_item = compression.is_some()
        && compression_override == SingleMessageCompressionOverride::Inherit;

    buf.clear();
    buf.reserve(HEADER_SIZE + BUFFER_SIZE);
    buf.put_bytes(0, HEADER_SIZE);

    if compress_item {
        uncompressed.clear();

        encoder
            .encode(item, &mut EncodeBuf::new(uncompressed))
            .map_err(|err| Status::internal(format!("error encoding message: {err}")))?;

        let uncompressed_len = uncompressed.len();
        check_message_size(uncompressed_len, max_message_size)?;

        compress(
            compression.expect("compress_item implies compression"),
            uncompressed,
            buf,
            uncompressed_len,
        )
        .map_err(|err| Status::internal(format!("error compressing message: {err}")))?;
    } else {
        encoder
            .encode(item, &mut EncodeBuf::new(buf))
            .map_err(|err| Status::internal(format!("error encoding message: {err}")))?;

        check_message_size(buf.len() - HEADER_SIZE, max_message_size)?;
    }

    let len = buf.len() - HEADER_SIZE;
    if len > u32::MAX as usize {
        return Err(Status::resource_exhausted(format!(
            "message length {len} exceeds the wire format limit"
        )));
    }
    {
        let mut header = &mut buf[..HEADER_SIZE];
        header.put_u8(compress_item as u8);
        header.put_u32(len as u32);
    }

    Ok(buf.split_to(HEADER_SIZE + len).freeze())
}

fn check_message_size(len: usize, limit: Option<usize>) -> Result<(), Status> {
    match limit {
        Some(limit) if len > limit => Err(Status::resource_exhausted(format!(
            "attempted to send message of {len} bytes, limit is {limit}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use bytes::Buf;

    struct RawEncoder;

    impl Encoder for RawEncoder {
        type Item = Bytes;
        type Error = Status;

        fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
            dst.put_slice(&item);
            Ok(())
        }
    }

    struct RawDecoder;

    impl Decoder for RawDecoder {
        type Item = Bytes;
        type Error = Status;

        fn decode(&mut self, src: &mut super::super::DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
            Ok(Some(src.copy_to_bytes(src.remaining())))
        }
    }

    #[test]
    fn prefix_carries_flag_and_length() {
        let mut buf = BytesMut::new();
        let mut scratch = BytesMut::new();
        let framed = encode_message(
            &mut RawEncoder,
            Bytes::from_static(b"hello"),
            None,
            SingleMessageCompressionOverride::default(),
            None,
            &mut buf,
            &mut scratch,
        )
        .unwrap();

        assert_eq!(&framed[..], &[0, 0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn oversize_message_is_resource_exhausted() {
        let mut buf = BytesMut::new();
        let mut scratch = BytesMut::new();
        let err = encode_message(
            &mut RawEncoder,
            Bytes::from_static(b"too big"),
            None,
            SingleMessageCompressionOverride::default(),
            Some(3),
            &mut buf,
            &mut scratch,
        )
        .unwrap_err();
        assert_eq!(err.code(), crate::Code::ResourceExhausted);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn compressed_flag_set_when_compressing() {
        let mut buf = BytesMut::new();
        let mut scratch = BytesMut::new();
        let framed = encode_message(
            &mut RawEncoder,
            Bytes::from(vec![7u8; 256]),
            Some(CompressionEncoding::Gzip),
            SingleMessageCompressionOverride::Inherit,
            None,
            &mut buf,
            &mut scratch,
        )
        .unwrap();
        assert_eq!(framed[0], 1);

        let framed = encode_message(
            &mut RawEncoder,
            Bytes::from(vec![7u8; 256]),
            Some(CompressionEncoding::Gzip),
            SingleMessageCompressionOverride::Disable,
            None,
            &mut buf,
            &mut scratch,
        )
        .unwrap();
        assert_eq!(framed[0], 0);
    }
}
