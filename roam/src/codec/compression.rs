//! Message compression and the `grpc-encoding` negotiation headers.

use std::{fmt, io};

use bytes::{Buf, BytesMut};
#[cfg(feature = "deflate")]
use flate2::read::{ZlibDecoder, ZlibEncoder};
#[cfg(feature = "gzip")]
use flate2::read::{GzDecoder, GzEncoder};
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::Status;

pub(crate) const ENCODING_HEADER: &str = "grpc-encoding";
pub(crate) const ACCEPT_ENCODING_HEADER: &str = "grpc-accept-encoding";

/// An ordered set of compression encodings enabled on a channel or server.
///
/// The order encodings were enabled in is the preference order announced in
/// `grpc-accept-encoding`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnabledCompressionEncodings {
    inner: [Option<CompressionEncoding>; 3],
}

impl EnabledCompressionEncodings {
    /// Enable an encoding, appending it to the preference list.
    pub fn enable(&mut self, encoding: CompressionEncoding) {
        for slot in self.inner.iter_mut() {
            match slot {
                Some(existing) if *existing == encoding => return,
                None => {
                    *slot = Some(encoding);
                    return;
                }
                _ => continue,
            }
        }
    }

    /// Whether `encoding` is enabled.
    pub fn is_enabled(&self, encoding: CompressionEncoding) -> bool {
        self.inner.contains(&Some(encoding))
    }

    /// Whether no encodings are enabled.
    pub fn is_empty(&self) -> bool {
        self.inner.iter().all(|slot| slot.is_none())
    }

    /// The `grpc-accept-encoding` value announcing every enabled encoding
    /// (always including `identity`).
    pub(crate) fn into_accept_encoding_header_value(self) -> Option<HeaderValue> {
        let mut value = String::new();
        for encoding in self.inner.into_iter().flatten() {
            value.push_str(encoding.as_str());
            value.push(',');
        }
        if value.is_empty() {
            return None;
        }
        value.push_str("identity");
        // Built from fixed identifier strings.
        Some(HeaderValue::from_str(&value).unwrap())
    }
}

/// The supported message compression encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompressionEncoding {
    #[allow(missing_docs)]
    #[cfg(feature = "gzip")]
    Gzip,
    #[allow(missing_docs)]
    #[cfg(feature = "deflate")]
    Deflate,
    #[allow(missing_docs)]
    #[cfg(feature = "zstd")]
    Zstd,
}

impl CompressionEncoding {
    /// Selects a response encoding from the peer's `grpc-accept-encoding`,
    /// honoring the peer's preference order.
    pub(crate) fn from_accept_encoding_header(
        map: &HeaderMap,
        enabled: EnabledCompressionEncodings,
    ) -> Option<Self> {
        if enabled.is_empty() {
            return None;
        }

        let header = map.get(ACCEPT_ENCODING_HEADER)?.to_str().ok()?;

        header
            .split(',')
            .map(str::trim)
            .filter_map(CompressionEncoding::from_name)
            .find(|encoding| enabled.is_enabled(*encoding))
    }

    /// Reads the peer's `grpc-encoding`. An encoding this endpoint does not
    /// support yields `Unimplemented` carrying our `grpc-accept-encoding`
    /// so the peer can downgrade.
    pub(crate) fn from_encoding_header(
        map: &HeaderMap,
        enabled: EnabledCompressionEncodings,
    ) -> Result<Option<Self>, Status> {
        let Some(header) = map.get(ENCODING_HEADER) else {
            return Ok(None);
        };

        if header.as_bytes() == b"identity" {
            return Ok(None);
        }

        if let Some(encoding) = header
            .to_str()
            .ok()
            .and_then(CompressionEncoding::from_name)
        {
            if enabled.is_enabled(encoding) {
                return Ok(Some(encoding));
            }
        }

        let other = String::from_utf8_lossy(header.as_bytes());
        let mut status = Status::unimplemented(format!(
            "content is compressed with `{other}` which isn't supported"
        ));
        let accept = enabled
            .into_accept_encoding_header_value()
            .unwrap_or_else(|| HeaderValue::from_static("identity"));
        status
            .metadata_mut()
            .insert_raw(HeaderName::from_static(ACCEPT_ENCODING_HEADER), accept);
        Err(status)
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            #[cfg(feature = "gzip")]
            "gzip" => Some(CompressionEncoding::Gzip),
            #[cfg(feature = "deflate")]
            "deflate" => Some(CompressionEncoding::Deflate),
            #[cfg(feature = "zstd")]
            "zstd" => Some(CompressionEncoding::Zstd),
            _ => None,
        }
    }

    /// The symmetric identifier used on the wire.
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            #[cfg(feature = "gzip")]
            CompressionEncoding::Gzip => "gzip",
            #[cfg(feature = "deflate")]
            CompressionEncoding::Deflate => "deflate",
            #[cfg(feature = "zstd")]
            CompressionEncoding::Zstd => "zstd",
        }
    }

    pub(crate) fn into_header_value(self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

/// Resolves the encoding of a received response. An unrecognized or
/// not-enabled encoding yields `None`; a compressed frame will then fail
/// decoding with `Internal`, which is the required outcome for a peer
/// that compresses without negotiation.
pub(crate) fn response_encoding(
    map: &HeaderMap,
    enabled: EnabledCompressionEncodings,
) -> Option<CompressionEncoding> {
    map.get(ENCODING_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(CompressionEncoding::from_name)
        .filter(|encoding| enabled.is_enabled(*encoding))
}

impl fmt::Display for CompressionEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-message override of the stream's compression setting; used by server
/// handlers to send an individual message uncompressed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SingleMessageCompressionOverride {
    /// Inherit the stream's setting (the default).
    #[default]
    Inherit,
    /// Send this message uncompressed even on a compressed stream.
    Disable,
}

/// Compresses the first `len` bytes of `src` into `dst`, consuming them.
pub(crate) fn compress(
    encoding: CompressionEncoding,
    src: &mut BytesMut,
    dst: &mut BytesMut,
    len: usize,
) -> Result<(), io::Error> {
    dst.reserve(len / 2);
    let mut writer = bytes::BufMut::writer(&mut *dst);

    match encoding {
        #[cfg(feature = "gzip")]
        CompressionEncoding::Gzip => {
            let mut encoder = GzEncoder::new(&src[0..len], flate2::Compression::new(6));
            io::copy(&mut encoder, &mut writer)?;
        }
        #[cfg(feature = "deflate")]
        CompressionEncoding::Deflate => {
            let mut encoder = ZlibEncoder::new(&src[0..len], flate2::Compression::new(6));
            io::copy(&mut encoder, &mut writer)?;
        }
        #[cfg(feature = "zstd")]
        CompressionEncoding::Zstd => {
            let mut encoder = zstd::stream::read::Encoder::new(&src[0..len], 0)?;
            io::copy(&mut encoder, &mut writer)?;
        }
    }

    src.advance(len);
    Ok(())
}

/// Decompresses the first `len` bytes of `src` into `dst`, consuming them.
///
/// At most `max_decoded_len` bytes are produced; decoded output exceeding
/// the limit leaves `dst` oversized so the caller can reject the message.
pub(crate) fn decompress(
    encoding: CompressionEncoding,
    src: &mut BytesMut,
    dst: &mut BytesMut,
    len: usize,
    max_decoded_len: usize,
) -> Result<(), io::Error> {
    dst.reserve(len * 2);
    let mut writer = bytes::BufMut::writer(&mut *dst);
    // One extra byte so overflow is observable without unbounded growth.
    let limit = (max_decoded_len as u64).saturating_add(1);

    match encoding {
        #[cfg(feature = "gzip")]
        CompressionEncoding::Gzip => {
            let mut decoder = io::Read::take(GzDecoder::new(&src[0..len]), limit);
            io::copy(&mut decoder, &mut writer)?;
        }
        #[cfg(feature = "deflate")]
        CompressionEncoding::Deflate => {
            let mut decoder = io::Read::take(ZlibDecoder::new(&src[0..len]), limit);
            io::copy(&mut decoder, &mut writer)?;
        }
        #[cfg(feature = "zstd")]
        CompressionEncoding::Zstd => {
            let mut decoder = io::Read::take(zstd::stream::read::Decoder::new(&src[0..len])?, limit);
            io::copy(&mut decoder, &mut writer)?;
        }
    }

    src.advance(len);
    Ok(())
}

#[cfg(all(test, feature = "gzip"))]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn round_trip(encoding: CompressionEncoding, payload: &[u8]) {
        let mut src = BytesMut::from(payload);
        let mut compressed = BytesMut::new();
        compress(encoding, &mut src, &mut compressed, payload.len()).unwrap();
        assert!(src.is_empty());

        let len = compressed.len();
        let mut decompressed = BytesMut::new();
        decompress(encoding, &mut compressed, &mut decompressed, len, 1 << 20).unwrap();
        assert_eq!(&decompressed[..], payload);
    }

    #[test]
    fn gzip_round_trip() {
        round_trip(CompressionEncoding::Gzip, b"the same ten bytes over and over");
    }

    #[test]
    fn corrupt_gzip_fails() {
        let mut src = BytesMut::new();
        src.put_slice(b"definitely not gzip");
        let mut dst = BytesMut::new();
        let len = src.len();
        assert!(decompress(CompressionEncoding::Gzip, &mut src, &mut dst, len, 1 << 20).is_err());
    }

    #[test]
    fn accept_encoding_preference_order() {
        let mut enabled = EnabledCompressionEncodings::default();
        enabled.enable(CompressionEncoding::Gzip);

        let mut map = HeaderMap::new();
        map.insert(
            ACCEPT_ENCODING_HEADER,
            HeaderValue::from_static("identity, gzip"),
        );
        assert_eq!(
            CompressionEncoding::from_accept_encoding_header(&map, enabled),
            Some(CompressionEncoding::Gzip),
        );

        let empty = EnabledCompressionEncodings::default();
        assert_eq!(
            CompressionEncoding::from_accept_encoding_header(&map, empty),
            None
        );
    }

    #[test]
    fn unsupported_encoding_is_unimplemented() {
        let mut enabled = EnabledCompressionEncodings::default();
        enabled.enable(CompressionEncoding::Gzip);

        let mut map = HeaderMap::new();
        map.insert(ENCODING_HEADER, HeaderValue::from_static("br"));
        let err = CompressionEncoding::from_encoding_header(&map, enabled).unwrap_err();
        assert_eq!(err.code(), crate::Code::Unimplemented);
        assert_eq!(
            err.metadata().as_headers().get(ACCEPT_ENCODING_HEADER),
            Some(&HeaderValue::from_static("gzip,identity"))
        );
    }

    #[test]
    fn identity_means_no_compression() {
        let enabled = EnabledCompressionEncodings::default();
        let mut map = HeaderMap::new();
        map.insert(ENCODING_HEADER, HeaderValue::from_static("identity"));
        assert_eq!(
            CompressionEncoding::from_encoding_header(&map, enabled).unwrap(),
            None
        );
    }
}
