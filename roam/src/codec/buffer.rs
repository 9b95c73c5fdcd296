use bytes::buf::UninitSlice;
use bytes::{Buf, BufMut, BytesMut};

/// Buffer handed to a [`Decoder`](super::Decoder), windowed to exactly one
/// length-delimited message.
#[derive(Debug)]
pub struct DecodeBuf<'a> {
    buf: &'a mut BytesMut,
    len: usize,
}

impl<'a> DecodeBuf<'a> {
    pub(crate) fn new(buf: &'a mut BytesMut, len: usize) -> Self {
        DecodeBuf { buf, len }
    }
}

impl Buf for DecodeBuf<'_> {
    #[inline]
    fn remaining(&self) -> usize {
        self.len
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        let chunk = self.buf.chunk();
        if chunk.len() > self.len {
            &chunk[..self.len]
        } else {
            chunk
        }
    }

    #[inline]
    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.len);
        self.buf.advance(cnt);
        self.len -= cnt;
    }
}

/// Buffer handed to an [`Encoder`](super::Encoder); bytes written land after
/// the (not yet filled in) message prefix.
#[derive(Debug)]
pub struct EncodeBuf<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> EncodeBuf<'a> {
    pub(crate) fn new(buf: &'a mut BytesMut) -> Self {
        EncodeBuf { buf }
    }

    /// Reserves capacity for at least `additional` more bytes.
    #[inline]
    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }
}

unsafe impl BufMut for EncodeBuf<'_> {
    #[inline]
    fn remaining_mut(&self) -> usize {
        self.buf.remaining_mut()
    }

    #[inline]
    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.buf.advance_mut(cnt)
    }

    #[inline]
    fn chunk_mut(&mut self) -> &mut UninitSlice {
        self.buf.chunk_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_buf_is_windowed_to_len() {
        let mut payload = BytesMut::new();
        payload.put(&[1u8; 32][..]);
        let mut buf = DecodeBuf::new(&mut payload, 8);

        assert_eq!(buf.remaining(), 8);
        assert_eq!(buf.chunk().len(), 8);

        buf.advance(8);
        assert!(!buf.has_remaining());
        // The bytes beyond the window are untouched.
        assert_eq!(payload.len(), 24);
    }

    #[test]
    fn encode_buf_writes_through() {
        let mut bytes = BytesMut::with_capacity(16);
        let mut buf = EncodeBuf::new(&mut bytes);
        buf.put_slice(b"abc");
        assert_eq!(&bytes[..], b"abc");
    }
}
