//! Custom metadata attached to RPCs.
//!
//! Metadata is an ordered multimap from lowercase ASCII names to values.
//! Names ending in `-bin` carry arbitrary bytes, base64-encoded on the wire;
//! all other names carry visible-ASCII strings. Names starting with `grpc-`
//! or `:` are reserved for the protocol and cannot be set by applications.

mod encoding;
pub(crate) mod timeout;

use std::fmt;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};

pub(crate) use encoding::{decode_bin_value, encode_bin_value};
pub(crate) use timeout::GRPC_TIMEOUT_HEADER;

/// An ordered multimap of call metadata.
///
/// Backed by an [`http::HeaderMap`]; values appended under the same key are
/// read back in append order.
#[derive(Clone, Debug, Default)]
pub struct MetadataMap {
    headers: HeaderMap,
}

/// Error returned when inserting a key or value that is not valid metadata.
#[derive(Debug)]
pub struct InvalidMetadata {
    reason: &'static str,
}

impl fmt::Display for InvalidMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid metadata: {}", self.reason)
    }
}

impl std::error::Error for InvalidMetadata {}

impl InvalidMetadata {
    fn new(reason: &'static str) -> Self {
        InvalidMetadata { reason }
    }
}

/// Whether `key` is reserved for protocol use (`grpc-` or pseudo headers).
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with("grpc-") || key.starts_with(':')
}

fn is_bin_key(key: &str) -> bool {
    key.ends_with("-bin")
}

impl MetadataMap {
    /// Create an empty map.
    pub fn new() -> Self {
        MetadataMap {
            headers: HeaderMap::new(),
        }
    }

    /// Number of values stored in the map, counting duplicates.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Returns the first ASCII value associated with `key`, decoded to a
    /// string slice.
    pub fn get(&self, key: &str) -> Option<&str> {
        if is_bin_key(key) {
            return None;
        }
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    /// Returns every ASCII value associated with `key`, in append order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
    }

    /// Returns the first binary value for a `-bin` key, base64-decoded.
    pub fn get_bin(&self, key: &str) -> Option<Bytes> {
        if !is_bin_key(key) {
            return None;
        }
        self.headers
            .get(key)
            .and_then(|v| decode_bin_value(v.as_bytes()).ok())
            .map(Bytes::from)
    }

    /// Returns every binary value for a `-bin` key, in append order.
    pub fn get_bin_all<'a>(&'a self, key: &str) -> impl Iterator<Item = Bytes> + 'a {
        self.headers
            .get_all(key)
            .iter()
            .filter_map(|v| decode_bin_value(v.as_bytes()).ok())
            .map(Bytes::from)
    }

    /// Insert an ASCII value, replacing any previous values under `key`.
    ///
    /// Fails on reserved keys, `-bin` keys, and values outside visible
    /// ASCII + space.
    pub fn insert(&mut self, key: &str, value: &str) -> Result<(), InvalidMetadata> {
        let (name, value) = Self::ascii_pair(key, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Append an ASCII value, keeping previous values under `key`.
    pub fn append(&mut self, key: &str, value: &str) -> Result<(), InvalidMetadata> {
        let (name, value) = Self::ascii_pair(key, value)?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Insert a binary value under a `-bin` key, replacing previous values.
    pub fn insert_bin(&mut self, key: &str, value: &[u8]) -> Result<(), InvalidMetadata> {
        let (name, value) = Self::bin_pair(key, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Append a binary value under a `-bin` key.
    pub fn append_bin(&mut self, key: &str, value: &[u8]) -> Result<(), InvalidMetadata> {
        let (name, value) = Self::bin_pair(key, value)?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Remove all values under `key`.
    pub fn remove(&mut self, key: &str) {
        self.headers.remove(key);
    }

    /// Whether any value is present under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    /// Iterates over `(name, value-bytes)` pairs in map order. Binary values
    /// are yielded in their encoded (base64) form.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_bytes()))
    }

    /// Merge all entries of `other` into `self`, appending duplicates.
    pub fn merge(&mut self, other: MetadataMap) {
        // HeaderMap::extend replaces the first value for an existing key, so
        // walk entries and append to preserve multimap semantics.
        let mut last_name: Option<HeaderName> = None;
        for (name, value) in other.headers {
            let name = name.or_else(|| last_name.clone());
            if let Some(name) = name {
                last_name = Some(name.clone());
                self.headers.append(name, value);
            }
        }
    }

    /// Inserts a protocol-owned entry, bypassing the reserved-key check.
    pub(crate) fn insert_raw(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    /// Wraps a raw header map, as received from the wire.
    pub(crate) fn from_headers(headers: HeaderMap) -> Self {
        MetadataMap { headers }
    }

    pub(crate) fn into_headers(self) -> HeaderMap {
        self.headers
    }

    pub(crate) fn as_headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Converts into headers suitable for emission, dropping any entries
    /// that would collide with reserved protocol headers.
    pub(crate) fn into_sanitized_headers(mut self) -> HeaderMap {
        let reserved: Vec<HeaderName> = self
            .headers
            .keys()
            .filter(|name| is_reserved_key(name.as_str()))
            .cloned()
            .collect();
        for name in reserved {
            self.headers.remove(name);
        }
        self.headers
    }

    fn ascii_pair(key: &str, value: &str) -> Result<(HeaderName, HeaderValue), InvalidMetadata> {
        if is_reserved_key(key) {
            return Err(InvalidMetadata::new("reserved key"));
        }
        if is_bin_key(key) {
            return Err(InvalidMetadata::new("ascii value under -bin key"));
        }
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| InvalidMetadata::new("invalid key"))?;
        if name.as_str() != key {
            // HeaderName lowercases; metadata keys must already be lowercase.
            return Err(InvalidMetadata::new("key must be lowercase"));
        }
        let value =
            HeaderValue::from_str(value).map_err(|_| InvalidMetadata::new("invalid value"))?;
        Ok((name, value))
    }

    fn bin_pair(key: &str, value: &[u8]) -> Result<(HeaderName, HeaderValue), InvalidMetadata> {
        if is_reserved_key(key) {
            return Err(InvalidMetadata::new("reserved key"));
        }
        if !is_bin_key(key) {
            return Err(InvalidMetadata::new("binary value under non -bin key"));
        }
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| InvalidMetadata::new("invalid key"))?;
        if name.as_str() != key {
            return Err(InvalidMetadata::new("key must be lowercase"));
        }
        let value = HeaderValue::from_maybe_shared(encode_bin_value(value))
            .map_err(|_| InvalidMetadata::new("invalid value"))?;
        Ok((name, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_order_is_preserved() {
        let mut map = MetadataMap::new();
        map.append("x-trace", "a").unwrap();
        map.append("x-trace", "b").unwrap();
        map.append("x-trace", "c").unwrap();
        let values: Vec<_> = map.get_all("x-trace").collect();
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let mut map = MetadataMap::new();
        assert!(map.insert("grpc-timeout", "1S").is_err());
        assert!(map.insert(":authority", "example.com").is_err());
        assert!(map.insert_bin("grpc-status-details-bin", b"x").is_err());
    }

    #[test]
    fn binary_values_round_trip_through_base64() {
        let mut map = MetadataMap::new();
        let payload = [0u8, 1, 2, 254, 255];
        map.insert_bin("token-bin", &payload).unwrap();

        // On the wire the value is valid base64 ASCII.
        let (_, wire) = map.iter().next().unwrap();
        assert!(wire.iter().all(|b| b.is_ascii()));

        assert_eq!(map.get_bin("token-bin").unwrap(), &payload[..]);
    }

    #[test]
    fn bin_suffix_is_enforced() {
        let mut map = MetadataMap::new();
        assert!(map.insert_bin("token", b"abc").is_err());
        assert!(map.insert("token-bin", "abc").is_err());
    }

    #[test]
    fn merge_appends_duplicates() {
        let mut a = MetadataMap::new();
        a.append("k", "1").unwrap();
        let mut b = MetadataMap::new();
        b.append("k", "2").unwrap();
        b.append("other", "x").unwrap();
        a.merge(b);
        let values: Vec<_> = a.get_all("k").collect();
        assert_eq!(values, vec!["1", "2"]);
        assert_eq!(a.get("other"), Some("x"));
    }

    #[test]
    fn uppercase_keys_are_rejected() {
        let mut map = MetadataMap::new();
        assert!(map.insert("X-Trace", "a").is_err());
    }
}
