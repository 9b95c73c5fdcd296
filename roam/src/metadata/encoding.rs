use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::{DecodePaddingMode, Engine};
use bytes::Bytes;

/// Base64 engine for `-bin` metadata values: padding is omitted on encode
/// and accepted either way on decode, per the wire contract.
const BIN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub(crate) fn encode_bin_value(value: &[u8]) -> Bytes {
    Bytes::from(BIN_ENGINE.encode(value))
}

pub(crate) fn decode_bin_value(value: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
    BIN_ENGINE.decode(value)
}
