//! Conversions between the chain's `0x`-prefixed hexadecimal wire encoding
//! and the store's raw-byte / decimal-string encoding.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("hex string must start with 0x")]
    MissingPrefix,
    #[error("invalid hex body: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid number: {0}")]
    Number(#[from] std::num::ParseIntError),
}

fn hex_body(s: &str) -> Result<&str, CodecError> {
    s.strip_prefix("0x").ok_or(CodecError::MissingPrefix)
}

pub fn hex_to_bytes(s: &str) -> Result<Vec<u8>, CodecError> {
    Ok(hex::decode(hex_body(s)?)?)
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Numbers are carried as decimal text on the store side so that values past
/// the signed 64-bit range survive every SQL backend. 128 bits is enough for
/// everything this chain produces.
pub fn hex_to_decimal(s: &str) -> Result<String, CodecError> {
    let value = u128::from_str_radix(hex_body(s)?, 16)?;
    Ok(value.to_string())
}

pub fn decimal_to_hex(s: &str) -> Result<String, CodecError> {
    let value: u128 = s.parse()?;
    Ok(format!("0x{:x}", value))
}

/// Zero-pads the hex body on the left until it is `width` characters long.
/// Bodies already at or past `width` are returned unchanged.
pub fn left_pad_hex(s: &str, width: usize) -> Result<String, CodecError> {
    let body = hex_body(s)?;
    if body.len() >= width {
        return Ok(format!("0x{}", body));
    }
    Ok(format!("0x{}{}", "0".repeat(width - body.len()), body))
}

/// Reads the first 16 bytes of `data` as a little-endian u128, zero-padding
/// on the right when fewer than 16 bytes are present.
pub fn data_le_to_u128(data: &[u8]) -> u128 {
    let mut raw = [0u8; 16];
    let take = data.len().min(16);
    raw[..take].copy_from_slice(&data[..take]);
    u128::from_le_bytes(raw)
}

/// The UDT amount convention: decimal rendering of the data prefix.
pub fn data_le_to_decimal(data: &[u8]) -> String {
    data_le_to_u128(data).to_string()
}
