//! ASCII hex codec with the XOR block checksum used by every write command.
//!
//! A block on the wire is the payload bytes followed by one checksum byte
//! chosen so that the XOR of everything decoded is zero.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HexError {
    #[error("empty")]
    Empty,
    #[error("odd length")]
    OddLength,
    #[error("invalid digit")]
    InvalidDigit,
    #[error("checksum mismatch")]
    Checksum,
    #[error("too long")]
    TooLong,
}

impl From<hex::FromHexError> for HexError {
    fn from(e: hex::FromHexError) -> Self {
        match e {
            hex::FromHexError::InvalidHexCharacter { .. } => HexError::InvalidDigit,
            hex::FromHexError::OddLength => HexError::OddLength,
            hex::FromHexError::InvalidStringLength => HexError::TooLong,
        }
    }
}

/// Value of a single hex digit, either case.
pub fn decode_digit(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

/// Decode one byte from a pair of digits, high nibble first.
pub fn decode_byte(pair: &[u8]) -> Result<u8, HexError> {
    if pair.len() != 2 {
        return Err(HexError::OddLength);
    }
    let mut out = [0u8; 1];
    hex::decode_to_slice(pair, &mut out)?;
    Ok(out[0])
}

/// Parse a hex number of one to `max_digits` digits.
pub fn parse_number(token: &[u8], max_digits: usize) -> Result<u32, HexError> {
    if token.is_empty() {
        return Err(HexError::Empty);
    }
    if token.len() > max_digits {
        return Err(HexError::TooLong);
    }
    token.iter().try_fold(0u32, |acc, &ch| {
        let nibble = decode_digit(ch).ok_or(HexError::InvalidDigit)?;
        Ok((acc << 4) | nibble as u32)
    })
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |crc, b| crc ^ b)
}

/// Decode a checksummed block into `out`.
///
/// Returns the number of payload bytes supplied; the remainder of `out` is
/// filled with `0xFF`. On any error `out` is left untouched.
pub fn decode_block(ascii: &[u8], out: &mut [u8]) -> Result<usize, HexError> {
    if ascii.is_empty() {
        return Err(HexError::Empty);
    }
    if ascii.len() % 2 != 0 {
        return Err(HexError::OddLength);
    }

    // Validate the whole block before touching the caller's buffer
    let mut crc = 0u8;
    for pair in ascii.chunks(2) {
        crc ^= decode_byte(pair)?;
    }
    let count = ascii.len() / 2 - 1;
    if count > out.len() {
        return Err(HexError::TooLong);
    }
    if crc != 0 {
        return Err(HexError::Checksum);
    }

    hex::decode_to_slice(&ascii[..count * 2], &mut out[..count])?;
    for b in out[count..].iter_mut() {
        *b = 0xFF;
    }

    Ok(count)
}

const DIGITS: &[u8; 16] = b"0123456789abcdef";

pub fn encode_byte(b: u8) -> [u8; 2] {
    [DIGITS[(b >> 4) as usize], DIGITS[(b & 0x0f) as usize]]
}

/// Encode `data` followed by its checksum, returning the number of ASCII
/// bytes written.
pub fn encode_block(data: &[u8], out: &mut [u8]) -> Result<usize, HexError> {
    let len = (data.len() + 1) * 2;
    if out.len() < len {
        return Err(HexError::TooLong);
    }
    hex::encode_to_slice(data, &mut out[..data.len() * 2])?;
    out[data.len() * 2..len].copy_from_slice(&encode_byte(checksum(data)));
    Ok(len)
}
