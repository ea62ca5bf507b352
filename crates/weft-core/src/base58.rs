//! Base58 (Bitcoin alphabet) encoding for identifier rendering.
//!
//! All binary material that crosses the JSON wire (ids, keys, signatures,
//! ciphertexts) is rendered as a `z`-prefixed base58 string.

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Encode bytes as base58.
pub fn encode(input: &[u8]) -> String {
    let zeros = input.iter().take_while(|b| **b == 0).count();

    // Base conversion over a big-endian digit accumulator.
    let mut digits: Vec<u8> = Vec::with_capacity(input.len() * 138 / 100 + 1);
    for &byte in input {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }

    let mut out = String::with_capacity(zeros + digits.len());
    for _ in 0..zeros {
        out.push('1');
    }
    for &digit in digits.iter().rev() {
        out.push(ALPHABET[digit as usize] as char);
    }
    out
}

/// Decode a base58 string back into bytes.
pub fn decode(input: &str) -> Result<Vec<u8>, Base58Error> {
    let zeros = input.bytes().take_while(|b| *b == b'1').count();

    let mut bytes: Vec<u8> = Vec::with_capacity(input.len());
    for c in input.bytes() {
        let value = ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or(Base58Error::InvalidCharacter(c as char))? as u32;

        let mut carry = value;
        for byte in bytes.iter_mut() {
            carry += (*byte as u32) * 58;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }

    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    Ok(out)
}

/// Render bytes as `<prefix>_z<base58>`.
pub fn encode_z(prefix: &str, bytes: &[u8]) -> String {
    format!("{}_z{}", prefix, encode(bytes))
}

/// Parse a `<prefix>_z<base58>` string, checking the prefix.
pub fn decode_z(prefix: &str, s: &str) -> Result<Vec<u8>, Base58Error> {
    let rest = s
        .strip_prefix(prefix)
        .and_then(|r| r.strip_prefix("_z"))
        .ok_or_else(|| Base58Error::WrongPrefix {
            expected: prefix.to_string(),
            got: s.to_string(),
        })?;
    decode(rest)
}

/// Errors from base58 decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Base58Error {
    #[error("invalid base58 character: {0:?}")]
    InvalidCharacter(char),

    #[error("expected prefix {expected}_z..., got {got}")]
    WrongPrefix { expected: String, got: String },

    #[error("decoded length {got} does not match expected {expected}")]
    WrongLength { expected: usize, got: usize },
}

/// Decode into a fixed-size array, checking the length.
pub fn decode_z_array<const N: usize>(prefix: &str, s: &str) -> Result<[u8; N], Base58Error> {
    let bytes = decode_z(prefix, s)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| Base58Error::WrongLength { expected: N, got: len })
}
