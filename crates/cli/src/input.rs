//! Parsing of byte lines typed on stdin

use anyhow::{Result, anyhow};

/// Parse a line such as `1 0 1 0` or `0x01,0x00` into bytes
///
/// Tokens are separated by whitespace and/or commas. Each is decimal, or hex
/// with a `0x` prefix. A blank line yields no bytes.
pub fn parse_bytes(line: &str) -> Result<Vec<u8>> {
    line.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .map(parse_byte)
        .collect()
}

fn parse_byte(token: &str) -> Result<u8> {
    let parsed = match token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => token.parse::<u8>(),
    };
    parsed.map_err(|_| anyhow!("'{}' is not a byte (0-255 or 0x00-0xff)", token))
}
