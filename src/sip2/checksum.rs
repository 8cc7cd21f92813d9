//! SIP2 frame checksum codec.
//!
//! A frame trailer is `AY<d>AZ<HHHH>\r`: one sequence digit and the 16-bit
//! checksum rendered as four uppercase hex digits. The checksum is the
//! two's complement of the byte sum of everything up to and including `AZ`.

use crate::error::{Result, Sip2Error};

/// Compute the SIP2 checksum over a message prefix.
///
/// Wire bytes are summed as unsigned integers and the sum negated modulo
/// 65536. Inbound frames are decoded as ISO-8859-1, where every char's
/// code point equals its wire byte, so summing code points reproduces the
/// byte sum the LMS computed.
pub fn compute(body: &str) -> u16 {
    let sum = body.chars().fold(0u16, |acc, c| acc.wrapping_add(c as u16));
    sum.wrapping_neg()
}

/// Append the `AY<seq>AZ<checksum>\r` trailer to an outbound frame body.
pub fn append(body: &str, seq: u8) -> Result<String> {
    if seq > 9 {
        return Err(Sip2Error::InvalidSequence(seq));
    }
    let mut frame = format!("{}AY{}AZ", body, seq);
    let checksum = compute(&frame);
    frame.push_str(&format!("{:04X}", checksum));
    frame.push('\r');
    Ok(frame)
}

/// Verify the checksum trailer of an inbound frame.
///
/// Returns `Ok(false)` when the trailer parses but the hex digits disagree
/// with the recomputed checksum, and `MalformedTrailer` when the frame does
/// not end in `AZ<hex4>` at all. Hex comparison is case-insensitive; some
/// legacy systems emit lowercase.
pub fn verify(frame: &str) -> Result<bool> {
    let frame = frame.strip_suffix('\r').unwrap_or(frame);
    let chars: Vec<char> = frame.chars().collect();
    if chars.len() < 6 {
        return Err(Sip2Error::MalformedTrailer);
    }
    let split = chars.len() - 4;
    let hex: String = chars[split..].iter().collect();
    if chars[split - 2] != 'A'
        || chars[split - 1] != 'Z'
        || !hex.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(Sip2Error::MalformedTrailer);
    }
    let prefix: String = chars[..split].iter().collect();
    let expected = format!("{:04X}", compute(&prefix));
    Ok(expected.eq_ignore_ascii_case(&hex))
}
