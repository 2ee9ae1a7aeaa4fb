//! Lexical validation of inbound tokens.
//!
//! Event OTPs use the fixed modhex alphabet; OATH tokens are a modhex
//! public identity followed by a 6-8 digit code. These checks gate every
//! request before anything touches the device or the store.

/// The modhex alphabet used by event-OTP tokens and public identities.
const MODHEX: &str = "cbdefghijklnrtuv";

fn is_modhex(c: char) -> bool {
    MODHEX.contains(c)
}

/// An event OTP: 32-48 modhex characters.
pub fn event_otp_valid(s: &str) -> bool {
    (32..=48).contains(&s.len()) && s.chars().all(is_modhex)
}

/// An OATH token: 6-20 characters drawn from modhex plus digits.
pub fn oath_token_valid(s: &str) -> bool {
    (6..=20).contains(&s.len()) && s.chars().all(|c| is_modhex(c) || c.is_ascii_digit())
}

/// A client nonce: 16-40 characters.
pub fn nonce_valid(s: &str) -> bool {
    (16..=40).contains(&s.len())
}

/// Split an OATH token into its modhex identity prefix and numeric code.
///
/// The code is the first 6-8 digit run following the prefix; anything after
/// it is ignored. Returns `(identity, code, digit_count)`.
pub fn split_oath_token(token: &str) -> Option<(&str, u32, usize)> {
    let prefix_len = token.chars().take_while(|c| is_modhex(*c)).count();
    let (uid, rest) = token.split_at(prefix_len);
    let digit_run = rest.chars().take_while(char::is_ascii_digit).count();
    if digit_run < 6 {
        return None;
    }
    let digits = digit_run.min(8);
    let code: u32 = rest[..digits].parse().ok()?;
    Some((uid, code, digits))
}

/// Parse a key handle: plain decimal or `0x`-prefixed hex.
pub fn parse_key_handle(s: &str) -> Option<u32> {
    if let Some(hex_part) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex_part, 16).ok()
    } else {
        s.parse().ok()
    }
}
