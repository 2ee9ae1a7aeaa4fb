//! Query parameter handling and one-shot request classification.
//!
//! The inbound query string is parsed once into an ordered multi-value map
//! and resolved into a closed set of validation modes at ingress, so the
//! rest of the engine pattern-matches over [`ValidationMode`] instead of
//! re-inspecting raw parameters.

use crate::error::ValidationError;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Ordered multi-value parameter map built from a raw query string.
///
/// Keys iterate in sorted order, which is what signature canonicalization
/// relies on.
#[derive(Debug, Clone, Default)]
pub struct ParamMap {
    raw: String,
    inner: BTreeMap<String, Vec<String>>,
}

impl ParamMap {
    /// Parse a query string (`a=1&b=2&b=3`) into a map.
    ///
    /// `+` is treated as a space and percent sequences are decoded; a pair
    /// without `=` becomes a key with an empty value, matching common
    /// query-string semantics.
    pub fn parse(query: &str) -> Self {
        let mut inner: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pair in query.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (name, value) = match pair.split_once('=') {
                Some((n, v)) => (n, v),
                None => (pair, ""),
            };
            let name = decode_component(name);
            let value = decode_component(value);
            inner.entry(name).or_default().push(value);
        }
        Self {
            raw: query.to_string(),
            inner,
        }
    }

    /// Build a map from explicit pairs (used by response signing and tests).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut inner: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (k, v) in pairs {
            inner.entry(k.into()).or_default().push(v.into());
        }
        Self {
            raw: String::new(),
            inner,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// First value for `name`, if present.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.inner
            .get(name)
            .and_then(|vals| vals.first())
            .map(String::as_str)
    }

    /// Iterate `(name, joined-values)` in sorted key order.
    ///
    /// Repeated parameters are concatenated, the same way the signature
    /// scheme treats them on both ends of the wire.
    pub fn sorted_pairs(&self) -> impl Iterator<Item = (&str, String)> {
        self.inner
            .iter()
            .map(|(k, vals)| (k.as_str(), vals.concat()))
    }

    /// The query string this map was parsed from (empty for built maps).
    pub fn raw_query(&self) -> &str {
        &self.raw
    }
}

fn decode_component(s: &str) -> String {
    let plus_decoded: Cow<'_, str> = if s.contains('+') {
        Cow::Owned(s.replace('+', " "))
    } else {
        Cow::Borrowed(s)
    };
    match urlencoding::decode(&plus_decoded) {
        Ok(decoded) => decoded.into_owned(),
        // Undecodable sequences are kept verbatim; they will simply fail
        // lexical validation downstream.
        Err(_) => plus_decoded.into_owned(),
    }
}

/// Which validation modes the operator has enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnabledModes {
    pub short_otp: bool,
    pub otp: bool,
    pub hotp: bool,
    pub totp: bool,
    pub pwhash: bool,
}

impl EnabledModes {
    pub fn any(&self) -> bool {
        self.short_otp || self.otp || self.hotp || self.totp || self.pwhash
    }
}

/// The closed set of validation modes, resolved once at ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Device-internal-DB event OTP, KSM-style single-line response.
    ShortEventOtp,
    /// Device-internal-DB event OTP, signed 2.0-style response.
    EventOtp,
    Hotp,
    Totp,
    PasswordHash,
}

impl ValidationMode {
    /// Human-readable mode name used in log lines.
    pub fn label(&self) -> &'static str {
        match self {
            ValidationMode::ShortEventOtp => "YubiKey OTP (short)",
            ValidationMode::EventOtp => "YubiKey OTP",
            ValidationMode::Hotp => "OATH-HOTP",
            ValidationMode::Totp => "OATH-TOTP",
            ValidationMode::PasswordHash => "Password hash",
        }
    }
}

/// A classified inbound request.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub mode: ValidationMode,
    pub params: ParamMap,
}

impl ValidationRequest {
    /// Resolve the mode from the parameter set and the enabled-mode policy.
    ///
    /// Exactly one of `otp`, `hotp`, `totp`, `pwhash` must be present.
    /// A present-but-disabled selector is rejected as `ModeDisabled` with
    /// the selector's name, so the dispatcher can answer
    /// `ERR '<selector>' disabled`.
    pub fn classify(params: ParamMap, modes: &EnabledModes) -> Result<Self, ValidationError> {
        const SELECTORS: [&str; 4] = ["otp", "hotp", "totp", "pwhash"];
        let mut present = SELECTORS.iter().filter(|s| params.contains(**s));
        let selector = match (present.next(), present.next()) {
            (Some(s), None) => *s,
            (None, _) => return Err(ValidationError::ModeDisabled("none")),
            (Some(_), Some(_)) => return Err(ValidationError::BadInput),
        };
        let mode = match selector {
            "otp" if modes.short_otp => ValidationMode::ShortEventOtp,
            "otp" if modes.otp => ValidationMode::EventOtp,
            "otp" => return Err(ValidationError::ModeDisabled("otp/otp2")),
            "hotp" if modes.hotp => ValidationMode::Hotp,
            "hotp" => return Err(ValidationError::ModeDisabled("hotp")),
            "totp" if modes.totp => ValidationMode::Totp,
            "totp" => return Err(ValidationError::ModeDisabled("totp")),
            "pwhash" if modes.pwhash => ValidationMode::PasswordHash,
            "pwhash" => return Err(ValidationError::ModeDisabled("pwhash")),
            _ => unreachable!(),
        };
        Ok(Self { mode, params })
    }
}
