//! Ordered-field response builder.
//!
//! Keeps response serialization and signing in one place: fields are always
//! rendered in sorted order, and the signature (when requested) is computed
//! over exactly the canonical form that [`crate::signature`] verifies.

use crate::params::ParamMap;
use crate::signature;
use std::collections::BTreeMap;

/// Single-line success response.
pub fn ok_line(body: &str) -> String {
    format!("OK {body}")
}

/// Single-line rejection response.
pub fn err_line(reason: &str) -> String {
    format!("ERR {reason}")
}

/// Builder for signed multi-field responses (event-OTP 2.0 style).
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    fields: BTreeMap<String, String>,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Sign the current field set and append the signature as `h`.
    ///
    /// Must be called after the last `set`; the signature covers every field
    /// present at the time of signing.
    pub fn sign_with(&mut self, key: &[u8]) -> &mut Self {
        let params = ParamMap::from_pairs(self.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        let sig = signature::sign(&params, key);
        self.fields.insert(signature::SIGNATURE_PARAM.into(), sig);
        self
    }

    /// Render as newline-joined `name=value` pairs in sorted order.
    pub fn render(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The field names in render order, independent of values. Used to check
    /// that differently-keyed rejections stay shape-identical on the wire.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }
}
