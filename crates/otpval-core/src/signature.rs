//! Request/response signing.
//!
//! Both directions use the same scheme: sort all parameters except the
//! signature field itself by name, join as `name=value` pairs with `&`,
//! HMAC-SHA1 the result with the client's shared secret, and base64 the
//! digest. Verification is exact string comparison of the supplied and
//! recomputed signatures.

use crate::clients::ClientTable;
use crate::params::ParamMap;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Name of the signature parameter, excluded from canonicalization.
pub const SIGNATURE_PARAM: &str = "h";

/// Responses for unknown clients are still signed, with this fixed key, so
/// the wire shape cannot be used to enumerate registered client ids.
pub const NULL_KEY: &[u8] = &[0];

/// Canonical signing input: sorted `name=value` pairs joined with `&`,
/// the `h` field excluded.
pub fn canonicalize(params: &ParamMap) -> String {
    params
        .sorted_pairs()
        .filter(|(name, _)| *name != SIGNATURE_PARAM)
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Compute the base64 HMAC-SHA1 signature over the canonical form.
pub fn sign(params: &ParamMap, key: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac key");
    mac.update(canonicalize(params).as_bytes());
    general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Outcome of inbound signature verification.
///
/// `UnknownClient`, `MissingSignature` and `BadSignature` are all
/// rejections, but they are logged distinctly; only the first falls back to
/// the null key when the response is signed.
#[derive(Debug)]
pub enum SignatureCheck {
    /// Request carried no client id; signing is not applicable.
    NotApplicable,
    Valid {
        client_id: u64,
        key: Vec<u8>,
    },
    /// Client id resolves to a secret but no `h` parameter was supplied.
    MissingSignature {
        client_id: u64,
        key: Vec<u8>,
    },
    BadSignature {
        client_id: u64,
        key: Vec<u8>,
    },
    /// Client id absent from the table (or not numeric at all).
    UnknownClient,
}

impl SignatureCheck {
    /// The key to sign the response with.
    pub fn response_key(&self) -> Option<&[u8]> {
        match self {
            SignatureCheck::NotApplicable => None,
            SignatureCheck::Valid { key, .. }
            | SignatureCheck::MissingSignature { key, .. }
            | SignatureCheck::BadSignature { key, .. } => Some(key),
            SignatureCheck::UnknownClient => Some(NULL_KEY),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(
            self,
            SignatureCheck::Valid { .. } | SignatureCheck::NotApplicable
        )
    }
}

/// Verify the signature of an inbound request against the client table.
pub fn verify(params: &ParamMap, clients: &ClientTable) -> SignatureCheck {
    let Some(id_str) = params.first("id") else {
        return SignatureCheck::NotApplicable;
    };
    let Ok(client_id) = id_str.parse::<u64>() else {
        tracing::info!(id = id_str, "non-numerical client id in request");
        return SignatureCheck::UnknownClient;
    };
    let Some(key) = clients.lookup(client_id) else {
        tracing::info!(client_id, "unknown client id");
        return SignatureCheck::UnknownClient;
    };
    let key = key.to_vec();
    let Some(supplied) = params.first(SIGNATURE_PARAM) else {
        tracing::info!(client_id, "client id present but no signature in request");
        return SignatureCheck::MissingSignature { client_id, key };
    };
    let expected = sign(params, &key);
    if supplied == expected {
        SignatureCheck::Valid { client_id, key }
    } else {
        tracing::info!(client_id, supplied, expected, "bad request signature");
        SignatureCheck::BadSignature { client_id, key }
    }
}
