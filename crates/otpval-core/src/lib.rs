//! otpval-core — validation protocol engine for hardware-anchored OTPs
//!
//! The cryptographic secrets behind every credential live inside a trust
//! device and never reach this code; the engine's job is everything around
//! that fact:
//!
//! - `params`    — query parsing and one-shot mode classification
//! - `lexical`   — token alphabets and length bounds
//! - `signature` — request/response HMAC-SHA1 authentication
//! - `response`  — ordered-field response builder (canonical sort + sign)
//! - `clients`   — immutable client id → shared secret table
//! - `device`    — trust-device gateway trait, exclusive handle, soft device
//! - `search`    — bounded HOTP/TOTP candidate search
//! - `error`     — rejection taxonomy

pub mod clients;
pub mod device;
pub mod error;
pub mod lexical;
pub mod params;
pub mod response;
pub mod search;
pub mod signature;

pub use error::ValidationError;
