//! otpval-store — replay-safe persistent counter store.
//!
//! SQLite-backed record store for enrolled OATH identities. The strict
//! counter-increase rule lives in a single conditional UPDATE, which is the
//! sole replay-prevention mechanism for host-validated credentials.

pub mod db;
pub mod error;

pub use db::{OathRecord, OathStore};
pub use error::StoreError;
