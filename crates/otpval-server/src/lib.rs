//! Credential validation service.
//!
//! Ties the validation engine, the replay-safe record store and the trust
//! device together behind a small HTTP GET interface. The binary in
//! `main.rs` is a thin CLI wrapper around [`dispatcher`] and [`http`].

pub mod dispatcher;
pub mod http;
