// src/credential/mod.rs
//! Credential tokens, holder attestations and presentations.

pub mod attestation;
pub mod codec;
pub mod presentation;
