// src/auth/mod.rs
//! Wallet login: challenges, presentations and access tokens.

pub mod challenge_store;
pub mod protocol;
pub mod session;
