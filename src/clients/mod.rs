// src/clients/mod.rs
//! HTTP adapters for off-chain collaborators.

pub mod backend;
pub mod http;
