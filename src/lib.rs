// src/lib.rs
//! # Wallet-auth gateway
//!
//! Authenticates wallets by signed challenge, verifies credential presentations,
//! and runs the credential lifecycle (issuance, guardian transfer, profile sync)
//! on a durable retrying job queue.
//!
//! ## Architecture Overview
//! 1. **Cryptography**: signature recovery (`utils::crypto`) and the compact token codec (`credential`)
//! 2. **Authentication**: challenge store, presentation checks and access tokens (`auth`)
//! 3. **Upstreams**: ledger RPC and backend HTTP adapters (`blockchain`, `clients`), classified by `errors`
//! 4. **Jobs**: SQLite-backed queue with a worker pool (`storage`, `queue`)
//! 5. **Services**: credential issuer, verifier and the HTTP API (`services`)

pub mod auth;
pub mod blockchain;
pub mod clients;
pub mod config;
pub mod credential;
pub mod error;
pub mod errors;
pub mod models;
pub mod queue;
pub mod services;
pub mod storage;
pub mod utils;
pub mod wallet;
