// src/blockchain/mod.rs
pub mod ledger;
pub mod rpc_client;
