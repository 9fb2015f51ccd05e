// src/storage/mod.rs
//! SQLite persistence for jobs and issued credentials.

pub mod credential_store;
pub mod database;
pub mod job_store;
