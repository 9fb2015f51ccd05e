// src/models/mod.rs
pub mod credential;
pub mod did;
pub mod job;
pub mod response;
