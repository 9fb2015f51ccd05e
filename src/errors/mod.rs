// src/errors/mod.rs
pub mod classifier;
