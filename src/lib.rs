//! Tributary - bulk record import pipeline
//!
//! Ingests batch JSON payloads and streamed CSV files into a SQLite store,
//! then drains the stored records through a rate-limited downstream call.
//! It exposes all modules for testing purposes.

pub mod entities;
pub mod errors;
pub mod ingest;
pub mod normalizer;
pub mod pipeline;
pub mod processor;
pub mod rate_limiter;
pub mod settings;
pub mod source;
pub mod storage;
pub mod web;
