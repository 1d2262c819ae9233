//! Durable record store backed by SQLite
//!
//! The pipeline's "global" state lives here as explicit records with lease
//! fields rather than in process memory, so a kill mid-upload resumes
//! correctly on restart.

pub mod connection;
pub mod migrations;
pub mod records;

pub use connection::Storage;
