//! Core data models for the block archiver.
//!
//! Ledger-side entities (blocks, snapshots) and their binary encodings, plus
//! the object-store entities they are archived as.

pub mod block;
pub mod codec;
pub mod index_file;
pub mod object;
pub mod snapshot;
